// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use poem::web::Json;
use poem::{get, handler, Route};
use serde::Serialize;

#[derive(Serialize)]
struct HealthcheckResponse {
    status: &'static str,
    version: &'static str,
}

#[handler]
fn healthcheck() -> Json<HealthcheckResponse> {
    Json(HealthcheckResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn routes() -> Route {
    Route::new().at("/", get(healthcheck))
}
