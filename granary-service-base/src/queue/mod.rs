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

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use granary_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
    #[error("Queue error: {0}")]
    Internal(String),
}

impl SafeDisplay for QueueError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum QueueName {
    HighPriority,
    OrgSync,
    Default,
}

pub const PRIORITY_URGENT: u8 = 9;
pub const PRIORITY_NORMAL: u8 = 5;
pub const PRIORITY_LOW: u8 = 0;

/// The logical message contract of the worker runtime. The wire encoding is
/// whatever the transport picks; consumers only see this struct.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub name: String,
    pub args: serde_json::Value,
    pub queue: QueueName,
    pub priority: u8,
    /// Delay before the message becomes available for delivery.
    #[serde(with = "humantime_serde")]
    pub countdown: Duration,
    /// Delivery attempt, bumped by the worker when it re-enqueues a failed
    /// task.
    #[serde(default)]
    pub attempt: u32,
}

impl TaskMessage {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            args,
            queue: QueueName::Default,
            priority: PRIORITY_NORMAL,
            countdown: Duration::ZERO,
            attempt: 0,
        }
    }

    pub fn on_queue(mut self, queue: QueueName) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = countdown;
        self
    }
}

/// Message transport between dispatchers and workers. Delivery is
/// at-least-once; task bodies are idempotent.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, message: TaskMessage) -> Result<(), QueueError>;

    /// Takes the next available message from the given queues, preferring
    /// earlier queues and higher priorities. Waits up to `wait` before
    /// returning `None`.
    async fn dequeue(
        &self,
        queues: &[QueueName],
        wait: Duration,
    ) -> Result<Option<TaskMessage>, QueueError>;
}
