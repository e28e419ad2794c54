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

use super::{QueueError, QueueName, TaskMessage, TaskQueue};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct ReadyMessage {
    message: TaskMessage,
    seq: u64,
}

impl PartialEq for ReadyMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ReadyMessage {}

impl PartialOrd for ReadyMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyMessage {
    // Max-heap: higher priority wins, FIFO within a priority.
    fn cmp(&self, other: &Self) -> Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct DelayedMessage {
    message: TaskMessage,
    due_at: Instant,
    seq: u64,
}

impl PartialEq for DelayedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for DelayedMessage {}

impl PartialOrd for DelayedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedMessage {
    // Max-heap turned into earliest-due-first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    ready: HashMap<QueueName, BinaryHeap<ReadyMessage>>,
    delayed: BinaryHeap<DelayedMessage>,
    seq: u64,
}

impl Inner {
    fn promote_due(&mut self, now: Instant) {
        while matches!(self.delayed.peek(), Some(head) if head.due_at <= now) {
            let head = self.delayed.pop().expect("peeked head exists");
            let seq = head.seq;
            self.ready.entry(head.message.queue).or_default().push(ReadyMessage {
                message: head.message,
                seq,
            });
        }
    }

    fn pop(&mut self, queues: &[QueueName]) -> Option<TaskMessage> {
        for queue in queues {
            if let Some(heap) = self.ready.get_mut(queue) {
                if let Some(ready) = heap.pop() {
                    return Some(ready.message);
                }
            }
        }
        None
    }

    fn next_due_in(&self, now: Instant) -> Option<Duration> {
        self.delayed
            .peek()
            .map(|head| head.due_at.saturating_duration_since(now))
    }
}

/// In-memory task queue used by tests and single-process local runs. Honors
/// the same delivery contract as the Redis transport: priority order within
/// a queue, queue order as given by the consumer, countdowns respected.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of immediately deliverable messages on a queue.
    pub fn ready_len(&self, queue: QueueName) -> usize {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.promote_due(Instant::now());
        inner.ready.get(&queue).map(|heap| heap.len()).unwrap_or(0)
    }

    /// Number of messages still waiting on their countdown.
    pub fn delayed_len(&self) -> usize {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.promote_due(Instant::now());
        inner.delayed.len()
    }

    /// Test helper: drains every immediately deliverable message of a queue
    /// in delivery order.
    pub fn drain_ready(&self, queue: QueueName) -> Vec<TaskMessage> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.promote_due(Instant::now());
        let mut drained = Vec::new();
        while let Some(message) = inner.pop(&[queue]) {
            drained.push(message);
        }
        drained
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, message: TaskMessage) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock().expect("queue poisoned");
            inner.seq += 1;
            let seq = inner.seq;
            if message.countdown > Duration::ZERO {
                let due_at = Instant::now() + message.countdown;
                inner.delayed.push(DelayedMessage {
                    message,
                    due_at,
                    seq,
                });
            } else {
                inner
                    .ready
                    .entry(message.queue)
                    .or_default()
                    .push(ReadyMessage { message, seq });
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[QueueName],
        wait: Duration,
    ) -> Result<Option<TaskMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let (popped, next_due) = {
                let mut inner = self.inner.lock().expect("queue poisoned");
                let now = Instant::now();
                inner.promote_due(now);
                (inner.pop(queues), inner.next_due_in(now))
            };
            if let Some(message) = popped {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut sleep_for = deadline.saturating_duration_since(now);
            if let Some(next_due) = next_due {
                sleep_for = sleep_for.min(next_due);
            }
            // A notify can race with promotion; cap the wait so due delayed
            // messages are picked up without a wakeup.
            sleep_for = sleep_for.min(Duration::from_millis(50));
            let _ = tokio::time::timeout(sleep_for, self.notify.notified()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::queue::{PRIORITY_LOW, PRIORITY_NORMAL, PRIORITY_URGENT};
    use serde_json::json;

    fn message(name: &str, queue: QueueName, priority: u8) -> TaskMessage {
        TaskMessage::new(name, json!({}))
            .on_queue(queue)
            .with_priority(priority)
    }

    #[test]
    async fn priority_order_within_a_queue() {
        let queue = InMemoryTaskQueue::new();
        queue
            .enqueue(message("low", QueueName::Default, PRIORITY_LOW))
            .await
            .unwrap();
        queue
            .enqueue(message("urgent", QueueName::Default, PRIORITY_URGENT))
            .await
            .unwrap();
        queue
            .enqueue(message("normal", QueueName::Default, PRIORITY_NORMAL))
            .await
            .unwrap();

        let names: Vec<String> = queue
            .drain_ready(QueueName::Default)
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["urgent", "normal", "low"]);
    }

    #[test]
    async fn fifo_within_a_priority() {
        let queue = InMemoryTaskQueue::new();
        for i in 0..5 {
            queue
                .enqueue(message(&format!("m{i}"), QueueName::OrgSync, PRIORITY_NORMAL))
                .await
                .unwrap();
        }
        let names: Vec<String> = queue
            .drain_ready(QueueName::OrgSync)
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    async fn earlier_queues_win() {
        let queue = InMemoryTaskQueue::new();
        queue
            .enqueue(message("standard", QueueName::OrgSync, PRIORITY_URGENT))
            .await
            .unwrap();
        queue
            .enqueue(message("hp", QueueName::HighPriority, PRIORITY_LOW))
            .await
            .unwrap();

        let first = queue
            .dequeue(
                &[QueueName::HighPriority, QueueName::OrgSync],
                Duration::ZERO,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.name, "hp");
    }

    #[test]
    async fn countdown_defers_delivery() {
        let queue = InMemoryTaskQueue::new();
        queue
            .enqueue(
                message("later", QueueName::Default, PRIORITY_NORMAL)
                    .with_countdown(Duration::from_millis(60)),
            )
            .await
            .unwrap();

        assert_eq!(
            queue
                .dequeue(&[QueueName::Default], Duration::ZERO)
                .await
                .unwrap(),
            None
        );

        let delivered = queue
            .dequeue(&[QueueName::Default], Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.name, "later");
    }
}
