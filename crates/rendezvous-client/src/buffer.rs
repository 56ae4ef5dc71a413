//! Bounded, age-limited FIFO of outbound messages waiting for a usable channel.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::BufferConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(Uuid);

impl MessageId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub id: MessageId,
    pub payload: Bytes,
    pub enqueued_at: Instant,
    pub attempts: u32,
}

impl BufferedMessage {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

/// Result of [`MessageBuffer::add`].
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub id: MessageId,
    /// Oldest entry dropped to make room, if the buffer was full.
    pub evicted: Option<BufferedMessage>,
}

#[derive(Debug)]
pub struct MessageBuffer {
    entries: VecDeque<BufferedMessage>,
    max_size: usize,
    max_age: Duration,
}

impl MessageBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            entries: VecDeque::with_capacity(config.max_size.min(1024)),
            max_size: config.max_size,
            max_age: config.max_age,
        }
    }

    /// Appends `payload`, evicting the oldest entry first when full. A zero-capacity
    /// buffer holds nothing, so the new message is reported as its own eviction.
    pub fn add(&mut self, payload: Bytes) -> Enqueued {
        let message = BufferedMessage {
            id: MessageId::new(),
            payload,
            enqueued_at: Instant::now(),
            attempts: 0,
        };
        let id = message.id;

        if self.max_size == 0 {
            return Enqueued {
                id,
                evicted: Some(message),
            };
        }

        let evicted = if self.entries.len() >= self.max_size {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(message);
        Enqueued { id, evicted }
    }

    /// Entries younger than the configured max age, oldest first.
    pub fn get_valid(&self) -> Vec<BufferedMessage> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|message| message.age(now) < self.max_age)
            .cloned()
            .collect()
    }

    /// Removes and returns every entry that has reached the max age.
    pub fn get_expired(&mut self) -> Vec<BufferedMessage> {
        let now = Instant::now();
        let max_age = self.max_age;
        let mut expired = Vec::new();
        self.entries.retain(|message| {
            if message.age(now) >= max_age {
                expired.push(message.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Oldest entry that has not expired yet.
    pub fn front_valid(&self) -> Option<BufferedMessage> {
        let now = Instant::now();
        self.entries
            .iter()
            .find(|message| message.age(now) < self.max_age)
            .cloned()
    }

    pub fn remove(&mut self, id: MessageId) -> Option<BufferedMessage> {
        let index = self.entries.iter().position(|message| message.id == id)?;
        self.entries.remove(index)
    }

    pub fn record_attempt(&mut self, id: MessageId) {
        if let Some(message) = self.entries.iter_mut().find(|message| message.id == id) {
            message.attempts += 1;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.entries.iter().map(|message| message.id).collect()
    }
}
