//! Per-channel staging buffers.
//!
//! Each channel owns its own lock, so appends on one channel never wait on a
//! drain of another. A drain swaps the buffer out wholesale: events appended
//! afterwards land in a fresh generation and are picked up by the next flush.

use crate::channel::{Channel, ChannelBinding};
use crate::event::BufferedEvent;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// The ordered buffer of one channel.
#[derive(Debug)]
pub struct ChannelBuffer {
    channel: Channel,
    table: String,
    events: Mutex<Vec<BufferedEvent>>,
}

impl ChannelBuffer {
    /// Creates an empty buffer for `binding`.
    pub fn new(binding: &ChannelBinding) -> Self {
        Self {
            channel: binding.channel.clone(),
            table: binding.table.clone(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// The channel this buffer stages.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The analytical table the channel feeds.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Appends an event at the tail.
    pub async fn append(&self, event: BufferedEvent) {
        self.events.lock().await.push(event);
    }

    /// Removes and returns every buffered event, in receipt order.
    pub async fn drain(&self) -> Vec<BufferedEvent> {
        std::mem::take(&mut *self.events.lock().await)
    }

    /// Number of events currently buffered.
    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    /// Whether the buffer is empty.
    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

/// The fixed set of channel buffers owned by one service instance.
#[derive(Debug)]
pub struct ChannelBuffers {
    buffers: BTreeMap<Channel, ChannelBuffer>,
}

impl ChannelBuffers {
    /// Creates one empty buffer per binding.
    pub fn new<'a>(bindings: impl IntoIterator<Item = &'a ChannelBinding>) -> Self {
        Self {
            buffers: bindings
                .into_iter()
                .map(|binding| (binding.channel.clone(), ChannelBuffer::new(binding)))
                .collect(),
        }
    }

    /// The buffer for `channel`, if it is bound.
    pub fn get(&self, channel: &str) -> Option<&ChannelBuffer> {
        self.buffers.get(channel)
    }

    /// Iterates over all buffers in channel order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelBuffer> {
        self.buffers.values()
    }

    /// The bound channels.
    pub fn channels(&self) -> Vec<Channel> {
        self.buffers.keys().cloned().collect()
    }

    /// Combined number of events buffered across all channels.
    pub async fn total_len(&self) -> usize {
        let mut total = 0;
        for buffer in self.buffers.values() {
            total += buffer.len().await;
        }
        total
    }

    /// Number of events buffered per channel.
    pub async fn lens(&self) -> BTreeMap<Channel, usize> {
        let mut lens = BTreeMap::new();
        for (channel, buffer) in &self.buffers {
            lens.insert(channel.clone(), buffer.len().await);
        }
        lens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn event(channel: &str, id: usize) -> BufferedEvent {
        BufferedEvent::new(Channel::new(channel), id.to_string(), Map::new())
    }

    fn buffers() -> ChannelBuffers {
        ChannelBuffers::new(&[
            ChannelBinding::new("issue_changes", "issues"),
            ChannelBinding::new("comment_changes", "comments"),
        ])
    }

    #[tokio::test]
    async fn drain_returns_events_in_receipt_order() {
        let buffers = buffers();
        let buffer = buffers.get("issue_changes").unwrap();

        for id in 0..25 {
            buffer.append(event("issue_changes", id)).await;
        }

        let drained = buffer.drain().await;
        let ids: Vec<String> = drained.iter().map(|e| e.id.clone()).collect();
        let expected: Vec<String> = (0..25).map(|id| id.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn second_drain_without_appends_is_empty() {
        let buffers = buffers();
        let buffer = buffers.get("issue_changes").unwrap();
        buffer.append(event("issue_changes", 1)).await;

        assert_eq!(buffer.drain().await.len(), 1);
        assert!(buffer.drain().await.is_empty());
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn appends_after_a_drain_start_a_new_generation() {
        let buffers = buffers();
        let buffer = buffers.get("issue_changes").unwrap();
        buffer.append(event("issue_changes", 1)).await;

        let first = buffer.drain().await;
        buffer.append(event("issue_changes", 2)).await;
        let second = buffer.drain().await;

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "2");
    }

    #[tokio::test]
    async fn totals_span_all_channels() {
        let buffers = buffers();
        buffers
            .get("issue_changes")
            .unwrap()
            .append(event("issue_changes", 1))
            .await;
        buffers
            .get("comment_changes")
            .unwrap()
            .append(event("comment_changes", 2))
            .await;
        buffers
            .get("comment_changes")
            .unwrap()
            .append(event("comment_changes", 3))
            .await;

        assert_eq!(buffers.total_len().await, 3);
        let lens = buffers.lens().await;
        assert_eq!(lens.get("issue_changes"), Some(&1));
        assert_eq!(lens.get("comment_changes"), Some(&2));
    }

    #[tokio::test]
    async fn unknown_channels_have_no_buffer() {
        let buffers = buffers();
        assert!(buffers.get("billing_changes").is_none());
        assert_eq!(buffers.get("issue_changes").unwrap().table(), "issues");
        assert_eq!(buffers.channels().len(), 2);
    }
}
