use chrono::{DateTime, Local};
use rumqttc::{Publish, QoS};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// A message delivered by the broker, possibly one chunk of a larger payload
#[derive(Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    /// Offset of this chunk inside the full payload
    pub index: usize,
    /// Length of the full payload
    pub total: usize,
    pub received: DateTime<Local>,
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("topic", &self.topic)
            .field("len", &self.payload.len())
            .field("qos", &self.qos)
            .field("index", &self.index)
            .field("total", &self.total)
            .finish()
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = String::from_utf8_lossy(&self.payload).chars().take(40).collect();
        write!(
            f,
            "{} - {}: {}",
            self.received.format("%H:%M:%S%.3f"),
            self.topic,
            preview
        )
    }
}

impl InboundMessage {
    /// A message whose payload arrived in one piece
    pub fn whole(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        let payload = payload.into();
        let total = payload.len();
        InboundMessage {
            topic: topic.into(),
            payload,
            qos,
            dup: false,
            retain: false,
            index: 0,
            total,
            received: Local::now(),
        }
    }

    pub fn chunk(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        index: usize,
        total: usize,
    ) -> Self {
        InboundMessage {
            index,
            total,
            ..Self::whole(topic, payload, QoS::AtMostOnce)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.index == 0 && self.payload.len() == self.total
    }
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        let payload = publish.payload.to_vec();
        let total = payload.len();
        InboundMessage {
            topic: publish.topic,
            payload,
            qos: publish.qos,
            dup: publish.dup,
            retain: publish.retain,
            index: 0,
            total,
            received: Local::now(),
        }
    }
}

/// Topics with a reassembly in progress before the oldest one is dropped
pub const MAX_PENDING_TOPICS: usize = 16;

/// Collects chunked payloads per topic until they are complete
pub struct ChunkAssembler {
    pending: HashMap<String, InboundMessage>,
    max_payload_len: usize,
}

impl ChunkAssembler {
    pub fn new(max_payload_len: usize) -> Self {
        ChunkAssembler {
            pending: HashMap::new(),
            max_payload_len,
        }
    }

    /// Feeds one delivery; returns the full message once its last chunk arrived.
    pub fn push(&mut self, message: InboundMessage) -> Option<InboundMessage> {
        if message.total > self.max_payload_len {
            warn!(
                "Dropping message on {}: {} bytes exceeds limit of {}",
                message.topic, message.total, self.max_payload_len
            );
            self.pending.remove(&message.topic);
            return None;
        }

        if message.is_complete() {
            self.pending.remove(&message.topic);
            return Some(message);
        }

        if message.index == 0 && message.payload.len() > message.total {
            warn!(
                "Dropping message on {}: first chunk of {} bytes exceeds its total of {}",
                message.topic,
                message.payload.len(),
                message.total
            );
            self.pending.remove(&message.topic);
            return None;
        }

        if message.index == 0 {
            if !self.pending.contains_key(&message.topic) {
                self.make_room();
            }
            debug!(
                "Starting reassembly on {} ({} of {} bytes)",
                message.topic,
                message.payload.len(),
                message.total
            );
            self.pending.insert(message.topic.clone(), message);
            return None;
        }

        let Some(mut buffered) = self.pending.remove(&message.topic) else {
            debug!(
                "Chunk at offset {} on {} without a start, discarded",
                message.index, message.topic
            );
            return None;
        };

        if buffered.payload.len() != message.index || buffered.total != message.total {
            warn!(
                "Chunk at offset {} on {} does not continue {} buffered bytes, discarding",
                message.index,
                message.topic,
                buffered.payload.len()
            );
            return None;
        }

        buffered.payload.extend_from_slice(&message.payload);
        if buffered.payload.len() >= buffered.total {
            buffered.payload.truncate(buffered.total);
            return Some(buffered);
        }

        self.pending.insert(buffered.topic.clone(), buffered);
        None
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn make_room(&mut self) {
        if self.pending.len() < MAX_PENDING_TOPICS {
            return;
        }
        let oldest = self
            .pending
            .values()
            .min_by_key(|message| message.received)
            .map(|message| message.topic.clone());
        if let Some(topic) = oldest {
            warn!("Too many unfinished messages, dropping the one on {}", topic);
            self.pending.remove(&topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_messages_pass_through() {
        let mut assembler = ChunkAssembler::new(1024);
        let message = InboundMessage::whole("home/5/CMD", br#"{"x":1}"#.to_vec(), QoS::ExactlyOnce);

        let out = assembler.push(message.clone()).unwrap();
        assert_eq!(out.payload, message.payload);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn reassembles_chunks_in_order() {
        let mut assembler = ChunkAssembler::new(1024);

        assert!(assembler.push(InboundMessage::chunk("t/1/CMD", b"{\"on\":".to_vec(), 0, 11)).is_none());
        assert_eq!(assembler.pending(), 1);

        let out = assembler
            .push(InboundMessage::chunk("t/1/CMD", b"true}".to_vec(), 6, 11))
            .unwrap();
        assert_eq!(out.payload, b"{\"on\":true}");
        assert_eq!(out.index, 0);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn out_of_order_chunk_discards_buffer() {
        let mut assembler = ChunkAssembler::new(1024);

        assembler.push(InboundMessage::chunk("t/1/CMD", b"abc".to_vec(), 0, 9));
        assert!(assembler.push(InboundMessage::chunk("t/1/CMD", b"ghi".to_vec(), 6, 9)).is_none());
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn orphan_chunk_is_ignored() {
        let mut assembler = ChunkAssembler::new(1024);
        assert!(assembler.push(InboundMessage::chunk("t/1/CMD", b"def".to_vec(), 3, 6)).is_none());
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn oversized_payload_is_dropped() {
        let mut assembler = ChunkAssembler::new(4);
        assert!(assembler
            .push(InboundMessage::whole("t/1/CMD", b"too long".to_vec(), QoS::AtMostOnce))
            .is_none());
    }

    #[test]
    fn first_chunk_longer_than_total_is_dropped() {
        let mut assembler = ChunkAssembler::new(1024);
        assert!(assembler.push(InboundMessage::chunk("t/1/CMD", b"abcdef".to_vec(), 0, 4)).is_none());
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn unfinished_topics_are_capped() {
        let mut assembler = ChunkAssembler::new(1024);
        for node in 0..MAX_PENDING_TOPICS + 5 {
            assembler.push(InboundMessage::chunk(format!("t/{}/CMD", node), b"ab".to_vec(), 0, 4));
        }
        assert_eq!(assembler.pending(), MAX_PENDING_TOPICS);

        let last = format!("t/{}/CMD", MAX_PENDING_TOPICS + 4);
        let done = assembler.push(InboundMessage::chunk(last, b"cd".to_vec(), 2, 4)).unwrap();
        assert_eq!(done.payload, b"abcd");
        assert_eq!(assembler.pending(), MAX_PENDING_TOPICS - 1);
    }

    #[test]
    fn chunks_of_different_topics_do_not_mix() {
        let mut assembler = ChunkAssembler::new(1024);

        assembler.push(InboundMessage::chunk("t/1/CMD", b"ab".to_vec(), 0, 4));
        assembler.push(InboundMessage::chunk("t/2/CMD", b"xy".to_vec(), 0, 4));
        assert_eq!(assembler.pending(), 2);

        let first = assembler.push(InboundMessage::chunk("t/1/CMD", b"cd".to_vec(), 2, 4)).unwrap();
        assert_eq!(first.payload, b"abcd");
        let second = assembler.push(InboundMessage::chunk("t/2/CMD", b"zw".to_vec(), 2, 4)).unwrap();
        assert_eq!(second.payload, b"xyzw");
    }
}
