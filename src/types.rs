//! Core types shared by the publish and subscribe paths.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// This timestamp moved back by `delta`, saturating at the epoch.
    pub fn saturating_sub(self, delta: Duration) -> Self {
        let micros = i64::try_from(delta.as_micros()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_sub(micros).max(0))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Client-assigned identifier pairing a publish with its ack.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A (stream, partition) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionTarget {
    pub stream: String,
    pub partition: u32,
}

impl PartitionTarget {
    pub fn new(stream: impl Into<String>, partition: u32) -> Self {
        Self {
            stream: stream.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream, self.partition)
    }
}

/// How much replication the broker must confirm before acking a publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AckPolicy {
    /// Ack once the partition leader has committed the message.
    #[default]
    Leader,
    /// Ack once every replica in the ISR has committed the message.
    All,
    /// Never ack; publish is fire-and-forget.
    None,
}

/// A message delivered to a subscription.
///
/// Messages are immutable; the subscription hands ownership to the
/// handler and keeps nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub(crate) stream: String,
    pub(crate) partition: u32,
    pub(crate) offset: u64,
    pub(crate) key: Option<Vec<u8>>,
    pub(crate) value: Vec<u8>,
    pub(crate) headers: BTreeMap<String, Vec<u8>>,
    pub(crate) timestamp: Timestamp,
    pub(crate) subject: Option<String>,
    pub(crate) correlation_id: Option<CorrelationId>,
}

impl Message {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Broker-assigned offset within the partition.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Message payload.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn headers(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(Vec::as_slice)
    }

    /// Time the broker appended the message.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Subject the message was published to, if routed by subject.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    /// Consume the message, returning its payload.
    pub fn into_value(self) -> Vec<u8> {
        self.value
    }
}

/// Durability acknowledgment for a publish.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub stream: String,
    pub partition: u32,
    /// Offset the broker assigned to the message.
    pub offset: u64,
    pub correlation_id: CorrelationId,
    pub ack_policy: AckPolicy,
    pub committed_at: Timestamp,
}

/// Broker view of one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub id: u32,
    /// Lowest retained offset.
    pub log_start: u64,
    /// Offset the next appended message will receive.
    pub next_offset: u64,
}

impl PartitionMetadata {
    /// Highest committed offset, if the partition holds any message.
    pub fn high_watermark(&self) -> Option<u64> {
        self.next_offset.checked_sub(1).filter(|hw| *hw >= self.log_start)
    }

    /// Number of retained messages.
    pub fn len(&self) -> u64 {
        self.next_offset - self.log_start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Broker view of a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub name: String,
    pub subject: Option<String>,
    pub group: Option<String>,
    pub replication_factor: u16,
    pub partitions: Vec<PartitionMetadata>,
}

impl StreamMetadata {
    pub fn partition(&self, id: u32) -> Option<&PartitionMetadata> {
        self.partitions.iter().find(|p| p.id == id)
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }
}
