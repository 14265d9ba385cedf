//! Immutable option structs for streams, publishes and subscriptions.
//!
//! Each struct is put together with its builder and checked once in
//! `build()`; the client never re-validates options at use time.

use crate::error::{ClientError, Result};
use crate::types::{AckPolicy, Timestamp};
use std::collections::BTreeMap;
use std::time::Duration;

/// Check that a stream name is usable as a broker identifier.
pub fn validate_stream_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ClientError::InvalidArgument("stream name is empty".into()));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ClientError::InvalidArgument(format!(
            "stream name {:?} contains whitespace or control characters",
            name
        )));
    }
    Ok(())
}

// --- Streams ---

/// Options for creating a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOptions {
    partitions: u32,
    replication_factor: u16,
    group: Option<String>,
    subject: Option<String>,
}

impl StreamOptions {
    pub fn builder() -> StreamOptionsBuilder {
        StreamOptionsBuilder::default()
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn replication_factor(&self) -> u16 {
        self.replication_factor
    }

    /// Shared subscription coordination key.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Subject the stream is bound to for subject-routed publishes.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            partitions: 1,
            replication_factor: 1,
            group: None,
            subject: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct StreamOptionsBuilder {
    inner: StreamOptions,
}

impl StreamOptionsBuilder {
    pub fn partitions(mut self, partitions: u32) -> Self {
        self.inner.partitions = partitions;
        self
    }

    pub fn replication_factor(mut self, factor: u16) -> Self {
        self.inner.replication_factor = factor;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.inner.group = Some(group.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.inner.subject = Some(subject.into());
        self
    }

    pub fn build(self) -> Result<StreamOptions> {
        let opts = self.inner;
        if opts.partitions == 0 {
            return Err(ClientError::InvalidArgument(
                "partition count must be at least 1".into(),
            ));
        }
        if opts.replication_factor == 0 {
            return Err(ClientError::InvalidArgument(
                "replication factor must be at least 1".into(),
            ));
        }
        if opts.group.as_deref() == Some("") {
            return Err(ClientError::InvalidArgument("group is empty".into()));
        }
        if opts.subject.as_deref() == Some("") {
            return Err(ClientError::InvalidArgument("subject is empty".into()));
        }
        Ok(opts)
    }
}

// --- Messages ---

/// How a publish without an explicit partition picks one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Partitioner {
    /// Always partition 0.
    #[default]
    Fixed,
    /// crc32 of the message key, modulo the partition count.
    Key,
    /// Cycle through partitions, per stream.
    RoundRobin,
}

/// Options for a single publish.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MessageOptions {
    ack_deadline: Option<Duration>,
    ack_policy: AckPolicy,
    key: Option<Vec<u8>>,
    headers: BTreeMap<String, Vec<u8>>,
    partition: Option<u32>,
    partitioner: Partitioner,
}

impl MessageOptions {
    pub fn builder() -> MessageOptionsBuilder {
        MessageOptionsBuilder::default()
    }

    /// Explicit ack deadline; `None` falls back to the client default.
    pub fn ack_deadline(&self) -> Option<Duration> {
        self.ack_deadline
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn headers(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.headers
    }

    pub fn partition(&self) -> Option<u32> {
        self.partition
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }
}

#[derive(Clone, Debug, Default)]
pub struct MessageOptionsBuilder {
    inner: MessageOptions,
}

impl MessageOptionsBuilder {
    /// Wait at most `deadline` for the ack. Zero means fire-and-forget.
    pub fn ack_deadline(mut self, deadline: Duration) -> Self {
        self.inner.ack_deadline = Some(deadline);
        self
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.inner.ack_policy = policy;
        self
    }

    pub fn key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.inner.key = Some(key.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.inner.headers.insert(name.into(), value.into());
        self
    }

    /// Publish to this partition, ignoring the partitioner.
    pub fn partition(mut self, partition: u32) -> Self {
        self.inner.partition = Some(partition);
        self
    }

    pub fn partitioner(mut self, partitioner: Partitioner) -> Self {
        self.inner.partitioner = partitioner;
        self
    }

    pub fn build(self) -> Result<MessageOptions> {
        let opts = self.inner;
        if opts.headers.keys().any(|name| name.is_empty()) {
            return Err(ClientError::InvalidArgument("header name is empty".into()));
        }
        if opts.partition.is_none() && opts.partitioner == Partitioner::Key && opts.key.is_none()
        {
            return Err(ClientError::InvalidArgument(
                "key partitioner requires a message key".into(),
            ));
        }
        Ok(opts)
    }
}

// --- Subscriptions ---

/// Where a subscription starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Lowest retained offset.
    Earliest,
    /// After the highest committed offset at open time.
    Latest,
    /// Only messages appended after the subscription opens.
    #[default]
    NewOnly,
    /// Exactly this offset.
    Offset(u64),
    /// First message appended at or after this time.
    Timestamp(Timestamp),
    /// First message appended within this long before open time.
    TimeDelta(Duration),
}

/// Options for a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    start_position: StartPosition,
    partition: u32,
    resume_attempts: u32,
}

impl SubscriptionOptions {
    pub fn builder() -> SubscriptionOptionsBuilder {
        SubscriptionOptionsBuilder::default()
    }

    pub fn start_position(&self) -> StartPosition {
        self.start_position
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// How many consecutive transport drops the read loop re-opens from.
    pub fn resume_attempts(&self) -> u32 {
        self.resume_attempts
    }
}

#[derive(Clone, Debug, Default)]
pub struct SubscriptionOptionsBuilder {
    inner: SubscriptionOptions,
}

impl SubscriptionOptionsBuilder {
    pub fn start_at_earliest(mut self) -> Self {
        self.inner.start_position = StartPosition::Earliest;
        self
    }

    pub fn start_at_latest(mut self) -> Self {
        self.inner.start_position = StartPosition::Latest;
        self
    }

    pub fn start_at_new_only(mut self) -> Self {
        self.inner.start_position = StartPosition::NewOnly;
        self
    }

    pub fn start_at_offset(mut self, offset: u64) -> Self {
        self.inner.start_position = StartPosition::Offset(offset);
        self
    }

    pub fn start_at_time(mut self, time: Timestamp) -> Self {
        self.inner.start_position = StartPosition::Timestamp(time);
        self
    }

    pub fn start_at_time_delta(mut self, delta: Duration) -> Self {
        self.inner.start_position = StartPosition::TimeDelta(delta);
        self
    }

    pub fn partition(mut self, partition: u32) -> Self {
        self.inner.partition = partition;
        self
    }

    pub fn resume_attempts(mut self, attempts: u32) -> Self {
        self.inner.resume_attempts = attempts;
        self
    }

    pub fn build(self) -> Result<SubscriptionOptions> {
        let opts = self.inner;
        if let StartPosition::Timestamp(ts) = opts.start_position {
            if ts.0 < 0 {
                return Err(ClientError::InvalidArgument(
                    "start timestamp precedes the Unix epoch".into(),
                ));
            }
        }
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_options_defaults() {
        let opts = StreamOptions::builder().build().unwrap();
        assert_eq!(opts.partitions(), 1);
        assert_eq!(opts.replication_factor(), 1);
        assert!(opts.group().is_none());
        assert!(opts.subject().is_none());
    }

    #[test]
    fn test_stream_options_rejects_zero_partitions() {
        let result = StreamOptions::builder().partitions(0).build();
        assert!(matches!(result, Err(ClientError::InvalidArgument(_))));

        let result = StreamOptions::builder().replication_factor(0).build();
        assert!(matches!(result, Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn test_key_partitioner_requires_key() {
        let result = MessageOptions::builder()
            .partitioner(Partitioner::Key)
            .build();
        assert!(matches!(result, Err(ClientError::InvalidArgument(_))));

        // An explicit partition makes the partitioner irrelevant
        let opts = MessageOptions::builder()
            .partitioner(Partitioner::Key)
            .partition(2)
            .build()
            .unwrap();
        assert_eq!(opts.partition(), Some(2));
    }

    #[test]
    fn test_empty_header_name_rejected() {
        let result = MessageOptions::builder().header("", b"v".to_vec()).build();
        assert!(matches!(result, Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn test_subscription_default_is_new_only() {
        let opts = SubscriptionOptions::default();
        assert_eq!(opts.start_position(), StartPosition::NewOnly);
        assert_eq!(opts.partition(), 0);
        assert_eq!(opts.resume_attempts(), 0);
    }

    #[test]
    fn test_stream_name_validation() {
        assert!(validate_stream_name("orders").is_ok());
        assert!(validate_stream_name("").is_err());
        assert!(validate_stream_name("two words").is_err());
    }
}
