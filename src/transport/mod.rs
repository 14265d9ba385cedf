//! The seam between the client core and the broker connection.
//!
//! The client never opens or closes connections itself. It talks to a
//! [`Transport`], which owns the connection lifecycle and may be shared by
//! any number of subscriptions and publishes.
//!
//! - [`Transport::send`] hands a publish to the broker; the ack comes back
//!   later through the [`AckSink`] passed alongside it.
//! - [`Transport::open_stream`] starts a server-streaming read that yields
//!   encoded [`envelope`] frames in offset order.
//!
//! [`LocalBroker`] is an in-process implementation used by the tests and
//! benchmarks.

pub mod envelope;
mod local;

pub use crate::publish::AckSink;
pub use local::{BrokerConfig, LocalBroker};

use crate::options::StreamOptions;
use crate::types::{AckPolicy, CorrelationId, PartitionTarget, StreamMetadata, Timestamp};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Failure category reported by the broker or the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    NotFound,
    AlreadyExists,
    DeadlineExceeded,
    OutOfRange,
    InvalidArgument,
    Unavailable,
    Cancelled,
    DataLoss,
    Internal,
}

/// Which resource a `NotFound` status refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MissingResource {
    Stream,
    /// The stream exists but the partition doesn't.
    Partition,
}

/// A failure reported by the broker or the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerStatus {
    pub code: StatusCode,
    pub message: String,
    /// Set on `NotFound` when the broker says what was missing.
    pub missing: Option<MissingResource>,
}

impl BrokerStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            missing: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn no_such_stream(stream: &str) -> Self {
        Self {
            missing: Some(MissingResource::Stream),
            ..Self::not_found(format!("no such stream: {}", stream))
        }
    }

    pub fn no_such_partition(stream: &str, partition: u32) -> Self {
        Self {
            missing: Some(MissingResource::Partition),
            ..Self::not_found(format!("no such partition: {}/{}", stream, partition))
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }
}

impl fmt::Display for BrokerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Result type for transport calls.
pub type TransportResult<T> = std::result::Result<T, BrokerStatus>;

/// Position marker sent with a streaming-read request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeToken {
    /// Lowest retained offset.
    Earliest,
    /// After the highest committed offset.
    Latest,
    /// After the highest committed offset; nothing historical.
    NewOnly,
    /// Exactly this offset.
    Offset(u64),
    /// First message with a timestamp at or after this one.
    Timestamp(Timestamp),
}

/// Where a publish goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Partition(PartitionTarget),
    /// Every stream bound to this subject.
    Subject(String),
}

/// A single publish on its way to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishRequest {
    pub destination: Destination,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, Vec<u8>>,
    pub correlation_id: CorrelationId,
    pub ack_policy: AckPolicy,
}

/// A live server-streaming read over one partition.
pub trait EnvelopeStream: Send {
    /// Offset the broker resolved the resume token to.
    fn start_offset(&self) -> u64;

    /// Next encoded envelope, or `None` if nothing arrived within `timeout`.
    fn next(&mut self, timeout: Duration) -> TransportResult<Option<Vec<u8>>>;
}

/// Connection to a broker.
pub trait Transport: Send + Sync {
    fn create_stream(&self, name: &str, options: &StreamOptions) -> TransportResult<()>;

    fn delete_stream(&self, name: &str) -> TransportResult<()>;

    fn stream_metadata(&self, name: &str) -> TransportResult<StreamMetadata>;

    /// Hand a publish to the broker. An `Err` means the broker rejected it
    /// outright; otherwise the outcome arrives through `acks`, unless the
    /// request's policy is [`AckPolicy::None`].
    fn send(&self, request: PublishRequest, acks: AckSink) -> TransportResult<()>;

    fn open_stream(
        &self,
        target: &PartitionTarget,
        token: ResumeToken,
    ) -> TransportResult<Box<dyn EnvelopeStream>>;
}
