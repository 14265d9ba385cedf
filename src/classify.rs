//! Maps broker and transport failures onto [`ClientError`].
//!
//! Classification is a pure function of the status and the context it was
//! observed in. The context decides two things: which typed error a
//! `NotFound` becomes, and whether the error goes back to the caller or to
//! the subscription's error callback.

use crate::error::ClientError;
use crate::transport::{BrokerStatus, MissingResource, StatusCode};
use crate::types::PartitionTarget;
use std::time::Duration;

/// Operation that observed the failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    CreateStream { stream: String },
    DeleteStream { stream: String },
    Metadata { stream: String },
    /// `partition` is `None` for subject publishes.
    Publish {
        stream: String,
        partition: Option<u32>,
        deadline: Duration,
    },
    Subscribe { target: PartitionTarget, requested_offset: Option<u64> },
}

/// Whether a network stream had been established yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Request/response, or before the streaming read is open.
    Setup,
    /// After the streaming read is open.
    Streaming,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: Operation,
    pub phase: Phase,
}

impl ErrorContext {
    pub fn setup(operation: Operation) -> Self {
        Self {
            operation,
            phase: Phase::Setup,
        }
    }

    pub fn streaming(operation: Operation) -> Self {
        Self {
            operation,
            phase: Phase::Streaming,
        }
    }
}

/// How a classified error reaches its consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Returned from the call that observed it.
    Synchronous,
    /// Delivered once through the subscription's error callback.
    Callback,
}

#[derive(Debug)]
pub struct Classified {
    pub error: ClientError,
    pub delivery: Delivery,
    /// A re-opened stream may succeed where this one failed.
    pub resumable: bool,
}

/// Classify a broker status observed in `context`.
pub fn classify(status: &BrokerStatus, context: &ErrorContext) -> Classified {
    let message = status.message.clone();
    let op = &context.operation;

    let error = match status.code {
        StatusCode::NotFound => match op {
            Operation::Subscribe { target, .. } => ClientError::NoSuchPartition {
                stream: target.stream.clone(),
                partition: target.partition,
            },
            Operation::Publish {
                stream,
                partition: Some(partition),
                ..
            } if status.missing == Some(MissingResource::Partition) => {
                ClientError::NoSuchPartition {
                    stream: stream.clone(),
                    partition: *partition,
                }
            }
            Operation::CreateStream { stream }
            | Operation::DeleteStream { stream }
            | Operation::Metadata { stream }
            | Operation::Publish { stream, .. } => ClientError::NoSuchStream(stream.clone()),
        },
        StatusCode::AlreadyExists => ClientError::StreamExists(stream_name(op).to_string()),
        StatusCode::DeadlineExceeded => match op {
            Operation::Publish { deadline, .. } => ClientError::DeadlineExceeded(*deadline),
            _ => ClientError::DeadlineExceeded(Duration::ZERO),
        },
        StatusCode::OutOfRange => match op {
            Operation::Subscribe {
                requested_offset, ..
            } => ClientError::OffsetOutOfRange {
                requested: requested_offset.unwrap_or_default(),
                reason: message,
            },
            _ => ClientError::InvalidArgument(message),
        },
        StatusCode::InvalidArgument => ClientError::InvalidArgument(message),
        StatusCode::Unavailable | StatusCode::Cancelled | StatusCode::Internal => {
            ClientError::TransportFailure(status.to_string())
        }
        StatusCode::DataLoss => ClientError::DecodeFailure(message),
    };

    let delivery = match context.phase {
        Phase::Setup => Delivery::Synchronous,
        Phase::Streaming => Delivery::Callback,
    };

    let resumable = context.phase == Phase::Streaming && status.code == StatusCode::Unavailable;

    Classified {
        error,
        delivery,
        resumable,
    }
}

fn stream_name(op: &Operation) -> &str {
    match op {
        Operation::CreateStream { stream }
        | Operation::DeleteStream { stream }
        | Operation::Metadata { stream }
        | Operation::Publish { stream, .. } => stream,
        Operation::Subscribe { target, .. } => &target.stream,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe_op(offset: Option<u64>) -> Operation {
        Operation::Subscribe {
            target: PartitionTarget::new("orders", 1),
            requested_offset: offset,
        }
    }

    #[test]
    fn test_not_found_depends_on_operation() {
        let status = BrokerStatus::not_found("gone");

        let err = classify(&status, &ErrorContext::setup(subscribe_op(None))).error;
        assert!(matches!(
            err,
            ClientError::NoSuchPartition { ref stream, partition: 1 } if stream == "orders"
        ));

        let publish = Operation::Publish {
            stream: "orders".into(),
            partition: Some(0),
            deadline: Duration::from_secs(1),
        };
        let err = classify(&status, &ErrorContext::setup(publish)).error;
        assert!(matches!(err, ClientError::NoSuchStream(ref s) if s == "orders"));

        let delete = Operation::DeleteStream {
            stream: "orders".into(),
        };
        let err = classify(&status, &ErrorContext::setup(delete)).error;
        assert!(matches!(err, ClientError::NoSuchStream(_)));
    }

    #[test]
    fn test_publish_not_found_names_missing_resource() {
        let publish = |partition| {
            ErrorContext::setup(Operation::Publish {
                stream: "orders".into(),
                partition,
                deadline: Duration::from_secs(1),
            })
        };

        let status = BrokerStatus::no_such_partition("orders", 7);
        let err = classify(&status, &publish(Some(7))).error;
        assert!(matches!(
            err,
            ClientError::NoSuchPartition { ref stream, partition: 7 } if stream == "orders"
        ));

        let status = BrokerStatus::no_such_stream("orders");
        let err = classify(&status, &publish(Some(7))).error;
        assert!(matches!(err, ClientError::NoSuchStream(ref s) if s == "orders"));

        // Subject publishes have no partition to blame
        let status = BrokerStatus::no_such_partition("orders", 0);
        let err = classify(&status, &publish(None)).error;
        assert!(matches!(err, ClientError::NoSuchStream(_)));
    }

    #[test]
    fn test_already_exists() {
        let status = BrokerStatus::new(StatusCode::AlreadyExists, "dup");
        let create = Operation::CreateStream {
            stream: "orders".into(),
        };
        let err = classify(&status, &ErrorContext::setup(create)).error;
        assert!(matches!(err, ClientError::StreamExists(ref s) if s == "orders"));
    }

    #[test]
    fn test_deadline_carries_publish_deadline() {
        let status = BrokerStatus::new(StatusCode::DeadlineExceeded, "slow");
        let publish = Operation::Publish {
            stream: "orders".into(),
            partition: Some(0),
            deadline: Duration::from_millis(10),
        };
        let err = classify(&status, &ErrorContext::setup(publish)).error;
        assert!(matches!(err, ClientError::DeadlineExceeded(d) if d == Duration::from_millis(10)));
    }

    #[test]
    fn test_out_of_range_on_subscribe() {
        let status = BrokerStatus::new(StatusCode::OutOfRange, "before log start 5");
        let err = classify(&status, &ErrorContext::setup(subscribe_op(Some(2)))).error;
        assert!(matches!(err, ClientError::OffsetOutOfRange { requested: 2, .. }));

        let publish = Operation::Publish {
            stream: "orders".into(),
            partition: Some(0),
            deadline: Duration::from_secs(1),
        };
        let err = classify(&status, &ErrorContext::setup(publish)).error;
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn test_phase_selects_delivery() {
        let status = BrokerStatus::unavailable("reset");

        let setup = classify(&status, &ErrorContext::setup(subscribe_op(None)));
        assert_eq!(setup.delivery, Delivery::Synchronous);
        assert!(!setup.resumable);
        assert!(matches!(setup.error, ClientError::TransportFailure(_)));

        let streaming = classify(&status, &ErrorContext::streaming(subscribe_op(None)));
        assert_eq!(streaming.delivery, Delivery::Callback);
        assert!(streaming.resumable);
    }

    #[test]
    fn test_data_loss_is_decode_failure() {
        let status = BrokerStatus::new(StatusCode::DataLoss, "bad frame");
        let classified = classify(&status, &ErrorContext::streaming(subscribe_op(None)));
        assert!(matches!(classified.error, ClientError::DecodeFailure(_)));
        assert!(!classified.resumable);
    }
}
