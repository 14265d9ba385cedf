//! Publish-ack coordination.
//!
//! Every publish gets a fresh [`CorrelationId`]. When the caller waits for
//! an ack, a one-slot channel is registered under that id before the
//! request leaves, and the transport completes it through the [`AckSink`]
//! it was handed. An ack can only ever reach the slot with its own id, so
//! concurrent publishes never see each other's acks.

use crate::classify::{classify, ErrorContext, Operation};
use crate::error::{ClientError, Result};
use crate::options::MessageOptions;
use crate::transport::{BrokerStatus, Destination, PublishRequest, Transport};
use crate::types::{Ack, AckPolicy, CorrelationId};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type AckOutcome = std::result::Result<Ack, BrokerStatus>;

/// Ack slots for publishes still waiting.
#[derive(Default)]
struct PendingAcks {
    slots: Mutex<HashMap<CorrelationId, Sender<AckOutcome>>>,
}

/// Completion handle for one publish, given to the transport.
///
/// Consumed by [`ack`](Self::ack) or [`fail`](Self::fail), so a publish
/// completes at most once. Completing after the publisher gave up is
/// harmless; the outcome is dropped.
pub struct AckSink {
    correlation_id: CorrelationId,
    pending: Arc<PendingAcks>,
}

impl AckSink {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Report that the broker committed the message.
    pub fn ack(self, ack: Ack) {
        self.complete(Ok(ack));
    }

    /// Report that the broker failed the publish after accepting it.
    pub fn fail(self, status: BrokerStatus) {
        self.complete(Err(status));
    }

    fn complete(self, outcome: AckOutcome) {
        let slot = self.pending.slots.lock().remove(&self.correlation_id);
        match slot {
            // Capacity 1 and a single completion per id: never full
            Some(sender) => {
                let _ = sender.try_send(outcome);
            }
            None => debug!(
                correlation_id = %self.correlation_id,
                "dropping ack with no waiting publisher"
            ),
        }
    }
}

/// Sends publishes and waits for their acks.
pub struct PublishCoordinator {
    pending: Arc<PendingAcks>,
    next_id: AtomicU64,
}

impl PublishCoordinator {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(PendingAcks::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build a request with a fresh correlation id.
    pub fn request(
        &self,
        destination: Destination,
        value: Vec<u8>,
        options: &MessageOptions,
    ) -> PublishRequest {
        PublishRequest {
            destination,
            key: options.key().map(<[u8]>::to_vec),
            value,
            headers: options.headers().clone(),
            correlation_id: CorrelationId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            ack_policy: options.ack_policy(),
        }
    }

    /// Number of publishes currently waiting for an ack.
    pub fn pending_count(&self) -> usize {
        self.pending.slots.lock().len()
    }

    /// Send `request` and wait up to `deadline` for its ack.
    ///
    /// Returns `Ok(None)` without waiting when `deadline` is zero or the
    /// policy is [`AckPolicy::None`]. A deadline expiry doesn't mean the
    /// message wasn't appended, and nothing is retried.
    pub fn publish(
        &self,
        transport: &dyn Transport,
        request: PublishRequest,
        deadline: Duration,
    ) -> Result<Option<Ack>> {
        let correlation_id = request.correlation_id;
        let context = ErrorContext::setup(Operation::Publish {
            stream: destination_name(&request.destination).to_string(),
            partition: match &request.destination {
                Destination::Partition(target) => Some(target.partition),
                Destination::Subject(_) => None,
            },
            deadline,
        });
        let wait = request.ack_policy != AckPolicy::None && !deadline.is_zero();

        // Register before sending; the ack may arrive before send returns
        let receiver = if wait {
            let (sender, receiver) = bounded(1);
            self.pending.slots.lock().insert(correlation_id, sender);
            Some(receiver)
        } else {
            None
        };

        let sink = AckSink {
            correlation_id,
            pending: Arc::clone(&self.pending),
        };

        if let Err(status) = transport.send(request, sink) {
            self.forget(correlation_id);
            return Err(classify(&status, &context).error);
        }

        let receiver = match receiver {
            Some(r) => r,
            None => return Ok(None),
        };

        match receiver.recv_timeout(deadline) {
            Ok(Ok(ack)) => Ok(Some(ack)),
            Ok(Err(status)) => Err(classify(&status, &context).error),
            Err(RecvTimeoutError::Timeout) => {
                self.forget(correlation_id);
                debug!(correlation_id = %correlation_id, ?deadline, "publish ack deadline exceeded");
                Err(ClientError::DeadlineExceeded(deadline))
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(correlation_id = %correlation_id, "ack slot dropped without an outcome");
                Err(ClientError::TransportFailure(
                    "ack channel closed before an ack arrived".into(),
                ))
            }
        }
    }

    fn forget(&self, correlation_id: CorrelationId) {
        self.pending.slots.lock().remove(&correlation_id);
    }
}

impl Default for PublishCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn destination_name(destination: &Destination) -> &str {
    match destination {
        Destination::Partition(target) => &target.stream,
        Destination::Subject(subject) => subject,
    }
}
