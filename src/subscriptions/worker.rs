//! Per-subscription threads.
//!
//! The read loop pulls frames off the partition stream, decodes them and
//! pushes them into a bounded queue. The delivery loop drains that queue
//! into the handler. A full queue blocks the read loop, so a slow handler
//! slows reading down instead of losing or reordering messages.

use crate::classify::{classify, ErrorContext, Operation};
use crate::error::ClientError;
use crate::position;
use crate::transport::envelope;
use crate::transport::{BrokerStatus, EnvelopeStream, Transport};
use crate::types::Message;
use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::manager::SubscriptionShared;
use super::types::{DeliveryEvent, MessageHandler, SubscriptionState};

pub(crate) struct ReadLoop {
    pub(crate) shared: Arc<SubscriptionShared>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) stream: Box<dyn EnvelopeStream>,
    pub(crate) queue: Sender<DeliveryEvent>,
    /// Disconnects when the subscription is cancelled.
    pub(crate) cancelled: Receiver<()>,
    pub(crate) operation: Operation,
    pub(crate) poll_interval: Duration,
    pub(crate) resume_backoff: Duration,
    pub(crate) resume_attempts: u32,
    /// Offset the broker resolved the original open to.
    pub(crate) start_offset: u64,
    /// Offset of the last message pushed into the queue.
    pub(crate) last_read: Option<u64>,
}

impl ReadLoop {
    pub(crate) fn run(mut self) {
        let mut attempts_left = self.resume_attempts;

        while !self.shared.state().is_terminal() {
            match self.stream.next(self.poll_interval) {
                Ok(None) => continue,
                Ok(Some(frame)) => {
                    let message = match self.decode(&frame) {
                        Ok(message) => message,
                        Err(err) => {
                            self.fail(err);
                            break;
                        }
                    };
                    attempts_left = self.resume_attempts;
                    self.last_read = Some(message.offset());
                    if !self.enqueue(DeliveryEvent::Message(message)) {
                        break;
                    }
                }
                Err(status) => {
                    if let Err(err) = self.recover(status, &mut attempts_left) {
                        self.fail(err);
                        break;
                    }
                }
            }
        }

        debug!(subscription = %self.shared.id, last_read = ?self.last_read, "read loop exited");
    }

    fn decode(&self, frame: &[u8]) -> Result<Message, ClientError> {
        let body = envelope::decode(frame)?;
        if let Some(last) = self.last_read {
            if body.offset <= last {
                return Err(ClientError::DecodeFailure(format!(
                    "offset {} does not follow {}",
                    body.offset, last
                )));
            }
        }
        Ok(body.into_message(&self.shared.target.stream, self.shared.target.partition))
    }

    /// Re-open the stream after a resumable failure, or return the error
    /// that ends the subscription.
    fn recover(
        &mut self,
        mut status: BrokerStatus,
        attempts_left: &mut u32,
    ) -> Result<(), ClientError> {
        loop {
            let classified = classify(&status, &self.streaming_context());
            if !classified.resumable || *attempts_left == 0 {
                return Err(classified.error);
            }
            *attempts_left -= 1;

            // A cancel during the backoff ends the wait early
            match self.cancelled.recv_timeout(self.resume_backoff) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return Ok(()),
            }

            let token = position::resume_from(self.last_read, self.start_offset);
            warn!(
                subscription = %self.shared.id,
                target = %self.shared.target,
                ?token,
                error = %status,
                "resuming subscription stream"
            );
            match self.transport.open_stream(&self.shared.target, token) {
                Ok(stream) => {
                    self.stream = stream;
                    return Ok(());
                }
                Err(next) => status = next,
            }
        }
    }

    /// Offset the read loop expects next.
    fn next_offset(&self) -> u64 {
        self.last_read.map_or(self.start_offset, |offset| offset + 1)
    }

    /// Error context for a mid-stream failure at the current position.
    fn streaming_context(&self) -> ErrorContext {
        let mut operation = self.operation.clone();
        if let Operation::Subscribe {
            requested_offset, ..
        } = &mut operation
        {
            *requested_offset = Some(self.next_offset());
        }
        ErrorContext::streaming(operation)
    }

    /// Queue the terminal error behind any messages already read.
    fn fail(&self, err: ClientError) {
        warn!(
            subscription = %self.shared.id,
            target = %self.shared.target,
            error = %err,
            "subscription stream failed"
        );
        self.enqueue(DeliveryEvent::Failed(err));
    }

    /// Blocking push; gives up if the subscription is cancelled meanwhile.
    fn enqueue(&self, event: DeliveryEvent) -> bool {
        select! {
            send(self.queue, event) -> res => res.is_ok(),
            recv(self.cancelled) -> _ => false,
        }
    }
}

/// Drain `deliveries` into `handler` until the queue closes or the
/// subscription leaves `Active`.
pub(crate) fn delivery_loop(
    shared: Arc<SubscriptionShared>,
    deliveries: Receiver<DeliveryEvent>,
    mut handler: Box<dyn MessageHandler>,
) {
    shared.set_delivery_thread(thread::current().id());

    for event in deliveries.iter() {
        let _guard = shared.delivery.lock();
        if shared.state() != SubscriptionState::Active {
            break;
        }

        match event {
            DeliveryEvent::Message(message) => {
                let offset = message.offset();
                shared.record_delivered(offset);
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(message)));
                if let Err(payload) = outcome {
                    let reason = panic_message(payload.as_ref());
                    error!(
                        subscription = %shared.id,
                        offset,
                        reason = %reason,
                        "message handler panicked; subscription failed"
                    );
                    let err =
                        ClientError::HandlerPanicked(format!("at offset {}: {}", offset, reason));
                    fail_with(&shared, handler.as_mut(), err);
                    break;
                }
            }
            DeliveryEvent::Failed(err) => {
                fail_with(&shared, handler.as_mut(), err);
                break;
            }
        }
    }
}

/// Move to `Failed` and report `err` once. Loses to a concurrent unsubscribe.
fn fail_with(shared: &SubscriptionShared, handler: &mut dyn MessageHandler, err: ClientError) {
    if !shared.transition(SubscriptionState::Active, SubscriptionState::Failed) {
        return;
    }
    shared.cancel();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.on_error(err)));
    if outcome.is_err() {
        error!(subscription = %shared.id, "error handler panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
