//! Subscription manager: opens partition streams and tracks live
//! subscriptions.

use crate::classify::{classify, ErrorContext, Operation};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::options::{validate_stream_name, StartPosition, SubscriptionOptions};
use crate::position;
use crate::transport::Transport;
use crate::types::{PartitionTarget, Timestamp};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info};

use super::types::{MessageHandler, SubscriptionId, SubscriptionState};
use super::worker::{delivery_loop, ReadLoop};

/// State shared between a subscription's handle and its two threads.
pub(crate) struct SubscriptionShared {
    pub(crate) id: SubscriptionId,
    pub(crate) target: PartitionTarget,
    state: AtomicU8,
    /// Dropped to wake the read loop on unsubscribe.
    cancel: Mutex<Option<Sender<()>>>,
    /// Held by the delivery thread for the duration of each callback.
    pub(crate) delivery: Mutex<()>,
    delivery_thread: Mutex<Option<ThreadId>>,
    /// Last delivered offset plus one; zero until the first delivery.
    last_delivered: AtomicU64,
}

impl SubscriptionShared {
    fn new(id: SubscriptionId, target: PartitionTarget) -> (Self, Receiver<()>) {
        let (cancel, cancelled) = bounded(0);
        let shared = Self {
            id,
            target,
            state: AtomicU8::new(SubscriptionState::Pending as u8),
            cancel: Mutex::new(Some(cancel)),
            delivery: Mutex::new(()),
            delivery_thread: Mutex::new(None),
            last_delivered: AtomicU64::new(0),
        };
        (shared, cancelled)
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`; false if the state was not `from`.
    pub(crate) fn transition(&self, from: SubscriptionState, to: SubscriptionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Wake the read loop out of any blocking wait.
    pub(crate) fn cancel(&self) {
        self.cancel.lock().take();
    }

    pub(crate) fn set_delivery_thread(&self, id: ThreadId) {
        *self.delivery_thread.lock() = Some(id);
    }

    pub(crate) fn record_delivered(&self, offset: u64) {
        self.last_delivered.store(offset + 1, Ordering::SeqCst);
    }

    fn last_delivered(&self) -> Option<u64> {
        self.last_delivered.load(Ordering::SeqCst).checked_sub(1)
    }

    /// Close the subscription. Once terminal only the wait below remains.
    fn unsubscribe(&self) {
        let closed = self.transition(SubscriptionState::Active, SubscriptionState::Closed)
            || self.transition(SubscriptionState::Pending, SubscriptionState::Closed);
        if closed {
            self.cancel();
            debug!(subscription = %self.id, target = %self.target, "unsubscribed");
        }

        // Wait out an in-flight callback (including `on_error` of a failed
        // subscription), unless we are that callback
        let on_delivery_thread = *self.delivery_thread.lock() == Some(thread::current().id());
        if !on_delivery_thread {
            drop(self.delivery.lock());
        }
    }
}

/// Handle to a live subscription.
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe) or close the client.
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn stream(&self) -> &str {
        &self.shared.target.stream
    }

    pub fn partition(&self) -> u32 {
        self.shared.target.partition
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    /// Offset of the last message handed to the handler.
    pub fn last_offset(&self) -> Option<u64> {
        self.shared.last_delivered()
    }

    /// Stop delivery and tear down the stream.
    ///
    /// Safe from any thread, including from inside the handler. Once this
    /// returns no further callback starts; when called from inside the
    /// handler, the current callback is the last one. Calling it again, or
    /// after the subscription failed, leaves the state alone but still
    /// waits for a running `on_error` to return.
    pub fn unsubscribe(&self) -> Result<()> {
        self.shared.unsubscribe();
        Ok(())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("target", &self.shared.target)
            .field("state", &self.state())
            .finish()
    }
}

/// Opens subscriptions and keeps the set of live ones.
pub struct SubscriptionManager {
    /// Subscriptions by ID; terminal ones are pruned lazily.
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<SubscriptionShared>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    config: ClientConfig,
}

impl SubscriptionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Open a subscription on one partition of `stream`.
    ///
    /// Returns once the broker has opened the stream. Failures up to that
    /// point (unknown stream or partition, offset outside the retained
    /// window, transport errors) are returned here and the handler is never
    /// called. Later failures reach `handler.on_error` exactly once.
    pub fn subscribe(
        &self,
        transport: &Arc<dyn Transport>,
        stream: &str,
        options: &SubscriptionOptions,
        handler: Box<dyn MessageHandler>,
    ) -> Result<Subscription> {
        validate_stream_name(stream)?;

        let target = PartitionTarget::new(stream, options.partition());
        let requested_offset = match options.start_position() {
            StartPosition::Offset(offset) => Some(offset),
            _ => None,
        };
        let operation = Operation::Subscribe {
            target: target.clone(),
            requested_offset,
        };
        let setup = ErrorContext::setup(operation.clone());

        let metadata = transport
            .stream_metadata(stream)
            .map_err(|status| classify(&status, &setup).error)?;
        let token = position::resolve(
            options.start_position(),
            &target,
            metadata.partition(target.partition),
            Timestamp::now(),
        )?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (shared, cancelled) = SubscriptionShared::new(id, target.clone());
        let shared = Arc::new(shared);

        let envelope_stream = transport
            .open_stream(&target, token)
            .map_err(|status| classify(&status, &setup).error)?;
        let start_offset = envelope_stream.start_offset();

        shared.transition(SubscriptionState::Pending, SubscriptionState::Active);

        let (queue, deliveries) = bounded(self.config.delivery_queue_depth);

        let delivery_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("tributary-deliver-{}", id))
            .spawn(move || delivery_loop(delivery_shared, deliveries, handler));
        if let Err(e) = spawned {
            shared.transition(SubscriptionState::Active, SubscriptionState::Closed);
            return Err(e.into());
        }

        let read_loop = ReadLoop {
            shared: Arc::clone(&shared),
            transport: Arc::clone(transport),
            stream: envelope_stream,
            queue,
            cancelled,
            operation,
            poll_interval: self.config.poll_interval(),
            resume_backoff: self.config.resume_backoff(),
            resume_attempts: options.resume_attempts(),
            start_offset,
            last_read: None,
        };
        let spawned = thread::Builder::new()
            .name(format!("tributary-read-{}", id))
            .spawn(move || read_loop.run());
        if let Err(e) = spawned {
            // The queue sender went down with the closure; delivery exits
            shared.transition(SubscriptionState::Active, SubscriptionState::Closed);
            return Err(e.into());
        }

        info!(
            subscription = %id,
            target = %target,
            start_offset,
            position = ?options.start_position(),
            "subscription active"
        );

        self.prune();
        self.subscriptions.write().insert(id, Arc::clone(&shared));

        Ok(Subscription { shared })
    }

    /// Unsubscribe every tracked subscription.
    pub fn unsubscribe_all(&self) {
        let subs: Vec<_> = self.subscriptions.write().drain().map(|(_, s)| s).collect();
        for sub in subs {
            sub.unsubscribe();
        }
    }

    /// Number of subscriptions that are not yet closed or failed.
    pub fn active_count(&self) -> usize {
        self.prune();
        self.subscriptions.read().len()
    }

    fn prune(&self) {
        self.subscriptions
            .write()
            .retain(|_, sub| !sub.state().is_terminal());
    }
}
