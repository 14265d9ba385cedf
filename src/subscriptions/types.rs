//! Subscription types.

use crate::error::ClientError;
use crate::types::Message;
use std::fmt;

/// Unique identifier for a subscription within a client.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a subscription.
///
/// `Pending → Active → {Closed, Failed}`; both end states are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    /// Position resolved, stream open in flight.
    Pending = 0,
    /// Stream open, messages flowing to the handler.
    Active = 1,
    /// Unsubscribed.
    Closed = 2,
    /// Ended by an error; the handler saw it once.
    Failed = 3,
}

impl SubscriptionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriptionState::Pending,
            1 => SubscriptionState::Active,
            2 => SubscriptionState::Closed,
            _ => SubscriptionState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionState::Closed | SubscriptionState::Failed)
    }
}

/// Receives a subscription's messages and its terminal error.
///
/// Both methods run on the subscription's delivery thread, one call at a
/// time, in offset order. After `on_error` nothing else is called.
pub trait MessageHandler: Send + 'static {
    fn on_message(&mut self, message: Message);

    fn on_error(&mut self, error: ClientError);
}

/// [`MessageHandler`] built from two closures. See [`handler`].
pub struct FnHandler<M, E> {
    on_message: M,
    on_error: E,
}

impl<M, E> MessageHandler for FnHandler<M, E>
where
    M: FnMut(Message) + Send + 'static,
    E: FnMut(ClientError) + Send + 'static,
{
    fn on_message(&mut self, message: Message) {
        (self.on_message)(message)
    }

    fn on_error(&mut self, error: ClientError) {
        (self.on_error)(error)
    }
}

/// Build a handler from a message closure and an error closure.
pub fn handler<M, E>(on_message: M, on_error: E) -> FnHandler<M, E>
where
    M: FnMut(Message) + Send + 'static,
    E: FnMut(ClientError) + Send + 'static,
{
    FnHandler {
        on_message,
        on_error,
    }
}

/// What the read loop hands the delivery loop.
pub(crate) enum DeliveryEvent {
    Message(Message),
    /// Terminal; nothing follows it.
    Failed(ClientError),
}
