//! Subscription engine.
//!
//! A subscription binds one partition to a [`MessageHandler`]:
//! - The start position is resolved once, when the stream opens
//! - A read loop thread decodes frames into a bounded delivery queue
//! - A delivery thread invokes the handler serially, in offset order
//! - Errors after the stream is open reach `on_error` exactly once
//!
//! # Example
//!
//! ```ignore
//! let options = SubscriptionOptions::builder().start_at_earliest().build()?;
//! let sub = client.subscribe(
//!     "orders",
//!     &options,
//!     handler(
//!         |msg| println!("{}: {:?}", msg.offset(), msg.value()),
//!         |err| eprintln!("subscription ended: {}", err),
//!     ),
//! )?;
//!
//! // Later, from any thread
//! sub.unsubscribe()?;
//! ```

mod manager;
mod types;
mod worker;

pub use manager::{Subscription, SubscriptionManager};
pub use types::{handler, FnHandler, MessageHandler, SubscriptionId, SubscriptionState};
