//! # Tributary
//!
//! A publish/subscribe client for partitioned, offset-addressable log
//! brokers.
//!
//! ## Core Concepts
//!
//! - **Streams**: Named logs, split into partitions, optionally bound to a subject
//! - **Publishing**: Append a message and wait, up to a deadline, for its ack
//! - **Subscriptions**: Ordered, gap-free delivery of one partition to a handler,
//!   starting from the earliest, latest, an offset, a time, or new messages only
//! - **Transport**: The broker connection, supplied by the caller
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tributary::{handler, Client, LocalBroker, MessageOptions, SubscriptionOptions};
//!
//! let client = Client::new(Arc::new(LocalBroker::default()));
//! client.create_stream("orders")?;
//!
//! let opts = MessageOptions::builder()
//!     .ack_deadline(Duration::from_secs(1))
//!     .build()?;
//! let ack = client.publish("orders", b"hello".to_vec(), &opts)?;
//!
//! let sub = client.subscribe(
//!     "orders",
//!     &SubscriptionOptions::builder().start_at_earliest().build()?,
//!     handler(|msg| println!("{:?}", msg.value()), |err| eprintln!("{}", err)),
//! )?;
//! sub.unsubscribe()?;
//! ```

pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod options;
pub mod position;
pub mod publish;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Re-exports
pub use client::{key_partition, Client};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use options::{
    MessageOptions, Partitioner, StartPosition, StreamOptions, SubscriptionOptions,
};
pub use publish::{AckSink, PublishCoordinator};
pub use subscriptions::{
    handler, FnHandler, MessageHandler, Subscription, SubscriptionId, SubscriptionManager,
    SubscriptionState,
};
pub use transport::{
    BrokerConfig, BrokerStatus, EnvelopeStream, LocalBroker, MissingResource, PublishRequest,
    ResumeToken, StatusCode, Transport,
};
pub use types::*;
