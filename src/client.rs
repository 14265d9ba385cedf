//! Client context tying the transport, publisher and subscriptions together.

use crate::classify::{classify, ErrorContext, Operation};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::options::{validate_stream_name, MessageOptions, Partitioner, StreamOptions, SubscriptionOptions};
use crate::publish::PublishCoordinator;
use crate::subscriptions::{MessageHandler, Subscription, SubscriptionManager};
use crate::transport::{Destination, Transport};
use crate::types::{Ack, PartitionTarget, StreamMetadata};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Pick a partition for `key` among `partitions`.
pub fn key_partition(key: &[u8], partitions: u32) -> u32 {
    crc32fast::hash(key) % partitions.max(1)
}

/// A client bound to one broker connection.
///
/// Owns the publish coordinator and the set of subscriptions opened through
/// it. The connection itself belongs to the [`Transport`]; closing the
/// client releases subscriptions but leaves the transport alone.
pub struct Client {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    publisher: PublishCoordinator,
    subscriptions: SubscriptionManager,
    /// Next round-robin partition per stream.
    round_robin: Mutex<HashMap<String, u32>>,
    closed: AtomicBool,
}

impl Client {
    /// Create a client with the default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::build(transport, ClientConfig::default())
    }

    /// Create a client with a custom configuration.
    pub fn with_config(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(transport, config))
    }

    fn build(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            subscriptions: SubscriptionManager::new(config.clone()),
            config,
            transport,
            publisher: PublishCoordinator::new(),
            round_robin: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // --- Administration ---

    /// Create a stream with default options.
    pub fn create_stream(&self, name: &str) -> Result<()> {
        self.create_stream_with(name, &StreamOptions::default())
    }

    /// Create a stream.
    pub fn create_stream_with(&self, name: &str, options: &StreamOptions) -> Result<()> {
        self.ensure_open()?;
        validate_stream_name(name)?;

        let context = ErrorContext::setup(Operation::CreateStream {
            stream: name.to_string(),
        });
        self.transport
            .create_stream(name, options)
            .map_err(|status| classify(&status, &context).error)?;

        info!(stream = name, partitions = options.partitions(), "stream created");
        Ok(())
    }

    pub fn delete_stream(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        validate_stream_name(name)?;

        let context = ErrorContext::setup(Operation::DeleteStream {
            stream: name.to_string(),
        });
        self.transport
            .delete_stream(name)
            .map_err(|status| classify(&status, &context).error)?;
        self.round_robin.lock().remove(name);

        info!(stream = name, "stream deleted");
        Ok(())
    }

    pub fn fetch_metadata(&self, name: &str) -> Result<StreamMetadata> {
        self.ensure_open()?;
        validate_stream_name(name)?;

        let context = ErrorContext::setup(Operation::Metadata {
            stream: name.to_string(),
        });
        self.transport
            .stream_metadata(name)
            .map_err(|status| classify(&status, &context).error)
    }

    // --- Publishing ---

    /// Publish `value` to `stream`.
    ///
    /// Blocks up to the ack deadline (the options' or the client default).
    /// Returns `Ok(None)` for fire-and-forget publishes. A
    /// [`ClientError::DeadlineExceeded`] doesn't mean the message wasn't
    /// appended; callers that retry should dedupe by key.
    pub fn publish(
        &self,
        stream: &str,
        value: impl Into<Vec<u8>>,
        options: &MessageOptions,
    ) -> Result<Option<Ack>> {
        self.ensure_open()?;
        validate_stream_name(stream)?;

        let partition = self.select_partition(stream, options)?;
        let destination = Destination::Partition(PartitionTarget::new(stream, partition));
        self.send(destination, value.into(), options)
    }

    /// Publish `value` to every stream bound to `subject`.
    ///
    /// Fails with [`ClientError::NoSuchStream`] if no stream is bound to it.
    /// The ack is for the first stream the broker appended to.
    pub fn publish_to_subject(
        &self,
        subject: &str,
        value: impl Into<Vec<u8>>,
        options: &MessageOptions,
    ) -> Result<Option<Ack>> {
        self.ensure_open()?;
        if subject.is_empty() {
            return Err(ClientError::InvalidArgument("subject is empty".into()));
        }
        self.send(Destination::Subject(subject.to_string()), value.into(), options)
    }

    fn send(
        &self,
        destination: Destination,
        value: Vec<u8>,
        options: &MessageOptions,
    ) -> Result<Option<Ack>> {
        let deadline = options
            .ack_deadline()
            .unwrap_or_else(|| self.config.default_ack_deadline());
        let request = self.publisher.request(destination, value, options);
        debug!(
            correlation_id = %request.correlation_id,
            destination = ?request.destination,
            ?deadline,
            "publishing"
        );
        self.publisher.publish(self.transport.as_ref(), request, deadline)
    }

    fn select_partition(&self, stream: &str, options: &MessageOptions) -> Result<u32> {
        if let Some(partition) = options.partition() {
            return Ok(partition);
        }

        match options.partitioner() {
            Partitioner::Fixed => Ok(0),
            Partitioner::Key => {
                let count = self.fetch_metadata(stream)?.partition_count();
                // Options guarantee a key when this partitioner is selected
                let key = options.key().unwrap_or_default();
                Ok(key_partition(key, count))
            }
            Partitioner::RoundRobin => {
                let count = self.fetch_metadata(stream)?.partition_count().max(1);
                let mut counters = self.round_robin.lock();
                let next = counters.entry(stream.to_string()).or_insert(0);
                let partition = *next % count;
                *next = (partition + 1) % count;
                Ok(partition)
            }
        }
    }

    // --- Subscribing ---

    /// Subscribe to one partition of `stream`.
    ///
    /// Returns once the broker has opened the stream; see
    /// [`SubscriptionManager::subscribe`] for the error contract.
    pub fn subscribe(
        &self,
        stream: &str,
        options: &SubscriptionOptions,
        handler: impl MessageHandler,
    ) -> Result<Subscription> {
        self.ensure_open()?;
        self.subscriptions
            .subscribe(&self.transport, stream, options, Box::new(handler))
    }

    /// Number of subscriptions still open.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.active_count()
    }

    // --- Lifecycle ---

    /// Unsubscribe everything and reject further calls. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.subscriptions.unsubscribe_all();
        info!("client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBroker;
    use proptest::prelude::*;

    fn client() -> Client {
        Client::new(Arc::new(LocalBroker::default()))
    }

    #[test]
    fn test_round_robin_cycles() {
        let client = client();
        let opts = StreamOptions::builder().partitions(3).build().unwrap();
        client.create_stream_with("orders", &opts).unwrap();

        let msg_opts = MessageOptions::builder()
            .partitioner(Partitioner::RoundRobin)
            .build()
            .unwrap();
        let partitions: Vec<u32> = (0..6)
            .map(|_| client.publish("orders", b"x".to_vec(), &msg_opts).unwrap().unwrap().partition)
            .collect();
        assert_eq!(partitions, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_key_partition_is_stable() {
        let client = client();
        let opts = StreamOptions::builder().partitions(4).build().unwrap();
        client.create_stream_with("orders", &opts).unwrap();

        let msg_opts = MessageOptions::builder()
            .partitioner(Partitioner::Key)
            .key(b"customer-17".to_vec())
            .build()
            .unwrap();
        let first = client.publish("orders", b"a".to_vec(), &msg_opts).unwrap().unwrap();
        let second = client.publish("orders", b"b".to_vec(), &msg_opts).unwrap().unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(first.partition, key_partition(b"customer-17", 4));
    }

    #[test]
    fn test_closed_client_rejects_calls() {
        let client = client();
        client.create_stream("orders").unwrap();
        client.close();
        client.close();

        let result = client.publish("orders", b"x".to_vec(), &MessageOptions::default());
        assert!(matches!(result, Err(ClientError::Closed)));
        assert!(matches!(client.create_stream("other"), Err(ClientError::Closed)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig {
            delivery_queue_depth: 0,
            ..Default::default()
        };
        let result = Client::with_config(Arc::new(LocalBroker::default()), config);
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    proptest! {
        #[test]
        fn prop_key_partition_in_range(key in proptest::collection::vec(any::<u8>(), 0..32), partitions in 1u32..64) {
            prop_assert!(key_partition(&key, partitions) < partitions);
        }
    }
}
