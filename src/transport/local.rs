//! In-process broker.
//!
//! A single-node, memory-only [`Transport`] with the broker-side semantics
//! the client relies on: broker-assigned offsets, per-partition ordering,
//! blocking tail reads, acks sent by a dispatcher thread after a
//! configurable latency, and hooks for injecting failures (retention
//! truncation, reader disconnects, corrupt frames).

use super::envelope::{self, EnvelopeBody};
use super::{
    AckSink, BrokerStatus, Destination, EnvelopeStream, PublishRequest, ResumeToken, StatusCode,
    Transport, TransportResult,
};
use crate::options::StreamOptions;
use crate::types::{Ack, AckPolicy, PartitionMetadata, PartitionTarget, StreamMetadata, Timestamp};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Local broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Delay between appending a message and sending its ack.
    pub ack_latency: Duration,

    /// Largest replication factor a stream may ask for (cluster size).
    pub max_replication_factor: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ack_latency: Duration::ZERO,
            max_replication_factor: 1,
        }
    }
}

/// Retained frames of one partition.
struct PartitionLog {
    /// Offset of `frames[0]`.
    log_start: u64,
    frames: VecDeque<Vec<u8>>,
    timestamps: VecDeque<Timestamp>,
    deleted: bool,
    /// Bumped to reset every open reader.
    epoch: u64,
}

impl PartitionLog {
    fn next_offset(&self) -> u64 {
        self.log_start + self.frames.len() as u64
    }

    fn push(&mut self, frame: Vec<u8>, timestamp: Timestamp) {
        self.frames.push_back(frame);
        self.timestamps.push_back(timestamp);
    }
}

struct Partition {
    id: u32,
    log: Mutex<PartitionLog>,
    appended: Condvar,
}

impl Partition {
    fn new(id: u32) -> Self {
        Self {
            id,
            log: Mutex::new(PartitionLog {
                log_start: 0,
                frames: VecDeque::new(),
                timestamps: VecDeque::new(),
                deleted: false,
                epoch: 0,
            }),
            appended: Condvar::new(),
        }
    }

    fn metadata(&self) -> PartitionMetadata {
        let log = self.log.lock();
        PartitionMetadata {
            id: self.id,
            log_start: log.log_start,
            next_offset: log.next_offset(),
        }
    }

    /// Append a message, returning its offset.
    fn append(&self, request: &PublishRequest, subject: Option<&str>) -> TransportResult<u64> {
        let mut log = self.log.lock();
        let offset = log.next_offset();
        let timestamp = Timestamp::now();

        let body = EnvelopeBody {
            offset,
            timestamp,
            key: request.key.clone(),
            value: request.value.clone(),
            headers: request.headers.clone(),
            subject: subject.map(str::to_string),
            correlation_id: Some(request.correlation_id),
        };
        let frame = envelope::encode(&body)
            .map_err(|e| BrokerStatus::new(StatusCode::Internal, e.to_string()))?;

        log.push(frame, timestamp);
        self.appended.notify_all();
        Ok(offset)
    }
}

struct StreamState {
    options: StreamOptions,
    partitions: Vec<Arc<Partition>>,
}

impl StreamState {
    fn metadata(&self, name: &str) -> StreamMetadata {
        StreamMetadata {
            name: name.to_string(),
            subject: self.options.subject().map(str::to_string),
            group: self.options.group().map(str::to_string),
            replication_factor: self.options.replication_factor(),
            partitions: self.partitions.iter().map(|p| p.metadata()).collect(),
        }
    }
}

/// An ack waiting for its send time.
struct DelayedAck {
    due: Instant,
    sink: AckSink,
    ack: Ack,
}

/// In-process broker implementing [`Transport`].
pub struct LocalBroker {
    config: RwLock<BrokerConfig>,
    streams: RwLock<HashMap<String, StreamState>>,
    /// Feeds the ack dispatcher thread; it exits when this is dropped.
    delayed_acks: Sender<DelayedAck>,
}

impl LocalBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let (sender, receiver) = unbounded();
        thread::Builder::new()
            .name("local-broker-acks".into())
            .spawn(move || dispatch_acks(receiver))
            .ok();

        Self {
            config: RwLock::new(config),
            streams: RwLock::new(HashMap::new()),
            delayed_acks: sender,
        }
    }

    /// Change the ack latency for subsequent publishes.
    pub fn set_ack_latency(&self, latency: Duration) {
        self.config.write().ack_latency = latency;
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Drop every message below `offset`, as retention would.
    pub fn truncate_before(&self, stream: &str, partition: u32, offset: u64) -> TransportResult<()> {
        let partition = self.partition(stream, partition)?;
        let mut log = partition.log.lock();
        while log.log_start < offset && !log.frames.is_empty() {
            log.frames.pop_front();
            log.timestamps.pop_front();
            log.log_start += 1;
        }
        debug!(stream, log_start = log.log_start, "truncated partition");
        Ok(())
    }

    /// Reset every reader currently open on the partition.
    pub fn disconnect_readers(&self, stream: &str, partition: u32) -> TransportResult<()> {
        let partition = self.partition(stream, partition)?;
        partition.log.lock().epoch += 1;
        partition.appended.notify_all();
        Ok(())
    }

    /// Append a raw frame without encoding it, returning the offset it took.
    pub fn append_raw(&self, stream: &str, partition: u32, frame: Vec<u8>) -> TransportResult<u64> {
        let partition = self.partition(stream, partition)?;
        let mut log = partition.log.lock();
        let offset = log.next_offset();
        log.push(frame, Timestamp::now());
        partition.appended.notify_all();
        Ok(offset)
    }

    fn partition(&self, stream: &str, partition: u32) -> TransportResult<Arc<Partition>> {
        let streams = self.streams.read();
        let state = streams
            .get(stream)
            .ok_or_else(|| BrokerStatus::no_such_stream(stream))?;
        state
            .partitions
            .get(partition as usize)
            .cloned()
            .ok_or_else(|| BrokerStatus::no_such_partition(stream, partition))
    }

    fn complete(&self, sink: AckSink, ack: Ack) {
        let latency = self.config.read().ack_latency;
        if latency.is_zero() {
            sink.ack(ack);
            return;
        }
        let delayed = DelayedAck {
            due: Instant::now() + latency,
            sink,
            ack,
        };
        if let Err(e) = self.delayed_acks.send(delayed) {
            // Dispatcher is gone; ack inline rather than never
            let delayed = e.into_inner();
            delayed.sink.ack(delayed.ack);
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

fn dispatch_acks(receiver: Receiver<DelayedAck>) {
    for delayed in receiver.iter() {
        let now = Instant::now();
        if delayed.due > now {
            thread::sleep(delayed.due - now);
        }
        delayed.sink.ack(delayed.ack);
    }
}

impl Transport for LocalBroker {
    fn create_stream(&self, name: &str, options: &StreamOptions) -> TransportResult<()> {
        let max_rf = self.config.read().max_replication_factor;
        if options.replication_factor() > max_rf {
            return Err(BrokerStatus::new(
                StatusCode::InvalidArgument,
                format!(
                    "replication factor {} exceeds cluster size {}",
                    options.replication_factor(),
                    max_rf
                ),
            ));
        }

        let mut streams = self.streams.write();
        if streams.contains_key(name) {
            return Err(BrokerStatus::new(
                StatusCode::AlreadyExists,
                format!("stream already exists: {}", name),
            ));
        }

        let partitions = (0..options.partitions())
            .map(|id| Arc::new(Partition::new(id)))
            .collect();
        streams.insert(
            name.to_string(),
            StreamState {
                options: options.clone(),
                partitions,
            },
        );
        debug!(stream = name, partitions = options.partitions(), "created stream");
        Ok(())
    }

    fn delete_stream(&self, name: &str) -> TransportResult<()> {
        let state = self
            .streams
            .write()
            .remove(name)
            .ok_or_else(|| BrokerStatus::no_such_stream(name))?;

        // Wake tailing readers so they observe the deletion
        for partition in &state.partitions {
            partition.log.lock().deleted = true;
            partition.appended.notify_all();
        }
        debug!(stream = name, "deleted stream");
        Ok(())
    }

    fn stream_metadata(&self, name: &str) -> TransportResult<StreamMetadata> {
        self.streams
            .read()
            .get(name)
            .map(|state| state.metadata(name))
            .ok_or_else(|| BrokerStatus::no_such_stream(name))
    }

    fn send(&self, request: PublishRequest, acks: AckSink) -> TransportResult<()> {
        let (targets, subject) = match &request.destination {
            Destination::Partition(target) => (
                vec![(target.clone(), self.partition(&target.stream, target.partition)?)],
                None,
            ),
            Destination::Subject(subject) => {
                let streams = self.streams.read();
                let bound: Vec<_> = streams
                    .iter()
                    .filter(|(_, state)| state.options.subject() == Some(subject.as_str()))
                    .map(|(name, state)| {
                        (PartitionTarget::new(name.clone(), 0), Arc::clone(&state.partitions[0]))
                    })
                    .collect();
                if bound.is_empty() {
                    return Err(BrokerStatus::not_found(format!(
                        "no stream bound to subject: {}",
                        subject
                    )));
                }
                (bound, Some(subject.clone()))
            }
        };

        let mut first: Option<(PartitionTarget, u64)> = None;
        for (target, partition) in targets {
            let offset = partition.append(&request, subject.as_deref())?;
            first.get_or_insert((target, offset));
        }

        if request.ack_policy == AckPolicy::None {
            return Ok(());
        }
        if let Some((target, offset)) = first {
            let ack = Ack {
                stream: target.stream,
                partition: target.partition,
                offset,
                correlation_id: request.correlation_id,
                ack_policy: request.ack_policy,
                committed_at: Timestamp::now(),
            };
            self.complete(acks, ack);
        }
        Ok(())
    }

    fn open_stream(
        &self,
        target: &PartitionTarget,
        token: ResumeToken,
    ) -> TransportResult<Box<dyn EnvelopeStream>> {
        let partition = self.partition(&target.stream, target.partition)?;

        let (start, epoch) = {
            let log = partition.log.lock();
            let start = match token {
                ResumeToken::Earliest => log.log_start,
                ResumeToken::Latest | ResumeToken::NewOnly => log.next_offset(),
                ResumeToken::Offset(offset) => {
                    if offset < log.log_start {
                        return Err(BrokerStatus::new(
                            StatusCode::OutOfRange,
                            format!("offset {} precedes log start {}", offset, log.log_start),
                        ));
                    }
                    offset
                }
                ResumeToken::Timestamp(ts) => log
                    .timestamps
                    .iter()
                    .position(|t| *t >= ts)
                    .map(|i| log.log_start + i as u64)
                    .unwrap_or_else(|| log.next_offset()),
            };
            (start, log.epoch)
        };

        debug!(partition = %target, start, "opened partition stream");
        Ok(Box::new(LocalStream {
            partition,
            start,
            next: start,
            epoch,
        }))
    }
}

/// Tailing reader over one partition.
struct LocalStream {
    partition: Arc<Partition>,
    start: u64,
    next: u64,
    epoch: u64,
}

impl EnvelopeStream for LocalStream {
    fn start_offset(&self) -> u64 {
        self.start
    }

    fn next(&mut self, timeout: Duration) -> TransportResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut log = self.partition.log.lock();

        loop {
            if log.deleted {
                return Err(BrokerStatus::not_found("partition deleted"));
            }
            if log.epoch != self.epoch {
                return Err(BrokerStatus::unavailable("connection reset by broker"));
            }
            if self.next < log.log_start {
                return Err(BrokerStatus::new(
                    StatusCode::OutOfRange,
                    format!("offset {} truncated by retention", self.next),
                ));
            }

            let index = (self.next - log.log_start) as usize;
            if let Some(frame) = log.frames.get(index) {
                self.next += 1;
                return Ok(Some(frame.clone()));
            }

            if self.partition.appended.wait_until(&mut log, deadline).timed_out() {
                return Ok(None);
            }
        }
    }
}
