//! In-process partitioned event bus.
//!
//! - One topic per stream name, each with a fixed number of lanes
//! - Every lane is a bounded channel consumed by exactly one task
//! - Events are routed to a lane by a seeded hash of their stream identity,
//!   so the events of one stream are handled in publish order
//! - Handler failures go to an [`ErrorObserver`], never back to the publisher

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::bus::{
    DispatchError, ErrorObserver, EventHandler, PublishError, Publisher, TracingObserver,
};
use crate::context::Context;
use crate::event::Event;
use crate::hash;

pub const MAX_PARTITIONS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Lanes per topic (1..=1024).
    pub partitions: usize,
    /// Buffered events per lane before `publish` waits.
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            partitions: 32,
            capacity: 1,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), BusError> {
        if self.partitions == 0 || self.partitions > MAX_PARTITIONS {
            return Err(BusError::InvalidPartitions(self.partitions));
        }
        if self.capacity == 0 {
            return Err(BusError::InvalidCapacity(self.capacity));
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("partitions must be between 1 and {MAX_PARTITIONS}, got {0}")]
    InvalidPartitions(usize),

    #[error("lane capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),

    #[error("bus is already listening")]
    AlreadyListening,

    #[error("bus is closed")]
    Closed,
}

type Handlers = Arc<RwLock<Vec<Arc<dyn EventHandler>>>>;

struct Topic {
    lanes: Vec<mpsc::Sender<Event>>,
    receivers: Mutex<Option<Vec<mpsc::Receiver<Event>>>>,
    handlers: Handlers,
}

impl Topic {
    fn new(config: &BusConfig) -> Self {
        let (lanes, receivers): (Vec<_>, Vec<_>) = (0..config.partitions)
            .map(|_| mpsc::channel(config.capacity))
            .unzip();
        Self {
            lanes,
            receivers: Mutex::new(Some(receivers)),
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

/// Partitioned in-process bus.
///
/// ## Lifecycle
///
/// 1. [`subscribe`](PartitionedBus::subscribe) handlers per stream name
/// 2. [`listen`](PartitionedBus::listen) until the context is cancelled or
///    the bus is closed (spawns one task per lane and waits for all of them)
/// 3. [`close`](PartitionedBus::close) stops accepting events, lets every lane
///    drain what it has buffered and waits for `listen` to return
///
/// Events published before `listen` starts stay buffered; once a lane is full
/// `publish` waits until a worker frees a slot. Buffered events are always
/// dispatched, by the lane workers or by `close` when `listen` never ran.
pub struct PartitionedBus {
    config: BusConfig,
    seed: u32,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    observer: Arc<dyn ErrorObserver>,
    started: AtomicBool,
    listening: AtomicBool,
    shutdown: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
}

impl PartitionedBus {
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        Ok(Self {
            config,
            seed: hash::seed(),
            topics: RwLock::new(HashMap::new()),
            observer: Arc::new(TracingObserver),
            started: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            shutdown: watch::Sender::new(false),
            stopped: watch::Sender::new(false),
        })
    }

    pub fn with_observer(mut self, observer: impl ErrorObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn config(&self) -> BusConfig {
        self.config
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Register handlers for the stream name `topic`.
    ///
    /// New topics can only be created before `listen`; handlers can be
    /// appended to an existing topic at any time.
    pub fn subscribe<I>(&self, topic: impl Into<String>, handlers: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = Arc<dyn EventHandler>>,
    {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let topic = topic.into();
        let mut topics = self.topics.write().unwrap_or_else(|p| p.into_inner());
        let entry = match topics.get(&topic) {
            Some(existing) => existing.clone(),
            None => {
                if self.is_listening() {
                    return Err(BusError::AlreadyListening);
                }
                let created = Arc::new(Topic::new(&self.config));
                topics.insert(topic.clone(), created.clone());
                created
            }
        };
        drop(topics);

        let mut registered = entry.handlers.write().unwrap_or_else(|p| p.into_inner());
        registered.extend(handlers);
        tracing::debug!(topic = %topic, handlers = registered.len(), "subscribed");
        Ok(())
    }

    /// Run one worker per lane until the context is cancelled or the bus is closed.
    ///
    /// Returns once every lane has drained its buffered events.
    pub async fn listen(&self, ctx: &Context) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            // A racing `close` may have claimed the lanes first.
            if self.is_closed() {
                return Err(BusError::Closed);
            }
            return Err(BusError::AlreadyListening);
        }
        self.listening.store(true, Ordering::SeqCst);

        let topics = self.snapshot_topics();

        let mut workers = JoinSet::new();
        for lane in self.take_lanes(&topics) {
            workers.spawn(run_lane(lane, ctx.clone(), self.shutdown.subscribe()));
        }
        tracing::info!(
            topics = topics.len(),
            partitions = self.config.partitions,
            lanes = workers.len(),
            "event bus listening"
        );

        if workers.is_empty() {
            let mut shutdown = self.shutdown.subscribe();
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => {}
                _ = ctx.cancelled() => {}
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "event bus lane terminated abnormally");
            }
        }

        tracing::info!("event bus stopped");
        self.stopped.send_replace(true);
        Ok(())
    }

    /// Stop accepting events and wait until every buffered event is handled.
    ///
    /// If `listen` was never started the buffered events are dispatched here,
    /// on the caller's task.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        if self.started.swap(true, Ordering::SeqCst) {
            let mut stopped = self.stopped.subscribe();
            let _ = stopped.wait_for(|done| *done).await;
            return;
        }

        let topics = self.snapshot_topics();
        let mut drained = 0usize;
        for mut lane in self.take_lanes(&topics) {
            drain(&mut lane).await;
            drained += 1;
        }
        tracing::info!(lanes = drained, "event bus closed before listening");
        self.stopped.send_replace(true);
    }

    fn snapshot_topics(&self) -> Vec<(String, Arc<Topic>)> {
        self.topics
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(name, topic)| (name.clone(), topic.clone()))
            .collect()
    }

    /// Hand out every lane receiver exactly once.
    fn take_lanes(&self, topics: &[(String, Arc<Topic>)]) -> Vec<Lane> {
        let mut lanes = Vec::new();
        for (name, topic) in topics {
            let receivers = topic
                .receivers
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take()
                .unwrap_or_default();
            lanes.extend(receivers.into_iter().enumerate().map(|(index, rx)| Lane {
                topic: name.clone(),
                index,
                rx,
                handlers: topic.handlers.clone(),
                observer: self.observer.clone(),
            }));
        }
        lanes
    }

    fn lane_for(&self, event: &Event) -> Result<mpsc::Sender<Event>, PublishError> {
        let topics = self.topics.read().unwrap_or_else(|p| p.into_inner());
        let topic = topics
            .get(event.stream_name())
            .ok_or_else(|| PublishError::TopicNotFound(event.stream_name().to_string()))?;
        let lane = hash::partition(self.seed, event.routing_key().as_bytes(), topic.lanes.len());
        Ok(topic.lanes[lane].clone())
    }
}

impl core::fmt::Debug for PartitionedBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PartitionedBus")
            .field("config", &self.config)
            .field("listening", &self.is_listening())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Publisher for PartitionedBus {
    async fn publish(&self, ctx: &Context, events: &[Event]) -> Result<(), PublishError> {
        for event in events {
            if self.is_closed() {
                return Err(PublishError::Closed);
            }
            let lane = self.lane_for(event)?;
            let mut shutdown = self.shutdown.subscribe();
            tokio::select! {
                biased;
                sent = lane.send(event.clone()) => sent.map_err(|_| PublishError::Closed)?,
                _ = shutdown.wait_for(|closed| *closed) => return Err(PublishError::Closed),
                _ = ctx.cancelled() => return Err(PublishError::Cancelled),
            }
        }
        Ok(())
    }
}

struct Lane {
    topic: String,
    index: usize,
    rx: mpsc::Receiver<Event>,
    handlers: Handlers,
    observer: Arc<dyn ErrorObserver>,
}

async fn run_lane(mut lane: Lane, ctx: Context, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => break,
            _ = ctx.cancelled() => break,
            received = lane.rx.recv() => match received {
                Some(event) => dispatch(&lane, &ctx, &event).await,
                None => break,
            },
        }
    }
    drain(&mut lane).await;
}

/// Close the lane and dispatch whatever it still buffers.
///
/// Drained events run under a fresh context: the listen context may already
/// be cancelled, and handlers must still see them through.
async fn drain(lane: &mut Lane) {
    lane.rx.close();
    let ctx = Context::background();
    let mut drained = 0usize;
    while let Some(event) = lane.rx.recv().await {
        dispatch(lane, &ctx, &event).await;
        drained += 1;
    }
    tracing::debug!(topic = %lane.topic, lane = lane.index, drained, "lane drained");
}

/// Run matching handlers in registration order; on the first failure roll
/// back the ones that ran (the failed one included) in reverse order.
async fn dispatch(lane: &Lane, ctx: &Context, event: &Event) {
    let handlers: Vec<Arc<dyn EventHandler>> = lane
        .handlers
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .clone();
    let matching: Vec<(usize, &Arc<dyn EventHandler>)> = handlers
        .iter()
        .enumerate()
        .filter(|(_, handler)| handler.matches(event))
        .collect();

    for (pos, (index, handler)) in matching.iter().enumerate() {
        let Err(source) = handler.handle(ctx, event).await else {
            continue;
        };
        lane.observer.observe(DispatchError::Handler {
            index: *index,
            event: event.to_string(),
            source,
        });
        for (index, handler) in matching[..=pos].iter().rev() {
            if let Err(source) = handler.rollback(ctx, event).await {
                lane.observer.observe(DispatchError::Rollback {
                    index: *index,
                    event: event.to_string(),
                    source,
                });
            }
        }
        return;
    }
}
