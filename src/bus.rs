//! # Topic-keyed event bus
//!
//! Publishers enqueue onto one bounded queue; a single dispatch task drains
//! it and calls every handler registered for the event's topic, in publish
//! order. Delivery order is therefore global FIFO across all topics.
//!
//! ```text
//! publish ──┐
//! publish ──┼──► [bounded queue] ──► dispatch task ──► handlers(topic)
//! publish ──┘
//! ```
//!
//! ## Rules
//! - `publish` waits only while the queue is full and gives up on cancellation.
//! - `publish_async` never waits; it spawns the publish.
//! - Handlers run on the dispatch task and must be quick; a slow handler
//!   delays every other topic.
//! - After [`EventBus::shutdown`] returns, no handler runs again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::BusError;
use crate::event::TestEvent;
use crate::test_model::RunSummary;
use crate::test_runner::RunRequest;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    TestEvent,
    TestFailed,
    RunStarted,
    RunFinished,
    Error,
}

/// Payload published on the bus; each variant belongs to one topic.
#[derive(Debug, Clone)]
pub enum BusEvent {
    TestEvent(TestEvent),
    TestFailed {
        package: String,
        test: String,
    },
    RunStarted {
        run_id: Uuid,
        request: RunRequest,
    },
    RunFinished {
        run_id: Uuid,
        summary: RunSummary,
        cancelled: bool,
    },
    Error {
        message: String,
    },
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::TestEvent(_) => Topic::TestEvent,
            BusEvent::TestFailed { .. } => Topic::TestFailed,
            BusEvent::RunStarted { .. } => Topic::RunStarted,
            BusEvent::RunFinished { .. } => Topic::RunFinished,
            BusEvent::Error { .. } => Topic::Error,
        }
    }
}

pub type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

type Handlers = Arc<RwLock<HashMap<Topic, Vec<Handler>>>>;

struct Inner {
    tx: mpsc::Sender<BusEvent>,
    handlers: Handlers,
    closed: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Ordered publish/subscribe bus. Cheap to clone.
///
/// Must be created inside a Tokio runtime; the dispatch task starts
/// immediately.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handlers: Handlers = Arc::default();
        let closed = CancellationToken::new();
        let worker = tokio::spawn(dispatch(rx, handlers.clone(), closed.clone()));

        Self {
            inner: Arc::new(Inner {
                tx,
                handlers,
                closed,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    /// Register `handler` for every later event on `topic`.
    pub fn subscribe<F>(&self, topic: Topic, handler: F)
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Enqueue `event`, waiting for room if the queue is full.
    pub async fn publish(
        &self,
        event: BusEvent,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        if self.inner.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BusError::Cancelled),
            _ = self.inner.closed.cancelled() => Err(BusError::Closed),
            sent = self.inner.tx.send(event) => sent.map_err(|_| BusError::Closed),
        }
    }

    /// Fire-and-forget publish.
    pub fn publish_async(&self, event: BusEvent, cancel: CancellationToken) {
        let bus = self.clone();
        tokio::spawn(async move {
            if let Err(err) = bus.publish(event, &cancel).await {
                debug!(error = %err, "async publish dropped");
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Stop the dispatch task and wait for it.
    ///
    /// A handler already running finishes; queued events are discarded.
    pub async fn shutdown(&self) {
        self.inner.closed.cancel();
        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                debug!(error = %err, "bus dispatch task ended abnormally");
            }
        }
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

async fn dispatch(mut rx: mpsc::Receiver<BusEvent>, handlers: Handlers, closed: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let topic = event.topic();
        let targets: Vec<Handler> = handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .cloned()
            .unwrap_or_default();
        trace!(?topic, handlers = targets.len(), "dispatching");

        for handler in targets {
            if closed.is_cancelled() {
                return;
            }
            handler(&event);
        }
    }
    debug!("bus dispatch stopped");
}
