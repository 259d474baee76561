//! Partitioned worker pool
//!
//! `put` hashes a message onto one of `partitions` bounded queues
//! (`key % partitions`). Each queue is drained by a single worker task, which
//! is what gives same-key messages their ordering guarantee.

use crate::message::Message;
use crate::router::{Handler, Router};
use crate::{DispatchError, Result};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PARTITIONS: usize = 8;
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of partitions, each drained by one dedicated worker
    pub partitions: usize,
    /// Capacity of each partition queue
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(DispatchError::InvalidConfig(
                "partitions must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(DispatchError::InvalidConfig(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partition index for `key`. `partitions` must be non-zero.
pub fn partition(key: u64, partitions: usize) -> usize {
    (key % partitions as u64) as usize
}

enum Phase {
    /// Accepting handler registrations; queues buffer until workers exist
    Idle {
        router: Router,
        queues: Vec<mpsc::Receiver<Message>>,
    },
    Running {
        workers: Vec<JoinHandle<()>>,
    },
    Stopped,
}

/// Routes messages to handlers on a fixed pool of partition workers
pub struct Dispatcher {
    config: DispatcherConfig,
    senders: Vec<mpsc::Sender<Message>>,
    phase: Mutex<Phase>,
    stop: CancellationToken,
    stopped: AtomicBool,
    active: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Create a dispatcher. Invalid configuration is rejected here.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        let (senders, queues): (Vec<_>, Vec<_>) = (0..config.partitions)
            .map(|_| mpsc::channel(config.queue_capacity))
            .unzip();

        Ok(Self {
            config,
            senders,
            phase: Mutex::new(Phase::Idle {
                router: Router::new(),
                queues,
            }),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Register a handler for messages named `name`.
    ///
    /// Only allowed before [`start`](Self::start); duplicate names fail.
    pub fn handle<H: Handler + 'static>(&self, name: impl Into<String>, handler: H) -> Result<()> {
        self.handle_arc(name, Arc::new(handler))
    }

    pub fn handle_arc(&self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Result<()> {
        match &mut *self.phase.lock() {
            Phase::Idle { router, .. } => router.register_arc(name, handler),
            Phase::Running { .. } => Err(DispatchError::AlreadyStarted),
            Phase::Stopped => Err(DispatchError::Stopped),
        }
    }

    /// Spawn one worker per partition. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        let (router, queues) = match std::mem::replace(&mut *phase, Phase::Stopped) {
            Phase::Idle { router, queues } => (router, queues),
            Phase::Running { workers } => {
                *phase = Phase::Running { workers };
                return Err(DispatchError::AlreadyStarted);
            }
            Phase::Stopped => return Err(DispatchError::Stopped),
        };

        let router = Arc::new(router);
        let workers = queues
            .into_iter()
            .enumerate()
            .map(|(index, queue)| {
                tokio::spawn(pump(
                    index,
                    queue,
                    Arc::clone(&router),
                    self.stop.clone(),
                    ActiveWorker::enter(&self.active),
                ))
            })
            .collect();
        *phase = Phase::Running { workers };

        info!(
            partitions = self.senders.len(),
            handlers = router.len(),
            "Dispatcher started"
        );
        Ok(())
    }

    /// Signal every worker to exit after its in-flight message and wait for
    /// them. Messages still queued are abandoned. Calling `stop` again is a
    /// no-op.
    pub async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::Release);
        self.stop.cancel();

        let previous = {
            let mut phase = self.phase.lock();
            std::mem::replace(&mut *phase, Phase::Stopped)
        };

        match previous {
            Phase::Running { workers } => {
                for (index, worker) in workers.into_iter().enumerate() {
                    if let Err(e) = worker.await {
                        error!(partition = index, "Dispatcher worker failed: {}", e);
                    }
                }
                info!("Dispatcher stopped");
            }
            Phase::Idle { queues, .. } => {
                let abandoned: usize = queues.iter().map(|queue| queue.len()).sum();
                info!(abandoned, "Dispatcher stopped before start");
            }
            Phase::Stopped => {}
        }
        Ok(())
    }

    /// Queue a message on its partition without waiting
    pub fn put(&self, msg: Message) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(DispatchError::Stopped);
        }

        let index = self.partition_for(msg.key());
        match self.senders[index].try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull { partition: index }),
            Err(TrySendError::Closed(_)) => Err(DispatchError::Stopped),
        }
    }

    pub fn partition_for(&self, key: u64) -> usize {
        partition(key, self.senders.len())
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    pub fn is_running(&self) -> bool {
        !self.is_stopped() && matches!(*self.phase.lock(), Phase::Running { .. })
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Workers that have not yet exited
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Messages waiting across all partitions
    pub fn queued(&self) -> usize {
        self.senders
            .iter()
            .map(|tx| self.config.queue_capacity.saturating_sub(tx.capacity()))
            .sum()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .field("active_workers", &self.active_workers())
            .finish()
    }
}

/// Counts a live worker until dropped
struct ActiveWorker(Arc<AtomicUsize>);

impl ActiveWorker {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn pump(
    index: usize,
    mut queue: mpsc::Receiver<Message>,
    router: Arc<Router>,
    stop: CancellationToken,
    _active: ActiveWorker,
) {
    debug!(partition = index, "Dispatcher worker started");

    loop {
        let msg = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let key = msg.key();
        dispatch(index, &router, msg).await;
        debug!(partition = index, key, "Handled message");
    }

    queue.close();
    let mut abandoned = 0usize;
    while queue.try_recv().is_ok() {
        abandoned += 1;
    }
    debug!(partition = index, abandoned, "Dispatcher worker exited");
}

async fn dispatch(index: usize, router: &Router, msg: Message) {
    let Some(handler) = router.fetch(msg.name()) else {
        warn!(
            partition = index,
            name = msg.name(),
            key = msg.key(),
            "No handler registered, dropping message"
        );
        return;
    };

    let name = msg.name().to_string();
    if let Err(panic) = AssertUnwindSafe(handler.handle(msg)).catch_unwind().await {
        error!(
            partition = index,
            name = %name,
            "Handler panicked: {}",
            panic_message(panic.as_ref())
        );
    }
}

/// Best-effort text of a caught panic payload
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
