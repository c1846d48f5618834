//! Coordination engine: task manager, reclaim sweep, queue processor and
//! session binding wired over one store and one broadcaster.

pub mod ingest;
pub mod reclaim;
pub mod sessions;
pub mod tasks;

pub use ingest::{BatchReport, ChannelFeed, Feed, FeedItem, IngestOutcome, PgmqFeed, QueueProcessor};
pub use reclaim::{ReclaimOutcome, ReclaimService, SweepReport};
pub use sessions::{ClientInfo, SessionBinding};
pub use tasks::{ClaimOutcome, TaskManager};

use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::Broadcaster;
use crate::clock::{Clock, SystemClock};
use crate::config::{ClaimConfig, Config, IngestConfig};
use crate::store::Store;

/// Engine knobs that do not belong to the HTTP or ingest layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub claim: ClaimConfig,
    pub session_ttl: Duration,
    pub observer_queue_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            claim: ClaimConfig::default(),
            session_ttl: Duration::from_secs(8 * 60 * 60),
            observer_queue_capacity: 256,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            claim: config.claim.clone(),
            session_ttl: config.session_ttl,
            observer_queue_capacity: config.observer_queue_capacity,
        }
    }
}

/// All services sharing one store, broadcaster and clock.
pub struct Engine<S> {
    pub store: Arc<S>,
    pub events: Arc<Broadcaster>,
    pub clock: Arc<dyn Clock>,
    pub tasks: TaskManager<S>,
    pub reclaim: ReclaimService<S>,
    pub sessions: SessionBinding<S>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
            tasks: self.tasks.clone(),
            reclaim: self.reclaim.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>, settings: EngineSettings) -> Self {
        Self::with_clock(store, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, settings: EngineSettings, clock: Arc<dyn Clock>) -> Self {
        let events = Arc::new(Broadcaster::with_clock(
            settings.observer_queue_capacity,
            Arc::clone(&clock),
        ));
        let tasks = TaskManager::new(
            Arc::clone(&store),
            Arc::clone(&events),
            Arc::clone(&clock),
            settings.claim.clone(),
        );
        let reclaim = ReclaimService::new(
            Arc::clone(&store),
            Arc::clone(&events),
            Arc::clone(&clock),
            settings.claim,
        );
        let sessions = SessionBinding::new(
            Arc::clone(&store),
            tasks.clone(),
            Arc::clone(&clock),
            settings.session_ttl,
        );
        Self {
            store,
            events,
            clock,
            tasks,
            reclaim,
            sessions,
        }
    }

    /// A queue processor feeding this engine's store and broadcaster.
    pub fn queue_processor<F: Feed>(&self, feed: Arc<F>, config: IngestConfig) -> QueueProcessor<S, F> {
        QueueProcessor::new(
            Arc::clone(&self.store),
            feed,
            Arc::clone(&self.events),
            Arc::clone(&self.clock),
            config,
        )
    }
}
