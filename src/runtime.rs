//! Wiring: open the configured backends, build the service and start the
//! background workers.

use crate::aggregation::AggregationConsumer;
use crate::config::TallyConfig;
use crate::error::Result;
use crate::event::{open_event_log, CounterEventProducer, EventLog};
use crate::flusher::AggregationFlusher;
use crate::kv::{open_store, KvStore};
use crate::replay::DisasterReplay;
use crate::service::CounterService;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared handles for one process.
pub struct Counters {
    pub config: TallyConfig,
    pub store: Arc<dyn KvStore>,
    pub log: Arc<dyn EventLog>,
    pub service: Arc<CounterService>,
}

impl Counters {
    pub fn open(config: TallyConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.store)?;
        let log = open_event_log(&config.store, &config.events)?;
        let service = Arc::new(CounterService::new(
            store.clone(),
            CounterEventProducer::new(log.clone()),
            &config.rebuild,
        ));
        info!(
            backend = ?config.store.backend,
            partitions = log.partitions(),
            "counter subsystem opened"
        );
        Ok(Self {
            config,
            store,
            log,
            service,
        })
    }

    pub fn flusher(&self) -> AggregationFlusher {
        AggregationFlusher::new(self.store.clone())
            .with_purge_interval(self.config.flusher.purge_interval())
    }

    pub fn aggregation_consumer(&self) -> AggregationConsumer {
        AggregationConsumer::new(self.store.clone(), self.log.clone(), &self.config.events)
    }

    pub fn replay(&self) -> DisasterReplay {
        DisasterReplay::new(
            self.store.clone(),
            self.log.clone(),
            &self.config.events,
            &self.config.replay,
        )
    }

    /// Start the aggregation consumer, the flusher (if enabled) and the
    /// replay worker (if enabled). Must be called inside a tokio runtime.
    pub fn start_workers(&self) -> Workers {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        handles.push(
            Arc::new(self.aggregation_consumer())
                .spawn(self.config.events.poll_interval(), shutdown_rx.clone()),
        );
        if self.config.flusher.enabled {
            handles.push(
                self.flusher()
                    .spawn(self.config.flusher.interval(), shutdown_rx.clone()),
            );
        }
        if self.config.replay.enabled {
            handles.push(
                Arc::new(self.replay())
                    .spawn(self.config.events.poll_interval(), shutdown_rx.clone()),
            );
        }

        Workers {
            shutdown: shutdown_tx,
            handles,
        }
    }
}

/// Running background tasks.
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every worker and wait for it to finish its current cycle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker ended abnormally");
            }
        }
        info!("counter workers stopped");
    }
}
