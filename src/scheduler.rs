//! Periodic runner for every stored definition
//!
//! Each tick enumerates the definitions (cache first, store as the source of
//! truth), runs them one after another and persists one report per run.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attack::Attacker;
use crate::cache::IndexCache;
use crate::config::TimerConfig;
use crate::error::StoreError;
use crate::models::{Record, RecordId, RunReport};
use crate::report::render_text;
use crate::store::{Storage, select_every};

/// Page size used when listing the whole store
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Where a tick's definitions came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Source {
    #[default]
    Cache,
    Store,
}

/// What happened during one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Definitions enumerated
    pub definitions: usize,
    pub source: Source,
    /// Runs that produced a report
    pub completed: usize,
    /// Definitions that failed to decode or validate
    pub skipped: usize,
    /// Runs the engine refused to start
    pub failed: usize,
    pub persisted: usize,
    /// Set when the tick was cut short by shutdown
    pub cancelled: bool,
}

pub struct Scheduler {
    store: Arc<dyn Storage>,
    cache: IndexCache,
    attacker: Arc<Attacker>,
    timer: TimerConfig,
    cancel: CancellationToken,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Storage>,
        cache: IndexCache,
        attacker: Arc<Attacker>,
        timer: TimerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            store,
            cache,
            attacker,
            timer,
            cancel,
            state,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Ask the loop to stop; the in-flight run is cancelled
    pub fn stop(&self) {
        self.transition(SchedulerState::Stopping);
        self.cancel.cancel();
    }

    fn transition(&self, next: SchedulerState) {
        self.state.send_if_modified(|current| {
            let allowed = match (*current, next) {
                (SchedulerState::Idle, SchedulerState::Running) => true,
                (SchedulerState::Idle | SchedulerState::Running, SchedulerState::Stopping) => true,
                (SchedulerState::Stopping, SchedulerState::Stopped) => true,
                _ => false,
            };
            if allowed {
                info!(from = ?*current, to = ?next, "Scheduler state changed");
                *current = next;
            }
            allowed
        });
    }

    /// Tick until cancelled
    ///
    /// The first tick fires after the startup delay. A tick in progress when
    /// cancellation arrives is wound down, its partial report still persisted.
    pub async fn run(&self) {
        match self.state() {
            SchedulerState::Idle => {}
            // Stopped before it ever ran
            SchedulerState::Stopping => {
                self.transition(SchedulerState::Stopped);
                return;
            }
            state => {
                warn!(state = ?state, "Scheduler already started");
                return;
            }
        }
        self.transition(SchedulerState::Running);
        info!(
            interval = ?self.timer.interval,
            startup_delay = ?self.timer.startup_delay,
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.timer.startup_delay,
            self.timer.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let tick = self.tick();
            tokio::pin!(tick);
            let outcome = tokio::select! {
                outcome = &mut tick => outcome,
                _ = self.cancel.cancelled() => {
                    self.transition(SchedulerState::Stopping);
                    tick.await
                }
            };

            if let Err(e) = outcome {
                error!("Tick aborted, retrying next interval: {}", e);
            }
        }

        self.transition(SchedulerState::Stopping);
        self.transition(SchedulerState::Stopped);
    }

    /// Run every stored definition once
    ///
    /// Fails only when the definitions cannot be enumerated. Per definition
    /// problems are logged and counted in the summary.
    pub async fn tick(&self) -> Result<TickSummary, StoreError> {
        let started = Instant::now();
        let (records, source) = self.enumerate()?;
        let mut summary = TickSummary {
            definitions: records.len(),
            source,
            ..TickSummary::default()
        };
        info!(event = "tick_started", definitions = records.len(), source = ?source, "Tick started");

        for record in &records {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let attack = match record.definition().and_then(|d| d.validate()) {
                Ok(attack) => attack,
                Err(e) => {
                    warn!(id = record.id, name = %record.name, "Skipping definition: {}", e);
                    summary.skipped += 1;
                    continue;
                }
            };

            let report = match self.attacker.run(&attack, &self.cancel.child_token()).await {
                Ok(report) => report,
                Err(e) => {
                    error!(id = record.id, name = %record.name, "Run failed: {}", e);
                    summary.failed += 1;
                    continue;
                }
            };
            summary.completed += 1;
            debug!("Report for {}:\n{}", record.name, render_text(&report));

            if self.persist(record, &report) {
                summary.persisted += 1;
            }
            if report.cancelled {
                summary.cancelled = true;
                break;
            }
        }

        info!(
            event = "tick_completed",
            definitions = summary.definitions,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            persisted = summary.persisted,
            cancelled = summary.cancelled,
            elapsed = ?started.elapsed(),
            "Tick completed"
        );
        Ok(summary)
    }

    fn persist(&self, record: &Record, report: &RunReport) -> bool {
        let data = match serde_json::to_value(report) {
            Ok(data) => data,
            Err(e) => {
                error!(id = record.id, "Failed to encode report: {}", e);
                return false;
            }
        };
        match self.store.insert_report(record.id, &record.name, &data) {
            Ok(report_id) => {
                debug!(id = record.id, report_id, "Persisted report");
                true
            }
            Err(e) => {
                error!(id = record.id, name = %record.name, "Failed to persist report: {}", e);
                false
            }
        }
    }

    /// List the definitions to run this tick, in id order
    fn enumerate(&self) -> Result<(Vec<Record>, Source), StoreError> {
        let ids = self.store.ids()?;
        if let Some(records) = self.cached(&ids) {
            return Ok((records, Source::Cache));
        }

        let records = select_every(self.store.as_ref(), PAGE_SIZE)?;
        for record in &records {
            if let Err(e) = self.cache.put(record) {
                debug!(id = record.id, "Failed to re-index definition: {}", e);
            }
        }
        Ok((records, Source::Store))
    }

    /// Cached records, provided they cover exactly the stored ids
    fn cached(&self, ids: &[RecordId]) -> Option<Vec<Record>> {
        let mut records = Vec::new();
        for (name, payload) in self.cache.entries() {
            match serde_json::from_slice::<Record>(&payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    debug!(name = %name, "Undecodable cache entry, listing store: {}", e);
                    return None;
                }
            }
        }
        records.sort_by_key(|record| record.id);

        let cached: BTreeSet<RecordId> = records.iter().map(|record| record.id).collect();
        if cached.len() != records.len() || !cached.iter().eq(ids.iter()) {
            debug!(cached = cached.len(), stored = ids.len(), "Cache incomplete, listing store");
            return None;
        }
        Some(records)
    }
}
