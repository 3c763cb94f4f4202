//! Backfill master
//!
//! Polls the store for accounts flagged `analyze`, hands each one to a
//! randomly chosen live worker and replaces workers that die. All job
//! bookkeeping lives in [`MasterState`], owned by the master task alone.

use std::collections::{HashMap, HashSet, VecDeque};

use bson::doc;
use rand::seq::IteratorRandom;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::messages::{ToMaster, ToWorker, WorkerId};
use super::worker::BackfillWorker;
use super::BackfillConfig;
use crate::db::{doc_id, Entity, FindSpec, LogicalDb};
use crate::handlers::MirrorContext;
use crate::types::{MirrorError, Result};

/// Queue depth of each worker's job channel
const WORKER_QUEUE: usize = 64;

/// Job bookkeeping of the master
#[derive(Debug, Default)]
pub struct MasterState {
    /// Flag cleared, not yet dispatched
    pub pending: VecDeque<i64>,
    /// Spawned workers that have not reported in yet
    pub starting: HashMap<WorkerId, mpsc::Sender<ToWorker>>,
    /// Live workers and their job channels
    pub alive: HashMap<WorkerId, mpsc::Sender<ToWorker>>,
    /// Accounts queued, dispatched or running
    pub running: HashSet<i64>,
    /// Dispatched accounts per worker
    pub assignments: HashMap<WorkerId, Vec<i64>>,
}

impl MasterState {
    /// Queue a flagged account; `false` when it is already in flight
    pub fn enqueue(&mut self, account_id: i64) -> bool {
        if !self.running.insert(account_id) {
            return false;
        }
        self.pending.push_back(account_id);
        true
    }

    /// Promote a starting worker; `false` for unknown workers
    pub fn mark_alive(&mut self, worker: WorkerId) -> bool {
        match self.starting.remove(&worker) {
            Some(jobs) => {
                self.alive.insert(worker, jobs);
                true
            }
            None => false,
        }
    }

    pub fn finish(&mut self, worker: WorkerId, account_id: i64) {
        self.running.remove(&account_id);
        if let Some(jobs) = self.assignments.get_mut(&worker) {
            jobs.retain(|id| *id != account_id);
        }
    }

    /// Forget a dead worker, returning the accounts it abandoned
    pub fn abandon(&mut self, worker: WorkerId) -> Vec<i64> {
        self.starting.remove(&worker);
        self.alive.remove(&worker);
        let jobs = self.assignments.remove(&worker).unwrap_or_default();
        for id in &jobs {
            self.running.remove(id);
        }
        jobs
    }

    fn pick_worker(&self) -> Option<WorkerId> {
        self.alive.keys().copied().choose(&mut rand::thread_rng())
    }
}

pub struct BackfillMaster {
    ctx: MirrorContext,
    config: BackfillConfig,
    state: MasterState,
    events_tx: mpsc::Sender<ToMaster>,
    events_rx: mpsc::Receiver<ToMaster>,
}

impl BackfillMaster {
    pub fn new(ctx: MirrorContext, config: BackfillConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(1024);
        Self {
            ctx,
            config,
            state: MasterState::default(),
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> &MasterState {
        &self.state
    }

    /// Start the workers and serve until the control channel closes
    pub async fn run(mut self) -> Result<()> {
        let workers = self.config.worker_count();
        info!(
            workers,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Starting backfill master"
        );
        for slot in 0..workers {
            self.spawn_worker(slot);
        }

        // Nothing can be dispatched before a worker reports in
        while self.state.alive.is_empty() {
            let event = self.next_event().await?;
            self.handle(event).await;
        }

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    let event = event
                        .ok_or_else(|| MirrorError::Channel("control channel closed".into()))?;
                    self.handle(event).await;
                }
                _ = poll.tick() => {
                    if let Err(e) = self.poll().await {
                        error!("Error while polling for flagged accounts: {}", e);
                    }
                }
            }
        }
    }

    async fn next_event(&mut self) -> Result<ToMaster> {
        self.events_rx
            .recv()
            .await
            .ok_or_else(|| MirrorError::Channel("control channel closed".into()))
    }

    /// Spawn a worker in `slot` with a supervisor reporting its exit
    fn spawn_worker(&mut self, slot: WorkerId) {
        let (jobs_tx, jobs_rx) = mpsc::channel(WORKER_QUEUE);
        self.state.starting.insert(slot, jobs_tx);

        let worker = BackfillWorker::new(slot, self.ctx.clone(), self.config.clone());
        let events = self.events_tx.clone();
        let handle = tokio::spawn(worker.run(jobs_rx, events.clone()));

        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(())) => debug!(worker = slot, "Worker exited"),
                Ok(Err(e)) => error!(worker = slot, "Worker failed: {}", e),
                Err(e) => error!(worker = slot, "Worker crashed: {}", e),
            }
            let _ = events.send(ToMaster::Exited { pid: slot }).await;
        });
    }

    /// Apply one control message
    pub async fn handle(&mut self, event: ToMaster) {
        match event {
            ToMaster::Alive { pid } => {
                if self.state.mark_alive(pid) {
                    debug!(worker = pid, alive = self.state.alive.len(), "Worker alive");
                    self.dispatch().await;
                }
            }
            ToMaster::Finished { pid, account_id } => {
                self.state.finish(pid, account_id);
                debug!(worker = pid, account_id, "Job finished");
            }
            ToMaster::Exited { pid } => {
                let abandoned = self.state.abandon(pid);
                if !abandoned.is_empty() {
                    warn!(worker = pid, ?abandoned, "Worker died with jobs in flight");
                }
                for account_id in abandoned {
                    self.release(account_id).await;
                }
                self.spawn_worker(pid);
            }
        }
    }

    /// Abandoned jobs are not retried; the account stays non-loading until re-flagged
    async fn release(&self, account_id: i64) {
        let result = self
            .ctx
            .store
            .update_one(
                LogicalDb::General,
                Entity::AccountData,
                doc! { "_id": account_id },
                doc! { "$set": { "loading": false } },
                false,
            )
            .await;
        if let Err(e) = result {
            error!(account_id, "Could not clear loading flag: {}", e);
        }
    }

    /// Pick up flagged accounts and dispatch what can be dispatched
    pub async fn poll(&mut self) -> Result<()> {
        let flagged = self
            .ctx
            .store
            .find(
                LogicalDb::General,
                Entity::AccountData,
                doc! { "analyze": true },
                FindSpec::projection(doc! { "_id": 1 }),
            )
            .await?;

        for account_id in flagged.iter().filter_map(doc_id) {
            if !self.state.enqueue(account_id) {
                continue;
            }
            self.ctx
                .store
                .update_one(
                    LogicalDb::General,
                    Entity::AccountData,
                    doc! { "_id": account_id },
                    doc! { "$unset": { "analyze": "" } },
                    false,
                )
                .await?;
            debug!(account_id, "Account queued for backfill");
        }

        self.dispatch().await;
        Ok(())
    }

    async fn dispatch(&mut self) {
        while let Some(&account_id) = self.state.pending.front() {
            let Some(worker) = self.state.pick_worker() else {
                return;
            };
            let Some(jobs) = self.state.alive.get(&worker).cloned() else {
                return;
            };

            if jobs.send(ToWorker::Analyze { account_id }).await.is_err() {
                // Its exit notice is on the way
                self.state.alive.remove(&worker);
                continue;
            }
            self.state.pending.pop_front();
            self.state
                .assignments
                .entry(worker)
                .or_default()
                .push(account_id);
            debug!(worker, account_id, "Job dispatched");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_skips_running() {
        let mut state = MasterState::default();
        assert!(state.enqueue(7));
        assert!(!state.enqueue(7));
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn test_abandon_frees_accounts() {
        let mut state = MasterState::default();
        let (tx, _rx) = mpsc::channel(1);
        state.starting.insert(1, tx);
        assert!(state.mark_alive(1));
        assert!(!state.mark_alive(2));

        state.enqueue(10);
        state.enqueue(11);
        state.pending.clear();
        state.assignments.insert(1, vec![10, 11]);

        state.finish(1, 10);
        assert_eq!(state.abandon(1), vec![11]);
        assert!(state.running.is_empty());
        assert!(state.alive.is_empty());
    }

    #[test]
    fn test_pick_worker_needs_alive() {
        let mut state = MasterState::default();
        assert_eq!(state.pick_worker(), None);
        let (tx, _rx) = mpsc::channel(1);
        state.alive.insert(4, tx);
        assert_eq!(state.pick_worker(), Some(4));
    }
}
