//! Batch orchestrator — the dispatch loop of a run.
//!
//! One loop per run; it is the only writer of the store, the quota governor
//! and the run phase. Observers get a `watch` receiver and the progress
//! callback, and may request a cooperative stop through a `StopHandle`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dunning_core::clock::Clock;
use dunning_core::config::DunningConfig;
use dunning_core::error::Result;
use dunning_core::mask_id;
use tokio::sync::watch;

use crate::behavior::BehaviorSynthesizer;
use crate::executor::{DeliveryExecutor, DeliveryReport, Outcome, SessionCheck, sleep_unless_stopped};
use crate::persistence::{RunDb, RunSnapshot};
use crate::quota::QuotaGovernor;
use crate::recipient::DeliveryStatus;
use crate::run::{RunPhase, RunStatus, RunSummary};
use crate::store::{AttemptMeta, RecipientStore, StoreSnapshot};
use crate::template::MessageTemplate;

/// Re-check interval when the governor blocks without a cooldown.
const MIN_IDLE: Duration = Duration::from_secs(1);

/// Progress sink, called with the store snapshot after every mutation.
pub type ProgressCallback = Arc<dyn Fn(&StoreSnapshot) + Send + Sync>;

/// Requests a cooperative stop. Observed at the top of every iteration and
/// at every suspension point; an in-flight delivery always finishes.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Drives a run from IDLE to STOPPED or ERROR.
pub struct BatchOrchestrator {
    run_id: String,
    started_at: DateTime<Utc>,
    phase: RunPhase,
    phase_history: Vec<RunPhase>,
    halt_reason: Option<String>,
    store: RecipientStore,
    governor: QuotaGovernor,
    behavior: BehaviorSynthesizer,
    executor: DeliveryExecutor,
    template: MessageTemplate,
    clock: Arc<dyn Clock>,
    db: Option<RunDb>,
    status_tx: watch::Sender<RunStatus>,
    stop_tx: Arc<watch::Sender<bool>>,
    on_progress: Option<ProgressCallback>,
}

impl BatchOrchestrator {
    /// A fresh run over an already loaded store.
    pub fn new(
        run_id: &str,
        config: &DunningConfig,
        store: RecipientStore,
        executor: DeliveryExecutor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let governor = match config.behavior.seed {
            Some(seed) => QuotaGovernor::with_seed(config.quota.clone(), seed),
            None => QuotaGovernor::new(config.quota.clone()),
        };
        let started_at = clock.now();
        Self::assemble(run_id, started_at, config, store, governor, executor, clock)
    }

    /// Continue a persisted run. Records caught in flight become retryable
    /// failures and the quota history is restored.
    pub fn resume(
        snapshot: RunSnapshot,
        config: &DunningConfig,
        executor: DeliveryExecutor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let store = RecipientStore::restore(
            snapshot.records,
            config.retry.max_attempts,
            config.store.attempt_log_capacity,
            now,
        );
        let mut governor = match config.behavior.seed {
            Some(seed) => QuotaGovernor::with_seed(config.quota.clone(), seed),
            None => QuotaGovernor::new(config.quota.clone()),
        };
        governor.restore(snapshot.quota_sends, now);
        tracing::info!(
            run_id = %snapshot.run_id,
            remaining = store.snapshot().pending,
            "♻️ Resuming run"
        );
        Self::assemble(
            &snapshot.run_id,
            snapshot.started_at,
            config,
            store,
            governor,
            executor,
            clock,
        )
    }

    fn assemble(
        run_id: &str,
        started_at: DateTime<Utc>,
        config: &DunningConfig,
        store: RecipientStore,
        governor: QuotaGovernor,
        executor: DeliveryExecutor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let status = RunStatus {
            run_id: run_id.to_string(),
            phase: RunPhase::Idle,
            started_at,
            store: store.snapshot(),
            quota: governor.snapshot(now),
        };
        let (status_tx, _) = watch::channel(status);
        let (stop_tx, _) = watch::channel(false);
        Self {
            run_id: run_id.to_string(),
            started_at,
            phase: RunPhase::Idle,
            phase_history: vec![RunPhase::Idle],
            halt_reason: None,
            store,
            governor,
            behavior: BehaviorSynthesizer::new(config.behavior.clone()),
            executor,
            template: MessageTemplate::from_config(&config.delivery),
            clock,
            db: None,
            status_tx,
            stop_tx: Arc::new(stop_tx),
            on_progress: None,
        }
    }

    /// Write the run through to `db` from now on. The full current state is
    /// saved immediately.
    pub fn with_db(mut self, mut db: RunDb) -> Result<Self> {
        db.save(&self.snapshot())?;
        self.db = Some(db);
        Ok(self)
    }

    /// Set the progress callback.
    pub fn set_on_progress<F>(&mut self, f: F)
    where
        F: Fn(&StoreSnapshot) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Read-only status feed.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status_tx.subscribe()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Every phase entered so far, in order.
    pub fn phase_history(&self) -> &[RunPhase] {
        &self.phase_history
    }

    pub fn store(&self) -> &RecipientStore {
        &self.store
    }

    /// Persistable state of the run.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            phase: self.phase,
            started_at: self.started_at,
            updated_at: self.clock.now(),
            halt_reason: self.halt_reason.clone(),
            quota_sends: self.governor.sends(),
            records: self.store.records().to_vec(),
        }
    }

    /// Run until the queue is exhausted, a stop is requested, or the
    /// transport session is lost. Always ends with a summary; persistence
    /// failures at the end are logged, not returned.
    pub async fn run(&mut self) -> RunSummary {
        let run_start = self.clock.now();

        if self.store.is_empty() {
            tracing::info!(run_id = %self.run_id, "📭 Nothing to dispatch");
            self.set_phase(RunPhase::Stopped);
        } else {
            tracing::info!(
                run_id = %self.run_id,
                total = self.store.len(),
                transport = self.executor.transport_name(),
                "🚀 Dispatch run starting"
            );
            self.set_phase(RunPhase::Running);
            let final_phase = match self.dispatch_loop().await {
                Ok(()) => RunPhase::Stopped,
                Err(e) => {
                    tracing::error!(run_id = %self.run_id, "❌ Run halted: {}", e);
                    self.halt_reason = Some(e.to_string());
                    RunPhase::Error
                }
            };
            self.set_phase(final_phase);
        }

        if let Err(e) = self.executor.close().await {
            tracing::warn!("⚠️ Failed to close {} session: {}", self.executor.transport_name(), e);
        }

        let now = self.clock.now();
        if let Some(db) = &self.db {
            if let Err(e) = db.finish(&self.run_id, self.phase, now, self.halt_reason.as_deref()) {
                tracing::error!(run_id = %self.run_id, "❌ Failed to persist final run state: {}", e);
            }
        }

        let summary = RunSummary::build(
            &self.run_id,
            self.phase,
            self.store.snapshot(),
            (now - run_start).to_std().unwrap_or(Duration::ZERO),
            self.halt_reason.clone(),
            self.store.records(),
        );
        tracing::info!(
            run_id = %self.run_id,
            phase = %summary.phase,
            sent = summary.counts.sent,
            failed = summary.counts.failed,
            skipped = summary.skipped(),
            elapsed_secs = summary.elapsed.as_secs(),
            "🏁 Dispatch run finished"
        );
        summary
    }

    async fn dispatch_loop(&mut self) -> Result<()> {
        loop {
            if self.stop_requested() {
                tracing::info!(run_id = %self.run_id, "🛑 Stop requested");
                return Ok(());
            }

            let now = self.clock.now();
            let id = match self.store.next_pending(now) {
                Some(record) => record.id.clone(),
                None => match self.store.next_retry_at() {
                    Some(at) => {
                        let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                        tracing::debug!("⏳ Waiting {}s for the next retry", wait.as_secs());
                        self.pause(wait).await;
                        continue;
                    }
                    None => {
                        tracing::info!(run_id = %self.run_id, "✅ Queue exhausted");
                        return Ok(());
                    }
                },
            };

            if !self.governor.may_dispatch(self.phase, now) {
                let cooldown = self.governor.check_cooldown(now).unwrap_or(MIN_IDLE);
                self.set_phase(RunPhase::Cooldown);
                tracing::info!(
                    run_id = %self.run_id,
                    "😴 Cooling down for {}m {}s",
                    cooldown.as_secs() / 60,
                    cooldown.as_secs() % 60
                );
                self.pause(cooldown).await;
                self.set_phase(RunPhase::Running);
                continue;
            }

            // Fatal when unrecoverable: remaining records stay as they are.
            let mut stop_rx = self.stop_tx.subscribe();
            if self.executor.ensure_session(&mut stop_rx).await? == SessionCheck::Stopped {
                tracing::info!(run_id = %self.run_id, "🛑 Stop requested while reconnecting");
                return Ok(());
            }

            self.store
                .mark(&id, DeliveryStatus::InProgress, None, self.clock.now())?;
            self.updated(Some(&id))?;

            let record = self.store.position(&id).map(|p| self.store.records()[p].clone())?;
            let text = self.template.render(&record);
            let plan = self.behavior.plan_typing(&text);
            let report = self.executor.deliver(&record, &plan).await;

            if report.dispatched {
                self.governor.record_dispatch(self.clock.now());
            }
            self.apply(&id, &report)?;
            self.updated(Some(&id))?;

            if report.dispatched && self.has_work() {
                let delay = self.behavior.plan_delay();
                self.pause(delay).await;
            }
        }
    }

    /// Fold a delivery report into the record's status.
    fn apply(&mut self, id: &str, report: &DeliveryReport) -> Result<()> {
        let now = self.clock.now();
        let meta = AttemptMeta {
            latency: Some(report.latency),
            attachment: report.attachment_included,
        };
        self.store.set_note(id, report.degraded.as_deref())?;

        match &report.outcome {
            Outcome::Success => {
                self.store.mark_attempt(id, DeliveryStatus::Sent, None, meta, now)?;
            }
            Outcome::TransientFailure { reason } => {
                self.store
                    .mark_attempt(id, DeliveryStatus::Failed, Some(reason.clone()), meta, now)?;
                let attempts = self.store.get(id).map(|r| r.attempts).unwrap_or(u32::MAX);
                let policy = self.executor.retry_policy();
                if policy.should_retry(attempts) {
                    let wait = policy.backoff_for(attempts);
                    let at = now + chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::zero());
                    self.store.schedule_retry(id, at)?;
                    tracing::info!(
                        recipient = %mask_id(id),
                        attempt = attempts,
                        "🔁 Retry in {}s",
                        wait.as_secs()
                    );
                } else {
                    tracing::warn!(
                        recipient = %mask_id(id),
                        attempts,
                        "❌ Retries exhausted"
                    );
                }
            }
            Outcome::PermanentFailure {
                reason,
                invalid_recipient: true,
            } => {
                self.store.mark_attempt(
                    id,
                    DeliveryStatus::SkippedInvalid,
                    Some(reason.clone()),
                    meta,
                    now,
                )?;
            }
            Outcome::PermanentFailure { reason, .. } => {
                self.store
                    .mark_attempt(id, DeliveryStatus::Failed, Some(reason.clone()), meta, now)?;
            }
        }
        Ok(())
    }

    fn has_work(&self) -> bool {
        self.store.next_pending(self.clock.now()).is_some() || self.store.next_retry_at().is_some()
    }

    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Suspend for `duration`, waking early on a stop request.
    async fn pause(&self, duration: Duration) {
        let mut stop_rx = self.stop_tx.subscribe();
        if !sleep_unless_stopped(self.clock.as_ref(), duration, &mut stop_rx).await {
            tracing::debug!("🛑 Pause interrupted by stop request");
        }
    }

    fn set_phase(&mut self, phase: RunPhase) {
        if self.phase == phase {
            return;
        }
        tracing::debug!(run_id = %self.run_id, "🔄 {} → {}", self.phase, phase);
        self.phase = phase;
        self.phase_history.push(phase);
        self.publish();
        if let Err(e) = self.updated_run_only() {
            tracing::warn!("⚠️ Failed to persist phase change: {}", e);
        }
    }

    /// Persist, publish and notify after a record mutation.
    fn updated(&mut self, id: Option<&str>) -> Result<()> {
        if let Some(db) = self.db.as_mut() {
            let changed = match id {
                Some(id) => {
                    let position = self.store.position(id)?;
                    Some((position, &self.store.records()[position]))
                }
                None => None,
            };
            db.checkpoint(
                &self.run_id,
                self.phase,
                self.clock.now(),
                &self.governor.sends(),
                changed,
            )?;
        }
        self.publish();
        if let Some(cb) = &self.on_progress {
            cb(&self.store.snapshot());
        }
        Ok(())
    }

    fn updated_run_only(&mut self) -> Result<()> {
        match self.db.as_mut() {
            Some(db) => db.checkpoint(
                &self.run_id,
                self.phase,
                self.clock.now(),
                &self.governor.sends(),
                None,
            ),
            None => Ok(()),
        }
    }

    fn publish(&self) {
        let now = self.clock.now();
        self.status_tx.send_replace(RunStatus {
            run_id: self.run_id.clone(),
            phase: self.phase,
            started_at: self.started_at,
            store: self.store.snapshot(),
            quota: self.governor.snapshot(now),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipient::Recipient;
    use crate::testing::{FetchBehavior, ScriptedFetcher, ScriptedTransport, SendResult};
    use chrono::NaiveDate;
    use dunning_core::clock::ManualClock;
    use dunning_core::traits::Transport;
    use std::sync::Mutex;

    fn config() -> DunningConfig {
        let mut c = DunningConfig::default();
        c.behavior.enabled = false;
        c.behavior.seed = Some(7);
        c.quota.cooldown_min_secs = 3600;
        c.quota.cooldown_max_secs = 3600;
        c
    }

    fn id(i: usize) -> String {
        format!("55119000000{i:02}")
    }

    fn recipients(n: usize) -> Vec<Recipient> {
        let due = NaiveDate::from_ymd_opt(2026, 11, 5).unwrap();
        (1..=n).map(|i| Recipient::new(&id(i), "Maria", 15_000, due)).collect()
    }

    fn orchestrator(
        config: &DunningConfig,
        records: Vec<Recipient>,
        transport: &ScriptedTransport,
        clock: &ManualClock,
    ) -> BatchOrchestrator {
        let mut store = RecipientStore::new(config.retry.max_attempts, 100);
        store.load(records, clock.now());
        let executor = DeliveryExecutor::new(Box::new(transport.clone()), Arc::new(clock.clone()), config);
        BatchOrchestrator::new("run-test", config, store, executor, Arc::new(clock.clone()))
    }

    fn status_of(orch: &BatchOrchestrator, id: &str) -> DeliveryStatus {
        orch.store().get(id).unwrap().status
    }

    #[tokio::test]
    async fn test_quota_cooldown_then_resume_sending() {
        let mut cfg = config();
        cfg.quota.hourly_cap = 2;
        let transport = ScriptedTransport::connected();
        let clock = ManualClock::default();
        let mut orch = orchestrator(&cfg, recipients(3), &transport, &clock);

        let summary = orch.run().await;
        assert_eq!(summary.counts.sent, 3);
        assert_eq!(summary.counts.failed, 0);
        assert_eq!(summary.phase, RunPhase::Stopped);
        assert_eq!(
            orch.phase_history(),
            &[
                RunPhase::Idle,
                RunPhase::Running,
                RunPhase::Cooldown,
                RunPhase::Running,
                RunPhase::Stopped
            ]
        );
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(3600)]);
        assert_eq!(summary.elapsed, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_malformed_identifier_skipped_without_retry() {
        let transport = ScriptedTransport::connected();
        let clock = ManualClock::default();
        let mut records = recipients(1);
        records.push(Recipient::new(
            "12345",
            "Ana",
            100,
            NaiveDate::from_ymd_opt(2026, 11, 5).unwrap(),
        ));
        let mut orch = orchestrator(&config(), records, &transport, &clock);

        let summary = orch.run().await;
        let bad = orch.store().get("12345").unwrap();
        assert_eq!(bad.status, DeliveryStatus::SkippedInvalid);
        assert_eq!(bad.attempts, 1);
        assert_eq!(summary.counts.sent, 1);
        assert_eq!(summary.counts.skipped_invalid, 1);
        assert_eq!(transport.send_calls(), vec![id(1)]);
    }

    #[tokio::test]
    async fn test_unknown_number_skipped_invalid() {
        let transport = ScriptedTransport::connected();
        transport.script(&id(1), vec![SendResult::InvalidRecipient]);
        let clock = ManualClock::default();
        let mut orch = orchestrator(&config(), recipients(2), &transport, &clock);

        let summary = orch.run().await;
        assert_eq!(status_of(&orch, &id(1)), DeliveryStatus::SkippedInvalid);
        assert_eq!(orch.store().get(&id(1)).unwrap().attempts, 1);
        assert_eq!(summary.failures[0].reason, "Invalid recipient: number does not exist");
        assert_eq!(summary.counts.sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_document_timeout_degrades_to_text() {
        let transport = ScriptedTransport::connected();
        let clock = ManualClock::default();
        let fetcher = ScriptedFetcher::new(FetchBehavior::Hang);
        let cfg = config();
        let due = NaiveDate::from_ymd_opt(2026, 11, 5).unwrap();
        let record = Recipient::new(&id(1), "Maria", 15_000, due).with_document("991", None);

        let mut store = RecipientStore::new(3, 100);
        store.load(vec![record], clock.now());
        let executor = DeliveryExecutor::new(Box::new(transport.clone()), Arc::new(clock.clone()), &cfg)
            .with_documents(Box::new(fetcher));
        let mut orch = BatchOrchestrator::new("run-doc", &cfg, store, executor, Arc::new(clock.clone()));

        let summary = orch.run().await;
        let r = orch.store().get(&id(1)).unwrap();
        assert_eq!(r.status, DeliveryStatus::Sent);
        assert!(r.note.as_deref().unwrap().contains("timed out"));
        assert_eq!(summary.degraded.len(), 1);
        assert!(transport.sent()[0].attachment.is_none());
    }

    #[tokio::test]
    async fn test_session_lost_halts_with_pending_preserved() {
        let transport = ScriptedTransport::disconnected();
        transport.script_connects(vec![false, false, false, false]);
        let clock = ManualClock::default();
        let mut orch = orchestrator(&config(), recipients(3), &transport, &clock);

        let summary = orch.run().await;
        assert_eq!(summary.phase, RunPhase::Error);
        assert_eq!(summary.counts.pending, 3);
        assert!(summary.halt_reason.unwrap().contains("session lost"));
        assert_eq!(transport.connect_calls(), 3);
        assert!(transport.send_calls().is_empty());
    }

    #[tokio::test]
    async fn test_mid_run_disconnect_keeps_remaining_work() {
        let transport = ScriptedTransport::connected();
        transport.script(&id(2), vec![SendResult::Disconnected]);
        transport.script_connects(vec![false, false, false]);
        let clock = ManualClock::default();
        let mut orch = orchestrator(&config(), recipients(3), &transport, &clock);

        let summary = orch.run().await;
        assert_eq!(summary.phase, RunPhase::Error);
        assert_eq!(status_of(&orch, &id(1)), DeliveryStatus::Sent);
        let second = orch.store().get(&id(2)).unwrap();
        assert_eq!(second.status, DeliveryStatus::Failed);
        assert!(second.next_retry_at.is_some());
        assert_eq!(status_of(&orch, &id(3)), DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn test_transient_failures_bounded_by_max_attempts() {
        let transport = ScriptedTransport::connected();
        transport.script(
            &id(1),
            vec![SendResult::Timeout, SendResult::Timeout, SendResult::Timeout, SendResult::Ok],
        );
        let clock = ManualClock::default();
        let mut orch = orchestrator(&config(), recipients(2), &transport, &clock);

        let summary = orch.run().await;
        let r = orch.store().get(&id(1)).unwrap();
        assert_eq!(r.status, DeliveryStatus::Failed);
        assert_eq!(r.attempts, 3);
        assert!(r.next_retry_at.is_none());
        assert_eq!(summary.counts.failed, 1);
        assert_eq!(summary.counts.sent, 1);
        // Pending first, then retries after their backoff.
        assert_eq!(transport.send_calls(), vec![id(1), id(2), id(1), id(1)]);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2), Duration::from_secs(8)]);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let transport = ScriptedTransport::connected();
        transport.script(&id(1), vec![SendResult::Timeout]);
        let clock = ManualClock::default();
        let mut orch = orchestrator(&config(), recipients(1), &transport, &clock);

        let summary = orch.run().await;
        let r = orch.store().get(&id(1)).unwrap();
        assert_eq!(r.status, DeliveryStatus::Sent);
        assert_eq!(r.attempts, 2);
        assert!(r.last_error.is_none());
        assert_eq!(summary.counts.sent, 1);
    }

    #[tokio::test]
    async fn test_rejected_recipient_fails_without_retry() {
        let transport = ScriptedTransport::connected();
        transport.script(&id(1), vec![SendResult::Rejected]);
        let clock = ManualClock::default();
        let mut orch = orchestrator(&config(), recipients(1), &transport, &clock);

        let summary = orch.run().await;
        let r = orch.store().get(&id(1)).unwrap();
        assert_eq!(r.status, DeliveryStatus::Failed);
        assert_eq!(r.attempts, 1);
        assert_eq!(summary.counts.failed, 1);
        assert_eq!(transport.send_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_sent_once() {
        let transport = ScriptedTransport::connected();
        let clock = ManualClock::default();
        let mut records = recipients(2);
        records.push(records[0].clone());
        let mut orch = orchestrator(&config(), records, &transport, &clock);

        let summary = orch.run().await;
        assert_eq!(summary.counts.sent, 2);
        assert_eq!(summary.counts.skipped_duplicate, 1);
        assert_eq!(transport.send_calls(), vec![id(1), id(2)]);
    }

    #[tokio::test]
    async fn test_empty_store_stops_immediately() {
        let transport = ScriptedTransport::connected();
        let clock = ManualClock::default();
        let mut orch = orchestrator(&config(), Vec::new(), &transport, &clock);

        let summary = orch.run().await;
        assert_eq!(summary.phase, RunPhase::Stopped);
        assert_eq!(orch.phase_history(), &[RunPhase::Idle, RunPhase::Stopped]);
    }

    #[tokio::test]
    async fn test_pacing_between_dispatches() {
        let mut cfg = config();
        cfg.behavior.enabled = true;
        cfg.behavior.batch_size_min = 10;
        cfg.behavior.batch_size_max = 10;
        let transport = ScriptedTransport::connected();
        let clock = ManualClock::default();
        let mut orch = orchestrator(&cfg, recipients(3), &transport, &clock);

        orch.run().await;
        let sleeps = clock.sleeps();
        // No wait after the last dispatch.
        assert_eq!(sleeps.len(), 2);
        for s in sleeps {
            assert!(s >= Duration::from_secs(15) && s <= Duration::from_secs(45));
        }
    }

    #[tokio::test]
    async fn test_stop_between_iterations() {
        let transport = ScriptedTransport::connected();
        let clock = ManualClock::default();
        let mut orch = orchestrator(&config(), recipients(3), &transport, &clock);
        let handle = orch.stop_handle();
        orch.set_on_progress(move |snap| {
            if snap.sent == 1 {
                handle.stop();
            }
        });

        let summary = orch.run().await;
        assert_eq!(summary.phase, RunPhase::Stopped);
        assert_eq!(summary.counts.sent, 1);
        assert_eq!(summary.counts.pending, 2);
        assert!(orch.stop_handle().is_stopped());
    }

    #[tokio::test]
    async fn test_progress_and_status_account_for_every_record() {
        let transport = ScriptedTransport::connected();
        transport.script(&id(2), vec![SendResult::Rejected]);
        let clock = ManualClock::default();
        let mut records = recipients(3);
        records.push(records[0].clone());
        let mut orch = orchestrator(&config(), records, &transport, &clock);
        let rx = orch.subscribe();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        orch.set_on_progress(move |snap| sink.lock().unwrap().push(*snap));

        orch.run().await;
        let seen = seen.lock().unwrap();
        // Two updates per delivery: in-flight, then outcome.
        assert_eq!(seen.len(), 6);
        assert!(seen.iter().all(|s| s.accounted() == s.total && s.total == 4));

        let status = rx.borrow();
        assert_eq!(status.phase, RunPhase::Stopped);
        assert_eq!(status.store.sent, 2);
        assert_eq!(status.quota.hourly_count, 3);
    }

    #[tokio::test]
    async fn test_resume_never_resends() {
        let dir = std::env::temp_dir().join("dunning-orchestrator-resume-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("runs.db");
        std::fs::remove_file(&path).ok();
        let cfg = config();
        let clock = ManualClock::default();

        let first = ScriptedTransport::connected();
        let mut orch = orchestrator(&cfg, recipients(4), &first, &clock)
            .with_db(RunDb::open(&path).unwrap())
            .unwrap();
        let handle = orch.stop_handle();
        orch.set_on_progress(move |snap| {
            if snap.sent == 2 {
                handle.stop();
            }
        });
        let summary = orch.run().await;
        assert_eq!(summary.counts.sent, 2);
        drop(orch);

        let db = RunDb::open(&path).unwrap();
        let snapshot = db.load("run-test").unwrap().unwrap();
        assert_eq!(snapshot.phase, RunPhase::Stopped);
        assert_eq!(snapshot.quota_sends.len(), 2);

        let second = ScriptedTransport::connected();
        let executor = DeliveryExecutor::new(Box::new(second.clone()), Arc::new(clock.clone()), &cfg);
        let mut resumed = BatchOrchestrator::resume(snapshot, &cfg, executor, Arc::new(clock.clone()))
            .with_db(db)
            .unwrap();
        let summary = resumed.run().await;

        assert_eq!(summary.counts.sent, 4);
        assert_eq!(second.send_calls(), vec![id(3), id(4)]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_resume_retries_interrupted_record() {
        let cfg = config();
        let clock = ManualClock::default();
        let mut records = recipients(2);
        records[0].status = DeliveryStatus::InProgress;
        records[0].attempts = 1;
        records[1].status = DeliveryStatus::Sent;
        records[1].attempts = 1;
        let snapshot = RunSnapshot {
            run_id: "run-crashed".into(),
            phase: RunPhase::Running,
            started_at: clock.now(),
            updated_at: clock.now(),
            halt_reason: None,
            quota_sends: vec![clock.now()],
            records,
        };

        let transport = ScriptedTransport::connected();
        let executor = DeliveryExecutor::new(Box::new(transport.clone()), Arc::new(clock.clone()), &cfg);
        let mut orch = BatchOrchestrator::resume(snapshot, &cfg, executor, Arc::new(clock.clone()));
        let summary = orch.run().await;

        assert_eq!(transport.send_calls(), vec![id(1)]);
        assert_eq!(orch.store().get(&id(1)).unwrap().attempts, 2);
        assert_eq!(summary.counts.sent, 2);
    }

    #[tokio::test]
    async fn test_stop_during_reconnect_ends_stopped() {
        let transport = ScriptedTransport::disconnected();
        transport.script_connects(vec![false, false, false]);
        let clock = ManualClock::default();
        let mut orch = orchestrator(&config(), recipients(3), &transport, &clock);
        let handle = orch.stop_handle();
        transport.on_connect(move || handle.stop());

        let summary = orch.run().await;
        assert_eq!(summary.phase, RunPhase::Stopped);
        assert!(summary.halt_reason.is_none());
        assert_eq!(summary.counts.pending, 3);
        assert_eq!(transport.connect_calls(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_cooldown() {
        let mut cfg = config();
        cfg.quota.hourly_cap = 1;
        let transport = ScriptedTransport::connected();
        let clock: Arc<dyn Clock> = Arc::new(dunning_core::clock::SystemClock);
        let mut store = RecipientStore::new(cfg.retry.max_attempts, 100);
        store.load(recipients(2), clock.now());
        let executor = DeliveryExecutor::new(Box::new(transport.clone()), Arc::clone(&clock), &cfg);
        let mut orch = BatchOrchestrator::new("run-cooldown-stop", &cfg, store, executor, clock);

        let handle = orch.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            handle.stop();
        });

        let started = tokio::time::Instant::now();
        let summary = orch.run().await;
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(summary.phase, RunPhase::Stopped);
        assert_eq!(summary.counts.sent, 1);
        assert_eq!(summary.counts.pending, 1);
        assert!(orch.phase_history().contains(&RunPhase::Cooldown));
    }

    #[tokio::test]
    async fn test_stop_skips_pacing_delay() {
        let mut cfg = config();
        cfg.behavior.enabled = true;
        let transport = ScriptedTransport::connected();
        let clock = ManualClock::default();
        let mut orch = orchestrator(&cfg, recipients(3), &transport, &clock);
        let handle = orch.stop_handle();
        orch.set_on_progress(move |snap| {
            if snap.sent == 1 {
                handle.stop();
            }
        });

        let summary = orch.run().await;
        assert_eq!(summary.counts.sent, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_degraded_note_cleared_when_retry_attaches_document() {
        let transport = ScriptedTransport::connected();
        transport.script(&id(1), vec![SendResult::Timeout]);
        let clock = ManualClock::default();
        let fetcher = ScriptedFetcher::sequence(vec![
            FetchBehavior::Fail,
            FetchBehavior::Found("/tmp/fatura-991.pdf".into()),
        ]);
        let cfg = config();
        let due = NaiveDate::from_ymd_opt(2026, 11, 5).unwrap();
        let record = Recipient::new(&id(1), "Maria", 15_000, due).with_document("991", None);

        let mut store = RecipientStore::new(3, 100);
        store.load(vec![record], clock.now());
        let executor = DeliveryExecutor::new(Box::new(transport.clone()), Arc::new(clock.clone()), &cfg)
            .with_documents(Box::new(fetcher));
        let mut orch = BatchOrchestrator::new("run-note", &cfg, store, executor, Arc::new(clock.clone()));

        let summary = orch.run().await;
        let r = orch.store().get(&id(1)).unwrap();
        assert_eq!(r.status, DeliveryStatus::Sent);
        assert!(r.note.is_none());
        assert!(summary.degraded.is_empty());
        assert_eq!(
            transport.sent()[0].attachment.as_deref(),
            Some(std::path::Path::new("/tmp/fatura-991.pdf"))
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_still_reports_summary() {
        let dir = std::env::temp_dir().join("dunning-orchestrator-db-failure-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("runs.db");
        std::fs::remove_file(&path).ok();
        let transport = ScriptedTransport::connected();
        let clock = ManualClock::default();
        let mut orch = orchestrator(&config(), recipients(2), &transport, &clock)
            .with_db(RunDb::open(&path).unwrap())
            .unwrap();

        let other = rusqlite::Connection::open(&path).unwrap();
        other
            .execute_batch("DROP TABLE run_recipients; DROP TABLE runs;")
            .unwrap();

        let summary = orch.run().await;
        assert_eq!(summary.phase, RunPhase::Error);
        assert!(summary.halt_reason.unwrap().contains("Persistence error"));
        assert!(transport.send_calls().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_session_closed_at_run_end() {
        let transport = ScriptedTransport::connected();
        let clock = ManualClock::default();
        let mut orch = orchestrator(&config(), recipients(1), &transport, &clock);

        orch.run().await;
        assert_eq!(transport.send_calls(), vec![id(1)]);
        assert!(!transport.is_connected());
    }
}
