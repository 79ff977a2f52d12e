// =============================================================================
// Sync Engine
// =============================================================================
//
// Facade the host app talks to. It owns every subsystem and runs them on
// lifecycle triggers. A cycle is, in order:
//
//   1. finish an incomplete anonymous-to-member migration (local only)
//   2. connectivity check (cached, short TTL)
//   3. System A drain through the forwarder
//   4. System B pending sync
//   5. webhook retry
//
// There is no background worker. Cycles never fail; they return a report.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use super::forward::Forwarder;
use super::local_queue::{DrainOutcome, LocalQueue, QueueLimits};
use super::pending::{PendingIndex, PendingSync, SyncCounts};
use super::webhook::{WebhookCounts, WebhookRetry};
use crate::cache::{ReportCache, SqliteReportCache};
use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityCache, ConnectivityProbe, HttpProbe};
use crate::db::LocalStore;
use crate::dmf::{DmfClient, RegulatorEndpoint};
use crate::error::Result;
use crate::identity::{Identity, IdentityResolver, Session};
use crate::migration::{IdentityMigration, MigrationOutcome};
use crate::model::{AnonymousId, HarvestPayload, HistoryEntry, QueuedReport, ReportId, StoredReport, Unsynced};
use crate::rewards::RewardsLedger;

/// What started a sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Launch,
    Foreground,
    PullToRefresh,
    SignIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another cycle was already running
    Busy,
    Offline,
}

/// Aggregated result of one cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub trigger: Trigger,
    pub skipped: Option<SkipReason>,
    pub local: DrainOutcome,
    pub pending: SyncCounts,
    pub webhooks: WebhookCounts,
}

impl CycleReport {
    fn skipped(trigger: Trigger, reason: SkipReason) -> Self {
        Self {
            trigger,
            skipped: Some(reason),
            local: DrainOutcome::default(),
            pending: SyncCounts::default(),
            webhooks: WebhookCounts::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignInOutcome {
    /// Present when anonymous work was migrated during sign-in
    pub migration: Option<MigrationOutcome>,
    pub cycle: CycleReport,
}

/// Snapshot for status screens
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub is_member: bool,
    pub queued: usize,
    pub pending: usize,
    pub history: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SyncEngine {
    config: EngineConfig,
    cache: Arc<dyn ReportCache>,
    identity: IdentityResolver,
    connectivity: ConnectivityCache,
    queue: LocalQueue,
    pending: PendingSync,
    forwarder: Forwarder,
    webhooks: WebhookRetry,
    rewards: RewardsLedger,
    migration: IdentityMigration,
    cycle_lock: Arc<Mutex<()>>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        pool: SqlitePool,
        cache: Arc<dyn ReportCache>,
        regulator: Arc<dyn RegulatorEndpoint>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        let store = LocalStore::new(pool);
        let identity = IdentityResolver::new(store.clone());
        let connectivity = ConnectivityCache::new(probe, config.connectivity_ttl);
        let index = PendingIndex::new(store.clone());
        let queue = LocalQueue::new(
            store.clone(),
            index.clone(),
            QueueLimits {
                max_retries: config.max_queue_retries,
                max_history: config.max_history_entries,
                max_failed: config.max_failed_entries,
            },
        );
        let rewards = RewardsLedger::new(cache.clone(), store.clone());
        let pending = PendingSync::new(
            index.clone(),
            cache.clone(),
            regulator.clone(),
            identity.clone(),
            queue.clone(),
            config.max_dmf_attempts,
        );
        let forwarder = Forwarder::new(
            cache.clone(),
            regulator.clone(),
            identity.clone(),
            rewards.clone(),
            config.current_drawing_id.clone(),
            config.max_queue_retries,
        );
        let webhooks = WebhookRetry::new(cache.clone(), regulator, index, config.max_webhook_attempts);
        let migration = IdentityMigration::new(cache.clone(), rewards.clone(), store);

        Self {
            config,
            cache,
            identity,
            connectivity,
            queue,
            pending,
            forwarder,
            webhooks,
            rewards,
            migration,
            cycle_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Production wiring: SQLite cache, HTTP regulator client, HTTP probe
    pub fn open(config: EngineConfig, pool: SqlitePool) -> Result<Self> {
        let cache = Arc::new(SqliteReportCache::new(pool.clone()));
        let regulator = Arc::new(DmfClient::new(&config)?);
        let probe = Arc::new(HttpProbe::new(config.connectivity_url.clone(), config.request_timeout));
        Ok(Self::new(config, pool, cache, regulator, probe))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Accept a report. Works offline; the returned local confirmation number
    /// can be shown right away.
    pub async fn submit_report(&self, payload: HarvestPayload) -> QueuedReport {
        self.queue.enqueue(payload).await
    }

    pub async fn run_cycle(&self, trigger: Trigger) -> CycleReport {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            log::debug!("Sync cycle ({:?}) skipped, another cycle is running", trigger);
            return CycleReport::skipped(trigger, SkipReason::Busy);
        };

        self.reconcile_identity().await;

        if !self.connectivity.is_online().await {
            log::info!("Sync cycle ({:?}) skipped, offline", trigger);
            return CycleReport::skipped(trigger, SkipReason::Offline);
        }

        log::info!("Sync cycle started ({:?})", trigger);
        let forwarder = &self.forwarder;
        let local = self.queue.drain(|item| forwarder.forward(item)).await;
        let pending = self.pending.sync().await;
        let webhooks = self.webhooks.run().await;

        if local.failed > 0 || pending.failed > 0 {
            // Next trigger probes again instead of trusting a stale "online"
            self.connectivity.invalidate().await;
        }

        let report = CycleReport {
            trigger,
            skipped: None,
            local,
            pending,
            webhooks,
        };
        log::info!(
            "Sync cycle finished ({:?}): local {}/{} synced, pending {} synced {} failed, webhooks {}/{}",
            trigger,
            report.local.synced,
            report.local.synced + report.local.failed,
            report.pending.synced,
            report.pending.failed,
            report.webhooks.succeeded,
            report.webhooks.retried
        );
        report
    }

    /// Store the session, migrate anonymous work to the member, then sync
    pub async fn sign_in(&self, session: Session) -> Result<SignInOutcome> {
        let was_anonymous = !self.identity.current().await?.is_member();
        self.identity.set_session(&session).await?;

        let anonymous_id = self.identity.anonymous_id().await?;
        let migration = if was_anonymous || self.migration_outstanding(&anonymous_id).await {
            self.migrate(&anonymous_id, &session).await
        } else {
            None
        };

        let cycle = self.run_cycle(Trigger::SignIn).await;
        Ok(SignInOutcome { migration, cycle })
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.identity.clear_session().await
    }

    pub async fn current_identity(&self) -> Result<Identity> {
        self.identity.current().await
    }

    /// Finish a migration an earlier sign-in left incomplete
    async fn reconcile_identity(&self) {
        let session = match self.identity.session().await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Session unavailable, skipping migration check: {}", e);
                return;
            }
        };
        let anonymous_id = match self.identity.anonymous_id().await {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Anonymous id unavailable, skipping migration check: {}", e);
                return;
            }
        };

        if !self.migration_outstanding(&anonymous_id).await {
            return;
        }
        log::info!("Anonymous work left behind for {}, migrating again", session.user_id);
        self.migrate(&anonymous_id, &session).await;
    }

    async fn migration_outstanding(&self, anonymous_id: &AnonymousId) -> bool {
        match self.migration.is_outstanding(anonymous_id).await {
            Ok(outstanding) => outstanding,
            Err(e) => {
                log::warn!("Failed to check for unmigrated work: {}", e);
                false
            }
        }
    }

    async fn migrate(&self, anonymous_id: &AnonymousId, session: &Session) -> Option<MigrationOutcome> {
        match self.migration.migrate(anonymous_id, session).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                // Picked up again by the next cycle
                log::error!("Identity migration to {} failed: {}", session.user_id, e);
                None
            }
        }
    }

    /// Every report not yet accepted by the regulator, each exactly once
    pub async fn unsynced(&self) -> Vec<Unsynced> {
        let mut seen = HashSet::new();
        let mut unsynced = Vec::new();

        for queued in self.queue.queued().await {
            if seen.insert(queued.local_id) {
                unsynced.push(Unsynced::LocalOnly(queued));
            }
        }
        for id in self.pending.index().ids().await {
            if !seen.insert(id) {
                log::warn!("Report {} is tracked by both stores", id);
                continue;
            }
            // Accepted reports stay tracked only until their confirmation goes out
            match self.cache.get(id).await {
                Ok(Some(report)) if report.dmf_status.is_accepted() => {}
                Ok(Some(_)) => unsynced.push(Unsynced::CacheResident(id)),
                // Dangling; dropped by the next pending sync
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Failed to read pending report {}: {}", id, e);
                    unsynced.push(Unsynced::CacheResident(id));
                }
            }
        }
        unsynced
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.queue.history().await
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            is_member: matches!(self.identity.current().await, Ok(Identity::Member(_))),
            queued: self.queue.queued().await.len(),
            pending: self.pending.index().ids().await.len(),
            history: self.queue.history().await.len(),
            failed: self.queue.failed().await.len(),
        }
    }

    /// Explicit drawing opt-in for the current identity
    pub async fn enter_drawing(&self, drawing_id: &str) -> Result<bool> {
        let identity = self.identity.current().await?;
        self.rewards.enter_drawing(&identity, drawing_id).await
    }

    pub async fn retry_report(&self, id: ReportId) -> Result<StoredReport> {
        self.pending.retry_report(id).await
    }

    pub async fn requeue_failed(&self, local_id: ReportId) -> Result<bool> {
        self.queue.requeue_failed(local_id).await
    }
}
