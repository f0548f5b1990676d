/**
 * SYNC - Orchestrateur de synchronisation et scheduler
 *
 * RÔLE :
 * Possède l'ensemble de travail (snapshot local) et enchaîne, pour chaque lot
 * reçu (poll ou webhook) : parsing → dédup → merge → cycle de vie → empreinte
 * → écriture (snapshot puis datastore). Lance aussi les cycles de vérification
 * qui re-testent les nœuds arrivés au TTL et mettent à jour leurs scores.
 *
 * FONCTIONNEMENT :
 * - Un seul cycle à la fois (verrou async) : un déclenchement concurrent attend son tour
 * - Empreinte identique à la dernière écrite : aucun write, statut "unchanged"
 * - L'empreinte n'avance que si toutes les écritures datastore ont réussi,
 *   sinon le cycle suivant réessaie
 * - La phase courante (idle/fetching/reconciling/verifying/persisting) est exposée
 *
 * SCHEDULER :
 * Boucles poll / vérification / health check pilotées par un CancellationToken ;
 * stop() annule les boucles et attend leur fin (un cycle en cours est abandonné,
 * le snapshot étant écrit de façon atomique).
 */

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Mutex as CycleLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SyncConf;
use crate::health::probe::{NetProbe, Probe};
use crate::health::runner::HealthRunner;
use crate::health::{CheckTarget, HealthChecker};
use crate::identity::content_hash;
use crate::lifecycle::{
    apply_lifecycle, format_timestamp, mark_offline, mark_verified, LifecyclePolicy,
};
use crate::models::{parse_batch, HealthStatus, Node};
use crate::reconcile::{deduplicate, merge_with_existing};
use crate::scoring::ScoringPolicy;
use crate::state::{new_state, read_copy, Shared};
use crate::status::StatusTracker;
use crate::store::{NodeUpsert, RestStore, Snapshot, SnapshotStore, SyncMetadata, UpsertReport};
use crate::upstream::UpstreamClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Reconciling,
    Verifying,
    Persisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    Poll,
    Webhook,
    Verification,
}

impl SyncSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Webhook => "webhook",
            Self::Verification => "verification",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Updated,
    Unchanged,
    PartialSuccess,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    pub cycle_id: String,
    pub status: SyncStatus,
    pub source: SyncSource,
    pub total: usize,
    pub active: usize,
    pub stale: usize,
    pub evicted: usize,
    pub needs_verification: usize,
    pub online: usize,
    pub offline: usize,
    pub suspect: usize,
    pub update_success: usize,
    pub update_fail: usize,
    pub rejected: usize,
    pub deduplicated: usize,
    pub hash: Option<String>,
    pub message: Option<String>,
    pub synced_at: String,
}

impl SyncSummary {
    pub fn failed(source: SyncSource, message: String) -> Self {
        Self::build(SyncStatus::Error, source, &[], CycleCounts::default(), None, Some(message))
    }

    fn build(
        status: SyncStatus,
        source: SyncSource,
        nodes: &[Node],
        counts: CycleCounts,
        hash: Option<String>,
        message: Option<String>,
    ) -> Self {
        let with_status = |s: HealthStatus| nodes.iter().filter(|n| n.status == Some(s)).count();
        let stale = nodes.iter().filter(|n| n.is_stale).count();
        Self {
            cycle_id: Uuid::new_v4().to_string(),
            status,
            source,
            total: nodes.len(),
            active: nodes.len() - stale,
            stale,
            evicted: counts.evicted,
            needs_verification: nodes.iter().filter(|n| n.needs_verification).count(),
            online: with_status(HealthStatus::Online),
            offline: with_status(HealthStatus::Offline),
            suspect: with_status(HealthStatus::Suspect),
            update_success: counts.update_success,
            update_fail: counts.update_fail,
            rejected: counts.rejected,
            deduplicated: counts.deduplicated,
            hash,
            message,
            synced_at: format_timestamp(OffsetDateTime::now_utc()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CycleCounts {
    evicted: usize,
    rejected: usize,
    deduplicated: usize,
    update_success: usize,
    update_fail: usize,
}

/// Vue de l'état de sync pour GET /sync/status.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatistics {
    pub phase: SyncPhase,
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub stale_nodes: usize,
    pub offline_nodes: usize,
    pub needs_verification: usize,
    pub last_sync_hash: Option<String>,
    pub last_synced_at: Option<String>,
    pub last_synced_from: Option<String>,
    pub last_webhook_time: Option<String>,
    pub last_poll_time: Option<String>,
    pub last_verified_at: Option<String>,
    pub webhook_received_count: u64,
    pub poll_received_count: u64,
    pub metadata: SyncMetadata,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub lifecycle: LifecyclePolicy,
    pub verify_rounds: usize,
}

impl From<&SyncConf> for SyncSettings {
    fn from(conf: &SyncConf) -> Self {
        Self {
            lifecycle: LifecyclePolicy {
                ttl_days: conf.ttl_days,
                max_offline_days: conf.max_offline_days,
            },
            verify_rounds: conf.verify_rounds,
        }
    }
}

/// Remet la phase à Idle quand le cycle se termine, même abandonné.
struct PhaseGuard<'a> {
    phase: &'a Shared<SyncPhase>,
}

impl<'a> PhaseGuard<'a> {
    fn enter(phase: &'a Shared<SyncPhase>, next: SyncPhase) -> Self {
        *phase.lock() = next;
        Self { phase }
    }

    fn set(&self, next: SyncPhase) {
        *self.phase.lock() = next;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock() = SyncPhase::Idle;
    }
}

pub struct SyncOrchestrator<P: Probe = NetProbe> {
    settings: SyncSettings,
    snapshots: SnapshotStore,
    datastore: Option<RestStore>,
    upstream: Option<UpstreamClient>,
    checker: Arc<HealthChecker<P>>,
    scoring: ScoringPolicy,
    working: Shared<Snapshot>,
    phase: Shared<SyncPhase>,
    cycle: CycleLock<()>,
}

impl<P: Probe> SyncOrchestrator<P> {
    /// Charge le snapshot local ; illisible, on repart d'un ensemble vide.
    pub async fn open(
        settings: SyncSettings,
        snapshots: SnapshotStore,
        datastore: Option<RestStore>,
        upstream: Option<UpstreamClient>,
        checker: Arc<HealthChecker<P>>,
        scoring: ScoringPolicy,
    ) -> Self {
        let snapshot = snapshots.load().await.unwrap_or_else(|e| {
            warn!("[sync] failed to load snapshot {:?}: {}", snapshots.path(), e);
            Snapshot::default()
        });
        Self {
            settings,
            snapshots,
            datastore,
            upstream,
            checker,
            scoring,
            working: new_state(snapshot),
            phase: new_state(SyncPhase::Idle),
            cycle: CycleLock::new(()),
        }
    }

    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    pub fn has_datastore(&self) -> bool {
        self.datastore.is_some()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    pub fn working_set(&self) -> Vec<Node> {
        self.working.lock().nodes.clone()
    }

    pub fn sync_statistics(&self) -> SyncStatistics {
        let snapshot = read_copy(&self.working);
        let stale = snapshot.nodes.iter().filter(|n| n.is_stale).count();
        SyncStatistics {
            phase: self.phase(),
            total_nodes: snapshot.nodes.len(),
            active_nodes: snapshot.nodes.len() - stale,
            stale_nodes: stale,
            offline_nodes: snapshot.nodes.iter().filter(|n| n.offline_status).count(),
            needs_verification: snapshot.nodes.iter().filter(|n| n.needs_verification).count(),
            last_sync_hash: snapshot.sync.last_sync_hash,
            last_synced_at: snapshot.sync.last_synced_at,
            last_synced_from: snapshot.sync.last_synced_from,
            last_webhook_time: snapshot.sync.last_webhook_time,
            last_poll_time: snapshot.sync.last_poll_time,
            last_verified_at: snapshot.sync.last_verified_at,
            webhook_received_count: snapshot.sync.webhook_received_count,
            poll_received_count: snapshot.sync.poll_received_count,
            metadata: snapshot.sync.metadata,
        }
    }

    /// Cycle poll : fetch upstream puis réconciliation.
    pub async fn run_sync_cycle(&self) -> SyncSummary {
        let Some(upstream) = &self.upstream else {
            return SyncSummary::failed(SyncSource::Poll, "upstream source not configured".into());
        };
        let _cycle = self.cycle.lock().await;
        let phase = PhaseGuard::enter(&self.phase, SyncPhase::Fetching);

        match upstream.fetch_nodes().await {
            Ok(batch) => {
                self.reconcile(&phase, batch.nodes, SyncSource::Poll, batch.remote_timestamp)
                    .await
            }
            Err(e) => {
                error!("[sync] upstream fetch failed: {}", e);
                SyncSummary::failed(SyncSource::Poll, format!("upstream fetch failed: {e}"))
            }
        }
    }

    /// Lot poussé par la source (webhook) : même pipeline que le poll.
    pub async fn handle_incoming_batch(
        &self,
        records: Vec<Value>,
        remote_timestamp: Option<String>,
    ) -> SyncSummary {
        let _cycle = self.cycle.lock().await;
        let phase = PhaseGuard::enter(&self.phase, SyncPhase::Reconciling);
        self.reconcile(&phase, records, SyncSource::Webhook, remote_timestamp).await
    }

    async fn reconcile(
        &self,
        phase: &PhaseGuard<'_>,
        records: Vec<Value>,
        source: SyncSource,
        remote_timestamp: Option<String>,
    ) -> SyncSummary {
        phase.set(SyncPhase::Reconciling);
        let now = OffsetDateTime::now_utc();
        let now_ts = format_timestamp(now);

        let parsed = parse_batch(&records);
        let parsed_count = parsed.nodes.len();
        let remote = deduplicate(parsed.nodes, &now_ts);
        let counts = CycleCounts {
            rejected: parsed.rejected,
            deduplicated: parsed_count - remote.len(),
            ..Default::default()
        };

        let current = read_copy(&self.working);
        let merged = merge_with_existing(remote, current.nodes.clone(), &now_ts);
        let outcome = apply_lifecycle(merged, &self.settings.lifecycle, now);
        let hash = content_hash(&outcome.kept);
        let counts = CycleCounts { evicted: outcome.evicted.len(), ..counts };

        let same_hash = current.sync.last_sync_hash.as_deref() == Some(hash.as_str());
        if !current.nodes.is_empty() && same_hash {
            info!(
                "[sync] {} batch unchanged ({} nodes), skipping write",
                source.as_str(),
                outcome.kept.len()
            );
            return SyncSummary::build(
                SyncStatus::Unchanged,
                source,
                &outcome.kept,
                counts,
                Some(hash),
                None,
            );
        }

        let evicted = outcome.evicted;
        let mut next = Snapshot { nodes: outcome.kept, sync: current.sync };
        match source {
            SyncSource::Webhook => {
                next.sync.last_webhook_time = Some(now_ts.clone());
                next.sync.webhook_received_count += 1;
            }
            SyncSource::Poll => {
                next.sync.last_poll_time = Some(now_ts.clone());
                next.sync.poll_received_count += 1;
            }
            SyncSource::Verification => {}
        }
        next.sync.metadata.remote_timestamp = remote_timestamp;

        info!(
            "[sync] {} batch: {} received, {} rejected, {} duplicates, {} evicted",
            source.as_str(),
            records.len(),
            counts.rejected,
            counts.deduplicated,
            counts.evicted
        );
        self.commit(phase, next, &evicted, hash, source, counts, &now_ts).await
    }

    /// Re-vérifie les nœuds marqués needs_verification et met à jour leurs scores.
    pub async fn run_verification_cycle(&self) -> SyncSummary {
        let _cycle = self.cycle.lock().await;
        let phase = PhaseGuard::enter(&self.phase, SyncPhase::Verifying);
        let now = OffsetDateTime::now_utc();
        let now_ts = format_timestamp(now);

        let mut snapshot = read_copy(&self.working);
        let pending: Vec<usize> = snapshot
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.needs_verification)
            .map(|(index, _)| index)
            .collect();

        if pending.is_empty() {
            info!("[sync] no nodes need verification");
            return SyncSummary::build(
                SyncStatus::Unchanged,
                SyncSource::Verification,
                &snapshot.nodes,
                CycleCounts::default(),
                snapshot.sync.last_sync_hash.clone(),
                Some("no nodes need verification".into()),
            );
        }

        info!("[sync] verifying {} nodes", pending.len());
        let targets: Vec<CheckTarget> = pending
            .iter()
            .map(|&i| CheckTarget::from(&snapshot.nodes[i]))
            .collect();
        let results = self.checker.check_batch(&targets).await;

        let reachable: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r.status, HealthStatus::Online | HealthStatus::Suspect))
            .map(|(k, _)| k)
            .collect();
        let samples = if self.settings.verify_rounds > 0 && !reachable.is_empty() {
            let sample_targets: Vec<CheckTarget> =
                reachable.iter().map(|&k| targets[k].clone()).collect();
            self.checker.sample_batch(&sample_targets, self.settings.verify_rounds).await
        } else {
            Vec::new()
        };

        for (k, result) in results.iter().enumerate() {
            let node = &mut snapshot.nodes[pending[k]];
            node.status = Some(result.status);
            node.last_health_check = Some(result.checked_at.clone());
            node.health_latency = result.latency_ms;
            match result.status {
                HealthStatus::Online | HealthStatus::Suspect => {
                    mark_verified(node, &now_ts);
                    if result.latency_ms.is_some() {
                        node.latency_ms = result.latency_ms;
                    }
                }
                HealthStatus::Offline => mark_offline(node, &now_ts),
                // Vérification non concluante : les drapeaux restent en l'état.
                HealthStatus::Unknown => {}
            }
        }
        for (sample, &k) in samples.iter().zip(&reachable) {
            self.scoring.apply(&mut snapshot.nodes[pending[k]], sample);
        }

        snapshot.sync.last_verified_at = Some(now_ts.clone());
        let outcome = apply_lifecycle(snapshot.nodes, &self.settings.lifecycle, now);
        let hash = content_hash(&outcome.kept);
        let counts = CycleCounts { evicted: outcome.evicted.len(), ..Default::default() };
        let next = Snapshot { nodes: outcome.kept, sync: snapshot.sync };

        self.commit(
            &phase,
            next,
            &outcome.evicted,
            hash,
            SyncSource::Verification,
            counts,
            &now_ts,
        )
        .await
    }

    /// Écrit le datastore (si configuré) puis le snapshot, et publie le nouvel ensemble.
    /// Les lignes des nœuds évincés sont marquées should_delete dans le datastore.
    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        phase: &PhaseGuard<'_>,
        mut next: Snapshot,
        evicted: &[Node],
        hash: String,
        source: SyncSource,
        mut counts: CycleCounts,
        now_ts: &str,
    ) -> SyncSummary {
        phase.set(SyncPhase::Persisting);

        let report: Option<UpsertReport> = match &self.datastore {
            Some(store) => {
                let rows: Vec<NodeUpsert> = next
                    .nodes
                    .iter()
                    .filter_map(|node| NodeUpsert::from_node(node, now_ts))
                    .collect();
                let report = store.upsert_rows(&rows).await;
                if !evicted.is_empty() {
                    let failed = store.mark_evicted(evicted, now_ts).await;
                    info!(
                        "[sync] marked {} evicted rows ({} failed)",
                        evicted.len() - failed,
                        failed
                    );
                }
                Some(report)
            }
            None => None,
        };

        let (status, message) = match report {
            None => (SyncStatus::Updated, None),
            Some(r) if r.is_complete() => (SyncStatus::Updated, None),
            Some(r) if r.rows_written > 0 => (
                SyncStatus::PartialSuccess,
                Some(format!(
                    "{} of {} rows failed",
                    r.rows_failed,
                    r.rows_failed + r.rows_written
                )),
            ),
            Some(r) => (
                SyncStatus::Error,
                Some(format!("datastore rejected all {} rows", r.rows_failed)),
            ),
        };
        if let Some(r) = report {
            counts.update_success = r.rows_written;
            counts.update_fail = r.rows_failed;
        }
        if report.map_or(true, |r| r.is_complete()) {
            next.sync.last_sync_hash = Some(hash.clone());
        }

        next.sync.last_synced_at = Some(now_ts.to_string());
        next.sync.last_synced_from = Some(source.as_str().to_string());
        let stale = next.nodes.iter().filter(|n| n.is_stale).count();
        next.sync.metadata = SyncMetadata {
            total_count: next.nodes.len(),
            active_count: next.nodes.len() - stale,
            stale_count: stale,
            evicted_count: counts.evicted,
            deduplicated: counts.deduplicated,
            rejected: counts.rejected,
            needs_verification: next.nodes.iter().filter(|n| n.needs_verification).count(),
            remote_timestamp: next.sync.metadata.remote_timestamp.take(),
        };

        if let Err(e) = self.snapshots.save(&next).await {
            error!("[sync] failed to write snapshot {:?}: {}", self.snapshots.path(), e);
            return SyncSummary::build(
                SyncStatus::Error,
                source,
                &next.nodes,
                counts,
                None,
                Some(format!("snapshot write failed: {e}")),
            );
        }

        let summary = SyncSummary::build(status, source, &next.nodes, counts, Some(hash), message);
        *self.working.lock() = next;
        info!(
            "[sync] {} cycle {:?}: {} nodes ({} stale, {} offline), datastore {}/{}",
            source.as_str(),
            summary.status,
            summary.total,
            summary.stale,
            summary.offline,
            summary.update_success,
            summary.update_success + summary.update_fail
        );
        summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Périodes des boucles ; None désactive la boucle.
#[derive(Debug, Clone, Default)]
pub struct SchedulerIntervals {
    pub poll: Option<Duration>,
    pub verify: Option<Duration>,
    pub health: Option<Duration>,
    pub health_batch: usize,
}

impl SchedulerIntervals {
    pub fn from_config(cfg: &crate::config::KernelConfig) -> Self {
        let every = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        Self {
            poll: every(cfg.sync.poll_interval_secs),
            verify: every(cfg.sync.verify_interval_secs),
            health: every(cfg.health.interval_secs),
            health_batch: cfg.health.batch_size,
        }
    }
}

pub struct SyncScheduler {
    state: Shared<SchedulerState>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SyncScheduler {
    pub fn start<P: Probe>(
        orchestrator: Arc<SyncOrchestrator<P>>,
        runner: Arc<HealthRunner<P>>,
        status: StatusTracker,
        intervals: SchedulerIntervals,
        token: CancellationToken,
    ) -> Self {
        let mut handles = Vec::new();

        match intervals.poll {
            Some(period) if orchestrator.has_upstream() => {
                let orchestrator = orchestrator.clone();
                let status = status.clone();
                handles.push(spawn_loop("poll", period, true, token.clone(), move || {
                    let orchestrator = orchestrator.clone();
                    let status = status.clone();
                    async move {
                        let summary = orchestrator.run_sync_cycle().await;
                        status.record_sync(&summary);
                    }
                }));
            }
            Some(_) => info!("[scheduler] no upstream source, poll loop disabled"),
            None => {}
        }

        if let Some(period) = intervals.verify {
            let orchestrator = orchestrator.clone();
            let status = status.clone();
            handles.push(spawn_loop("verification", period, false, token.clone(), move || {
                let orchestrator = orchestrator.clone();
                let status = status.clone();
                async move {
                    let summary = orchestrator.run_verification_cycle().await;
                    status.record_sync(&summary);
                }
            }));
        }

        if let Some(period) = intervals.health {
            let batch = intervals.health_batch;
            handles.push(spawn_loop("health", period, false, token.clone(), move || {
                let runner = runner.clone();
                let status = status.clone();
                async move {
                    let summary = runner.run_health_check(Some(batch)).await;
                    status.record_health(&summary);
                }
            }));
        }

        info!("[scheduler] started {} loops", handles.len());
        Self { state: new_state(SchedulerState::Running), token, handles }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    pub fn state_handle(&self) -> Shared<SchedulerState> {
        self.state.clone()
    }

    /// Annule les boucles et attend qu'elles se terminent.
    pub async fn stop(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("[scheduler] loop ended abnormally: {}", e);
            }
        }
        *self.state.lock() = SchedulerState::Stopped;
        info!("[scheduler] stopped");
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    immediate: bool,
    token: CancellationToken,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let first = if immediate { Instant::now() } else { Instant::now() + period };
        let mut ticker = tokio::time::interval_at(first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("[scheduler] {} loop every {:?}", name, period);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = job() => {}
            }
        }
        info!("[scheduler] {} loop stopped", name);
    })
}
