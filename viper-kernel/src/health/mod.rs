/**
 * HEALTH - Vérification concurrente de la joignabilité des nœuds
 *
 * RÔLE : pour chaque nœud, connexion TCP puis (si le protocole s'y prête)
 * HEAD HTTP, avec retries, et classification online / offline / suspect.
 *
 * FONCTIONNEMENT :
 * - Au plus `max_concurrent` vérifications en vol (Semaphore partagé)
 * - Un nœud dont la vérification panique devient "unknown", le lot continue
 * - Les résultats sortent dans l'ordre des entrées
 * - Délai global par nœud (check_timeout) au-dessus des timeouts TCP/HTTP ;
 *   à expiration, l'état de la dernière tentative fait foi
 *
 * SOUS-MODULES :
 * - probe   : sondes TCP / HTTP réelles derrière le trait Probe
 * - updater : écriture des statuts vers le datastore, par chunks
 * - runner  : cycle complet sélection → vérification → écriture → résumé
 */

pub mod probe;
pub mod runner;
pub mod updater;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::config::HealthConf;
use crate::lifecycle::now_timestamp;
use crate::models::{HealthCheckResult, HealthStatus, Node, Protocol, ProtocolClass};
use probe::{millis, url_host, NetProbe, Probe, ProbeError};

/// Réglages du checker, dérivés de la section `health` de la config.
#[derive(Debug, Clone)]
pub struct CheckerSettings {
    pub tcp_timeout: Duration,
    pub http_timeout: Duration,
    pub check_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_concurrent: usize,
}

impl From<&HealthConf> for CheckerSettings {
    fn from(conf: &HealthConf) -> Self {
        Self {
            tcp_timeout: Duration::from_millis(conf.tcp_timeout_ms),
            http_timeout: Duration::from_millis(conf.http_timeout_ms),
            check_timeout: Duration::from_millis(conf.check_timeout_ms),
            max_retries: conf.max_retries,
            retry_delay: Duration::from_millis(conf.retry_delay_ms),
            max_concurrent: conf.max_concurrent.max(1),
        }
    }
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self::from(&HealthConf::default())
    }
}

/// Ce qu'il faut savoir d'un nœud pour le vérifier.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckTarget {
    pub node_id: String,
    pub protocol: String,
    pub host: String,
    /// 0 = port absent ou invalide.
    pub port: u16,
}

impl From<&Node> for CheckTarget {
    fn from(node: &Node) -> Self {
        Self {
            node_id: node
                .id
                .clone()
                .or_else(|| crate::identity::identity_key(node))
                .unwrap_or_default(),
            protocol: node.protocol.clone(),
            host: node.host.clone(),
            port: node.port,
        }
    }
}

/// Table de décision : TCP d'abord, puis HTTP, puis la classe du protocole.
pub fn classify(tcp_ok: bool, http_ok: bool, class: ProtocolClass) -> HealthStatus {
    match (tcp_ok, http_ok) {
        (false, _) => HealthStatus::Offline,
        (true, true) => HealthStatus::Online,
        (true, false) if class == ProtocolClass::Tunneling => HealthStatus::Online,
        (true, false) => HealthStatus::Suspect,
    }
}

pub struct HealthChecker<P: Probe = NetProbe> {
    probe: Arc<P>,
    settings: CheckerSettings,
}

impl HealthChecker<NetProbe> {
    pub fn from_config(conf: &HealthConf) -> Result<Self, ProbeError> {
        Ok(Self::with_probe(NetProbe::new()?, CheckerSettings::from(conf)))
    }
}

impl<P: Probe> HealthChecker<P> {
    pub fn with_probe(probe: P, settings: CheckerSettings) -> Self {
        Self { probe: Arc::new(probe), settings }
    }

    pub fn settings(&self) -> &CheckerSettings {
        &self.settings
    }

    /// Vérifie un nœud (retries inclus) ; ne renvoie jamais d'erreur.
    pub async fn check_node(&self, target: &CheckTarget) -> HealthCheckResult {
        check_target(self.probe.clone(), self.settings.clone(), target.clone()).await
    }

    /// Vérifie un lot avec concurrence bornée ; un résultat par entrée, même ordre.
    pub async fn check_batch(&self, targets: &[CheckTarget]) -> Vec<HealthCheckResult> {
        let outcomes = self.fan_out(targets, check_target).await;
        outcomes
            .into_iter()
            .zip(targets)
            .map(|(outcome, target)| match outcome {
                Ok(result) => result,
                Err(e) => {
                    warn!("[health] check task failed for {}: {}", target.node_id, e);
                    failed_result(target, HealthStatus::Unknown, format!("Check exception: {e}"), 0)
                }
            })
            .collect()
    }

    /// `rounds` connexions TCP successives par nœud ; None = essai échoué.
    pub async fn sample_batch(
        &self,
        targets: &[CheckTarget],
        rounds: usize,
    ) -> Vec<Vec<Option<u32>>> {
        let outcomes = self
            .fan_out(targets, move |probe, settings, target| async move {
                let mut samples = Vec::with_capacity(rounds);
                for _ in 0..rounds {
                    let sample = probe
                        .tcp_connect(&target.host, target.port, settings.tcp_timeout)
                        .await
                        .ok()
                        .map(millis);
                    samples.push(sample);
                }
                samples
            })
            .await;
        outcomes
            .into_iter()
            .map(|outcome| outcome.unwrap_or_else(|_| vec![None; rounds]))
            .collect()
    }

    async fn fan_out<T, F, Fut>(
        &self,
        targets: &[CheckTarget],
        work: F,
    ) -> Vec<Result<T, JoinError>>
    where
        F: Fn(Arc<P>, CheckerSettings, CheckTarget) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent));
        let handles: Vec<_> = targets
            .iter()
            .map(|target| {
                let permits = permits.clone();
                let job = work(self.probe.clone(), self.settings.clone(), target.clone());
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    job.await
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(handle.await);
        }
        outcomes
    }
}

/// État de la dernière tentative, conservé si le délai global expire.
#[derive(Debug, Default)]
struct AttemptState {
    tcp_ok: bool,
    http_ok: bool,
    latency_ms: Option<u32>,
    error_message: Option<String>,
    retry_count: u32,
}

async fn check_target<P: Probe>(
    probe: Arc<P>,
    settings: CheckerSettings,
    target: CheckTarget,
) -> HealthCheckResult {
    if target.host.trim().is_empty() || target.port == 0 {
        return failed_result(&target, HealthStatus::Offline, "Invalid host or port".into(), 0);
    }

    let protocol = Protocol::parse(&target.protocol);
    let mut state = AttemptState::default();
    let attempts = run_attempts(&*probe, &settings, &target, protocol.http_scheme(), &mut state);
    let finished = tokio::time::timeout(settings.check_timeout, attempts).await;
    if finished.is_err() {
        debug!(
            "[health] check timeout for {}:{} (tcp_ok={})",
            target.host, target.port, state.tcp_ok
        );
        state.error_message = Some("Health check timeout".into());
    }

    HealthCheckResult {
        node_id: target.node_id.clone(),
        host: target.host.clone(),
        port: target.port,
        status: classify(state.tcp_ok, state.http_ok, protocol.class()),
        tcp_ok: state.tcp_ok,
        http_ok: state.http_ok,
        latency_ms: state.latency_ms,
        error_message: state.error_message,
        retry_count: state.retry_count,
        checked_at: now_timestamp(),
    }
}

async fn run_attempts<P: Probe>(
    probe: &P,
    settings: &CheckerSettings,
    target: &CheckTarget,
    http_scheme: Option<&str>,
    state: &mut AttemptState,
) {
    let head_url = http_scheme
        .map(|scheme| format!("{}://{}:{}/", scheme, url_host(&target.host), target.port));

    for attempt in 0..=settings.max_retries {
        state.retry_count = attempt;
        match probe.tcp_connect(&target.host, target.port, settings.tcp_timeout).await {
            Ok(elapsed) => {
                state.tcp_ok = true;
                state.http_ok = false;
                state.latency_ms = Some(millis(elapsed));
                match &head_url {
                    // Pas de HEAD pertinent : la connexion TCP suffit.
                    None => {
                        state.http_ok = true;
                        state.error_message = None;
                        return;
                    }
                    Some(url) => match probe.http_head(url, settings.http_timeout).await {
                        Ok(_) => {
                            state.http_ok = true;
                            state.error_message = None;
                            return;
                        }
                        Err(e) => state.error_message = Some(e.to_string()),
                    },
                }
            }
            Err(e) => {
                state.tcp_ok = false;
                state.http_ok = false;
                state.latency_ms = None;
                state.error_message = Some(e.to_string());
            }
        }

        if attempt < settings.max_retries {
            debug!("[health] retry {} for {}:{}", attempt + 1, target.host, target.port);
            tokio::time::sleep(settings.retry_delay).await;
        }
    }
}

fn failed_result(
    target: &CheckTarget,
    status: HealthStatus,
    message: String,
    retry_count: u32,
) -> HealthCheckResult {
    HealthCheckResult {
        node_id: target.node_id.clone(),
        host: target.host.clone(),
        port: target.port,
        status,
        tcp_ok: false,
        http_ok: false,
        latency_ms: None,
        error_message: Some(message),
        retry_count,
        checked_at: now_timestamp(),
    }
}
