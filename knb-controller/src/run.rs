//! One benchmark run: submit the server, wait for its address, submit the
//! client, wait for it to finish, then collect, save logs and clean up.
//!
//! The main sequence stops at its first error. Teardown (ending collection,
//! saving logs, cleanup) runs afterwards on every path, including errors and
//! cancellation, and its failures never replace the main outcome.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::benchmark::{Benchmark, BenchmarkConf};
use crate::cluster::{ClusterControl, ClusterError, NOT_READY, POD_IP, POD_PHASE, RUN_RESOURCE_KINDS, SERVICE_IP};
use crate::collection::{run_nodes, CollectionCoordinator, CollectionRecord, FetchOutcome};
use crate::labels::{check_run_label, selector, with_role, LabelError, Role, RUN_LABEL};
use crate::manifest::{ManifestBuilder, ManifestError};
use crate::placement::ContainerSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub initial_delay: Duration,
    /// Attempts after the first one.
    pub retries: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPolicy {
    pub pod_readiness: ReadinessPolicy,
    pub service_readiness: ReadinessPolicy,
    pub settle: Duration,
    pub phase_poll: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// Server is a pod reached at its pod IP; optionally isolated by a port
    /// policy.
    PodToPod { port_policy: bool },
    /// Server is a deployment behind a service of the given type.
    Service { service_type: String },
}

impl Topology {
    pub fn name(&self) -> &'static str {
        match self {
            Topology::PodToPod { .. } => "pod2pod",
            Topology::Service { .. } => "service",
        }
    }
}

/// Everything the command line decides about a run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub label: String,
    pub topology: Topology,
    pub client: ContainerSpec,
    pub server: ContainerSpec,
    pub cleanup: bool,
    pub benchmark: BenchmarkConf,
    pub collect_perf: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    ServerSubmitted,
    ServerReady,
    PolicyApplied,
    ClientSubmitted,
    CollectionStarted,
    Waiting,
    Terminal,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("cannot create run directory {path}: {source}")]
    RunDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error(transparent)]
    ManifestGeneration(#[from] ManifestError),
    #[error("failed to submit {what}: {source}")]
    Submission {
        what: &'static str,
        #[source]
        source: ClusterError,
    },
    #[error("{what} address not ready after {attempts} attempts")]
    ReadinessTimeout { what: &'static str, attempts: u32 },
    #[error("failed to apply policy: {0}")]
    Policy(#[source] ClusterError),
    #[error("client execution failed")]
    ClientExecutionFailed,
    #[error("failed to query client phase: {0}")]
    PhaseQuery(#[source] ClusterError),
    #[error("run cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("failed to save {role} logs: {source}")]
    Logs {
        role: Role,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("cleanup failed: {0}")]
    Cleanup(#[source] ClusterError),
}

/// What happened to a run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub dir: PathBuf,
    /// First error of the main sequence, if any.
    pub outcome: Result<(), RunError>,
    pub teardown: Vec<TeardownError>,
    pub collected: Vec<FetchOutcome>,
}

impl RunReport {
    pub fn into_result(self) -> Result<(), RunError> {
        self.outcome
    }
}

/// Session-wide collaborators shared by every run.
#[derive(Clone)]
pub struct RunEnv {
    pub session_id: String,
    pub session_dir: PathBuf,
    pub cluster: Arc<dyn ClusterControl>,
    pub collector: Option<Arc<CollectionCoordinator>>,
    pub policy: RunPolicy,
    pub cancel: CancellationToken,
}

pub struct RunController {
    env: RunEnv,
    spec: RunSpec,
    run_id: String,
    dir: PathBuf,
    benchmark: Box<dyn Benchmark>,
    state: RunState,
}

impl fmt::Debug for RunController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunController")
            .field("run_id", &self.run_id)
            .field("dir", &self.dir)
            .field("state", &self.state)
            .finish()
    }
}

/// Creates `<session>/<label>-<stamp>`, appending `-2`, `-3`, ... while the
/// directory already exists. Returns the run id and the directory.
pub async fn create_run_dir(session_dir: &Path, label: &str, stamp: &str) -> Result<(String, PathBuf), RunError> {
    let base = format!("{label}-{stamp}");
    let mut n = 1u32;
    loop {
        let run_id = if n == 1 { base.clone() } else { format!("{base}-{n}") };
        let dir = session_dir.join(&run_id);
        match fs::create_dir(&dir).await {
            Ok(()) => return Ok((run_id, dir)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(source) => return Err(RunError::RunDir { path: dir, source }),
        }
    }
}

pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d%H%M%S").to_string()
}

impl RunController {
    /// Allocates the run id and its directory.
    pub async fn prepare(env: RunEnv, spec: RunSpec) -> Result<Self, RunError> {
        check_run_label(&spec.label)?;
        let (run_id, dir) = create_run_dir(&env.session_dir, &spec.label, &timestamp()).await?;
        info!("run {} in {}", run_id, dir.display());
        let benchmark = spec.benchmark.build();
        Ok(Self {
            env,
            spec,
            run_id,
            dir,
            benchmark,
            state: RunState::Created,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn enter(&mut self, state: RunState) {
        debug!("run {}: {:?} -> {:?}", self.run_id, self.state, state);
        self.state = state;
    }

    fn run_selector(&self) -> String {
        selector(RUN_LABEL, &self.run_id)
    }

    fn role_selector(&self, role: Role) -> String {
        with_role(&self.run_selector(), role)
    }

    fn manifests(&self) -> ManifestBuilder<'_> {
        ManifestBuilder::new(
            &self.dir,
            &self.env.session_id,
            &self.run_id,
            self.benchmark.as_ref(),
            &self.spec.client,
            &self.spec.server,
        )
    }

    /// Sleeps unless the run is cancelled first.
    async fn pause(&self, duration: Duration) -> Result<(), RunError> {
        tokio::select! {
            _ = self.env.cancel.cancelled() => Err(RunError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn submit(&self, what: &'static str, path: &Path) -> Result<(), RunError> {
        if self.env.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        self.env
            .cluster
            .submit_manifest(path)
            .await
            .map_err(|source| RunError::Submission { what, source })
    }

    /// Runs the whole run and reports its outcome.
    pub async fn execute(mut self) -> RunReport {
        let mut records = Vec::new();
        let outcome = self.main_sequence(&mut records).await;
        self.enter(RunState::Terminal);
        match &outcome {
            Ok(()) => info!("run {} succeeded", self.run_id),
            Err(e) => warn!("run {} failed: {}", self.run_id, e),
        }

        let collected = self.end_collection(records).await;

        let mut teardown = Vec::new();
        for role in [Role::Server, Role::Client] {
            if let Err(e) = self.save_logs(role).await {
                warn!("{}", e);
                teardown.push(e);
            }
        }
        if self.spec.cleanup {
            if let Err(e) = self.cleanup().await {
                warn!("{}", e);
                teardown.push(e);
            }
        } else {
            info!("leaving resources of run {} in place", self.run_id);
        }

        RunReport {
            run_id: self.run_id,
            dir: self.dir,
            outcome,
            teardown,
            collected,
        }
    }

    async fn main_sequence(&mut self, records: &mut Vec<CollectionRecord>) -> Result<(), RunError> {
        let server = match &self.spec.topology {
            Topology::PodToPod { .. } => self.manifests().server_pod().await?,
            Topology::Service { service_type } => self.manifests().server_service(service_type).await?,
        };
        self.submit("server", &server).await?;
        self.enter(RunState::ServerSubmitted);

        let server_ip = self.wait_server_address().await?;
        info!("server_ip={}", server_ip);
        self.enter(RunState::ServerReady);

        if let Topology::PodToPod { port_policy: true } = self.spec.topology {
            let policy = self.manifests().policy(&self.spec.benchmark.policy_ports()).await?;
            self.env.cluster.submit_manifest(&policy).await.map_err(RunError::Policy)?;
            self.enter(RunState::PolicyApplied);
        }

        let client = self.manifests().client(&server_ip).await?;
        self.submit("client", &client).await?;
        self.enter(RunState::ClientSubmitted);

        self.pause(self.env.policy.settle).await?;

        if self.spec.collect_perf {
            *records = self.start_collection().await;
            if !records.is_empty() {
                self.enter(RunState::CollectionStarted);
            }
        }

        self.enter(RunState::Waiting);
        self.pause(self.benchmark.duration()).await?;
        self.wait_client().await
    }

    async fn wait_server_address(&self) -> Result<String, RunError> {
        let srv = self.role_selector(Role::Server);
        let (what, policy) = match self.spec.topology {
            Topology::PodToPod { .. } => ("server pod", self.env.policy.pod_readiness),
            Topology::Service { .. } => ("service", self.env.policy.service_readiness),
        };

        self.pause(policy.initial_delay).await?;
        for attempt in 0..=policy.retries {
            if attempt > 0 {
                self.pause(policy.delay).await?;
            }
            let lines = match self.spec.topology {
                Topology::PodToPod { .. } => self.env.cluster.query_pod_field(&srv, POD_IP).await,
                Topology::Service { .. } => self.env.cluster.query_service_field(&srv, SERVICE_IP).await,
            };
            match lines {
                Ok(lines) => match lines.first().map(String::as_str) {
                    Some(addr) if !addr.is_empty() && addr != NOT_READY => return Ok(addr.to_string()),
                    _ => debug!("{} address not ready (attempt {})", what, attempt + 1),
                },
                Err(e) => warn!("querying {} address: {}", what, e),
            }
        }
        Err(RunError::ReadinessTimeout {
            what,
            attempts: policy.retries + 1,
        })
    }

    /// Polls the client's phase until it is terminal.
    async fn wait_client(&self) -> Result<(), RunError> {
        let cli = self.role_selector(Role::Client);
        loop {
            let lines = self
                .env
                .cluster
                .query_pod_field(&cli, POD_PHASE)
                .await
                .map_err(RunError::PhaseQuery)?;
            let phase = lines.first().map(String::as_str).unwrap_or_default();
            info!("client phase: {}", phase);
            match phase {
                "Succeeded" => return Ok(()),
                "Failed" => return Err(RunError::ClientExecutionFailed),
                _ => self.pause(self.env.policy.phase_poll).await?,
            }
        }
    }

    async fn start_collection(&self) -> Vec<CollectionRecord> {
        let Some(collector) = &self.env.collector else {
            warn!("perf collection requested but no agents are reachable");
            return Vec::new();
        };
        let nodes = match run_nodes(self.env.cluster.as_ref(), &self.run_selector()).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("cannot list nodes of run {}, skipping collection: {}", self.run_id, e);
                return Vec::new();
            }
        };
        info!("starting collection on {:?}", nodes);
        collector.start(&self.run_id, self.benchmark.duration(), &nodes).await
    }

    async fn end_collection(&self, records: Vec<CollectionRecord>) -> Vec<FetchOutcome> {
        match &self.env.collector {
            Some(collector) if !records.is_empty() => collector.finish(&self.run_id, records, &self.dir).await,
            _ => Vec::new(),
        }
    }

    async fn save_logs(&self, role: Role) -> Result<PathBuf, TeardownError> {
        let wrap = |source: Box<dyn std::error::Error + Send + Sync>| TeardownError::Logs { role, source };
        let logs = self
            .env
            .cluster
            .fetch_logs(&self.role_selector(role))
            .await
            .map_err(|e| wrap(Box::new(e)))?;
        let path = self.dir.join(format!("{role}.log"));
        fs::write(&path, logs).await.map_err(|e| wrap(Box::new(e)))?;
        info!("saved {} logs to {}", role, path.display());
        Ok(path)
    }

    async fn cleanup(&self) -> Result<(), TeardownError> {
        self.env
            .cluster
            .delete_by_label(RUN_RESOURCE_KINDS, &self.run_selector())
            .await
            .map_err(TeardownError::Cleanup)
    }
}
