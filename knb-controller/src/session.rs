//! Sessions group runs under one directory and one fleet of node agents.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::{ClusterControl, ClusterError, Kubectl, NODE_NAME};
use crate::collection::{AgentConnector, AgentRoute, CollectionCoordinator, CollectionError, HttpAgentConnector};
use crate::config::KnbConfig;
use crate::exec::Shell;
use crate::labels::{selector, SESSION_LABEL};
use crate::manifest::{monitor_manifest, ManifestError};
use crate::run::{RunController, RunEnv, RunError, RunSpec};

pub const SESSION_LOG: &str = "log";
pub const WRAPPER_SCRIPT: &str = "knb";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session directory {0} already exists")]
    AlreadyExists(PathBuf),
    #[error("{path} exists but is not a directory")]
    NotADirectory { path: PathBuf },
    #[error("cannot create {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("failed to start agents: {0}")]
    StartAgents(#[source] ClusterError),
    #[error("failed to stop agents: {0}")]
    StopAgents(#[source] ClusterError),
    #[error("cannot list nodes: {0}")]
    Nodes(#[source] ClusterError),
    #[error("system info failed on {}", failed_nodes(.0))]
    SystemInfo(Vec<(String, CollectionError)>),
    #[error(transparent)]
    Connector(#[from] CollectionError),
}

fn failed_nodes(failures: &[(String, CollectionError)]) -> String {
    failures
        .iter()
        .map(|(node, e)| format!("{node} ({e})"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    base_dir: PathBuf,
    dir: PathBuf,
    port_forward: bool,
}

impl Session {
    fn new(id: &str, base_dir: &Path, port_forward: bool) -> Self {
        Self {
            id: id.to_string(),
            base_dir: base_dir.to_path_buf(),
            dir: base_dir.join(id),
            port_forward,
        }
    }

    /// Creates a fresh session; an existing directory is an error.
    pub async fn init(id: &str, base_dir: &Path, port_forward: bool) -> Result<Self, SessionError> {
        let session = Self::new(id, base_dir, port_forward);
        match fs::create_dir(&session.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(SessionError::AlreadyExists(session.dir)),
            Err(source) => {
                return Err(SessionError::Io {
                    path: session.dir,
                    source,
                })
            }
        }
        session.write_script().await?;
        Ok(session)
    }

    /// Reuses the session directory, creating it if missing.
    pub async fn open(id: &str, base_dir: &Path, port_forward: bool) -> Result<Self, SessionError> {
        let session = Self::new(id, base_dir, port_forward);
        match fs::metadata(&session.dir).await {
            Ok(meta) if meta.is_dir() => Ok(session),
            Ok(_) => Err(SessionError::NotADirectory { path: session.dir }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir(&session.dir).await.map_err(|source| SessionError::Io {
                    path: session.dir.clone(),
                    source,
                })?;
                session.write_script().await?;
                Ok(session)
            }
            Err(source) => Err(SessionError::Io {
                path: session.dir,
                source,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn port_forward(&self) -> bool {
        self.port_forward
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(SESSION_LOG)
    }

    pub fn script_path(&self) -> PathBuf {
        self.dir.join(WRAPPER_SCRIPT)
    }

    pub fn label_selector(&self) -> String {
        selector(SESSION_LABEL, &self.id)
    }

    fn script_body(&self, prog: &Path) -> String {
        let mut cmd = format!(
            "{} --session-id={} --session-base-dir={}",
            prog.display(),
            self.id,
            self.base_dir.display()
        );
        if self.port_forward {
            cmd.push_str(" --port-forward");
        }
        format!("#!/bin/sh\n# wrapper script for kubenetbench\n{cmd} \"$@\"\n")
    }

    /// `<dir>/knb`, so later commands need not repeat the session flags.
    async fn write_script(&self) -> Result<(), SessionError> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.script_path();
        let io_err = |source| SessionError::Io {
            path: path.clone(),
            source,
        };
        let prog = std::env::current_exe().map_err(io_err)?;
        fs::write(&path, self.script_body(&prog)).await.map_err(io_err)?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(io_err)?;
        info!("wrote wrapper script: you may use {}", path.display());
        Ok(())
    }
}

/// Owns the session's agents and hands out runs.
pub struct SessionController {
    session: Session,
    config: KnbConfig,
    cluster: Arc<dyn ClusterControl>,
    connector: Arc<dyn AgentConnector>,
    cancel: CancellationToken,
}

impl SessionController {
    pub fn new(
        session: Session,
        config: KnbConfig,
        cluster: Arc<dyn ClusterControl>,
        connector: Arc<dyn AgentConnector>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            config,
            cluster,
            connector,
            cancel,
        }
    }

    /// Wires `kubectl` and the HTTP agent client from the configuration.
    pub fn with_kubectl(session: Session, config: KnbConfig, cancel: CancellationToken) -> Result<Self, SessionError> {
        let shell = Shell::new(config.command_timeout());
        let cluster: Arc<dyn ClusterControl> = Arc::new(Kubectl::new(
            shell,
            Duration::from_secs(config.monitor.tunnel_wait_secs),
        ));
        let route = if session.port_forward() {
            AgentRoute::Tunneled {
                cluster: cluster.clone(),
                session_id: session.id().to_string(),
            }
        } else {
            AgentRoute::Direct
        };
        let connector = HttpAgentConnector::new(
            config.monitor.port,
            Duration::from_secs(config.monitor.request_timeout_secs),
            route,
        )?;
        Ok(Self::new(session, config, cluster, Arc::new(connector), cancel))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &KnbConfig {
        &self.config
    }

    pub async fn start_agents(&self) -> Result<PathBuf, SessionError> {
        let path = monitor_manifest(self.session.dir(), self.session.id(), &self.config.monitor).await?;
        self.cluster
            .submit_manifest(&path)
            .await
            .map_err(SessionError::StartAgents)?;
        info!("agents of session {} submitted", self.session.id());
        Ok(path)
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.cluster
            .delete_by_label(&["daemonset"], &self.session.label_selector())
            .await
            .map_err(SessionError::StopAgents)
    }

    /// Saves every node's system report as `<dir>/<node>.sysinfo`. Nodes are
    /// tried independently; the failures are reported together.
    pub async fn collect_system_info(&self) -> Result<Vec<PathBuf>, SessionError> {
        let nodes = self
            .cluster
            .query_node_field(NODE_NAME)
            .await
            .map_err(SessionError::Nodes)?;

        let results = join_all(nodes.iter().map(|node| self.node_system_info(node))).await;

        let mut saved = Vec::new();
        let mut failed = Vec::new();
        for (node, result) in nodes.into_iter().zip(results) {
            match result {
                Ok(path) => saved.push(path),
                Err(e) => failed.push((node, e)),
            }
        }
        if failed.is_empty() {
            Ok(saved)
        } else {
            Err(SessionError::SystemInfo(failed))
        }
    }

    async fn node_system_info(&self, node: &str) -> Result<PathBuf, CollectionError> {
        let retries = self.config.monitor.sysinfo_retries;
        let delay = Duration::from_secs(self.config.monitor.sysinfo_delay_secs);
        let dest = self.session.dir().join(format!("{node}.sysinfo"));

        let mut remaining = retries;
        loop {
            info!("fetching system info from {} (remaining retries: {})", node, remaining);
            let attempt = async {
                let agent = self.connector.connect(node).await?;
                agent.system_info(&dest).await
            };
            match attempt.await {
                Ok(()) => return Ok(dest),
                Err(e) if remaining == 0 => return Err(e),
                Err(e) => {
                    warn!("system info from {}: {}", node, e);
                    remaining -= 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn run_env(&self) -> RunEnv {
        RunEnv {
            session_id: self.session.id().to_string(),
            session_dir: self.session.dir().to_path_buf(),
            cluster: self.cluster.clone(),
            collector: Some(Arc::new(CollectionCoordinator::new(
                self.connector.clone(),
                self.config.collection_policy(),
            ))),
            policy: self.config.run_policy(),
            cancel: self.cancel.clone(),
        }
    }

    pub async fn new_run(&self, spec: RunSpec) -> Result<RunController, RunError> {
        RunController::prepare(self.run_env(), spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_refuses_existing_directory() {
        let base = tempfile::tempdir().unwrap();
        let session = Session::init("s1", base.path(), false).await.unwrap();
        assert!(session.dir().is_dir());
        assert_eq!(session.log_path(), base.path().join("s1").join("log"));

        let err = Session::init("s1", base.path(), false).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn open_reuses_or_creates() {
        let base = tempfile::tempdir().unwrap();
        Session::init("s1", base.path(), false).await.unwrap();
        let reopened = Session::open("s1", base.path(), false).await.unwrap();
        assert_eq!(reopened.dir(), base.path().join("s1"));

        let fresh = Session::open("s2", base.path(), true).await.unwrap();
        assert!(fresh.script_path().exists());
    }

    #[tokio::test]
    async fn wrapper_script_repeats_session_flags() {
        use std::os::unix::fs::PermissionsExt;

        let base = tempfile::tempdir().unwrap();
        let session = Session::init("s1", base.path(), true).await.unwrap();
        let script = std::fs::read_to_string(session.script_path()).unwrap();
        let expected_tail = format!(
            " --session-id=s1 --session-base-dir={} --port-forward \"$@\"\n",
            base.path().display()
        );
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.ends_with(&expected_tail));

        let mode = std::fs::metadata(session.script_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
