//! Client side of the node agents' collection protocol.
//!
//! Each node is independent: an unreachable or refusing node is skipped and
//! only nodes that accepted a start are asked for results.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use knb_monitor::protocol::{results_path, ErrorBody, ErrorCode, StartCollection, COLLECTIONS_PATH, SYSINFO_PATH};

use crate::cluster::{ClusterControl, ClusterError, PodQuery, Tunnel, POD_NAME, POD_NODE};
use crate::labels::{selector, with_role, Role, SESSION_LABEL};

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("cannot reach agent on {node}: {reason}")]
    Connect { node: String, reason: String },
    #[error("collection {id} already in progress on {node}")]
    AlreadyInProgress { node: String, id: String },
    #[error("collection {id} still running on {node}")]
    StillRunning { node: String, id: String },
    #[error("collection {id} failed on {node}: {message}")]
    Failed { node: String, id: String, message: String },
    #[error("agent on {node} does not know collection {id}")]
    UnknownId { node: String, id: String },
    #[error("agent on {node} answered {status}: {message}")]
    Unexpected { node: String, status: u16, message: String },
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A connection to one node's agent.
#[async_trait]
pub trait AgentSession: Send + Sync {
    fn node(&self) -> &str;

    async fn start_collection(&self, id: &str, duration: Duration) -> Result<(), CollectionError>;

    /// Streams the finished archive of `id` into `dest`.
    async fn fetch_results(&self, id: &str, dest: &Path) -> Result<(), CollectionError>;

    async fn system_info(&self, dest: &Path) -> Result<(), CollectionError>;
}

#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, node: &str) -> Result<Box<dyn AgentSession>, CollectionError>;
}

/// How the controller reaches the agents.
#[derive(Clone)]
pub enum AgentRoute {
    /// `http://<node>:<port>`; agents use host networking.
    Direct,
    /// Through `kubectl port-forward` to the session's agent pod on the node.
    Tunneled {
        cluster: Arc<dyn ClusterControl>,
        session_id: String,
    },
}

pub struct HttpAgentConnector {
    client: reqwest::Client,
    port: u16,
    route: AgentRoute,
}

impl HttpAgentConnector {
    pub fn new(port: u16, request_timeout: Duration, route: AgentRoute) -> Result<Self, CollectionError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CollectionError::Connect {
                node: "*".into(),
                reason: e.to_string(),
            })?;
        Ok(Self { client, port, route })
    }

    async fn tunnel(&self, cluster: &dyn ClusterControl, session_id: &str, node: &str) -> Result<Tunnel, CollectionError> {
        let connect_err = |reason: String| CollectionError::Connect {
            node: node.to_string(),
            reason,
        };
        let sel = with_role(&selector(SESSION_LABEL, session_id), Role::Monitor);
        let fields = [POD_NAME];
        let rows = cluster
            .query_pods(PodQuery::new(&sel, &fields).on_node(node))
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        let pod = rows
            .into_iter()
            .find_map(|row| row.into_iter().next())
            .ok_or_else(|| connect_err(format!("no agent pod matching {sel}")))?;

        cluster
            .establish_tunnel(&format!("pod/{pod}"), self.port)
            .await
            .map_err(|e| connect_err(e.to_string()))
    }
}

#[async_trait]
impl AgentConnector for HttpAgentConnector {
    async fn connect(&self, node: &str) -> Result<Box<dyn AgentSession>, CollectionError> {
        let (base, tunnel) = match &self.route {
            AgentRoute::Direct => (format!("http://{}:{}", node, self.port), None),
            AgentRoute::Tunneled { cluster, session_id } => {
                let tunnel = self.tunnel(cluster.as_ref(), session_id, node).await?;
                (format!("http://127.0.0.1:{}", tunnel.local_port), Some(tunnel))
            }
        };
        debug!("agent on {} at {}", node, base);
        Ok(Box::new(HttpAgentSession {
            node: node.to_string(),
            base,
            client: self.client.clone(),
            _tunnel: tunnel,
        }))
    }
}

pub struct HttpAgentSession {
    node: String,
    base: String,
    client: reqwest::Client,
    _tunnel: Option<Tunnel>,
}

impl HttpAgentSession {
    fn transport(&self, e: reqwest::Error) -> CollectionError {
        CollectionError::Connect {
            node: self.node.clone(),
            reason: e.to_string(),
        }
    }

    /// Maps an error response onto the protocol's error kinds.
    async fn protocol_error(&self, id: &str, resp: reqwest::Response) -> CollectionError {
        let status = resp.status();
        let node = self.node.clone();
        let id = id.to_string();
        match resp.json::<ErrorBody>().await {
            Ok(body) => match body.code {
                ErrorCode::AlreadyInProgress => CollectionError::AlreadyInProgress { node, id },
                ErrorCode::StillInProgress => CollectionError::StillRunning { node, id },
                ErrorCode::CollectionFailed => CollectionError::Failed {
                    node,
                    id,
                    message: body.message,
                },
                ErrorCode::UnknownId => CollectionError::UnknownId { node, id },
                ErrorCode::Internal => CollectionError::Unexpected {
                    node,
                    status: status.as_u16(),
                    message: body.message,
                },
            },
            Err(e) => CollectionError::Unexpected {
                node,
                status: status.as_u16(),
                message: e.to_string(),
            },
        }
    }

    /// Streams a successful response body into `dest`, removing the partial
    /// file on failure.
    async fn download(&self, resp: reqwest::Response, dest: &Path) -> Result<(), CollectionError> {
        let io_err = |source| CollectionError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = File::create(dest).await.map_err(io_err)?;
        let mut stream = resp.bytes_stream();

        let result = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| self.transport(e))?;
                file.write_all(&chunk).await.map_err(io_err)?;
            }
            file.flush().await.map_err(io_err)
        }
        .await;

        if result.is_err() {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }
}

#[async_trait]
impl AgentSession for HttpAgentSession {
    fn node(&self) -> &str {
        &self.node
    }

    async fn start_collection(&self, id: &str, duration: Duration) -> Result<(), CollectionError> {
        let req = StartCollection {
            collection_id: id.to_string(),
            duration_secs: duration.as_secs(),
        };
        let resp = self
            .client
            .post(format!("{}{}", self.base, COLLECTIONS_PATH))
            .json(&req)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        match resp.status() {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(()),
            _ => Err(self.protocol_error(id, resp).await),
        }
    }

    async fn fetch_results(&self, id: &str, dest: &Path) -> Result<(), CollectionError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base, results_path(id)))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        if !resp.status().is_success() {
            return Err(self.protocol_error(id, resp).await);
        }
        self.download(resp, dest).await
    }

    async fn system_info(&self, dest: &Path) -> Result<(), CollectionError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base, SYSINFO_PATH))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        if !resp.status().is_success() {
            return Err(self.protocol_error("sysinfo", resp).await);
        }
        self.download(resp, dest).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionPolicy {
    /// Extra fetch attempts while a node reports the collection still running.
    pub fetch_retries: u32,
    pub fetch_delay: Duration,
}

/// A node that accepted a collection start.
pub struct CollectionRecord {
    session: Box<dyn AgentSession>,
}

impl CollectionRecord {
    pub fn node(&self) -> &str {
        self.session.node()
    }
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub node: String,
    pub result: Result<PathBuf, CollectionError>,
}

pub fn archive_name(node: &str) -> String {
    format!("perf-{node}.tar.bz2")
}

pub struct CollectionCoordinator {
    connector: Arc<dyn AgentConnector>,
    policy: CollectionPolicy,
}

impl CollectionCoordinator {
    pub fn new(connector: Arc<dyn AgentConnector>, policy: CollectionPolicy) -> Self {
        Self { connector, policy }
    }

    /// Starts collection `id` on every node; returns the nodes that accepted.
    pub async fn start(&self, id: &str, duration: Duration, nodes: &[String]) -> Vec<CollectionRecord> {
        let attempts = nodes.iter().map(|node| async move {
            let session = self.connector.connect(node).await?;
            session.start_collection(id, duration).await?;
            Ok::<_, CollectionError>(CollectionRecord { session })
        });

        let mut accepted = Vec::new();
        for (node, result) in nodes.iter().zip(join_all(attempts).await) {
            match result {
                Ok(record) => {
                    info!("collection {} started on {}", id, node);
                    accepted.push(record);
                }
                Err(e) => warn!("skipping collection on {}: {}", node, e),
            }
        }
        accepted
    }

    /// Fetches each accepted node's archive into `dir`.
    pub async fn finish(&self, id: &str, records: Vec<CollectionRecord>, dir: &Path) -> Vec<FetchOutcome> {
        let fetches = records.iter().map(|record| async move {
            let dest = dir.join(archive_name(record.node()));
            let result = self.fetch(record.session.as_ref(), id, &dest).await.map(|_| dest);
            FetchOutcome {
                node: record.node().to_string(),
                result,
            }
        });
        let outcomes = join_all(fetches).await;

        for outcome in &outcomes {
            match &outcome.result {
                Ok(path) => info!("collection {} from {} saved to {}", id, outcome.node, path.display()),
                Err(e) => warn!("collection {} from {} lost: {}", id, outcome.node, e),
            }
        }
        outcomes
    }

    async fn fetch(&self, session: &dyn AgentSession, id: &str, dest: &Path) -> Result<(), CollectionError> {
        let mut attempt = 0;
        loop {
            match session.fetch_results(id, dest).await {
                Err(CollectionError::StillRunning { .. }) if attempt < self.policy.fetch_retries => {
                    attempt += 1;
                    debug!(
                        "collection {} still running on {} (retry {}/{})",
                        id,
                        session.node(),
                        attempt,
                        self.policy.fetch_retries
                    );
                    tokio::time::sleep(self.policy.fetch_delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Nodes hosting any pod of the run, deduplicated.
pub async fn run_nodes(cluster: &dyn ClusterControl, run_selector: &str) -> Result<Vec<String>, ClusterError> {
    let fields = [POD_NAME, POD_NODE];
    let rows = cluster.query_pods(PodQuery::new(run_selector, &fields)).await?;
    let nodes: BTreeSet<String> = rows.into_iter().filter_map(|row| row.into_iter().nth(1)).collect();
    Ok(nodes.into_iter().collect())
}
