/*!
In-memory node agents

Each node gets a real `CollectionStore` from the agent crate, so start and
fetch follow the agent's own bookkeeping without any HTTP in between.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use knb_controller::collection::{AgentConnector, AgentSession, CollectionError};
use knb_monitor::store::{ClaimError, CollectionStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    Connect(String),
    Start { node: String, id: String },
    Fetch { node: String, id: String },
    SystemInfo(String),
}

#[derive(Default)]
pub struct MockAgents {
    stores: Mutex<HashMap<String, Arc<CollectionStore>>>,
    unreachable: HashSet<String>,
    manual: bool,
    calls: Arc<Mutex<Vec<AgentCall>>>,
}

impl MockAgents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections to `node` fail.
    pub fn unreachable(mut self, node: &str) -> Self {
        self.unreachable.insert(node.to_string());
        self
    }

    /// Collections stay running until [`MockAgents::complete`] is called.
    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn store(&self, node: &str) -> Arc<CollectionStore> {
        self.stores
            .lock()
            .entry(node.to_string())
            .or_insert_with(|| Arc::new(CollectionStore::new()))
            .clone()
    }

    pub fn complete(&self, node: &str, id: &str, result: Result<(), String>) {
        self.store(node).complete(id, result);
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    /// Nodes asked for results of `id`.
    pub fn fetched(&self, id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                AgentCall::Fetch { node, id: i } if i == id => Some(node),
                _ => None,
            })
            .collect()
    }

    pub fn started(&self, id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                AgentCall::Start { node, id: i } if i == id => Some(node),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl AgentConnector for MockAgents {
    async fn connect(&self, node: &str) -> Result<Box<dyn AgentSession>, CollectionError> {
        self.calls.lock().push(AgentCall::Connect(node.to_string()));
        if self.unreachable.contains(node) {
            log::debug!("[mock agents] {} unreachable", node);
            return Err(CollectionError::Connect {
                node: node.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(MockAgentSession {
            node: node.to_string(),
            store: self.store(node),
            manual: self.manual,
            calls: self.calls.clone(),
        }))
    }
}

struct MockAgentSession {
    node: String,
    store: Arc<CollectionStore>,
    manual: bool,
    calls: Arc<Mutex<Vec<AgentCall>>>,
}

fn write_err(dest: &Path, source: std::io::Error) -> CollectionError {
    CollectionError::Io {
        path: dest.to_path_buf(),
        source,
    }
}

#[async_trait]
impl AgentSession for MockAgentSession {
    fn node(&self) -> &str {
        &self.node
    }

    async fn start_collection(&self, id: &str, _duration: Duration) -> Result<(), CollectionError> {
        self.calls.lock().push(AgentCall::Start {
            node: self.node.clone(),
            id: id.to_string(),
        });
        if !self.store.try_begin(id) {
            return Err(CollectionError::AlreadyInProgress {
                node: self.node.clone(),
                id: id.to_string(),
            });
        }
        if !self.manual {
            self.store.complete(id, Ok(()));
        }
        Ok(())
    }

    async fn fetch_results(&self, id: &str, dest: &Path) -> Result<(), CollectionError> {
        self.calls.lock().push(AgentCall::Fetch {
            node: self.node.clone(),
            id: id.to_string(),
        });
        let node = self.node.clone();
        match self.store.claim(id) {
            Ok(()) => tokio::fs::write(dest, format!("archive of {id} from {node}"))
                .await
                .map_err(|e| write_err(dest, e)),
            Err(ClaimError::StillInProgress(id)) => Err(CollectionError::StillRunning { node, id }),
            Err(ClaimError::Failed { id, message }) => Err(CollectionError::Failed { node, id, message }),
            Err(ClaimError::UnknownId(id)) => Err(CollectionError::UnknownId { node, id }),
        }
    }

    async fn system_info(&self, dest: &Path) -> Result<(), CollectionError> {
        self.calls.lock().push(AgentCall::SystemInfo(self.node.clone()));
        tokio::fs::write(dest, format!("hostname: {}\n", self.node))
            .await
            .map_err(|e| write_err(dest, e))
    }
}
