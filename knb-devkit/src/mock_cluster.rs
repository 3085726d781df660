/*!
Scripted control plane

Answers cluster queries from per-field reply queues and records every call,
so tests can assert on what a run submitted, polled, fetched and deleted.
The last reply of a queue repeats once the queue runs dry.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;

use knb_controller::cluster::{ClusterControl, ClusterError, PodQuery, Tunnel, NOT_READY, POD_NAME, POD_NODE};
use knb_controller::exec::ExecError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    Submit(String),
    QueryPods {
        selector: String,
        node: Option<String>,
        fields: Vec<String>,
    },
    QueryService { selector: String, field: String },
    QueryNodes { field: String },
    FetchLogs { selector: String },
    Delete { kinds: Vec<String>, selector: String },
    Tunnel { target: String, port: u16 },
}

/// One scripted answer to a query.
#[derive(Debug, Clone)]
pub enum Reply {
    Lines(Vec<String>),
    Fail(String),
}

impl Reply {
    pub fn line(value: &str) -> Self {
        Reply::Lines(vec![value.to_string()])
    }

    /// The not-yet-assigned marker kubectl prints for empty fields.
    pub fn not_ready() -> Self {
        Reply::line(NOT_READY)
    }

    pub fn fail(message: &str) -> Self {
        Reply::Fail(message.to_string())
    }
}

fn failure(cmd: &str, message: &str) -> ClusterError {
    ClusterError::Exec(ExecError::Failed {
        cmd: cmd.to_string(),
        code: Some(1),
        stderr: message.to_string(),
    })
}

#[derive(Default)]
struct Script {
    pod_fields: HashMap<String, VecDeque<Reply>>,
    service_fields: HashMap<String, VecDeque<Reply>>,
    pod_nodes: Vec<(String, String)>,
    nodes: Vec<String>,
    failing_submits: Vec<String>,
    failing_logs: bool,
    failing_delete: bool,
    tunnel_port: u16,
}

fn next_reply(queue: Option<&mut VecDeque<Reply>>) -> Reply {
    match queue {
        Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Reply::Lines(Vec::new())),
        Some(queue) => queue.front().cloned().unwrap_or(Reply::Lines(Vec::new())),
        None => Reply::Lines(Vec::new()),
    }
}

#[derive(Default)]
pub struct MockCluster {
    script: Mutex<Script>,
    calls: Mutex<Vec<ClusterCall>>,
    manifests: Mutex<Vec<(String, String)>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies for a single-field pod query such as `.status.podIP`.
    pub fn with_pod_field(self, field: &str, replies: Vec<Reply>) -> Self {
        self.script.lock().pod_fields.insert(field.to_string(), replies.into());
        self
    }

    pub fn with_service_field(self, field: &str, replies: Vec<Reply>) -> Self {
        self.script.lock().service_fields.insert(field.to_string(), replies.into());
        self
    }

    /// Pods of the run as `(pod, node)` rows for node enumeration.
    pub fn with_pods_on_nodes(self, rows: &[(&str, &str)]) -> Self {
        self.script.lock().pod_nodes = rows.iter().map(|(p, n)| (p.to_string(), n.to_string())).collect();
        self
    }

    pub fn with_nodes(self, nodes: &[&str]) -> Self {
        self.script.lock().nodes = nodes.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Rejects manifests whose file name is `name`.
    pub fn failing_submit(self, name: &str) -> Self {
        self.script.lock().failing_submits.push(name.to_string());
        self
    }

    pub fn failing_logs(self) -> Self {
        self.script.lock().failing_logs = true;
        self
    }

    pub fn failing_delete(self) -> Self {
        self.script.lock().failing_delete = true;
        self
    }

    pub fn with_tunnel_port(self, port: u16) -> Self {
        self.script.lock().tunnel_port = port;
        self
    }

    fn record(&self, call: ClusterCall) {
        log::debug!("[mock cluster] {:?}", call);
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.calls.lock().clone()
    }

    /// File names of submitted manifests, in order.
    pub fn submitted(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::Submit(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Contents of the submitted manifest named `name`, last one wins.
    pub fn manifest(&self, name: &str) -> Option<String> {
        self.manifests
            .lock()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, body)| body.clone())
    }

    /// Number of pod queries asking for exactly `field`.
    pub fn pod_queries(&self, field: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ClusterCall::QueryPods { fields, .. } if fields.len() == 1 && fields[0] == field))
            .count()
    }

    pub fn service_queries(&self, field: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ClusterCall::QueryService { field: f, .. } if f == field))
            .count()
    }

    pub fn log_fetches(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::FetchLogs { selector } => Some(selector),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<(Vec<String>, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::Delete { kinds, selector } => Some((kinds, selector)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ClusterControl for MockCluster {
    async fn submit_manifest(&self, path: &Path) -> Result<(), ClusterError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.record(ClusterCall::Submit(name.clone()));

        if self.script.lock().failing_submits.contains(&name) {
            return Err(failure("kubectl apply", "admission webhook denied the request"));
        }
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| failure("kubectl apply", &e.to_string()))?;
        self.manifests.lock().push((name, body));
        Ok(())
    }

    async fn query_pods(&self, query: PodQuery<'_>) -> Result<Vec<Vec<String>>, ClusterError> {
        let fields: Vec<String> = query.fields.iter().map(|f| f.to_string()).collect();
        self.record(ClusterCall::QueryPods {
            selector: query.selector.to_string(),
            node: query.node.map(String::from),
            fields: fields.clone(),
        });

        let mut script = self.script.lock();
        if fields.len() == 1 {
            return match next_reply(script.pod_fields.get_mut(&fields[0])) {
                Reply::Lines(lines) => Ok(lines.into_iter().map(|l| vec![l]).collect()),
                Reply::Fail(message) => Err(failure("kubectl get pod", &message)),
            };
        }
        if fields == [POD_NAME, POD_NODE] {
            return Ok(script
                .pod_nodes
                .iter()
                .map(|(pod, node)| vec![pod.clone(), node.clone()])
                .collect());
        }
        Ok(Vec::new())
    }

    async fn query_service_field(&self, selector: &str, field: &str) -> Result<Vec<String>, ClusterError> {
        self.record(ClusterCall::QueryService {
            selector: selector.to_string(),
            field: field.to_string(),
        });
        match next_reply(self.script.lock().service_fields.get_mut(field)) {
            Reply::Lines(lines) => Ok(lines),
            Reply::Fail(message) => Err(failure("kubectl get service", &message)),
        }
    }

    async fn query_node_field(&self, field: &str) -> Result<Vec<String>, ClusterError> {
        self.record(ClusterCall::QueryNodes { field: field.to_string() });
        Ok(self.script.lock().nodes.clone())
    }

    async fn fetch_logs(&self, selector: &str) -> Result<Vec<u8>, ClusterError> {
        self.record(ClusterCall::FetchLogs {
            selector: selector.to_string(),
        });
        if self.script.lock().failing_logs {
            return Err(ClusterError::NotSingle {
                selector: selector.to_string(),
                rows: Vec::new(),
            });
        }
        Ok(format!("logs of {selector}\n").into_bytes())
    }

    async fn delete_by_label(&self, kinds: &[&str], selector: &str) -> Result<(), ClusterError> {
        self.record(ClusterCall::Delete {
            kinds: kinds.iter().map(|k| k.to_string()).collect(),
            selector: selector.to_string(),
        });
        if self.script.lock().failing_delete {
            return Err(failure("kubectl delete", "the server is currently unable to handle the request"));
        }
        Ok(())
    }

    async fn establish_tunnel(&self, target: &str, target_port: u16) -> Result<Tunnel, ClusterError> {
        self.record(ClusterCall::Tunnel {
            target: target.to_string(),
            port: target_port,
        });
        let port = self.script.lock().tunnel_port;
        Ok(Tunnel::detached(if port == 0 { target_port } else { port }))
    }
}
