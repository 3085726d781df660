use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::{ClusterControl, ClusterError, PodQuery, Tunnel, POD_NAME};
use crate::exec::Shell;

/// [`ClusterControl`] over the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
    shell: Shell,
    tunnel_wait: Duration,
}

impl Kubectl {
    pub fn new(shell: Shell, tunnel_wait: Duration) -> Self {
        Self {
            binary: "kubectl".to_string(),
            shell,
            tunnel_wait,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command(&self, args: &[&str]) -> String {
        let mut words = vec![self.binary.as_str()];
        words.extend_from_slice(args);
        shell_words::join(words)
    }

    async fn lines(&self, cmd: String) -> Result<Vec<String>, ClusterError> {
        info!("$ {}", cmd);
        Ok(self.shell.exec_cmd_lines(&cmd).await?)
    }

    async fn pod_name(&self, selector: &str) -> Result<String, ClusterError> {
        let mut names = self.query_pod_field(selector, POD_NAME).await?;
        if names.len() != 1 {
            return Err(ClusterError::NotSingle {
                selector: selector.to_string(),
                rows: names,
            });
        }
        Ok(names.remove(0))
    }
}

fn custom_columns(fields: &[&str]) -> String {
    let columns: Vec<String> = fields
        .iter()
        .enumerate()
        .map(|(idx, field)| format!("F{idx}:{field}"))
        .collect();
    format!("custom-columns={}", columns.join(","))
}

/// Extracts the local port from a `kubectl port-forward` status line such as
/// `Forwarding from 127.0.0.1:43567 -> 8451`.
pub fn parse_forwarded_port(line: &str) -> Option<u16> {
    let (local, remote) = line.split_once(" -> ")?;
    remote.trim().parse::<u16>().ok()?;
    let (_, port) = local.rsplit_once(':')?;
    port.trim().parse().ok()
}

#[async_trait]
impl ClusterControl for Kubectl {
    async fn submit_manifest(&self, path: &Path) -> Result<(), ClusterError> {
        let path = path.to_string_lossy();
        let cmd = self.command(&["apply", "-f", &*path]);
        info!("$ {}", cmd);
        Ok(self.shell.exec_cmd(&cmd).await?)
    }

    async fn query_pods(&self, query: PodQuery<'_>) -> Result<Vec<Vec<String>>, ClusterError> {
        let columns = custom_columns(query.fields);
        let field_selector = query.node.map(|node| format!("--field-selector=spec.nodeName={node}"));

        let mut args = vec!["get", "pod", "-l", query.selector];
        if let Some(fs) = &field_selector {
            args.push(fs.as_str());
        }
        args.extend(["-o", columns.as_str(), "--no-headers"]);

        let lines = self.lines(self.command(&args)).await?;
        Ok(lines
            .iter()
            .map(|line| line.split_whitespace().map(String::from).collect())
            .collect())
    }

    async fn query_service_field(&self, selector: &str, field: &str) -> Result<Vec<String>, ClusterError> {
        let columns = custom_columns(&[field]);
        self.lines(self.command(&["get", "service", "-l", selector, "-o", columns.as_str(), "--no-headers"]))
            .await
    }

    async fn query_node_field(&self, field: &str) -> Result<Vec<String>, ClusterError> {
        let columns = custom_columns(&[field]);
        self.lines(self.command(&["get", "nodes", "-o", columns.as_str(), "--no-headers"]))
            .await
    }

    async fn fetch_logs(&self, selector: &str) -> Result<Vec<u8>, ClusterError> {
        // `logs -l` truncates, so resolve the pod first
        let pod = self.pod_name(selector).await?;
        let cmd = self.command(&["logs", pod.as_str()]);
        info!("$ {}", cmd);
        Ok(self.shell.exec_cmd_output(&cmd).await?)
    }

    async fn delete_by_label(&self, kinds: &[&str], selector: &str) -> Result<(), ClusterError> {
        let kinds = kinds.join(",");
        let cmd = self.command(&["delete", kinds.as_str(), "-l", selector]);
        info!("$ {}", cmd);
        Ok(self.shell.exec_cmd(&cmd).await?)
    }

    async fn establish_tunnel(&self, target: &str, target_port: u16) -> Result<Tunnel, ClusterError> {
        let remote = format!(":{target_port}");
        info!("$ {}", self.command(&["port-forward", target, remote.as_str()]));

        let tunnel_err = |reason: String| ClusterError::Tunnel {
            target: target.to_string(),
            port: target_port,
            reason,
        };
        let mut child = Command::new(&self.binary)
            .args(["port-forward", target, remote.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| tunnel_err(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| tunnel_err("no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let wait_for_port = async {
            while let Some(line) = lines.next_line().await? {
                if let Some(port) = parse_forwarded_port(&line) {
                    return Ok(Some(port));
                }
            }
            Ok::<_, std::io::Error>(None)
        };

        let local_port = match tokio::time::timeout(self.tunnel_wait, wait_for_port).await {
            Err(_) => {
                return Err(ClusterError::TunnelTimeout {
                    target: target.to_string(),
                    port: target_port,
                    wait: self.tunnel_wait,
                })
            }
            Ok(Err(e)) => return Err(tunnel_err(e.to_string())),
            Ok(Ok(None)) => return Err(tunnel_err("port-forward exited".to_string())),
            Ok(Ok(Some(port))) => port,
        };
        debug!("port-forward {}:{} listening on {}", target, target_port, local_port);

        // keep draining so the forwarder never blocks on a full pipe
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

        Ok(Tunnel::new(local_port, child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kubectl(script: &str) -> Kubectl {
        Kubectl::new(Shell::new(Duration::from_secs(5)), Duration::from_millis(500)).with_binary(script)
    }

    #[test]
    fn parses_port_forward_lines() {
        assert_eq!(parse_forwarded_port("Forwarding from 127.0.0.1:43567 -> 8451"), Some(43567));
        assert_eq!(parse_forwarded_port("Forwarding from [::1]:43567 -> 8451"), Some(43567));
        assert_eq!(parse_forwarded_port("Handling connection for 43567"), None);
    }

    #[test]
    fn builds_quoted_commands() {
        let k = kubectl("kubectl");
        assert_eq!(
            k.command(&["get", "pod", "-l", "knb-runid=r 1,role=srv"]),
            "kubectl get pod -l 'knb-runid=r 1,role=srv'"
        );
        assert_eq!(custom_columns(&[POD_NAME, ".spec.nodeName"]), "custom-columns=F0:.metadata.name,F1:.spec.nodeName");
    }

    #[tokio::test]
    async fn pod_rows_split_into_columns() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-kubectl");
        std::fs::write(&script, "#!/bin/sh\nprintf 'knb-srv   k8s1\\nknb-cli   k8s2\\n'\n").unwrap();
        make_executable(&script);

        let k = kubectl(script.to_str().unwrap());
        let rows = k
            .query_pods(PodQuery::new("knb-runid=r1", &[POD_NAME, ".spec.nodeName"]))
            .await
            .unwrap();
        assert_eq!(rows, vec![vec!["knb-srv", "k8s1"], vec!["knb-cli", "k8s2"]]);
    }

    #[tokio::test]
    async fn tunnel_reports_local_port() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-kubectl");
        std::fs::write(&script, "#!/bin/sh\necho 'Forwarding from 127.0.0.1:40001 -> 8451'\nsleep 5\n").unwrap();
        make_executable(&script);

        let tunnel = kubectl(script.to_str().unwrap())
            .establish_tunnel("pod/knb-monitor-x", 8451)
            .await
            .unwrap();
        assert_eq!(tunnel.local_port, 40001);
    }

    #[tokio::test]
    async fn silent_tunnel_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-kubectl");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        make_executable(&script);

        let err = kubectl(script.to_str().unwrap())
            .establish_tunnel("pod/knb-monitor-x", 8451)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::TunnelTimeout { .. }));
    }

    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
