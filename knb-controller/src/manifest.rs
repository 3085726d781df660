//! Resource manifests for a run and for the session's agents.
//!
//! Every document is rendered in memory first and then written to
//! `<name>.tmp` and renamed, so a path handed back always names a complete
//! file.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::benchmark::Benchmark;
use crate::config::MonitorConf;
use crate::labels::{resource_name, yaml_label, Role, RUN_LABEL, SESSION_LABEL};
use crate::placement::ContainerSpec;
use crate::template::{compose, PrefixWriter, Renderers, Template, TemplateError, Vars};

pub const SERVER_MANIFEST: &str = "server.yaml";
pub const POLICY_MANIFEST: &str = "policy.yaml";
pub const CLIENT_MANIFEST: &str = "client.yaml";
pub const MONITOR_MANIFEST: &str = "monitor.yaml";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("rendering {name} failed: {source}")]
    Render {
        name: &'static str,
        #[source]
        source: TemplateError,
    },
    #[error("writing {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const SERVER_POD: &str = r#"apiVersion: v1
kind: Pod
metadata:
  name: {{.srvName}}
  labels:
    {{.sessLabel}}
    {{.runLabel}}
    role: srv
spec:
  {{template "srvSpec"}}
  containers:
  - {{template "srvContainer"}}
"#;

const SERVER_SERVICE: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{.srvName}}
  labels:
    {{.sessLabel}}
    {{.runLabel}}
spec:
  replicas: 1
  selector:
    matchLabels:
      {{.runLabel}}
      role: srv
  template:
    metadata:
      labels:
        {{.sessLabel}}
        {{.runLabel}}
        role: srv
    spec:
      {{template "srvSpec"}}
      containers:
      - {{template "srvContainer"}}
---
apiVersion: v1
kind: Service
metadata:
  name: {{.svcName}}
  labels:
    {{.sessLabel}}
    {{.runLabel}}
    role: srv
spec:
  type: {{.serviceType}}
  selector:
    {{.runLabel}}
    role: srv
  ports:
  {{template "srvPorts"}}
"#;

const PORT_POLICY: &str = r#"apiVersion: networking.k8s.io/v1
kind: NetworkPolicy
metadata:
  name: {{.policyName}}
  labels:
    {{.sessLabel}}
    {{.runLabel}}
spec:
  podSelector:
    matchLabels:
      {{.runLabel}}
      role: srv
  policyTypes:
  - Ingress
  ingress:
  - from:
    ports:
    {{template "policyPorts"}}
"#;

const CLIENT_POD: &str = r#"apiVersion: v1
kind: Pod
metadata:
  name: {{.cliName}}
  labels:
    {{.sessLabel}}
    {{.runLabel}}
    role: cli
spec:
  restartPolicy: Never
  {{template "cliHost"}}
  {{template "cliAffinity"}}
  containers:
  - {{template "cliContainer"}}
"#;

const MONITOR_DAEMONSET: &str = r#"apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: knb-monitor
  labels:
    {{.sessLabel}}
    role: monitor
spec:
  selector:
    matchLabels:
      {{.sessLabel}}
      role: monitor
  template:
    metadata:
      labels:
        {{.sessLabel}}
        role: monitor
    spec:
      tolerations:
      # lets the agent run on control-plane nodes too
      - key: node-role.kubernetes.io/master
        effect: NoSchedule
      - key: node-role.kubernetes.io/control-plane
        effect: NoSchedule
      hostNetwork: true
      hostPID: true
      hostIPC: true
      containers:
      - name: knb-monitor
        image: {{.image}}
        args: ["--port", "{{.port}}"]
        securityContext:
          privileged: true
          capabilities:
            add:
            - SYS_ADMIN
        ports:
        - containerPort: {{.port}}
          hostPort: {{.port}}
        volumeMounts:
        - name: tmp
          mountPath: /tmp
      volumes:
      - name: tmp
        hostPath:
          path: /tmp
"#;

fn render(name: &'static str, src: &str, vars: &Vars, renderers: &Renderers<'_>) -> Result<String, ManifestError> {
    let wrap = |source| ManifestError::Render { name, source };
    let template = Template::parse(src).map_err(wrap)?;
    let mut out = String::new();
    compose(&template, vars, renderers, &mut out).map_err(wrap)?;
    Ok(out)
}

/// Writes `contents` next to `path` and renames it into place.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), ManifestError> {
    let wrap = |source| ManifestError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    if let Err(e) = fs::write(&tmp, contents).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(wrap(e));
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(wrap(e));
    }
    Ok(())
}

/// Builds the documents of one run into its directory.
pub struct ManifestBuilder<'r> {
    dir: &'r Path,
    benchmark: &'r dyn Benchmark,
    client: &'r ContainerSpec,
    server: &'r ContainerSpec,
    vars: Vars,
}

impl<'r> ManifestBuilder<'r> {
    pub fn new(
        dir: &'r Path,
        session_id: &str,
        run_id: &str,
        benchmark: &'r dyn Benchmark,
        client: &'r ContainerSpec,
        server: &'r ContainerSpec,
    ) -> Self {
        let mut vars = Vars::new();
        vars.insert("runId".into(), run_id.to_string());
        vars.insert("sessLabel".into(), yaml_label(SESSION_LABEL, session_id));
        vars.insert("runLabel".into(), yaml_label(RUN_LABEL, run_id));
        vars.insert("srvName".into(), resource_name(run_id, Role::Server.as_str()));
        vars.insert("cliName".into(), resource_name(run_id, Role::Client.as_str()));
        vars.insert("svcName".into(), resource_name(run_id, "svc"));
        vars.insert("policyName".into(), resource_name(run_id, "policy"));
        Self {
            dir,
            benchmark,
            client,
            server,
            vars,
        }
    }

    fn server_renderers(&self) -> Renderers<'_> {
        Renderers::new()
            .with("srvSpec", |pw: &mut PrefixWriter<'_>, vars: &Vars| self.server.write_pod_spec(pw, vars))
            .with("srvContainer", |pw: &mut PrefixWriter<'_>, vars: &Vars| {
                self.benchmark.write_server_container(pw, vars)
            })
            .with("srvPorts", |pw: &mut PrefixWriter<'_>, vars: &Vars| {
                self.benchmark.write_server_ports(pw, vars)
            })
    }

    pub fn render_server_pod(&self) -> Result<String, ManifestError> {
        render(SERVER_MANIFEST, SERVER_POD, &self.vars, &self.server_renderers())
    }

    pub fn render_server_service(&self, service_type: &str) -> Result<String, ManifestError> {
        let mut vars = self.vars.clone();
        vars.insert("serviceType".into(), service_type.to_string());
        render(SERVER_MANIFEST, SERVER_SERVICE, &vars, &self.server_renderers())
    }

    /// Ingress limited to `ports` on the run's server.
    pub fn render_policy(&self, ports: &[u16]) -> Result<String, ManifestError> {
        let renderers = Renderers::new().with("policyPorts", |pw: &mut PrefixWriter<'_>, _: &Vars| {
            for port in ports {
                pw.line("- protocol: TCP")?;
                pw.line(&format!("  port: {port}"))?;
            }
            Ok(())
        });
        render(POLICY_MANIFEST, PORT_POLICY, &self.vars, &renderers)
    }

    pub fn render_client(&self, server_ip: &str) -> Result<String, ManifestError> {
        let mut vars = self.vars.clone();
        vars.insert("serverIP".into(), server_ip.to_string());
        let renderers = Renderers::new()
            .with("cliHost", |pw: &mut PrefixWriter<'_>, vars: &Vars| self.client.write_host_opts(pw, vars))
            .with("cliAffinity", |pw: &mut PrefixWriter<'_>, vars: &Vars| self.client.write_affinity(pw, vars))
            .with("cliContainer", |pw: &mut PrefixWriter<'_>, vars: &Vars| {
                self.benchmark.write_client_container(pw, vars)
            });
        render(CLIENT_MANIFEST, CLIENT_POD, &vars, &renderers)
    }

    async fn write(&self, name: &str, contents: Result<String, ManifestError>) -> Result<PathBuf, ManifestError> {
        let contents = contents?;
        let path = self.dir.join(name);
        info!("Generating {}", path.display());
        write_atomic(&path, &contents).await?;
        Ok(path)
    }

    pub async fn server_pod(&self) -> Result<PathBuf, ManifestError> {
        self.write(SERVER_MANIFEST, self.render_server_pod()).await
    }

    pub async fn server_service(&self, service_type: &str) -> Result<PathBuf, ManifestError> {
        self.write(SERVER_MANIFEST, self.render_server_service(service_type)).await
    }

    pub async fn policy(&self, ports: &[u16]) -> Result<PathBuf, ManifestError> {
        self.write(POLICY_MANIFEST, self.render_policy(ports)).await
    }

    /// Client document; only possible once the server address is known.
    pub async fn client(&self, server_ip: &str) -> Result<PathBuf, ManifestError> {
        self.write(CLIENT_MANIFEST, self.render_client(server_ip)).await
    }
}

pub fn render_monitor(session_id: &str, conf: &MonitorConf) -> Result<String, ManifestError> {
    let mut vars = Vars::new();
    vars.insert("sessLabel".into(), yaml_label(SESSION_LABEL, session_id));
    vars.insert("image".into(), conf.image.clone());
    vars.insert("port".into(), conf.port.to_string());
    render(MONITOR_MANIFEST, MONITOR_DAEMONSET, &vars, &Renderers::new())
}

/// The session's agent DaemonSet, written into the session directory.
pub async fn monitor_manifest(dir: &Path, session_id: &str, conf: &MonitorConf) -> Result<PathBuf, ManifestError> {
    let contents = render_monitor(session_id, conf)?;
    let path = dir.join(MONITOR_MANIFEST);
    info!("Generating {}", path.display());
    write_atomic(&path, &contents).await?;
    Ok(path)
}
