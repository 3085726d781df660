//! Node-side profiling backends.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::execution::CommandExecutor;
use crate::metrics::NodeReport;

/// Extra time granted to the record script beyond the requested duration.
const RECORD_SLACK: Duration = Duration::from_secs(60);
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
pub trait Recorder: Send + Sync + 'static {
    /// Records for `duration`; returns once the capture is complete.
    async fn record(&self, collection_id: &str, duration: Duration) -> Result<()>;

    /// Packages a finished capture and returns the archive path.
    async fn package(&self, collection_id: &str) -> Result<PathBuf>;

    async fn system_info(&self) -> Result<Vec<u8>>;
}

/// Drives the perf scripts shipped in the agent image.
#[derive(Debug, Clone)]
pub struct ScriptRecorder {
    scripts_dir: PathBuf,
    archive_dir: PathBuf,
}

impl ScriptRecorder {
    pub fn new(scripts_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    fn script(&self, name: &str) -> PathBuf {
        self.scripts_dir.join(name)
    }

    pub fn archive_path(&self, collection_id: &str) -> PathBuf {
        self.archive_dir.join(format!("{collection_id}-perf.data.tar.bz2"))
    }
}

#[async_trait]
impl Recorder for ScriptRecorder {
    async fn record(&self, collection_id: &str, duration: Duration) -> Result<()> {
        let secs = duration.as_secs().to_string();
        info!("recording {} for {}s", collection_id, secs);
        CommandExecutor::execute(
            &self.script("perf-record.sh"),
            &[&secs, collection_id],
            duration + RECORD_SLACK,
        )
        .await?
        .check("perf-record.sh")?;
        Ok(())
    }

    async fn package(&self, collection_id: &str) -> Result<PathBuf> {
        CommandExecutor::execute(&self.script("perf-collect.sh"), &[collection_id], SCRIPT_TIMEOUT)
            .await?
            .check("perf-collect.sh")?;
        Ok(self.archive_path(collection_id))
    }

    async fn system_info(&self) -> Result<Vec<u8>> {
        let script = self.script("system_info.sh");
        if !Path::new(&script).exists() {
            debug!("{} missing, reporting from sysinfo", script.display());
            return Ok(NodeReport::collect().render().into_bytes());
        }
        let result = CommandExecutor::execute(&script, &[], SCRIPT_TIMEOUT)
            .await?
            .check("system_info.sh")?;
        Ok(result.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn record_and_package_use_the_scripts() {
        let scripts = tempfile::tempdir().unwrap();
        let archives = tempfile::tempdir().unwrap();
        let out = archives.path().display().to_string();
        script(scripts.path(), "perf-record.sh", &format!("echo \"$1 $2\" > {out}/record.args"));
        script(scripts.path(), "perf-collect.sh", &format!("echo data > {out}/$1-perf.data.tar.bz2"));

        let rec = ScriptRecorder::new(scripts.path(), archives.path());
        rec.record("r1", Duration::from_secs(3)).await.unwrap();
        let args = std::fs::read_to_string(archives.path().join("record.args")).unwrap();
        assert_eq!(args.trim(), "3 r1");

        let archive = rec.package("r1").await.unwrap();
        assert_eq!(archive, archives.path().join("r1-perf.data.tar.bz2"));
        assert!(archive.exists());
    }

    #[tokio::test]
    async fn failing_record_script_is_an_error() {
        let scripts = tempfile::tempdir().unwrap();
        script(scripts.path(), "perf-record.sh", "echo 'perf not found' >&2; exit 127");
        let rec = ScriptRecorder::new(scripts.path(), "/tmp");
        let err = rec.record("r1", Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("perf not found"));
    }

    #[tokio::test]
    async fn system_info_falls_back_to_sysinfo() {
        let scripts = tempfile::tempdir().unwrap();
        let rec = ScriptRecorder::new(scripts.path(), "/tmp");
        let info = String::from_utf8(rec.system_info().await.unwrap()).unwrap();
        assert!(info.starts_with("hostname: "));

        script(scripts.path(), "system_info.sh", "echo custom-report");
        let info = rec.system_info().await.unwrap();
        assert_eq!(info, b"custom-report\n");
    }
}
