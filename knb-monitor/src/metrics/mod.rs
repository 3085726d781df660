//! Static node diagnostics served on `/sysinfo` when the image carries no
//! system-info script.

use serde::Serialize;
use std::fmt::Write;
use sysinfo::System;

/// Snapshot of the node the agent runs on
#[derive(Debug, Serialize)]
pub struct NodeReport {
    pub hostname: String,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub uptime_seconds: u64,
    pub load_avg: [f64; 3],
    pub cpu_brand: String,
    pub core_count: usize,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
}

impl NodeReport {
    pub fn collect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let load = System::load_average();
        let cpus = sys.cpus();

        NodeReport {
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            os: System::name(),
            os_version: System::os_version(),
            kernel_version: System::kernel_version(),
            uptime_seconds: System::uptime(),
            load_avg: [load.one, load.five, load.fifteen],
            cpu_brand: cpus.first().map(|c| c.brand().to_string()).unwrap_or_default(),
            core_count: cpus.len(),
            total_memory_mb: sys.total_memory() / (1024 * 1024),
            available_memory_mb: sys.available_memory() / (1024 * 1024),
        }
    }

    /// Plain `key: value` lines.
    pub fn render(&self) -> String {
        let unknown = || "unknown".to_string();
        let mut out = String::new();
        // writing to a String cannot fail
        let _ = writeln!(out, "hostname: {}", self.hostname);
        let _ = writeln!(out, "os: {}", self.os.clone().unwrap_or_else(unknown));
        let _ = writeln!(out, "os_version: {}", self.os_version.clone().unwrap_or_else(unknown));
        let _ = writeln!(out, "kernel: {}", self.kernel_version.clone().unwrap_or_else(unknown));
        let _ = writeln!(out, "uptime_seconds: {}", self.uptime_seconds);
        let _ = writeln!(
            out,
            "load_avg: {:.2} {:.2} {:.2}",
            self.load_avg[0], self.load_avg[1], self.load_avg[2]
        );
        let _ = writeln!(out, "cpu: {} x {}", self.core_count, self.cpu_brand);
        let _ = writeln!(
            out,
            "memory_mb: {} total, {} available",
            self.total_memory_mb, self.available_memory_mb
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_collection() {
        let report = NodeReport::collect();
        assert!(report.core_count > 0);
        assert!(report.total_memory_mb > 0);
        assert!(!report.hostname.is_empty());
    }

    #[test]
    fn test_report_rendering() {
        let report = NodeReport {
            hostname: "k8s1".into(),
            os: Some("Linux".into()),
            os_version: None,
            kernel_version: Some("6.1.0".into()),
            uptime_seconds: 42,
            load_avg: [0.5, 0.25, 0.0],
            cpu_brand: "Xeon".into(),
            core_count: 8,
            total_memory_mb: 16000,
            available_memory_mb: 12000,
        };
        let text = report.render();
        assert!(text.starts_with("hostname: k8s1\n"));
        assert!(text.contains("os_version: unknown\n"));
        assert!(text.contains("kernel: 6.1.0\n"));
        assert!(text.contains("load_avg: 0.50 0.25 0.00\n"));
        assert!(text.contains("cpu: 8 x Xeon\n"));
    }
}
