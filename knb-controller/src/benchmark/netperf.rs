use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::{Benchmark, BenchmarkError};
use crate::template::{param, PrefixWriter, TemplateError, Vars};

/// netserver control connection port.
pub const CONTROL_PORT: u16 = 12865;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_DATA_PORT: u16 = 8000;
const DEFAULT_CLI_COMMAND: &str = "netperf";
const DUPER_NETPERF: &str = "scripts/duper_netperf";
pub const DEFAULT_IMAGE: &str = "cilium/kubenetbench";

const OUTPUT_FIELDS_COMMON: &[&str] = &[
    "THROUGHPUT",
    "THROUGHPUT_UNITS",
    "THROUGHPUT_CONFID",
    "PROTOCOL",
    "ELAPSED_TIME",
    "LOCAL_SEND_CALLS",
    "LOCAL_BYTES_PER_SEND",
    "LOCAL_RECV_CALLS",
    "LOCAL_BYTES_PER_RECV",
    "REMOTE_SEND_CALLS",
    "REMOTE_BYTES_PER_SEND",
    "REMOTE_RECV_CALLS",
    "REMOTE_BYTES_PER_RECV",
    "LOCAL_SYSNAME",
    "LOCAL_RELEASE",
    "LOCAL_VERSION",
    "LOCAL_MACHINE",
    "REMOTEL_SYSNAME",
    "REMOTEL_RELEASE",
    "REMOTEL_VERSION",
    "REMOTEL_MACHINE",
    "COMMAND_LINE",
    "LOCAL_TRANSPORT_RETRANS",
    "REMOTE_TRANSPORT_RETRANS",
];

const OUTPUT_FIELDS_RR: &[&str] = &[
    "TRANSACTION_RATE",
    "P50_LATENCY",
    "P90_LATENCY",
    "RT_LATENCY",
    "MEAN_LATENCY",
    "STDEV_LATENCY",
    "REQUEST_SIZE",
    "RESPONSE_SIZE",
    "BURST_SIZE",
];

const OUTPUT_FIELDS_STREAM: &[&str] = &[
    "THROUGHPUT",
    "THROUGHPUT_UNITS",
    "THROUGHPUT_CONFID",
    "LOCAL_SEND_SIZE",
    "LOCAL_RECV_SIZE",
    "REMOTE_SEND_SIZE",
    "REMOTE_RECV_SIZE",
    "PROTOCOL",
    "LOCAL_SEND_CALLS",
    "LOCAL_BYTES_PER_SEND",
    "LOCAL_RECV_CALLS",
    "LOCAL_BYTES_PER_RECV",
    "REMOTE_SEND_CALLS",
    "REMOTE_BYTES_PER_SEND",
    "REMOTE_RECV_CALLS",
    "REMOTE_BYTES_PER_RECV",
    "LOCAL_SEND_THROUGHPUT",
    "LOCAL_RECV_THROUGHPUT",
    "REMOTE_SEND_THROUGHPUT",
    "REMOTE_RECV_THROUGHPUT",
    "LOCAL_SYSNAME",
    "LOCAL_RELEASE",
    "LOCAL_VERSION",
    "LOCAL_MACHINE",
    "REMOTEL_SYSNAME",
    "REMOTEL_RELEASE",
    "REMOTEL_VERSION",
    "REMOTEL_MACHINE",
    "COMMAND_LINE",
    "LOCAL_TRANSPORT_RETRANS",
    "REMOTE_TRANSPORT_RETRANS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetperfTest {
    TcpRr,
    TcpCrr,
    UdpRr,
    TcpStream,
    TcpMaerts,
    UdpStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetperfStyle {
    RequestResponse,
    Stream,
}

impl NetperfTest {
    pub fn name(self) -> &'static str {
        match self {
            NetperfTest::TcpRr => "tcp_rr",
            NetperfTest::TcpCrr => "tcp_crr",
            NetperfTest::UdpRr => "udp_rr",
            NetperfTest::TcpStream => "tcp_stream",
            NetperfTest::TcpMaerts => "tcp_maerts",
            NetperfTest::UdpStream => "udp_stream",
        }
    }

    pub fn style(self) -> NetperfStyle {
        match self {
            NetperfTest::TcpRr | NetperfTest::TcpCrr | NetperfTest::UdpRr => NetperfStyle::RequestResponse,
            NetperfTest::TcpStream | NetperfTest::TcpMaerts | NetperfTest::UdpStream => NetperfStyle::Stream,
        }
    }
}

impl fmt::Display for NetperfTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetperfTest {
    type Err = BenchmarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp_rr" => Ok(NetperfTest::TcpRr),
            "tcp_crr" => Ok(NetperfTest::TcpCrr),
            "udp_rr" => Ok(NetperfTest::UdpRr),
            "tcp_stream" => Ok(NetperfTest::TcpStream),
            "tcp_maerts" => Ok(NetperfTest::TcpMaerts),
            "udp_stream" => Ok(NetperfTest::UdpStream),
            other => Err(BenchmarkError::InvalidNetperfType(other.to_string())),
        }
    }
}

/// Parameters shared by every netperf test.
#[derive(Debug, Clone)]
pub struct NetperfConf {
    pub test: NetperfTest,
    pub timeout_secs: u64,
    pub data_port: u16,
    pub cli_command: String,
    pub image: String,
    pub pre_args: Vec<String>,
    pub args: Vec<String>,
    pub bench_args: Vec<String>,
}

impl NetperfConf {
    pub fn new(test: NetperfTest) -> Self {
        Self {
            test,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            data_port: DEFAULT_DATA_PORT,
            cli_command: DEFAULT_CLI_COMMAND.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            pre_args: Vec::new(),
            args: Vec::new(),
            bench_args: Vec::new(),
        }
    }

    /// Switches to the multi-stream wrapper script; zero leaves the
    /// configuration untouched.
    pub fn with_streams(mut self, nstreams: u32) -> Result<Self, BenchmarkError> {
        if nstreams == 0 {
            return Ok(self);
        }
        if self.cli_command != DEFAULT_CLI_COMMAND {
            return Err(BenchmarkError::StreamsUnsupported(self.cli_command));
        }
        self.cli_command = DUPER_NETPERF.to_string();
        self.pre_args.push(nstreams.to_string());
        Ok(self)
    }
}

pub struct Netperf {
    conf: NetperfConf,
}

impl Netperf {
    pub fn new(conf: NetperfConf) -> Self {
        Self { conf }
    }

    pub fn style(&self) -> NetperfStyle {
        self.conf.test.style()
    }

    fn output_fields(&self) -> String {
        match self.style() {
            NetperfStyle::RequestResponse => OUTPUT_FIELDS_COMMON
                .iter()
                .chain(OUTPUT_FIELDS_RR)
                .copied()
                .collect::<Vec<_>>()
                .join(","),
            NetperfStyle::Stream => OUTPUT_FIELDS_STREAM.join(","),
        }
    }
}

fn quoted_args(pw: &mut PrefixWriter<'_>, heading: &str, args: &[String]) -> Result<(), TemplateError> {
    if args.is_empty() {
        return Ok(());
    }
    pw.line(heading)?;
    for arg in args {
        pw.line(&format!("{arg:?},"))?;
    }
    Ok(())
}

impl Benchmark for Netperf {
    fn write_server_container(&self, pw: &mut PrefixWriter<'_>, _vars: &Vars) -> Result<(), TemplateError> {
        pw.line("name: netperf-srv")?;
        pw.line(&format!("image: {}", self.conf.image))?;
        pw.line("command: [\"netserver\"]")?;
        pw.line("args: [")?;
        pw.scope("    ", |pw| pw.line("\"-D\", # dont daemonize"))?;
        pw.line("]")
    }

    fn write_client_container(&self, pw: &mut PrefixWriter<'_>, vars: &Vars) -> Result<(), TemplateError> {
        let server_ip = param(vars, "serverIP")?;
        let conf = &self.conf;

        pw.line("name: netperf-cli")?;
        pw.line(&format!("image: {}", conf.image))?;
        pw.line(&format!("command: [{:?}]", conf.cli_command))?;
        pw.line("args: [")?;
        pw.scope("    ", |pw| {
            quoted_args(pw, "# initial args", &conf.pre_args)?;
            pw.line(&format!("\"-l\", \"{}\", # timeout", conf.timeout_secs))?;
            pw.line("\"-j\", # enable additional statistics")?;
            pw.line(&format!("\"-H\", {server_ip:?},"))?;
            pw.line(&format!("\"-t\", \"{}\", # testname", conf.test))?;
            quoted_args(pw, "# additional args", &conf.args)?;

            pw.line("\"--\",")?;
            pw.line("# benchmark args")?;
            pw.line(&format!("\"-P\", \",{}\", # data connection port", conf.data_port))?;
            pw.line(&format!("\"-k\", \"{}\",", self.output_fields()))?;
            // netperf sets SO_DONTROUTE for udp_stream
            if conf.test == NetperfTest::UdpStream {
                pw.line("\"-R\", \"1\",")?;
            }
            quoted_args(pw, "# additional test-specific args", &conf.bench_args)
        })?;
        pw.line("]")
    }

    fn write_server_ports(&self, pw: &mut PrefixWriter<'_>, _vars: &Vars) -> Result<(), TemplateError> {
        for (name, port) in [("netperf-ctl", CONTROL_PORT), ("netperf-data", self.conf.data_port)] {
            pw.line(&format!("- name: {name}"))?;
            pw.line("  protocol: TCP")?;
            pw.line(&format!("  port: {port}"))?;
            pw.line(&format!("  targetPort: {port}"))?;
        }
        Ok(())
    }

    fn duration(&self) -> Duration {
        Duration::from_secs(self.conf.timeout_secs)
    }
}
