use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use knb_controller::benchmark::{BenchmarkConf, BenchmarkError, NetperfConf, NetperfTest};
use knb_controller::config::load_config;
use knb_controller::placement::{Affinity, ContainerSpec};
use knb_controller::{RunSpec, Session, SessionController, Topology};

/// Kubernetes network benchmarks
#[derive(Debug, Parser)]
#[command(name = "kubenetbench", version)]
struct Cli {
    #[arg(short = 's', long)]
    session_id: String,

    /// Directory holding session directories
    #[arg(short = 'd', long, default_value = ".")]
    session_base_dir: PathBuf,

    /// Only log to the session log file
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Reach the node agents through kubectl port-forward
    #[arg(long)]
    port_forward: bool,

    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the session and start the node agents
    Init,
    /// Stop the session's node agents
    Done,
    /// Pod-to-pod benchmark
    Pod2pod {
        /// Isolate the server with a network policy
        #[arg(long)]
        policy: Option<PolicyKind>,
        #[command(flatten)]
        bench: BenchArgs,
    },
    /// Benchmark through a service
    Service {
        #[arg(long = "type", default_value = "ClusterIP")]
        service_type: String,
        #[command(flatten)]
        bench: BenchArgs,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyKind {
    Port,
}

#[derive(Debug, Args)]
struct BenchArgs {
    #[arg(short = 'b', long, default_value = "netperf")]
    benchmark: String,

    /// Run label; defaults to the subcommand name
    #[arg(short = 'l', long)]
    run_label: Option<String>,

    /// Benchmark duration in seconds
    #[arg(short = 't', long, default_value_t = 30)]
    duration: u64,

    /// Leave the run's resources in the cluster
    #[arg(long)]
    no_cleanup: bool,

    /// none, same, different or host=<name>
    #[arg(long, default_value = "different")]
    client_affinity: Affinity,

    /// none or host=<name>
    #[arg(long, default_value = "none")]
    server_affinity: Affinity,

    #[arg(long)]
    collect_perf: bool,

    #[arg(long)]
    cli_on_host: bool,

    #[arg(long)]
    srv_on_host: bool,

    #[arg(long, default_value = "tcp_rr")]
    netperf_type: NetperfTest,

    #[arg(long)]
    netperf_args: Vec<String>,

    #[arg(long)]
    netperf_bench_args: Vec<String>,

    #[arg(long, default_value_t = 0)]
    netperf_nstreams: u32,
}

fn run_spec(bench: BenchArgs, topology: Topology, image: &str) -> Result<RunSpec> {
    if bench.benchmark != "netperf" {
        bail!(BenchmarkError::Unknown(bench.benchmark));
    }
    let mut netperf = NetperfConf::new(bench.netperf_type);
    netperf.timeout_secs = bench.duration;
    netperf.image = image.to_string();
    netperf.args = bench.netperf_args;
    netperf.bench_args = bench.netperf_bench_args;
    let netperf = netperf.with_streams(bench.netperf_nstreams)?;

    let mut client = ContainerSpec::client(bench.client_affinity);
    if bench.cli_on_host {
        client = client.on_host();
    }
    let mut server = ContainerSpec::server(bench.server_affinity)?;
    if bench.srv_on_host {
        server = server.on_host();
    }

    Ok(RunSpec {
        label: bench.run_label.unwrap_or_else(|| topology.name().to_string()),
        topology,
        client,
        server,
        cleanup: !bench.no_cleanup,
        benchmark: BenchmarkConf::Netperf(netperf),
        collect_perf: bench.collect_perf,
    })
}

/// Stdout (unless quiet) plus the session log file.
fn init_logging(session: &Session, quiet: bool, verbose: bool) -> Result<()> {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let log_path = session.log_path();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("cannot open {}", log_path.display()))?;

    let stdout = (!quiet).then(|| tracing_subscriber::fmt::layer().with_filter(level));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(level);

    tracing_subscriber::registry()
        .with(stdout)
        .with(file_layer)
        .try_init()
        .context("cannot install logger")?;
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config().await?;
    let session = match cli.command {
        Command::Init => Session::init(&cli.session_id, &cli.session_base_dir, cli.port_forward).await?,
        _ => Session::open(&cli.session_id, &cli.session_base_dir, cli.port_forward).await?,
    };
    init_logging(&session, cli.quiet, cli.verbose)?;
    info!("****** {}", std::env::args().collect::<Vec<_>>().join(" "));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, tearing down");
                cancel.cancel();
            }
        }
    });

    let image = config.benchmark_image.clone();
    let controller = SessionController::with_kubectl(session, config, cancel)?;

    match cli.command {
        Command::Init => {
            controller.start_agents().await?;
            if let Err(e) = controller.collect_system_info().await {
                warn!("{}", e);
            }
        }
        Command::Done => controller.stop().await?,
        Command::Pod2pod { policy, bench } => {
            let topology = Topology::PodToPod {
                port_policy: policy == Some(PolicyKind::Port),
            };
            let spec = run_spec(bench, topology, &image)?;
            let report = controller.new_run(spec).await?.execute().await;
            report.into_result()?;
        }
        Command::Service { service_type, bench } => {
            let spec = run_spec(bench, Topology::Service { service_type }, &image)?;
            let report = controller.new_run(spec).await?.execute().await;
            report.into_result()?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("kubenetbench").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn pod2pod_defaults() {
        let cli = parse(&["-s", "s1", "pod2pod"]);
        let Command::Pod2pod { policy, bench } = cli.command else {
            panic!("expected pod2pod");
        };
        assert_eq!(policy, None);
        let spec = run_spec(bench, Topology::PodToPod { port_policy: false }, "img").unwrap();
        assert_eq!(spec.label, "pod2pod");
        assert_eq!(spec.client.affinity, Affinity::DifferentFromPeer);
        assert_eq!(spec.server.affinity, Affinity::None);
        assert!(spec.cleanup);
        let BenchmarkConf::Netperf(conf) = spec.benchmark;
        assert_eq!(conf.timeout_secs, 30);
        assert_eq!(conf.test, NetperfTest::TcpRr);
        assert_eq!(conf.image, "img");
    }

    #[test]
    fn service_flags() {
        let cli = parse(&[
            "-s", "s1", "--port-forward", "service", "--type", "NodePort", "-l", "svc", "--no-cleanup",
            "--netperf-type", "tcp_stream", "--netperf-nstreams", "4", "--srv-on-host",
        ]);
        assert!(cli.port_forward);
        let Command::Service { service_type, bench } = cli.command else {
            panic!("expected service");
        };
        assert_eq!(service_type, "NodePort");
        let spec = run_spec(bench, Topology::Service { service_type }, "img").unwrap();
        assert_eq!(spec.label, "svc");
        assert!(!spec.cleanup);
        assert!(spec.server.host_network);
        let BenchmarkConf::Netperf(conf) = spec.benchmark;
        assert_eq!(conf.pre_args, vec!["4"]);
    }

    #[test]
    fn relative_server_affinity_is_rejected() {
        let cli = parse(&["-s", "s1", "pod2pod", "--server-affinity", "same"]);
        let Command::Pod2pod { bench, .. } = cli.command else {
            panic!("expected pod2pod");
        };
        assert!(run_spec(bench, Topology::PodToPod { port_policy: false }, "img").is_err());
    }

    #[test]
    fn unknown_values_fail_to_parse() {
        assert!(Cli::try_parse_from(["kubenetbench", "-s", "s1", "pod2pod", "--netperf-type", "tcp_xx"]).is_err());
        assert!(Cli::try_parse_from(["kubenetbench", "-s", "s1", "pod2pod", "--policy", "all"]).is_err());
        assert!(Cli::try_parse_from(["kubenetbench", "pod2pod"]).is_err());
    }
}
