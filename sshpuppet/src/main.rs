mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use sshpuppet_core::{AccessPolicyHolder, ListenerNetwork};
use sshpuppet_ssh::{load_host_key, PuppetServer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Brokers reachability between puppet clients behind NAT and admins who
/// need to reach their services, over a single multiplexed SSH transport.
#[derive(Parser, Debug)]
#[command(name = "sshpuppetd", version, about)]
struct Cli {
    /// Listen address/port
    #[arg(long, default_value = ":2222")]
    listen: String,

    /// Access policy file
    #[arg(long, default_value = "./access.yaml")]
    access: PathBuf,

    /// Host private key file, repeatable
    #[arg(long = "private", required = true)]
    private_keys: Vec<PathBuf>,

    /// Reverse tunnel socket network
    #[arg(long = "socket-network", value_enum, default_value_t = SocketNetworkArg::Tcp)]
    socket_network: SocketNetworkArg,

    /// Idle session timeout
    #[arg(long = "idle-timeout", default_value = "3m")]
    idle_timeout: humantime::Duration,

    /// Overall session timeout (0 disables it)
    #[arg(long = "overall-timeout", default_value = "0s")]
    overall_timeout: humantime::Duration,

    /// Debug logs
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SocketNetworkArg {
    Tcp,
    Unix,
}

impl std::fmt::Display for SocketNetworkArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SocketNetworkArg::Tcp => "tcp",
            SocketNetworkArg::Unix => "unix",
        })
    }
}

impl From<SocketNetworkArg> for ListenerNetwork {
    fn from(value: SocketNetworkArg) -> Self {
        match value {
            SocketNetworkArg::Tcp => ListenerNetwork::Tcp,
            SocketNetworkArg::Unix => ListenerNetwork::Unix,
        }
    }
}

fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).with_ansi(true).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let mut host_keys = Vec::with_capacity(cli.private_keys.len());
    for path in &cli.private_keys {
        match load_host_key(path) {
            Ok(key) => {
                info!(path = %path.display(), "loaded host key");
                host_keys.push(key);
            }
            Err(err) => {
                error!(path = %path.display(), %err, "failed to load host private key");
                return ExitCode::FAILURE;
            }
        }
    }

    let policy = match config::load_access_policy(&cli.access) {
        Ok(policy) => policy,
        Err(err) => {
            error!(path = %cli.access.display(), %err, "failed to load access policy");
            return ExitCode::FAILURE;
        }
    };

    let policy_holder = Arc::new(AccessPolicyHolder::new(policy));
    spawn_reload_task(policy_holder.clone(), cli.access.clone());

    let idle_timeout = Some(Duration::from(cli.idle_timeout));
    let overall_timeout = {
        let duration = Duration::from(cli.overall_timeout);
        if duration.is_zero() { None } else { Some(duration) }
    };

    let server = match PuppetServer::new(policy_holder, cli.socket_network.into(), overall_timeout) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "failed to initialize server");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = server.run(&cli.listen, host_keys, idle_timeout).await {
        error!(%err, "server exited with an error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Reloads the access policy on `SIGHUP`, swapping it into `holder`. A
/// failed reload is logged; the previous policy stays in force.
#[cfg(unix)]
fn spawn_reload_task(holder: Arc<AccessPolicyHolder>, access_path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(%err, "failed to install SIGHUP handler, policy reload is disabled");
                return;
            }
        };

        loop {
            hangup.recv().await;
            info!(path = %access_path.display(), "reloading access policy");
            match config::load_access_policy(&access_path) {
                Ok(policy) => holder.store(policy),
                Err(err) => error!(%err, "failed to reload access policy, keeping previous policy"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_task(_holder: Arc<AccessPolicyHolder>, _access_path: PathBuf) {}
