//! Server bootstrap: host key loading, `russh::server::Config` assembly,
//! and the per-connection `Handler` factory.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use russh::server::Server as _;
use sshpuppet_core::{AccessPolicyHolder, ListenerNetwork, PuppetAddressBook};
use tokio::net::TcpListener;
use tracing::info;

use crate::handler::ConnectionHandler;
use crate::registrar::ReverseForwardRegistrar;

/// Loads a host private key from an OpenSSH-formatted file.
pub fn load_host_key(path: &Path) -> Result<PrivateKey> {
    russh::keys::load_secret_key(path, None).with_context(|| format!("loading host key {}", path.display()))
}

/// Rust's `TcpListener` has no equivalent of Go's `net.Listen(":2222")`
/// meaning "all interfaces" — a bare `:PORT` address needs an explicit host.
fn normalize_listen_addr(listen_addr: &str) -> String {
    if let Some(port) = listen_addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        listen_addr.to_string()
    }
}


pub struct PuppetServer {
    policy: Arc<AccessPolicyHolder>,
    address_book: Arc<PuppetAddressBook>,
    registrar: Arc<ReverseForwardRegistrar>,
    overall_timeout: Option<Duration>,
}

impl PuppetServer {
    pub fn new(policy: Arc<AccessPolicyHolder>, listener_network: ListenerNetwork, overall_timeout: Option<Duration>) -> Result<Self> {
        let address_book = Arc::new(PuppetAddressBook::new());
        let registrar = Arc::new(ReverseForwardRegistrar::new(listener_network, address_book.clone())?);
        Ok(Self {
            policy,
            address_book,
            registrar,
            overall_timeout,
        })
    }

    /// Binds `listen_addr` and serves connections until the process is
    /// killed or the listener errors out.
    pub async fn run(mut self, listen_addr: &str, host_keys: Vec<PrivateKey>, idle_timeout: Option<Duration>) -> Result<()> {
        let config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: idle_timeout,
            keys: host_keys,
            ..Default::default()
        });

        let bind_addr = normalize_listen_addr(listen_addr);
        let listener = TcpListener::bind(&bind_addr).await.with_context(|| format!("binding {bind_addr}"))?;
        info!(addr = %bind_addr, "listening");

        self.run_on_socket(config, &listener).await.context("ssh server loop")
    }
}

impl russh::server::Server for PuppetServer {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        ConnectionHandler::new(self.policy.clone(), self.address_book.clone(), self.registrar.clone(), peer_addr, self.overall_timeout)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        tracing::error!(?error, "session error");
    }
}
