//! Reverse-forward registrar (component E): owns the `tcpip-forward` /
//! `cancel-tcpip-forward` lifecycle, the listener-per-registration map, and
//! the canceller/acceptor worker pair for each live forward.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex as StdMutex};

use russh::server::{Handle, Msg};
use russh::Channel;
use sshpuppet_core::{ClientIdentity, ListenerNetwork, PuppetAddressBook};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RegistrarError;

type ForwardKey = (Uuid, u16);

/// Abstraction over `Handle::channel_open_forwarded_tcpip`. Lets the
/// acceptor's relay step be driven by a fake opener in tests instead of a
/// live SSH session.
trait ForwardChannelOpener: Clone + Send + 'static {
    fn open_forwarded_tcpip(
        &self,
        dest_addr: String,
        dest_port: u32,
        originator_addr: String,
        originator_port: u32,
    ) -> impl Future<Output = Result<Channel<Msg>, russh::Error>> + Send;
}

impl ForwardChannelOpener for Handle {
    async fn open_forwarded_tcpip(
        &self,
        dest_addr: String,
        dest_port: u32,
        originator_addr: String,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_forwarded_tcpip(dest_addr, dest_port, originator_addr, originator_port).await
    }
}

/// Abstraction over "accept the next inbound connection". Lets the
/// acceptor's loop be driven by a fake source in tests without a real
/// socket, while production keeps one concrete listener type per branch
/// (no `Box<dyn AsyncRead + AsyncWrite>`).
trait ConnectionSource: Send + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Conn, String, u32)>> + Send;
}

struct TcpSource(TcpListener);

impl ConnectionSource for TcpSource {
    type Conn = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, String, u32)> {
        let (stream, peer) = self.0.accept().await?;
        Ok((stream, peer.ip().to_string(), peer.port() as u32))
    }
}

struct UnixSource(UnixListener);

impl ConnectionSource for UnixSource {
    type Conn = UnixStream;

    async fn accept(&mut self) -> io::Result<(UnixStream, String, u32)> {
        let (stream, _peer) = self.0.accept().await?;
        Ok((stream, "127.0.0.1".to_string(), 0))
    }
}

/// Owns every live reverse-forward listener on the server. One instance is
/// shared (behind `Arc`) across all connections.
pub struct ReverseForwardRegistrar {
    network: ListenerNetwork,
    unix_dir: Option<tempfile::TempDir>,
    forwards: StdMutex<HashMap<ForwardKey, CancellationToken>>,
    address_book: Arc<PuppetAddressBook>,
}

impl ReverseForwardRegistrar {
    pub fn new(network: ListenerNetwork, address_book: Arc<PuppetAddressBook>) -> io::Result<Self> {
        let unix_dir = match network {
            ListenerNetwork::Unix => Some(tempfile::Builder::new().prefix("sshpuppet-").tempdir()?),
            ListenerNetwork::Tcp => None,
        };
        Ok(Self {
            network,
            unix_dir,
            forwards: StdMutex::new(HashMap::new()),
            address_book,
        })
    }

    /// Handles a `tcpip-forward` request. Returns the bound port to report
    /// back to the client (the ephemeral TCP port, or the puppet's own
    /// requested port for Unix-socket mode, which is meaningless on the
    /// wire but required by the protocol).
    pub async fn start<H: ForwardChannelOpener>(
        self: &Arc<Self>,
        identity: &ClientIdentity,
        bind_addr: &str,
        bind_port: u16,
        handle: H,
        session_cancel: CancellationToken,
    ) -> Result<u16, RegistrarError> {
        let key = (identity.session_id(), bind_port);
        if self.forwards.lock().expect("registrar mutex poisoned").contains_key(&key) {
            return Err(RegistrarError::AlreadyAllocated);
        }

        match self.network {
            ListenerNetwork::Tcp => {
                let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
                let actual_port = listener.local_addr()?.port();
                let address = format!("127.0.0.1:{actual_port}");
                self.finish_start(
                    key,
                    identity.clone(),
                    bind_addr.to_string(),
                    bind_port,
                    handle,
                    session_cancel,
                    TcpSource(listener),
                    address,
                )?;
                Ok(actual_port)
            }
            ListenerNetwork::Unix => {
                let dir = self.unix_dir.as_ref().expect("unix_dir set when network is Unix");
                let path = dir.path().join(Uuid::new_v4().to_string());
                let listener = UnixListener::bind(&path)?;
                let address = path.to_string_lossy().into_owned();
                self.finish_start(
                    key,
                    identity.clone(),
                    bind_addr.to_string(),
                    bind_port,
                    handle,
                    session_cancel,
                    UnixSource(listener),
                    address,
                )?;
                Ok(bind_port)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_start<C: ConnectionSource, H: ForwardChannelOpener>(
        self: &Arc<Self>,
        key: ForwardKey,
        identity: ClientIdentity,
        bind_addr: String,
        bind_port: u16,
        handle: H,
        session_cancel: CancellationToken,
        source: C,
        address: String,
    ) -> Result<(), RegistrarError> {
        let forward_cancel = CancellationToken::new();
        {
            let mut forwards = self.forwards.lock().expect("registrar mutex poisoned");
            if forwards.contains_key(&key) {
                // `source` is dropped here, closing the listener we just lost the race for.
                return Err(RegistrarError::AlreadyAllocated);
            }
            forwards.insert(key, forward_cancel.clone());
        }

        tokio::spawn(canceller(self.clone(), key, forward_cancel.clone(), session_cancel));
        tokio::spawn(acceptor(self.clone(), key, identity, bind_addr, bind_port, handle, source, address, forward_cancel));

        Ok(())
    }

    /// Handles a `cancel-tcpip-forward` request. Idempotent: a second call
    /// for a key already removed is a no-op success.
    pub fn cancel(&self, session_id: Uuid, bind_port: u16) {
        let token = self
            .forwards
            .lock()
            .expect("registrar mutex poisoned")
            .remove(&(session_id, bind_port));
        if let Some(token) = token {
            token.cancel();
        }
    }
}

async fn canceller(
    registrar: Arc<ReverseForwardRegistrar>,
    key: ForwardKey,
    forward_cancel: CancellationToken,
    session_cancel: CancellationToken,
) {
    session_cancel.cancelled().await;
    registrar.forwards.lock().expect("registrar mutex poisoned").remove(&key);
    forward_cancel.cancel();
}

#[allow(clippy::too_many_arguments)]
async fn acceptor<C: ConnectionSource, H: ForwardChannelOpener>(
    registrar: Arc<ReverseForwardRegistrar>,
    key: ForwardKey,
    identity: ClientIdentity,
    bind_addr: String,
    bind_port: u16,
    handle: H,
    mut source: C,
    address: String,
    forward_cancel: CancellationToken,
) {
    registrar
        .address_book
        .on_forward_begin(identity.name(), bind_port, &address, registrar.network, identity.session_id());

    loop {
        let accepted = tokio::select! {
            _ = forward_cancel.cancelled() => break,
            res = source.accept() => res,
        };
        match accepted {
            Ok((stream, originator_addr, originator_port)) => {
                tokio::spawn(relay(handle.clone(), bind_addr.clone(), bind_port, originator_addr, originator_port, stream));
            }
            Err(err) => {
                warn!(puppet = identity.name(), port = bind_port, ?err, "reverse-forward accept failed");
                break;
            }
        }
    }

    registrar.forwards.lock().expect("registrar mutex poisoned").remove(&key);
    registrar.address_book.on_forward_end(identity.name(), bind_port, identity.session_id());
    debug!(puppet = identity.name(), port = bind_port, "reverse-forward acceptor exited");
}

async fn relay<S, H>(handle: H, dest_addr: String, dest_port: u16, originator_addr: String, originator_port: u32, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: ForwardChannelOpener,
{
    let channel = match handle.open_forwarded_tcpip(dest_addr, dest_port as u32, originator_addr, originator_port).await {
        Ok(channel) => channel,
        Err(err) => {
            warn!(?err, "opening forwarded-tcpip channel");
            return;
        }
    };

    let mut channel_stream = channel.into_stream();
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sshpuppet_core::Role;

    use super::*;

    #[derive(Clone)]
    struct NullOpener;

    impl ForwardChannelOpener for NullOpener {
        async fn open_forwarded_tcpip(
            &self,
            _dest_addr: String,
            _dest_port: u32,
            _originator_addr: String,
            _originator_port: u32,
        ) -> Result<Channel<Msg>, russh::Error> {
            unreachable!("these tests never let a connection reach the relay step")
        }
    }

    /// Accepts nothing; fails after `delay`, so a test can observe the
    /// acceptor's registered-then-torn-down window around the failure.
    struct ErrorSource {
        delay: Duration,
    }

    impl ConnectionSource for ErrorSource {
        type Conn = TcpStream;

        async fn accept(&mut self) -> io::Result<(TcpStream, String, u32)> {
            tokio::time::sleep(self.delay).await;
            Err(io::Error::other("induced accept failure"))
        }
    }

    fn puppet_identity() -> ClientIdentity {
        ClientIdentity::new("p-1", Role::Puppet, Uuid::new_v4(), "127.0.0.1:1")
    }

    #[test]
    fn cancel_on_unknown_key_is_a_noop() {
        let book = Arc::new(PuppetAddressBook::new());
        let registrar = ReverseForwardRegistrar::new(ListenerNetwork::Tcp, book).unwrap();
        registrar.cancel(Uuid::new_v4(), 80);
    }

    #[tokio::test]
    async fn concurrent_start_on_same_key_yields_exactly_one_success() {
        let book = Arc::new(PuppetAddressBook::new());
        let registrar = Arc::new(ReverseForwardRegistrar::new(ListenerNetwork::Tcp, book).unwrap());
        let identity = puppet_identity();
        let session_cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            registrar.start(&identity, "", 4242, NullOpener, session_cancel.clone()),
            registrar.start(&identity, "", 4242, NullOpener, session_cancel.clone()),
        );

        let outcomes = [&a, &b];
        let successes = outcomes.iter().filter(|r| r.is_ok()).count();
        let already_allocated = outcomes.iter().filter(|r| matches!(r, Err(RegistrarError::AlreadyAllocated))).count();
        assert_eq!(successes, 1, "exactly one racer should win the slot");
        assert_eq!(already_allocated, 1, "the loser should see AlreadyAllocated, not a bind error");

        session_cancel.cancel();
    }

    #[tokio::test]
    async fn acceptor_registers_then_deregisters_exactly_once_on_accept_failure() {
        let book = Arc::new(PuppetAddressBook::new());
        let registrar = Arc::new(ReverseForwardRegistrar::new(ListenerNetwork::Tcp, book.clone()).unwrap());
        let identity = puppet_identity();
        let key = (identity.session_id(), 80);
        let forward_cancel = CancellationToken::new();

        let task = tokio::spawn(acceptor(
            registrar,
            key,
            identity,
            String::new(),
            80,
            NullOpener,
            ErrorSource { delay: Duration::from_millis(20) },
            "127.0.0.1:4242".to_string(),
            forward_cancel,
        ));

        // on_forward_begin runs before the accept loop, so the registration
        // is visible while ErrorSource is still sleeping.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(book.resolve("p-1", 80).is_some(), "begin should have registered the listener");

        task.await.unwrap();
        assert!(book.resolve("p-1", 80).is_none(), "end should have run exactly once after the accept failure");
    }

    #[tokio::test]
    async fn session_cancellation_releases_the_listener_via_the_canceller() {
        let book = Arc::new(PuppetAddressBook::new());
        let registrar = Arc::new(ReverseForwardRegistrar::new(ListenerNetwork::Tcp, book.clone()).unwrap());
        let identity = puppet_identity();
        let session_cancel = CancellationToken::new();

        let port = registrar.start(&identity, "", 80, NullOpener, session_cancel.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(book.resolve("p-1", port).is_some());

        // simulates `ConnectionHandler::drop` cancelling the session token.
        session_cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(book.resolve("p-1", port).is_none(), "cancellation should have driven exactly one on_forward_end");
        assert!(registrar.forwards.lock().unwrap().is_empty(), "the forward entry should be gone from the map");
    }
}
