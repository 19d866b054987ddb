//! Per-connection `russh::server::Handler` implementation: wires the
//! authenticator (C), the authorization gates (D), the registrar (E), the
//! splicer (G), and the admin shell (H) into the protocol callbacks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use sshpuppet_core::{AccessPolicyHolder, ClientIdentity, PuppetAddressBook, Role};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::DirectTcpIpParams;
use crate::gates;
use crate::registrar::ReverseForwardRegistrar;
use crate::shell;

const REJECTED_NOT_ADMIN: &str = "Nope, only for admins.\n";
const REJECTED_NOT_EXEC: &str = "Only exec session type is allowed\n";

/// State for a single SSH connection, from accept to disconnect. Dropping a
/// handler cancels its session token, which tears down every reverse
/// forward it registered.
pub struct ConnectionHandler {
    policy: Arc<AccessPolicyHolder>,
    address_book: Arc<PuppetAddressBook>,
    registrar: Arc<ReverseForwardRegistrar>,
    identity: Option<ClientIdentity>,
    session_id: Uuid,
    remote: String,
    session_cancel: CancellationToken,
    overall_timeout: Option<Duration>,
    overall_timeout_armed: bool,
}

impl ConnectionHandler {
    pub fn new(
        policy: Arc<AccessPolicyHolder>,
        address_book: Arc<PuppetAddressBook>,
        registrar: Arc<ReverseForwardRegistrar>,
        peer_addr: Option<SocketAddr>,
        overall_timeout: Option<Duration>,
    ) -> Self {
        Self {
            policy,
            address_book,
            registrar,
            identity: None,
            session_id: Uuid::new_v4(),
            remote: peer_addr.map(|a| a.to_string()).unwrap_or_else(|| "unknown".to_string()),
            session_cancel: CancellationToken::new(),
            overall_timeout,
            overall_timeout_armed: false,
        }
    }

    async fn reject_session_request(&self, channel: ChannelId, session: &mut Session, subtype: &str) {
        let message = match &self.identity {
            Some(identity) if identity.is_admin() => REJECTED_NOT_EXEC,
            _ => REJECTED_NOT_ADMIN,
        };
        debug!(session = %self.session_id, subtype, "session request rejected");
        let handle = session.handle();
        let _ = handle.data(channel, message.as_bytes().to_vec()).await;
        let _ = handle.exit_status_request(channel, 1).await;
        let _ = session.channel_failure(channel);
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.session_cancel.cancel();
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(&mut self, _user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        if self.identity.is_some() {
            debug!(session = %self.session_id, "refusing re-identification");
            return Ok(Auth::Reject { proceed_with_methods: None, partial_success: false });
        }

        if user != user.to_lowercase() {
            debug!(session = %self.session_id, user, "username is not lowercase, rejecting");
            return Ok(Auth::Reject { proceed_with_methods: None, partial_success: false });
        }

        let policy = self.policy.load();
        let role = if policy.is_puppet(user, key) {
            Role::Puppet
        } else if policy.is_admin(user, key) {
            Role::Admin
        } else {
            debug!(session = %self.session_id, user, "public key matches neither puppet nor admin");
            return Ok(Auth::Reject { proceed_with_methods: None, partial_success: false });
        };

        let identity = ClientIdentity::new(user, role, self.session_id, self.remote.clone());
        info!(%identity, "authenticated");
        self.identity = Some(identity);
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        if self.overall_timeout_armed {
            return Ok(());
        }
        self.overall_timeout_armed = true;

        if let Some(timeout) = self.overall_timeout {
            let handle = session.handle();
            let cancel = self.session_cancel.clone();
            let session_id = self.session_id;
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => {
                        debug!(session = %session_id, "overall session timeout elapsed");
                        let _ = handle.disconnect(russh::Disconnect::ByApplication, "overall session timeout".to_string(), String::new()).await;
                    }
                    () = cancel.cancelled() => {}
                }
            });
        }
        Ok(())
    }

    async fn channel_open_session(&mut self, _channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.reject_session_request(channel, session, "pty-req").await;
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.reject_session_request(channel, session, "shell").await;
        Ok(())
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let Some(identity) = self.identity.clone() else {
            self.reject_session_request(channel, session, "exec").await;
            return Ok(());
        };
        if !gates::session_gate(&identity, "exec") {
            self.reject_session_request(channel, session, "exec").await;
            return Ok(());
        }

        session.channel_success(channel)?;

        let policy = self.policy.load();
        let argv = shell::parse_argv(data);
        let (output, exit_code) = shell::dispatch(&identity, &policy, &self.address_book, &argv);

        let handle = session.handle();
        tokio::spawn(async move {
            let _ = handle.data(channel, output.into_bytes()).await;
            let _ = handle.exit_status_request(channel, exit_code).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });

        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(identity) = self.identity.clone() else {
            return Ok(false);
        };
        let policy = self.policy.load();
        let params = DirectTcpIpParams {
            dest_addr: host_to_connect.to_string(),
            dest_port: port_to_connect,
            originator_addr: originator_address.to_string(),
            originator_port,
        };
        Ok(crate::splicer::admit(&identity, &policy, &self.address_book, params, channel).await)
    }

    async fn tcpip_forward(&mut self, address: &str, port: &mut u32, session: &mut Session) -> Result<bool, Self::Error> {
        let allowed = self.try_start_forward(address, port, session).await;
        if allowed {
            session.request_success();
        } else {
            session.request_failure();
        }
        Ok(allowed)
    }

    async fn cancel_tcpip_forward(&mut self, _address: &str, port: u32, session: &mut Session) -> Result<bool, Self::Error> {
        if let (Some(identity), Ok(bind_port)) = (&self.identity, u16::try_from(port)) {
            self.registrar.cancel(identity.session_id(), bind_port);
        }
        session.request_success();
        Ok(true)
    }
}


impl ConnectionHandler {
    async fn try_start_forward(&mut self, address: &str, port: &mut u32, session: &mut Session) -> bool {
        let Some(identity) = self.identity.clone() else {
            return false;
        };
        let Ok(bind_port) = u16::try_from(*port) else {
            return false;
        };

        let policy = self.policy.load();
        if !gates::reverse_forward_gate(&identity, &policy, address, bind_port) {
            debug!(session = %self.session_id, puppet = identity.name(), port = bind_port, "reverse-forward administratively prohibited");
            return false;
        }

        let handle = session.handle();
        match self
            .registrar
            .start(&identity, address, bind_port, handle, self.session_cancel.clone())
            .await
        {
            Ok(bound_port) => {
                *port = bound_port as u32;
                true
            }
            Err(err) => {
                warn!(session = %self.session_id, puppet = identity.name(), ?err, "tcpip-forward failed");
                false
            }
        }
    }
}
