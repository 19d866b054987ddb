//! Direct-forward splicer (component G): resolves an admin's `direct-tcpip`
//! request against the puppet address book and bridges the two byte
//! streams.

use russh::server::Msg;
use russh::Channel;
use sshpuppet_core::{AccessPolicy, ClientIdentity, ListenerNetwork, PuppetAddressBook};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};

use crate::common::DirectTcpIpParams;
use crate::gates::local_forward_gate;

enum DialedStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Outcome of resolving a `direct-tcpip` request against the policy and
/// address book, before any dialing happens.
enum Resolution {
    Refused,
    Dial { address: String, network: ListenerNetwork },
}

/// Steps 1-3 of the splicer: port range check, local-forward gate, address
/// book lookup. Kept separate from dialing so it can be exercised without a
/// live channel or a real listener on the other end.
fn evaluate(identity: &ClientIdentity, policy: &AccessPolicy, address_book: &PuppetAddressBook, params: &DirectTcpIpParams) -> Resolution {
    let Ok(dest_port) = u16::try_from(params.dest_port) else {
        debug!(port = params.dest_port, "direct-tcpip port out of range");
        return Resolution::Refused;
    };

    if !local_forward_gate(identity, policy, dest_port) {
        debug!(admin = identity.name(), puppet = params.dest_addr, port = dest_port, "direct-tcpip administratively prohibited");
        return Resolution::Refused;
    }

    let Some((address, network)) = address_book.resolve(&params.dest_addr, dest_port) else {
        debug!(puppet = params.dest_addr, port = dest_port, "puppet not found or requested port is unavailable");
        return Resolution::Refused;
    };

    Resolution::Dial { address, network }
}

/// Runs steps 1-4 of the splicer synchronously and reports whether the
/// channel open should be accepted. On acceptance, spawns the task that
/// actually splices the two streams (step 5) so the `Handler` callback can
/// return promptly.
pub async fn admit(
    identity: &ClientIdentity,
    policy: &AccessPolicy,
    address_book: &PuppetAddressBook,
    params: DirectTcpIpParams,
    channel: Channel<Msg>,
) -> bool {
    let (address, network) = match evaluate(identity, policy, address_book, &params) {
        Resolution::Refused => return false,
        Resolution::Dial { address, network } => (address, network),
    };

    let dialed = match network {
        ListenerNetwork::Tcp => match TcpStream::connect(&address).await {
            Ok(stream) => DialedStream::Tcp(stream),
            Err(err) => {
                warn!(puppet = params.dest_addr, port = params.dest_port, ?err, "dialing puppet listener");
                return false;
            }
        },
        ListenerNetwork::Unix => match UnixStream::connect(&address).await {
            Ok(stream) => DialedStream::Unix(stream),
            Err(err) => {
                warn!(puppet = params.dest_addr, port = params.dest_port, ?err, "dialing puppet listener");
                return false;
            }
        },
    };

    tokio::spawn(splice(channel, dialed));
    true
}

async fn splice(channel: Channel<Msg>, dialed: DialedStream) {
    let mut channel_stream = channel.into_stream();
    match dialed {
        DialedStream::Tcp(mut stream) => {
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
        }
        DialedStream::Unix(mut stream) => {
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
        }
    }
}
