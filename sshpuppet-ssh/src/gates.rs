//! Authorization gates (component D). Pure predicates over an identity and
//! the current policy snapshot; never mutate state, never perform I/O.

use sshpuppet_core::{AccessPolicy, ClientIdentity};

const LOCAL_BIND_HOSTS: [&str; 3] = ["", "localhost", "127.0.0.1"];

/// Accepts only an admin requesting the `exec` session subtype.
pub fn session_gate(identity: &ClientIdentity, subtype: &str) -> bool {
    identity.is_admin() && subtype == "exec"
}

/// Accepts only an admin targeting a port present in the service allow-list.
/// `dest_port` is the port half of the puppet's `(name, port)` pair carried
/// in the `direct-tcpip` payload; the destination address is not checked
/// here — it is resolved against the address book by the splicer.
pub fn local_forward_gate(identity: &ClientIdentity, policy: &AccessPolicy, dest_port: u16) -> bool {
    identity.is_admin() && policy.allows_service(dest_port)
}

/// Accepts only a puppet requesting a loopback-ish bind host and a port
/// present in the service allow-list.
pub fn reverse_forward_gate(identity: &ClientIdentity, policy: &AccessPolicy, bind_addr: &str, bind_port: u16) -> bool {
    identity.is_puppet() && LOCAL_BIND_HOSTS.contains(&bind_addr) && policy.allows_service(bind_port)
}
