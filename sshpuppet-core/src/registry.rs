use std::collections::BTreeMap;
use std::sync::Mutex;

use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

/// Which transport a registered listener binds. Informational past the
/// registrar that created the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerNetwork {
    Tcp,
    Unix,
}

impl ListenerNetwork {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerNetwork::Tcp => "tcp",
            ListenerNetwork::Unix => "unix",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PuppetEntry {
    pub address: String,
    pub network: ListenerNetwork,
    pub session_id: Uuid,
    pub created_at: OffsetDateTime,
}

type NamePort = (String, u16);

/// Thread-safe (puppet name, service port) -> listener address mapping.
/// Populated and depopulated by the reverse-forward registrar, queried
/// by the direct-forward splicer, snapshotted by the admin shell.
///
/// `on_forward_begin` is latest-writer-wins: a fresher registration for
/// the same key always replaces an older one, regardless of which
/// session wrote it. `on_forward_end` is session-scoped: it only
/// removes an entry if the caller's session id still owns it, so a
/// stale session's teardown can never evict a session that replaced it.
#[derive(Debug, Default)]
pub struct PuppetAddressBook {
    entries: Mutex<BTreeMap<NamePort, PuppetEntry>>,
}

impl PuppetAddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_forward_begin(
        &self,
        puppet_name: &str,
        service_port: u16,
        address: &str,
        network: ListenerNetwork,
        session_id: Uuid,
    ) {
        let key = (puppet_name.to_string(), service_port);
        let entry = PuppetEntry {
            address: address.to_string(),
            network,
            session_id,
            created_at: OffsetDateTime::now_utc(),
        };

        #[allow(clippy::unwrap_used)]
        let previous = self.entries.lock().unwrap().insert(key, entry);

        if let Some(previous) = previous {
            debug!(
                puppet = puppet_name,
                port = service_port,
                old_session = %previous.session_id,
                new_session = %session_id,
                "replaced puppet registration"
            );
        }
    }

    pub fn on_forward_end(&self, puppet_name: &str, service_port: u16, session_id: Uuid) {
        let key = (puppet_name.to_string(), service_port);
        #[allow(clippy::unwrap_used)]
        let mut entries = self.entries.lock().unwrap();
        if entries.get(&key).is_some_and(|e| e.session_id == session_id) {
            entries.remove(&key);
        }
    }

    pub fn resolve(&self, puppet_name: &str, service_port: u16) -> Option<(String, ListenerNetwork)> {
        let key = (puppet_name.to_string(), service_port);
        #[allow(clippy::unwrap_used)]
        let entries = self.entries.lock().unwrap();
        entries.get(&key).map(|e| (e.address.clone(), e.network))
    }

    /// Deep copy, grouped by puppet name then service port, both
    /// ascending, for the admin `ls` command.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<u16, PuppetEntry>> {
        #[allow(clippy::unwrap_used)]
        let entries = self.entries.lock().unwrap();
        let mut out: BTreeMap<String, BTreeMap<u16, PuppetEntry>> = BTreeMap::new();
        for ((name, port), entry) in entries.iter() {
            out.entry(name.clone()).or_default().insert(*port, entry.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_replaces_stale_registration() {
        let book = PuppetAddressBook::new();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        book.on_forward_begin("p-1", 80, "127.0.0.1:4001", ListenerNetwork::Tcp, s1);
        book.on_forward_begin("p-1", 80, "127.0.0.1:4002", ListenerNetwork::Tcp, s2);

        assert_eq!(
            book.resolve("p-1", 80).map(|(a, _)| a),
            Some("127.0.0.1:4002".to_string())
        );

        // the stale session's teardown must not evict the fresh registration
        book.on_forward_end("p-1", 80, s1);
        assert_eq!(
            book.resolve("p-1", 80).map(|(a, _)| a),
            Some("127.0.0.1:4002".to_string())
        );

        book.on_forward_end("p-1", 80, s2);
        assert_eq!(book.resolve("p-1", 80), None);
    }

    #[test]
    fn end_is_a_noop_for_keys_it_does_not_own() {
        let book = PuppetAddressBook::new();
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();

        book.on_forward_begin("p-1", 80, "127.0.0.1:4001", ListenerNetwork::Tcp, owner);
        book.on_forward_end("p-1", 80, intruder);

        assert!(book.resolve("p-1", 80).is_some());
    }

    #[test]
    fn snapshot_groups_by_name_then_port() {
        let book = PuppetAddressBook::new();
        book.on_forward_begin("p-1", 80, "a", ListenerNetwork::Tcp, Uuid::new_v4());
        book.on_forward_begin("p-1", 9999, "b", ListenerNetwork::Tcp, Uuid::new_v4());
        book.on_forward_begin("p-0", 22, "c", ListenerNetwork::Unix, Uuid::new_v4());

        let snap = book.snapshot();
        let names: Vec<_> = snap.keys().cloned().collect();
        assert_eq!(names, vec!["p-0".to_string(), "p-1".to_string()]);

        let ports: Vec<_> = snap["p-1"].keys().copied().collect();
        assert_eq!(ports, vec![80, 9999]);
    }

    #[test]
    fn resolve_misses_return_none() {
        let book = PuppetAddressBook::new();
        assert!(book.resolve("ghost", 80).is_none());
    }
}
