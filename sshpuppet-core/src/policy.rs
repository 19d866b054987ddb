use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;
use russh::keys::PublicKey;
use serde::Deserialize;

use crate::error::PolicyError;

const DEFAULT_SERVICE_PORT: u16 = 22;
const DEFAULT_SERVICE_NAME: &str = "ssh";

#[derive(Debug, Deserialize)]
struct RawAccessPolicy {
    #[serde(default)]
    admins: HashMap<String, Vec<String>>,
    #[serde(default)]
    puppets: Vec<RawPuppetEntry>,
    #[serde(default)]
    services: HashMap<u16, String>,
}

#[derive(Debug, Deserialize)]
struct RawPuppetEntry {
    regexp: String,
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug)]
struct PuppetPattern {
    regex: Regex,
    keys: Vec<PublicKey>,
}

/// Immutable snapshot of who is allowed to connect and as what role.
/// Swapped wholesale on reload; never mutated in place.
#[derive(Debug)]
pub struct AccessPolicy {
    admins: HashMap<String, Vec<PublicKey>>,
    puppets: Vec<PuppetPattern>,
    services: HashMap<u16, String>,
}

impl AccessPolicy {
    /// Parses a YAML access policy document. Names are lowercased on
    /// load so lookups never have to re-normalize. An empty `services`
    /// map is replaced by `{22: "ssh"}`, exactly once.
    pub fn load_from(mut reader: impl Read) -> Result<Self, PolicyError> {
        let mut document = String::new();
        reader.read_to_string(&mut document)?;
        let raw: RawAccessPolicy = serde_yaml::from_str(&document)?;

        if raw.admins.is_empty() {
            return Err(PolicyError::NoAdmins);
        }

        let mut admins = HashMap::with_capacity(raw.admins.len());
        for (name, keys) in raw.admins {
            let name = name.to_lowercase();
            let keys = keys
                .iter()
                .map(|k| parse_authorized_key(&name, k))
                .collect::<Result<Vec<_>, _>>()?;
            admins.insert(name, keys);
        }

        let mut puppets = Vec::with_capacity(raw.puppets.len());
        for entry in raw.puppets {
            let regex = Regex::new(&entry.regexp).map_err(|source| PolicyError::Pattern {
                pattern: entry.regexp.clone(),
                source,
            })?;
            let keys = entry
                .keys
                .iter()
                .map(|k| parse_authorized_key(&entry.regexp, k))
                .collect::<Result<Vec<_>, _>>()?;
            puppets.push(PuppetPattern { regex, keys });
        }

        let mut services = raw.services;
        if services.is_empty() {
            services.insert(DEFAULT_SERVICE_PORT, DEFAULT_SERVICE_NAME.to_string());
        }

        Ok(Self {
            admins,
            puppets,
            services,
        })
    }

    /// Exact lowercase name match, then byte-equal key comparison.
    pub fn is_admin(&self, name: &str, key: &PublicKey) -> bool {
        self.admins
            .get(name)
            .is_some_and(|keys| keys.iter().any(|k| k == key))
    }

    /// Scans puppet patterns in declaration order; first pattern whose
    /// regex matches `name` and whose key set contains `key` wins.
    pub fn is_puppet(&self, name: &str, key: &PublicKey) -> bool {
        self.puppets
            .iter()
            .filter(|p| p.regex.is_match(name))
            .any(|p| p.keys.iter().any(|k| k == key))
    }

    pub fn service_name(&self, port: u16) -> Option<&str> {
        self.services.get(&port).map(String::as_str)
    }

    pub fn allows_service(&self, port: u16) -> bool {
        self.services.contains_key(&port)
    }

    pub fn services(&self) -> &HashMap<u16, String> {
        &self.services
    }
}

fn parse_authorized_key(owner: &str, raw: &str) -> Result<PublicKey, PolicyError> {
    PublicKey::from_openssh(raw.trim()).map_err(|source| PolicyError::Key {
        owner: owner.to_string(),
        source,
    })
}

/// Lock-free holder for the current policy. Readers load a handle and
/// dereference without locking, so a reload never blocks or tears a
/// request's view of the policy mid-evaluation.
#[derive(Debug)]
pub struct AccessPolicyHolder(ArcSwap<AccessPolicy>);

impl AccessPolicyHolder {
    pub fn new(policy: AccessPolicy) -> Self {
        Self(ArcSwap::from_pointee(policy))
    }

    pub fn load(&self) -> Arc<AccessPolicy> {
        self.0.load_full()
    }

    pub fn store(&self, policy: AccessPolicy) {
        self.0.store(Arc::new(policy));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMIN_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHF/TxrOTGeWcQAnAPpCxqy0c7L9V53nQZcudBx6t4Dn test-admin";
    const PUPPET_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBJY6WuAS/Oh1oLsPI8ACUh7kj7lgpIn1QV9dPp83rta test-puppet";
    const OTHER_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILn6cZunJjjH9/qdKRDB/HCU4PJUi5RI/FZiIMfaAjh3 test-other";

    fn sample_document() -> String {
        format!(
            "admins:\n  alice:\n    - \"{ADMIN_KEY}\"\npuppets:\n  - regexp: \"^p-.*$\"\n    keys:\n      - \"{PUPPET_KEY}\"\nservices:\n  80: http\n"
        )
    }

    #[test]
    fn happy_path_classifies_by_name_and_key() {
        let policy = AccessPolicy::load_from(sample_document().as_bytes()).unwrap();
        let admin_key = PublicKey::from_openssh(ADMIN_KEY).unwrap();
        let puppet_key = PublicKey::from_openssh(PUPPET_KEY).unwrap();

        assert!(policy.is_admin("alice", &admin_key));
        assert!(policy.is_puppet("p-1", &puppet_key));
        assert!(!policy.is_puppet("p-1", &admin_key));
        assert!(!policy.is_admin("p-1", &puppet_key));
    }

    #[test]
    fn unknown_name_or_key_is_neither_role() {
        let policy = AccessPolicy::load_from(sample_document().as_bytes()).unwrap();
        let other_key = PublicKey::from_openssh(OTHER_KEY).unwrap();

        assert!(!policy.is_admin("alice", &other_key));
        assert!(!policy.is_puppet("p-1", &other_key));
        assert!(!policy.is_admin("mallory", &other_key));
    }

    #[test]
    fn empty_services_default_to_ssh_port_22() {
        let doc = format!("admins:\n  alice:\n    - \"{ADMIN_KEY}\"\n");
        let policy = AccessPolicy::load_from(doc.as_bytes()).unwrap();

        assert_eq!(policy.service_name(22), Some("ssh"));
        assert_eq!(policy.services().len(), 1);
    }

    #[test]
    fn explicit_services_are_not_overridden() {
        let policy = AccessPolicy::load_from(sample_document().as_bytes()).unwrap();
        assert!(policy.allows_service(80));
        assert!(!policy.allows_service(22));
    }

    #[test]
    fn rejects_a_policy_with_no_admins() {
        let doc = format!("puppets:\n  - regexp: \"^p-.*$\"\n    keys:\n      - \"{PUPPET_KEY}\"\n");
        let err = AccessPolicy::load_from(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, PolicyError::NoAdmins));
    }

    #[test]
    fn rejects_an_uncompilable_puppet_pattern() {
        let doc = format!(
            "admins:\n  alice:\n    - \"{ADMIN_KEY}\"\npuppets:\n  - regexp: \"(unterminated\"\n    keys: []\n"
        );
        let err = AccessPolicy::load_from(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, PolicyError::Pattern { .. }));
    }

    #[test]
    fn rejects_an_unparseable_public_key() {
        let doc = "admins:\n  alice:\n    - \"not a key\"\n".to_string();
        let err = AccessPolicy::load_from(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, PolicyError::Key { .. }));
    }

    #[test]
    fn puppet_names_are_matched_in_declaration_order() {
        let doc = format!(
            "admins:\n  alice:\n    - \"{ADMIN_KEY}\"\npuppets:\n  - regexp: \"^p-.*$\"\n    keys: []\n  - regexp: \"^p-1$\"\n    keys:\n      - \"{PUPPET_KEY}\"\n"
        );
        let policy = AccessPolicy::load_from(doc.as_bytes()).unwrap();
        let puppet_key = PublicKey::from_openssh(PUPPET_KEY).unwrap();

        // the first pattern matches the name but carries no keys, so the
        // second pattern's key set must still be reachable.
        assert!(policy.is_puppet("p-1", &puppet_key));
    }

    #[test]
    fn holder_readers_see_the_latest_store() {
        let holder = AccessPolicyHolder::new(AccessPolicy::load_from(sample_document().as_bytes()).unwrap());
        assert!(holder.load().allows_service(80));

        let doc = format!("admins:\n  alice:\n    - \"{ADMIN_KEY}\"\nservices:\n  443: https\n");
        holder.store(AccessPolicy::load_from(doc.as_bytes()).unwrap());

        assert!(holder.load().allows_service(443));
        assert!(!holder.load().allows_service(80));
    }
}
