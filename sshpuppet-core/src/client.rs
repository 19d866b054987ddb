use std::fmt;

use time::OffsetDateTime;
use uuid::Uuid;

/// The two recognized client classes. A client that matches neither is
/// refused during authentication and never gets a [`ClientIdentity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Puppet,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Puppet => "puppet",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection identity, attached to a session the moment the
/// authenticator accepts a public key offer. Immutable after creation:
/// nothing downstream may change a client's name, role, or session id.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    name: String,
    role: Role,
    session_id: Uuid,
    remote: String,
    created_at: OffsetDateTime,
}

impl ClientIdentity {
    pub fn new(name: impl Into<String>, role: Role, session_id: Uuid, remote: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            session_id,
            remote: remote.into(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_puppet(&self) -> bool {
        self.role == Role::Puppet
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.role, self.name)
    }
}
