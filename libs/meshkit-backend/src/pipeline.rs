//! Backend-neutral batch of write commands executed as one transaction.

use std::time::Duration;

/// A single write command. Keys are logical (not yet namespaced).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set {
        key: String,
        value: String,
        ttl: Duration,
    },
    Del {
        key: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

impl Command {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Del { key }
            | Self::SAdd { key, .. }
            | Self::SRem { key, .. }
            | Self::Expire { key, .. } => key,
        }
    }
}

/// Ordered list of commands; backends apply it atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_with_ttl(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> &mut Self {
        self.commands.push(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Del { key: key.into() });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.commands.push(Command::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.commands.push(Command::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.commands.push(Command::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl IntoIterator for Pipeline {
    type Item = Command;
    type IntoIter = std::vec::IntoIter<Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.into_iter()
    }
}

/// Milliseconds for a TTL, saturating instead of truncating.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}
