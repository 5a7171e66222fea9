//! Authorized identities.

use std::collections::HashMap;

use hostwatch_settings::ServerEntry;
use parking_lot::RwLock;

/// Display metadata stamped onto every accepted snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RosterMeta {
    /// Display name.
    pub name: String,
    /// Display group.
    pub group: String,
    /// Country code as configured (any case).
    pub country_code: String,
}

impl RosterMeta {
    /// Location code shown to browsers: the lower-cased country code.
    pub fn loc(&self) -> Option<String> {
        (!self.country_code.is_empty()).then(|| self.country_code.to_lowercase())
    }
}

/// One authorized identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RosterEntry {
    /// Shared secret.
    pub secret: String,
    /// Display metadata.
    pub meta: RosterMeta,
}

/// Source of authorized identities.
pub trait Roster: Send + Sync {
    /// Entry for `identity`, if authorized.
    fn lookup(&self, identity: &str) -> Option<RosterEntry>;

    /// Number of configured identities.
    fn len(&self) -> usize;

    /// Whether no identities are configured.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Roster built from settings; replaceable at runtime.
#[derive(Default)]
pub struct StaticRoster {
    entries: RwLock<HashMap<String, RosterEntry>>,
}

impl StaticRoster {
    /// Build from configured servers.
    pub fn from_entries(servers: &[ServerEntry]) -> Self {
        Self {
            entries: RwLock::new(index(servers)),
        }
    }

    /// Swap in a new server list. Returns the identities that were removed,
    /// sorted.
    pub fn replace(&self, servers: &[ServerEntry]) -> Vec<String> {
        let next = index(servers);
        let mut entries = self.entries.write();
        let mut removed: Vec<String> = entries
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        removed.sort();
        *entries = next;
        removed
    }

    /// All configured identities, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Roster for StaticRoster {
    fn lookup(&self, identity: &str) -> Option<RosterEntry> {
        self.entries.read().get(identity).cloned()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

fn index(servers: &[ServerEntry]) -> HashMap<String, RosterEntry> {
    servers
        .iter()
        .map(|s| {
            (
                s.id.clone(),
                RosterEntry {
                    secret: s.secret.clone(),
                    meta: RosterMeta {
                        name: s.name.clone(),
                        group: s.group.clone(),
                        country_code: s.country_code.clone(),
                    },
                },
            )
        })
        .collect()
}
