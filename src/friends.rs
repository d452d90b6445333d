/**
 * friends.rs
 *
 * Static trust table: peer name -> trust policy.
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A peer explicitly trusted by configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Friend {
    /// Whether `Join` messages from this peer are admitted.
    #[serde(default)]
    pub validated: bool,
    /// Static routes to install once the tunnel is up: subnet -> next hop.
    /// Consulted only, never mutated.
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

/// Read-only lookup over the configured friend table. Populated once at
/// configure time; there is no runtime mutation API.
#[derive(Debug, Clone, Default)]
pub struct FriendDirectory {
    friends: HashMap<String, Friend>,
}

impl FriendDirectory {
    pub fn new(friends: HashMap<String, Friend>) -> Self {
        Self { friends }
    }

    pub fn lookup(&self, name: &str) -> Option<&Friend> {
        self.friends.get(name)
    }

    pub fn len(&self) -> usize {
        self.friends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.friends.is_empty()
    }
}
