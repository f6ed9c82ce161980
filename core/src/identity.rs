//! Network identities of the parties flows talk to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A well-known participant on the network, identified by its legal name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Party {
    name: String,
}

impl Party {
    /// Create a party from its legal name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The party's legal name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Resolves the legal name carried by an inbound message to a known party.
///
/// Implemented by the node's network map. Returning `None` means the sender
/// is not (or no longer) part of the network.
pub trait NetworkMapCache: Send + Sync {
    /// Look up a peer by its legal name.
    fn peer_by_legal_name(&self, name: &str) -> Option<Party>;
}
