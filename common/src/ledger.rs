//! Threshold signature ledger key material

use serde::{Deserialize, Serialize};

/// One consensus node's share in the ledger's signing roster
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeContribution {
    pub node_id: u64,
    pub weight: u64,

    /// Hex encoded verification key
    pub public_key: String,
}

/// Ledger identity and signing roster
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Ledger {
    /// Hex encoded ledger id
    pub ledger_id: String,

    /// Consensus timestamp of the publication, nanoseconds since epoch
    #[serde(default)]
    pub consensus_timestamp: i64,

    #[serde(default)]
    pub node_contributions: Vec<NodeContribution>,
}

impl Ledger {
    pub fn total_weight(&self) -> u64 {
        self.node_contributions.iter().map(|n| n.weight).sum()
    }
}
