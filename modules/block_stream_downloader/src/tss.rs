//! Threshold signature verification of block root hashes

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use mirror_common::{Ledger, Sha384Hash};
use tracing::{debug, info, warn};

use crate::error::VerificationError;
use crate::repository::RecordFileRepository;

const NODE_ID_LENGTH: usize = 8;
const ENTRY_LENGTH: usize = NODE_ID_LENGTH + SIGNATURE_LENGTH;

pub trait TssVerifier: Send + Sync {
    /// Replace the in-memory signing roster, returning the one it replaced
    fn set_ledger(&self, ledger: Ledger) -> Result<Option<Ledger>>;

    /// Put back a roster returned by `set_ledger`
    fn restore_ledger(&self, previous: Option<Ledger>) -> Result<()>;

    /// Persist the in-memory roster
    fn save_ledger(&self) -> Result<()>;

    /// Check `signature` over the block's signed root hash, failing closed
    fn verify(
        &self,
        block_number: u64,
        root_hash: &Sha384Hash,
        signature: &[u8],
    ) -> Result<(), VerificationError>;
}

/// Verifies a block signature as a set of ed25519 signatures from a weighted roster.
///
/// A signature is a sequence of `(node id: u64 big endian, ed25519 signature)`
/// entries. It is valid when the signing nodes hold more than a third of the total
/// weight. Repeated node ids count once.
pub struct WeightedEd25519Verifier {
    ledger: Mutex<Option<Ledger>>,
    repository: Arc<dyn RecordFileRepository>,
    bootstrap: Option<Ledger>,
}

impl WeightedEd25519Verifier {
    pub fn new(repository: Arc<dyn RecordFileRepository>, bootstrap: Option<Ledger>) -> Self {
        Self {
            ledger: Mutex::new(None),
            repository,
            bootstrap,
        }
    }

    /// The current ledger, from memory, then storage, then configuration
    fn current_ledger(&self) -> Result<Option<Ledger>> {
        let mut ledger = self.ledger.lock().map_err(|_| anyhow!("poisoned"))?;
        if ledger.is_none() {
            *ledger = match self.repository.find_latest_ledger()? {
                Some(stored) => Some(stored),
                None => self.bootstrap.clone(),
            };
            if let Some(found) = ledger.as_ref() {
                info!("Loaded ledger {}", found.ledger_id);
            }
        }
        Ok(ledger.clone())
    }
}

impl TssVerifier for WeightedEd25519Verifier {
    fn set_ledger(&self, ledger: Ledger) -> Result<Option<Ledger>> {
        let previous = self.current_ledger()?;
        debug!(
            "Set ledger {} with {} node contributions",
            ledger.ledger_id,
            ledger.node_contributions.len()
        );
        *self.ledger.lock().map_err(|_| anyhow!("poisoned"))? = Some(ledger);
        Ok(previous)
    }

    fn restore_ledger(&self, previous: Option<Ledger>) -> Result<()> {
        *self.ledger.lock().map_err(|_| anyhow!("poisoned"))? = previous;
        Ok(())
    }

    fn save_ledger(&self) -> Result<()> {
        let ledger = self.ledger.lock().map_err(|_| anyhow!("poisoned"))?.clone();
        if let Some(ledger) = ledger {
            self.repository.save_ledger(&ledger)?;
            info!(
                "Saved ledger {} with {} node contributions",
                ledger.ledger_id,
                ledger.node_contributions.len()
            );
        }
        Ok(())
    }

    fn verify(
        &self,
        block_number: u64,
        root_hash: &Sha384Hash,
        signature: &[u8],
    ) -> Result<(), VerificationError> {
        let ledger = match self.current_ledger() {
            Ok(Some(ledger)) => ledger,
            Ok(None) => return Err(VerificationError::LedgerNotFound),
            Err(e) => {
                warn!("Failed to load ledger: {e:#}");
                return Err(VerificationError::LedgerNotFound);
            }
        };

        let invalid = || VerificationError::InvalidSignature(block_number);
        if signature.is_empty() || signature.len() % ENTRY_LENGTH != 0 {
            return Err(invalid());
        }

        let mut signers = HashSet::new();
        let mut signed_weight: u128 = 0;
        for entry in signature.chunks_exact(ENTRY_LENGTH) {
            let (node_id, signature) = entry.split_at(NODE_ID_LENGTH);
            let node_id = u64::from_be_bytes(node_id.try_into().map_err(|_| invalid())?);
            let Some(contribution) =
                ledger.node_contributions.iter().find(|c| c.node_id == node_id)
            else {
                debug!("Block {block_number} signed by unknown node {node_id}");
                return Err(invalid());
            };

            let key_bytes: [u8; PUBLIC_KEY_LENGTH] = hex::decode(&contribution.public_key)
                .ok()
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or_else(invalid)?;
            let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| invalid())?;
            let signature_bytes: [u8; SIGNATURE_LENGTH] =
                signature.try_into().map_err(|_| invalid())?;
            key.verify(root_hash.as_ref(), &Signature::from_bytes(&signature_bytes))
                .map_err(|_| invalid())?;

            if signers.insert(node_id) {
                signed_weight += contribution.weight as u128;
            }
        }

        let total_weight = ledger.total_weight() as u128;
        if total_weight == 0 || signed_weight * 3 <= total_weight {
            debug!("Block {block_number} signed with weight {signed_weight} of {total_weight}");
            return Err(invalid());
        }
        Ok(())
    }
}
