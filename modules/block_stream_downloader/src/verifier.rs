//! Verification of block continuity, hash chain and network signature

use std::{sync::Arc, time::Instant};

use anyhow::Result;
use mirror_common::{
    hash::SHA384_HASH_SIZE,
    stream::{block_number_from_filename, EARLIEST_AVAILABLE_BLOCK_NUMBER},
    Ledger, NodeContribution, RecordFile, Sha384Hash,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::block_stream::BlockFile;
use crate::configuration::SoftwareVersion;
use crate::error::VerificationError;
use crate::hashing;
use crate::notifier::StreamFileNotifier;
use crate::proto::{block_proof::Proof, LedgerIdPublication};
use crate::repository::RecordFileRepository;
use crate::transformer;
use crate::tss::TssVerifier;

#[derive(Default)]
struct LastVerified {
    loaded: bool,
    record_file: Option<RecordFile>,
    /// The hash was zeroed by the legacy version bypass
    legacy: bool,
}

pub struct BlockStreamVerifier {
    repository: Arc<dyn RecordFileRepository>,
    notifier: Arc<dyn StreamFileNotifier>,
    tss_verifier: Arc<dyn TssVerifier>,
    min_consensus_version: SoftwareVersion,
    last: Mutex<LastVerified>,
}

impl BlockStreamVerifier {
    pub fn new(
        repository: Arc<dyn RecordFileRepository>,
        notifier: Arc<dyn StreamFileNotifier>,
        tss_verifier: Arc<dyn TssVerifier>,
        min_consensus_version: SoftwareVersion,
    ) -> Self {
        Self {
            repository,
            notifier,
            tss_verifier,
            min_consensus_version,
            last: Mutex::new(LastVerified::default()),
        }
    }

    /// Block number to fetch next, earliest available when nothing was verified yet
    pub async fn next_block_number(&self) -> Result<u64> {
        Ok(self
            .last_verified()
            .await?
            .map(|last| last.index + 1)
            .unwrap_or(EARLIEST_AVAILABLE_BLOCK_NUMBER))
    }

    /// Filename of the last verified stream file, if any
    pub async fn last_block_filename(&self) -> Result<Option<String>> {
        Ok(self.last_verified().await?.map(|last| last.name))
    }

    async fn last_verified(&self) -> Result<Option<RecordFile>> {
        let mut last = self.last.lock().await;
        self.load(&mut last)?;
        Ok(last.record_file.clone())
    }

    fn load(&self, last: &mut LastVerified) -> Result<()> {
        if !last.loaded {
            last.record_file = self.repository.find_latest()?;
            // Only legacy blocks are ever stored with a zero hash
            last.legacy = last.record_file.as_ref().is_some_and(|r| r.hash.is_zero());
            last.loaded = true;
        }
        Ok(())
    }

    /// Verifies and hands the block on, returning it without its payload
    pub async fn verify(&self, mut block_file: BlockFile) -> Result<BlockFile> {
        let start = Instant::now();
        let mut last = self.last.lock().await;
        self.load(&mut last)?;

        let legacy = self.is_legacy(&block_file);
        let result = self.check(&mut block_file, &last);
        let result = match result {
            Ok(()) => {
                let record_file = transformer::to_record_file(&block_file);
                self.notifier.verified(record_file).await
            }
            Err(e) => Err(e.into()),
        };

        info!(
            target: "mirror::metrics",
            block = block_file.index,
            success = result.is_ok(),
            verification_ms = start.elapsed().as_millis() as u64,
            "Block verification"
        );
        result?;

        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        info!(
            target: "mirror::metrics",
            block = block_file.index,
            latency_ms = (now - block_file.consensus_end) / 1_000_000,
            "Block latency"
        );
        if let Some(previous) = last.record_file.as_ref() {
            info!(
                target: "mirror::metrics",
                block = block_file.index,
                close_interval_ns = block_file.consensus_start - previous.consensus_start,
                "Block close interval"
            );
        }

        block_file.clear();
        last.record_file = Some(transformer::to_record_file(&block_file));
        last.legacy = legacy;
        debug!("Verified block {}", block_file.index);
        Ok(block_file)
    }

    fn is_legacy(&self, block_file: &BlockFile) -> bool {
        block_file.software_version.is_some_and(|v| v < self.min_consensus_version)
    }

    fn check(
        &self,
        block_file: &mut BlockFile,
        last: &LastVerified,
    ) -> Result<(), VerificationError> {
        Self::verify_block_number(block_file, last.record_file.as_ref())?;
        self.verify_hash_chain(block_file, last)?;

        // A published ledger is in effect for this block's signature, but only kept
        // once the block verifies
        let Some(previous) = self.update_ledger(block_file)? else {
            return self.verify_signature(block_file);
        };
        let result = self.verify_signature(block_file).and_then(|()| {
            self.tss_verifier.save_ledger().map_err(|e| VerificationError::InvalidBlock {
                index: block_file.index,
                reason: format!("failed to save ledger: {e:#}"),
            })
        });
        if result.is_err() {
            if let Err(e) = self.tss_verifier.restore_ledger(previous) {
                warn!("Failed to restore ledger after block {}: {e:#}", block_file.index);
            }
        }
        result
    }

    fn verify_block_number(
        block_file: &BlockFile,
        last: Option<&RecordFile>,
    ) -> Result<(), VerificationError> {
        let block_number = block_file.index;
        if let Some(last) = last {
            if block_number != last.index + 1 {
                return Err(VerificationError::NonConsecutive {
                    previous: last.index,
                    current: block_number,
                });
            }
        }

        let from_filename = block_number_from_filename(&block_file.name)
            .ok_or_else(|| VerificationError::UnparsableFilename(block_file.name.clone()))?;
        if from_filename != block_number {
            return Err(VerificationError::NumberMismatch {
                filename: from_filename,
                content: block_number,
            });
        }
        Ok(())
    }

    fn verify_hash_chain(
        &self,
        block_file: &mut BlockFile,
        last: &LastVerified,
    ) -> Result<(), VerificationError> {
        if block_file.record_file_item.is_some()
            && (block_file.hash.is_zero()
                || (block_file.index != 0 && block_file.previous_hash.is_zero()))
        {
            return Err(VerificationError::InvalidBlock {
                index: block_file.index,
                reason: "record file item without hash".to_string(),
            });
        }

        if self.is_legacy(block_file) {
            // Historical blocks from older consensus nodes don't chain consistently
            block_file.hash = Sha384Hash::zero();
            block_file.previous_hash = Sha384Hash::zero();
            return Ok(());
        }

        let Some(expected) = last.record_file.as_ref().map(|last| last.hash) else {
            return Ok(());
        };
        if last.legacy || expected == block_file.previous_hash {
            return Ok(());
        }
        Err(VerificationError::HashMismatch {
            index: block_file.index,
            expected: expected.to_string(),
            actual: block_file.previous_hash.to_string(),
        })
    }

    /// Applies the ledger published in block 0, returning the ledger it replaced
    fn update_ledger(
        &self,
        block_file: &BlockFile,
    ) -> Result<Option<Option<Ledger>>, VerificationError> {
        let Some(publication) = block_file.ledger_id_publication.as_ref() else {
            return Ok(None);
        };
        if block_file.index != 0 {
            debug!("Ignoring ledger publication in block {}", block_file.index);
            return Ok(None);
        }

        self.tss_verifier.set_ledger(to_ledger(publication)).map(Some).map_err(|e| {
            VerificationError::InvalidBlock {
                index: block_file.index,
                reason: format!("failed to set ledger: {e:#}"),
            }
        })
    }

    fn verify_signature(&self, block_file: &BlockFile) -> Result<(), VerificationError> {
        if block_file.record_file_item.is_some() {
            // Wrapped record files are signed by the record stream signature files
            return Ok(());
        }

        let index = block_file.index;
        let proof = block_file.block_proof.as_ref().ok_or(VerificationError::MissingProof(index))?;
        let (root_hash, signature) = match &proof.proof {
            Some(Proof::SignedBlockProof(signed)) => (block_file.raw_hash, &signed.block_signature),
            Some(Proof::BlockStateProof(state_proof)) => (
                hashing::state_proof_root_hash(index, &block_file.raw_hash, &state_proof.paths)?,
                &state_proof.signature,
            ),
            None => return Err(VerificationError::UnsupportedProof(index)),
        };

        if signature.len() == SHA384_HASH_SIZE {
            debug!("Skipping verification of placeholder signature of block {index}");
            return Ok(());
        }
        self.tss_verifier.verify(index, &root_hash, signature)
    }
}

fn to_ledger(publication: &LedgerIdPublication) -> Ledger {
    Ledger {
        ledger_id: hex::encode(&publication.ledger_id),
        consensus_timestamp: publication
            .consensus_timestamp
            .as_ref()
            .map(|t| t.to_nanos())
            .unwrap_or_default(),
        node_contributions: publication
            .node_contributions
            .iter()
            .map(|c| NodeContribution {
                node_id: c.node_id,
                weight: c.weight,
                public_key: hex::encode(&c.public_key),
            })
            .collect(),
    }
}
