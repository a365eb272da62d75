//! Attestation signing
//!
//! Each configured key signs the personal-message hash of a transfer's
//! canonical fields. An attestation holds one recoverable signature per
//! distinct signer and is usable once it reaches the configured threshold.

use std::collections::HashSet;

use alloy::primitives::{Address, Bytes, PrimitiveSignature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use thiserror::Error;
use tracing::debug;

use crate::hash::{bytes32_to_hex, compute_message_hash};
use crate::types::{SignerSignature, TransferRecord};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("no attestation keys configured")]
    NoKeys,
    #[error("invalid attestation key #{index}: {reason}")]
    InvalidKey { index: usize, reason: String },
    #[error("threshold {threshold} exceeds {available} distinct signers")]
    ThresholdUnreachable { threshold: usize, available: usize },
    #[error("signing failed for {signer}: {reason}")]
    Signing { signer: Address, reason: String },
    #[error("signature from {signer} is malformed: {reason}")]
    MalformedSignature { signer: Address, reason: String },
    #[error("signature declared for {declared} recovers to {recovered}")]
    SignerMismatch { declared: Address, recovered: Address },
    #[error("duplicate signer {0} in attestation")]
    DuplicateSigner(Address),
    #[error("attestation has {have} signatures, {need} required")]
    BelowThreshold { have: usize, need: usize },
}

/// Holds the relayer's attestation keys
pub struct AttestationSigner {
    signers: Vec<PrivateKeySigner>,
    threshold: usize,
    destination_contract: Address,
}

impl AttestationSigner {
    /// Create a signer set from 0x-prefixed private keys
    pub fn from_keys(
        keys: &[String],
        threshold: usize,
        destination_contract: Address,
    ) -> Result<Self, SignerError> {
        let signers = keys
            .iter()
            .enumerate()
            .map(|(index, key)| {
                key.parse::<PrivateKeySigner>()
                    .map_err(|e| SignerError::InvalidKey {
                        index,
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(signers, threshold, destination_contract)
    }

    pub fn new(
        signers: Vec<PrivateKeySigner>,
        threshold: usize,
        destination_contract: Address,
    ) -> Result<Self, SignerError> {
        if signers.is_empty() {
            return Err(SignerError::NoKeys);
        }
        let distinct: HashSet<Address> = signers.iter().map(|s| s.address()).collect();
        if threshold == 0 || threshold > distinct.len() {
            return Err(SignerError::ThresholdUnreachable {
                threshold,
                available: distinct.len(),
            });
        }
        Ok(Self {
            signers,
            threshold,
            destination_contract,
        })
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.signers.iter().map(|s| s.address()).collect()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn destination_contract(&self) -> Address {
        self.destination_contract
    }

    /// The hash every signer signs for this transfer
    pub fn message_hash(&self, transfer_id: &B256, user: &Address, bridged_amount: &U256) -> B256 {
        compute_message_hash(transfer_id, user, bridged_amount, &self.destination_contract)
    }

    /// Sign with every configured key, one signature per distinct signer
    pub fn sign(
        &self,
        transfer_id: &B256,
        user: &Address,
        bridged_amount: &U256,
    ) -> Result<Vec<SignerSignature>, SignerError> {
        let message_hash = self.message_hash(transfer_id, user, bridged_amount);
        let mut seen = HashSet::new();
        let mut attestation = Vec::with_capacity(self.signers.len());

        for signer in &self.signers {
            let address = signer.address();
            if !seen.insert(address) {
                continue;
            }
            let signature =
                signer
                    .sign_hash_sync(&message_hash)
                    .map_err(|e| SignerError::Signing {
                        signer: address,
                        reason: e.to_string(),
                    })?;
            attestation.push(SignerSignature {
                signer: address,
                signature: Bytes::from(signature.as_bytes().to_vec()),
            });
        }

        if attestation.len() < self.threshold {
            return Err(SignerError::BelowThreshold {
                have: attestation.len(),
                need: self.threshold,
            });
        }

        debug!(
            transfer_id = %bytes32_to_hex(&transfer_id.0),
            message_hash = %bytes32_to_hex(&message_hash.0),
            signatures = attestation.len(),
            "Transfer attested"
        );

        Ok(attestation)
    }

    pub fn sign_record(&self, record: &TransferRecord) -> Result<Vec<SignerSignature>, SignerError> {
        self.sign(&record.transfer_id, &record.source_user, &record.bridged_amount)
    }

    /// Check a stored attestation against the freshly recomputed hash
    ///
    /// Every signature must recover to its declared signer, signers must be
    /// distinct, and at least `threshold` of them must be present.
    pub fn verify_record(&self, record: &TransferRecord) -> Result<(), SignerError> {
        let message_hash =
            self.message_hash(&record.transfer_id, &record.source_user, &record.bridged_amount);
        verify_attestation(&message_hash, &record.attestation, self.threshold)
    }
}

/// Recover the address that produced `signature` over `message_hash`
pub fn recover_signer(message_hash: &B256, signature: &[u8]) -> Result<Address, String> {
    let sig = PrimitiveSignature::try_from(signature).map_err(|e| e.to_string())?;
    sig.recover_address_from_prehash(message_hash)
        .map_err(|e| e.to_string())
}

/// Verify an attestation against a message hash
pub fn verify_attestation(
    message_hash: &B256,
    attestation: &[SignerSignature],
    threshold: usize,
) -> Result<(), SignerError> {
    let mut seen = HashSet::new();
    for entry in attestation {
        let recovered = recover_signer(message_hash, &entry.signature).map_err(|reason| {
            SignerError::MalformedSignature {
                signer: entry.signer,
                reason,
            }
        })?;
        if recovered != entry.signer {
            return Err(SignerError::SignerMismatch {
                declared: entry.signer,
                recovered,
            });
        }
        if !seen.insert(recovered) {
            return Err(SignerError::DuplicateSigner(recovered));
        }
    }
    if seen.len() < threshold {
        return Err(SignerError::BelowThreshold {
            have: seen.len(),
            need: threshold,
        });
    }
    Ok(())
}
