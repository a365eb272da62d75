//! Hash computation for transfer attestations
//!
//! These functions must match the destination contract byte for byte: the
//! contract recomputes the same hash from its own stored transfer record and
//! recovers the attesting signers from it.

use alloy::primitives::{Address, B256, U256};
use tiny_keccak::{Hasher, Keccak};

/// Prefix binding a signature to the "personal message" domain
pub const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n";

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Canonical layout of the attested fields:
/// abi.encode(bytes32 transferId, address user, uint256 bridgedAmount, address destination)
///
/// All values are encoded as 32-byte words, addresses left-padded with zeros.
pub fn encode_transfer_fields(
    transfer_id: &B256,
    user: &Address,
    bridged_amount: &U256,
    destination_contract: &Address,
) -> [u8; 128] {
    let mut data = [0u8; 128];

    // Word 0: transferId (bytes32)
    data[0..32].copy_from_slice(transfer_id.as_slice());

    // Word 1: user (address, right-aligned)
    data[32 + 12..64].copy_from_slice(user.as_slice());

    // Word 2: bridgedAmount (uint256, big-endian)
    data[64..96].copy_from_slice(&bridged_amount.to_be_bytes::<32>());

    // Word 3: destination contract (address, right-aligned)
    data[96 + 12..128].copy_from_slice(destination_contract.as_slice());

    data
}

/// rawHash = keccak256(abi.encode(transferId, user, bridgedAmount, destination))
pub fn compute_raw_hash(
    transfer_id: &B256,
    user: &Address,
    bridged_amount: &U256,
    destination_contract: &Address,
) -> B256 {
    let encoded = encode_transfer_fields(transfer_id, user, bridged_amount, destination_contract);
    B256::from(keccak256(&encoded))
}

/// messageHash = keccak256(prefix || len(rawHash) || rawHash)
///
/// The length is written as ASCII decimal, so a 32-byte hash always yields "32".
pub fn personal_message_hash(raw_hash: &B256) -> B256 {
    let mut message = Vec::with_capacity(PERSONAL_MESSAGE_PREFIX.len() + 2 + 32);
    message.extend_from_slice(PERSONAL_MESSAGE_PREFIX);
    message.extend_from_slice(raw_hash.len().to_string().as_bytes());
    message.extend_from_slice(raw_hash.as_slice());
    B256::from(keccak256(&message))
}

/// The hash each attestation signer signs
pub fn compute_message_hash(
    transfer_id: &B256,
    user: &Address,
    bridged_amount: &U256,
    destination_contract: &Address,
) -> B256 {
    personal_message_hash(&compute_raw_hash(
        transfer_id,
        user,
        bridged_amount,
        destination_contract,
    ))
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (B256, Address, U256, Address) {
        let mut id = [0u8; 32];
        id[31] = 1;
        (
            B256::from(id),
            Address::repeat_byte(0x11),
            U256::from(1000u64),
            Address::repeat_byte(0xd0),
        )
    }

    #[test]
    fn test_keccak256() {
        let result = keccak256(b"hello");
        assert_eq!(
            bytes32_to_hex(&result),
            "0x1c8aff950685c2ed4bc3174f3472287b56d9517b9c948127319a09a7a36deac8"
        );
    }

    #[test]
    fn test_encode_layout() {
        let (id, user, amount, dest) = sample();
        let data = encode_transfer_fields(&id, &user, &amount, &dest);

        assert_eq!(&data[0..32], id.as_slice());
        assert_eq!(&data[32..44], &[0u8; 12]);
        assert_eq!(&data[44..64], user.as_slice());
        // 1000 = 0x03e8
        assert_eq!(data[94], 0x03);
        assert_eq!(data[95], 0xe8);
        assert_eq!(&data[96..108], &[0u8; 12]);
        assert_eq!(&data[108..128], dest.as_slice());
    }

    #[test]
    fn test_hashes_are_deterministic() {
        let (id, user, amount, dest) = sample();
        let raw_a = compute_raw_hash(&id, &user, &amount, &dest);
        let raw_b = compute_raw_hash(&id, &user, &amount, &dest);
        assert_eq!(raw_a, raw_b);

        let msg_a = compute_message_hash(&id, &user, &amount, &dest);
        let msg_b = compute_message_hash(&id, &user, &amount, &dest);
        assert_eq!(msg_a, msg_b);
        assert_ne!(raw_a, msg_a);
    }

    #[test]
    fn test_every_field_changes_hash() {
        let (id, user, amount, dest) = sample();
        let base = compute_raw_hash(&id, &user, &amount, &dest);

        assert_ne!(base, compute_raw_hash(&B256::ZERO, &user, &amount, &dest));
        assert_ne!(
            base,
            compute_raw_hash(&id, &Address::repeat_byte(0x22), &amount, &dest)
        );
        assert_ne!(base, compute_raw_hash(&id, &user, &U256::from(999u64), &dest));
        assert_ne!(
            base,
            compute_raw_hash(&id, &user, &amount, &Address::repeat_byte(0xd1))
        );
    }

    #[test]
    fn test_raw_hash_matches_alloy_keccak() {
        let (id, user, amount, dest) = sample();
        let encoded = encode_transfer_fields(&id, &user, &amount, &dest);
        assert_eq!(
            compute_raw_hash(&id, &user, &amount, &dest),
            alloy::primitives::keccak256(encoded)
        );
    }

    #[test]
    fn test_personal_message_hash_matches_eip191() {
        let (id, user, amount, dest) = sample();
        let raw = compute_raw_hash(&id, &user, &amount, &dest);
        assert_eq!(
            personal_message_hash(&raw),
            alloy::primitives::eip191_hash_message(raw)
        );
    }

    #[test]
    fn test_bytes32_to_hex_is_prefixed_lowercase() {
        let hex = bytes32_to_hex(&[0xabu8; 32]);
        assert_eq!(hex.len(), 66);
        assert!(hex.starts_with("0xabab"));
    }
}
