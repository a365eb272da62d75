//! Source and destination bridge contract ABIs
//!
//! Uses alloy's sol! macro to generate type-safe bindings. The relayer only
//! reads logs from the source contract; the destination contract is read
//! and written.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Source-side bridge: locks funds and emits the initiation event
    #[sol(rpc)]
    contract SourceBridge {
        /// Emitted once per transfer; `transferId` is globally unique
        event TransferInitiated(
            bytes32 indexed transferId,
            address indexed user,
            uint256 originalAmount,
            uint256 bridgedAmount,
            uint256 timestamp
        );
    }
}

sol! {
    /// Destination-side vault: releases funds against an attestation
    #[sol(rpc)]
    contract BridgeVault {
        /// Stored transfer record
        ///
        /// status: 0 = unknown, 1 = pending, 2 = completed, 3 = refunded
        function getTransfer(bytes32 transferId) external view returns (
            address sourceUser,
            uint256 originalAmount,
            uint256 bridgedAmount,
            uint256 sourceTimestamp,
            uint8 status
        );

        /// Whether the refund window is open for a pending transfer
        function canRefund(bytes32 transferId) external view returns (bool);

        /// Timestamp from which the source user may refund
        function getRefundTime(bytes32 transferId) external view returns (uint256);

        /// Minimum number of distinct allow-listed signatures for `complete`
        function minSignatures() external view returns (uint256);

        /// Complete a pending transfer
        ///
        /// Recomputes the attestation hash, recovers each signer, requires
        /// every signer to be allow-listed and at least `minSignatures` of them,
        /// then releases `bridgedAmount` to `sourceUser`.
        function complete(
            bytes32 transferId,
            bytes[] signatures,
            address[] signers
        ) external;

        /// Refund a pending transfer after the timeout (callable by the source user)
        function refund(bytes32 transferId) external;

        /// Owner-only direct release without attestation
        function payout(bytes32 transferId, address user, uint256 amount) external;

        event TransferCompleted(
            bytes32 indexed transferId,
            address indexed user,
            uint256 amount
        );

        event TransferRefunded(
            bytes32 indexed transferId,
            address indexed user,
            uint256 amount
        );
    }
}
