//! Error types for frame coding and frame security.

use thiserror::Error;

/// Errors raised while encoding or decoding LoRaWAN frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer shorter than the structure requires.
    #[error("Frame too short: need {needed} bytes, got {actual}")]
    TooShort {
        /// Minimum number of bytes required.
        needed: usize,
        /// Number of bytes available.
        actual: usize,
    },

    /// Frame longer than the PHY allows.
    #[error("Frame too long: {0} bytes")]
    TooLong(usize),

    /// Unsupported major version or RFU message type.
    #[error("Unsupported MHDR byte: 0x{0:02X}")]
    UnsupportedMhdr(u8),

    /// FOpts longer than 15 bytes.
    #[error("FOpts too long: {0} bytes")]
    FOptsTooLong(usize),

    /// Unknown MAC command identifier.
    #[error("Unknown MAC command 0x{0:02X}")]
    UnknownMacCommand(u8),

    /// MAC command payload truncated.
    #[error("Truncated MAC command 0x{cid:02X}: need {needed} bytes, got {actual}")]
    TruncatedMacCommand {
        /// Command identifier.
        cid: u8,
        /// Bytes required after the CID.
        needed: usize,
        /// Bytes available after the CID.
        actual: usize,
    },

    /// Sealing failed in the security layer.
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    /// Hex string could not be parsed into a key or identifier.
    #[error("Invalid hex for {field}: {reason}")]
    InvalidHex {
        /// Which field was being parsed.
        field: &'static str,
        /// Why parsing failed.
        reason: String,
    },
}

/// Errors raised by frame authentication and decryption.
///
/// Every variant means the frame must be dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    /// Computed MIC does not match the received one.
    #[error("MIC mismatch for {context}")]
    MicMismatch {
        /// What was being verified (device address or EUI).
        context: String,
    },

    /// Decryption produced a payload that cannot be a valid frame.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// No session or root key is known for the sender.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Join request nonce was already used.
    #[error("Replayed DevNonce {dev_nonce} for {dev_eui}")]
    ReplayedNonce {
        /// Device EUI in hex.
        dev_eui: String,
        /// Offending nonce.
        dev_nonce: u16,
    },

    /// Frame counter did not advance.
    #[error("Stale frame counter {received} for {dev_addr} (last {last})")]
    StaleFrameCounter {
        /// Device address in hex.
        dev_addr: String,
        /// Counter carried by the frame.
        received: u32,
        /// Last accepted counter.
        last: u32,
    },

    /// Key material has the wrong length.
    #[error("Invalid key length: {0}")]
    InvalidKeyLength(usize),
}
