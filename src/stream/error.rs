//! Error taxonomy for the streaming decoder.

use thiserror::Error;

/// Errors produced while decoding a tar stream.
///
/// Every variant is terminal for the decoder: the error is reported once
/// from [`Decoder::poll_next`], injected into the live entry stream if one
/// exists (so a consumer waiting on payload bytes unblocks), and the
/// decoder moves to its ended state where further `write` calls are
/// no-ops. The enum is `Clone` so the same value can appear on both
/// surfaces.
///
/// [`Decoder::poll_next`]: super::Decoder::poll_next
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The computed header checksum does not match the stored value and
    /// the block is not the end-of-archive sentinel.
    #[error("header checksum mismatch: stored {stored}, computed {computed}")]
    InvalidChecksum {
        /// Checksum decoded from the header's checksum field.
        stored: u32,
        /// Checksum computed over the block.
        computed: u32,
    },

    /// The block carries neither the UStar nor the GNU magic (and
    /// unknown formats were not allowed), or a numeric field holds a
    /// value no valid header can (such as a negative size).
    #[error("malformed or unrecognised header block")]
    InvalidFormat,

    /// The input ended while the decoder still expected bytes.
    #[error("archive truncated inside {0}")]
    TruncatedArchive(&'static str),

    /// The typeflag byte is not a known entry kind.
    #[error("unrecognised entry typeflag {0:#04x}")]
    UnknownEntryType(u8),

    /// Caller misuse of the decoding protocol, such as acknowledging an
    /// entry twice. Not recoverable.
    #[error("decoder protocol violation: {0}")]
    PreconditionViolation(&'static str),

    /// The decoder was closed while an entry's payload was still being
    /// delivered.
    #[error("decoder closed while an entry was live")]
    Aborted,

    /// A metadata record declared a size beyond the configured [`Limits`].
    ///
    /// [`Limits`]: super::Limits
    #[error("{kind} of {size} exceeds the configured limit of {limit}")]
    ExtensionTooLarge {
        /// Which record kind hit the limit.
        kind: &'static str,
        /// Declared size (bytes, or map entries for sparse maps).
        size: u64,
        /// The configured ceiling.
        limit: u64,
    },
}
