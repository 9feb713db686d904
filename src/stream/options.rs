//! Decoder configuration.

/// Character decoding applied to path-carrying fields.
///
/// Selects the decoder for `name`, `linkname`, the UStar prefix, and GNU
/// long path/link payloads. `uname`/`gname` and PAX values are always
/// UTF-8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilenameEncoding {
    /// UTF-8 with replacement characters for invalid sequences.
    #[default]
    Utf8,
    /// ISO-8859-1: every byte maps to the code point of the same value.
    Latin1,
}

impl FilenameEncoding {
    /// Decode raw field bytes to a string.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            FilenameEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            FilenameEncoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

/// Resource guards applied while decoding.
///
/// These protect against archives that declare absurd metadata sizes: the
/// declared payload of a GNU long name/link or PAX record is checked
/// before any of it is buffered, and sparse maps are bounded in entry
/// count across the main header and all extended blocks.
///
/// # Example
///
/// ```
/// use tar_decode::stream::Limits;
///
/// let strict = Limits {
///     max_extension_size: 64 * 1024,
///     ..Limits::default()
/// };
/// assert!(strict.max_extension_size < Limits::default().max_extension_size);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum declared payload size of a single GNU long name/link or
    /// PAX (`x`/`g`) record, in bytes. Default: 1 MiB.
    pub max_extension_size: u64,

    /// Maximum number of regions accepted into one sparse map, summed
    /// over the main header and extended sparse blocks. Default: 1024.
    pub max_sparse_regions: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_extension_size: 1024 * 1024,
            max_sparse_regions: 1024,
        }
    }
}

impl Limits {
    /// Limits with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Effectively unlimited; only for archives from trusted sources.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            max_extension_size: u64::MAX,
            max_sparse_regions: usize::MAX,
        }
    }

    /// Conservative limits for untrusted archives.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            max_extension_size: 64 * 1024,
            max_sparse_regions: 64,
        }
    }
}

/// Options accepted by [`Decoder::new`].
///
/// [`Decoder::new`]: super::Decoder::new
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeOptions {
    /// Decoder for path-carrying fields. Default: UTF-8.
    pub filename_encoding: FilenameEncoding,

    /// Accept blocks without a UStar/GNU magic (pre-POSIX v7 archives)
    /// and surface unrecognised typeflags instead of failing.
    /// Default: `false`.
    pub allow_unknown_format: bool,

    /// Resource guards. Default: [`Limits::default`].
    pub limits: Limits,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = DecodeOptions::default();
        assert_eq!(options.filename_encoding, FilenameEncoding::Utf8);
        assert!(!options.allow_unknown_format);
        assert_eq!(options.limits, Limits::default());
    }

    #[test]
    fn limit_presets() {
        assert!(Limits::strict().max_extension_size < Limits::default().max_extension_size);
        assert!(Limits::strict().max_sparse_regions < Limits::default().max_sparse_regions);
        assert_eq!(Limits::permissive().max_extension_size, u64::MAX);
        assert_eq!(Limits::new(), Limits::default());
    }

    #[test]
    fn latin1_decoding() {
        // 0xE9 is 'é' in Latin-1 but invalid alone in UTF-8.
        assert_eq!(FilenameEncoding::Latin1.decode(&[0x63, 0x61, 0x66, 0xE9]), "café");
        assert_eq!(
            FilenameEncoding::Utf8.decode(&[0x63, 0x61, 0x66, 0xE9]),
            "caf\u{FFFD}"
        );
    }
}
