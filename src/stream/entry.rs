//! Resolved entries and their payload streams.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use bytes::Bytes;

use crate::{
    checksum, decode_numeric, decode_octal, is_gnu, is_ustar, truncate_null, EntryType,
    UstarHeader, BLOCK_SIZE, EMPTY_BLOCK_CHECKSUM,
};

use super::error::DecodeError;
use super::options::DecodeOptions;

/// Fully resolved metadata of one archive entry.
///
/// Field values reflect every extension that applied to the entry: GNU
/// long path/link records, PAX per-entry attributes, accumulated PAX
/// global attributes, and the UStar prefix join. Sparse members surface
/// with `entry_type == File` and `size` set to the real (unpacked) file
/// size.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Entry path, components separated by `/`.
    pub name: String,
    /// Permission bits.
    pub mode: u32,
    /// Owner user ID. Negative only when the archive stored a negative
    /// base-256 value.
    pub uid: i64,
    /// Owner group ID.
    pub gid: i64,
    /// Payload size in bytes; the entry stream delivers exactly this many.
    pub size: u64,
    /// Modification time in seconds since the Unix epoch. Fractional
    /// after a PAX `mtime` attribute with sub-second precision.
    pub mtime: f64,
    /// Entry kind.
    pub entry_type: EntryType,
    /// Link target for hard and symbolic links, empty otherwise.
    pub linkname: String,
    /// Owner user name.
    pub uname: String,
    /// Owner group name.
    pub gname: String,
    /// Device major number (character and block devices).
    pub devmajor: u32,
    /// Device minor number (character and block devices).
    pub devminor: u32,
    /// The per-entry PAX attribute map, when one applied.
    pub pax: Option<BTreeMap<String, String>>,
}

impl Header {
    /// Parse a raw 512-byte header block.
    ///
    /// Returns `Ok(None)` for the end-of-archive sentinel (a block whose
    /// checksum computes to the all-zero value). Extension state is *not*
    /// applied here; the caller folds pending long names and PAX
    /// attributes in afterwards, because a long-path record may override
    /// `name` before the trailing-slash directory convention can be
    /// judged.
    ///
    /// # Errors
    ///
    /// [`DecodeError::InvalidChecksum`] when the stored and computed
    /// checksums disagree, [`DecodeError::InvalidFormat`] when the block
    /// has no recognised magic (unless unknown formats are allowed) or
    /// declares a negative size.
    pub fn from_block(
        block: &[u8; BLOCK_SIZE],
        options: &DecodeOptions,
    ) -> Result<Option<Header>, DecodeError> {
        let computed = checksum(block);
        if computed == EMPTY_BLOCK_CHECKSUM {
            return Ok(None);
        }

        let raw = UstarHeader::view(block);
        let stored = u32::try_from(decode_octal(&raw.checksum)).unwrap_or(u32::MAX);
        if stored != computed {
            return Err(DecodeError::InvalidChecksum { stored, computed });
        }

        let ustar = is_ustar(block);
        if !ustar && !is_gnu(block) && !options.allow_unknown_format {
            return Err(DecodeError::InvalidFormat);
        }

        let encoding = options.filename_encoding;
        let mut name = encoding.decode(truncate_null(&raw.name));
        if ustar && raw.prefix[0] != 0 {
            let prefix = encoding.decode(truncate_null(&raw.prefix));
            name = format!("{prefix}/{name}");
        }

        let size = decode_numeric(&raw.size);
        if size < 0 {
            return Err(DecodeError::InvalidFormat);
        }

        Ok(Some(Header {
            name,
            mode: decode_numeric(&raw.mode) as u32,
            uid: decode_numeric(&raw.uid),
            gid: decode_numeric(&raw.gid),
            size: size as u64,
            mtime: decode_numeric(&raw.mtime) as f64,
            entry_type: EntryType::from_byte(raw.typeflag),
            linkname: encoding.decode(truncate_null(&raw.linkname)),
            uname: String::from_utf8_lossy(truncate_null(&raw.uname)).into_owned(),
            gname: String::from_utf8_lossy(truncate_null(&raw.gname)).into_owned(),
            devmajor: decode_numeric(&raw.devmajor) as u32,
            devminor: decode_numeric(&raw.devminor) as u32,
            pax: None,
        }))
    }
}

/// One decoded archive entry: resolved metadata plus the payload stream.
///
/// The stream delivers exactly `header.size` bytes. The entry stays valid
/// until the consumer acknowledges it with [`Decoder::advance`]; any
/// payload it did not read is discarded by the decoder at that point.
///
/// [`Decoder::advance`]: super::Decoder::advance
#[derive(Debug)]
pub struct Entry {
    /// Resolved entry metadata.
    pub header: Header,
    /// The entry's payload byte stream.
    pub stream: EntryStream,
}

/// Result of one [`EntryStream::read_chunk`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRead {
    /// The next payload chunk, in order.
    Chunk(Bytes),
    /// No payload is buffered right now; feed the decoder more input.
    Pending,
    /// The payload has been delivered completely.
    End,
}

/// Shared single-threaded state between the decoder (producer) and the
/// consumer's [`EntryStream`] handle.
#[derive(Debug, Default)]
pub(crate) struct StreamShared {
    chunks: VecDeque<Bytes>,
    closed: bool,
    revoked: bool,
    error: Option<DecodeError>,
}

impl StreamShared {
    /// Create the producer/consumer pair for one entry.
    pub(crate) fn new_pair() -> (Rc<RefCell<StreamShared>>, EntryStream) {
        let shared = Rc::new(RefCell::new(StreamShared::default()));
        let stream = EntryStream {
            shared: Rc::clone(&shared),
        };
        (shared, stream)
    }

    /// Buffer a payload chunk. Dropped silently once the stream is closed
    /// or revoked.
    pub(crate) fn push(&mut self, chunk: Bytes) {
        if self.closed || self.revoked || chunk.is_empty() {
            return;
        }
        self.chunks.push_back(chunk);
    }

    /// Mark the payload complete. Buffered chunks remain readable.
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    /// Inject a terminal error, unless the payload already completed.
    pub(crate) fn fail(&mut self, error: DecodeError) {
        if !self.closed {
            self.error = Some(error);
            self.closed = true;
        }
    }

    /// Invalidate the consumer handle and drop any unread payload.
    pub(crate) fn revoke(&mut self) {
        self.revoked = true;
        self.chunks.clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Consumer handle for one entry's payload bytes.
///
/// The stream is finite and single-pass. It stays readable until the
/// consumer calls [`Decoder::advance`]; after that the handle is revoked
/// and further reads fail.
///
/// [`Decoder::advance`]: super::Decoder::advance
#[derive(Debug)]
pub struct EntryStream {
    shared: Rc<RefCell<StreamShared>>,
}

impl EntryStream {
    /// Pull the next buffered payload chunk.
    ///
    /// # Errors
    ///
    /// Returns the decoder's terminal error if one was injected while this
    /// entry was live ([`DecodeError::Aborted`] on `close()`, or whatever
    /// fatal error interrupted decoding), and
    /// [`DecodeError::PreconditionViolation`] when called after the entry
    /// was acknowledged.
    pub fn read_chunk(&mut self) -> Result<StreamRead, DecodeError> {
        let mut shared = self.shared.borrow_mut();
        if shared.revoked {
            return Err(DecodeError::PreconditionViolation(
                "entry stream read after advance",
            ));
        }
        if let Some(chunk) = shared.chunks.pop_front() {
            return Ok(StreamRead::Chunk(chunk));
        }
        if let Some(error) = shared.error.take() {
            return Err(error);
        }
        if shared.closed {
            return Ok(StreamRead::End);
        }
        Ok(StreamRead::Pending)
    }

    /// Whether the payload has been fully delivered and read.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let shared = self.shared.borrow();
        shared.closed && shared.chunks.is_empty() && shared.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::FilenameEncoding;

    fn block_with_checksum(mut block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let sum = checksum(&block);
        let field = format!("{sum:06o}\0 ");
        block[148..156].copy_from_slice(field.as_bytes());
        block
    }

    fn ustar_file_block(name: &[u8], size: u64) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name);
        block[100..108].copy_from_slice(b"0000644\0");
        block[124..136].copy_from_slice(format!("{size:011o}\0").as_bytes());
        block[156] = b'0';
        block[257..263].copy_from_slice(crate::USTAR_MAGIC);
        block[263..265].copy_from_slice(crate::USTAR_VERSION);
        block_with_checksum(block)
    }

    #[test]
    fn zero_block_is_sentinel() {
        let block = [0u8; BLOCK_SIZE];
        let parsed = Header::from_block(&block, &DecodeOptions::default()).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn parses_basic_file() {
        let block = ustar_file_block(b"hello.txt", 14);
        let header = Header::from_block(&block, &DecodeOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(header.name, "hello.txt");
        assert_eq!(header.size, 14);
        assert_eq!(header.mode, 0o644);
        assert_eq!(header.entry_type, EntryType::File);
        assert!(header.pax.is_none());
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let mut block = ustar_file_block(b"hello.txt", 14);
        block[0] ^= 0x01;
        let err = Header::from_block(&block, &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidChecksum { .. }));
    }

    #[test]
    fn unknown_magic_needs_opt_in() {
        let mut block = [0u8; BLOCK_SIZE];
        block[..3].copy_from_slice(b"old");
        block[156] = b'0';
        let block = block_with_checksum(block);

        let err = Header::from_block(&block, &DecodeOptions::default()).unwrap_err();
        assert_eq!(err, DecodeError::InvalidFormat);

        let options = DecodeOptions {
            allow_unknown_format: true,
            ..DecodeOptions::default()
        };
        let header = Header::from_block(&block, &options).unwrap().unwrap();
        assert_eq!(header.name, "old");
    }

    #[test]
    fn ustar_prefix_is_joined() {
        let mut block = ustar_file_block(b"file.txt", 0);
        block[345..348].copy_from_slice(b"dir");
        let block = block_with_checksum(block);
        let header = Header::from_block(&block, &DecodeOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(header.name, "dir/file.txt");
    }

    #[test]
    fn latin1_name_decoding() {
        let mut block = ustar_file_block(&[0x63, 0x61, 0x66, 0xE9], 0);
        block = block_with_checksum(block);
        let options = DecodeOptions {
            filename_encoding: FilenameEncoding::Latin1,
            ..DecodeOptions::default()
        };
        let header = Header::from_block(&block, &options).unwrap().unwrap();
        assert_eq!(header.name, "café");
    }

    #[test]
    fn stream_reads_in_order_then_ends() {
        let (shared, mut stream) = StreamShared::new_pair();
        shared.borrow_mut().push(Bytes::from_static(b"ab"));
        shared.borrow_mut().push(Bytes::from_static(b"cd"));
        assert_eq!(
            stream.read_chunk().unwrap(),
            StreamRead::Chunk(Bytes::from_static(b"ab"))
        );
        assert_eq!(stream.read_chunk().unwrap(), StreamRead::Pending);
        shared.borrow_mut().close();
        assert_eq!(
            stream.read_chunk().unwrap(),
            StreamRead::Chunk(Bytes::from_static(b"cd"))
        );
        assert_eq!(stream.read_chunk().unwrap(), StreamRead::End);
        assert!(stream.is_drained());
    }

    #[test]
    fn stream_error_after_buffered_chunks() {
        let (shared, mut stream) = StreamShared::new_pair();
        shared.borrow_mut().push(Bytes::from_static(b"ab"));
        shared.borrow_mut().fail(DecodeError::Aborted);
        assert_eq!(
            stream.read_chunk().unwrap(),
            StreamRead::Chunk(Bytes::from_static(b"ab"))
        );
        assert_eq!(stream.read_chunk().unwrap_err(), DecodeError::Aborted);
        // The error is consumed; afterwards the stream reads as ended.
        assert_eq!(stream.read_chunk().unwrap(), StreamRead::End);
    }

    #[test]
    fn revoked_stream_rejects_reads() {
        let (shared, mut stream) = StreamShared::new_pair();
        shared.borrow_mut().push(Bytes::from_static(b"ab"));
        shared.borrow_mut().revoke();
        assert!(matches!(
            stream.read_chunk(),
            Err(DecodeError::PreconditionViolation(_))
        ));
        // Pushes after revocation are dropped.
        shared.borrow_mut().push(Bytes::from_static(b"cd"));
        assert!(shared.borrow().chunks.is_empty());
    }

    #[test]
    fn fail_after_close_is_ignored() {
        let (shared, mut stream) = StreamShared::new_pair();
        shared.borrow_mut().close();
        shared.borrow_mut().fail(DecodeError::Aborted);
        assert_eq!(stream.read_chunk().unwrap(), StreamRead::End);
    }
}
