//! The decoding state machine.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use bytes::Bytes;
use log::{debug, trace};

use crate::{block_padding, decode_numeric, EntryType, GnuHeader, BLOCK_SIZE};

use super::entry::{Entry, Header, StreamShared};
use super::error::DecodeError;
use super::extensions::ExtensionStore;
use super::options::DecodeOptions;
use super::queue::ByteQueue;
use super::sparse::{self, SparseReconstructor, SparseRegion};

/// Where the decoder is within the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting the next 512-byte header block.
    ReadingHeader,
    /// Routing payload bytes to the live entry's stream.
    FileData,
    /// Discarding the zero fill after a payload.
    Padding,
    /// Accumulating a GNU long path payload.
    GnuLongPath,
    /// Accumulating a GNU long link payload.
    GnuLongLink,
    /// Accumulating a PAX attribute payload.
    PaxExtension {
        /// Whether the owning record was a global (`'g'`) header.
        global: bool,
    },
    /// Expecting extended sparse map blocks.
    SparseExtended,
    /// Routing packed sparse bytes through the reconstructor.
    SparseData,
    /// Finished, failed, or closed. Terminal.
    Ended,
}

/// Result of one [`Decoder::poll_next`] call.
#[derive(Debug)]
pub enum Poll {
    /// The next archive entry, in order.
    Entry(Entry),
    /// Nothing to report yet; feed more input or acknowledge the
    /// outstanding entry.
    Pending,
    /// The archive ended. Terminal.
    Finished,
}

/// Streaming tar decoder.
///
/// Feed archive bytes with [`write`] in whatever chunking the source
/// produces; the decoder never needs the whole archive in memory. Entries
/// come out of [`poll_next`] one at a time, each owning an
/// [`EntryStream`](super::EntryStream) that delivers exactly
/// `header.size` payload bytes. The consumer acknowledges each entry with
/// [`advance`]; payload it did not read is discarded by the decoder, so
/// skipping an entry is just `advance` without draining.
///
/// The decoder is a single-threaded cooperative state machine: it only
/// runs inside `write`/`end_input`/`advance`, and suspends whenever it
/// needs bytes it does not have or an entry acknowledgement it has not
/// received. It is deliberately `!Send`; drive it from one thread.
///
/// [`write`]: Decoder::write
/// [`poll_next`]: Decoder::poll_next
/// [`advance`]: Decoder::advance
#[derive(Debug)]
pub struct Decoder {
    options: DecodeOptions,
    queue: ByteQueue,
    store: ExtensionStore,
    state: State,

    /// Payload bytes still owed to the live entry's stream.
    entry_remaining: u64,
    /// Zero-fill bytes still to discard before the next header.
    padding_remaining: u64,

    /// Header of a sparse member, parked until its map is complete.
    sparse_header: Option<Header>,
    sparse_map: Vec<SparseRegion>,
    sparse_real_size: u64,
    /// Packed (archived) sparse bytes still to route.
    sparse_remaining: u64,
    reconstructor: Option<SparseReconstructor>,

    /// True while an emitted entry awaits acknowledgement. The decoder
    /// does not advance past `ReadingHeader` while locked.
    locked: bool,
    pending_entry: Option<Entry>,
    /// Producer side of the current entry's stream, kept until advance so
    /// late payload bytes and injected errors have somewhere to go.
    current_shared: Option<Rc<RefCell<StreamShared>>>,

    input_ended: bool,
    error: Option<DecodeError>,
}

impl Decoder {
    /// Create a decoder with the given options.
    #[must_use]
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            options,
            queue: ByteQueue::new(),
            store: ExtensionStore::new(),
            state: State::ReadingHeader,
            entry_remaining: 0,
            padding_remaining: 0,
            sparse_header: None,
            sparse_map: Vec::new(),
            sparse_real_size: 0,
            sparse_remaining: 0,
            reconstructor: None,
            locked: false,
            pending_entry: None,
            current_shared: None,
            input_ended: false,
            error: None,
        }
    }

    /// The options this decoder was built with.
    #[must_use]
    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    /// True while an emitted entry awaits [`advance`](Decoder::advance).
    ///
    /// Writes during that window are accepted and queued; a well-behaved
    /// producer uses this hint (also returned from `write`) to pause.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Feed one chunk of archive bytes.
    ///
    /// Returns the locked hint: `true` means an entry is awaiting
    /// acknowledgement and the caller should ideally delay further
    /// writes. Ignoring the hint is safe; the input queue is unbounded.
    /// After the decoder has ended (finish, error, or
    /// [`close`](Decoder::close)) or after
    /// [`end_input`](Decoder::end_input), writes are no-ops.
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> bool {
        if self.state == State::Ended || self.input_ended {
            return false;
        }
        self.queue.push(chunk.into());
        self.run();
        self.locked
    }

    /// Declare the input exhausted.
    ///
    /// If the archive stops mid-header, mid-payload, or mid-extension the
    /// decoder fails with [`DecodeError::TruncatedArchive`]; input ending
    /// at a clean entry boundary counts as a finish even without the
    /// zero-block sentinel.
    pub fn end_input(&mut self) {
        if self.state == State::Ended || self.input_ended {
            return;
        }
        self.input_ended = true;
        self.run();
    }

    /// Acknowledge the most recently emitted entry.
    ///
    /// Unlocks the decoder and revokes the entry's stream handle;
    /// whatever payload the consumer did not read is discarded
    /// internally. Calling this with no entry outstanding is a protocol
    /// violation and kills the decoder; calling it after the decoder has
    /// ended is a no-op.
    pub fn advance(&mut self) {
        if self.state == State::Ended {
            return;
        }
        if !self.locked {
            self.fail(DecodeError::PreconditionViolation(
                "advance called with no entry outstanding",
            ));
            return;
        }
        self.locked = false;
        self.pending_entry = None;
        if let Some(shared) = self.current_shared.take() {
            shared.borrow_mut().revoke();
        }
        self.run();
    }

    /// Pull the next event.
    ///
    /// # Errors
    ///
    /// A fatal decode error is returned exactly once; afterwards the
    /// decoder reports [`Poll::Finished`]. If the error struck while an
    /// entry's payload was being delivered, the same error is also
    /// readable from that entry's stream.
    pub fn poll_next(&mut self) -> Result<Poll, DecodeError> {
        if let Some(entry) = self.pending_entry.take() {
            return Ok(Poll::Entry(entry));
        }
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if self.state == State::Ended {
            return Ok(Poll::Finished);
        }
        Ok(Poll::Pending)
    }

    /// Shut the decoder down.
    ///
    /// Buffered input is discarded. If an entry's payload was still being
    /// delivered its stream receives [`DecodeError::Aborted`]; a
    /// fully-delivered stream is left readable. Outstanding
    /// [`advance`](Decoder::advance) calls become no-ops.
    pub fn close(&mut self) {
        if self.state == State::Ended {
            return;
        }
        debug!("decoder closed");
        if let Some(shared) = self.current_shared.take() {
            let mut shared = shared.borrow_mut();
            if !shared.is_closed() {
                shared.fail(DecodeError::Aborted);
            }
        }
        self.pending_entry = None;
        self.reconstructor = None;
        self.queue.clear();
        self.state = State::Ended;
    }

    // =========================================================================
    // State machine
    // =========================================================================

    /// Run the machine until it needs input or an acknowledgement.
    fn run(&mut self) {
        loop {
            match self.state {
                State::Ended => return,

                State::ReadingHeader => {
                    if self.locked {
                        return;
                    }
                    if !self.queue.has(BLOCK_SIZE) {
                        if self.input_ended {
                            if self.queue.is_empty() {
                                self.finish();
                            } else {
                                self.fail(DecodeError::TruncatedArchive("a header block"));
                            }
                        }
                        return;
                    }
                    let block_bytes = self.queue.take(BLOCK_SIZE);
                    let block: &[u8; BLOCK_SIZE] = block_bytes
                        .as_ref()
                        .try_into()
                        .expect("take returned a full block");
                    match Header::from_block(block, &self.options) {
                        Ok(None) => {
                            trace!("end-of-archive sentinel");
                            self.finish();
                        }
                        Ok(Some(header)) => {
                            if let Err(error) = self.dispatch(header, block) {
                                self.fail(error);
                                return;
                            }
                        }
                        Err(error) => {
                            self.fail(error);
                            return;
                        }
                    }
                }

                State::FileData => {
                    while self.entry_remaining > 0 && !self.queue.is_empty() {
                        let step = self.entry_remaining.min(self.queue.len() as u64) as usize;
                        let chunk = self.queue.pop_up_to(step);
                        self.entry_remaining -= chunk.len() as u64;
                        if let Some(shared) = &self.current_shared {
                            shared.borrow_mut().push(chunk);
                        }
                    }
                    if self.entry_remaining > 0 {
                        if self.input_ended {
                            self.fail(DecodeError::TruncatedArchive("entry data"));
                        }
                        return;
                    }
                    if let Some(shared) = &self.current_shared {
                        shared.borrow_mut().close();
                    }
                    self.state = self.after_data_state();
                }

                State::Padding => {
                    while self.padding_remaining > 0 && !self.queue.is_empty() {
                        let step = self.padding_remaining.min(self.queue.len() as u64) as usize;
                        let chunk = self.queue.pop_up_to(step);
                        self.padding_remaining -= chunk.len() as u64;
                    }
                    if self.padding_remaining > 0 {
                        if self.input_ended {
                            self.fail(DecodeError::TruncatedArchive("block padding"));
                        }
                        return;
                    }
                    self.state = State::ReadingHeader;
                }

                State::GnuLongPath | State::GnuLongLink | State::PaxExtension { .. } => {
                    while self.store.remaining() > 0 && !self.queue.is_empty() {
                        let step = self.store.remaining().min(self.queue.len() as u64) as usize;
                        let chunk = self.queue.pop_up_to(step);
                        self.store.feed(chunk);
                    }
                    if self.store.remaining() > 0 {
                        if self.input_ended {
                            self.fail(DecodeError::TruncatedArchive("an extension record"));
                        }
                        return;
                    }
                    let kind = match self.state {
                        State::GnuLongPath => EntryType::GnuLongPath,
                        State::GnuLongLink => EntryType::GnuLongLinkPath,
                        State::PaxExtension { global: false } => EntryType::PaxHeader,
                        State::PaxExtension { global: true } => EntryType::PaxGlobalHeader,
                        _ => unreachable!("extension arm matched a non-extension state"),
                    };
                    self.store.finalise(kind, self.options.filename_encoding);
                    self.state = self.after_data_state();
                }

                State::SparseExtended => {
                    if !self.queue.has(BLOCK_SIZE) {
                        if self.input_ended {
                            self.fail(DecodeError::TruncatedArchive("a sparse continuation block"));
                        }
                        return;
                    }
                    let block_bytes = self.queue.take(BLOCK_SIZE);
                    let block: &[u8; BLOCK_SIZE] = block_bytes
                        .as_ref()
                        .try_into()
                        .expect("take returned a full block");
                    let more = sparse::parse_extended_regions(block, &mut self.sparse_map);
                    if let Err(error) = self.check_sparse_limit() {
                        self.fail(error);
                        return;
                    }
                    if !more {
                        self.setup_sparse_entry();
                    }
                }

                State::SparseData => {
                    while self.sparse_remaining > 0 && !self.queue.is_empty() {
                        let step = self.sparse_remaining.min(self.queue.len() as u64) as usize;
                        let chunk = self.queue.pop_up_to(step);
                        self.sparse_remaining -= chunk.len() as u64;
                        let shared = self.current_shared.clone();
                        if let Some(reconstructor) = self.reconstructor.as_mut() {
                            reconstructor.push(chunk, &mut |bytes| {
                                if let Some(shared) = &shared {
                                    shared.borrow_mut().push(bytes);
                                }
                            });
                        }
                    }
                    if self.sparse_remaining > 0 {
                        if self.input_ended {
                            self.fail(DecodeError::TruncatedArchive("sparse data"));
                        }
                        return;
                    }
                    let shared = self.current_shared.clone();
                    if let Some(mut reconstructor) = self.reconstructor.take() {
                        reconstructor.end(&mut |bytes| {
                            if let Some(shared) = &shared {
                                shared.borrow_mut().push(bytes);
                            }
                        });
                    }
                    if let Some(shared) = &shared {
                        shared.borrow_mut().close();
                    }
                    self.state = self.after_data_state();
                }
            }
        }
    }

    /// Route a freshly parsed header to its handling state.
    fn dispatch(
        &mut self,
        mut header: Header,
        block: &[u8; BLOCK_SIZE],
    ) -> Result<(), DecodeError> {
        match header.entry_type {
            EntryType::GnuLongPath
            | EntryType::GnuLongLinkPath
            | EntryType::PaxHeader
            | EntryType::PaxGlobalHeader => {
                let limit = self.options.limits.max_extension_size;
                if header.size > limit {
                    return Err(DecodeError::ExtensionTooLarge {
                        kind: extension_kind(header.entry_type),
                        size: header.size,
                        limit,
                    });
                }
                trace!(
                    "extension record {:?}, {} payload bytes",
                    header.entry_type,
                    header.size
                );
                self.padding_remaining = block_padding(header.size);
                self.store.begin(header.size);
                self.state = match header.entry_type {
                    EntryType::GnuLongPath => State::GnuLongPath,
                    EntryType::GnuLongLinkPath => State::GnuLongLink,
                    EntryType::PaxHeader => State::PaxExtension { global: false },
                    _ => State::PaxExtension { global: true },
                };
                Ok(())
            }

            EntryType::GnuSparse => {
                let gnu = GnuHeader::view(block);
                self.sparse_map.clear();
                sparse::parse_main_regions(gnu, &mut self.sparse_map);
                self.check_sparse_limit()?;
                let real_size = decode_numeric(&gnu.realsize);
                if real_size < 0 {
                    return Err(DecodeError::InvalidFormat);
                }
                self.store.apply(&mut header);
                self.sparse_real_size = real_size as u64;
                self.sparse_header = Some(header);
                if gnu.isextended != 0 {
                    self.state = State::SparseExtended;
                } else {
                    self.setup_sparse_entry();
                }
                Ok(())
            }

            EntryType::GnuMultiVolume => {
                // Continuation data cannot be restarted mid-stream; skip
                // the member so the rest of the archive stays readable.
                debug!("skipping multi-volume member '{}'", header.name);
                self.padding_remaining = header.size + block_padding(header.size);
                self.state = if self.padding_remaining > 0 {
                    State::Padding
                } else {
                    State::ReadingHeader
                };
                Ok(())
            }

            EntryType::Unknown(byte) if !self.options.allow_unknown_format => {
                Err(DecodeError::UnknownEntryType(byte))
            }

            _ => {
                self.store.apply(&mut header);
                self.entry_remaining = header.size;
                self.padding_remaining = block_padding(header.size);
                self.emit_entry(header);
                Ok(())
            }
        }
    }

    /// Emit a plain entry and lock until the consumer acknowledges it.
    fn emit_entry(&mut self, header: Header) {
        debug!(
            "entry '{}' ({:?}, {} bytes)",
            header.name, header.entry_type, header.size
        );
        let (shared, stream) = StreamShared::new_pair();
        if self.entry_remaining == 0 {
            shared.borrow_mut().close();
            self.state = self.after_data_state();
        } else {
            self.state = State::FileData;
        }
        self.current_shared = Some(shared);
        self.locked = true;
        self.pending_entry = Some(Entry { header, stream });
    }

    /// Emit the parked sparse member as an ordinary file of its real size.
    fn setup_sparse_entry(&mut self) {
        let mut header = self
            .sparse_header
            .take()
            .expect("sparse header parked before map completion");
        let map = mem::take(&mut self.sparse_map);
        let packed = SparseReconstructor::packed_size(&map);
        self.sparse_remaining = packed;
        self.padding_remaining = block_padding(packed);
        header.entry_type = EntryType::File;
        header.size = self.sparse_real_size;
        debug!(
            "sparse entry '{}': {} packed bytes, {} real",
            header.name, packed, header.size
        );

        let mut reconstructor = SparseReconstructor::new(map, self.sparse_real_size);
        let (shared, stream) = StreamShared::new_pair();
        if packed == 0 {
            reconstructor.end(&mut |bytes| shared.borrow_mut().push(bytes));
            shared.borrow_mut().close();
            self.state = self.after_data_state();
        } else {
            self.reconstructor = Some(reconstructor);
            self.state = State::SparseData;
        }
        self.current_shared = Some(shared);
        self.locked = true;
        self.pending_entry = Some(Entry { header, stream });
    }

    fn check_sparse_limit(&self) -> Result<(), DecodeError> {
        let limit = self.options.limits.max_sparse_regions;
        if self.sparse_map.len() > limit {
            return Err(DecodeError::ExtensionTooLarge {
                kind: "sparse map",
                size: self.sparse_map.len() as u64,
                limit: limit as u64,
            });
        }
        Ok(())
    }

    fn after_data_state(&self) -> State {
        if self.padding_remaining > 0 {
            State::Padding
        } else {
            State::ReadingHeader
        }
    }

    fn finish(&mut self) {
        debug!("archive finished");
        self.queue.clear();
        self.state = State::Ended;
    }

    /// Terminal failure: surface the error on both the main surface and
    /// the live entry stream, then stop.
    fn fail(&mut self, error: DecodeError) {
        debug!("decode failed: {error}");
        if let Some(shared) = self.current_shared.take() {
            shared.borrow_mut().fail(error.clone());
        }
        self.error = Some(error);
        self.reconstructor = None;
        self.queue.clear();
        self.state = State::Ended;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DecodeOptions::default())
    }
}

fn extension_kind(entry_type: EntryType) -> &'static str {
    match entry_type {
        EntryType::GnuLongPath => "GNU long path record",
        EntryType::GnuLongLinkPath => "GNU long link record",
        EntryType::PaxHeader => "PAX record",
        EntryType::PaxGlobalHeader => "PAX global record",
        _ => "extension record",
    }
}
