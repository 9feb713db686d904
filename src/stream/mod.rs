//! Push-driven streaming tar decoder.
//!
//! The [`Decoder`] turns arbitrarily chunked archive bytes into an ordered
//! sequence of entries, handling GNU long name/link records, PAX per-entry
//! and global attributes, and old-GNU sparse members transparently.
//!
//! # Driving the decoder
//!
//! The caller owns the loop: feed chunks with [`Decoder::write`], pull with
//! [`Decoder::poll_next`], read the current entry's payload through its
//! [`EntryStream`], and acknowledge each entry with [`Decoder::advance`].
//! At most one entry is live at a time; while one is outstanding the
//! decoder is *locked* and parks new input in its queue ([`Decoder::write`]
//! returns the locked hint so well-behaved producers can pause).
//!
//! ```no_run
//! use bytes::Bytes;
//! use tar_decode::stream::{Decoder, DecodeOptions, Poll, StreamRead};
//!
//! fn drain(archive: &[u8]) -> Result<(), tar_decode::stream::DecodeError> {
//!     let mut decoder = Decoder::new(DecodeOptions::default());
//!     decoder.write(Bytes::copy_from_slice(archive));
//!     decoder.end_input();
//!
//!     loop {
//!         match decoder.poll_next()? {
//!             Poll::Entry(mut entry) => {
//!                 println!("{} ({} bytes)", entry.header.name, entry.header.size);
//!                 while let StreamRead::Chunk(chunk) = entry.stream.read_chunk()? {
//!                     // use chunk
//!                     let _ = chunk;
//!                 }
//!                 decoder.advance();
//!             }
//!             Poll::Pending => break, // feed more input
//!             Poll::Finished => break,
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Security
//!
//! Declared extension payload sizes and sparse map cardinality are checked
//! against configurable [`Limits`] before anything is buffered, so a
//! malicious archive cannot make the decoder allocate unboundedly for a
//! single metadata record.

mod decoder;
mod entry;
mod error;
mod extensions;
mod options;
mod queue;
mod sparse;

pub use decoder::{Decoder, Poll};
pub use entry::{Entry, EntryStream, Header, StreamRead};
pub use error::DecodeError;
pub use options::{DecodeOptions, FilenameEncoding, Limits};
pub use sparse::SparseRegion;
