//! Pending cross-header extension state.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{decode_pax, pax, truncate_null, EntryType};

use super::entry::Header;
use super::options::FilenameEncoding;

/// Accumulates extension records until the entry they describe arrives.
///
/// GNU long path/link records and PAX attribute records precede the header
/// they modify, so their decoded payloads park here. [`apply`] folds the
/// pending state into the next real header and clears the one-shot parts;
/// the global PAX map accumulates for the lifetime of the archive.
///
/// [`apply`]: ExtensionStore::apply
#[derive(Debug, Default)]
pub(crate) struct ExtensionStore {
    long_path: Option<String>,
    long_link: Option<String>,
    local_pax: Option<BTreeMap<String, String>>,
    global_pax: BTreeMap<String, String>,
    accum: Vec<Bytes>,
    accum_remaining: u64,
}

impl ExtensionStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start accumulating an extension payload of `declared_size` bytes.
    pub(crate) fn begin(&mut self, declared_size: u64) {
        self.accum.clear();
        self.accum_remaining = declared_size;
    }

    /// Payload bytes still expected by the record being accumulated.
    pub(crate) fn remaining(&self) -> u64 {
        self.accum_remaining
    }

    /// Buffer one payload chunk.
    pub(crate) fn feed(&mut self, chunk: Bytes) {
        debug_assert!(chunk.len() as u64 <= self.accum_remaining);
        self.accum_remaining -= chunk.len() as u64;
        self.accum.push(chunk);
    }

    /// Decode the accumulated payload into pending state.
    ///
    /// `kind` is the typeflag of the extension header that declared the
    /// payload; anything else is a decoder bug.
    pub(crate) fn finalise(&mut self, kind: EntryType, encoding: FilenameEncoding) {
        debug_assert_eq!(self.accum_remaining, 0);
        let payload = self.concat_accum();
        match kind {
            EntryType::GnuLongPath => {
                self.long_path = Some(encoding.decode(truncate_null(&payload)));
            }
            EntryType::GnuLongLinkPath => {
                self.long_link = Some(encoding.decode(truncate_null(&payload)));
            }
            EntryType::PaxHeader => {
                self.local_pax = Some(decode_pax(&payload));
            }
            EntryType::PaxGlobalHeader => {
                // Global attributes merge key-by-key and persist across
                // the rest of the archive.
                self.global_pax.extend(decode_pax(&payload));
            }
            other => unreachable!("finalise called for non-extension type {other:?}"),
        }
    }

    /// Fold pending extension state into the next real header.
    ///
    /// Application order matters: global PAX first, then per-entry PAX,
    /// then the GNU long path/link overrides, and finally the old-tar
    /// trailing-slash directory convention (judged against the fully
    /// resolved name).
    pub(crate) fn apply(&mut self, header: &mut Header) {
        for (key, value) in &self.global_pax {
            apply_pax_key(header, key, value);
        }
        if let Some(map) = self.local_pax.take() {
            for (key, value) in &map {
                apply_pax_key(header, key, value);
            }
            header.pax = Some(map);
        }
        if let Some(path) = self.long_path.take() {
            header.name = path;
        }
        if let Some(link) = self.long_link.take() {
            header.linkname = link;
        }
        if header.entry_type == EntryType::File && header.name.ends_with('/') {
            header.entry_type = EntryType::Directory;
        }
    }

    fn concat_accum(&mut self) -> Bytes {
        if self.accum.len() == 1 {
            return self.accum.pop().expect("length checked");
        }
        let total = self.accum.iter().map(Bytes::len).sum();
        let mut payload = Vec::with_capacity(total);
        for chunk in self.accum.drain(..) {
            payload.extend_from_slice(&chunk);
        }
        Bytes::from(payload)
    }
}

/// Map one PAX attribute onto its header field.
///
/// Unparseable numeric values leave the header untouched; the attribute
/// still reaches consumers through the attached map.
fn apply_pax_key(header: &mut Header, key: &str, value: &str) {
    match key {
        pax::PATH => header.name = value.to_string(),
        pax::LINKPATH => header.linkname = value.to_string(),
        pax::SIZE => {
            if let Ok(size) = value.parse::<u64>() {
                header.size = size;
            }
        }
        pax::UID => {
            if let Ok(uid) = value.parse::<i64>() {
                header.uid = uid;
            }
        }
        pax::GID => {
            if let Ok(gid) = value.parse::<i64>() {
                header.gid = gid;
            }
        }
        pax::UNAME => header.uname = value.to_string(),
        pax::GNAME => header.gname = value.to_string(),
        pax::MTIME => {
            if let Ok(mtime) = value.parse::<f64>() {
                header.mtime = mtime;
            }
        }
        _ => {}
    }
}
