//! Old-GNU sparse map parsing and hole reconstruction.

use bytes::Bytes;

use crate::{decode_numeric, GnuExtSparseHeader, GnuHeader, GnuSparseDescriptor, BLOCK_SIZE};

/// Granularity of zero-fill emission. One static buffer backs every hole.
const ZERO_CHUNK: usize = 64 * 1024;

static ZEROES: [u8; ZERO_CHUNK] = [0u8; ZERO_CHUNK];

/// One present-data region of a sparse file: `numbytes` of packed archive
/// data that land at `offset` in the reconstructed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseRegion {
    /// Byte offset of the region within the real file.
    pub offset: u64,
    /// Length of the region in bytes.
    pub numbytes: u64,
}

fn push_region(descriptor: &GnuSparseDescriptor, map: &mut Vec<SparseRegion>) -> bool {
    if descriptor.is_terminator() {
        return false;
    }
    map.push(SparseRegion {
        offset: decode_numeric(&descriptor.offset).max(0) as u64,
        numbytes: decode_numeric(&descriptor.numbytes).max(0) as u64,
    });
    true
}

/// Collect the in-header sparse map of a GNU `'S'` member.
///
/// Up to four descriptors, terminated early by a `(0, 0)` pair.
pub(crate) fn parse_main_regions(gnu: &GnuHeader, map: &mut Vec<SparseRegion>) {
    for descriptor in &gnu.sparse {
        if !push_region(descriptor, map) {
            break;
        }
    }
}

/// Collect the descriptors of one extended sparse block.
///
/// Returns true when the block's continuation flag announces another
/// extended block.
pub(crate) fn parse_extended_regions(block: &[u8; BLOCK_SIZE], map: &mut Vec<SparseRegion>) -> bool {
    let ext = GnuExtSparseHeader::view(block);
    for descriptor in &ext.sparse {
        if !push_region(descriptor, map) {
            break;
        }
    }
    ext.isextended != 0
}

/// Rewrites the packed data stream of a sparse member into the full-length
/// file it represents.
///
/// Packed bytes pushed in map onto the regions in order; gaps between
/// regions, and the tail after the last region, come out as zero bytes.
/// After [`end`] the total emitted length equals `real_size` exactly.
///
/// [`end`]: SparseReconstructor::end
#[derive(Debug)]
pub(crate) struct SparseReconstructor {
    map: Vec<SparseRegion>,
    real_size: u64,
    index: usize,
    virtual_pos: u64,
    region_remaining: u64,
    emitted: u64,
    ended: bool,
}

impl SparseReconstructor {
    pub(crate) fn new(map: Vec<SparseRegion>, real_size: u64) -> Self {
        let region_remaining = map.first().map_or(0, |r| r.numbytes);
        Self {
            map,
            real_size,
            index: 0,
            virtual_pos: 0,
            region_remaining,
            emitted: 0,
            ended: false,
        }
    }

    /// Total packed bytes the map expects.
    pub(crate) fn packed_size(map: &[SparseRegion]) -> u64 {
        map.iter().map(|r| r.numbytes).sum()
    }

    /// Route packed archive bytes through the map.
    pub(crate) fn push(&mut self, mut data: Bytes, emit: &mut impl FnMut(Bytes)) {
        while !data.is_empty() && self.index < self.map.len() {
            let region = self.map[self.index];
            if self.virtual_pos < region.offset {
                self.emit_zeros(region.offset - self.virtual_pos, emit);
            }

            let step = (self.region_remaining.min(data.len() as u64)) as usize;
            if step > 0 {
                let chunk = data.split_to(step);
                self.virtual_pos += step as u64;
                self.emitted += step as u64;
                self.region_remaining -= step as u64;
                emit(chunk);
            }

            if self.region_remaining == 0 {
                self.index += 1;
                self.region_remaining = self.map.get(self.index).map_or(0, |r| r.numbytes);
            }
        }
        debug_assert!(data.is_empty(), "packed data exceeded the sparse map");
    }

    /// Zero-fill the final hole and seal the stream.
    pub(crate) fn end(&mut self, emit: &mut impl FnMut(Bytes)) {
        if self.ended {
            return;
        }
        if self.virtual_pos < self.real_size {
            self.emit_zeros(self.real_size - self.virtual_pos, emit);
        }
        self.ended = true;
    }

    /// Virtual bytes emitted so far (data plus holes).
    #[cfg(test)]
    pub(crate) fn emitted(&self) -> u64 {
        self.emitted
    }

    fn emit_zeros(&mut self, count: u64, emit: &mut impl FnMut(Bytes)) {
        let mut remaining = count;
        while remaining > 0 {
            let step = remaining.min(ZERO_CHUNK as u64) as usize;
            emit(Bytes::from_static(&ZEROES[..step]));
            remaining -= step as u64;
        }
        self.virtual_pos += count;
        self.emitted += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(recon: &mut SparseReconstructor, data: &[u8], chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for piece in data.chunks(chunk.max(1)) {
            recon.push(Bytes::copy_from_slice(piece), &mut |b| {
                out.extend_from_slice(&b)
            });
        }
        recon.end(&mut |b| out.extend_from_slice(&b));
        out
    }

    #[test]
    fn reconstructs_holes_between_regions() {
        let map = vec![
            SparseRegion { offset: 0, numbytes: 4 },
            SparseRegion { offset: 512, numbytes: 4 },
        ];
        let mut recon = SparseReconstructor::new(map, 1024);
        let out = collect(&mut recon, b"AAAABBBB", 8);

        assert_eq!(out.len(), 1024);
        assert_eq!(&out[0..4], b"AAAA");
        assert!(out[4..512].iter().all(|&b| b == 0));
        assert_eq!(&out[512..516], b"BBBB");
        assert!(out[516..].iter().all(|&b| b == 0));
        assert_eq!(recon.emitted(), 1024);
    }

    #[test]
    fn chunking_does_not_change_output() {
        let map = vec![
            SparseRegion { offset: 10, numbytes: 5 },
            SparseRegion { offset: 100, numbytes: 7 },
        ];
        let data = b"abcdeFGHIJKL";
        let expected = collect(&mut SparseReconstructor::new(map.clone(), 200), data, 12);
        for chunk in [1, 2, 3, 5, 11] {
            let got = collect(&mut SparseReconstructor::new(map.clone(), 200), data, chunk);
            assert_eq!(got, expected, "chunk size {chunk}");
        }
    }

    #[test]
    fn leading_hole() {
        let map = vec![SparseRegion { offset: 700, numbytes: 3 }];
        let mut recon = SparseReconstructor::new(map, 703);
        let out = collect(&mut recon, b"xyz", 3);
        assert_eq!(out.len(), 703);
        assert!(out[..700].iter().all(|&b| b == 0));
        assert_eq!(&out[700..], b"xyz");
    }

    #[test]
    fn empty_map_is_all_zeros() {
        let mut recon = SparseReconstructor::new(Vec::new(), 1000);
        let out = collect(&mut recon, b"", 1);
        assert_eq!(out.len(), 1000);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn end_is_idempotent() {
        let mut recon = SparseReconstructor::new(Vec::new(), 10);
        let mut out = Vec::new();
        recon.end(&mut |b| out.extend_from_slice(&b));
        recon.end(&mut |b| out.extend_from_slice(&b));
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn holes_larger_than_zero_chunk() {
        let big = ZERO_CHUNK as u64 * 2 + 17;
        let mut recon = SparseReconstructor::new(Vec::new(), big);
        let mut total = 0usize;
        recon.end(&mut |b| {
            assert!(b.iter().all(|&x| x == 0));
            total += b.len();
        });
        assert_eq!(total as u64, big);
    }

    #[test]
    fn packed_size_sums_regions() {
        let map = [
            SparseRegion { offset: 0, numbytes: 4 },
            SparseRegion { offset: 512, numbytes: 4 },
        ];
        assert_eq!(SparseReconstructor::packed_size(&map), 8);
    }
}
