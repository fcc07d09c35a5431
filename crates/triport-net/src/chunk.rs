//! Splitting scatter-gather lists to fit per-operation hardware limits.

use std::mem;

/// One scatter-gather entry: an address range plus the local key covering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub length: usize,
    pub key: u64,
}

impl Segment {
    pub fn new(addr: u64, length: usize, key: u64) -> Self {
        Self { addr, length, key }
    }
}

/// A piece of a logical transfer that fits in one work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkChunk {
    pub segments: Vec<Segment>,
    /// Byte offset of this chunk within the logical transfer.
    pub offset: u64,
    pub length: usize,
}

impl WorkChunk {
    fn empty(offset: u64) -> Self {
        Self {
            segments: Vec::new(),
            offset,
            length: 0,
        }
    }
}

/// Split the byte stream described by `segments` into chunks of at most
/// `max_entries` entries and `max_bytes` bytes.
///
/// The entry that crosses a chunk's byte limit is truncated and its remainder
/// starts the next chunk. Zero-length entries are dropped.
pub fn split_segments(segments: &[Segment], max_entries: usize, max_bytes: usize) -> Vec<WorkChunk> {
    let max_entries = max_entries.max(1);
    let max_bytes = max_bytes.max(1);

    let mut chunks = Vec::new();
    let mut offset = 0u64;
    let mut current = WorkChunk::empty(0);

    for seg in segments {
        let mut addr = seg.addr;
        let mut remaining = seg.length;
        while remaining > 0 {
            if current.segments.len() == max_entries || current.length == max_bytes {
                chunks.push(mem::replace(&mut current, WorkChunk::empty(offset)));
            }
            let take = remaining.min(max_bytes - current.length);
            current.segments.push(Segment::new(addr, take, seg.key));
            current.length += take;
            addr += take as u64;
            remaining -= take;
            offset += take as u64;
        }
    }
    if current.length > 0 {
        chunks.push(current);
    }
    chunks
}

/// The entries covering bytes `[start, start + len)` of the logical stream.
pub fn slice_segments(segments: &[Segment], start: usize, len: usize) -> Vec<Segment> {
    let end = start + len;
    let mut out = Vec::new();
    let mut pos = 0usize;
    for seg in segments {
        let seg_end = pos + seg.length;
        if seg_end > start && pos < end {
            let from = start.max(pos);
            let to = end.min(seg_end);
            out.push(Segment::new(seg.addr + (from - pos) as u64, to - from, seg.key));
        }
        pos = seg_end;
        if pos >= end {
            break;
        }
    }
    out
}

pub fn total_length(segments: &[Segment]) -> usize {
    segments.iter().map(|s| s.length).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(addr: u64, length: usize) -> Segment {
        Segment::new(addr, length, 9)
    }

    #[test]
    fn test_within_limits_is_single_chunk() {
        let segs = [seg(0x1000, 10), seg(0x2000, 20)];
        let chunks = split_segments(&segs, 4, 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].segments, segs.to_vec());
        assert_eq!(chunks[0].length, 30);
        assert_eq!(chunks[0].offset, 0);
    }

    #[test]
    fn test_split_by_entry_limit() {
        let segs: Vec<_> = (0..7).map(|i| seg(0x1000 * (i + 1), 8)).collect();
        let chunks = split_segments(&segs, 3, usize::MAX);
        assert_eq!(
            chunks.iter().map(|c| c.segments.len()).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
        assert_eq!(
            chunks.iter().map(|c| c.offset).collect::<Vec<_>>(),
            vec![0, 24, 48]
        );
    }

    #[test]
    fn test_split_truncates_and_carries_remainder() {
        let segs = [seg(0x1000, 6), seg(0x2000, 10)];
        let chunks = split_segments(&segs, 8, 8);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].segments, vec![seg(0x1000, 6), seg(0x2000, 2)]);
        assert_eq!(chunks[1].segments, vec![seg(0x2002, 8)]);
        assert_eq!(chunks[1].offset, 8);
    }

    #[test]
    fn test_split_preserves_total_bytes() {
        let segs: Vec<_> = (0..13).map(|i| seg(0x10_000 * (i + 1), 7 + i as usize)).collect();
        let total = total_length(&segs);
        for (entries, bytes) in [(1, 5), (2, 16), (4, 33), (32, 1 << 20)] {
            let chunks = split_segments(&segs, entries, bytes);
            assert_eq!(chunks.iter().map(|c| c.length).sum::<usize>(), total);
            let mut expected_offset = 0u64;
            for chunk in &chunks {
                assert!(chunk.segments.len() <= entries);
                assert!(chunk.length <= bytes);
                assert_eq!(chunk.offset, expected_offset);
                assert_eq!(total_length(&chunk.segments), chunk.length);
                expected_offset += chunk.length as u64;
            }
        }
    }

    #[test]
    fn test_zero_length_entries_skipped() {
        let segs = [seg(0x1000, 0), seg(0x2000, 4), seg(0x3000, 0)];
        let chunks = split_segments(&segs, 1, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].segments, vec![seg(0x2000, 4)]);
        assert!(split_segments(&[], 4, 4).is_empty());
    }

    #[test]
    fn test_slice_segments() {
        let segs = [seg(0x1000, 4), seg(0x2000, 4), seg(0x3000, 4)];
        assert_eq!(slice_segments(&segs, 2, 4), vec![seg(0x1002, 2), seg(0x2000, 2)]);
        assert_eq!(slice_segments(&segs, 4, 4), vec![seg(0x2000, 4)]);
        assert_eq!(slice_segments(&segs, 0, 12), segs.to_vec());
        assert!(slice_segments(&segs, 12, 0).is_empty());
    }
}
