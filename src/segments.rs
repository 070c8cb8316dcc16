//! # File segmentation and reassembly
//!
//! The sending side uses a [Segmenter] to split a file into offset tagged segments. The
//! receiving side records every received segment in a [ReceivedSegments] set, which keeps a
//! sorted list of non-overlapping half-open byte ranges `[start, end)`. The gaps in that set are
//! the lost segments which are requested again with NAK PDUs.

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum SegmentError {
    #[error("segment start {start} is larger than segment end {end}")]
    InvalidRange { start: u64, end: u64 },
}

/// One file segment produced by the [Segmenter].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FileSegment {
    pub offset: u64,
    pub len: u64,
}

impl FileSegment {
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Splits a file of a known size into segments of at most `segment_len` bytes. The cursor only
/// moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Segmenter {
    file_size: u64,
    segment_len: u64,
    cursor: u64,
}

impl Segmenter {
    /// A segment length of 0 is clamped to 1 so the segmenter always makes progress.
    pub fn new(file_size: u64, segment_len: u64) -> Self {
        Self {
            file_size,
            segment_len: segment_len.max(1),
            cursor: 0,
        }
    }

    /// Next segment starting at the cursor, or [None] once the end of the file was reached.
    pub fn next_segment(&mut self) -> Option<FileSegment> {
        if self.cursor >= self.file_size {
            return None;
        }
        let len = self.segment_len.min(self.file_size - self.cursor);
        let segment = FileSegment {
            offset: self.cursor,
            len,
        };
        self.cursor += len;
        Some(segment)
    }

    #[inline]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    #[inline]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[inline]
    pub fn segment_len(&self) -> u64 {
        self.segment_len
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.file_size
    }
}

/// Set of received byte ranges of a file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReceivedSegments {
    // Sorted by start, non-overlapping and non-adjacent.
    intervals: Vec<(u64, u64)>,
}

impl ReceivedSegments {
    /// Record `len` bytes received at `offset`. Recording a range which was already received
    /// does not change the set.
    pub fn record(&mut self, offset: u64, len: u64) {
        let end = offset.saturating_add(len);
        if end > offset {
            self.intervals.push((offset, end));
            self.coalesce();
        }
    }

    /// Record the half-open range `[start, end)`.
    pub fn record_range(&mut self, start: u64, end: u64) -> Result<(), SegmentError> {
        if start > end {
            return Err(SegmentError::InvalidRange { start, end });
        }
        self.record(start, end - start);
        Ok(())
    }

    fn coalesce(&mut self) {
        if self.intervals.len() <= 1 {
            return;
        }
        self.intervals.sort_unstable_by_key(|&(start, _)| start);

        // In-place merge of overlapping or adjacent ranges.
        let mut w = 0;
        for i in 0..self.intervals.len() {
            let (start, end) = self.intervals[i];
            if w > 0 && start <= self.intervals[w - 1].1 {
                if end > self.intervals[w - 1].1 {
                    self.intervals[w - 1].1 = end;
                }
                continue;
            }
            self.intervals[w] = (start, end);
            w += 1;
        }
        self.intervals.truncate(w);
    }

    /// Missing ranges in `[0, up_to)`, ordered by offset.
    pub fn gaps(&self, up_to: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        let mut next_expected = 0;
        for &(start, end) in &self.intervals {
            if start >= up_to {
                break;
            }
            if start > next_expected {
                gaps.push((next_expected, start));
            }
            next_expected = end;
        }
        if next_expected < up_to {
            gaps.push((next_expected, up_to));
        }
        gaps
    }

    /// Holds if the received ranges are exactly `[0, file_size)`.
    pub fn is_complete(&self, file_size: u64) -> bool {
        match self.intervals.as_slice() {
            [] => file_size == 0,
            [(0, end)] => *end == file_size,
            _ => false,
        }
    }

    /// Number of bytes received, not counting duplicates.
    pub fn received_bytes(&self) -> u64 {
        self.intervals.iter().map(|(start, end)| end - start).sum()
    }

    /// End of the highest received range.
    pub fn progress(&self) -> u64 {
        self.intervals.last().map(|&(_, end)| end).unwrap_or(0)
    }

    #[inline]
    pub fn intervals(&self) -> &[(u64, u64)] {
        &self.intervals
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn reset(&mut self) {
        self.intervals.clear();
    }
}
