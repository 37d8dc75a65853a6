//! Sub-block boundaries for batches assembled from multiple statements.

use crate::{Batch, OffsetsNotMonotonicSnafu, OffsetsTailMismatchSnafu, Result};
use snafu::ensure;

/// Row offsets marking sub-block boundaries inside a [`Batch`].
///
/// Offset `offsets[i]` is the exclusive end of sub-block `i`; sub-block `i`
/// spans rows `[offsets[i-1], offsets[i])` (with an implicit leading 0). The
/// last offset always equals the batch row count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOffsets(Vec<usize>);

impl ChunkOffsets {
    /// Validate offsets against a batch of `rows` rows.
    pub fn new(offsets: Vec<usize>, rows: usize) -> Result<Self> {
        ensure!(
            offsets.windows(2).all(|w| w[0] < w[1]) && offsets.first().map_or(true, |&o| o > 0),
            OffsetsNotMonotonicSnafu
        );
        let last = offsets.last().copied().unwrap_or_default();
        ensure!(last == rows, OffsetsTailMismatchSnafu { last, rows });
        Ok(Self(offsets))
    }

    /// The exclusive sub-block ends.
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Number of sub-blocks.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no sub-blocks.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the `(start, end)` row range of every sub-block.
    pub fn ranges(&self) -> impl Iterator<Item = std::ops::Range<usize>> + '_ {
        self.0.iter().scan(0, |start, &end| {
            let range = *start..end;
            *start = end;
            Some(range)
        })
    }
}

/// Scatter a batch across `parts` destinations while carrying the sub-block
/// structure along.
///
/// Every destination receives, next to its rows, the offsets of the
/// sub-blocks those rows came from. Sub-blocks that contribute no rows to a
/// destination are dropped from that destination's offsets, so per-part
/// offsets stay strictly increasing.
pub fn scatter_with_offsets(
    batch: &Batch,
    selector: &[usize],
    offsets: &ChunkOffsets,
    parts: usize,
) -> Result<Vec<(Batch, Vec<usize>)>> {
    let batches = batch.scatter(selector, parts)?;

    let mut part_offsets: Vec<Vec<usize>> = vec![Vec::new(); parts];
    let mut cumulative = vec![0usize; parts];
    for range in offsets.ranges() {
        let mut counts = vec![0usize; parts];
        for &part in &selector[range] {
            counts[part] += 1;
        }
        for (part, count) in counts.into_iter().enumerate() {
            if count > 0 {
                cumulative[part] += count;
                part_offsets[part].push(cumulative[part]);
            }
        }
    }

    Ok(batches.into_iter().zip(part_offsets).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Column, ColumnData, Error};

    #[test]
    fn test_validation() {
        ChunkOffsets::new(vec![2, 4, 6], 6).unwrap();
        ChunkOffsets::new(vec![], 0).unwrap();

        assert!(matches!(
            ChunkOffsets::new(vec![2, 2, 6], 6),
            Err(Error::OffsetsNotMonotonic)
        ));
        assert!(matches!(
            ChunkOffsets::new(vec![0, 2], 2),
            Err(Error::OffsetsNotMonotonic)
        ));
        assert!(matches!(
            ChunkOffsets::new(vec![2, 4], 6),
            Err(Error::OffsetsTailMismatch { .. })
        ));
    }

    #[test]
    fn test_ranges() {
        let offsets = ChunkOffsets::new(vec![2, 4, 6], 6).unwrap();
        let ranges: Vec<_> = offsets.ranges().collect();
        assert_eq!(ranges, vec![0..2, 2..4, 4..6]);
    }

    #[test]
    fn test_scatter_with_offsets() {
        let batch = Batch::new(vec![Column::new(
            "a",
            ColumnData::I64(vec![1, 2, 3, 4, 5, 6]),
        )])
        .unwrap();
        let offsets = ChunkOffsets::new(vec![2, 4, 6], 6).unwrap();

        // sub-block 0 goes entirely to part 0, sub-block 1 is split, and
        // sub-block 2 goes entirely to part 1
        let selector = [0, 0, 0, 1, 1, 1];
        let scattered = scatter_with_offsets(&batch, &selector, &offsets, 2).unwrap();

        let (ref batch0, ref offsets0) = scattered[0];
        assert_eq!(batch0.column("a").unwrap().data(), &ColumnData::I64(vec![1, 2, 3]));
        assert_eq!(offsets0, &vec![2, 3]);

        let (ref batch1, ref offsets1) = scattered[1];
        assert_eq!(batch1.column("a").unwrap().data(), &ColumnData::I64(vec![4, 5, 6]));
        assert_eq!(offsets1, &vec![1, 3]);
    }
}
