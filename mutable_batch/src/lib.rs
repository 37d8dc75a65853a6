//! A mutable columnar row batch.
//!
//! [`Batch`] is the unit handed to the write path: a set of equally sized
//! named columns. The operations here are exactly the row-level primitives
//! the replicated insert sink needs: stable per-row hashing (block ids), row
//! filtering (duplicate removal) and scattering rows across partitions.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};
use std::{hash::Hasher, ops::Range};

pub mod column;
mod offsets;

pub use column::{Column, ColumnData};
pub use offsets::{scatter_with_offsets, ChunkOffsets};

/// Errors for batch construction and row operations.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("column {column} has {actual} rows, expected {expected}"))]
    ColumnLengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[snafu(display("duplicate column name {column}"))]
    DuplicateColumn { column: String },

    #[snafu(display("filter mask has {actual} entries, batch has {expected} rows"))]
    FilterLengthMismatch { expected: usize, actual: usize },

    #[snafu(display("selector has {actual} entries, batch has {expected} rows"))]
    SelectorLengthMismatch { expected: usize, actual: usize },

    #[snafu(display("selector value {value} out of range for {parts} parts"))]
    SelectorOutOfRange { value: usize, parts: usize },

    #[snafu(display("chunk offsets must be strictly increasing"))]
    OffsetsNotMonotonic,

    #[snafu(display("last chunk offset is {last} but the batch has {rows} rows"))]
    OffsetsTailMismatch { last: usize, rows: usize },
}

/// A specialized `Result` for batch errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An immutable-once-built set of equally sized named columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    columns: Vec<Column>,
}

impl Batch {
    /// Assemble a batch, validating that all columns have the same row count
    /// and unique names.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if let Some(first) = columns.first() {
            let expected = first.len();
            for column in &columns {
                ensure!(
                    column.len() == expected,
                    ColumnLengthMismatchSnafu {
                        column: column.name(),
                        expected,
                        actual: column.len(),
                    }
                );
            }
            for (i, column) in columns.iter().enumerate() {
                ensure!(
                    columns[..i].iter().all(|c| c.name() != column.name()),
                    DuplicateColumnSnafu {
                        column: column.name(),
                    }
                );
            }
        }
        Ok(Self { columns })
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or_default()
    }

    /// All columns, in insertion order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    /// Feed the cells of the given row range into `hasher`, column by column
    /// within each row.
    ///
    /// The byte stream is stable across replicas, which is what makes
    /// content-addressed block ids line up for identical data.
    pub fn hash_rows<H: Hasher>(&self, rows: Range<usize>, hasher: &mut H) {
        for row in rows {
            for column in &self.columns {
                column.hash_value(row, hasher);
            }
        }
    }

    /// A new batch holding only the rows where `keep` is true.
    pub fn filter(&self, keep: &[bool]) -> Result<Self> {
        ensure!(
            keep.len() == self.rows(),
            FilterLengthMismatchSnafu {
                expected: self.rows(),
                actual: keep.len(),
            }
        );

        Ok(Self {
            columns: self.columns.iter().map(|c| c.filter(keep)).collect(),
        })
    }

    /// Split rows into `parts` batches according to `selector`, which maps
    /// every row to its destination batch. Destinations receiving no rows
    /// yield empty batches.
    pub fn scatter(&self, selector: &[usize], parts: usize) -> Result<Vec<Self>> {
        ensure!(
            selector.len() == self.rows(),
            SelectorLengthMismatchSnafu {
                expected: self.rows(),
                actual: selector.len(),
            }
        );
        if let Some(&value) = selector.iter().find(|&&s| s >= parts) {
            return SelectorOutOfRangeSnafu { value, parts }.fail();
        }

        let mut scattered: Vec<Vec<Column>> = (0..parts).map(|_| Vec::new()).collect();
        for column in &self.columns {
            for (part, piece) in column.scatter(selector, parts).into_iter().enumerate() {
                scattered[part].push(piece);
            }
        }

        Ok(scattered
            .into_iter()
            .map(|columns| Self { columns })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siphasher::sip128::{Hasher128, SipHasher24};

    fn two_column_batch() -> Batch {
        Batch::new(vec![
            Column::new("a", ColumnData::I64(vec![1, 2, 3, 4])),
            Column::new("s", ColumnData::String(vec!["w".into(), "x".into(), "y".into(), "z".into()])),
        ])
        .unwrap()
    }

    #[test]
    fn test_new_validates_shape() {
        let err = Batch::new(vec![
            Column::new("a", ColumnData::I64(vec![1])),
            Column::new("b", ColumnData::I64(vec![1, 2])),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::ColumnLengthMismatch { .. }));

        let err = Batch::new(vec![
            Column::new("a", ColumnData::I64(vec![1])),
            Column::new("a", ColumnData::I64(vec![2])),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateColumn { .. }));
    }

    #[test]
    fn test_hash_rows_is_content_addressed() {
        let batch = two_column_batch();
        let same = two_column_batch();
        let different = Batch::new(vec![
            Column::new("a", ColumnData::I64(vec![1, 2, 3, 5])),
            Column::new("s", ColumnData::String(vec!["w".into(), "x".into(), "y".into(), "z".into()])),
        ])
        .unwrap();

        let digest = |b: &Batch, range: Range<usize>| {
            let mut hasher = SipHasher24::new();
            b.hash_rows(range, &mut hasher);
            hasher.finish128().as_u128()
        };

        assert_eq!(digest(&batch, 0..4), digest(&same, 0..4));
        assert_eq!(digest(&batch, 0..2), digest(&different, 0..2));
        assert_ne!(digest(&batch, 0..4), digest(&different, 0..4));
    }

    #[test]
    fn test_hash_distinguishes_null_from_default() {
        let with_null = Batch::new(vec![Column::new_with_validity(
            "a",
            ColumnData::I64(vec![0]),
            vec![false],
        )])
        .unwrap();
        let with_zero =
            Batch::new(vec![Column::new("a", ColumnData::I64(vec![0]))]).unwrap();

        let digest = |b: &Batch| {
            let mut hasher = SipHasher24::new();
            b.hash_rows(0..1, &mut hasher);
            hasher.finish128().as_u128()
        };

        assert_ne!(digest(&with_null), digest(&with_zero));
    }

    #[test]
    fn test_filter() {
        let batch = two_column_batch();
        let filtered = batch.filter(&[true, false, false, true]).unwrap();

        assert_eq!(filtered.rows(), 2);
        assert_eq!(
            filtered.column("a").unwrap().data(),
            &ColumnData::I64(vec![1, 4])
        );
        assert_eq!(
            filtered.column("s").unwrap().data(),
            &ColumnData::String(vec!["w".into(), "z".into()])
        );

        assert!(matches!(
            batch.filter(&[true]),
            Err(Error::FilterLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_filter_fuzz() {
        use rand::prelude::*;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let values: Vec<i64> = std::iter::repeat_with(|| rng.gen_range(0..100))
            .take(1000)
            .collect();
        let keep: Vec<bool> = std::iter::repeat_with(|| rng.gen_bool(0.5))
            .take(1000)
            .collect();

        let batch = Batch::new(vec![Column::new("a", ColumnData::I64(values.clone()))]).unwrap();
        let filtered = batch.filter(&keep).unwrap();

        let expected: Vec<i64> = values
            .iter()
            .zip(&keep)
            .filter_map(|(v, keep)| keep.then_some(*v))
            .collect();
        assert_eq!(
            filtered.column("a").unwrap().data(),
            &ColumnData::I64(expected)
        );
    }

    #[test]
    fn test_scatter() {
        let batch = two_column_batch();
        let parts = batch.scatter(&[1, 0, 1, 1], 3).unwrap();

        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts[0].column("a").unwrap().data(),
            &ColumnData::I64(vec![2])
        );
        assert_eq!(
            parts[1].column("a").unwrap().data(),
            &ColumnData::I64(vec![1, 3, 4])
        );
        assert_eq!(parts[2].rows(), 0);

        assert!(matches!(
            batch.scatter(&[0, 0, 0, 9], 3),
            Err(Error::SelectorOutOfRange { .. })
        ));
    }
}
