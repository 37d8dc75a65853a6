//! A [`Column`] stores the rows for a given column name.

use serde::{Deserialize, Serialize};
use std::hash::Hasher;

/// The typed backing storage of a [`Column`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    /// 64-bit signed integers.
    I64(Vec<i64>),
    /// 64-bit unsigned integers.
    U64(Vec<u64>),
    /// 64-bit floats.
    F64(Vec<f64>),
    /// Booleans.
    Bool(Vec<bool>),
    /// UTF-8 strings.
    String(Vec<String>),
}

impl ColumnData {
    fn len(&self) -> usize {
        match self {
            Self::I64(v) => v.len(),
            Self::U64(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::String(v) => v.len(),
        }
    }
}

/// A named column with a validity mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    name: String,
    valid: Vec<bool>,
    data: ColumnData,
}

impl Column {
    /// Create a column where every row is valid.
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        let valid = vec![true; data.len()];
        Self {
            name: name.into(),
            valid,
            data,
        }
    }

    /// Create a column with an explicit validity mask.
    ///
    /// # Panics
    ///
    /// Panics if the mask length does not match the data length; batches are
    /// constructed programmatically and a mismatch is a caller bug.
    pub fn new_with_validity(name: impl Into<String>, data: ColumnData, valid: Vec<bool>) -> Self {
        assert_eq!(valid.len(), data.len(), "validity mask length mismatch");
        Self {
            name: name.into(),
            valid,
            data,
        }
    }

    /// The column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the column holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The typed row storage.
    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    /// Whether the given row is non-null.
    pub fn is_valid(&self, row: usize) -> bool {
        self.valid[row]
    }

    /// Feed the cell at `row` into `hasher` in a type- and null-stable way.
    pub(crate) fn hash_value<H: Hasher>(&self, row: usize, hasher: &mut H) {
        if !self.valid[row] {
            hasher.write_u8(0);
            return;
        }
        hasher.write_u8(1);
        match &self.data {
            ColumnData::I64(v) => hasher.write(&v[row].to_le_bytes()),
            ColumnData::U64(v) => hasher.write(&v[row].to_le_bytes()),
            ColumnData::F64(v) => hasher.write(&v[row].to_bits().to_le_bytes()),
            ColumnData::Bool(v) => hasher.write_u8(v[row] as u8),
            ColumnData::String(v) => {
                hasher.write_u64(v[row].len() as u64);
                hasher.write(v[row].as_bytes());
            }
        }
    }

    pub(crate) fn filter(&self, keep: &[bool]) -> Self {
        fn filtered<T: Clone>(values: &[T], keep: &[bool]) -> Vec<T> {
            values
                .iter()
                .zip(keep)
                .filter_map(|(v, keep)| keep.then(|| v.clone()))
                .collect()
        }

        let data = match &self.data {
            ColumnData::I64(v) => ColumnData::I64(filtered(v, keep)),
            ColumnData::U64(v) => ColumnData::U64(filtered(v, keep)),
            ColumnData::F64(v) => ColumnData::F64(filtered(v, keep)),
            ColumnData::Bool(v) => ColumnData::Bool(filtered(v, keep)),
            ColumnData::String(v) => ColumnData::String(filtered(v, keep)),
        };

        Self {
            name: self.name.clone(),
            valid: filtered(&self.valid, keep),
            data,
        }
    }

    pub(crate) fn scatter(&self, selector: &[usize], parts: usize) -> Vec<Self> {
        fn scattered<T: Clone>(values: &[T], selector: &[usize], parts: usize) -> Vec<Vec<T>> {
            let mut out = vec![Vec::new(); parts];
            for (v, &part) in values.iter().zip(selector) {
                out[part].push(v.clone());
            }
            out
        }

        let data: Vec<ColumnData> = match &self.data {
            ColumnData::I64(v) => scattered(v, selector, parts)
                .into_iter()
                .map(ColumnData::I64)
                .collect(),
            ColumnData::U64(v) => scattered(v, selector, parts)
                .into_iter()
                .map(ColumnData::U64)
                .collect(),
            ColumnData::F64(v) => scattered(v, selector, parts)
                .into_iter()
                .map(ColumnData::F64)
                .collect(),
            ColumnData::Bool(v) => scattered(v, selector, parts)
                .into_iter()
                .map(ColumnData::Bool)
                .collect(),
            ColumnData::String(v) => scattered(v, selector, parts)
                .into_iter()
                .map(ColumnData::String)
                .collect(),
        };

        data.into_iter()
            .zip(scattered(&self.valid, selector, parts))
            .map(|(data, valid)| Self {
                name: self.name.clone(),
                valid,
                data,
            })
            .collect()
    }
}
