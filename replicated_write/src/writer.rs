//! The block preparer: split a batch by partition and write each partition
//! to a temporary on-disk part.

use crate::{
    parts::{PartStore, TempPart},
    BatchSnafu, PartCorruptSnafu, PartReadSnafu, PartWriteSnafu, PartitionColumnSnafu, Result,
    TooManyPartitionsSnafu,
};
use data_types::{PartFormat, PartInfo};
use mutable_batch::{scatter_with_offsets, Batch, ChunkOffsets, Column, ColumnData};
use observability_deps::tracing::trace;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::{collections::HashMap, fs, io::Write, path::Path};

/// Name of the single data file inside a part directory. The on-disk layout
/// inside the directory is private to this storage layer; the commit engine
/// only ever sees directory names.
pub(crate) const DATA_FILE_NAME: &str = "data.bin";

/// Name of the sidecar describing the part.
const META_FILE_NAME: &str = "meta.json";

const DATA_FILE_MAGIC: &[u8; 8] = b"RWPART01";

/// How rows map to partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partitioning {
    /// Unpartitioned: every row lands in partition `all`.
    Single,
    /// Partition by the rendered value of the named column.
    ByColumn(String),
}

/// The slice of table metadata the write path needs.
#[derive(Debug, Clone)]
pub struct MetadataSnapshot {
    /// Row-to-partition mapping.
    pub partitioning: Partitioning,
    /// Format recorded in log entries for this table's new parts.
    pub part_format: PartFormat,
}

impl MetadataSnapshot {
    /// Unpartitioned compact-part metadata.
    pub fn unpartitioned() -> Self {
        Self {
            partitioning: Partitioning::Single,
            part_format: PartFormat::Compact,
        }
    }

    /// Metadata partitioning by `column`.
    pub fn partitioned_by(column: impl Into<String>) -> Self {
        Self {
            partitioning: Partitioning::ByColumn(column.into()),
            part_format: PartFormat::Compact,
        }
    }
}

/// One partition's slice of an incoming batch.
#[derive(Debug, Clone)]
pub struct PartitionBlock {
    /// The partition every row of `batch` belongs to.
    pub partition_id: String,
    /// The rows.
    pub batch: Batch,
    /// Sub-block boundaries within `batch`; empty for synchronous inserts.
    pub offsets: Vec<usize>,
}

/// Render one row's partition identifier.
///
/// Identifiers must stay free of underscores so canonical part names remain
/// parseable.
fn partition_value(column: &Column, row: usize) -> Result<String> {
    let rendered = if !column.is_valid(row) {
        "NULL".to_owned()
    } else {
        match column.data() {
            ColumnData::I64(v) => {
                let v = v[row];
                if v < 0 {
                    format!("neg{}", v.unsigned_abs())
                } else {
                    v.to_string()
                }
            }
            ColumnData::U64(v) => v[row].to_string(),
            ColumnData::Bool(v) => if v[row] { "true" } else { "false" }.to_owned(),
            ColumnData::String(v) => {
                let value = &v[row];
                ensure!(
                    !value.is_empty() && !value.contains(['_', '/']),
                    PartitionColumnSnafu {
                        column: column.name(),
                        reason: format!("value {value:?} cannot form a partition id"),
                    }
                );
                value.clone()
            }
            ColumnData::F64(_) => {
                return PartitionColumnSnafu {
                    column: column.name(),
                    reason: "floating point partition keys are not supported",
                }
                .fail()
            }
        }
    };
    Ok(rendered)
}

/// Split `batch` into per-partition blocks.
///
/// At most `max_parts` distinct partitions may be touched by one batch. An
/// empty batch produces no blocks; partitions receiving no rows are not
/// produced either.
pub fn split_into_partition_blocks(
    batch: &Batch,
    offsets: Option<&ChunkOffsets>,
    metadata: &MetadataSnapshot,
    max_parts: usize,
) -> Result<Vec<PartitionBlock>> {
    if batch.rows() == 0 {
        return Ok(vec![]);
    }

    let column = match &metadata.partitioning {
        Partitioning::Single => {
            return Ok(vec![PartitionBlock {
                partition_id: "all".to_owned(),
                batch: batch.clone(),
                offsets: offsets.map(|o| o.as_slice().to_vec()).unwrap_or_default(),
            }]);
        }
        Partitioning::ByColumn(name) => {
            batch
                .column(name)
                .ok_or_else(|| crate::Error::PartitionColumn {
                    column: name.clone(),
                    reason: "column is missing from the batch".to_owned(),
                })?
        }
    };

    // assign partition indexes in order of first appearance
    let mut partition_ids = Vec::new();
    let mut index_of: HashMap<String, usize> = HashMap::new();
    let mut selector = Vec::with_capacity(batch.rows());
    for row in 0..batch.rows() {
        let value = partition_value(column, row)?;
        let next = partition_ids.len();
        let index = *index_of.entry(value.clone()).or_insert_with(|| {
            partition_ids.push(value);
            next
        });
        selector.push(index);
    }

    ensure!(
        max_parts == 0 || partition_ids.len() <= max_parts,
        TooManyPartitionsSnafu {
            partitions: partition_ids.len(),
            max: max_parts,
        }
    );

    let blocks = match offsets {
        Some(offsets) => scatter_with_offsets(batch, &selector, offsets, partition_ids.len())
            .context(BatchSnafu)?
            .into_iter()
            .zip(partition_ids)
            .map(|((batch, offsets), partition_id)| PartitionBlock {
                partition_id,
                batch,
                offsets,
            })
            .collect::<Vec<_>>(),
        None => batch
            .scatter(&selector, partition_ids.len())
            .context(BatchSnafu)?
            .into_iter()
            .zip(partition_ids)
            .map(|(batch, partition_id)| PartitionBlock {
                partition_id,
                batch,
                offsets: vec![],
            })
            .collect(),
    };

    Ok(blocks.into_iter().filter(|b| b.batch.rows() > 0).collect())
}

#[derive(Debug, Serialize, Deserialize)]
struct PartMeta {
    partition_id: String,
    rows: usize,
    format: PartFormat,
}

/// Write one partition block to a fresh temporary part directory.
///
/// The data file is a checksummed frame:
/// `magic (8) | crc32 (4, BE) | len (4, BE) | payload`.
pub fn write_temp_part(
    store: &PartStore,
    block: &PartitionBlock,
    metadata: &MetadataSnapshot,
) -> Result<TempPart> {
    let dir = store.temp_path();
    fs::create_dir_all(&dir).context(PartWriteSnafu { path: &dir })?;

    let payload = serde_json::to_vec(&block.batch).expect("batches are always serializable");
    let checksum = crc32fast::hash(&payload);

    let data_path = dir.join(DATA_FILE_NAME);
    let write = |path: &Path| -> std::io::Result<()> {
        let mut file = fs::File::create(path)?;
        file.write_all(DATA_FILE_MAGIC)?;
        file.write_all(&checksum.to_be_bytes())?;
        file.write_all(&(payload.len() as u32).to_be_bytes())?;
        file.write_all(&payload)?;
        file.flush()
    };
    write(&data_path).context(PartWriteSnafu { path: &data_path })?;

    let meta = PartMeta {
        partition_id: block.partition_id.clone(),
        rows: block.batch.rows(),
        format: metadata.part_format,
    };
    let meta_path = dir.join(META_FILE_NAME);
    fs::write(
        &meta_path,
        serde_json::to_vec(&meta).expect("part meta is always serializable"),
    )
    .context(PartWriteSnafu { path: &meta_path })?;

    trace!(
        partition_id = %block.partition_id,
        rows = block.batch.rows(),
        dir = %dir.display(),
        "wrote temp part"
    );

    Ok(TempPart::new(
        PartInfo::new_zero_level(block.partition_id.clone(), 0),
        format!("{checksum:08x}"),
        block.batch.columns().len().max(1),
        dir,
    ))
}

/// Read the rows back out of a part directory, verifying the checksum.
pub fn read_part(dir: &Path) -> Result<Batch> {
    let path = dir.join(DATA_FILE_NAME);
    let bytes = fs::read(&path).context(PartReadSnafu { path: &path })?;

    let corrupt = |reason: &str| {
        PartCorruptSnafu {
            path: &path,
            reason,
        }
        .build()
    };

    if bytes.len() < 16 || &bytes[0..8] != DATA_FILE_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let checksum = u32::from_be_bytes(bytes[8..12].try_into().expect("sliced four bytes"));
    let len = u32::from_be_bytes(bytes[12..16].try_into().expect("sliced four bytes")) as usize;
    let payload = &bytes[16..];
    if payload.len() != len {
        return Err(corrupt("length mismatch"));
    }
    if crc32fast::hash(payload) != checksum {
        return Err(corrupt("checksum mismatch"));
    }

    serde_json::from_slice(payload).map_err(|e| corrupt(&format!("undecodable payload: {e}")))
}
