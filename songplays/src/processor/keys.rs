use arrow::array::Int64Array;
use common::{Error, Result};

/// Assigns surrogate keys to the rows of one output partition.
///
/// Keys must be unique across all partitions of a run and increase with
/// `offset` inside a partition. They need not be contiguous.
pub trait KeyGenerator: Send + Sync {
    fn generate(&self, partition: usize, offset: u64, len: usize) -> Result<Int64Array>;
}

const ROW_BITS: u32 = 33;
const MAX_PARTITIONS: u64 = 1 << 30;
const MAX_ROWS_PER_PARTITION: u64 = 1 << ROW_BITS;

/// Packs the partition index into the upper 30 bits and the row position
/// within the partition into the lower 33 bits.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicIdGenerator;

impl KeyGenerator for MonotonicIdGenerator {
    fn generate(&self, partition: usize, offset: u64, len: usize) -> Result<Int64Array> {
        let partition = partition as u64;
        if partition >= MAX_PARTITIONS {
            return Err(Error::InvalidInput(format!(
                "partition index {} exceeds the key space",
                partition
            )));
        }
        let end = offset + len as u64;
        if end > MAX_ROWS_PER_PARTITION {
            return Err(Error::InvalidInput(format!(
                "partition {} has more than {} rows",
                partition, MAX_ROWS_PER_PARTITION
            )));
        }

        let base = partition << ROW_BITS;
        Ok((offset..end).map(|row| (base + row) as i64).collect())
    }
}
