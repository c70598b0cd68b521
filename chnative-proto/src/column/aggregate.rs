//! Serialized states of the quantile aggregate functions.
//!
//! Only the quantile families are decoded: `quantileTDigest`, `quantileBFloat16`
//! and `quantileTiming`, each with their `quantiles*` and `*Weighted` variants,
//! which share a state layout.

use super::value::Value;
use super::ColumnError;
use crate::frame::{PacketReader, PacketWriter};

const TIMING_TINY: u8 = 1;
const TIMING_MEDIUM: u8 = 2;
const TIMING_LARGE: u8 = 3;

/// Values below this are counted exactly.
const TIMING_SMALL_THRESHOLD: u64 = 1024;
/// Values at or above this all land in the last bucket.
const TIMING_BIG_THRESHOLD: u64 = 30_000;
const TIMING_BIG_PRECISION: u64 = 16;
const TIMING_BIG_SIZE: usize =
    ((TIMING_BIG_THRESHOLD - TIMING_SMALL_THRESHOLD) / TIMING_BIG_PRECISION) as usize;

/// Upper bound on entries in one state, to reject garbage lengths early.
const MAX_STATE_ENTRIES: u64 = 1 << 24;

fn checked_len(n: u64) -> Result<usize, ColumnError> {
    if n > MAX_STATE_ENTRIES {
        return Err(ColumnError::BadAggregateState("too many entries"));
    }
    Ok(n as usize)
}

macro_rules! state_column {
    ($name:ident, $entry:ty, $variant:ident, $type_name:literal) => {
        #[derive(Debug, Clone, PartialEq, Default)]
        pub struct $name {
            rows: Vec<Vec<$entry>>,
        }

        impl $name {
            pub fn states(&self) -> &[Vec<$entry>] {
                &self.rows
            }

            pub fn len(&self) -> usize {
                self.rows.len()
            }

            pub fn clear(&mut self) {
                self.rows.clear()
            }

            pub fn value(&self, row: usize) -> Value {
                Value::$variant(self.rows[row].clone())
            }

            pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
                match value {
                    Value::$variant(state) => {
                        self.rows.push(state);
                        Ok(())
                    }
                    other => Err(ColumnError::TypeMismatch {
                        column_type: $type_name.to_owned(),
                        value: other.kind_name().to_owned(),
                    }),
                }
            }

            /// Appends an empty state.
            pub fn push_default(&mut self) {
                self.rows.push(Vec::new())
            }

            pub fn slice(&self, lo: usize, hi: usize) -> Self {
                $name {
                    rows: self.rows[lo..hi].to_vec(),
                }
            }
        }
    };
}

state_column!(TDigestColumn, (f32, f32), TDigest, "AggregateFunction(quantileTDigest)");
state_column!(
    BFloat16HistogramColumn,
    (u16, u64),
    BFloat16Histogram,
    "AggregateFunction(quantileBFloat16)"
);
state_column!(
    QuantileTimingColumn,
    (u64, u64),
    QuantileTiming,
    "AggregateFunction(quantileTiming)"
);

impl TDigestColumn {
    /// Each state is a list of centroids: (mean, weight).
    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        for _ in 0..rows {
            let n = checked_len(r.read_uvarint().await?)?;
            let mut centroids = Vec::with_capacity(n);
            for _ in 0..n {
                let mean = r.read_f32().await?;
                let weight = r.read_f32().await?;
                centroids.push((mean, weight));
            }
            self.rows.push(centroids);
        }
        Ok(())
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        for centroids in &self.rows {
            w.write_uvarint(centroids.len() as u64)?;
            for &(mean, weight) in centroids {
                w.write_f32(mean)?;
                w.write_f32(weight)?;
            }
        }
        Ok(())
    }
}

impl BFloat16HistogramColumn {
    /// Each state maps the upper 16 bits of a Float32 to its count.
    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        for _ in 0..rows {
            let n = checked_len(r.read_uvarint().await?)?;
            let mut buckets = Vec::with_capacity(n);
            for _ in 0..n {
                let value = r.read_u16().await?;
                let count = r.read_u64().await?;
                buckets.push((value, count));
            }
            self.rows.push(buckets);
        }
        Ok(())
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        for buckets in &self.rows {
            w.write_uvarint(buckets.len() as u64)?;
            for &(value, count) in buckets {
                w.write_u16(value)?;
                w.write_u64(count)?;
            }
        }
        Ok(())
    }
}

fn timing_big_value(bucket: usize) -> u64 {
    bucket as u64 * TIMING_BIG_PRECISION + TIMING_SMALL_THRESHOLD
}

fn timing_is_dense(count: u64) -> bool {
    count.saturating_mul(2) > TIMING_SMALL_THRESHOLD + TIMING_BIG_SIZE as u64
}

impl QuantileTimingColumn {
    async fn read_state(r: &mut PacketReader) -> Result<Vec<(u64, u64)>, ColumnError> {
        let mut pairs = Vec::new();
        match r.read_u8().await? {
            TIMING_TINY => {
                let n = r.read_u16().await?;
                for _ in 0..n {
                    pairs.push((r.read_u16().await? as u64, 1));
                }
            }
            TIMING_MEDIUM => {
                let n = checked_len(r.read_u64().await?)?;
                for _ in 0..n {
                    pairs.push((r.read_u16().await? as u64, 1));
                }
            }
            TIMING_LARGE => {
                let count = r.read_u64().await?;
                if timing_is_dense(count) {
                    for value in 0..TIMING_SMALL_THRESHOLD {
                        let c = r.read_u64().await?;
                        if c > 0 {
                            pairs.push((value, c));
                        }
                    }
                    for bucket in 0..TIMING_BIG_SIZE {
                        let c = r.read_u64().await?;
                        if c > 0 {
                            pairs.push((timing_big_value(bucket), c));
                        }
                    }
                } else {
                    loop {
                        let index = r.read_u16().await? as u64;
                        if index == TIMING_BIG_THRESHOLD {
                            break;
                        }
                        let c = r.read_u64().await?;
                        let value = if index < TIMING_SMALL_THRESHOLD {
                            index
                        } else {
                            let bucket = (index - TIMING_SMALL_THRESHOLD) as usize;
                            if bucket >= TIMING_BIG_SIZE {
                                return Err(ColumnError::BadAggregateState(
                                    "quantileTiming bucket out of range",
                                ));
                            }
                            timing_big_value(bucket)
                        };
                        pairs.push((value, c));
                    }
                }
            }
            _ => return Err(ColumnError::BadAggregateState("unknown quantileTiming kind")),
        }
        Ok(pairs)
    }

    /// Each state is a list of (value, count) pairs. Large states report bucket
    /// lower bounds for values past the exact range.
    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        for _ in 0..rows {
            let state = Self::read_state(r).await?;
            self.rows.push(state);
        }
        Ok(())
    }

    /// States are always written in the large form.
    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        for pairs in &self.rows {
            let mut small = vec![0u64; TIMING_SMALL_THRESHOLD as usize];
            let mut big = vec![0u64; TIMING_BIG_SIZE];
            let mut count = 0u64;
            for &(value, c) in pairs {
                count = count.saturating_add(c);
                if value < TIMING_SMALL_THRESHOLD {
                    small[value as usize] += c;
                } else {
                    let bucket = ((value.min(TIMING_BIG_THRESHOLD - 1) - TIMING_SMALL_THRESHOLD)
                        / TIMING_BIG_PRECISION) as usize;
                    big[bucket.min(TIMING_BIG_SIZE - 1)] += c;
                }
            }

            w.write_u8(TIMING_LARGE)?;
            w.write_u64(count)?;
            if timing_is_dense(count) {
                for c in small.iter().chain(big.iter()) {
                    w.write_u64(*c)?;
                }
            } else {
                let buckets = small.iter().chain(big.iter()).enumerate();
                for (index, &c) in buckets.filter(|(_, c)| **c > 0) {
                    w.write_u16(index as u16)?;
                    w.write_u64(c)?;
                }
                w.write_u16(TIMING_BIG_THRESHOLD as u16)?;
            }
        }
        Ok(())
    }
}
