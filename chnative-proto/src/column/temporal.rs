//! Date and time columns.
//!
//! `Date` is a UInt16 day count since the epoch, `DateTime` a UInt32 second count
//! and `DateTime64(p)` an Int64 count of `10^-p` second ticks. Timezones are kept
//! on the column for display only; values are exposed in UTC.

use chrono::{DateTime, Days, NaiveDate, Utc};

use super::primitive::NumericColumn;
use super::value::Value;
use super::ColumnError;
use crate::frame::{PacketReader, PacketWriter};

const NANOS_PER_SEC: i64 = 1_000_000_000;

fn epoch() -> NaiveDate {
    NaiveDate::default()
}

fn date_from_days(days: u16) -> NaiveDate {
    epoch()
        .checked_add_days(Days::new(days as u64))
        .unwrap_or(NaiveDate::MAX)
}

fn mismatch(column_type: &str, value: &Value) -> ColumnError {
    ColumnError::TypeMismatch {
        column_type: column_type.to_owned(),
        value: value.kind_name().to_owned(),
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DateColumn {
    days: NumericColumn<u16>,
}

impl DateColumn {
    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn clear(&mut self) {
        self.days.clear()
    }

    pub fn value(&self, row: usize) -> Value {
        Value::Date(date_from_days(self.days.get(row)))
    }

    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        let days = match &value {
            Value::Date(d) => d.signed_duration_since(epoch()).num_days(),
            Value::DateTime(t) => t.date_naive().signed_duration_since(epoch()).num_days(),
            Value::UInt16(d) => *d as i64,
            _ => return Err(mismatch("Date", &value)),
        };
        let days = u16::try_from(days).map_err(|_| mismatch("Date", &value))?;
        self.days.push_raw(days);
        Ok(())
    }

    pub fn push_default(&mut self) {
        self.days.push_default()
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        DateColumn {
            days: self.days.slice(lo, hi),
        }
    }

    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        self.days.read_data(r, rows).await
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        self.days.write_data(w)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DateTimeColumn {
    timezone: Option<String>,
    seconds: NumericColumn<u32>,
}

impl DateTimeColumn {
    pub fn new(timezone: Option<String>) -> Self {
        DateTimeColumn {
            timezone,
            seconds: NumericColumn::default(),
        }
    }

    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn len(&self) -> usize {
        self.seconds.len()
    }

    pub fn clear(&mut self) {
        self.seconds.clear()
    }

    pub fn value(&self, row: usize) -> Value {
        let secs = self.seconds.get(row) as i64;
        DateTime::from_timestamp(secs, 0).map_or(Value::Null, Value::DateTime)
    }

    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        let secs = match &value {
            Value::DateTime(t) => t.timestamp(),
            Value::UInt32(s) => *s as i64,
            Value::Int64(s) => *s,
            _ => return Err(mismatch("DateTime", &value)),
        };
        let secs = u32::try_from(secs).map_err(|_| mismatch("DateTime", &value))?;
        self.seconds.push_raw(secs);
        Ok(())
    }

    pub fn push_default(&mut self) {
        self.seconds.push_default()
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        DateTimeColumn {
            timezone: self.timezone.clone(),
            seconds: self.seconds.slice(lo, hi),
        }
    }

    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        self.seconds.read_data(r, rows).await
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        self.seconds.write_data(w)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DateTime64Column {
    precision: u8,
    timezone: Option<String>,
    ticks: NumericColumn<i64>,
}

impl DateTime64Column {
    pub fn new(precision: u8, timezone: Option<String>) -> Self {
        DateTime64Column {
            precision: precision.min(9),
            timezone,
            ticks: NumericColumn::default(),
        }
    }

    /// Nanoseconds per tick.
    fn multiplier(&self) -> i64 {
        10i64.pow(9 - self.precision as u32)
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn ticks(&self) -> &[i64] {
        self.ticks.as_slice()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn clear(&mut self) {
        self.ticks.clear()
    }

    pub fn value(&self, row: usize) -> Value {
        let nanos = self.ticks.get(row) as i128 * self.multiplier() as i128;
        let secs = nanos.div_euclid(NANOS_PER_SEC as i128);
        let sub = nanos.rem_euclid(NANOS_PER_SEC as i128) as u32;
        i64::try_from(secs)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, sub))
            .map_or(Value::Null, Value::DateTime)
    }

    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        let ticks = match &value {
            Value::DateTime(t) => {
                let nanos = t.timestamp() as i128 * NANOS_PER_SEC as i128
                    + t.timestamp_subsec_nanos() as i128;
                i64::try_from(nanos.div_euclid(self.multiplier() as i128))
                    .map_err(|_| mismatch("DateTime64", &value))?
            }
            Value::Int64(ticks) => *ticks,
            _ => return Err(mismatch("DateTime64", &value)),
        };
        self.ticks.push_raw(ticks);
        Ok(())
    }

    pub fn push_default(&mut self) {
        self.ticks.push_default()
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        DateTime64Column {
            precision: self.precision,
            timezone: self.timezone.clone(),
            ticks: self.ticks.slice(lo, hi),
        }
    }

    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        self.ticks.read_data(r, rows).await
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        self.ticks.write_data(w)
    }
}
