use crate::frame::frame_errors::ParseError;
use crate::frame::revision;
use crate::frame::PacketReader;

/// Query progress. Each `Progress` packet carries increments; [`Progress::add`]
/// folds them into a running total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub rows: u64,
    pub bytes: u64,
    pub total_rows: u64,
    pub wrote_rows: u64,
    pub wrote_bytes: u64,
    pub elapsed_ns: u64,
}

impl Progress {
    pub async fn deserialize(r: &mut PacketReader, rev: u64) -> Result<Self, ParseError> {
        let mut progress = Progress {
            rows: r.read_uvarint().await?,
            bytes: r.read_uvarint().await?,
            total_rows: r.read_uvarint().await?,
            ..Default::default()
        };
        if rev >= revision::CLIENT_WRITE_INFO {
            progress.wrote_rows = r.read_uvarint().await?;
            progress.wrote_bytes = r.read_uvarint().await?;
        }
        if rev >= revision::SERVER_QUERY_TIME_IN_PROGRESS {
            progress.elapsed_ns = r.read_uvarint().await?;
        }
        Ok(progress)
    }

    /// Accumulates an increment. Counters add up; the total row estimate and the
    /// elapsed time are replaced when the increment carries them.
    pub fn add(&mut self, delta: &Progress) {
        self.rows = self.rows.saturating_add(delta.rows);
        self.bytes = self.bytes.saturating_add(delta.bytes);
        self.wrote_rows = self.wrote_rows.saturating_add(delta.wrote_rows);
        self.wrote_bytes = self.wrote_bytes.saturating_add(delta.wrote_bytes);
        if delta.total_rows != 0 {
            self.total_rows = delta.total_rows;
        }
        if delta.elapsed_ns != 0 {
            self.elapsed_ns = delta.elapsed_ns;
        }
    }
}
