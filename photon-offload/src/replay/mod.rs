//! Replay of previously recorded photoelectrons.
//!
//! A replay file is a SQLite database holding one row of photoelectron
//! columns per event and the backend PMT geometry. Column BLOBs use the same
//! flat native-endian layout as the wire frames.

mod reader;
mod schema;

pub use reader::ReplayReader;

use std::path::Path;

use log::{debug, info};
use rusqlite::{params, Connection, OpenFlags};
use thiserror::Error;

use photon_protocol::{f32_frame, read_f32_frame, read_u32_frame, u32_frame, PEBatch, Vec3};

/// Replay error types. All of them end the run.
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Replay file has no '{0}' table")]
    MissingTable(&'static str),

    #[error("Event {0} not found in replay file")]
    MissingEvent(u32),

    #[error("Event {requested} requested out of order, next recorded event is {next}")]
    OutOfOrder { requested: u32, next: u32 },

    #[error("Event {event}: column '{column}' is malformed: {reason}")]
    MalformedEvent {
        event: u32,
        column: &'static str,
        reason: String,
    },

    #[error("PMT position table is malformed: {0}")]
    MalformedPositions(String),
}

pub type Result<T> = std::result::Result<T, ReplayError>;

/// BLOB columns of `pe_events`, in select order.
const PE_COLUMNS: [&str; 10] = [
    "channel_id",
    "time",
    "wavelength",
    "dx",
    "dy",
    "dz",
    "polx",
    "poly",
    "polz",
    "flag",
];

/// Replay database connection wrapper.
pub struct ReplayTable {
    conn: Connection,
}

impl ReplayTable {
    /// Open an existing replay file read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let table = Self { conn };
        table.verify_schema()?;
        debug!("Opened replay file {}", path.display());
        Ok(table)
    }

    /// Open or create a replay file for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Open an in-memory replay table (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    fn verify_schema(&self) -> Result<()> {
        for name in schema::REQUIRED_TABLES {
            let count: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )?;
            if count == 0 {
                return Err(ReplayError::MissingTable(name));
            }
        }
        Ok(())
    }

    /// Store one event, replacing any previous row with the same id.
    pub fn insert_event(&self, batch: &PEBatch) -> Result<()> {
        let [dx, dy, dz] = batch.directions();
        let [polx, poly, polz] = batch.polarizations();
        let blobs = [
            u32_frame(batch.channels()),
            f32_frame(batch.times()),
            f32_frame(batch.wavelengths()),
            f32_frame(dx),
            f32_frame(dy),
            f32_frame(dz),
            f32_frame(polx),
            f32_frame(poly),
            f32_frame(polz),
            u32_frame(batch.flag_bits()),
        ];

        self.conn.execute(
            "INSERT OR REPLACE INTO pe_events
                (event_id, pe_count, channel_id, time, wavelength, dx, dy, dz, polx, poly, polz, flag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                batch.event(),
                batch.len() as i64,
                &blobs[0][..],
                &blobs[1][..],
                &blobs[2][..],
                &blobs[3][..],
                &blobs[4][..],
                &blobs[5][..],
                &blobs[6][..],
                &blobs[7][..],
                &blobs[8][..],
                &blobs[9][..],
            ],
        )?;
        Ok(())
    }

    /// Replace the backend PMT geometry; index in `positions` is the PMT id.
    pub fn insert_pmt_positions(&self, positions: &[Vec3]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM pmt_positions", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO pmt_positions (pmt_id, x, y, z) VALUES (?1, ?2, ?3, ?4)")?;
            for (id, p) in positions.iter().enumerate() {
                stmt.execute(params![id as i64, p.x, p.y, p.z])?;
            }
        }
        tx.commit()?;
        info!("Stored {} PMT positions", positions.len());
        Ok(())
    }

    pub fn event_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pe_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn pmt_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pmt_positions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Load event `event_id` into `out`. A missing row is an error.
    pub fn load_event(&self, event_id: u32, out: &mut PEBatch) -> Result<()> {
        let row = self.conn.query_row(
            "SELECT pe_count, channel_id, time, wavelength, dx, dy, dz, polx, poly, polz, flag
             FROM pe_events WHERE event_id = ?1",
            params![event_id],
            |row| {
                let count: i64 = row.get(0)?;
                let mut blobs: Vec<Vec<u8>> = Vec::with_capacity(PE_COLUMNS.len());
                for i in 0..PE_COLUMNS.len() {
                    blobs.push(row.get(i + 1)?);
                }
                Ok((count, blobs))
            },
        );
        let (count, blobs) = match row {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(ReplayError::MissingEvent(event_id))
            }
            Err(e) => return Err(e.into()),
        };

        let n = usize::try_from(count).map_err(|_| ReplayError::MalformedEvent {
            event: event_id,
            column: "pe_count",
            reason: format!("negative count {}", count),
        })?;
        let malformed = |column: usize, e: photon_protocol::ProtocolError| ReplayError::MalformedEvent {
            event: event_id,
            column: PE_COLUMNS[column],
            reason: e.to_string(),
        };
        let floats = |column: usize| read_f32_frame(&blobs[column], column, n).map_err(|e| malformed(column, e));
        let ints = |column: usize| read_u32_frame(&blobs[column], column, n).map_err(|e| malformed(column, e));

        let channel = ints(0)?;
        let time = floats(1)?;
        let wavelength = floats(2)?;
        let dx = floats(3)?;
        let dy = floats(4)?;
        let dz = floats(5)?;
        let polx = floats(6)?;
        let poly = floats(7)?;
        let polz = floats(8)?;
        let flags = ints(9)?;

        out.fill_from_columns(
            event_id,
            &channel,
            [&dx, &dy, &dz],
            [&polx, &poly, &polz],
            &wavelength,
            &time,
            &flags,
        );
        Ok(())
    }

    /// Backend PMT positions ordered by id. Ids must run from 0 without gaps.
    pub fn load_pmt_positions(&self) -> Result<Vec<Vec3>> {
        let mut stmt = self
            .conn
            .prepare("SELECT pmt_id, x, y, z FROM pmt_positions ORDER BY pmt_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    Vec3::new(row.get(1)?, row.get(2)?, row.get(3)?),
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if rows.is_empty() {
            return Err(ReplayError::MalformedPositions("no PMT positions".to_string()));
        }
        rows.into_iter()
            .enumerate()
            .map(|(index, (id, position))| {
                if id != index as i64 {
                    return Err(ReplayError::MalformedPositions(format!(
                        "expected pmt_id {}, found {}",
                        index, id
                    )));
                }
                Ok(position)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_protocol::PESample;

    fn sample(channel: u32) -> PESample {
        PESample {
            channel,
            time: 5.0 + channel as f32,
            wavelength: 410.0,
            direction: [0.0, 0.6, 0.8],
            polarization: [1.0, 0.0, 0.0],
            flags: photon_protocol::flags::CHERENKOV,
        }
    }

    #[test]
    fn test_event_storage() {
        let table = ReplayTable::open_in_memory().unwrap();
        let mut batch = PEBatch::new();
        batch.set_event(0);
        for ch in [2, 0, 1] {
            batch.push(sample(ch));
        }
        table.insert_event(&batch).unwrap();
        assert_eq!(table.event_count().unwrap(), 1);

        let mut out = PEBatch::new();
        table.load_event(0, &mut out).unwrap();
        assert_eq!(out, batch);
    }

    #[test]
    fn test_empty_event() {
        let table = ReplayTable::open_in_memory().unwrap();
        let mut batch = PEBatch::new();
        batch.set_event(3);
        table.insert_event(&batch).unwrap();

        let mut out = PEBatch::new();
        out.push(sample(1));
        table.load_event(3, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(out.event(), 3);
    }

    #[test]
    fn test_missing_event() {
        let table = ReplayTable::open_in_memory().unwrap();
        let mut out = PEBatch::new();
        assert!(matches!(
            table.load_event(7, &mut out),
            Err(ReplayError::MissingEvent(7))
        ));
    }

    #[test]
    fn test_truncated_blob() {
        let table = ReplayTable::open_in_memory().unwrap();
        table
            .conn
            .execute(
                "INSERT INTO pe_events VALUES (0, 2, ?1, ?2, ?2, ?2, ?2, ?2, ?2, ?2, ?2, ?1)",
                params![&[0u8; 8][..], &[0u8; 6][..]],
            )
            .unwrap();
        let mut out = PEBatch::new();
        match table.load_event(0, &mut out) {
            Err(ReplayError::MalformedEvent { column, .. }) => assert_eq!(column, "time"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_huge_pe_count_is_malformed() {
        let table = ReplayTable::open_in_memory().unwrap();
        table
            .conn
            .execute(
                "INSERT INTO pe_events VALUES (0, ?1, ?2, ?2, ?2, ?2, ?2, ?2, ?2, ?2, ?2, ?2)",
                params![i64::MAX, &[0u8; 8][..]],
            )
            .unwrap();
        let mut out = PEBatch::new();
        match table.load_event(0, &mut out) {
            Err(ReplayError::MalformedEvent { event, column, .. }) => {
                assert_eq!(event, 0);
                assert_eq!(column, "channel_id");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_pmt_positions() {
        let table = ReplayTable::open_in_memory().unwrap();
        let positions = vec![Vec3::new(1.0, 2.0, 3.0), Vec3::new(-1.0, 0.5, 0.0)];
        table.insert_pmt_positions(&positions).unwrap();
        assert_eq!(table.pmt_count().unwrap(), 2);
        assert_eq!(table.load_pmt_positions().unwrap(), positions);
    }

    #[test]
    fn test_pmt_positions_with_gap() {
        let table = ReplayTable::open_in_memory().unwrap();
        table
            .conn
            .execute_batch(
                "INSERT INTO pmt_positions VALUES (0, 0, 0, 0);
                 INSERT INTO pmt_positions VALUES (2, 1, 0, 0);",
            )
            .unwrap();
        assert!(matches!(
            table.load_pmt_positions(),
            Err(ReplayError::MalformedPositions(_))
        ));
    }
}
