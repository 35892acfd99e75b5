//! Replay table schema.

/// Tables of a replay file.
pub const SCHEMA_SQL: &str = r#"
-- Photoelectrons per event; each BLOB is a flat native-endian array of
-- pe_count elements (u32 for channel_id and flag, f32 otherwise)
CREATE TABLE IF NOT EXISTS pe_events (
    event_id INTEGER PRIMARY KEY,
    pe_count INTEGER NOT NULL,
    channel_id BLOB NOT NULL,
    time BLOB NOT NULL,
    wavelength BLOB NOT NULL,
    dx BLOB NOT NULL,
    dy BLOB NOT NULL,
    dz BLOB NOT NULL,
    polx BLOB NOT NULL,
    poly BLOB NOT NULL,
    polz BLOB NOT NULL,
    flag BLOB NOT NULL
);

-- Backend PMT geometry, pmt_id = backend channel id
CREATE TABLE IF NOT EXISTS pmt_positions (
    pmt_id INTEGER PRIMARY KEY,
    x REAL NOT NULL,
    y REAL NOT NULL,
    z REAL NOT NULL
);
"#;

/// Tables a replay file must contain.
pub const REQUIRED_TABLES: [&str; 2] = ["pe_events", "pmt_positions"];
