//! Database schema definitions.
//!
//! Plain DDL, applied once inside a single transaction when the database file
//! is created. All tables are STRICT; address lists and update lists are
//! stored as JSON text and guarded by json_valid checks.

pub const NETWORK_TABLE: &str = r#"
CREATE TABLE network (
    id        INTEGER PRIMARY KEY,
    addr      TEXT UNIQUE NOT NULL,
    desc      TEXT NOT NULL DEFAULT '',
    last_scan INTEGER NOT NULL DEFAULT 0
) STRICT;
"#;

pub const DEVICE_TABLE: &str = r#"
CREATE TABLE device (
    id        INTEGER PRIMARY KEY,
    net_id    INTEGER NOT NULL,
    name      TEXT UNIQUE NOT NULL,
    addr      TEXT NOT NULL DEFAULT '[]',
    os        TEXT NOT NULL DEFAULT '',
    bighead   INTEGER NOT NULL DEFAULT 1,
    last_seen INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (net_id) REFERENCES network (id)
        ON DELETE CASCADE
        ON UPDATE RESTRICT,
    CHECK (json_valid(addr))
) STRICT;

CREATE INDEX idx_device_bighead ON device (bighead <> 0);
CREATE INDEX idx_device_last_seen ON device (last_seen);
"#;

pub const UPTIME_TABLE: &str = r#"
CREATE TABLE uptime (
    id        INTEGER PRIMARY KEY,
    dev_id    INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    uptime    INTEGER NOT NULL DEFAULT 0,
    load1     REAL NOT NULL,
    load5     REAL NOT NULL,
    load15    REAL NOT NULL,
    FOREIGN KEY (dev_id) REFERENCES device (id)
        ON DELETE CASCADE
        ON UPDATE RESTRICT,
    CHECK (uptime >= 0),
    CHECK (load1 >= 0 AND load5 >= 0 AND load15 >= 0)
) STRICT;

CREATE INDEX idx_uptime_dev ON uptime (dev_id);
CREATE INDEX idx_uptime_stamp ON uptime (timestamp);
"#;

pub const UPDATES_TABLE: &str = r#"
CREATE TABLE updates (
    id        INTEGER PRIMARY KEY,
    dev_id    INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    updates   TEXT NOT NULL DEFAULT '[]',
    UNIQUE (dev_id, timestamp),
    FOREIGN KEY (dev_id) REFERENCES device (id)
        ON DELETE CASCADE
        ON UPDATE RESTRICT,
    CHECK (json_valid(updates))
) STRICT;

CREATE INDEX idx_updates_dev ON updates (dev_id);
"#;

pub const INFO_TABLE: &str = r#"
CREATE TABLE info (
    id        INTEGER PRIMARY KEY,
    dev_id    INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    info_type INTEGER NOT NULL,
    data      TEXT NOT NULL,
    UNIQUE (dev_id, info_type, timestamp),
    FOREIGN KEY (dev_id) REFERENCES device (id)
        ON DELETE CASCADE
        ON UPDATE RESTRICT,
    CHECK (json_valid(data))
) STRICT;

CREATE INDEX idx_info_dev ON info (dev_id, info_type);
"#;

// Every time-series insert bumps the owning device's last_seen. MAX keeps a
// late-arriving sample with an older timestamp from moving last_seen back.
pub const LAST_SEEN_TRIGGERS: &str = r#"
CREATE TRIGGER tr_uptime_last_seen
AFTER INSERT ON uptime
BEGIN
    UPDATE device
       SET last_seen = MAX(last_seen, NEW.timestamp)
     WHERE id = NEW.dev_id;
END;

CREATE TRIGGER tr_updates_last_seen
AFTER INSERT ON updates
BEGIN
    UPDATE device
       SET last_seen = MAX(last_seen, NEW.timestamp)
     WHERE id = NEW.dev_id;
END;

CREATE TRIGGER tr_info_last_seen
AFTER INSERT ON info
BEGIN
    UPDATE device
       SET last_seen = MAX(last_seen, NEW.timestamp)
     WHERE id = NEW.dev_id;
END;
"#;

/// All schema statements in creation order.
pub fn all_schemas() -> Vec<&'static str> {
    vec![
        NETWORK_TABLE,
        DEVICE_TABLE,
        UPTIME_TABLE,
        UPDATES_TABLE,
        INFO_TABLE,
        LAST_SEEN_TRIGGERS,
    ]
}
