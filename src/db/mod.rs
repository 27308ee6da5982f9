//! SQLite persistence layer.
//!
//! A [`Store`] owns one connection to the database file. Sharing a single
//! handle between tasks is not supported; open several handles (or use the
//! [`pool`]) instead. The schema is created on first open, statements are
//! prepared through the connection's statement cache and addressed by
//! [`Query`] ids, and transient busy/locked errors are retried with a short
//! delay.

mod query;
mod schema;
pub mod pool;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::metrics::Metrics;
use crate::model::{Cidr, Device, InfoKind, InfoRecord, ModelError, Network, Updates, Uptime};

pub use pool::{Pool, PoolError, PoolHandle};
pub use query::Query;

// First-open checks are serialised so that two concurrent opens of the same
// path cannot race schema creation.
static OPEN_LOCK: Mutex<()> = Mutex::new(());
static ID_COUNTER: AtomicI64 = AtomicI64::new(0);

const RETRY_DELAY: Duration = Duration::from_millis(25);

const MAINTENANCE_QUERIES: [&str; 4] = [
    "PRAGMA wal_checkpoint(TRUNCATE)",
    "VACUUM",
    "REINDEX",
    "ANALYZE",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a transaction is already in progress")]
    TxInProgress,
    #[error("no transaction is in progress")]
    NoTxInProgress,
    #[error("that savepoint does not exist")]
    InvalidSavepoint,
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<ModelError> for StoreError {
    fn from(err: ModelError) -> Self {
        StoreError::InvalidValue(err.to_string())
    }
}

/// Returns true for errors the store retries after a short delay. The
/// structured error code is checked first; matching the message text is the
/// safety net for drivers that only give us a string.
fn worth_a_retry(err: &rusqlite::Error) -> bool {
    if let rusqlite::Error::SqliteFailure(cause, _) = err {
        if matches!(
            cause.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) {
            return true;
        }
    }
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

fn wait_for_retry() {
    std::thread::sleep(RETRY_DELAY);
}

/// One handle to the database.
pub struct Store {
    id: i64,
    conn: Connection,
    tx_open: bool,
    sp_counter: u32,
    sp_names: HashMap<String, String>,
    metrics: Option<Arc<Metrics>>,
}

impl Store {
    /// Opens the database at `path`, creating and initialising the file if
    /// it does not exist yet. A failed initialisation removes the partially
    /// created file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_internal(path, None)
    }

    /// Like [`Store::open`], with retried busy/locked errors counted in the
    /// shared metrics registry.
    pub fn open_with_metrics(
        path: impl AsRef<Path>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, StoreError> {
        Self::open_internal(path, Some(metrics))
    }

    fn open_internal(
        path: impl AsRef<Path>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let _guard = OPEN_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let id = ID_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
        let fresh = !path.exists();

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA recursive_triggers = 0;",
        )?;
        conn.set_prepared_statement_cache_capacity(32);

        let mut store = Self {
            id,
            conn,
            tx_open: false,
            sp_counter: 1,
            sp_names: HashMap::new(),
            metrics,
        };

        if fresh {
            if let Err(err) = store.initialize() {
                error!(path = %path.display(), error = %err, "schema bootstrap failed, removing file");
                drop(store);
                if let Err(rm) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %rm, "cannot remove partially created database");
                }
                return Err(err);
            }
            info!(path = %path.display(), "database initialized");
        }

        debug!(handle = id, path = %path.display(), "database opened");
        Ok(store)
    }

    fn initialize(&mut self) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for q in schema::all_schemas() {
            trace!(query = q, "execute init query");
            tx.execute_batch(q)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.tx_open
    }

    fn count_retry(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.fleet_store_retries_total.inc();
        }
    }

    /// Prepares the statement for a known query id. Transient errors are
    /// retried; anything else means the SQL no longer matches the schema,
    /// which is a bug, not a runtime condition.
    fn prepare(&self, q: Query) -> rusqlite::CachedStatement<'_> {
        loop {
            match self.conn.prepare_cached(q.sql()) {
                Ok(stmt) => return stmt,
                Err(err) if worth_a_retry(&err) => {
                    self.count_retry();
                    wait_for_retry();
                }
                Err(err) => panic!("cannot prepare query {q:?}: {err}"),
            }
        }
    }

    fn run<T>(
        &self,
        q: Query,
        f: impl Fn(&mut rusqlite::CachedStatement<'_>) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        loop {
            let mut stmt = self.prepare(q);
            match f(&mut stmt) {
                Ok(v) => return Ok(v),
                Err(err) if worth_a_retry(&err) => {
                    drop(stmt);
                    self.count_retry();
                    wait_for_retry();
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn exec_raw(&self, sql: &str) -> Result<(), StoreError> {
        loop {
            match self.conn.execute_batch(sql) {
                Ok(()) => return Ok(()),
                Err(err) if worth_a_retry(&err) => {
                    self.count_retry();
                    wait_for_retry();
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    // ------------------------------------------------------------------
    // Transactions and savepoints
    // ------------------------------------------------------------------

    /// Begins an explicit transaction. At most one transaction per handle.
    pub fn begin(&mut self) -> Result<(), StoreError> {
        debug!(handle = self.id, "begin transaction");
        if self.tx_open {
            return Err(StoreError::TxInProgress);
        }
        self.exec_raw("BEGIN")?;
        self.tx_open = true;
        self.reset_sp_namespace();
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        debug!(handle = self.id, "commit transaction");
        if !self.tx_open {
            return Err(StoreError::NoTxInProgress);
        }
        self.exec_raw("COMMIT")?;
        self.tx_open = false;
        self.reset_sp_namespace();
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), StoreError> {
        debug!(handle = self.id, "roll back transaction");
        if !self.tx_open {
            return Err(StoreError::NoTxInProgress);
        }
        self.exec_raw("ROLLBACK")?;
        self.tx_open = false;
        self.reset_sp_namespace();
        Ok(())
    }

    fn reset_sp_namespace(&mut self) {
        self.sp_counter = 1;
        self.sp_names.clear();
    }

    // SAVEPOINT does not take placeholders, and interpolating a caller-chosen
    // name into SQL is an injection hazard. The caller's name is therefore
    // mapped to a generated token, and only the token ever reaches SQLite.
    fn generate_sp_name(&mut self, name: &str) -> String {
        let spname = format!("Savepoint{:05}", self.sp_counter);
        self.sp_counter += 1;
        self.sp_names.insert(name.to_string(), spname.clone());
        spname
    }

    /// Creates a savepoint under a caller-chosen name. Requires an active
    /// transaction; SQLite would allow a savepoint outside one, the store
    /// does not.
    pub fn savepoint_create(&mut self, name: &str) -> Result<(), StoreError> {
        debug!(handle = self.id, savepoint = name, "create savepoint");
        if !self.tx_open {
            return Err(StoreError::NoTxInProgress);
        }
        let internal = self.generate_sp_name(name);
        self.exec_raw(&format!("SAVEPOINT {internal}"))
    }

    /// Releases the savepoint with the given name and every savepoint
    /// created before it.
    pub fn savepoint_release(&mut self, name: &str) -> Result<(), StoreError> {
        debug!(handle = self.id, savepoint = name, "release savepoint");
        if !self.tx_open {
            return Err(StoreError::NoTxInProgress);
        }
        let internal = self
            .sp_names
            .get(name)
            .cloned()
            .ok_or(StoreError::InvalidSavepoint)?;
        self.exec_raw(&format!("RELEASE SAVEPOINT {internal}"))?;
        self.sp_names.remove(name);
        Ok(())
    }

    /// Rolls the transaction back to the savepoint with the given name.
    pub fn savepoint_rollback(&mut self, name: &str) -> Result<(), StoreError> {
        debug!(handle = self.id, savepoint = name, "roll back to savepoint");
        if !self.tx_open {
            return Err(StoreError::NoTxInProgress);
        }
        let internal = self
            .sp_names
            .get(name)
            .cloned()
            .ok_or(StoreError::InvalidSavepoint)?;
        self.exec_raw(&format!("ROLLBACK TO SAVEPOINT {internal}"))?;
        self.sp_names.remove(name);
        Ok(())
    }

    /// Checkpoints, vacuums, reindexes and analyzes the database. Blocks
    /// most other access while running and refuses to run inside a
    /// transaction. Individual failures are logged, not propagated.
    pub fn perform_maintenance(&mut self) -> Result<(), StoreError> {
        if self.tx_open {
            return Err(StoreError::TxInProgress);
        }
        for q in MAINTENANCE_QUERIES {
            if let Err(err) = self.conn.execute_batch(q) {
                error!(handle = self.id, query = q, error = %err, "maintenance query failed");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Network
    // ------------------------------------------------------------------

    pub fn network_add(&mut self, net: &mut Network) -> Result<(), StoreError> {
        let addr = net.addr.to_string();
        let desc = net.desc.clone();
        let id = self.run(Query::NetworkAdd, |stmt| {
            stmt.query_row(params![addr, desc], |row| row.get::<_, i64>(0))
        })?;
        net.id = id;
        Ok(())
    }

    /// Deletes a network; devices and their samples go with it.
    pub fn network_delete(&mut self, net: &Network) -> Result<(), StoreError> {
        self.run(Query::NetworkDelete, |stmt| stmt.execute(params![net.id]))?;
        Ok(())
    }

    pub fn network_update_scan_stamp(
        &mut self,
        net: &mut Network,
        stamp: i64,
    ) -> Result<(), StoreError> {
        let affected = self.run(Query::NetworkUpdateScanStamp, |stmt| {
            stmt.execute(params![stamp, net.id])
        })?;
        if affected != 1 {
            warn!(network = %net.addr, id = net.id, "scan stamp update affected no rows");
        } else {
            net.last_scan = stamp;
        }
        Ok(())
    }

    pub fn network_update_desc(
        &mut self,
        net: &mut Network,
        desc: &str,
    ) -> Result<(), StoreError> {
        let affected = self.run(Query::NetworkUpdateDesc, |stmt| {
            stmt.execute(params![desc, net.id])
        })?;
        if affected != 1 {
            warn!(network = %net.addr, id = net.id, "description update affected no rows");
        } else {
            net.desc = desc.to_string();
        }
        Ok(())
    }

    pub fn network_get_all(&mut self) -> Result<Vec<Network>, StoreError> {
        let rows: Vec<(i64, String, String, i64)> = self.run(Query::NetworkGetAll, |stmt| {
            stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect()
        })?;

        let mut networks = Vec::with_capacity(rows.len());
        for (id, addr, desc, last_scan) in rows {
            let addr: Cidr = addr.parse()?;
            networks.push(Network {
                id,
                addr,
                desc,
                last_scan,
            });
        }
        Ok(networks)
    }

    pub fn network_get_by_id(&mut self, id: i64) -> Result<Option<Network>, StoreError> {
        let row: Option<(String, String, i64)> = self.run(Query::NetworkGetById, |stmt| {
            stmt.query_row(params![id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()
        })?;

        match row {
            None => Ok(None),
            Some((addr, desc, last_scan)) => Ok(Some(Network {
                id,
                addr: addr.parse()?,
                desc,
                last_scan,
            })),
        }
    }

    pub fn network_get_by_addr(&mut self, addr: &Cidr) -> Result<Option<Network>, StoreError> {
        let key = addr.to_string();
        let row: Option<(i64, String, i64)> = self.run(Query::NetworkGetByAddr, |stmt| {
            stmt.query_row(params![key], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()
        })?;

        Ok(row.map(|(id, desc, last_scan)| Network {
            id,
            addr: *addr,
            desc,
            last_scan,
        }))
    }

    /// Number of devices per network.
    pub fn network_dev_cnt(&mut self) -> Result<HashMap<i64, i64>, StoreError> {
        let rows: Vec<(i64, i64)> = self.run(Query::NetworkDevCnt, |stmt| {
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect()
        })?;
        Ok(rows.into_iter().collect())
    }

    // ------------------------------------------------------------------
    // Device
    // ------------------------------------------------------------------

    pub fn device_add(&mut self, dev: &mut Device) -> Result<(), StoreError> {
        let addr = dev.addr_json();
        let name = dev.name.clone();
        let net_id = dev.net_id;
        let bighead = dev.bighead;
        let id = self.run(Query::DeviceAdd, |stmt| {
            stmt.query_row(params![net_id, name, addr, bighead], |row| {
                row.get::<_, i64>(0)
            })
        })?;
        dev.id = id;
        Ok(())
    }

    pub fn device_update_last_seen(
        &mut self,
        dev: &mut Device,
        stamp: i64,
    ) -> Result<(), StoreError> {
        let affected = self.run(Query::DeviceUpdateLastSeen, |stmt| {
            stmt.execute(params![stamp, dev.id])
        })?;
        if affected != 1 {
            warn!(device = %dev.name, id = dev.id, "last_seen update affected no rows");
        } else {
            dev.last_seen = stamp;
        }
        Ok(())
    }

    pub fn device_update_os(&mut self, dev: &mut Device, os: &str) -> Result<(), StoreError> {
        let affected = self.run(Query::DeviceUpdateOs, |stmt| {
            stmt.execute(params![os, dev.id])
        })?;
        if affected != 1 {
            warn!(device = %dev.name, id = dev.id, "os update affected no rows");
        }
        dev.os = os.to_string();
        Ok(())
    }

    pub fn device_update_addr(&mut self, dev: &mut Device) -> Result<(), StoreError> {
        let addr = dev.addr_json();
        let affected = self.run(Query::DeviceUpdateAddr, |stmt| {
            stmt.execute(params![addr, dev.id])
        })?;
        if affected != 1 {
            warn!(device = %dev.name, id = dev.id, "address update affected no rows");
        }
        Ok(())
    }

    pub fn device_get_all(&mut self, bighead_only: bool) -> Result<Vec<Device>, StoreError> {
        let rows: Vec<(i64, i64, String, String, String, i64, i64)> =
            self.run(Query::DeviceGetAll, |stmt| {
                stmt.query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                })?
                .collect()
            })?;

        let mut devices = Vec::with_capacity(rows.len());
        for (id, net_id, name, addr, os, bighead, last_seen) in rows {
            if bighead_only && bighead == 0 {
                continue;
            }
            devices.push(Device {
                id,
                net_id,
                name,
                addr: Device::addrs_from_json(&addr)?,
                os,
                bighead: bighead != 0,
                last_seen,
            });
        }
        Ok(devices)
    }

    pub fn device_get_by_id(&mut self, id: i64) -> Result<Option<Device>, StoreError> {
        let row: Option<(i64, String, String, String, i64, i64)> =
            self.run(Query::DeviceGetById, |stmt| {
                stmt.query_row(params![id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })
                .optional()
            })?;

        match row {
            None => Ok(None),
            Some((net_id, name, addr, os, bighead, last_seen)) => Ok(Some(Device {
                id,
                net_id,
                name,
                addr: Device::addrs_from_json(&addr)?,
                os,
                bighead: bighead != 0,
                last_seen,
            })),
        }
    }

    pub fn device_get_by_name(&mut self, name: &str) -> Result<Option<Device>, StoreError> {
        let row: Option<(i64, i64, String, String, i64, i64)> =
            self.run(Query::DeviceGetByName, |stmt| {
                stmt.query_row(params![name], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })
                .optional()
            })?;

        match row {
            None => Ok(None),
            Some((id, net_id, addr, os, bighead, last_seen)) => Ok(Some(Device {
                id,
                net_id,
                name: name.to_string(),
                addr: Device::addrs_from_json(&addr)?,
                os,
                bighead: bighead != 0,
                last_seen,
            })),
        }
    }

    pub fn device_get_by_network(&mut self, net: &Network) -> Result<Vec<Device>, StoreError> {
        let rows: Vec<(i64, String, String, String, i64, i64)> =
            self.run(Query::DeviceGetByNetwork, |stmt| {
                stmt.query_map(params![net.id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .collect()
            })?;

        let mut devices = Vec::with_capacity(rows.len());
        for (id, name, addr, os, bighead, last_seen) in rows {
            devices.push(Device {
                id,
                net_id: net.id,
                name,
                addr: Device::addrs_from_json(&addr)?,
                os,
                bighead: bighead != 0,
                last_seen,
            });
        }
        Ok(devices)
    }

    pub fn device_cnt(&mut self) -> Result<i64, StoreError> {
        self.run(Query::DeviceCnt, |stmt| {
            stmt.query_row([], |row| row.get::<_, i64>(0))
        })
    }

    // ------------------------------------------------------------------
    // Time series
    // ------------------------------------------------------------------

    pub fn uptime_add(&mut self, up: &mut Uptime) -> Result<(), StoreError> {
        if up.load.iter().any(|l| *l < 0.0) || up.uptime_secs < 0 {
            return Err(StoreError::InvalidValue(format!(
                "negative load/uptime for device {}",
                up.dev_id
            )));
        }
        let id = self.run(Query::UptimeAdd, |stmt| {
            stmt.query_row(
                params![
                    up.dev_id,
                    up.timestamp,
                    up.uptime_secs,
                    up.load[0],
                    up.load[1],
                    up.load[2]
                ],
                |row| row.get::<_, i64>(0),
            )
        })?;
        up.id = id;
        Ok(())
    }

    /// The `limit` most recent measurements, newest first. Pass -1 for all.
    pub fn uptime_get_by_device(
        &mut self,
        dev: &Device,
        limit: i64,
    ) -> Result<Vec<Uptime>, StoreError> {
        let rows: Vec<(i64, i64, i64, f64, f64, f64)> =
            self.run(Query::UptimeGetByDevice, |stmt| {
                stmt.query_map(params![dev.id, limit], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .collect()
            })?;

        Ok(rows
            .into_iter()
            .map(|(id, timestamp, uptime_secs, l1, l5, l15)| Uptime {
                id,
                dev_id: dev.id,
                timestamp,
                uptime_secs,
                load: [l1, l5, l15],
            })
            .collect())
    }

    pub fn updates_add(&mut self, up: &mut Updates) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&up.available)
            .map_err(|e| StoreError::InvalidValue(e.to_string()))?;
        let id = self.run(Query::UpdatesAdd, |stmt| {
            stmt.query_row(params![up.dev_id, up.timestamp, raw], |row| {
                row.get::<_, i64>(0)
            })
        })?;
        up.id = id;
        Ok(())
    }

    /// The `limit` most recent update sets, newest first. Pass -1 for all.
    pub fn updates_get_by_device(
        &mut self,
        dev: &Device,
        limit: i64,
    ) -> Result<Vec<Updates>, StoreError> {
        let rows: Vec<(i64, i64, String)> = self.run(Query::UpdatesGetByDevice, |stmt| {
            stmt.query_map(params![dev.id, limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect()
        })?;

        let mut sets = Vec::with_capacity(rows.len());
        for (id, timestamp, raw) in rows {
            let available: Vec<String> = serde_json::from_str(&raw)
                .map_err(|e| StoreError::InvalidValue(e.to_string()))?;
            sets.push(Updates {
                id,
                dev_id: dev.id,
                timestamp,
                available,
            });
        }
        Ok(sets)
    }

    /// The most recent update set per device.
    pub fn updates_get_recent(&mut self) -> Result<Vec<Updates>, StoreError> {
        let rows: Vec<(i64, i64, i64, String)> = self.run(Query::UpdatesGetRecent, |stmt| {
            stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect()
        })?;

        let mut sets = Vec::with_capacity(rows.len());
        for (id, dev_id, timestamp, raw) in rows {
            let available: Vec<String> = serde_json::from_str(&raw)
                .map_err(|e| StoreError::InvalidValue(e.to_string()))?;
            sets.push(Updates {
                id,
                dev_id,
                timestamp,
                available,
            });
        }
        Ok(sets)
    }

    pub fn info_add(&mut self, rec: &mut InfoRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&rec.data)
            .map_err(|e| StoreError::InvalidValue(e.to_string()))?;
        let kind = rec.kind.as_i64();
        let id = self.run(Query::InfoAdd, |stmt| {
            stmt.query_row(params![rec.dev_id, rec.timestamp, kind, raw], |row| {
                row.get::<_, i64>(0)
            })
        })?;
        rec.id = id;
        Ok(())
    }

    /// The most recent record of the given kind per device.
    pub fn info_get_recent(
        &mut self,
        kind: InfoKind,
    ) -> Result<HashMap<i64, InfoRecord>, StoreError> {
        let tag = kind.as_i64();
        let rows: Vec<(i64, i64, i64, String)> = self.run(Query::InfoGetRecent, |stmt| {
            stmt.query_map(params![tag], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect()
        })?;

        let mut data = HashMap::with_capacity(rows.len());
        for (id, dev_id, timestamp, raw) in rows {
            let value: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|e| StoreError::InvalidValue(e.to_string()))?;
            data.insert(
                dev_id,
                InfoRecord {
                    id,
                    dev_id,
                    timestamp,
                    kind,
                    data: value,
                },
            );
        }
        Ok(data)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.tx_open {
            if let Err(err) = self.exec_raw("ROLLBACK") {
                warn!(handle = self.id, error = %err, "cannot roll back pending transaction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).expect("cannot create database");
        (dir, store)
    }

    fn sample_device(n: usize) -> Device {
        Device {
            id: 0,
            net_id: 1,
            name: format!("dev{n:02}"),
            addr: vec![format!("192.168.0.{n}").parse::<IpAddr>().unwrap()],
            os: String::new(),
            bighead: true,
            last_seen: 0,
        }
    }

    #[test]
    fn open_prepares_every_query() {
        let (_dir, store) = open_store();
        for q in Query::ALL {
            // prepare() panics if a known query no longer matches the schema
            let _ = store.prepare(q);
        }
    }

    #[test]
    fn reopen_skips_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let _store = Store::open(&path).unwrap();
        }
        assert!(path.exists());
        let _again = Store::open(&path).expect("reopen must not re-run the schema");
    }

    #[test]
    fn network_round_trip() {
        let (_dir, mut store) = open_store();
        let mut net = Network::new("192.168.0.0/24", "Sample network").unwrap();
        store.network_add(&mut net).unwrap();
        assert!(net.id > 0);

        let loaded = store.network_get_by_id(net.id).unwrap().unwrap();
        assert_eq!(loaded.addr, net.addr);
        assert_eq!(loaded.desc, "Sample network");
        assert_eq!(loaded.last_scan, 0);

        let by_addr = store.network_get_by_addr(&net.addr).unwrap().unwrap();
        assert_eq!(by_addr.id, net.id);

        assert!(store.network_get_by_id(net.id + 17).unwrap().is_none());

        store.network_update_scan_stamp(&mut net, 1234).unwrap();
        assert_eq!(net.last_scan, 1234);
        let loaded = store.network_get_by_id(net.id).unwrap().unwrap();
        assert_eq!(loaded.last_scan, 1234);
    }

    #[test]
    fn device_add_and_get_all() {
        let (_dir, mut store) = open_store();
        let mut net = Network::new("192.168.0.0/24", "").unwrap();
        store.network_add(&mut net).unwrap();

        store.begin().unwrap();
        for n in 1..=16 {
            let mut dev = sample_device(n);
            dev.net_id = net.id;
            store.device_add(&mut dev).unwrap();
            assert!(dev.id > 0);
        }
        store.commit().unwrap();

        let devices = store.device_get_all(false).unwrap();
        assert_eq!(devices.len(), 16);
        assert_eq!(store.device_cnt().unwrap(), 16);
        assert_eq!(store.network_dev_cnt().unwrap()[&net.id], 16);

        let by_net = store.device_get_by_network(&net).unwrap();
        assert_eq!(by_net.len(), 16);
    }

    #[test]
    fn duplicate_name_rolls_back() {
        let (_dir, mut store) = open_store();
        let mut net = Network::new("192.168.0.0/24", "").unwrap();
        store.network_add(&mut net).unwrap();

        store.begin().unwrap();
        let mut dev = sample_device(1);
        dev.net_id = net.id;
        store.device_add(&mut dev).unwrap();

        let mut dup = sample_device(1);
        dup.net_id = net.id;
        assert!(store.device_add(&mut dup).is_err());

        store.rollback().unwrap();
        assert!(store.device_get_by_name("dev01").unwrap().is_none());
    }

    #[test]
    fn device_referencing_missing_network_is_rejected() {
        let (_dir, mut store) = open_store();
        let mut dev = sample_device(1);
        dev.net_id = 4711;
        assert!(store.device_add(&mut dev).is_err());
    }

    #[test]
    fn transaction_state_errors() {
        let (_dir, mut store) = open_store();

        assert!(matches!(store.commit(), Err(StoreError::NoTxInProgress)));
        assert!(matches!(store.rollback(), Err(StoreError::NoTxInProgress)));

        store.begin().unwrap();
        assert!(matches!(store.begin(), Err(StoreError::TxInProgress)));
        assert!(matches!(
            store.perform_maintenance(),
            Err(StoreError::TxInProgress)
        ));
        store.commit().unwrap();

        store.perform_maintenance().unwrap();
    }

    #[test]
    fn savepoint_contract() {
        let (_dir, mut store) = open_store();
        let mut net = Network::new("192.168.0.0/24", "").unwrap();
        store.network_add(&mut net).unwrap();

        // all savepoint operations require an active transaction
        assert!(matches!(
            store.savepoint_create("a"),
            Err(StoreError::NoTxInProgress)
        ));
        assert!(matches!(
            store.savepoint_release("a"),
            Err(StoreError::NoTxInProgress)
        ));
        assert!(matches!(
            store.savepoint_rollback("a"),
            Err(StoreError::NoTxInProgress)
        ));

        store.begin().unwrap();
        assert!(matches!(
            store.savepoint_release("nope"),
            Err(StoreError::InvalidSavepoint)
        ));

        store.savepoint_create("before-dev").unwrap();
        let mut dev = sample_device(1);
        dev.net_id = net.id;
        store.device_add(&mut dev).unwrap();
        store.savepoint_rollback("before-dev").unwrap();
        store.commit().unwrap();

        assert!(store.device_get_by_name("dev01").unwrap().is_none());

        // the name mapping is discarded on transaction end
        store.begin().unwrap();
        assert!(matches!(
            store.savepoint_release("before-dev"),
            Err(StoreError::InvalidSavepoint)
        ));
        store.rollback().unwrap();
    }

    #[test]
    fn savepoint_names_are_not_interpolated() {
        let (_dir, mut store) = open_store();
        store.begin().unwrap();
        // A hostile name must not be able to break out of the statement.
        store
            .savepoint_create("x; DROP TABLE device; --")
            .unwrap();
        store.rollback().unwrap();
        assert_eq!(store.device_cnt().unwrap(), 0);
    }

    #[test]
    fn triggers_bump_and_clamp_last_seen() {
        let (_dir, mut store) = open_store();
        let mut net = Network::new("192.168.0.0/24", "").unwrap();
        store.network_add(&mut net).unwrap();
        let mut dev = sample_device(1);
        dev.net_id = net.id;
        store.device_add(&mut dev).unwrap();

        let mut up = Uptime {
            id: 0,
            dev_id: dev.id,
            timestamp: 1000,
            uptime_secs: 86400,
            load: [0.5, 0.4, 0.3],
        };
        store.uptime_add(&mut up).unwrap();
        let loaded = store.device_get_by_id(dev.id).unwrap().unwrap();
        assert_eq!(loaded.last_seen, 1000);

        // an older sample must not regress last_seen
        let mut late = Uptime {
            id: 0,
            dev_id: dev.id,
            timestamp: 500,
            uptime_secs: 86400,
            load: [0.1, 0.1, 0.1],
        };
        store.uptime_add(&mut late).unwrap();
        let loaded = store.device_get_by_id(dev.id).unwrap().unwrap();
        assert_eq!(loaded.last_seen, 1000);

        let mut upd = Updates {
            id: 0,
            dev_id: dev.id,
            timestamp: 2000,
            available: vec!["linux\t6.16.3\t6.16.4".to_string()],
        };
        store.updates_add(&mut upd).unwrap();
        let loaded = store.device_get_by_id(dev.id).unwrap().unwrap();
        assert_eq!(loaded.last_seen, 2000);

        let mut rec = InfoRecord {
            id: 0,
            dev_id: dev.id,
            timestamp: 3000,
            kind: InfoKind::DiskFree,
            data: serde_json::json!(42),
        };
        store.info_add(&mut rec).unwrap();
        let loaded = store.device_get_by_id(dev.id).unwrap().unwrap();
        assert_eq!(loaded.last_seen, 3000);
    }

    #[test]
    fn cascade_removes_children() {
        let (_dir, mut store) = open_store();
        let mut net = Network::new("192.168.0.0/24", "").unwrap();
        store.network_add(&mut net).unwrap();
        let mut dev = sample_device(1);
        dev.net_id = net.id;
        store.device_add(&mut dev).unwrap();

        let mut up = Uptime {
            id: 0,
            dev_id: dev.id,
            timestamp: 1000,
            uptime_secs: 0,
            load: [0.0, 0.0, 0.0],
        };
        store.uptime_add(&mut up).unwrap();
        let mut upd = Updates {
            id: 0,
            dev_id: dev.id,
            timestamp: 1000,
            available: vec![],
        };
        store.updates_add(&mut upd).unwrap();

        store.network_delete(&net).unwrap();
        assert!(store.device_get_by_name("dev01").unwrap().is_none());
        assert_eq!(store.device_cnt().unwrap(), 0);
        assert!(store.uptime_get_by_device(&dev, -1).unwrap().is_empty());
        assert!(store.updates_get_by_device(&dev, -1).unwrap().is_empty());
    }

    #[test]
    fn time_series_round_trips() {
        let (_dir, mut store) = open_store();
        let mut net = Network::new("192.168.0.0/24", "").unwrap();
        store.network_add(&mut net).unwrap();
        let mut dev = sample_device(1);
        dev.net_id = net.id;
        store.device_add(&mut dev).unwrap();

        for (i, stamp) in [100i64, 200, 300].into_iter().enumerate() {
            let mut up = Uptime {
                id: 0,
                dev_id: dev.id,
                timestamp: stamp,
                uptime_secs: 3600 * i as i64,
                load: [1.08, 0.98, 0.94],
            };
            store.uptime_add(&mut up).unwrap();
        }

        let all = store.uptime_get_by_device(&dev, -1).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, 300);
        assert_eq!(all[0].load, [1.08, 0.98, 0.94]);

        let limited = store.uptime_get_by_device(&dev, 2).unwrap();
        assert_eq!(limited.len(), 2);

        let mut upd = Updates {
            id: 0,
            dev_id: dev.id,
            timestamp: 400,
            available: vec!["linux\t1\t2".to_string(), "vim\t3\t4".to_string()],
        };
        store.updates_add(&mut upd).unwrap();
        // unique per (device, timestamp)
        let mut dup = Updates {
            id: 0,
            dev_id: dev.id,
            timestamp: 400,
            available: vec![],
        };
        assert!(store.updates_add(&mut dup).is_err());

        let recent = store.updates_get_recent().unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].available.len(), 2);

        let mut rec = InfoRecord {
            id: 0,
            dev_id: dev.id,
            timestamp: 500,
            kind: InfoKind::DiskFree,
            data: serde_json::json!(37),
        };
        store.info_add(&mut rec).unwrap();
        let recent = store.info_get_recent(InfoKind::DiskFree).unwrap();
        assert_eq!(recent[&dev.id].data, serde_json::json!(37));
        assert!(store
            .info_get_recent(InfoKind::Temperature)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn negative_load_is_rejected() {
        let (_dir, mut store) = open_store();
        let mut net = Network::new("192.168.0.0/24", "").unwrap();
        store.network_add(&mut net).unwrap();
        let mut dev = sample_device(1);
        dev.net_id = net.id;
        store.device_add(&mut dev).unwrap();

        let mut up = Uptime {
            id: 0,
            dev_id: dev.id,
            timestamp: 100,
            uptime_secs: 0,
            load: [-1.0, 0.0, 0.0],
        };
        assert!(matches!(
            store.uptime_add(&mut up),
            Err(StoreError::InvalidValue(_))
        ));
    }

    #[test]
    fn distinct_handles_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut first = Store::open(&path).unwrap();
        let mut second = Store::open(&path).unwrap();

        let mut net = Network::new("10.0.0.0/8", "").unwrap();
        first.network_add(&mut net).unwrap();

        let seen = second.network_get_by_id(net.id).unwrap().unwrap();
        assert_eq!(seen.addr, net.addr);
    }
}
