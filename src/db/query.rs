//! Symbolic identifiers for the prepared queries of the store.
//!
//! Statements are prepared through the connection's statement cache and
//! addressed by these ids; a preparation failure for any of them means the
//! SQL no longer matches the schema and is treated as a programmer error.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    NetworkAdd,
    NetworkDelete,
    NetworkUpdateScanStamp,
    NetworkUpdateDesc,
    NetworkGetAll,
    NetworkGetById,
    NetworkGetByAddr,
    NetworkDevCnt,
    DeviceAdd,
    DeviceUpdateLastSeen,
    DeviceUpdateOs,
    DeviceUpdateAddr,
    DeviceGetAll,
    DeviceGetById,
    DeviceGetByName,
    DeviceGetByNetwork,
    DeviceCnt,
    UptimeAdd,
    UptimeGetByDevice,
    UpdatesAdd,
    UpdatesGetByDevice,
    UpdatesGetRecent,
    InfoAdd,
    InfoGetRecent,
}

impl Query {
    pub const ALL: [Query; 24] = [
        Query::NetworkAdd,
        Query::NetworkDelete,
        Query::NetworkUpdateScanStamp,
        Query::NetworkUpdateDesc,
        Query::NetworkGetAll,
        Query::NetworkGetById,
        Query::NetworkGetByAddr,
        Query::NetworkDevCnt,
        Query::DeviceAdd,
        Query::DeviceUpdateLastSeen,
        Query::DeviceUpdateOs,
        Query::DeviceUpdateAddr,
        Query::DeviceGetAll,
        Query::DeviceGetById,
        Query::DeviceGetByName,
        Query::DeviceGetByNetwork,
        Query::DeviceCnt,
        Query::UptimeAdd,
        Query::UptimeGetByDevice,
        Query::UpdatesAdd,
        Query::UpdatesGetByDevice,
        Query::UpdatesGetRecent,
        Query::InfoAdd,
        Query::InfoGetRecent,
    ];

    pub fn sql(self) -> &'static str {
        match self {
            Query::NetworkAdd => {
                "INSERT INTO network (addr, desc) VALUES (?1, ?2) RETURNING id"
            }
            Query::NetworkDelete => "DELETE FROM network WHERE id = ?1",
            Query::NetworkUpdateScanStamp => {
                "UPDATE network SET last_scan = ?1 WHERE id = ?2"
            }
            Query::NetworkUpdateDesc => "UPDATE network SET desc = ?1 WHERE id = ?2",
            Query::NetworkGetAll => {
                "SELECT id, addr, desc, last_scan FROM network ORDER BY addr"
            }
            Query::NetworkGetById => {
                "SELECT addr, desc, last_scan FROM network WHERE id = ?1"
            }
            Query::NetworkGetByAddr => {
                "SELECT id, desc, last_scan FROM network WHERE addr = ?1"
            }
            Query::NetworkDevCnt => {
                "SELECT net_id, COUNT(id) FROM device GROUP BY net_id"
            }
            Query::DeviceAdd => {
                "INSERT INTO device (net_id, name, addr, bighead) \
                 VALUES (?1, ?2, ?3, ?4) RETURNING id"
            }
            Query::DeviceUpdateLastSeen => {
                "UPDATE device SET last_seen = ?1 WHERE id = ?2"
            }
            Query::DeviceUpdateOs => "UPDATE device SET os = ?1 WHERE id = ?2",
            Query::DeviceUpdateAddr => "UPDATE device SET addr = ?1 WHERE id = ?2",
            Query::DeviceGetAll => {
                "SELECT id, net_id, name, addr, os, bighead, last_seen \
                 FROM device ORDER BY name"
            }
            Query::DeviceGetById => {
                "SELECT net_id, name, addr, os, bighead, last_seen \
                 FROM device WHERE id = ?1"
            }
            Query::DeviceGetByName => {
                "SELECT id, net_id, addr, os, bighead, last_seen \
                 FROM device WHERE name = ?1"
            }
            Query::DeviceGetByNetwork => {
                "SELECT id, name, addr, os, bighead, last_seen \
                 FROM device WHERE net_id = ?1 ORDER BY name"
            }
            Query::DeviceCnt => "SELECT COUNT(id) FROM device",
            Query::UptimeAdd => {
                "INSERT INTO uptime (dev_id, timestamp, uptime, load1, load5, load15) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING id"
            }
            Query::UptimeGetByDevice => {
                "SELECT id, timestamp, uptime, load1, load5, load15 \
                 FROM uptime WHERE dev_id = ?1 \
                 ORDER BY timestamp DESC LIMIT ?2"
            }
            Query::UpdatesAdd => {
                "INSERT INTO updates (dev_id, timestamp, updates) \
                 VALUES (?1, ?2, ?3) RETURNING id"
            }
            Query::UpdatesGetByDevice => {
                "SELECT id, timestamp, updates \
                 FROM updates WHERE dev_id = ?1 \
                 ORDER BY timestamp DESC LIMIT ?2"
            }
            Query::UpdatesGetRecent => {
                "SELECT u.id, u.dev_id, u.timestamp, u.updates \
                 FROM updates u \
                 JOIN (SELECT dev_id, MAX(timestamp) AS stamp \
                         FROM updates GROUP BY dev_id) m \
                   ON u.dev_id = m.dev_id AND u.timestamp = m.stamp"
            }
            Query::InfoAdd => {
                "INSERT INTO info (dev_id, timestamp, info_type, data) \
                 VALUES (?1, ?2, ?3, ?4) RETURNING id"
            }
            Query::InfoGetRecent => {
                "SELECT i.id, i.dev_id, i.timestamp, i.data \
                 FROM info i \
                 JOIN (SELECT dev_id, MAX(timestamp) AS stamp \
                         FROM info WHERE info_type = ?1 GROUP BY dev_id) m \
                   ON i.dev_id = m.dev_id AND i.timestamp = m.stamp \
                 WHERE i.info_type = ?1"
            }
        }
    }
}
