use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid CIDR block {0:?}")]
    InvalidCidr(String),
    #[error("invalid IP address {0:?}")]
    InvalidAddr(String),
    #[error("unknown info kind {0}")]
    UnknownInfoKind(i64),
}

/// An IPv4 prefix in CIDR notation. Enumeration covers the full range,
/// network and broadcast addresses included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    base: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    pub fn new(base: Ipv4Addr, prefix: u8) -> Result<Self, ModelError> {
        if prefix > 32 {
            return Err(ModelError::InvalidCidr(format!("{base}/{prefix}")));
        }
        Ok(Self { base, prefix })
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            !((1u32 << (32 - self.prefix)) - 1)
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) & self.mask())
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !self.mask())
    }

    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.network())
    }

    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network());
        let last = u32::from(self.broadcast());
        (first..=last).map(Ipv4Addr::from)
    }
}

impl FromStr for Cidr {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| ModelError::InvalidCidr(s.to_string()))?;
        let base: Ipv4Addr = addr
            .parse()
            .map_err(|_| ModelError::InvalidCidr(s.to_string()))?;
        let prefix: u8 = len
            .parse()
            .map_err(|_| ModelError::InvalidCidr(s.to_string()))?;
        Cidr::new(base, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A range of IP addresses the scanner sweeps for devices.
#[derive(Debug, Clone, Serialize)]
pub struct Network {
    pub id: i64,
    pub addr: Cidr,
    pub desc: String,
    pub last_scan: i64,
}

impl Network {
    pub fn new(addr: &str, desc: &str) -> Result<Self, ModelError> {
        Ok(Self {
            id: 0,
            addr: addr.parse()?,
            desc: desc.to_string(),
            last_scan: 0,
        })
    }
}

/// A computer, in the most inclusive sense of the word, connected to an IP
/// network. A device is a BigHead if it is a *real* computer, one you could
/// do some coding on; phones, tablets, smart TVs and the like are not.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: i64,
    pub net_id: i64,
    pub name: String,
    pub addr: Vec<IpAddr>,
    pub os: String,
    pub bighead: bool,
    pub last_seen: i64,
}

impl Device {
    pub fn addr_json(&self) -> String {
        let strs: Vec<String> = self.addr.iter().map(|a| a.to_string()).collect();
        serde_json::to_string(&strs).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn addrs_from_json(raw: &str) -> Result<Vec<IpAddr>, ModelError> {
        let strs: Vec<String> =
            serde_json::from_str(raw).map_err(|_| ModelError::InvalidAddr(raw.to_string()))?;
        strs.iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| ModelError::InvalidAddr(s.clone()))
            })
            .collect()
    }

    pub fn default_addr(&self) -> Option<IpAddr> {
        self.addr.first().copied()
    }
}

/// One uptime/sysload measurement taken from a device.
#[derive(Debug, Clone, Serialize)]
pub struct Uptime {
    pub id: i64,
    pub dev_id: i64,
    pub timestamp: i64,
    pub uptime_secs: i64,
    pub load: [f64; 3],
}

/// The set of pending package updates reported by a device at one moment.
#[derive(Debug, Clone, Serialize)]
pub struct Updates {
    pub id: i64,
    pub dev_id: i64,
    pub timestamp: i64,
    pub available: Vec<String>,
}

/// The kind of measurement stored in an [`InfoRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InfoKind {
    DiskFree,
    Temperature,
    NeedsReboot,
    LoadAvg,
}

impl InfoKind {
    pub fn as_i64(self) -> i64 {
        match self {
            InfoKind::DiskFree => 0,
            InfoKind::Temperature => 1,
            InfoKind::NeedsReboot => 2,
            InfoKind::LoadAvg => 3,
        }
    }

    pub fn from_i64(v: i64) -> Result<Self, ModelError> {
        match v {
            0 => Ok(InfoKind::DiskFree),
            1 => Ok(InfoKind::Temperature),
            2 => Ok(InfoKind::NeedsReboot),
            3 => Ok(InfoKind::LoadAvg),
            other => Err(ModelError::UnknownInfoKind(other)),
        }
    }
}

/// A schemaless measurement tagged with an [`InfoKind`].
#[derive(Debug, Clone, Serialize)]
pub struct InfoRecord {
    pub id: i64,
    pub dev_id: i64,
    pub timestamp: i64,
    pub kind: InfoKind,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_parse_and_display() {
        let cidr: Cidr = "192.168.42.17/24".parse().unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(192, 168, 42, 0));
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(192, 168, 42, 255));
        assert_eq!(cidr.to_string(), "192.168.42.0/24");
        assert_eq!(cidr.size(), 256);

        assert!("192.168.0.0/33".parse::<Cidr>().is_err());
        assert!("192.168.0.0".parse::<Cidr>().is_err());
        assert!("not-an-address/24".parse::<Cidr>().is_err());
    }

    #[test]
    fn cidr_enumerates_full_range() {
        let cidr: Cidr = "192.168.42.0/24".parse().unwrap();
        let addrs: Vec<Ipv4Addr> = cidr.addresses().collect();

        assert_eq!(addrs.len(), 256);
        assert_eq!(addrs[0], Ipv4Addr::new(192, 168, 42, 0));
        assert_eq!(addrs[255], Ipv4Addr::new(192, 168, 42, 255));

        let mut seen = std::collections::HashSet::new();
        for a in &addrs {
            assert!(seen.insert(*a), "address {a} emitted twice");
            assert!(cidr.contains(*a));
        }
    }

    #[test]
    fn cidr_contains() {
        let cidr: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(cidr.contains(Ipv4Addr::new(10, 200, 3, 4)));
        assert!(!cidr.contains(Ipv4Addr::new(11, 0, 0, 1)));
    }

    #[test]
    fn device_addr_json_round_trip() {
        let dev = Device {
            id: 1,
            net_id: 1,
            name: "dev01".to_string(),
            addr: vec!["192.168.0.5".parse().unwrap(), "fe80::1".parse().unwrap()],
            os: String::new(),
            bighead: true,
            last_seen: 0,
        };

        let raw = dev.addr_json();
        let parsed = Device::addrs_from_json(&raw).unwrap();
        assert_eq!(parsed, dev.addr);

        let back = Device {
            addr: parsed,
            ..dev.clone()
        };
        assert_eq!(back.addr_json(), raw);
    }

    #[test]
    fn device_addr_json_rejects_garbage() {
        assert!(Device::addrs_from_json("not json").is_err());
        assert!(Device::addrs_from_json(r#"["999.1.2.3"]"#).is_err());
    }

    #[test]
    fn info_kind_round_trip() {
        for kind in [
            InfoKind::DiskFree,
            InfoKind::Temperature,
            InfoKind::NeedsReboot,
            InfoKind::LoadAvg,
        ] {
            assert_eq!(InfoKind::from_i64(kind.as_i64()).unwrap(), kind);
        }
        assert!(InfoKind::from_i64(17).is_err());
    }
}
