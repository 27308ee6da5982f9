//! Probing devices over SSH.
//!
//! The probe keeps one authenticated client per device and derives fresh
//! sessions from it for every command. Output parsing lives in [`commands`].

pub mod commands;

use russh::client::{self, AuthResult, Handle};
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::{now_unix, Device, InfoKind, InfoRecord, Updates, Uptime};
use crate::ping::{ping_addr, PingSettings};

use commands::ExitDisposition;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("device does not answer on any address")]
    Offline,
    #[error("remote command {command:?} exited with status {status}")]
    Remote { command: String, status: u32 },
    #[error("cannot parse remote output: {0}")]
    Parse(String),
    #[error("authentication rejected by {0}")]
    Auth(String),
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("ssh key error: {0}")]
    Key(#[from] russh::keys::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Host keys are not verified: the monitor talks to its own LAN, where hosts
// get reinstalled often enough that a pinned known_hosts file would mostly
// produce false alarms. Do not point this at untrusted networks.
#[derive(Clone)]
pub struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct Probe {
    config: Arc<client::Config>,
    keys: Vec<Arc<PrivateKey>>,
    user: String,
    port: u16,
    ping: PingSettings,
    clients: RwLock<HashMap<i64, Arc<Handle<AcceptAnyHostKey>>>>,
}

impl Probe {
    pub fn new(cfg: &Config) -> Result<Self, ProbeError> {
        let keys = load_keys(Path::new(&cfg.device.key_dir))?;
        if keys.is_empty() {
            warn!(dir = %cfg.device.key_dir, "no usable private keys, probing will fail");
        } else {
            info!(count = keys.len(), dir = %cfg.device.key_dir, "private keys loaded");
        }

        Ok(Self {
            config: Arc::new(client::Config::default()),
            keys,
            user: cfg.device.user.clone(),
            port: cfg.device.ssh_port,
            ping: PingSettings::from(&cfg.ping),
            clients: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the cached client for a device, connecting first if there is
    /// none (or the cached one died).
    pub async fn get_client(
        &self,
        dev: &Device,
    ) -> Result<Arc<Handle<AcceptAnyHostKey>>, ProbeError> {
        {
            let cache = self.clients.read().await;
            if let Some(client) = cache.get(&dev.id) {
                if !client.is_closed() {
                    return Ok(Arc::clone(client));
                }
            }
        }

        let client = Arc::new(self.connect_any(dev).await?);
        self.clients
            .write()
            .await
            .insert(dev.id, Arc::clone(&client));
        Ok(client)
    }

    /// Drops the cached client for a device, closing the connection.
    pub async fn disconnect(&self, dev_id: i64) {
        let client = self.clients.write().await.remove(&dev_id);
        if let Some(client) = client {
            let _ = client
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
        }
    }

    /// Walks the device's address list: addresses that do not answer an echo
    /// request are skipped, the first address that yields an authenticated
    /// connection wins.
    async fn connect_any(&self, dev: &Device) -> Result<Handle<AcceptAnyHostKey>, ProbeError> {
        for addr in &dev.addr {
            if !ping_addr(*addr, self.ping).await {
                debug!(device = %dev.name, %addr, "address does not answer, skipping");
                continue;
            }

            match self.connect_addr(*addr).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    debug!(device = %dev.name, %addr, error = %err, "connection attempt failed");
                }
            }
        }
        Err(ProbeError::Offline)
    }

    async fn connect_addr(&self, addr: IpAddr) -> Result<Handle<AcceptAnyHostKey>, ProbeError> {
        let config = Arc::clone(&self.config);
        let port = self.port;

        // The client library has been seen panicking against half-dead
        // peers; running the handshake in its own task contains that.
        let task =
            tokio::spawn(
                async move { client::connect(config, (addr, port), AcceptAnyHostKey).await },
            );
        let mut handle = match task.await {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => return Err(err.into()),
            Err(join) => {
                if join.is_panic() {
                    warn!(%addr, "ssh client panicked during connect");
                }
                return Err(ProbeError::Offline);
            }
        };

        let rsa_hash = handle.best_supported_rsa_hash().await?.flatten();
        for key in &self.keys {
            let auth = handle
                .authenticate_publickey(
                    self.user.clone(),
                    PrivateKeyWithHashAlg::new(Arc::clone(key), rsa_hash),
                )
                .await?;
            if matches!(auth, AuthResult::Success) {
                return Ok(handle);
            }
        }
        Err(ProbeError::Auth(addr.to_string()))
    }

    /// Opens a fresh session on the cached client. A panic or error while
    /// opening evicts the client.
    async fn get_session(&self, dev: &Device) -> Result<Channel<client::Msg>, ProbeError> {
        let client = self.get_client(dev).await?;

        let task = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.channel_open_session().await })
        };

        match task.await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(err)) => {
                self.disconnect(dev.id).await;
                Err(err.into())
            }
            Err(join) => {
                if join.is_panic() {
                    warn!(device = %dev.name, "ssh client panicked while opening a session");
                }
                self.disconnect(dev.id).await;
                Err(ProbeError::Offline)
            }
        }
    }

    /// Runs a command on the device and returns its combined output split
    /// into lines. Command-specific non-zero exit statuses are folded into
    /// success or an empty result (see [`commands::normalize_exit_status`]).
    pub async fn execute_command(
        &self,
        dev: &Device,
        command: &str,
    ) -> Result<Vec<String>, ProbeError> {
        let mut channel = self.get_session(dev).await?;
        channel.exec(true, command).await?;

        let mut output: Vec<u8> = Vec::new();
        let mut status: Option<u32> = None;

        loop {
            let Some(msg) = channel.wait().await else {
                break;
            };
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }

        let status = status.unwrap_or(0);
        match commands::normalize_exit_status(command, status) {
            ExitDisposition::Success => {
                let text = String::from_utf8_lossy(&output);
                Ok(text.split('\n').map(str::to_string).collect())
            }
            ExitDisposition::Empty => Ok(Vec::new()),
            ExitDisposition::Failure => {
                warn!(device = %dev.name, command, status, "remote command failed");
                Err(ProbeError::Remote {
                    command: command.to_string(),
                    status,
                })
            }
        }
    }

    /// Determines the OS identity: the kernel name verbatim for everything
    /// that is not Linux, the NAME= value of /etc/os-release otherwise.
    pub async fn identify_os(&self, dev: &Device) -> Result<String, ProbeError> {
        let lines = self.execute_command(dev, commands::CMD_UNAME).await?;
        let kernel = lines
            .first()
            .map(|l| l.trim())
            .unwrap_or_default()
            .to_string();
        if kernel.is_empty() {
            return Err(ProbeError::Parse("uname printed nothing".to_string()));
        }
        if kernel != "Linux" {
            return Ok(kernel);
        }

        let lines = self.execute_command(dev, commands::CMD_OS_RELEASE).await?;
        commands::parse_os_release(&lines)
            .ok_or_else(|| ProbeError::Parse("no NAME= line in /etc/os-release".to_string()))
    }

    /// Reads the current load averages off the device.
    pub async fn query_load_avg(&self, dev: &Device) -> Result<Uptime, ProbeError> {
        let lines = self.execute_command(dev, commands::CMD_UPTIME).await?;
        let first = lines
            .first()
            .ok_or_else(|| ProbeError::Parse("uptime printed nothing".to_string()))?;
        let load = commands::parse_load_avg(first)?;

        Ok(Uptime {
            id: 0,
            dev_id: dev.id,
            timestamp: now_unix(),
            uptime_secs: 0,
            load,
        })
    }

    /// Queries the device's pending updates. An OS the probe has no command
    /// for yields an empty set without contacting the device.
    pub async fn query_updates(&self, dev: &Device) -> Result<Updates, ProbeError> {
        let available = match commands::update_command(&dev.os) {
            None => Vec::new(),
            Some(cmd) => {
                let lines = self.execute_command(dev, cmd).await?;
                commands::parse_updates(&dev.os, &lines)
            }
        };

        if available.is_empty() {
            debug!(device = %dev.name, "no updates pending");
        }

        Ok(Updates {
            id: 0,
            dev_id: dev.id,
            timestamp: now_unix(),
            available,
        })
    }

    /// Measures free space on the device's root filesystem, in percent.
    pub async fn query_disk_free(&self, dev: &Device) -> Result<InfoRecord, ProbeError> {
        let lines = self.execute_command(dev, commands::CMD_DISK_FREE).await?;
        let free = commands::parse_disk_free(&lines)?;

        Ok(InfoRecord {
            id: 0,
            dev_id: dev.id,
            timestamp: now_unix(),
            kind: InfoKind::DiskFree,
            data: serde_json::json!(free),
        })
    }
}

/// Key files in `dir` named `id_*` that are not public halves.
fn key_file_candidates(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("id_") && !name.ends_with(".pub") {
            candidates.push(entry.path());
        }
    }
    candidates.sort();
    Ok(candidates)
}

fn load_keys(dir: &Path) -> Result<Vec<Arc<PrivateKey>>, ProbeError> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "key directory does not exist");
        return Ok(Vec::new());
    }

    let mut keys = Vec::new();
    for path in key_file_candidates(dir)? {
        match load_secret_key(&path, None) {
            Ok(key) => {
                debug!(path = %path.display(), "private key loaded");
                keys.push(Arc::new(key));
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot load private key, skipping");
            }
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn key_candidates_filter() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "id_ed25519",
            "id_ed25519.pub",
            "id_rsa",
            "id_rsa.pub",
            "known_hosts",
            "config",
        ] {
            fs::write(dir.path().join(name), "x").unwrap();
        }

        let found = key_file_candidates(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["id_ed25519", "id_rsa"]);
    }

    #[test]
    fn unparseable_keys_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("id_rsa"), "this is not a key").unwrap();

        let keys = load_keys(dir.path()).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn missing_key_dir_is_not_fatal() {
        let keys = load_keys(Path::new("/nonexistent/fleetmond-keys")).unwrap();
        assert!(keys.is_empty());
    }
}
