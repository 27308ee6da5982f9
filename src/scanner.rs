//! Discovering devices inside configured networks.
//!
//! The scanner waits for commands on a channel. A scan of one network
//! enumerates the full CIDR range, fans the addresses out over a bounded set
//! of workers (reachability test, then reverse lookup) and funnels named
//! candidates into a single collector that admits the ones not seen before.
//! Addresses without a name are dropped: trusted hosts are covered by the
//! internal resolver, anything unnamed is transient.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use trust_dns_resolver::error::ResolveError;
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::Config;
use crate::db::Pool;
use crate::metrics::Metrics;
use crate::model::{now_unix, Device, Network};
use crate::ping::{ping_addr, PingSettings};

// How often the run loop wakes up to observe the stop flag.
const CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCommand {
    /// Scan every network whose last scan is old enough.
    ScanAll,
    /// Scan one network regardless of its last scan.
    ScanOne(i64),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("resolver error: {0}")]
    Resolve(#[from] ResolveError),
}

#[derive(Debug, Default)]
pub struct ScanProgress {
    scanned: AtomicU64,
    added: AtomicU64,
}

pub struct Scanner {
    pool: Pool,
    resolver: TokioAsyncResolver,
    progress: RwLock<HashMap<i64, Arc<ScanProgress>>>,
    active: AtomicBool,
    workers: usize,
    interval_net: i64,
    ping: PingSettings,
    metrics: Arc<Metrics>,
}

impl Scanner {
    pub fn new(pool: Pool, cfg: &Config, metrics: Arc<Metrics>) -> Result<Self, ScanError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self {
            pool,
            resolver,
            progress: RwLock::new(HashMap::new()),
            active: AtomicBool::new(false),
            workers: cfg.scanner.workers,
            interval_net: cfg.scanner.interval_net as i64,
            ping: PingSettings::from(&cfg.ping),
            metrics,
        })
    }

    pub fn start(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Live counters of a running scan: (addresses scanned, devices added).
    /// None means no scan of that network is in flight.
    pub async fn progress(&self, net_id: i64) -> Option<(u64, u64)> {
        self.progress.read().await.get(&net_id).map(|p| {
            (
                p.scanned.load(Ordering::Relaxed),
                p.added.load(Ordering::Relaxed),
            )
        })
    }

    /// Processes commands until the channel closes. A short ticker keeps the
    /// loop observing the stop flag even when no commands arrive.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<ScanCommand>) {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("scanner loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                cmd = commands.recv() => {
                    match cmd {
                        None => {
                            info!("command channel closed, scanner loop ends");
                            break;
                        }
                        Some(cmd) if !self.is_active() => {
                            debug!(?cmd, "scanner is stopped, command ignored");
                        }
                        Some(ScanCommand::ScanAll) => self.scan_all().await,
                        Some(ScanCommand::ScanOne(id)) => self.scan_one(id).await,
                    }
                }
            }
        }
    }

    async fn scan_all(self: &Arc<Self>) {
        let networks = {
            let mut store = match self.pool.borrow().await {
                Ok(handle) => handle,
                Err(err) => {
                    error!(error = %err, "cannot borrow store for scan-all");
                    return;
                }
            };
            match store.network_get_all() {
                Ok(networks) => networks,
                Err(err) => {
                    error!(error = %err, "cannot load networks");
                    return;
                }
            }
        };

        self.metrics.fleet_networks.set(networks.len() as f64);

        let now = now_unix();
        for net in networks {
            if !scan_due(&net, now, self.interval_net) {
                debug!(network = %net.addr, "scanned recently, skipping");
                continue;
            }
            let scanner = Arc::clone(self);
            tokio::spawn(async move { scanner.scan_network(net).await });
        }
    }

    async fn scan_one(self: &Arc<Self>, net_id: i64) {
        let net = {
            let mut store = match self.pool.borrow().await {
                Ok(handle) => handle,
                Err(err) => {
                    error!(error = %err, "cannot borrow store for scan-one");
                    return;
                }
            };
            match store.network_get_by_id(net_id) {
                Ok(Some(net)) => net,
                Ok(None) => {
                    warn!(net_id, "scan requested for unknown network");
                    return;
                }
                Err(err) => {
                    error!(net_id, error = %err, "cannot load network");
                    return;
                }
            }
        };

        let scanner = Arc::clone(self);
        tokio::spawn(async move { scanner.scan_network(net).await });
    }

    /// Sweeps one network. At most one scan per network runs at a time; the
    /// progress entry doubles as the in-flight marker.
    async fn scan_network(self: Arc<Self>, mut net: Network) {
        let prog = Arc::new(ScanProgress::default());
        {
            let mut in_flight = self.progress.write().await;
            if in_flight.contains_key(&net.id) {
                info!(network = %net.addr, "scan already in flight");
                return;
            }
            in_flight.insert(net.id, Arc::clone(&prog));
        }

        info!(network = %net.addr, size = net.addr.size(), "scan started");
        self.metrics.fleet_scans_started_total.inc();

        self.sweep(&net, &prog).await;
        self.progress.write().await.remove(&net.id);

        info!(
            network = %net.addr,
            scanned = prog.scanned.load(Ordering::Relaxed),
            added = prog.added.load(Ordering::Relaxed),
            "scan finished"
        );
        match self.pool.borrow().await {
            Ok(mut store) => {
                if let Err(err) = store.network_update_scan_stamp(&mut net, now_unix()) {
                    warn!(network = %net.addr, error = %err, "cannot stamp scan time");
                }
            }
            Err(err) => {
                warn!(network = %net.addr, error = %err, "cannot borrow store to stamp scan time");
            }
        }
    }

    async fn sweep(&self, net: &Network, prog: &Arc<ScanProgress>) {
        let (cand_tx, cand_rx) = mpsc::channel::<Device>(self.workers);
        let collector = tokio::spawn(collect_candidates(
            self.pool.clone(),
            cand_rx,
            Arc::clone(&self.metrics),
        ));

        {
            let mut workers = stream::iter(net.addr.addresses())
                .map(|ip| {
                    let cand_tx = cand_tx.clone();
                    let prog = Arc::clone(prog);
                    async move { self.scan_addr(net.id, ip, prog, cand_tx).await }
                })
                .buffer_unordered(self.workers);

            while workers.next().await.is_some() {}
        }

        // The candidate channel closes once the last worker clone is gone.
        drop(cand_tx);
        if collector.await.is_err() {
            warn!(network = %net.addr, "collector task died");
        }
    }

    async fn scan_addr(
        &self,
        net_id: i64,
        ip: Ipv4Addr,
        prog: Arc<ScanProgress>,
        cand_tx: mpsc::Sender<Device>,
    ) {
        prog.scanned.fetch_add(1, Ordering::Relaxed);
        let addr = IpAddr::V4(ip);

        if !ping_addr(addr, self.ping).await {
            return;
        }

        let Some(name) = self.resolve_name(addr).await else {
            debug!(%addr, "reachable but unnamed, dropping");
            return;
        };

        let candidate = Device {
            id: 0,
            net_id,
            name,
            addr: vec![addr],
            os: String::new(),
            bighead: true,
            last_seen: 0,
        };

        if cand_tx.send(candidate).await.is_ok() {
            prog.added.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn resolve_name(&self, addr: IpAddr) -> Option<String> {
        match self.resolver.reverse_lookup(addr).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(err) => {
                debug!(%addr, error = %err, "reverse lookup failed");
                None
            }
        }
    }
}

fn scan_due(net: &Network, now: i64, interval_net: i64) -> bool {
    net.last_scan + interval_net <= now
}

/// Drains the candidate channel into the store. Known names are skipped, a
/// failed insert costs only that candidate. Two scans racing on the same
/// name are settled by the unique-name constraint: one insert wins, the
/// other is logged and dropped.
async fn collect_candidates(pool: Pool, mut candidates: mpsc::Receiver<Device>, metrics: Arc<Metrics>) {
    let mut store = match pool.borrow().await {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "collector cannot borrow a store handle");
            return;
        }
    };

    while let Some(mut dev) = candidates.recv().await {
        match store.device_get_by_name(&dev.name) {
            Ok(Some(mut known)) => {
                // A known name is not re-admitted, but a new lease shows up
                // as an address the record does not have yet.
                let fresh: Vec<IpAddr> = dev
                    .addr
                    .iter()
                    .filter(|a| !known.addr.contains(a))
                    .copied()
                    .collect();
                if fresh.is_empty() {
                    debug!(device = %dev.name, "already known, skipping");
                } else {
                    known.addr.extend(fresh);
                    if let Err(err) = store.device_update_addr(&mut known) {
                        warn!(device = %dev.name, error = %err, "cannot refresh address list");
                    } else {
                        debug!(device = %dev.name, addr = ?known.addr, "address list refreshed");
                    }
                }
            }
            Ok(None) => match store.device_add(&mut dev) {
                Ok(()) => {
                    info!(device = %dev.name, addr = ?dev.addr, "new device admitted");
                    metrics.fleet_hosts_discovered_total.inc();
                }
                Err(err) => {
                    warn!(device = %dev.name, error = %err, "cannot admit device");
                }
            },
            Err(err) => {
                warn!(device = %dev.name, error = %err, "lookup failed, candidate dropped");
            }
        }
    }
}
