//! The top-level loop that drives all activity.
//!
//! Four tickers: scan-all commands to the scanner, probe sweeps over the
//! known devices, a short liveness sweep, and update-list queries. The three
//! device sweeps share one dispatch shape: a channel feeds a small pool of
//! workers, each of which borrows one store handle for its whole run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{Pool, PoolHandle};
use crate::metrics::Metrics;
use crate::model::{now_unix, Device};
use crate::ping::{ping_device, PingSettings};
use crate::probe::{Probe, ProbeError};
use crate::scanner::ScanCommand;

// Workers per device sweep.
const PROBE_WORKERS: usize = 8;
// Liveness sweeps run on a fixed short cadence.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepKind {
    Probe,
    Liveness,
    Updates,
}

pub struct Scheduler {
    pool: Pool,
    probe: Arc<Probe>,
    scanner_cmd: mpsc::Sender<ScanCommand>,
    interval_net: Duration,
    interval_dev: Duration,
    interval_updates: Duration,
    ping: PingSettings,
    active: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    pub fn new(
        pool: Pool,
        probe: Arc<Probe>,
        scanner_cmd: mpsc::Sender<ScanCommand>,
        cfg: &Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            probe,
            scanner_cmd,
            interval_net: cfg.interval_net(),
            interval_dev: cfg.interval_dev(),
            interval_updates: cfg.interval_updates(),
            ping: PingSettings::from(&cfg.ping),
            active: AtomicBool::new(true),
            metrics,
        }
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut t_net = tokio::time::interval(self.interval_net);
        let mut t_dev = tokio::time::interval(self.interval_dev);
        let mut t_live = tokio::time::interval(LIVENESS_INTERVAL);
        let mut t_upd = tokio::time::interval(self.interval_updates);
        for t in [&mut t_net, &mut t_dev, &mut t_live, &mut t_upd] {
            t.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        info!(
            net = ?self.interval_net,
            dev = ?self.interval_dev,
            live = ?LIVENESS_INTERVAL,
            updates = ?self.interval_updates,
            "scheduler started"
        );

        loop {
            if !self.is_active() {
                info!("scheduler stopped");
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("scheduler received shutdown");
                    break;
                }
                _ = t_net.tick() => {
                    if let Err(err) = self.scanner_cmd.send(ScanCommand::ScanAll).await {
                        error!(error = %err, "cannot send scan-all to scanner");
                    }
                }
                _ = t_dev.tick() => self.sweep(SweepKind::Probe).await,
                _ = t_live.tick() => self.sweep(SweepKind::Liveness).await,
                _ = t_upd.tick() => self.sweep(SweepKind::Updates).await,
            }
        }
    }

    /// Loads all devices and fans them out over [`PROBE_WORKERS`] workers.
    /// The dispatcher closes the channel when every device is enqueued;
    /// workers drain it and finish.
    async fn sweep(self: &Arc<Self>, kind: SweepKind) {
        let devices = {
            let mut store = match self.pool.borrow().await {
                Ok(handle) => handle,
                Err(err) => {
                    error!(?kind, error = %err, "cannot borrow store for sweep");
                    return;
                }
            };
            match store.device_get_all(false) {
                Ok(devices) => devices,
                Err(err) => {
                    error!(?kind, error = %err, "cannot load devices");
                    return;
                }
            }
        };

        if devices.is_empty() {
            debug!(?kind, "no devices to sweep");
            return;
        }

        self.metrics.fleet_devices.set(devices.len() as f64);
        debug!(?kind, count = devices.len(), "sweep started");

        let (tx, rx) = mpsc::channel::<Device>(1);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(PROBE_WORKERS);
        for _ in 0..PROBE_WORKERS {
            let scheduler = Arc::clone(self);
            let rx = Arc::clone(&rx);
            workers.push(tokio::spawn(async move {
                scheduler.worker(kind, rx).await;
            }));
        }

        for dev in devices {
            if tx.send(dev).await.is_err() {
                break;
            }
        }
        drop(tx);

        for worker in workers {
            let _ = worker.await;
        }
        debug!(?kind, "sweep finished");
    }

    async fn worker(&self, kind: SweepKind, rx: Arc<Mutex<mpsc::Receiver<Device>>>) {
        let mut store = match self.pool.borrow().await {
            Ok(handle) => handle,
            Err(err) => {
                error!(?kind, error = %err, "worker cannot borrow a store handle");
                return;
            }
        };

        loop {
            let dev = { rx.lock().await.recv().await };
            let Some(mut dev) = dev else { break };

            match kind {
                SweepKind::Liveness => self.check_liveness(&mut dev, &mut store).await,
                SweepKind::Probe => self.probe_device(&mut dev, &mut store).await,
                SweepKind::Updates => self.query_updates(&mut dev, &mut store).await,
            }
        }
    }

    async fn check_liveness(&self, dev: &mut Device, store: &mut PoolHandle) {
        if !ping_device(dev, self.ping).await {
            debug!(device = %dev.name, "no echo reply");
            return;
        }

        self.metrics.fleet_liveness_hits_total.inc();
        if let Err(err) = store.device_update_last_seen(dev, now_unix()) {
            warn!(device = %dev.name, error = %err, "cannot update last_seen");
        }
    }

    async fn probe_device(&self, dev: &mut Device, store: &mut PoolHandle) {
        if !dev.bighead {
            debug!(device = %dev.name, "not a bighead, skipping");
            return;
        }

        if dev.os.is_empty() {
            match self.probe.identify_os(dev).await {
                Ok(os) => {
                    info!(device = %dev.name, os = %os, "device identified");
                    if let Err(err) = store.device_update_os(dev, &os) {
                        warn!(device = %dev.name, error = %err, "cannot persist os");
                    }
                }
                Err(err) => {
                    self.handle_probe_error(dev, "identify", &err).await;
                    return;
                }
            }
        }

        match self.probe.query_load_avg(dev).await {
            Ok(mut sample) => {
                self.metrics.inc_probe_sample("load");
                if let Err(err) = store.uptime_add(&mut sample) {
                    warn!(device = %dev.name, error = %err, "cannot persist load sample");
                }
            }
            Err(err) => {
                self.handle_probe_error(dev, "load", &err).await;
                return;
            }
        }

        match self.probe.query_disk_free(dev).await {
            Ok(mut record) => {
                self.metrics.inc_probe_sample("disk_free");
                if let Err(err) = store.info_add(&mut record) {
                    warn!(device = %dev.name, error = %err, "cannot persist disk-free sample");
                }
            }
            Err(err) => {
                self.handle_probe_error(dev, "disk_free", &err).await;
            }
        }
    }

    async fn query_updates(&self, dev: &mut Device, store: &mut PoolHandle) {
        if !dev.bighead {
            return;
        }
        if dev.os.is_empty() {
            debug!(device = %dev.name, "os not identified yet, skipping update query");
            return;
        }

        match self.probe.query_updates(dev).await {
            Ok(mut updates) => {
                self.metrics.inc_probe_sample("updates");
                info!(
                    device = %dev.name,
                    pending = updates.available.len(),
                    "update query finished"
                );
                if let Err(err) = store.updates_add(&mut updates) {
                    warn!(device = %dev.name, error = %err, "cannot persist update set");
                }
            }
            Err(err) => self.handle_probe_error(dev, "updates", &err).await,
        }
    }

    /// An offline device just yields no sample this cycle; a remote exec
    /// failure additionally evicts the cached client so the next cycle
    /// starts from a fresh connection.
    async fn handle_probe_error(&self, dev: &Device, kind: &str, err: &ProbeError) {
        self.metrics.inc_probe_error(kind);
        match err {
            ProbeError::Offline => {
                debug!(device = %dev.name, kind, "device offline, no sample");
            }
            ProbeError::Remote { .. } => {
                warn!(device = %dev.name, kind, error = %err, "remote command failed, evicting client");
                self.probe.disconnect(dev.id).await;
            }
            _ => {
                warn!(device = %dev.name, kind, error = %err, "probe failed");
            }
        }
    }
}
