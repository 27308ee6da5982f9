use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub fleet_scans_started_total: Counter,
    pub fleet_hosts_discovered_total: Counter,
    pub fleet_probe_samples_total: CounterVec,
    pub fleet_probe_errors_total: CounterVec,
    pub fleet_liveness_hits_total: Counter,
    pub fleet_store_retries_total: Counter,
    pub fleet_scrape_count_total: Counter,
    pub fleet_devices: Gauge,
    pub fleet_networks: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let fleet_scans_started_total = Counter::with_opts(opts!(
            "fleet_scans_started_total",
            "Network scans started"
        ))?;
        let fleet_hosts_discovered_total = Counter::with_opts(opts!(
            "fleet_hosts_discovered_total",
            "Devices admitted by the scanner"
        ))?;
        let fleet_probe_samples_total = CounterVec::new(
            opts!(
                "fleet_probe_samples_total",
                "Samples collected from devices, by kind"
            ),
            &["kind"],
        )?;
        let fleet_probe_errors_total = CounterVec::new(
            opts!(
                "fleet_probe_errors_total",
                "Failed probe operations, by kind"
            ),
            &["kind"],
        )?;
        let fleet_liveness_hits_total = Counter::with_opts(opts!(
            "fleet_liveness_hits_total",
            "Devices that answered a liveness sweep"
        ))?;
        let fleet_store_retries_total = Counter::with_opts(opts!(
            "fleet_store_retries_total",
            "Transient busy/locked database errors that were retried"
        ))?;
        let fleet_scrape_count_total = Counter::with_opts(opts!(
            "fleet_scrape_count_total",
            "Scrapes of the /metrics endpoint"
        ))?;
        let fleet_devices = Gauge::with_opts(opts!("fleet_devices", "Known devices"))?;
        let fleet_networks = Gauge::with_opts(opts!("fleet_networks", "Configured networks"))?;

        registry.register(Box::new(fleet_scans_started_total.clone()))?;
        registry.register(Box::new(fleet_hosts_discovered_total.clone()))?;
        registry.register(Box::new(fleet_probe_samples_total.clone()))?;
        registry.register(Box::new(fleet_probe_errors_total.clone()))?;
        registry.register(Box::new(fleet_liveness_hits_total.clone()))?;
        registry.register(Box::new(fleet_store_retries_total.clone()))?;
        registry.register(Box::new(fleet_scrape_count_total.clone()))?;
        registry.register(Box::new(fleet_devices.clone()))?;
        registry.register(Box::new(fleet_networks.clone()))?;

        Ok(Arc::new(Self {
            registry,
            fleet_scans_started_total,
            fleet_hosts_discovered_total,
            fleet_probe_samples_total,
            fleet_probe_errors_total,
            fleet_liveness_hits_total,
            fleet_store_retries_total,
            fleet_scrape_count_total,
            fleet_devices,
            fleet_networks,
        }))
    }

    pub fn inc_probe_sample(&self, kind: &str) {
        self.fleet_probe_samples_total.with_label_values(&[kind]).inc();
    }

    pub fn inc_probe_error(&self, kind: &str) {
        self.fleet_probe_errors_total.with_label_values(&[kind]).inc();
    }

    pub fn inc_scrape_count(&self) {
        self.fleet_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.fleet_scans_started_total.inc();
        metrics.fleet_store_retries_total.inc();
        metrics.inc_probe_sample("load");
        metrics.inc_probe_error("updates");

        let text = metrics.encode_metrics().unwrap();
        assert!(text.contains("fleet_scans_started_total"));
        assert!(text.contains("fleet_store_retries_total"));
        assert!(text.contains("fleet_probe_samples_total"));
        assert!(text.contains("fleet_probe_errors_total"));
    }
}
