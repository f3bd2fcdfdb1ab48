use crate::state::Snapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at: Instant,
    pub agent_observers: Gauge,
    pub agent_snapshots_broadcast_total: Counter,
    pub agent_sampler_errors_total: CounterVec,
    pub agent_probe_spawns_total: CounterVec,
    pub agent_probe_gaps_total: CounterVec,
    pub agent_latency_ms: GaugeVec,
    pub agent_disk_status: GaugeVec,
    pub agent_cpu_usage_percent: Gauge,
    pub agent_cpu_temperature_celsius: Gauge,
    pub agent_memory_used_bytes: Gauge,
    pub agent_memory_total_bytes: Gauge,
    pub agent_net_upload_bytes_per_sec: Gauge,
    pub agent_net_download_bytes_per_sec: Gauge,
    pub agent_uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let agent_observers =
            Gauge::with_opts(opts!("agent_observers", "Connected snapshot observers"))?;
        let agent_snapshots_broadcast_total = Counter::with_opts(opts!(
            "agent_snapshots_broadcast_total",
            "Snapshots published to observers"
        ))?;
        let agent_sampler_errors_total = CounterVec::new(
            opts!(
                "agent_sampler_errors_total",
                "Failed or degraded sampler ticks by sampler"
            ),
            &["sampler"],
        )?;
        let agent_probe_spawns_total = CounterVec::new(
            opts!("agent_probe_spawns_total", "Probe processes started by target"),
            &["target"],
        )?;
        let agent_probe_gaps_total = CounterVec::new(
            opts!(
                "agent_probe_gaps_total",
                "Probe sequence numbers detected as missing by target"
            ),
            &["target"],
        )?;
        let agent_latency_ms = GaugeVec::new(
            opts!("agent_latency_ms", "Most recent round-trip time by target"),
            &["target"],
        )?;
        let agent_disk_status = GaugeVec::new(
            opts!(
                "agent_disk_status",
                "Set to 1 for the current power state of each device"
            ),
            &["device", "status"],
        )?;
        let agent_cpu_usage_percent = Gauge::with_opts(opts!(
            "agent_cpu_usage_percent",
            "CPU utilization in percent (0..100)"
        ))?;
        let agent_cpu_temperature_celsius = Gauge::with_opts(opts!(
            "agent_cpu_temperature_celsius",
            "CPU package temperature in Celsius"
        ))?;
        let agent_memory_used_bytes =
            Gauge::with_opts(opts!("agent_memory_used_bytes", "Used memory in bytes"))?;
        let agent_memory_total_bytes =
            Gauge::with_opts(opts!("agent_memory_total_bytes", "Total memory in bytes"))?;
        let agent_net_upload_bytes_per_sec = Gauge::with_opts(opts!(
            "agent_net_upload_bytes_per_sec",
            "Transmit rate of the sampled interface"
        ))?;
        let agent_net_download_bytes_per_sec = Gauge::with_opts(opts!(
            "agent_net_download_bytes_per_sec",
            "Receive rate of the sampled interface"
        ))?;
        let agent_uptime_seconds =
            Gauge::with_opts(opts!("agent_uptime_seconds", "Agent uptime in seconds"))?;

        register(&registry, &agent_observers)?;
        register(&registry, &agent_snapshots_broadcast_total)?;
        register(&registry, &agent_sampler_errors_total)?;
        register(&registry, &agent_probe_spawns_total)?;
        register(&registry, &agent_probe_gaps_total)?;
        register(&registry, &agent_latency_ms)?;
        register(&registry, &agent_disk_status)?;
        register(&registry, &agent_cpu_usage_percent)?;
        register(&registry, &agent_cpu_temperature_celsius)?;
        register(&registry, &agent_memory_used_bytes)?;
        register(&registry, &agent_memory_total_bytes)?;
        register(&registry, &agent_net_upload_bytes_per_sec)?;
        register(&registry, &agent_net_download_bytes_per_sec)?;
        register(&registry, &agent_uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at: Instant::now(),
            agent_observers,
            agent_snapshots_broadcast_total,
            agent_sampler_errors_total,
            agent_probe_spawns_total,
            agent_probe_gaps_total,
            agent_latency_ms,
            agent_disk_status,
            agent_cpu_usage_percent,
            agent_cpu_temperature_celsius,
            agent_memory_used_bytes,
            agent_memory_total_bytes,
            agent_net_upload_bytes_per_sec,
            agent_net_download_bytes_per_sec,
            agent_uptime_seconds,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &Snapshot) {
        self.agent_latency_ms.reset();
        for sample in &snapshot.latencies {
            if let Some(value) = sample.last_value {
                self.agent_latency_ms
                    .with_label_values(&[sample.target.as_str()])
                    .set(value);
            }
        }

        self.agent_disk_status.reset();
        for disk in &snapshot.disks {
            self.agent_disk_status
                .with_label_values(&[disk.name.as_str(), disk.status.as_str()])
                .set(1.0);
        }

        let resources = &snapshot.resources;
        self.agent_cpu_usage_percent
            .set(resources.cpu.utilization_percent);
        self.agent_cpu_temperature_celsius
            .set(resources.cpu.temperature_celsius);
        self.agent_memory_used_bytes
            .set(resources.memory.used_bytes as f64);
        self.agent_memory_total_bytes
            .set(resources.memory.total_bytes as f64);
        self.agent_net_upload_bytes_per_sec
            .set(resources.network.upload_bytes_per_sec);
        self.agent_net_download_bytes_per_sec
            .set(resources.network.download_bytes_per_sec);
    }

    pub fn set_observers(&self, count: usize) {
        self.agent_observers.set(count as f64);
    }

    pub fn inc_snapshot_broadcast(&self) {
        self.agent_snapshots_broadcast_total.inc();
    }

    pub fn inc_sampler_error(&self, sampler: &str) {
        self.agent_sampler_errors_total
            .with_label_values(&[sampler])
            .inc();
    }

    pub fn inc_probe_spawn(&self, target: &str) {
        self.agent_probe_spawns_total
            .with_label_values(&[target])
            .inc();
    }

    pub fn add_probe_gaps(&self, target: &str, missed: u64) {
        self.agent_probe_gaps_total
            .with_label_values(&[target])
            .inc_by(missed as f64);
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        self.agent_uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64());
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DiskState, DiskStatus, LatencySample, ResourceStatus};

    fn encoded(metrics: &Metrics) -> String {
        String::from_utf8(metrics.encode_metrics().expect("encodes")).expect("utf8")
    }

    #[test]
    fn snapshot_values_are_exported() {
        let metrics = Metrics::new().expect("metrics init");
        let snapshot = Snapshot {
            disks: vec![DiskStatus {
                name: "/dev/sda".to_string(),
                status: DiskState::Standby,
                error_detail: None,
            }],
            latencies: vec![
                LatencySample {
                    target: "a.test".to_string(),
                    last_value: Some(9.5),
                },
                LatencySample {
                    target: "gap.test".to_string(),
                    last_value: None,
                },
            ],
            resources: ResourceStatus::default(),
        };
        metrics.update_from_snapshot(&snapshot);

        let text = encoded(&metrics);
        assert!(text.contains("agent_latency_ms{target=\"a.test\"} 9.5"));
        assert!(!text.contains("gap.test"));
        assert!(text.contains("agent_disk_status{device=\"/dev/sda\",status=\"standby\"} 1"));
        assert!(text.contains("agent_uptime_seconds"));
    }

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new().expect("metrics init");
        metrics.inc_sampler_error("disk");
        metrics.inc_sampler_error("disk");
        metrics.add_probe_gaps("a.test", 3);

        let text = encoded(&metrics);
        assert!(text.contains("agent_sampler_errors_total{sampler=\"disk\"} 2"));
        assert!(text.contains("agent_probe_gaps_total{target=\"a.test\"} 3"));
    }
}
