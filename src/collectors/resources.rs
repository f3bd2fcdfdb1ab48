use crate::activation::Lifecycle;
use crate::collectors::PeriodicTask;
use crate::command::{split_argv, CommandError, CommandRunner};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::state::{CpuStatus, LatestState, MemoryStatus, NetworkStatus, ResourceStatus};
use async_trait::async_trait;
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{CpuExt, NetworkExt, NetworksExt, System, SystemExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

// cumulative ticks over all cores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceRates {
    pub name: String,
    pub upload_bytes_per_sec: f64,
    pub download_bytes_per_sec: f64,
}

pub trait HostCounters: Send + Sync {
    fn cpu_times(&mut self) -> Option<CpuTimes>;
    // percent since the previous call, used when tick counters are unavailable
    fn cpu_usage(&mut self) -> Option<f64> {
        None
    }
    fn memory(&mut self) -> MemoryCounters;
    fn interfaces(&mut self) -> Vec<InterfaceRates>;
}

pub struct SysinfoCounters {
    system: System,
    last_network_refresh: Instant,
}

impl SysinfoCounters {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_networks_list();
        Self {
            system,
            last_network_refresh: Instant::now(),
        }
    }
}

impl Default for SysinfoCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCounters for SysinfoCounters {
    fn cpu_times(&mut self) -> Option<CpuTimes> {
        read_cpu_times()
    }

    fn cpu_usage(&mut self) -> Option<f64> {
        self.system.refresh_cpu();
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return None;
        }
        let sum: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
        Some((sum / cpus.len() as f32) as f64)
    }

    fn memory(&mut self) -> MemoryCounters {
        self.system.refresh_memory();
        MemoryCounters {
            total_bytes: self.system.total_memory(),
            free_bytes: self.system.free_memory(),
        }
    }

    fn interfaces(&mut self) -> Vec<InterfaceRates> {
        self.system.refresh_networks();
        let elapsed = self.last_network_refresh.elapsed().as_secs_f64().max(0.001);
        self.last_network_refresh = Instant::now();

        let mut rates: Vec<InterfaceRates> = self
            .system
            .networks()
            .iter()
            .map(|(iface, data)| InterfaceRates {
                name: iface.to_string(),
                upload_bytes_per_sec: data.transmitted() as f64 / elapsed,
                download_bytes_per_sec: data.received() as f64 / elapsed,
            })
            .collect();
        rates.sort_by(|a, b| a.name.cmp(&b.name));
        rates
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    let text = fs::read_to_string("/proc/stat").ok()?;
    parse_proc_stat(&text)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times() -> Option<CpuTimes> {
    None
}

// idle includes iowait
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub fn parse_proc_stat(text: &str) -> Option<CpuTimes> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|f| f.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }
    Some(CpuTimes {
        total: fields.iter().sum(),
        idle: fields[3] + fields.get(4).copied().unwrap_or(0),
    })
}

pub fn cpu_utilization(previous: Option<CpuTimes>, current: CpuTimes) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let total = current.total.saturating_sub(previous.total);
    if total == 0 {
        return 0.0;
    }
    let idle = current.idle.saturating_sub(previous.idle).min(total);
    (100.0 * (1.0 - idle as f64 / total as f64)).clamp(0.0, 100.0)
}

// `<label>:  +NN.N°C  (high = ...)`
pub fn parse_temperature(output: &str, label: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix(label)?.trim_start();
        let reading = rest.strip_prefix(':')?.split_whitespace().next()?;
        reading
            .trim_start_matches('+')
            .strip_suffix("°C")?
            .parse()
            .ok()
    })
}

fn pick_interface(interfaces: &[InterfaceRates], preferred: Option<&str>) -> Option<InterfaceRates> {
    if let Some(name) = preferred {
        if let Some(found) = interfaces.iter().find(|i| i.name == name) {
            return Some(found.clone());
        }
    }
    interfaces
        .iter()
        .find(|i| !is_loopback(&i.name))
        .or_else(|| interfaces.first())
        .cloned()
}

fn is_loopback(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0") || name.eq_ignore_ascii_case("loopback")
}

pub struct ResourceReader {
    runner: Arc<dyn CommandRunner>,
    counters: Box<dyn HostCounters>,
    sensors_command: Vec<String>,
    temperature_label: String,
    network_interface: Option<String>,
    previous_cpu: Option<CpuTimes>,
    metrics: Arc<Metrics>,
}

impl ResourceReader {
    pub fn new(
        cfg: &Config,
        runner: Arc<dyn CommandRunner>,
        counters: Box<dyn HostCounters>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            runner,
            counters,
            sensors_command: cfg.resources.sensors_command.clone(),
            temperature_label: cfg.resources.temperature_label.clone(),
            network_interface: cfg.resources.network_interface.clone(),
            previous_cpu: None,
            metrics,
        }
    }

    pub fn reset(&mut self) {
        self.previous_cpu = None;
    }

    pub async fn read(&mut self) -> Option<ResourceStatus> {
        let temperature = match self.read_temperature().await {
            Ok(Some(value)) => value,
            Ok(None) => {
                self.metrics.inc_sampler_error("resources");
                warn!(label = %self.temperature_label, "temperature label missing from sensors output");
                return None;
            }
            Err(err) => {
                self.metrics.inc_sampler_error("resources");
                warn!(error = %err, "failed to read sensors");
                return None;
            }
        };

        let interfaces = self.counters.interfaces();
        let Some(network) = pick_interface(&interfaces, self.network_interface.as_deref()) else {
            self.metrics.inc_sampler_error("resources");
            warn!("no network interfaces reported");
            return None;
        };

        let current = self.counters.cpu_times();
        let utilization_percent = match current {
            Some(now) => cpu_utilization(self.previous_cpu, now),
            None => self
                .counters
                .cpu_usage()
                .filter(|usage| usage.is_finite())
                .map(|usage| usage.clamp(0.0, 100.0))
                .unwrap_or(0.0),
        };
        self.previous_cpu = current;

        let memory = self.counters.memory();
        Some(ResourceStatus {
            cpu: CpuStatus {
                utilization_percent,
                temperature_celsius: temperature,
            },
            memory: MemoryStatus {
                total_bytes: memory.total_bytes,
                free_bytes: memory.free_bytes,
                used_bytes: memory.total_bytes.saturating_sub(memory.free_bytes),
            },
            network: NetworkStatus {
                interface_name: network.name,
                upload_bytes_per_sec: network.upload_bytes_per_sec,
                download_bytes_per_sec: network.download_bytes_per_sec,
            },
        })
    }

    async fn read_temperature(&self) -> Result<Option<f64>, CommandError> {
        let (program, args) = split_argv(&self.sensors_command);
        let output = self.runner.run(program, args).await?;
        Ok(parse_temperature(&output, &self.temperature_label))
    }
}

pub struct ResourceSampler {
    reader: Arc<Mutex<ResourceReader>>,
    // consumed by the next tick, which already holds the reader
    reset_pending: Arc<AtomicBool>,
    state: Arc<LatestState>,
    task: PeriodicTask,
}

impl ResourceSampler {
    pub fn new(cfg: &Config, reader: ResourceReader, state: Arc<LatestState>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
            reset_pending: Arc::new(AtomicBool::new(false)),
            state,
            task: PeriodicTask::new("resources", cfg.resources.interval),
        }
    }
}

#[async_trait]
impl Lifecycle for ResourceSampler {
    fn name(&self) -> &'static str {
        "resource sampler"
    }

    async fn start(&self) -> bool {
        if self.task.is_running().await {
            return false;
        }
        self.reset_pending.store(true, Ordering::SeqCst);

        let reader = self.reader.clone();
        let reset_pending = self.reset_pending.clone();
        let state = self.state.clone();
        let started = self
            .task
            .start(move || {
                let reader = reader.clone();
                let reset_pending = reset_pending.clone();
                let state = state.clone();
                async move {
                    let mut reader = reader.lock().await;
                    if reset_pending.swap(false, Ordering::SeqCst) {
                        reader.reset();
                    }
                    if let Some(status) = reader.read().await {
                        state.resources.store(Arc::new(status));
                    }
                }
            })
            .await;
        if started {
            info!("resource sampler started");
        }
        started
    }

    async fn stop(&self) -> bool {
        let stopped = self.task.stop().await;
        if stopped {
            info!("resource sampler stopped");
        }
        stopped
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::collectors::disks::tests::TableRunner;
    use std::collections::VecDeque;
    use std::time::Duration;

    const SENSORS: &str = "coretemp-isa-0000\nAdapter: ISA adapter\nPackage id 0:  +47.0°C  (high = +80.0°C, crit = +100.0°C)\nCore 0:        +45.0°C  (high = +80.0°C, crit = +100.0°C)\n";

    pub(crate) struct FakeCounters {
        pub(crate) cpu: VecDeque<CpuTimes>,
        pub(crate) usage: Option<f64>,
        pub(crate) interfaces: Vec<InterfaceRates>,
    }

    impl FakeCounters {
        pub(crate) fn new(cpu: &[(u64, u64)]) -> Self {
            Self {
                cpu: cpu
                    .iter()
                    .map(|&(total, idle)| CpuTimes { total, idle })
                    .collect(),
                usage: None,
                interfaces: vec![
                    rates("lo", 10.0, 10.0),
                    rates("eth0", 100.0, 200.0),
                ],
            }
        }
    }

    impl HostCounters for FakeCounters {
        fn cpu_times(&mut self) -> Option<CpuTimes> {
            self.cpu.pop_front()
        }

        fn cpu_usage(&mut self) -> Option<f64> {
            self.usage
        }

        fn memory(&mut self) -> MemoryCounters {
            MemoryCounters {
                total_bytes: 8_000,
                free_bytes: 3_000,
            }
        }

        fn interfaces(&mut self) -> Vec<InterfaceRates> {
            self.interfaces.clone()
        }
    }

    fn rates(name: &str, up: f64, down: f64) -> InterfaceRates {
        InterfaceRates {
            name: name.to_string(),
            upload_bytes_per_sec: up,
            download_bytes_per_sec: down,
        }
    }

    fn reader(runner: TableRunner, counters: FakeCounters) -> ResourceReader {
        ResourceReader::new(
            &Config::default(),
            Arc::new(runner),
            Box::new(counters),
            Metrics::new().expect("metrics init"),
        )
    }

    #[test]
    fn utilization_is_zero_without_baseline() {
        let now = CpuTimes {
            total: 1_000,
            idle: 400,
        };
        assert_eq!(cpu_utilization(None, now), 0.0);
        assert_eq!(cpu_utilization(Some(now), now), 0.0);
    }

    #[test]
    fn utilization_uses_tick_deltas() {
        let before = CpuTimes {
            total: 100,
            idle: 50,
        };
        let after = CpuTimes {
            total: 200,
            idle: 75,
        };
        assert_eq!(cpu_utilization(Some(before), after), 75.0);
    }

    #[test]
    fn utilization_stays_in_range() {
        let cases = [
            (CpuTimes { total: 0, idle: 0 }, CpuTimes { total: 0, idle: 0 }),
            (CpuTimes { total: 10, idle: 0 }, CpuTimes { total: 20, idle: 30 }),
            (CpuTimes { total: 500, idle: 400 }, CpuTimes { total: 100, idle: 50 }),
            (CpuTimes { total: 0, idle: 0 }, CpuTimes { total: 100, idle: 0 }),
            (CpuTimes { total: 7, idle: 3 }, CpuTimes { total: u64::MAX, idle: 3 }),
        ];
        for (before, after) in cases {
            let value = cpu_utilization(Some(before), after);
            assert!(!value.is_nan());
            assert!((0.0..=100.0).contains(&value), "{value} out of range");
        }
    }

    #[test]
    fn proc_stat_aggregate_line_is_parsed() {
        let text = "cpu  10 2 8 70 5 1 1 3 0 0\ncpu0 5 1 4 35 2 0 0 1 0 0\nintr 1\n";
        assert_eq!(
            parse_proc_stat(text),
            Some(CpuTimes {
                total: 100,
                idle: 75
            })
        );
        assert_eq!(parse_proc_stat("intr 1 2 3\n"), None);
    }

    #[test]
    fn temperature_requires_the_configured_label() {
        assert_eq!(parse_temperature(SENSORS, "Package id 0"), Some(47.0));
        assert_eq!(parse_temperature(SENSORS, "Core 0"), Some(45.0));
        let amd = "k10temp-pci-00c3\nTctl:         +45.1°C\n";
        assert_eq!(parse_temperature(amd, "Package id 0"), None);
        assert_eq!(parse_temperature(amd, "Tctl"), Some(45.1));
    }

    #[test]
    fn interface_selection_prefers_configured_then_non_loopback() {
        let all = vec![rates("eth0", 1.0, 1.0), rates("lo", 0.0, 0.0), rates("wlan0", 2.0, 2.0)];
        assert_eq!(pick_interface(&all, Some("wlan0")).map(|i| i.name), Some("wlan0".to_string()));
        assert_eq!(pick_interface(&all, Some("missing")).map(|i| i.name), Some("eth0".to_string()));
        let only_lo = vec![rates("lo", 0.0, 0.0)];
        assert_eq!(pick_interface(&only_lo, None).map(|i| i.name), Some("lo".to_string()));
        assert_eq!(pick_interface(&[], None), None);
    }

    #[tokio::test]
    async fn first_tick_reports_zero_then_measures() {
        let runner = TableRunner::default().answer("sensors", Ok(SENSORS));
        let mut reader = reader(runner, FakeCounters::new(&[(1_000, 900), (1_100, 950)]));

        let first = reader.read().await.expect("first tick");
        assert_eq!(first.cpu.utilization_percent, 0.0);
        assert_eq!(first.cpu.temperature_celsius, 47.0);
        assert_eq!(first.memory.used_bytes, 5_000);
        assert_eq!(first.network.interface_name, "eth0");
        assert_eq!(first.network.download_bytes_per_sec, 200.0);

        let second = reader.read().await.expect("second tick");
        assert_eq!(second.cpu.utilization_percent, 50.0);
    }

    #[tokio::test]
    async fn usage_fallback_without_tick_counters() {
        let runner = TableRunner::default().answer("sensors", Ok(SENSORS));
        let mut counters = FakeCounters::new(&[]);
        counters.usage = Some(37.5);
        let mut measured = reader(runner, counters);
        let status = measured.read().await.expect("tick");
        assert_eq!(status.cpu.utilization_percent, 37.5);

        let runner = TableRunner::default().answer("sensors", Ok(SENSORS));
        let mut counters = FakeCounters::new(&[]);
        counters.usage = Some(f64::NAN);
        let mut garbled = reader(runner, counters);
        assert_eq!(garbled.read().await.expect("tick").cpu.utilization_percent, 0.0);
    }

    #[tokio::test]
    async fn missing_temperature_skips_tick() {
        let runner = TableRunner::default().answer("sensors", Ok("acpitz-acpi-0\ntemp1: +27.8°C\n"));
        let mut reader = reader(runner, FakeCounters::new(&[(1_000, 900)]));
        assert_eq!(reader.read().await, None);
    }

    #[tokio::test]
    async fn missing_interfaces_skip_tick() {
        let runner = TableRunner::default().answer("sensors", Ok(SENSORS));
        let mut counters = FakeCounters::new(&[(1_000, 900)]);
        counters.interfaces.clear();
        let mut reader = reader(runner, counters);
        assert_eq!(reader.read().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_keeps_previous_status() {
        let state = LatestState::new();
        let previous = ResourceStatus {
            cpu: CpuStatus {
                utilization_percent: 12.0,
                temperature_celsius: 40.0,
            },
            ..ResourceStatus::default()
        };
        state.resources.store(Arc::new(previous.clone()));

        let runner = TableRunner::default().answer("sensors", Err("No sensors found!"));
        let sampler = ResourceSampler::new(
            &Config::default(),
            reader(runner, FakeCounters::new(&[])),
            state.clone(),
        );
        assert!(sampler.start().await);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(sampler.stop().await);

        assert_eq!(state.snapshot().resources, previous);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resets_cpu_baseline() {
        let state = LatestState::new();
        let runner = TableRunner::default().answer("sensors", Ok(SENSORS));
        let sampler = ResourceSampler::new(
            &Config::default(),
            reader(runner, FakeCounters::new(&[(100, 50), (200, 75), (10_000, 0)])),
            state.clone(),
        );

        sampler.start().await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(state.snapshot().resources.cpu.utilization_percent, 75.0);
        sampler.stop().await;

        sampler.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.snapshot().resources.cpu.utilization_percent, 0.0);
        sampler.stop().await;
    }

    struct SlowSensors {
        delay: Duration,
    }

    #[async_trait]
    impl CommandRunner for SlowSensors {
        async fn run(&self, _program: &str, _args: &[String]) -> Result<String, CommandError> {
            tokio::time::sleep(self.delay).await;
            Ok(SENSORS.to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restart_does_not_wait_for_inflight_tick() {
        let state = LatestState::new();
        let sampler = ResourceSampler::new(
            &Config::default(),
            ResourceReader::new(
                &Config::default(),
                Arc::new(SlowSensors {
                    delay: Duration::from_secs(8),
                }),
                Box::new(FakeCounters::new(&[(100, 50), (200, 75), (300, 100)])),
                Metrics::new().expect("metrics init"),
            ),
            state.clone(),
        );

        assert!(sampler.start().await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sampler.stop().await);

        let begun = tokio::time::Instant::now();
        assert!(sampler.start().await);
        assert!(begun.elapsed() < Duration::from_secs(1));

        // the restarted tick waits for the stale one, then starts a fresh baseline
        tokio::time::sleep(Duration::from_secs(17)).await;
        let cpu = state.snapshot().resources.cpu;
        assert_eq!(cpu.temperature_celsius, 47.0);
        assert_eq!(cpu.utilization_percent, 0.0);
        assert!(sampler.stop().await);
    }
}
