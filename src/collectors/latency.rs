use crate::activation::Lifecycle;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::state::{LatencySlot, LatestState};
use async_trait::async_trait;
use regex::Regex;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Split};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, trace, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

fn sequence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"icmp_seq=(\d+)").expect("sequence pattern is valid"))
}

fn rtt_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"time=(\d+(?:\.\d+)?) ms").expect("rtt pattern is valid"))
}

pub fn parse_sequence(line: &str) -> Option<u64> {
    sequence_pattern()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn parse_rtt(line: &str) -> Option<f64> {
    rtt_pattern()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LineReading {
    pub sequence: Option<u64>,
    // skipped since the previous sequence number
    pub missed: u64,
    pub rtt: Option<f64>,
}

impl LineReading {
    pub fn is_sample(&self) -> bool {
        self.sequence.is_some() || self.rtt.is_some()
    }
}

// one per probe process, so a respawn starts again from 0
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_sequence: u64,
}

impl SequenceTracker {
    pub fn feed(&mut self, line: &str) -> LineReading {
        let sequence = parse_sequence(line);
        let missed = match sequence {
            Some(current) => {
                let missed = current.saturating_sub(self.last_sequence).saturating_sub(1);
                self.last_sequence = current;
                missed
            }
            None => 0,
        };
        LineReading {
            sequence,
            missed,
            rtt: parse_rtt(line),
        }
    }
}

#[async_trait]
pub trait ProbeProcess: Send {
    async fn next_line(&mut self) -> io::Result<Option<String>>;
    async fn wait(&mut self) -> Option<i32>;
    async fn terminate(&mut self);
}

pub trait ProbeLauncher: Send + Sync {
    fn launch(&self, target: &str) -> io::Result<Box<dyn ProbeProcess>>;
}

#[derive(Debug, Clone)]
pub struct PingLauncher {
    program: String,
    args: Vec<String>,
}

impl PingLauncher {
    pub fn new(cfg: &Config) -> Self {
        Self {
            program: cfg.ping.program.clone(),
            args: cfg.ping.args.clone(),
        }
    }
}

impl ProbeLauncher for PingLauncher {
    fn launch(&self, target: &str) -> io::Result<Box<dyn ProbeProcess>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "probe stdout not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            let host = target.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).split(b'\n');
                while let Ok(Some(line)) = next_lossy_line(&mut lines).await {
                    warn!(host = %host, line = %line, "probe stderr");
                }
            });
        }

        Ok(Box::new(ChildProbe {
            child,
            stdout: BufReader::new(stdout).split(b'\n'),
        }))
    }
}

// invalid UTF-8 is replaced rather than failing the whole stream
async fn next_lossy_line<R>(segments: &mut Split<R>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(raw) = segments.next_segment().await? else {
        return Ok(None);
    };
    let line = String::from_utf8_lossy(&raw);
    Ok(Some(line.trim_end_matches('\r').to_string()))
}

struct ChildProbe {
    child: Child,
    stdout: Split<BufReader<ChildStdout>>,
}

#[async_trait]
impl ProbeProcess for ChildProbe {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        next_lossy_line(&mut self.stdout).await
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(err) => {
                debug!(error = %err, "failed to wait for probe process");
                None
            }
        }
    }

    async fn terminate(&mut self) {
        if let Err(err) = self.child.start_kill() {
            debug!(error = %err, "probe process already gone");
        }
        let _ = self.child.wait().await;
    }
}

/// Every value written to a latency slot, in order. `None` marks a gap.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyUpdate {
    pub target: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

enum RunEnd {
    Disabled,
    SampleCap,
    Exited,
    ReadFailed(io::Error),
}

struct TargetSupervisor {
    slot: Arc<LatencySlot>,
    launcher: Arc<dyn ProbeLauncher>,
    max_samples: u64,
    backoff: Backoff,
    updates: broadcast::Sender<LatencyUpdate>,
    metrics: Arc<Metrics>,
}

impl TargetSupervisor {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let host = self.slot.target().to_string();
        debug!(host = %host, "probe supervisor started");

        while !*stop.borrow() {
            let mut process = match self.launcher.launch(&host) {
                Ok(process) => process,
                Err(err) => {
                    let delay = self.backoff.next_delay();
                    warn!(host = %host, error = %err, retry_in = ?delay, "failed to start probe");
                    if stopped_within(&mut stop, delay).await {
                        break;
                    }
                    continue;
                }
            };
            self.metrics.inc_probe_spawn(&host);

            let (end, samples) = self.drive(process.as_mut(), &mut stop).await;
            match end {
                RunEnd::Disabled => {
                    process.terminate().await;
                    break;
                }
                RunEnd::SampleCap => {
                    process.terminate().await;
                    info!(host = %host, samples, "probe reached its sample cap, restarting");
                }
                RunEnd::Exited => {
                    let code = process.wait().await;
                    info!(host = %host, ?code, samples, "probe exited before its sample cap");
                }
                RunEnd::ReadFailed(err) => {
                    warn!(host = %host, error = %err, "failed to read probe output");
                    process.terminate().await;
                }
            }

            if samples > 0 {
                self.backoff.reset();
                continue;
            }
            let delay = self.backoff.next_delay();
            debug!(host = %host, retry_in = ?delay, "probe produced no samples");
            if stopped_within(&mut stop, delay).await {
                break;
            }
        }

        debug!(host = %host, "probe supervisor stopped");
    }

    async fn drive(
        &self,
        process: &mut dyn ProbeProcess,
        stop: &mut watch::Receiver<bool>,
    ) -> (RunEnd, u64) {
        let mut tracker = SequenceTracker::default();
        let mut samples = 0_u64;
        loop {
            let line = tokio::select! {
                _ = stop.changed() => return (RunEnd::Disabled, samples),
                line = process.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return (RunEnd::Exited, samples),
                Err(err) => return (RunEnd::ReadFailed(err), samples),
            };

            let reading = tracker.feed(&line);
            if !reading.is_sample() {
                trace!(host = %self.slot.target(), line = %line, "ignored probe line");
                continue;
            }
            self.record(reading);

            samples += 1;
            if samples >= self.max_samples {
                return (RunEnd::SampleCap, samples);
            }
        }
    }

    fn record(&self, reading: LineReading) {
        if reading.missed > 0 {
            self.metrics
                .add_probe_gaps(self.slot.target(), reading.missed);
            for _ in 0..reading.missed {
                self.publish(None);
            }
        }
        if let Some(rtt) = reading.rtt {
            self.publish(Some(rtt));
        }
    }

    fn publish(&self, value: Option<f64>) {
        self.slot.publish(value);
        let _ = self.updates.send(LatencyUpdate {
            target: self.slot.target().to_string(),
            value,
        });
    }
}

async fn stopped_within(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = stop.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

pub struct LatencyProber {
    targets: Vec<String>,
    launcher: Arc<dyn ProbeLauncher>,
    max_samples: u64,
    backoff_initial: Duration,
    backoff_max: Duration,
    state: Arc<LatestState>,
    updates: broadcast::Sender<LatencyUpdate>,
    metrics: Arc<Metrics>,
    enabled: Mutex<Option<watch::Sender<bool>>>,
}

impl LatencyProber {
    pub fn new(
        cfg: &Config,
        launcher: Arc<dyn ProbeLauncher>,
        state: Arc<LatestState>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            targets: cfg.ping_targets.clone(),
            launcher,
            max_samples: cfg.ping.max_samples,
            backoff_initial: cfg.ping.backoff_initial,
            backoff_max: cfg.ping.backoff_max,
            state,
            updates,
            metrics,
            enabled: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LatencyUpdate> {
        self.updates.subscribe()
    }
}

#[async_trait]
impl Lifecycle for LatencyProber {
    fn name(&self) -> &'static str {
        "latency prober"
    }

    async fn start(&self) -> bool {
        let mut enabled = self.enabled.lock().await;
        if enabled.is_some() {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let slots: Vec<Arc<LatencySlot>> = self
            .targets
            .iter()
            .map(|target| Arc::new(LatencySlot::new(target.clone())))
            .collect();
        self.state.latencies.store(Arc::new(slots.clone()));

        for slot in slots {
            let supervisor = TargetSupervisor {
                slot,
                launcher: self.launcher.clone(),
                max_samples: self.max_samples,
                backoff: Backoff::new(self.backoff_initial, self.backoff_max),
                updates: self.updates.clone(),
                metrics: self.metrics.clone(),
            };
            tokio::spawn(supervisor.run(stop_rx.clone()));
        }

        *enabled = Some(stop_tx);
        info!(targets = self.targets.len(), "latency prober started");
        true
    }

    async fn stop(&self) -> bool {
        let Some(stop_tx) = self.enabled.lock().await.take() else {
            return false;
        };
        let _ = stop_tx.send(true);
        info!("latency prober stopped");
        true
    }
}
