use crate::activation::Lifecycle;
use crate::collectors::PeriodicTask;
use crate::command::{split_argv, CommandError, CommandRunner};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::state::{DiskState, DiskStatus, LatestState};
use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

const NVME_PREFIX: &str = "/dev/nvme";

fn drive_state_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"drive state is:\s*([a-z]+)").expect("drive state pattern is valid")
    })
}

pub struct DiskReader {
    runner: Arc<dyn CommandRunner>,
    watch_list: Vec<String>,
    list_command: Vec<String>,
    state_command: Vec<String>,
    metrics: Arc<Metrics>,
}

impl DiskReader {
    pub fn new(cfg: &Config, runner: Arc<dyn CommandRunner>, metrics: Arc<Metrics>) -> Self {
        Self {
            runner,
            watch_list: cfg.disk_watch.clone(),
            list_command: cfg.disk.list_command.clone(),
            state_command: cfg.disk.state_command.clone(),
            metrics,
        }
    }

    pub async fn read_all(&self) -> Vec<DiskStatus> {
        let candidates: Vec<String> = self
            .candidates()
            .await
            .into_iter()
            .filter(|device| !device.starts_with(NVME_PREFIX))
            .collect();

        join_all(candidates.into_iter().map(|device| self.read_one(device))).await
    }

    async fn candidates(&self) -> Vec<String> {
        if !self.watch_list.is_empty() {
            return self.watch_list.clone();
        }

        let (program, args) = split_argv(&self.list_command);
        match self.runner.run(program, args).await {
            Ok(output) => parse_base_devices(&output),
            Err(err) => {
                self.metrics.inc_sampler_error("disk");
                warn!(error = %err, "failed to list base block devices");
                Vec::new()
            }
        }
    }

    async fn read_one(&self, device: String) -> DiskStatus {
        match self.query_state(&device).await {
            Ok(status) => DiskStatus {
                name: device,
                status,
                error_detail: None,
            },
            Err(err) => {
                warn!(device = %device, error = %err, "disk state query failed");
                DiskStatus {
                    name: device,
                    status: DiskState::Error,
                    error_detail: Some(err.to_string()),
                }
            }
        }
    }

    async fn query_state(&self, device: &str) -> Result<DiskState, CommandError> {
        let (program, prefix) = split_argv(&self.state_command);
        let mut args = prefix.to_vec();
        args.push(device.to_string());
        let output = self.runner.run(program, &args).await?;
        Ok(parse_drive_state(&output))
    }
}

pub fn parse_base_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| format!("/dev/{name}"))
        .collect()
}

pub fn parse_drive_state(output: &str) -> DiskState {
    drive_state_pattern()
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|word| DiskState::from_drive_state(word.as_str()))
        .unwrap_or(DiskState::Unknown)
}

pub struct DiskSampler {
    reader: Arc<DiskReader>,
    state: Arc<LatestState>,
    task: PeriodicTask,
}

impl DiskSampler {
    pub fn new(cfg: &Config, reader: DiskReader, state: Arc<LatestState>) -> Self {
        Self {
            reader: Arc::new(reader),
            state,
            task: PeriodicTask::new("disk", cfg.disk.interval),
        }
    }
}

#[async_trait]
impl Lifecycle for DiskSampler {
    fn name(&self) -> &'static str {
        "disk sampler"
    }

    async fn start(&self) -> bool {
        let reader = self.reader.clone();
        let state = self.state.clone();
        let started = self
            .task
            .start(move || {
                let reader = reader.clone();
                let state = state.clone();
                async move {
                    let disks = reader.read_all().await;
                    debug!(devices = disks.len(), "disk states refreshed");
                    state.disks.store(Arc::new(disks));
                }
            })
            .await;
        if started {
            info!("disk sampler started");
        }
        started
    }

    async fn stop(&self) -> bool {
        let stopped = self.task.stop().await;
        if stopped {
            info!("disk sampler stopped");
        }
        stopped
    }
}
