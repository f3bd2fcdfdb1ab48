use crate::activation::{ActivationController, Lifecycle};
use crate::broadcast::{Broadcaster, ObserverHub};
use crate::collectors::disks::{DiskReader, DiskSampler};
use crate::collectors::latency::{LatencyProber, PingLauncher, ProbeLauncher};
use crate::collectors::resources::{HostCounters, ResourceReader, ResourceSampler, SysinfoCounters};
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::state::LatestState;
use std::sync::Arc;

pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub launcher: Arc<dyn ProbeLauncher>,
    pub counters: Box<dyn HostCounters>,
}

impl Collaborators {
    pub fn system(cfg: &Config) -> Self {
        Self {
            runner: Arc::new(SystemCommandRunner::new(cfg.command_timeout)),
            launcher: Arc::new(PingLauncher::new(cfg)),
            counters: Box::new(SysinfoCounters::new()),
        }
    }
}

#[derive(Clone)]
pub struct Agent {
    pub state: Arc<LatestState>,
    pub hub: Arc<ObserverHub>,
    pub controller: Arc<ActivationController>,
    pub prober: Arc<LatencyProber>,
}

impl Agent {
    pub fn build(cfg: &Config, parts: Collaborators, metrics: Arc<Metrics>) -> Self {
        let state = LatestState::new();
        let hub = ObserverHub::new();

        let disk = DiskSampler::new(
            cfg,
            DiskReader::new(cfg, parts.runner.clone(), metrics.clone()),
            state.clone(),
        );
        let prober = Arc::new(LatencyProber::new(
            cfg,
            parts.launcher,
            state.clone(),
            metrics.clone(),
        ));
        let resources = ResourceSampler::new(
            cfg,
            ResourceReader::new(cfg, parts.runner, parts.counters, metrics.clone()),
            state.clone(),
        );
        let broadcaster = Broadcaster::new(
            cfg.broadcast_interval,
            state.clone(),
            hub.clone(),
            metrics.clone(),
        );

        let samplers: Vec<Arc<dyn Lifecycle>> =
            vec![Arc::new(disk), prober.clone(), Arc::new(resources)];
        let controller = Arc::new(ActivationController::new(
            samplers,
            Arc::new(broadcaster),
            metrics,
        ));

        Self {
            state,
            hub,
            controller,
            prober,
        }
    }
}
