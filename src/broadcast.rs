use crate::activation::Lifecycle;
use crate::collectors::PeriodicTask;
use crate::metrics::Metrics;
use crate::state::LatestState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, trace, warn};

const HUB_CAPACITY: usize = 64;

pub struct ObserverHub {
    tx: broadcast::Sender<Arc<str>>,
}

impl ObserverHub {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    pub fn publish(&self, frame: impl Into<Arc<str>>) -> usize {
        self.tx.send(frame.into()).unwrap_or(0)
    }
}

pub struct Broadcaster {
    state: Arc<LatestState>,
    hub: Arc<ObserverHub>,
    metrics: Arc<Metrics>,
    task: PeriodicTask,
}

impl Broadcaster {
    pub fn new(
        interval: Duration,
        state: Arc<LatestState>,
        hub: Arc<ObserverHub>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state,
            hub,
            metrics,
            task: PeriodicTask::new("broadcast", interval),
        }
    }
}

fn publish_snapshot(state: &LatestState, hub: &ObserverHub, metrics: &Metrics) {
    let snapshot = state.snapshot();
    metrics.update_from_snapshot(&snapshot);
    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            let receivers = hub.publish(json);
            metrics.inc_snapshot_broadcast();
            trace!(receivers, "snapshot broadcast");
        }
        Err(err) => warn!(error = %err, "failed to serialize snapshot"),
    }
}

#[async_trait]
impl Lifecycle for Broadcaster {
    fn name(&self) -> &'static str {
        "broadcaster"
    }

    async fn start(&self) -> bool {
        let state = self.state.clone();
        let hub = self.hub.clone();
        let metrics = self.metrics.clone();
        let started = self
            .task
            .start(move || {
                publish_snapshot(&state, &hub, &metrics);
                std::future::ready(())
            })
            .await;
        if started {
            info!("broadcaster started");
        }
        started
    }

    async fn stop(&self) -> bool {
        let stopped = self.task.stop().await;
        if stopped {
            info!("broadcaster stopped");
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DiskState, DiskStatus, Snapshot};
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn publish_without_observers_is_dropped() {
        let hub = ObserverHub::new();
        assert_eq!(hub.publish("nobody"), 0);

        let mut rx = hub.subscribe();
        assert_eq!(hub.publish("hello"), 1);
        assert_eq!(rx.try_recv().unwrap().as_ref(), "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn broadcasts_snapshot_every_interval() {
        let state = LatestState::new();
        state.disks.store(Arc::new(vec![DiskStatus {
            name: "/dev/sda".to_string(),
            status: DiskState::Spinning,
            error_detail: None,
        }]));
        let hub = ObserverHub::new();
        let metrics = Metrics::new().expect("metrics init");
        let broadcaster = Broadcaster::new(
            Duration::from_secs(1),
            state.clone(),
            hub.clone(),
            metrics.clone(),
        );
        let mut rx = hub.subscribe();

        assert!(broadcaster.start().await);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(broadcaster.stop().await);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(metrics.agent_snapshots_broadcast_total.get(), 3.0);

        let value: serde_json::Value = serde_json::from_str(&frames[0]).expect("json");
        assert!(value.get("hdd").is_some());
        assert!(value.get("ping").is_some());
        assert!(value.get("systemStatus").is_some());
        let snapshot: Snapshot = serde_json::from_str(&frames[0]).expect("snapshot");
        assert_eq!(snapshot.disks[0].status, DiskState::Spinning);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
