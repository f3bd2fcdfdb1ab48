pub mod disks;
pub mod latency;
pub mod resources;

use std::future::Future;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// A restartable timer loop. The first tick fires immediately on start.
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            running: Mutex::new(None),
        }
    }

    pub async fn start<F, Fut>(&self, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            return false;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let name = self.name;
        let period = self.period;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!(task = name, "periodic task stopped");
        });

        *guard = Some(Running {
            shutdown: shutdown_tx,
            handle,
        });
        true
    }

    /// Cancels the timer. A tick already in progress runs to completion.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };
        let _ = running.shutdown.send(true);
        drop(running.handle);
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}
