use crate::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Both calls are idempotent and return whether they changed anything.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> bool;
    async fn stop(&self) -> bool;
}

pub struct ActivationController {
    samplers: Vec<Arc<dyn Lifecycle>>,
    broadcaster: Arc<dyn Lifecycle>,
    observers: Mutex<usize>,
    metrics: Arc<Metrics>,
}

impl ActivationController {
    // samplers start in order; the broadcaster starts last and stops first
    pub fn new(
        samplers: Vec<Arc<dyn Lifecycle>>,
        broadcaster: Arc<dyn Lifecycle>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            samplers,
            broadcaster,
            observers: Mutex::new(0),
            metrics,
        }
    }

    pub async fn observer_connected(&self) -> usize {
        let mut observers = self.observers.lock().await;
        *observers += 1;
        self.metrics.set_observers(*observers);
        if *observers == 1 {
            info!("first observer connected, starting samplers");
            self.activate().await;
        } else {
            debug!(observers = *observers, "observer connected");
        }
        *observers
    }

    pub async fn observer_disconnected(&self) -> usize {
        let mut observers = self.observers.lock().await;
        if *observers == 0 {
            debug!("disconnect with no observers ignored");
            return 0;
        }
        *observers -= 1;
        self.metrics.set_observers(*observers);
        if *observers == 0 {
            info!("last observer disconnected, stopping samplers");
            self.deactivate().await;
        } else {
            debug!(observers = *observers, "observer disconnected");
        }
        *observers
    }

    pub async fn observers(&self) -> usize {
        *self.observers.lock().await
    }

    pub async fn shutdown(&self) {
        let mut observers = self.observers.lock().await;
        *observers = 0;
        self.metrics.set_observers(0);
        self.deactivate().await;
    }

    async fn activate(&self) {
        for component in self.samplers.iter().chain(std::iter::once(&self.broadcaster)) {
            if component.start().await {
                debug!(component = component.name(), "component started");
            }
        }
    }

    async fn deactivate(&self) {
        for component in std::iter::once(&self.broadcaster).chain(self.samplers.iter()) {
            if component.stop().await {
                debug!(component = component.name(), "component stopped");
            }
        }
    }
}
