use arc_swap::{ArcSwap, ArcSwapOption};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskState {
    Spinning,
    Standby,
    Unknown,
    Error,
}

impl DiskState {
    pub fn from_drive_state(word: &str) -> Self {
        match word {
            "active" | "idle" => Self::Spinning,
            "standby" | "sleeping" => Self::Standby,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spinning => "spinning",
            Self::Standby => "standby",
            Self::Unknown => "unknown",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskStatus {
    pub name: String,
    pub status: DiskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySample {
    pub target: String,
    pub last_value: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStatus {
    pub utilization_percent: f64,
    pub temperature_celsius: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatus {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub interface_name: String,
    pub upload_bytes_per_sec: f64,
    pub download_bytes_per_sec: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub cpu: CpuStatus,
    pub memory: MemoryStatus,
    pub network: NetworkStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "hdd")]
    pub disks: Vec<DiskStatus>,
    #[serde(rename = "ping")]
    pub latencies: Vec<LatencySample>,
    #[serde(rename = "systemStatus")]
    pub resources: ResourceStatus,
}

#[derive(Debug)]
pub struct LatencySlot {
    target: String,
    last_value: ArcSwapOption<f64>,
}

impl LatencySlot {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            last_value: ArcSwapOption::empty(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn publish(&self, value: Option<f64>) {
        self.last_value.store(value.map(Arc::new));
    }

    pub fn sample(&self) -> LatencySample {
        LatencySample {
            target: self.target.clone(),
            last_value: self.last_value.load().as_deref().copied(),
        }
    }
}

// one writer per field; every update replaces the whole value
#[derive(Debug)]
pub struct LatestState {
    pub disks: ArcSwap<Vec<DiskStatus>>,
    pub latencies: ArcSwap<Vec<Arc<LatencySlot>>>,
    pub resources: ArcSwap<ResourceStatus>,
}

impl Default for LatestState {
    fn default() -> Self {
        Self {
            disks: ArcSwap::from_pointee(Vec::new()),
            latencies: ArcSwap::from_pointee(Vec::new()),
            resources: ArcSwap::from_pointee(ResourceStatus::default()),
        }
    }
}

impl LatestState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            disks: self.disks.load().as_ref().clone(),
            latencies: self.latencies.load().iter().map(|s| s.sample()).collect(),
            resources: self.resources.load().as_ref().clone(),
        }
    }
}
