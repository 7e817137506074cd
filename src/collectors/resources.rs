use super::CollectError;
use crate::state::{LoadAverage, ResourceMetrics};
use std::path::Path;
use std::sync::Mutex;
use sysinfo::{DiskExt, System, SystemExt};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Host memory, disk and load. Keeps one `System` so refreshes stay cheap.
pub struct ResourceCollector {
    system: Mutex<System>,
}

impl Default for ResourceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceCollector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    pub async fn collect(&self) -> Result<ResourceMetrics, CollectError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| CollectError::Probe("system handle poisoned".to_string()))?;
        system.refresh_memory();
        system.refresh_disks_list();
        system.refresh_disks();

        // sysinfo reports bytes
        let memory_usage_mb = (system.used_memory() as f64 / BYTES_PER_MB).round();
        let disk_usage_percent = disk_usage_percent(
            system
                .disks()
                .iter()
                .map(|d| (d.mount_point(), d.total_space(), d.available_space())),
        );

        Ok(ResourceMetrics {
            memory_usage_mb: Some(memory_usage_mb),
            disk_usage_percent,
            load_average: load_average(&system),
        })
    }
}

/// Usage of the root mount, or of the largest disk when there is no root.
/// Rounded to one decimal.
pub fn disk_usage_percent<'a>(disks: impl Iterator<Item = (&'a Path, u64, u64)>) -> Option<f64> {
    let disks: Vec<_> = disks.filter(|(_, total, _)| *total > 0).collect();
    let (_, total, available) = disks
        .iter()
        .find(|(mount, _, _)| *mount == Path::new("/"))
        .or_else(|| disks.iter().max_by_key(|(_, total, _)| *total))?;
    let used = total.saturating_sub(*available);
    Some((used as f64 / *total as f64 * 1000.0).round() / 10.0)
}

fn load_average(system: &System) -> Option<LoadAverage> {
    if cfg!(windows) {
        return None;
    }
    let load = system.load_average();
    Some(LoadAverage {
        load1: load.one,
        load5: load.five,
        load15: load.fifteen,
    })
}
