use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use artifact_loader::{ArtifactProducer, CancellationToken};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn get(path: &Path) -> Result<Self> {
        let file = fs::File::open(path).context("failed to open workloads file")?;
        serde_yaml::from_reader(file).context("failed to parse workloads YAML")
    }
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    /// The number of requests in flight at any time.
    pub concurrency: usize,
    /// The number of distinct keys requests are spread over.
    pub keys: u64,
    /// The size of every produced artifact, in bytes.
    pub artifact_size: u64,
    /// How long it takes to produce one artifact.
    #[serde(with = "humantime_serde")]
    pub compute_time: Duration,
}

/// Produces zeroed artifacts after spinning for a fixed time.
#[derive(Debug, Clone)]
pub struct SyntheticProducer {
    artifact_size: u64,
    compute_time: Duration,
}

impl SyntheticProducer {
    pub fn new(workload: &Workload) -> Self {
        Self {
            artifact_size: workload.artifact_size,
            compute_time: workload.compute_time,
        }
    }
}

impl ArtifactProducer<u64, Vec<u8>> for SyntheticProducer {
    fn produce(&self, _key: &u64, cancel: &CancellationToken) -> Option<Vec<u8>> {
        let deadline = Instant::now() + self.compute_time;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1).min(self.compute_time));
        }

        let size = usize::try_from(self.artifact_size).ok()?;
        Some(vec![0; size])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workloads() {
        let yaml = r#"
            workloads:
              - concurrency: 16
                keys: 100
                artifact_size: 65536
                compute_time: 5ms
        "#;
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();
        let workload = &config.workloads[0];
        assert_eq!(workload.concurrency, 16);
        assert_eq!(workload.keys, 100);
        assert_eq!(workload.compute_time, Duration::from_millis(5));
    }

    #[test]
    fn test_synthetic_producer() {
        let producer = SyntheticProducer {
            artifact_size: 32,
            compute_time: Duration::from_millis(2),
        };
        let cancel = CancellationToken::new();
        assert_eq!(producer.produce(&1, &cancel), Some(vec![0; 32]));

        cancel.cancel();
        assert_eq!(producer.produce(&1, &cancel), None);
    }
}
