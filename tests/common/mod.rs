//! Common test utilities for integration tests.

pub mod cluster_sim;
pub mod fixtures;

use tempfile::TempDir;

// Re-export common types
pub use cluster_sim::*;
pub use fixtures::*;

/// Temporary devices root with the given device directories.
pub struct TestEnv {
    pub temp_dir: TempDir,
}

impl TestEnv {
    pub fn new(devices: &[&str]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        for device in devices {
            std::fs::create_dir_all(temp_dir.path().join("devices").join(device))
                .expect("Failed to create device dir");
        }
        Self { temp_dir }
    }

    pub fn devices_root(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("devices")
    }

    pub fn path(&self, name: &str) -> std::path::PathBuf {
        self.temp_dir.path().join(name)
    }
}
