//! Manager options, loadable from YAML.
use std::{fs::read_to_string, path::Path, time::Duration};

use anyhow::Result;
use serde::Deserialize;

use crate::{backend::page_size, map::MapCleanupType};

/// Pages per lane of a ring buffer when neither the reader nor the
/// configuration asks for a size.
const DEFAULT_RING_BUFFER_PAGES: usize = 64;

/// Options shared by all the resources of a manager.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct ManagerOptions {
    /// Ring buffer size in bytes, used by readers not setting one.
    pub default_ring_buffer_size: usize,
    /// Watermark used by readers not setting one.
    pub default_watermark: usize,
    /// Bound on the time `Manager::stop()` waits for the consumption
    /// threads to exit. Waits forever if unset.
    pub stop_timeout_ms: Option<u64>,
    /// Cleanup policy used when rolling back a failed start.
    pub default_cleanup: MapCleanupType,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            default_ring_buffer_size: DEFAULT_RING_BUFFER_PAGES * page_size().unwrap_or(4096),
            default_watermark: 1,
            stop_timeout_ms: None,
            default_cleanup: MapCleanupType::default(),
        }
    }
}

impl ManagerOptions {
    /// Load options from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ManagerOptions> {
        let contents = read_to_string(path)?;
        ManagerOptions::from_str(contents.as_str())
    }

    /// Load options from a YAML string. Missing fields take their default
    /// value.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<ManagerOptions> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ManagerOptions::default();
        assert_eq!(
            options.default_ring_buffer_size,
            64 * page_size().unwrap()
        );
        assert_eq!(options.default_watermark, 1);
        assert!(options.stop_timeout().is_none());
        assert_eq!(options.default_cleanup, MapCleanupType::CleanInternal);
    }

    #[test]
    fn partial() {
        let options = ManagerOptions::from_str("default_watermark: 16").unwrap();
        assert_eq!(options.default_watermark, 16);
        assert_eq!(
            options.default_ring_buffer_size,
            ManagerOptions::default().default_ring_buffer_size
        );
    }

    #[test]
    fn invalid() {
        assert!(ManagerOptions::from_str("default_cleanup: everything").is_err());
        assert!(ManagerOptions::from_str("default_watermark: -1").is_err());
    }

    #[test]
    fn load_file() {
        let options = ManagerOptions::load("test_data/manager.yaml").unwrap();
        assert_eq!(options.default_ring_buffer_size, 1 << 20);
        assert_eq!(options.default_watermark, 4096);
        assert_eq!(options.stop_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(options.default_cleanup, MapCleanupType::KeepPinned);
    }
}
