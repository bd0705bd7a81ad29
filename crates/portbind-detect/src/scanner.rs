//! Device node scanner
//!
//! This module lists the USB-serial nodes currently present on the host.

use glob::glob;
use tracing::{debug, info};

use crate::device::DeviceNode;
use crate::error::DetectError;

/// Default glob for USB-serial adapters
pub const DEFAULT_DEVICE_GLOB: &str = "/dev/ttyUSB*";

/// Device scanner configuration
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Glob matched against the filesystem
    pub pattern: String,
    /// Skip nodes whose path contains any of these
    pub skip_patterns: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_DEVICE_GLOB.to_string(),
            skip_patterns: Vec::new(),
        }
    }
}

/// Device scanner
pub struct DeviceScanner {
    config: ScannerConfig,
}

impl DeviceScanner {
    /// Create a new scanner with default configuration
    pub fn new() -> Self {
        Self {
            config: ScannerConfig::default(),
        }
    }

    /// Create a scanner with custom configuration
    pub fn with_config(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Enumerate the device nodes present right now
    ///
    /// An empty result is not an error. Nodes are ordered by enumeration
    /// index, so `ttyUSB2` comes before `ttyUSB10`.
    pub fn enumerate(&self) -> Result<Vec<DeviceNode>, DetectError> {
        debug!("Enumerating devices matching {}", self.config.pattern);
        let paths = glob(&self.config.pattern)
            .map_err(|e| DetectError::EnumerationFailed(e.to_string()))?;

        let mut nodes: Vec<_> = paths
            .filter_map(|entry| match entry {
                Ok(path) => Some(DeviceNode::new(path)),
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|node| !self.should_skip(node))
            .collect();

        nodes.sort_by(|a, b| {
            a.enumeration_index()
                .cmp(&b.enumeration_index())
                .then_with(|| a.cmp(b))
        });

        if nodes.is_empty() {
            info!("No USB serial devices found");
        } else {
            info!("Found {} USB serial device(s)", nodes.len());
            for node in &nodes {
                info!("  {}", node);
            }
        }

        Ok(nodes)
    }

    /// Check if a node should be skipped
    fn should_skip(&self, node: &DeviceNode) -> bool {
        let path = node.path().to_string_lossy();
        self.config
            .skip_patterns
            .iter()
            .any(|pattern| path.contains(pattern.as_str()))
    }
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn scanner_in(dir: &std::path::Path, skip: &[&str]) -> DeviceScanner {
        DeviceScanner::with_config(ScannerConfig {
            pattern: format!("{}/ttyUSB*", dir.display()),
            skip_patterns: skip.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_enumerate_orders_by_index() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB10", "ttyUSB2", "ttyUSB0", "ttyACM0"] {
            File::create(dir.path().join(name)).unwrap();
        }

        let nodes = scanner_in(dir.path(), &[]).enumerate().unwrap();
        let names: Vec<_> = nodes.iter().map(|n| n.kernel_name()).collect();

        assert_eq!(names, vec!["ttyUSB0", "ttyUSB2", "ttyUSB10"]);
    }

    #[test]
    fn test_enumerate_empty_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let nodes = scanner_in(dir.path(), &[]).enumerate().unwrap();
        assert!(nodes.is_empty());
    }

    #[test]
    fn test_skip_patterns() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("ttyUSB0")).unwrap();
        File::create(dir.path().join("ttyUSB1")).unwrap();

        let nodes = scanner_in(dir.path(), &["ttyUSB1"]).enumerate().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kernel_name(), "ttyUSB0");
    }

    #[test]
    fn test_invalid_pattern() {
        let scanner = DeviceScanner::with_config(ScannerConfig {
            pattern: "/dev/[ttyUSB".to_string(),
            skip_patterns: Vec::new(),
        });
        assert!(matches!(
            scanner.enumerate(),
            Err(DetectError::EnumerationFailed(_))
        ));
    }
}
