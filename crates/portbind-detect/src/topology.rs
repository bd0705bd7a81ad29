//! Physical port path resolution
//!
//! A device node such as `/dev/ttyUSB0` is renumbered whenever adapters are
//! plugged in a different order, but the USB topology path of the connector it
//! hangs off is not. Several independent strategies can recover that path; they
//! are tried in order and the first non-empty answer wins.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::command::{CommandRunner, SystemRunner};
use crate::device::DeviceNode;
use crate::error::DetectError;

/// Marker separating the sysfs mount point from the device tree
pub const DEVICES_MARKER: &str = "/sys/devices/";

/// Topology-derived path of a physical connector, in udev `DEVPATH` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortPath(String);

impl PortPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for PortPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive a `DEVPATH` from a canonical sysfs path
///
/// `/sys/devices/pci0000:00/usb1/1-1` becomes `/devices/pci0000:00/usb1/1-1`.
pub fn devpath_from_sysfs(path: &Path) -> Option<PortPath> {
    let text = path.to_string_lossy();
    let start = text.find(DEVICES_MARKER)? + DEVICES_MARKER.len();
    let suffix = text[start..].trim_end_matches('/');
    if suffix.is_empty() {
        return None;
    }
    Some(PortPath::new(format!("/devices/{suffix}")))
}

/// Find a `DEVPATH` field in `udevadm info --attribute-walk` style output
///
/// Both `DEVPATH=="value"` and `DEVPATH: value` encodings are accepted.
pub fn parse_attribute_walk(output: &str) -> Option<PortPath> {
    static EQ: OnceLock<Regex> = OnceLock::new();
    static COLON: OnceLock<Regex> = OnceLock::new();
    let eq = EQ.get_or_init(|| {
        Regex::new(r#"DEVPATH==?["']?([^"'= ]+)["']?"#).expect("static regex")
    });
    let colon = COLON.get_or_init(|| {
        Regex::new(r#"DEVPATH\s*:\s*["']?([^"'= ]+)["']?"#).expect("static regex")
    });

    output
        .lines()
        .filter(|line| line.contains("DEVPATH"))
        .find_map(|line| eq.captures(line).or_else(|| colon.captures(line)))
        .map(|caps| PortPath::new(&caps[1]))
}

/// One way of resolving a node to its port path
pub trait ResolveStrategy: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Try to resolve `node`; raw command output worth showing an operator
    /// on failure is appended to `notes`
    fn resolve(&self, node: &DeviceNode, notes: &mut Vec<String>) -> Option<PortPath>;
}

/// Tier 1: `udevadm info --query=path`
pub struct UdevadmQueryPath {
    runner: Arc<dyn CommandRunner>,
}

impl UdevadmQueryPath {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl ResolveStrategy for UdevadmQueryPath {
    fn name(&self) -> &'static str {
        "udevadm query"
    }

    fn resolve(&self, node: &DeviceNode, notes: &mut Vec<String>) -> Option<PortPath> {
        let name_arg = format!("--name={}", node);
        match self.runner.run("udevadm", &["info", &name_arg, "--query=path"]) {
            Ok(out) if out.success => {
                let path = out.stdout.trim();
                (!path.is_empty()).then(|| PortPath::new(path))
            }
            Ok(out) => {
                notes.push(format!("udevadm --query=path failed: {}", out.stderr.trim()));
                None
            }
            Err(e) => {
                notes.push(e.to_string());
                None
            }
        }
    }
}

/// Tier 2: scan `udevadm info --attribute-walk` for a `DEVPATH` field
pub struct UdevadmAttributeWalk {
    runner: Arc<dyn CommandRunner>,
}

impl UdevadmAttributeWalk {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl ResolveStrategy for UdevadmAttributeWalk {
    fn name(&self) -> &'static str {
        "udevadm attribute walk"
    }

    fn resolve(&self, node: &DeviceNode, notes: &mut Vec<String>) -> Option<PortPath> {
        let name_arg = format!("--name={}", node);
        match self
            .runner
            .run("udevadm", &["info", &name_arg, "--attribute-walk"])
        {
            Ok(out) => {
                let found = parse_attribute_walk(&out.stdout);
                if found.is_none() {
                    notes.push(format!("udevadm --attribute-walk output:\n{}", out.stdout));
                }
                found
            }
            Err(e) => {
                notes.push(e.to_string());
                None
            }
        }
    }
}

/// Tier 3: canonicalise the node itself
pub struct CanonicalNodePath;

impl ResolveStrategy for CanonicalNodePath {
    fn name(&self) -> &'static str {
        "canonical node path"
    }

    fn resolve(&self, node: &DeviceNode, notes: &mut Vec<String>) -> Option<PortPath> {
        match std::fs::canonicalize(node.path()) {
            Ok(real) => {
                debug!("Real path: {}", real.display());
                let found = devpath_from_sysfs(&real);
                if found.is_none() {
                    notes.push(format!("real path {} is outside the device tree", real.display()));
                }
                found
            }
            Err(e) => {
                notes.push(format!("canonicalize {}: {}", node, e));
                None
            }
        }
    }
}

/// Tier 4: follow `<sysfs>/class/tty/<name>/device`
pub struct SysfsClassLink {
    sysfs_root: PathBuf,
}

impl SysfsClassLink {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }
}

impl ResolveStrategy for SysfsClassLink {
    fn name(&self) -> &'static str {
        "sysfs class link"
    }

    fn resolve(&self, node: &DeviceNode, notes: &mut Vec<String>) -> Option<PortPath> {
        let link = self
            .sysfs_root
            .join("class")
            .join("tty")
            .join(node.kernel_name())
            .join("device");
        match std::fs::canonicalize(&link) {
            Ok(real) => {
                debug!("Real device path: {}", real.display());
                devpath_from_sysfs(&real)
            }
            Err(e) => {
                notes.push(format!("{}: {}", link.display(), e));
                None
            }
        }
    }
}

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Where sysfs is mounted
    pub sysfs_root: PathBuf,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

/// Ordered chain of [`ResolveStrategy`] tiers
pub struct PortPathResolver {
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl PortPathResolver {
    /// Build a resolver from an explicit strategy list
    pub fn new(strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        Self { strategies }
    }

    /// The standard four tiers, running `udevadm` through `runner`
    pub fn with_runner(runner: Arc<dyn CommandRunner>, config: ResolverConfig) -> Self {
        Self::new(vec![
            Box::new(UdevadmQueryPath::new(Arc::clone(&runner))),
            Box::new(UdevadmAttributeWalk::new(runner)),
            Box::new(CanonicalNodePath),
            Box::new(SysfsClassLink::new(config.sysfs_root)),
        ])
    }

    /// The standard four tiers against the host
    pub fn system(config: ResolverConfig) -> Self {
        Self::with_runner(Arc::new(SystemRunner), config)
    }

    /// Resolve `node`, trying each tier until one succeeds
    pub fn resolve(&self, node: &DeviceNode) -> Result<PortPath, DetectError> {
        let mut notes = Vec::new();
        for strategy in &self.strategies {
            match strategy.resolve(node, &mut notes) {
                Some(path) if !path.is_empty() => {
                    debug!("{} resolved via {}: {}", node, strategy.name(), path);
                    return Ok(path);
                }
                _ => debug!("{}: {} found nothing", node, strategy.name()),
            }
        }

        warn!("Could not resolve a port path for {}", node);
        for note in &notes {
            warn!("  {}", note);
        }
        Err(DetectError::Resolution(node.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers by the last argument (`--query=path` or `--attribute-walk`)
    struct FakeUdevadm {
        replies: HashMap<&'static str, CommandOutput>,
    }

    impl CommandRunner for FakeUdevadm {
        fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, DetectError> {
            assert_eq!(program, "udevadm");
            let key = args.last().copied().unwrap_or_default();
            Ok(self
                .replies
                .get(key)
                .cloned()
                .unwrap_or_else(|| CommandOutput::failed("no such device")))
        }
    }

    struct CountingTier(Arc<AtomicU32>);

    impl ResolveStrategy for CountingTier {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn resolve(&self, _node: &DeviceNode, _notes: &mut Vec<String>) -> Option<PortPath> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(PortPath::new("/devices/tier4"))
        }
    }

    fn runner(replies: &[(&'static str, CommandOutput)]) -> Arc<dyn CommandRunner> {
        Arc::new(FakeUdevadm {
            replies: replies.iter().cloned().collect(),
        })
    }

    const DEVPATH: &str = "/devices/pci0000:00/0000:00:14.0/usb1/1-2/1-2:1.0/ttyUSB0/tty/ttyUSB0";

    #[test]
    fn test_devpath_from_sysfs() {
        assert_eq!(
            devpath_from_sysfs(Path::new("/sys/devices/pci0000:00/usb1/1-1/")),
            Some(PortPath::new("/devices/pci0000:00/usb1/1-1"))
        );
        assert_eq!(devpath_from_sysfs(Path::new("/dev/ttyUSB0")), None);
        assert_eq!(devpath_from_sysfs(Path::new("/sys/devices/")), None);
    }

    #[test]
    fn test_parse_attribute_walk_both_encodings() {
        let eq = "  looking at device\n    DEVPATH==\"/devices/a/b\"\n";
        assert_eq!(parse_attribute_walk(eq), Some(PortPath::new("/devices/a/b")));

        let colon = "E: SUBSYSTEM=tty\nE: DEVPATH: /devices/c/d\n";
        assert_eq!(parse_attribute_walk(colon), Some(PortPath::new("/devices/c/d")));

        assert_eq!(parse_attribute_walk("looking at device '/devices/x'"), None);
    }

    #[test]
    fn test_tier_one_wins() {
        let resolver = PortPathResolver::with_runner(
            runner(&[("--query=path", CommandOutput::ok(format!("{DEVPATH}\n")))]),
            ResolverConfig::default(),
        );
        let path = resolver.resolve(&DeviceNode::from("/dev/ttyUSB0")).unwrap();
        assert_eq!(path.as_str(), DEVPATH);
    }

    #[test]
    fn test_empty_tier_one_falls_to_attribute_walk() {
        let resolver = PortPathResolver::with_runner(
            runner(&[
                ("--query=path", CommandOutput::ok("  \n")),
                (
                    "--attribute-walk",
                    CommandOutput::ok("    DEVPATH==\"/devices/usb1/1-3\"\n"),
                ),
            ]),
            ResolverConfig::default(),
        );
        let path = resolver.resolve(&DeviceNode::from("/dev/ttyUSB0")).unwrap();
        assert_eq!(path.as_str(), "/devices/usb1/1-3");
    }

    #[cfg(unix)]
    #[test]
    fn test_tier_three_used_and_tier_four_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir
            .path()
            .join("sys/devices/pci0000:00/usb1/1-4/1-4:1.0/ttyUSB0/tty/ttyUSB0");
        std::fs::create_dir_all(real.parent().unwrap()).unwrap();
        std::fs::File::create(&real).unwrap();
        std::fs::create_dir_all(dir.path().join("dev")).unwrap();
        let node_path = dir.path().join("dev/ttyUSB0");
        std::os::unix::fs::symlink(&real, &node_path).unwrap();

        let tier4_calls = Arc::new(AtomicU32::new(0));
        let udevadm = runner(&[]);
        let resolver = PortPathResolver::new(vec![
            Box::new(UdevadmQueryPath::new(Arc::clone(&udevadm))),
            Box::new(UdevadmAttributeWalk::new(udevadm)),
            Box::new(CanonicalNodePath),
            Box::new(CountingTier(Arc::clone(&tier4_calls))),
        ]);

        let path = resolver.resolve(&DeviceNode::new(node_path)).unwrap();
        assert_eq!(
            path.as_str(),
            "/devices/pci0000:00/usb1/1-4/1-4:1.0/ttyUSB0/tty/ttyUSB0"
        );
        assert_eq!(tier4_calls.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_tier_four_follows_class_link() {
        let dir = tempfile::tempdir().unwrap();
        let sysfs = dir.path().join("sys");
        let iface = sysfs.join("devices/pci0000:00/usb1/1-5/1-5:1.0");
        std::fs::create_dir_all(&iface).unwrap();
        let class_dir = sysfs.join("class/tty/ttyUSB7");
        std::fs::create_dir_all(&class_dir).unwrap();
        std::os::unix::fs::symlink(&iface, class_dir.join("device")).unwrap();

        let resolver = PortPathResolver::with_runner(
            runner(&[]),
            ResolverConfig { sysfs_root: sysfs },
        );
        // The node itself does not exist, so tier 3 fails
        let path = resolver
            .resolve(&DeviceNode::new(dir.path().join("dev/ttyUSB7")))
            .unwrap();
        assert_eq!(path.as_str(), "/devices/pci0000:00/usb1/1-5/1-5:1.0");
    }

    #[test]
    fn test_all_tiers_fail() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PortPathResolver::with_runner(
            runner(&[("--attribute-walk", CommandOutput::ok("nothing useful"))]),
            ResolverConfig {
                sysfs_root: dir.path().to_path_buf(),
            },
        );
        let err = resolver
            .resolve(&DeviceNode::new(dir.path().join("ttyUSB9")))
            .unwrap_err();
        assert!(matches!(err, DetectError::Resolution(_)));
    }
}
