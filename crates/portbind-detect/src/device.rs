//! Device nodes, identities and probe outcomes

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kernel name pattern: a `tty` family in capitals followed by its number
fn kernel_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(tty[A-Z]+)(\d+)").expect("static regex"))
}

/// Enumeration slot a kernel assigned to a serial interface (e.g. `ttyUSB` / 3)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnumerationIndex {
    /// Kernel driver family, e.g. `ttyUSB` or `ttyACM`
    pub family: String,
    /// Number the kernel assigned within the family
    pub number: u32,
}

impl EnumerationIndex {
    /// Find the first kernel name embedded anywhere in `text`
    pub fn find_in(text: &str) -> Option<Self> {
        let caps = kernel_name_regex().captures(text)?;
        let number = caps[2].parse().ok()?;
        Some(Self {
            family: caps[1].to_string(),
            number,
        })
    }

    /// Find every kernel name embedded in `text`
    pub fn find_all_in(text: &str) -> Vec<Self> {
        kernel_name_regex()
            .captures_iter(text)
            .filter_map(|caps| {
                Some(Self {
                    family: caps[1].to_string(),
                    number: caps[2].parse().ok()?,
                })
            })
            .collect()
    }
}

impl fmt::Display for EnumerationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.family, self.number)
    }
}

/// A candidate serial interface such as `/dev/ttyUSB0`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceNode(PathBuf);

impl DeviceNode {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Kernel name of the node (last path component)
    pub fn kernel_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.to_string_lossy().into_owned())
    }

    /// Enumeration slot parsed from the kernel name, if it has one
    pub fn enumeration_index(&self) -> Option<EnumerationIndex> {
        EnumerationIndex::find_in(&self.kernel_name())
    }

    /// Symlink name used when the peripheral answers but never with a valid identity
    pub fn fallback_name(&self) -> String {
        format!("unknown_device_at_{}", self.kernel_name())
    }
}

impl fmt::Display for DeviceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for DeviceNode {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identities a peripheral may declare in reply to the probe byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceName {
    Steering,
    Brake,
    Throttle,
}

impl DeviceName {
    pub const ALL: [DeviceName; 3] = [Self::Steering, Self::Brake, Self::Throttle];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Steering => "steering",
            Self::Brake => "brake",
            Self::Throttle => "throttle",
        }
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply text that is not one of the known identities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDeviceName(pub String);

impl fmt::Display for UnknownDeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown device name {:?}", self.0)
    }
}

impl std::error::Error for UnknownDeviceName {}

impl FromStr for DeviceName {
    type Err = UnknownDeviceName;

    /// Case-insensitive; surrounding whitespace is ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownDeviceName(trimmed.to_string()))
    }
}

/// Terminal result of probing one device node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "name", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// The peripheral declared a valid identity
    Identified(DeviceName),
    /// The peripheral answered, but never with a valid identity
    GenericFallback(String),
    /// Nothing was heard at any baud rate
    NoResponse,
}

impl ProbeOutcome {
    /// Name to bind a symlink to, if this outcome produces one
    pub fn symlink_name(&self) -> Option<String> {
        match self {
            Self::Identified(name) => Some(name.as_str().to_string()),
            Self::GenericFallback(name) => Some(name.clone()),
            Self::NoResponse => None,
        }
    }
}
