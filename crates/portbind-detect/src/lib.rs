//! USB-Serial Peripheral Detection Library
//!
//! This crate lists USB-serial nodes, asks each one for its name over a
//! ladder of baud rates, and resolves the physical port a node hangs off.
//!
//! # Example
//!
//! ```rust,no_run
//! use portbind_detect::{DeviceProber, DeviceScanner, ProbeConfig, SerialOpener};
//!
//! # async fn run() -> Result<(), portbind_detect::DetectError> {
//! let nodes = DeviceScanner::new().enumerate()?;
//! let prober = DeviceProber::new(SerialOpener, ProbeConfig::default());
//!
//! for node in &nodes {
//!     if let Ok(report) = prober.probe(node).await {
//!         println!("{}: {:?}", node, report.outcome);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod device;
pub mod error;
pub mod probe;
pub mod scanner;
pub mod sim;
pub mod topology;

pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use device::{DeviceName, DeviceNode, EnumerationIndex, ProbeOutcome};
pub use error::{DetectError, ProbeError};
pub use probe::{
    AttemptResult, CancelFlag, DeviceProber, PortOpener, ProbeConfig, ProbeLadder, ProbeLink,
    ProbeReport, SerialOpener, Step,
};
pub use scanner::{DeviceScanner, ScannerConfig};
pub use topology::{PortPath, PortPathResolver, ResolveStrategy, ResolverConfig};
