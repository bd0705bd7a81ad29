//! udev Naming Rule Store
//!
//! This crate keeps `/etc/udev/rules.d` consistent with the hardware that is
//! present: one symlink per physical port, idempotent installs, and removal of
//! rules for devices that are gone.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use portbind_detect::{PortPath, SystemRunner};
//! use portbind_rules::{RuleStore, RuleStoreConfig, Sudo};
//!
//! let mut store = RuleStore::new(RuleStoreConfig::default(), Sudo::new(Arc::new(SystemRunner)));
//! let path = PortPath::new("/devices/pci0000:00/0000:00:14.0/usb1/1-2/1-2:1.0/ttyUSB0/tty/ttyUSB0");
//! let report = store.reconcile("brake", &path).unwrap();
//! println!("{:?}", report.outcome);
//! ```

pub mod error;
pub mod privileged;
pub mod rule;
pub mod store;

pub use error::RuleError;
pub use privileged::{Direct, Privileged, Sudo};
pub use rule::{render_rule, rule_file_name, sanitize_symlink_name, NamingRule};
pub use store::{PruneReport, ReconcileOutcome, ReconcileReport, RuleStore, RuleStoreConfig};
