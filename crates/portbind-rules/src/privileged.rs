//! Privileged filesystem and udev actions
//!
//! Rule files live in a root-owned directory and reloading udev needs root, so
//! every mutation goes through [`Privileged`]. [`Sudo`] assumes passwordless
//! sudo is configured for `mv`, `rm` and `udevadm`; [`Direct`] is for processes
//! that already run as root.
//!
//! The staging directory may sit on another filesystem than the rules
//! directory, so an install always ends with a rename inside the rules
//! directory. Intermediate names start with a dot and lack the `.rules`
//! extension, which keeps udev from ever loading them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use portbind_detect::{CommandOutput, CommandRunner, DetectError};
use tempfile::Builder;
use tracing::{debug, warn};

use crate::error::RuleError;

/// Actions that need elevated privilege
pub trait Privileged: Send + Sync {
    /// Atomically replace `dest` with the content of `src`, consuming `src`
    fn install(&self, src: &Path, dest: &Path) -> Result<(), RuleError>;

    /// Delete `path`
    fn remove(&self, path: &Path) -> Result<(), RuleError>;

    /// `udevadm control --reload-rules`
    fn reload_rules(&self) -> Result<(), RuleError>;

    /// `udevadm trigger`
    fn trigger(&self) -> Result<(), RuleError>;
}

impl<T: Privileged + ?Sized> Privileged for Box<T> {
    fn install(&self, src: &Path, dest: &Path) -> Result<(), RuleError> {
        (**self).install(src, dest)
    }

    fn remove(&self, path: &Path) -> Result<(), RuleError> {
        (**self).remove(path)
    }

    fn reload_rules(&self) -> Result<(), RuleError> {
        (**self).reload_rules()
    }

    fn trigger(&self) -> Result<(), RuleError> {
        (**self).trigger()
    }
}

/// Prefix of in-flight files inside the rules directory
pub const STAGED_PREFIX: &str = ".portbind-";

/// Hidden name next to `dest` for a file staged as `src`
fn sibling_of(dest: &Path, src: &Path) -> PathBuf {
    let staged = src
        .file_name()
        .map(|n| n.to_string_lossy().trim_start_matches('.').to_string())
        .unwrap_or_default();
    dest.with_file_name(format!("{STAGED_PREFIX}{staged}"))
}

fn check(action: &str, result: Result<CommandOutput, DetectError>) -> Result<(), RuleError> {
    match result {
        Ok(out) if out.success => Ok(()),
        Ok(out) => Err(RuleError::Privileged {
            action: action.to_string(),
            reason: out.stderr.trim().to_string(),
        }),
        Err(e) => Err(RuleError::Privileged {
            action: action.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Runs every action through non-interactive `sudo`
pub struct Sudo {
    runner: Arc<dyn CommandRunner>,
}

impl Sudo {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn sudo(&self, action: &str, args: &[&str]) -> Result<(), RuleError> {
        let mut full = vec!["-n"];
        full.extend_from_slice(args);
        debug!("sudo {}", args.join(" "));
        check(action, self.runner.run("sudo", &full))
    }
}

impl Privileged for Sudo {
    fn install(&self, src: &Path, dest: &Path) -> Result<(), RuleError> {
        let sibling = sibling_of(dest, src);
        let src = src.to_string_lossy();
        let sibling = sibling.to_string_lossy();
        let dest = dest.to_string_lossy();

        // The first move may copy across filesystems; the second is a rename
        self.sudo("mv", &["mv", &*src, &*sibling])?;
        if let Err(e) = self.sudo("mv", &["mv", &*sibling, &*dest]) {
            if let Err(cleanup) = self.sudo("rm", &["rm", "-f", &*sibling]) {
                warn!("Leaving {} behind: {}", sibling, cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), RuleError> {
        let path = path.to_string_lossy();
        self.sudo("rm", &["rm", &*path])
    }

    fn reload_rules(&self) -> Result<(), RuleError> {
        self.sudo("reload", &["udevadm", "control", "--reload-rules"])
    }

    fn trigger(&self) -> Result<(), RuleError> {
        self.sudo("trigger", &["udevadm", "trigger"])
    }
}

/// Performs actions in-process; `udevadm` is run without sudo
pub struct Direct {
    runner: Arc<dyn CommandRunner>,
}

impl Direct {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl Privileged for Direct {
    fn install(&self, src: &Path, dest: &Path) -> Result<(), RuleError> {
        let to_err = |e: io::Error| RuleError::Privileged {
            action: "install".to_string(),
            reason: e.to_string(),
        };
        if fs::rename(src, dest).is_ok() {
            return Ok(());
        }

        // Staged on another filesystem: copy next to `dest`, then rename
        let dir = match dest.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut sibling = Builder::new()
            .prefix(STAGED_PREFIX)
            .tempfile_in(dir)
            .map_err(to_err)?;
        let mut staged = fs::File::open(src).map_err(to_err)?;
        io::copy(&mut staged, sibling.as_file_mut()).map_err(to_err)?;
        sibling.as_file().sync_all().map_err(to_err)?;
        let permissions = fs::metadata(src).map_err(to_err)?.permissions();
        fs::set_permissions(sibling.path(), permissions).map_err(to_err)?;

        sibling.persist(dest).map_err(|e| to_err(e.error))?;
        fs::remove_file(src).map_err(to_err)
    }

    fn remove(&self, path: &Path) -> Result<(), RuleError> {
        fs::remove_file(path).map_err(|e| RuleError::Privileged {
            action: "remove".to_string(),
            reason: e.to_string(),
        })
    }

    fn reload_rules(&self) -> Result<(), RuleError> {
        check(
            "reload",
            self.runner.run("udevadm", &["control", "--reload-rules"]),
        )
    }

    fn trigger(&self) -> Result<(), RuleError> {
        check("trigger", self.runner.run("udevadm", &["trigger"]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
        fail: bool,
        /// Fail only commands containing this
        fail_matching: Option<&'static str>,
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, DetectError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} {}", program, args.join(" ")));
            let matched = self
                .fail_matching
                .is_some_and(|needle| args.iter().any(|arg| arg.contains(needle)));
            if self.fail || matched {
                Ok(CommandOutput::failed("sudo: a password is required"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        }
    }

    #[test]
    fn test_sudo_commands() {
        let runner = Arc::new(RecordingRunner::default());
        let sudo = Sudo::new(runner.clone());

        sudo.install(Path::new("/tmp/x"), Path::new("/etc/udev/rules.d/99-brake.rules"))
            .unwrap();
        sudo.remove(Path::new("/etc/udev/rules.d/99-brake.rules"))
            .unwrap();
        sudo.reload_rules().unwrap();
        sudo.trigger().unwrap();

        assert_eq!(
            *runner.calls.lock().unwrap(),
            vec![
                "sudo -n mv /tmp/x /etc/udev/rules.d/.portbind-x",
                "sudo -n mv /etc/udev/rules.d/.portbind-x /etc/udev/rules.d/99-brake.rules",
                "sudo -n rm /etc/udev/rules.d/99-brake.rules",
                "sudo -n udevadm control --reload-rules",
                "sudo -n udevadm trigger",
            ]
        );
    }

    #[test]
    fn test_sudo_denied() {
        let runner = Arc::new(RecordingRunner {
            fail: true,
            ..Default::default()
        });
        let err = Sudo::new(runner).remove(Path::new("/x")).unwrap_err();
        assert!(err.to_string().contains("password is required"));
    }

    #[test]
    fn test_sudo_failed_rename_removes_sibling() {
        let runner = Arc::new(RecordingRunner {
            fail_matching: Some("99-brake"),
            ..Default::default()
        });
        let sudo = Sudo::new(runner.clone());

        let err = sudo
            .install(Path::new("/tmp/.tmpAb12"), Path::new("/etc/udev/rules.d/99-brake.rules"))
            .unwrap_err();

        assert!(matches!(err, RuleError::Privileged { .. }));
        assert_eq!(
            runner.calls.lock().unwrap().last().map(String::as_str),
            Some("sudo -n rm -f /etc/udev/rules.d/.portbind-tmpAb12")
        );
    }

    /// A temp dir on a different device than `than`, if the host has one
    fn other_filesystem(than: &Path) -> Option<tempfile::TempDir> {
        use std::os::unix::fs::MetadataExt;

        let dev = fs::metadata(than).ok()?.dev();
        ["/dev/shm", "/run", "/var/tmp"]
            .into_iter()
            .filter_map(|candidate| tempfile::tempdir_in(candidate).ok())
            .find(|dir| {
                fs::metadata(dir.path())
                    .map(|m| m.dev() != dev)
                    .unwrap_or(false)
            })
    }

    fn inode(path: &Path) -> u64 {
        use std::os::unix::fs::MetadataExt;
        fs::metadata(path).unwrap().ino()
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(STAGED_PREFIX))
            .collect()
    }

    #[test]
    fn test_direct_install_replaces_inode() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tmp-rule");
        let dest = dir.path().join("99-brake.rules");
        fs::write(&dest, "old\n").unwrap();
        fs::write(&src, "new\n").unwrap();
        let before = inode(&dest);

        Direct::new(Arc::new(RecordingRunner::default()))
            .install(&src, &dest)
            .unwrap();

        assert_ne!(inode(&dest), before);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "new\n");
    }

    #[test]
    fn test_direct_install_across_filesystems_renames() {
        let rules = tempfile::tempdir().unwrap();
        let Some(staging) = other_filesystem(rules.path()) else {
            eprintln!("no second filesystem available, skipping");
            return;
        };
        let src = staging.path().join("tmp-rule");
        let dest = rules.path().join("99-brake.rules");
        fs::write(&dest, "old\n").unwrap();
        fs::write(&src, "new\n").unwrap();
        let before = inode(&dest);

        Direct::new(Arc::new(RecordingRunner::default()))
            .install(&src, &dest)
            .unwrap();

        assert_ne!(inode(&dest), before);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "new\n");
        assert!(!src.exists());
        assert!(leftovers(rules.path()).is_empty());
    }

    #[test]
    fn test_direct_install_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tmp-rule");
        let dest = dir.path().join("99-brake.rules");
        fs::write(&src, "rule\n").unwrap();

        let direct = Direct::new(Arc::new(RecordingRunner::default()));
        direct.install(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "rule\n");

        direct.remove(&dest).unwrap();
        assert!(!dest.exists());
        assert!(direct.remove(&dest).is_err());
    }
}
