//! Rule store
//!
//! The rule directory is shared mutable state: other tools (and earlier runs)
//! write to it. Every mutating decision re-reads the files it is about to
//! change, and every write is a single privileged rename of a fully written
//! temp file, so an interrupted run never leaves a half-written rule behind.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use portbind_detect::{DeviceNode, EnumerationIndex, PortPath};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::RuleError;
use crate::privileged::Privileged;
use crate::rule::{
    is_managed_content, is_managed_file_name, render_rule, rule_file_name, rule_lines,
    sanitize_symlink_name, NamingRule, RuleFields, RULE_FILE_EXTENSION,
};

/// Default udev rules directory
pub const DEFAULT_RULES_DIR: &str = "/etc/udev/rules.d";

/// Rule store configuration
#[derive(Debug, Clone)]
pub struct RuleStoreConfig {
    /// Directory udev reads rules from
    pub rules_dir: PathBuf,
    /// Where rule files are staged before the privileged move
    pub temp_dir: PathBuf,
}

impl Default for RuleStoreConfig {
    fn default() -> Self {
        Self {
            rules_dir: PathBuf::from(DEFAULT_RULES_DIR),
            temp_dir: std::env::temp_dir(),
        }
    }
}

/// What [`RuleStore::reconcile`] ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A rule already binds this name to this port
    AlreadyBound { file: PathBuf },
    /// A new rule file was installed
    Installed { file: PathBuf },
}

/// Full account of one reconciliation
#[derive(Debug)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    /// Conflicting rules that were removed
    pub removed: Vec<NamingRule>,
    /// Non-fatal failures (conflicts that could not be removed, reload errors)
    pub failures: Vec<RuleError>,
}

/// Full account of one prune pass
#[derive(Debug, Default)]
pub struct PruneReport {
    /// Rule files deleted as stale
    pub removed: Vec<PathBuf>,
    /// Failures scanning or deleting individual files
    pub failures: Vec<RuleError>,
}

/// udev rule files keyed on physical port path
pub struct RuleStore<P> {
    config: RuleStoreConfig,
    privileged: P,
}

impl<P: Privileged> RuleStore<P> {
    pub fn new(config: RuleStoreConfig, privileged: P) -> Self {
        Self { config, privileged }
    }

    pub fn rules_dir(&self) -> &Path {
        &self.config.rules_dir
    }

    /// Every `*.rules` file in the rules directory, sorted
    fn rule_files(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.config.rules_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Cannot list {}: {}",
                    self.config.rules_dir.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut files: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(RULE_FILE_EXTENSION)
            })
            .collect();
        files.sort();
        files
    }

    /// Rules in any file whose `DEVPATH` equals `port_path`
    pub fn find_existing(&self, port_path: &PortPath) -> Vec<NamingRule> {
        let mut found = Vec::new();
        for file in self.rule_files() {
            let content = match fs::read_to_string(&file) {
                Ok(content) => content,
                Err(source) => {
                    warn!("{}", RuleError::Scan { file, source });
                    continue;
                }
            };
            for line in rule_lines(&content) {
                let fields = RuleFields::parse(line);
                if fields.devpath.as_deref() == Some(port_path.as_str()) {
                    found.push(NamingRule {
                        file: file.clone(),
                        line: line.to_string(),
                        port_path: port_path.clone(),
                        symlink: fields.symlink,
                    });
                }
            }
        }
        found
    }

    /// Write `content` to a temp file and move it over `dest`
    fn stage_and_install(&self, content: &str, dest: &Path) -> Result<(), String> {
        let mut tmp = NamedTempFile::new_in(&self.config.temp_dir).map_err(|e| e.to_string())?;
        tmp.write_all(content.as_bytes())
            .and_then(|_| tmp.flush())
            .map_err(|e| e.to_string())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))
                .map_err(|e| e.to_string())?;
        }

        // The temp path is handed over to the privileged move; if that move
        // fails the guard still deletes it
        let staged = tmp.into_temp_path();
        self.privileged
            .install(&staged, dest)
            .map_err(|e| e.to_string())?;
        // Already moved away; nothing left to clean up
        let _ = staged.keep();
        Ok(())
    }

    /// Rewrite `file` without `line`
    ///
    /// The file is read again here, so a line already removed by someone else
    /// is not an error. A managed file left without rules is deleted; other
    /// files are kept even when empty.
    pub fn remove_line(&mut self, file: &Path, line: &str) -> Result<(), RuleError> {
        let content = fs::read_to_string(file).map_err(|source| RuleError::Scan {
            file: file.to_path_buf(),
            source,
        })?;

        let target = line.trim();
        let kept: Vec<&str> = content
            .lines()
            .filter(|candidate| candidate.trim() != target)
            .collect();
        if kept.len() == content.lines().count() {
            debug!("Rule already gone from {}", file.display());
            return Ok(());
        }

        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }

        // A managed file with no rules left would never be pruned
        if is_managed_file_name(file) && rule_lines(&rewritten).next().is_none() {
            self.privileged
                .remove(file)
                .map_err(|e| RuleError::Remove {
                    file: file.to_path_buf(),
                    reason: e.to_string(),
                })?;
            info!("Removed emptied rule file {}", file.display());
            return Ok(());
        }

        self.stage_and_install(&rewritten, file)
            .map_err(|reason| RuleError::Remove {
                file: file.to_path_buf(),
                reason,
            })?;
        info!("Removed rule from {}", file.display());
        Ok(())
    }

    /// Make `name` the one and only symlink bound to `port_path`
    pub fn reconcile(
        &mut self,
        name: &str,
        port_path: &PortPath,
    ) -> Result<ReconcileReport, RuleError> {
        if sanitize_symlink_name(name).as_deref() != Some(name) {
            return Err(RuleError::InvalidName(name.to_string()));
        }

        let existing = self.find_existing(port_path);
        if !existing.is_empty() {
            info!("Found {} existing rule(s) for {}", existing.len(), port_path);
        }

        let mut removed = Vec::new();
        let mut failures = Vec::new();
        let mut bound = None;

        for rule in existing {
            if rule.symlink.as_deref() == Some(name) {
                debug!("Rule with matching symlink already in {}", rule.file.display());
                bound.get_or_insert_with(|| rule.file.clone());
                continue;
            }

            info!(
                "Removing different rule for same port (symlink {:?} != {:?}) from {}",
                rule.symlink.as_deref().unwrap_or("<none>"),
                name,
                rule.file.display()
            );
            match self.remove_line(&rule.file, &rule.line) {
                Ok(()) => removed.push(rule),
                Err(e) => {
                    warn!("{}", e);
                    failures.push(e);
                }
            }
        }

        if let Some(file) = bound {
            return Ok(ReconcileReport {
                outcome: ReconcileOutcome::AlreadyBound { file },
                removed,
                failures,
            });
        }

        let file = self.config.rules_dir.join(rule_file_name(name));
        let content = format!("{}\n", render_rule(port_path, name));
        info!("Installing rule file {}...", file.display());
        self.stage_and_install(&content, &file)
            .map_err(|reason| RuleError::Write {
                file: file.clone(),
                reason,
            })?;
        info!("Created udev rule for {}", name);

        // The rule is on disk either way; a failed reload only delays it
        for result in [self.privileged.reload_rules(), self.privileged.trigger()] {
            if let Err(e) = result {
                warn!("{}", e);
                failures.push(e);
            }
        }

        Ok(ReconcileReport {
            outcome: ReconcileOutcome::Installed { file },
            removed,
            failures,
        })
    }

    /// Delete managed rule files whose embedded enumeration index is not in
    /// `current`
    pub fn prune_stale(&mut self, current: &[DeviceNode]) -> PruneReport {
        let present: HashSet<EnumerationIndex> = current
            .iter()
            .filter_map(DeviceNode::enumeration_index)
            .collect();
        debug!(
            "Current device indices: {:?}",
            present.iter().map(ToString::to_string).collect::<Vec<_>>()
        );

        let mut report = PruneReport::default();
        for file in self.rule_files() {
            if !is_managed_file_name(&file) {
                continue;
            }
            let content = match fs::read_to_string(&file) {
                Ok(content) => content,
                Err(source) => {
                    let e = RuleError::Scan { file, source };
                    warn!("{}", e);
                    report.failures.push(e);
                    continue;
                }
            };
            if !is_managed_content(&content) {
                continue;
            }
            let Some(index) = rule_lines(&content).find_map(EnumerationIndex::find_in) else {
                continue;
            };
            if present.contains(&index) {
                continue;
            }

            info!("Removing stale rule file for {}: {}", index, file.display());
            match self.privileged.remove(&file) {
                Ok(()) => report.removed.push(file),
                Err(e) => {
                    let e = RuleError::Remove {
                        file,
                        reason: e.to_string(),
                    };
                    warn!("{}", e);
                    report.failures.push(e);
                }
            }
        }
        report
    }
}
