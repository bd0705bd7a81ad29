//! One pass over the attached hardware
//!
//! Enumerate, prune rules for vanished devices, probe everything, then bind
//! each named device to its physical port. Rule writes happen one device at a
//! time even when probing runs concurrently.

use std::sync::Arc;

use portbind_detect::{
    DetectError, DeviceNode, DeviceProber, DeviceScanner, PortOpener, PortPathResolver,
    ProbeError, ProbeOutcome,
};
use portbind_rules::{sanitize_symlink_name, Privileged, ReconcileOutcome, RuleStore};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Probe outcome for every enumerated node, in enumeration order
pub type DeviceRegistry = Vec<(DeviceNode, ProbeOutcome)>;

/// Totals for one run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub devices: usize,
    pub identified: usize,
    pub fallback: usize,
    pub no_response: usize,
    pub rules_installed: usize,
    pub rules_unchanged: usize,
    pub conflicts_removed: usize,
    pub stale_removed: usize,
    pub cancelled: bool,
    pub failures: Vec<String>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    fn fail(&mut self, message: String) {
        warn!("{}", message);
        self.failures.push(message);
    }
}

pub struct Reconciler<O, P> {
    scanner: DeviceScanner,
    prober: Arc<DeviceProber<O>>,
    resolver: PortPathResolver,
    store: RuleStore<P>,
    parallel_probe: bool,
}

impl<O, P> Reconciler<O, P>
where
    O: PortOpener + 'static,
    P: Privileged,
{
    pub fn new(
        scanner: DeviceScanner,
        prober: DeviceProber<O>,
        resolver: PortPathResolver,
        store: RuleStore<P>,
    ) -> Self {
        Self {
            scanner,
            prober: Arc::new(prober),
            resolver,
            store,
            parallel_probe: false,
        }
    }

    /// Probe all nodes at once instead of one after another
    pub fn parallel_probe(mut self, enabled: bool) -> Self {
        self.parallel_probe = enabled;
        self
    }

    /// Run one full pass
    ///
    /// Only enumeration failure is fatal; everything per device ends up in
    /// [`RunSummary::failures`].
    pub async fn run(&mut self) -> Result<RunSummary, DetectError> {
        let nodes = self.scanner.enumerate()?;
        let mut summary = RunSummary {
            devices: nodes.len(),
            ..Default::default()
        };
        if nodes.is_empty() {
            warn!("No USB-serial devices found, leaving rules untouched");
            return Ok(summary);
        }

        info!("Checking for stale device rules...");
        let prune = self.store.prune_stale(&nodes);
        summary.stale_removed = prune.removed.len();
        for e in prune.failures {
            summary.failures.push(e.to_string());
        }

        let registry = match self.probe_all(nodes).await {
            Ok(registry) => registry,
            Err(ProbeError::Cancelled) => {
                warn!("Probing cancelled, no rules written");
                summary.cancelled = true;
                return Ok(summary);
            }
        };

        for (node, outcome) in &registry {
            match outcome {
                ProbeOutcome::Identified(_) => summary.identified += 1,
                ProbeOutcome::GenericFallback(_) => summary.fallback += 1,
                ProbeOutcome::NoResponse => {
                    summary.no_response += 1;
                    summary.fail(format!("{}: no response", node));
                }
            }
        }

        for (node, outcome) in &registry {
            self.bind(node, outcome, &mut summary);
        }
        Ok(summary)
    }

    async fn probe_all(&self, nodes: Vec<DeviceNode>) -> Result<DeviceRegistry, ProbeError> {
        if !self.parallel_probe {
            let mut registry = Vec::with_capacity(nodes.len());
            for node in nodes {
                let report = self.prober.probe(&node).await?;
                registry.push((node, report.outcome));
            }
            return Ok(registry);
        }

        let mut tasks = JoinSet::new();
        for (index, node) in nodes.iter().cloned().enumerate() {
            let prober = Arc::clone(&self.prober);
            tasks.spawn(async move {
                let report = prober.probe(&node).await;
                (index, report)
            });
        }

        let mut outcomes: Vec<Option<ProbeOutcome>> = vec![None; nodes.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => outcomes[index] = Some(report?.outcome),
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }

        Ok(nodes
            .into_iter()
            .zip(outcomes)
            .map(|(node, outcome)| (node, outcome.unwrap_or(ProbeOutcome::NoResponse)))
            .collect())
    }

    /// Resolve and write the rule for one device
    fn bind(&mut self, node: &DeviceNode, outcome: &ProbeOutcome, summary: &mut RunSummary) {
        let Some(raw) = outcome.symlink_name() else {
            return;
        };
        let Some(name) = sanitize_symlink_name(&raw) else {
            summary.fail(format!("{}: unusable symlink name {:?}", node, raw));
            return;
        };

        let port_path = match self.resolver.resolve(node) {
            Ok(path) => path,
            Err(e) => {
                summary.fail(format!("{}: {}", node, e));
                return;
            }
        };
        info!("{} -> {} at {}", node, name, port_path);

        match self.store.reconcile(&name, &port_path) {
            Ok(report) => {
                match report.outcome {
                    ReconcileOutcome::Installed { .. } => summary.rules_installed += 1,
                    ReconcileOutcome::AlreadyBound { .. } => {
                        info!("Rule for {} already up to date", name);
                        summary.rules_unchanged += 1
                    }
                }
                summary.conflicts_removed += report.removed.len();
                for e in report.failures {
                    summary.failures.push(format!("{}: {}", node, e));
                }
            }
            Err(e) => summary.fail(format!("{}: {}", node, e)),
        }
    }
}
