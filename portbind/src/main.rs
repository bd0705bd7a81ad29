//! portbind
//!
//! Identifies the USB-serial peripherals attached right now and binds each one
//! to a stable `/dev/<name>` symlink keyed on the physical port it is plugged
//! into.

mod reconcile;
mod settings;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use portbind_detect::{
    CancelFlag, CommandRunner, DeviceProber, DeviceScanner, PortPathResolver, SerialOpener,
    SystemRunner,
};
use portbind_rules::{Direct, Privileged, RuleStore, Sudo};
use reconcile::Reconciler;
use settings::Settings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit status after Ctrl-C
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "portbind=info,portbind_detect=info,portbind_rules=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting portbind");

    let settings = Settings::load();
    tracing::debug!("Settings: {:?}", settings);

    // Probing only stops between attempts, so an open port is never abandoned
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping after the current attempt");
                cancel.cancel();
            }
        });
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let privileged: Box<dyn Privileged> = if settings.use_sudo {
        Box::new(Sudo::new(Arc::clone(&runner)))
    } else {
        Box::new(Direct::new(Arc::clone(&runner)))
    };

    let mut reconciler = Reconciler::new(
        DeviceScanner::with_config(settings.scanner_config()),
        DeviceProber::new(SerialOpener, settings.probe_config()).with_cancel(cancel),
        PortPathResolver::with_runner(runner, settings.resolver_config()),
        RuleStore::new(settings.rule_store_config(), privileged),
    )
    .parallel_probe(settings.parallel_probe);

    let summary = reconciler
        .run()
        .await
        .context("failed to enumerate serial devices")?;

    tracing::info!(
        "Done: {} device(s), {} identified, {} fallback, {} silent; {} rule(s) installed, {} unchanged, {} stale removed",
        summary.devices,
        summary.identified,
        summary.fallback,
        summary.no_response,
        summary.rules_installed,
        summary.rules_unchanged,
        summary.stale_removed
    );
    tracing::debug!("Summary: {}", serde_json::to_string(&summary)?);

    if summary.cancelled {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    if settings.strict_exit && summary.has_failures() {
        tracing::error!("{} failure(s) during run", summary.failures.len());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
