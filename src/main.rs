//! CLI entry point for rfw_scope_daq.
//!
//! Collects one scope-mode capture from every cavity of a zone, or from a single
//! cavity, and stores the waveforms as TSV files or in a database.
//!
//! # Usage
//!
//! ```bash
//! rfw_scope_daq --simulate -z R1M -t 2 -d /data/rfw-scope
//! rfw_scope_daq --simulate -c R1M3 -o database -E
//! ```
//!
//! Exit status is 0 when the run completed within its failure threshold and 1 when a
//! failure report was triggered or the run could not start.
//!
//! Ctrl+C or SIGTERM stops the run early. Unfinished devices are recorded as
//! `duration_exceeded` and their scopes restored before the process exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use rfw_scope_daq::config::{ScopeDaqConfig, DEFAULT_CONFIG_PATH};
use rfw_scope_daq::logging;
use rfw_scope_daq::precondition::SysinfoStorageGauge;
use rfw_scope_daq::pv::mock::SimulatedScopeIoc;
use rfw_scope_daq::pv::RemoteVariableClient;
use rfw_scope_daq::report::{LogReporter, ReportSender, SendmailReporter};
use rfw_scope_daq::session::ReportStatus;
use rfw_scope_daq::sink::{open_sink, SinkKind};
use rfw_scope_daq::validation::{duration_from_minutes, is_valid_email, is_valid_path};
use rfw_scope_daq::{CollectionRun, DeviceSelection, SessionCoordinator};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rfw_scope_daq")]
#[command(about = "Scope-mode waveform acquisition for RF cavities", long_about = None)]
#[command(group(ArgGroup::new("selection").required(true).args(["zone", "device"])))]
struct Cli {
    /// Zone to collect from, e.g. R1M
    #[arg(short = 'z', long)]
    zone: Option<String>,

    /// Single device to collect from, e.g. R1M1
    #[arg(short = 'c', long)]
    device: Option<String>,

    /// Run duration in minutes
    #[arg(short = 't', long)]
    duration: Option<f64>,

    /// Base output directory
    #[arg(short = 'd', long)]
    dir: Option<PathBuf>,

    /// Output destination: file or database
    #[arg(short = 'o', long)]
    output: Option<SinkKind>,

    /// Failure report recipients
    #[arg(short = 'e', long = "email", num_args = 1..)]
    email: Vec<String>,

    /// Never mail a report; log it instead
    #[arg(short = 'E', long = "no-email")]
    no_email: bool,

    /// Configuration file
    #[arg(short = 'f', long = "file", default_value = DEFAULT_CONFIG_PATH)]
    file: PathBuf,

    /// Collect from the simulated IOC instead of the control system
    #[arg(long)]
    simulate: bool,

    /// Only log errors
    #[arg(short = 'q', long)]
    quiet: bool,
}

impl Cli {
    fn apply(&self, config: &mut ScopeDaqConfig) -> Result<()> {
        if let Some(minutes) = self.duration {
            config.acquisition.duration = duration_from_minutes(minutes)
                .map_err(|e| anyhow::anyhow!("invalid duration {minutes}: {e}"))?;
        }
        if let Some(dir) = &self.dir {
            is_valid_path(dir).map_err(anyhow::Error::msg)?;
            config.output.base_dir = dir.clone();
        }
        if let Some(kind) = self.output {
            config.output.kind = kind;
        }
        if !self.email.is_empty() {
            for address in &self.email {
                is_valid_email(address)
                    .map_err(|e| anyhow::anyhow!("invalid address '{address}': {e}"))?;
            }
            config.report.recipients = self.email.clone();
        }
        if self.no_email {
            config.report.recipients.clear();
        }
        if self.quiet {
            config.application.log_level = "error".to_string();
        }
        Ok(())
    }

    fn selection(&self) -> Result<DeviceSelection> {
        Ok(match (&self.zone, &self.device) {
            (Some(zone), None) => DeviceSelection::zone(zone)?,
            (None, Some(device)) => DeviceSelection::device(device)?,
            _ => bail!("exactly one of --zone and --device is required"),
        })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = ScopeDaqConfig::load_from(&cli.file)
        .with_context(|| format!("loading {}", cli.file.display()))?;
    cli.apply(&mut config)?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let selection = cli.selection()?;
    let run = CollectionRun::from_config(&config, selection)?;

    if !cli.simulate {
        bail!("no control-system transport is built in; rerun with --simulate");
    }
    let client = simulated_ioc(&config, &run).await;

    let sink = open_sink(&run.sink)
        .await
        .with_context(|| format!("opening {} output", run.sink.kind()))?;
    let reporter: Arc<dyn ReportSender> = if config.report.recipients.is_empty() {
        info!("no report recipients, failure reports go to the log");
        Arc::new(LogReporter)
    } else {
        Arc::new(SendmailReporter::new(
            config.report.sendmail_path.clone(),
            config.report.from_addr.clone(),
            config.report.recipients.clone(),
        ))
    };

    let interrupt = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown_signal(interrupt.clone()));

    let coordinator = SessionCoordinator::new(client, sink, reporter, Arc::new(SysinfoStorageGauge));
    let result = coordinator.run_until(run, interrupt).await;

    if !cli.quiet {
        println!(
            "{}: {} of {} devices failed, {} waveforms stored",
            result.selection,
            result.verdict.failed,
            result.verdict.total,
            result.collected.len()
        );
        for record in &result.failures {
            let device = record
                .device
                .as_ref()
                .map_or_else(|| "run".to_string(), ToString::to_string);
            println!("  {device} [{}] {}", record.phase, record.reason);
        }
    }
    if let ReportStatus::DeliveryFailed(err) = &result.report {
        warn!(error = %err, "failure report was not delivered");
    }

    Ok(if result.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Cancels `interrupt` on Ctrl+C, or on SIGTERM where there is one.
async fn cancel_on_shutdown_signal(interrupt: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    warn!("shutdown signal received, stopping the run");
    interrupt.cancel();
}

async fn simulated_ioc(config: &ScopeDaqConfig, run: &CollectionRun) -> Arc<dyn RemoteVariableClient> {
    let ioc = SimulatedScopeIoc::new(
        config.acquisition.signals.clone(),
        config.acquisition.waveform_length,
    );
    for device in run.selection.resolve() {
        ioc.add_device(&device).await;
    }
    ioc.set_value(
        &config.preconditions.power_pv,
        config.preconditions.min_power.max(0.0) + 100.0,
    )
    .await;
    for pv in &config.acquisition.metadata_pvs {
        ioc.set_value(pv, 0.0).await;
    }
    Arc::new(ioc)
}
