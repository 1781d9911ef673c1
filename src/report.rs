//! Failure reports.
//!
//! When the aggregator decides a run failed badly enough, a [`RunSummary`] is rendered
//! and handed to a [`ReportSender`]. Delivery problems are the reporter's to log; they
//! never change the run's result.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::FailureReason;
use crate::device::TaskOutcome;
use crate::session::RunResult;

/// Subject of a regular failure report.
pub const FAILURE_SUBJECT: &str = "RFWScopeDAQ Failure Report";
/// Subject used when the run never started for lack of disk space.
pub const STORAGE_SUBJECT: &str = "RFWScopeDAQ: Insufficient free space";

/// Label used for failures that concern the whole run.
const WHOLE_RUN: &str = "run";

/// Report delivery failure.
#[derive(Error, Debug)]
pub enum ReportError {
    /// The mail transfer program could not be started or fed.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program path.
        program: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The mail transfer program rejected the message.
    #[error("{program} exited with {status}: {stderr}")]
    Rejected {
        /// Program path.
        program: PathBuf,
        /// Exit status.
        status: String,
        /// What it printed on stderr.
        stderr: String,
    },
}

/// Outcome of one device, as shown in a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    /// Device name, or `run` for whole-run failures.
    pub device: String,
    /// `true` if the device counted as failed.
    pub failed: bool,
    /// Reasons recorded for it.
    pub reasons: Vec<String>,
}

/// Everything a report says about a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Run id.
    pub run_id: Uuid,
    /// Zone or device that was requested.
    pub selection: String,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Devices considered.
    pub total: usize,
    /// Devices counted as failed.
    pub failed: usize,
    /// `failed / total`.
    pub ratio: f64,
    /// Threshold that was exceeded.
    pub threshold: f64,
    /// Per-device detail, whole-run failures first.
    pub devices: Vec<DeviceSummary>,
    /// `true` if the run was stopped by lack of disk space.
    pub storage_exhausted: bool,
}

impl RunSummary {
    /// Summarise a finished run.
    pub fn from_result(result: &RunResult) -> Self {
        let mut reasons: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for task in &result.tasks {
            reasons.entry(task.device().to_string()).or_default();
        }
        let mut whole_run = Vec::new();
        for record in &result.failures {
            match &record.device {
                Some(device) => reasons
                    .entry(device.to_string())
                    .or_default()
                    .push(format!("[{}] {}", record.phase, record.reason)),
                None => whole_run.push(format!("[{}] {}", record.phase, record.reason)),
            }
        }

        let mut devices = Vec::with_capacity(reasons.len() + 1);
        if !whole_run.is_empty() {
            devices.push(DeviceSummary {
                device: WHOLE_RUN.to_string(),
                failed: true,
                reasons: whole_run,
            });
        }
        devices.extend(reasons.into_iter().map(|(device, reasons)| {
            let task_failed = result.tasks.iter().any(|task| {
                task.device().as_str() == device && matches!(task.outcome(), TaskOutcome::Failed(_))
            });
            DeviceSummary {
                failed: task_failed || !reasons.is_empty(),
                device,
                reasons,
            }
        }));

        Self {
            run_id: result.run_id,
            selection: result.selection.to_string(),
            started_at: result.started_at,
            finished_at: result.finished_at,
            total: result.verdict.total,
            failed: result.verdict.failed,
            ratio: result.verdict.ratio,
            threshold: result.verdict.threshold,
            devices,
            storage_exhausted: result.failures.iter().any(|record| {
                matches!(record.reason, FailureReason::InsufficientStorage { .. })
            }),
        }
    }

    /// Message subject.
    pub fn subject(&self) -> &'static str {
        if self.storage_exhausted {
            STORAGE_SUBJECT
        } else {
            FAILURE_SUBJECT
        }
    }

    /// Plain-text message body.
    pub fn render_text(&self) -> String {
        let mut body = format!(
            "Failure report for run ending at {}\n\n",
            self.finished_at.format("%Y-%m-%d %H:%M:%S")
        );
        body.push_str(&format!("Run: {}\n", self.run_id));
        body.push_str(&format!("Selection: {}\n", self.selection));
        body.push_str(&format!(
            "Started: {}\n",
            self.started_at.format("%Y-%m-%d %H:%M:%S")
        ));
        body.push_str(&format!(
            "Failed: {} / {} devices ({:.1}% > {:.1}% threshold)\n\n",
            self.failed,
            self.total,
            self.ratio * 100.0,
            self.threshold * 100.0
        ));
        for device in &self.devices {
            let status = if device.failed { "failed" } else { "succeeded" };
            body.push_str(&format!("{}: {status}\n", device.device));
            for reason in &device.reasons {
                body.push_str(&format!("  {reason}\n"));
            }
            body.push('\n');
        }
        body
    }
}

/// Delivers run summaries.
#[async_trait]
pub trait ReportSender: Send + Sync {
    /// Deliver `summary`.
    async fn send(&self, summary: &RunSummary) -> Result<(), ReportError>;
}

/// Pipes an RFC 5322 message into `sendmail -t`.
#[derive(Debug, Clone)]
pub struct SendmailReporter {
    program: PathBuf,
    from: String,
    recipients: Vec<String>,
}

impl SendmailReporter {
    /// Reporter mailing `recipients` from `from` through `program`.
    pub fn new(program: impl Into<PathBuf>, from: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            program: program.into(),
            from: from.into(),
            recipients,
        }
    }

    /// Full message text, headers included.
    pub fn message(&self, summary: &RunSummary) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\n{}",
            self.from,
            self.recipients.join(","),
            summary.subject(),
            summary.render_text()
        )
    }
}

#[async_trait]
impl ReportSender for SendmailReporter {
    async fn send(&self, summary: &RunSummary) -> Result<(), ReportError> {
        let spawn_error = |source| ReportError::Spawn {
            program: self.program.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(self.message(summary).as_bytes())
                .await
                .map_err(spawn_error)?;
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        if !output.status.success() {
            return Err(ReportError::Rejected {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(recipients = ?self.recipients, subject = summary.subject(), "failure report sent");
        Ok(())
    }
}

/// Writes the summary to the log instead of mailing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

#[async_trait]
impl ReportSender for LogReporter {
    async fn send(&self, summary: &RunSummary) -> Result<(), ReportError> {
        warn!(
            subject = summary.subject(),
            failed = summary.failed,
            total = summary.total,
            "{}",
            summary.render_text()
        );
        Ok(())
    }
}
