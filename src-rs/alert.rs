use crate::command::{tail_text, CommandTemplate};
use anyhow::{Context, Result};
use std::process::Stdio;
use tracing::info;

pub const DEFAULT_ALERT_CMD: &str = "./alert.sh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertReport {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl AlertReport {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs the operator's alert command. Its exit status is reported, never
/// fed back into the pipeline.
#[derive(Debug, Clone)]
pub struct AlertDispatcher {
    template: CommandTemplate,
}

impl AlertDispatcher {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }

    pub fn fire(&self) -> Result<AlertReport> {
        info!(command = %self.template, "firing alert");
        let output = self
            .template
            .command(&[])
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run alert command: {}", self.template))?;

        let report = AlertReport {
            status: output.status.code(),
            stdout: tail_text(&String::from_utf8_lossy(&output.stdout), 1200),
            stderr: tail_text(&String::from_utf8_lossy(&output.stderr), 1200),
        };
        info!(
            status = report.status.unwrap_or(-1),
            stdout = %report.stdout,
            stderr = %report.stderr,
            "alert command finished"
        );
        Ok(report)
    }
}
