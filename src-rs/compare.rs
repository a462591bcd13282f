use crate::command::{tail_text, CommandTemplate};
use anyhow::{bail, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_DIFF_CMD: &str = "compare -metric AE -fuzz {fuzz}% {before} {after} null:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub before: PathBuf,
    pub after: PathBuf,
    pub fuzz_percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonResult {
    pub before: PathBuf,
    pub after: PathBuf,
    pub fuzz_percent: u8,
    pub score: u64,
    pub changed: bool,
    /// Set when the tool could not produce a score; the result then reads as
    /// "no change".
    pub error: Option<String>,
}

impl ComparisonResult {
    pub fn scored(request: CompareRequest, score: u64) -> Self {
        Self {
            before: request.before,
            after: request.after,
            fuzz_percent: request.fuzz_percent,
            score,
            changed: score > 0,
            error: None,
        }
    }

    pub fn failed(request: CompareRequest, err: &CompareError) -> Self {
        Self {
            before: request.before,
            after: request.after,
            fuzz_percent: request.fuzz_percent,
            score: 0,
            changed: false,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompareError {
    #[error("failed to run diff tool `{program}`: {reason}")]
    Spawn { program: String, reason: String },
    #[error("diff tool reported no distortion metric")]
    MissingMetric,
    #[error("diff tool reported a non-numeric metric: {0}")]
    NonNumeric(String),
}

/// External image-difference tool, e.g. ImageMagick `compare -metric AE`.
#[derive(Debug, Clone)]
pub struct DiffTool {
    template: CommandTemplate,
}

impl DiffTool {
    pub fn new(template: CommandTemplate) -> Result<Self> {
        for placeholder in ["before", "after"] {
            if !template.mentions(placeholder) {
                bail!("diff command must reference {{{placeholder}}}: {template}");
            }
        }
        Ok(Self { template })
    }

    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }

    /// Runs the tool to completion. Failures degrade to a "no change" result
    /// carrying the error text.
    pub fn compare(&self, request: CompareRequest) -> ComparisonResult {
        match self.distortion(&request) {
            Ok(score) => ComparisonResult::scored(request, score),
            Err(err) => ComparisonResult::failed(request, &err),
        }
    }

    fn distortion(&self, request: &CompareRequest) -> Result<u64, CompareError> {
        let fuzz = request.fuzz_percent.to_string();
        let before = request.before.to_string_lossy();
        let after = request.after.to_string_lossy();
        let mut cmd = self.template.command(&[
            ("fuzz", fuzz.as_str()),
            ("before", before.as_ref()),
            ("after", after.as_ref()),
        ]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = cmd.output().map_err(|err| CompareError::Spawn {
            program: self.template.program().to_string(),
            reason: err.to_string(),
        })?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            before = %request.before.display(),
            after = %request.after.display(),
            status = output.status.code().unwrap_or(-1),
            stderr = %tail_text(&stderr, 200),
            "diff tool finished"
        );
        parse_distortion(&stderr)
    }
}

/// Reads the distortion score from the tool's stderr.
///
/// The metric is the leading token of the last non-empty line. Integer and
/// scientific notation (`1.2e+06`, printed by ImageMagick for large counts)
/// are accepted; negative or non-finite values are not.
pub fn parse_distortion(stderr: &str) -> Result<u64, CompareError> {
    let line = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .ok_or(CompareError::MissingMetric)?;
    let token = line
        .split_whitespace()
        .next()
        .ok_or(CompareError::MissingMetric)?;

    if let Ok(score) = token.parse::<u64>() {
        return Ok(score);
    }
    match token.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value.round() as u64),
        _ => Err(CompareError::NonNumeric(line.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompareRequest {
        CompareRequest {
            before: PathBuf::from("x.jpg"),
            after: PathBuf::from("y.jpg"),
            fuzz_percent: 20,
        }
    }

    fn tool(script: &str) -> DiffTool {
        let raw = format!("sh -c '{script}' diff {{fuzz}} {{before}} {{after}}");
        DiffTool::new(CommandTemplate::parse(&raw).unwrap()).unwrap()
    }

    #[test]
    fn parses_plain_and_scientific_scores() {
        assert_eq!(parse_distortion("0\n"), Ok(0));
        assert_eq!(parse_distortion("  42 (0.0123)"), Ok(42));
        assert_eq!(parse_distortion("1.5e+03"), Ok(1500));
        assert_eq!(parse_distortion("warning: profile\n17\n"), Ok(17));
    }

    #[test]
    fn rejects_missing_or_garbage_scores() {
        assert_eq!(parse_distortion(""), Err(CompareError::MissingMetric));
        assert_eq!(parse_distortion(" \n \n"), Err(CompareError::MissingMetric));
        assert!(matches!(
            parse_distortion("compare: unable to open image"),
            Err(CompareError::NonNumeric(_))
        ));
        assert!(matches!(
            parse_distortion("-3"),
            Err(CompareError::NonNumeric(_))
        ));
    }

    #[test]
    fn zero_score_means_no_change() {
        let result = tool("echo 0 >&2").compare(request());
        assert_eq!(result.score, 0);
        assert!(!result.changed);
        assert_eq!(result.error, None);
    }

    #[test]
    fn positive_score_means_changed() {
        let result = tool("echo 5 >&2; echo ignored").compare(request());
        assert_eq!(result.score, 5);
        assert!(result.changed);
        assert_eq!(result.before, PathBuf::from("x.jpg"));
        assert_eq!(result.after, PathBuf::from("y.jpg"));
    }

    #[test]
    fn tool_receives_fuzz_and_paths() {
        // Score is the fuzz argument, proving substitution order.
        let result = tool("echo $1 >&2").compare(request());
        assert_eq!(result.score, 20);
    }

    #[test]
    fn unparseable_output_fails_open() {
        let result = tool("echo boom >&2; exit 2").compare(request());
        assert!(!result.changed);
        assert_eq!(result.score, 0);
        assert!(result.error.is_some());
    }

    #[test]
    fn missing_tool_fails_open() {
        let template =
            CommandTemplate::parse("/nonexistent/kyyla-diff {before} {after}").unwrap();
        let result = DiffTool::new(template).unwrap().compare(request());
        assert!(!result.changed);
        assert!(result
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("failed to run diff tool"));
    }

    #[test]
    fn template_must_reference_both_images() {
        let template = CommandTemplate::parse("compare {before} null:").unwrap();
        assert!(DiffTool::new(template).is_err());
    }
}
