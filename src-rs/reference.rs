use crate::command::CommandTemplate;
use crate::compare::CompareRequest;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::thread;
use tracing::{debug, warn};

pub const DEFAULT_SNAPSHOT_CMD: &str = "curl -s http://localhost:8080/0/action/snapshot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Normal,
    AwaitingReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetReference {
    /// Newly armed; the caller should trigger a snapshot.
    Armed,
    /// A capture is already pending. The state is unchanged but the caller
    /// may retry the snapshot, since the first request can fail silently.
    AlreadyArmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRoute {
    /// The frame became the new reference and must not be aggregated.
    Reference,
    Aggregate(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneDecision {
    VerifyAgainstReference(CompareRequest),
    Unconfirmed,
}

/// Two-state machine deciding whether the next captured frame becomes the
/// reference, and whether a scene change needs confirming against it.
#[derive(Debug)]
pub struct ReferenceController {
    state: ControllerState,
    reference: Option<PathBuf>,
    reference_fuzz: u8,
}

impl ReferenceController {
    pub fn new(reference_fuzz: u8) -> Self {
        Self {
            state: ControllerState::Normal,
            reference: None,
            reference_fuzz,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn reference(&self) -> Option<&Path> {
        self.reference.as_deref()
    }

    pub fn set_reference(&mut self) -> SetReference {
        match self.state {
            ControllerState::AwaitingReference => SetReference::AlreadyArmed,
            ControllerState::Normal => {
                self.state = ControllerState::AwaitingReference;
                SetReference::Armed
            }
        }
    }

    pub fn on_frame_captured(&mut self, image: PathBuf) -> FrameRoute {
        match self.state {
            ControllerState::AwaitingReference => {
                self.reference = Some(image);
                self.state = ControllerState::Normal;
                FrameRoute::Reference
            }
            ControllerState::Normal => FrameRoute::Aggregate(image),
        }
    }

    pub fn on_scene_changed(&self, after: &Path) -> SceneDecision {
        match &self.reference {
            Some(reference) => SceneDecision::VerifyAgainstReference(CompareRequest {
                before: reference.clone(),
                after: after.to_path_buf(),
                fuzz_percent: self.reference_fuzz,
            }),
            None => SceneDecision::Unconfirmed,
        }
    }
}

/// Asks the daemon for an out-of-band still. The result shows up later as a
/// `picture_save` event.
#[derive(Debug, Clone)]
pub struct SnapshotTrigger {
    template: CommandTemplate,
}

impl SnapshotTrigger {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }

    pub fn fire(&self) -> Result<()> {
        let mut child = self
            .template
            .command(&[])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to run snapshot command: {}", self.template))?;

        thread::spawn(move || match child.wait() {
            Ok(status) if status.success() => debug!("snapshot command finished"),
            Ok(status) => warn!(
                status = status.code().unwrap_or(-1),
                "snapshot command exited unsuccessfully"
            ),
            Err(err) => warn!(error = %err, "failed to wait for snapshot command"),
        });
        Ok(())
    }
}
