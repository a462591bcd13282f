//! Event correlation and change detection.
//!
//! [`Coordinator`] owns every piece of mutable pipeline state and is driven
//! one [`PipelineMessage`] at a time. Anything that may block (diff tool,
//! alert command, snapshot trigger) goes through [`Effects`]; diff results
//! come back later as [`PipelineMessage::ComparisonFinished`].

use crate::compare::{CompareRequest, ComparisonResult};
use crate::console::{self, ConsoleCommand, ConsoleInput, COMMANDS};
use crate::event::{decode_line, Event};
use crate::frames::FrameAggregator;
use crate::reference::{FrameRoute, ReferenceController, SceneDecision, SetReference};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparePurpose {
    /// First frame of the previous event group against this group's first.
    Scene { event_id: u64 },
    /// Reference frame against the frame that changed the scene.
    Reference { event_id: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineMessage {
    DaemonLine(String),
    ConsoleLine(String),
    KeyPressed(u16),
    ComparisonFinished {
        purpose: ComparePurpose,
        result: ComparisonResult,
    },
}

/// Side effects the coordinator requests but never waits on.
pub trait Effects {
    /// Must eventually deliver `ComparisonFinished` for `purpose`.
    fn compare(&mut self, purpose: ComparePurpose, request: CompareRequest);
    fn fire_alert(&mut self);
    fn trigger_snapshot(&mut self);
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub scene_fuzz: u8,
    pub reference_fuzz: u8,
    pub keep_groups: usize,
    pub setref_key: Option<u16>,
}

pub struct Coordinator<E: Effects> {
    frames: FrameAggregator,
    controller: ReferenceController,
    alert_active: bool,
    current_event_id: Option<u64>,
    scene_fuzz: u8,
    setref_key: Option<u16>,
    effects: E,
}

impl<E: Effects> Coordinator<E> {
    pub fn new(config: CoordinatorConfig, effects: E) -> Self {
        Self {
            frames: FrameAggregator::new(config.keep_groups),
            controller: ReferenceController::new(config.reference_fuzz),
            alert_active: false,
            current_event_id: None,
            scene_fuzz: config.scene_fuzz,
            setref_key: config.setref_key,
            effects,
        }
    }

    pub fn frames(&self) -> &FrameAggregator {
        &self.frames
    }

    pub fn controller(&self) -> &ReferenceController {
        &self.controller
    }

    pub fn alert_active(&self) -> bool {
        self.alert_active
    }

    pub fn current_event_id(&self) -> Option<u64> {
        self.current_event_id
    }

    pub fn effects(&self) -> &E {
        &self.effects
    }

    pub fn handle(&mut self, message: PipelineMessage) {
        match message {
            PipelineMessage::DaemonLine(line) => self.on_daemon_line(&line),
            PipelineMessage::ConsoleLine(line) => self.on_console_line(&line),
            PipelineMessage::KeyPressed(code) => self.on_key_pressed(code),
            PipelineMessage::ComparisonFinished { purpose, result } => {
                self.on_comparison_finished(purpose, result)
            }
        }
    }

    /// A respawned daemon numbers its events from scratch, so groups from
    /// the previous session are dropped. Reference and alert state survive.
    pub fn on_daemon_restarted(&mut self) {
        info!(
            groups = self.frames.group_count(),
            "daemon restarted; discarding frame groups"
        );
        self.frames.clear();
        self.current_event_id = None;
    }

    pub fn set_reference(&mut self) {
        match self.controller.set_reference() {
            SetReference::Armed => {
                info!("awaiting reference frame; requesting snapshot");
                self.effects.trigger_snapshot();
            }
            SetReference::AlreadyArmed => {
                info!("reference frame already pending; requesting snapshot again");
                self.effects.trigger_snapshot();
            }
        }
    }

    fn on_daemon_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match decode_line(line) {
            Ok(event) => {
                debug!(action = ?event.action(), event_id = ?event.event_id(), "daemon event");
                self.dispatch(event)
            }
            Err(err) => warn!(error = %err, line, "dropping undecodable daemon line"),
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::EventStart { event_id } => {
                self.current_event_id = Some(event_id);
                info!(event_id, "motion event started");
            }
            Event::EventEnd { event_id } => {
                info!(event_id, "motion event ended");
            }
            Event::MotionDetected { event_id } => {
                debug!(event_id, "motion detected");
            }
            Event::PictureSave { event_id, image } => self.on_picture_saved(event_id, image),
            Event::Unknown { raw_action } => {
                debug!(action = ?raw_action, "ignoring event with unknown action");
            }
        }
    }

    fn on_picture_saved(&mut self, event_id: u64, image: PathBuf) {
        self.current_event_id = Some(event_id);
        let image = match self.controller.on_frame_captured(image.clone()) {
            FrameRoute::Reference => {
                info!(event_id, image = %image.display(), "reference frame set");
                return;
            }
            FrameRoute::Aggregate(image) => image,
        };

        let recorded = self.frames.record_frame(event_id, image.clone());
        debug!(
            event_id,
            image = %image.display(),
            frames = recorded.group.len(),
            "frame recorded"
        );
        if !recorded.created {
            return;
        }

        let Some(before) = event_id
            .checked_sub(1)
            .and_then(|previous| self.frames.first_frame(previous))
            .map(|path| path.to_path_buf())
        else {
            debug!(event_id, "no previous frame group; seeding comparisons");
            return;
        };

        info!(
            event_id,
            before = %before.display(),
            after = %image.display(),
            "comparing scene against previous event"
        );
        self.effects.compare(
            ComparePurpose::Scene { event_id },
            CompareRequest {
                before,
                after: image,
                fuzz_percent: self.scene_fuzz,
            },
        );
        self.frames.drop_first_frame(event_id);
    }

    fn on_comparison_finished(&mut self, purpose: ComparePurpose, result: ComparisonResult) {
        if let Some(err) = &result.error {
            warn!(
                purpose = ?purpose,
                error = %err,
                "diff tool failed; treating as no change"
            );
        }

        match purpose {
            ComparePurpose::Scene { event_id } => {
                if result.changed {
                    info!(event_id, score = result.score, "scene changed");
                    self.on_scene_changed(event_id, result.after);
                } else {
                    info!(event_id, score = result.score, "scene unchanged");
                }
            }
            ComparePurpose::Reference { event_id } => {
                if result.changed {
                    info!(
                        event_id,
                        score = result.score,
                        "change confirmed against reference frame"
                    );
                    if self.alert_active {
                        debug!("alert already active; firing again");
                    }
                    self.alert_active = true;
                    self.effects.fire_alert();
                } else {
                    info!(
                        event_id,
                        score = result.score,
                        "scene matches reference frame; no alert"
                    );
                }
            }
        }
    }

    fn on_scene_changed(&mut self, event_id: u64, after: PathBuf) {
        match self.controller.on_scene_changed(&after) {
            SceneDecision::VerifyAgainstReference(request) => {
                debug!(
                    event_id,
                    reference = %request.before.display(),
                    "verifying change against reference frame"
                );
                self.effects
                    .compare(ComparePurpose::Reference { event_id }, request);
            }
            SceneDecision::Unconfirmed => {
                warn!(
                    event_id,
                    image = %after.display(),
                    "unconfirmed scene change: no reference frame set (use `setref`)"
                );
            }
        }
    }

    fn on_console_line(&mut self, line: &str) {
        match console::parse_line(line) {
            ConsoleInput::Command(command) => self.run_command(command),
            ConsoleInput::Empty => {}
            ConsoleInput::Unknown(input) => {
                warn!(input = %input, "unknown console command (try `help`)");
            }
        }
    }

    fn run_command(&mut self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::SetReference => self.set_reference(),
            ConsoleCommand::Status => {
                info!(
                    state = ?self.controller.state(),
                    reference = ?self.controller.reference(),
                    alert_active = self.alert_active,
                    event_id = ?self.current_event_id,
                    groups = self.frames.group_count(),
                    "status"
                );
            }
            ConsoleCommand::Help => {
                for spec in COMMANDS {
                    info!(command = spec.name, "{}", spec.description);
                }
            }
        }
    }

    fn on_key_pressed(&mut self, code: u16) {
        if self.alert_active {
            self.alert_active = false;
            info!(key = code, "alert acknowledged");
        }
        if self.setref_key == Some(code) {
            self.set_reference();
        } else {
            debug!(key = code, "key pressed");
        }
    }
}
