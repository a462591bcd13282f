use crate::alert::AlertDispatcher;
use crate::command::CommandTemplate;
use crate::compare::{CompareRequest, DiffTool};
use crate::config::RunArgs;
use crate::console::spawn_console_thread;
use crate::daemon::{classify_stderr, DaemonOutput, DaemonSignal, DaemonStream, DaemonSupervisor};
use crate::keyboard::KeyboardDevice;
use crate::pipeline::{ComparePurpose, Coordinator, CoordinatorConfig, Effects, PipelineMessage};
use crate::reference::SnapshotTrigger;
use crate::signals;
use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::process::ExitStatus;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const TICK: Duration = Duration::from_millis(200);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum Message {
    Pipeline(PipelineMessage),
    /// Output of the `session`-th spawned daemon.
    Daemon { session: u32, output: DaemonOutput },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    PermissionDenied,
    DaemonExited { code: Option<i32> },
}

impl ShutdownReason {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownReason::Signal => 0,
            ShutdownReason::PermissionDenied => 2,
            ShutdownReason::DaemonExited { code: Some(0) } => 0,
            ShutdownReason::DaemonExited { .. } => 3,
        }
    }
}

/// Runs diff, alert and snapshot commands off the event loop thread.
pub struct ExternalEffects {
    diff: Arc<DiffTool>,
    alert: Arc<AlertDispatcher>,
    snapshot: SnapshotTrigger,
    tx: Sender<Message>,
}

impl ExternalEffects {
    pub fn new(
        diff: DiffTool,
        alert: AlertDispatcher,
        snapshot: SnapshotTrigger,
        tx: Sender<Message>,
    ) -> Self {
        Self {
            diff: Arc::new(diff),
            alert: Arc::new(alert),
            snapshot,
            tx,
        }
    }
}

impl Effects for ExternalEffects {
    fn compare(&mut self, purpose: ComparePurpose, request: CompareRequest) {
        let diff = Arc::clone(&self.diff);
        let tx = self.tx.clone();
        thread::spawn(move || {
            let result = diff.compare(request);
            let message = PipelineMessage::ComparisonFinished { purpose, result };
            if tx.send(Message::Pipeline(message)).is_err() {
                debug!(purpose = ?purpose, "event loop gone; dropping comparison result");
            }
        });
    }

    fn fire_alert(&mut self) {
        let alert = Arc::clone(&self.alert);
        thread::spawn(move || {
            if let Err(err) = alert.fire() {
                error!(error = %format!("{err:#}"), "alert command failed");
            }
        });
    }

    fn trigger_snapshot(&mut self) {
        if let Err(err) = self.snapshot.fire() {
            error!(error = %format!("{err:#}"), "snapshot trigger failed");
        }
    }
}

/// Supervises the daemon and feeds the coordinator until a shutdown reason
/// comes up. Input devices are released before the daemon is stopped.
pub fn run(args: &RunArgs) -> Result<ShutdownReason> {
    args.validate()?;
    let diff = DiffTool::new(CommandTemplate::parse(&args.diff.diff_cmd)?)?;
    let alert = AlertDispatcher::new(CommandTemplate::parse(&args.alert_cmd)?);
    let snapshot = SnapshotTrigger::new(CommandTemplate::parse(&args.snapshot_cmd)?);

    signals::install_shutdown_handlers()?;
    let (tx, rx) = unbounded();

    let mut keyboard = match &args.keyboard_device {
        Some(path) => {
            let device = KeyboardDevice::open(path, args.grab_keyboard)?;
            let key_tx = tx.clone();
            device.spawn_reader(move |code| {
                key_tx
                    .send(Message::Pipeline(PipelineMessage::KeyPressed(code)))
                    .is_ok()
            })?;
            Some(device)
        }
        None => None,
    };

    let coordinator = Coordinator::new(
        CoordinatorConfig {
            scene_fuzz: args.scene_fuzz,
            reference_fuzz: args.reference_fuzz,
            keep_groups: args.keep_groups,
            setref_key: keyboard.as_ref().map(|_| args.setref_key),
        },
        ExternalEffects::new(diff, alert, snapshot, tx.clone()),
    );
    let daemon = DaemonSupervisor::motion(&args.motion_bin, &args.motion_conf);
    let mut event_loop = EventLoop::new(rx, tx.clone(), coordinator, daemon, args.restart_limit);

    if let Err(err) = event_loop.start() {
        if let Some(device) = keyboard.as_mut() {
            device.release();
        }
        return Err(err);
    }

    if !args.no_console {
        spawn_console_thread(move |line| {
            tx.send(Message::Pipeline(PipelineMessage::ConsoleLine(line)))
                .is_ok()
        });
        info!("console ready; type `help` for commands");
    }

    let reason = event_loop.run();

    info!(reason = ?reason, "shutting down");
    if let Some(device) = keyboard.as_mut() {
        device.release();
    }
    match event_loop.daemon.stop(args.stop_grace()) {
        Ok(Some(status)) => info!(status = %status, "daemon stopped"),
        Ok(None) => {}
        Err(err) => warn!(error = %format!("{err:#}"), "failed to stop daemon cleanly"),
    }
    Ok(reason)
}

/// Single consumer of every message source. All coordinator state changes
/// happen on the thread calling [`EventLoop::run`].
pub struct EventLoop<E: Effects> {
    rx: Receiver<Message>,
    tx: Sender<Message>,
    coordinator: Coordinator<E>,
    daemon: DaemonSupervisor,
    restart_limit: u32,
    restarts: u32,
    closed_streams: u8,
}

impl<E: Effects> EventLoop<E> {
    pub fn new(
        rx: Receiver<Message>,
        tx: Sender<Message>,
        coordinator: Coordinator<E>,
        daemon: DaemonSupervisor,
        restart_limit: u32,
    ) -> Self {
        Self {
            rx,
            tx,
            coordinator,
            daemon,
            restart_limit,
            restarts: 0,
            closed_streams: 0,
        }
    }

    pub fn coordinator(&self) -> &Coordinator<E> {
        &self.coordinator
    }

    pub fn start(&mut self) -> Result<()> {
        self.closed_streams = 0;
        let session = self.daemon.spawn_count() + 1;
        self.daemon.spawn(daemon_forwarder(self.tx.clone(), session))?;
        Ok(())
    }

    pub fn run(&mut self) -> ShutdownReason {
        loop {
            if signals::shutdown_requested() {
                return ShutdownReason::Signal;
            }

            match self.rx.recv_timeout(TICK) {
                Ok(message) => {
                    if let Some(reason) = self.handle(message) {
                        return reason;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return ShutdownReason::DaemonExited { code: None };
                }
            }

            let status = match self.daemon.poll_exit() {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "lost track of daemon");
                    return ShutdownReason::DaemonExited { code: None };
                }
            };
            if let Some(reason) = self.drain_output() {
                return reason;
            }
            if self.restarts >= self.restart_limit {
                warn!(status = %status, "daemon exited");
                return exit_reason(status);
            }
            self.restarts += 1;
            warn!(
                status = %status,
                restarts = self.restarts,
                restart_limit = self.restart_limit,
                "daemon exited; restarting"
            );
            self.coordinator.on_daemon_restarted();
            if let Err(err) = self.start() {
                error!(error = %format!("{err:#}"), "failed to restart daemon");
                return exit_reason(status);
            }
        }
    }

    fn handle(&mut self, message: Message) -> Option<ShutdownReason> {
        match message {
            Message::Pipeline(message) => self.coordinator.handle(message),
            Message::Daemon { session, output } => {
                let current = self.daemon.spawn_count();
                if session != current {
                    debug!(session, current, "dropping output of a previous daemon");
                    return None;
                }
                return self.handle_daemon_output(output);
            }
        }
        None
    }

    fn handle_daemon_output(&mut self, output: DaemonOutput) -> Option<ShutdownReason> {
        match output {
            DaemonOutput::Line(DaemonStream::Stdout, line) => {
                self.coordinator.handle(PipelineMessage::DaemonLine(line))
            }
            DaemonOutput::Line(DaemonStream::Stderr, line) => match classify_stderr(&line) {
                DaemonSignal::ServerReady => info!(line = %line, "daemon server ready"),
                DaemonSignal::PermissionDenied => {
                    error!(line = %line, "daemon reported a permission error");
                    return Some(ShutdownReason::PermissionDenied);
                }
                DaemonSignal::Other => debug!(line = %line, "daemon"),
            },
            DaemonOutput::Closed(stream) => {
                debug!(stream = ?stream, "daemon output closed");
                self.closed_streams = self.closed_streams.saturating_add(1);
            }
        }
        None
    }

    // Lines the daemon printed right before exiting may still be queued
    // behind the exit; handle them before deciding what happens next.
    fn drain_output(&mut self) -> Option<ShutdownReason> {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.closed_streams < 2 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(message) => {
                    if let Some(reason) = self.handle(message) {
                        return Some(reason);
                    }
                }
                Err(_) => break,
            }
        }
        None
    }
}

fn exit_reason(status: ExitStatus) -> ShutdownReason {
    ShutdownReason::DaemonExited {
        code: status.code(),
    }
}

fn daemon_forwarder(
    tx: Sender<Message>,
    session: u32,
) -> impl Fn(DaemonOutput) -> bool + Clone + Send + 'static {
    move |output| tx.send(Message::Daemon { session, output }).is_ok()
}
