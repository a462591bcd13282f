use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

pub const DEFAULT_MOTION_BIN: &str = "/usr/bin/motion";
pub const DEFAULT_MOTION_CONF: &str = "./motion.conf";

/// Printed on stderr once the daemon's stream server is listening.
pub const SERVER_READY_MARKER: &str = "Started motion-stream server";
/// Printed on stderr when the daemon cannot open the camera or its files.
pub const PERMISSION_ERROR_MARKER: &str = "Permission denied";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    ServerReady,
    PermissionDenied,
    Other,
}

pub fn classify_stderr(line: &str) -> DaemonSignal {
    if line.contains(PERMISSION_ERROR_MARKER) {
        DaemonSignal::PermissionDenied
    } else if line.contains(SERVER_READY_MARKER) {
        DaemonSignal::ServerReady
    } else {
        DaemonSignal::Other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonOutput {
    Line(DaemonStream, String),
    /// Sent once per stream after its last line.
    Closed(DaemonStream),
}

/// Owns the motion daemon child process.
#[derive(Debug)]
pub struct DaemonSupervisor {
    program: PathBuf,
    args: Vec<String>,
    child: Option<Child>,
    spawn_count: u32,
}

impl DaemonSupervisor {
    pub fn motion(program: &Path, conf: &Path) -> Self {
        Self::new(
            program,
            vec!["-c".to_string(), conf.to_string_lossy().into_owned()],
        )
    }

    pub fn new(program: &Path, args: Vec<String>) -> Self {
        Self {
            program: program.to_path_buf(),
            args,
            child: None,
            spawn_count: 0,
        }
    }

    /// Starts the daemon and pumps its output into `forward` from one reader
    /// thread per stream.
    pub fn spawn<F>(&mut self, forward: F) -> Result<u32>
    where
        F: Fn(DaemonOutput) -> bool + Clone + Send + 'static,
    {
        if self.child.is_some() {
            return Err(anyhow!("daemon already running"));
        }
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start daemon: {}", self.program.display()))?;

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, DaemonStream::Stdout, forward.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, DaemonStream::Stderr, forward);
        }

        let pid = child.id();
        self.spawn_count += 1;
        self.child = Some(child);
        info!(
            program = %self.program.display(),
            args = ?self.args,
            pid,
            spawn = self.spawn_count,
            "daemon started"
        );
        Ok(pid)
    }

    pub fn spawn_count(&self) -> u32 {
        self.spawn_count
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Non-blocking exit check; clears the child once it has exited.
    pub fn poll_exit(&mut self) -> Result<Option<ExitStatus>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let status = child.try_wait().context("failed to poll daemon")?;
        if status.is_some() {
            self.child = None;
        }
        Ok(status)
    }

    /// SIGTERM, then SIGKILL once `grace` runs out.
    pub fn stop(&mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        if let Some(status) = child.try_wait().context("failed to poll daemon")? {
            return Ok(Some(status));
        }

        let pid = child.id() as libc::pid_t;
        info!(pid, "stopping daemon");
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            warn!(pid, error = %std::io::Error::last_os_error(), "failed to signal daemon");
        }
        match child
            .wait_timeout(grace)
            .context("failed to wait for daemon")?
        {
            Some(status) => Ok(Some(status)),
            None => {
                warn!(pid, grace_ms = grace.as_millis() as u64, "daemon ignored SIGTERM; killing");
                let _ = child.kill();
                let status = child.wait().context("failed to reap daemon")?;
                Ok(Some(status))
            }
        }
    }
}

impl Drop for DaemonSupervisor {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn spawn_line_reader<R, F>(stream: R, kind: DaemonStream, forward: F) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
    F: Fn(DaemonOutput) -> bool + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.split(b'\n') {
            match line {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes)
                        .trim_end_matches('\r')
                        .to_string();
                    if !forward(DaemonOutput::Line(kind, text)) {
                        return;
                    }
                }
                Err(err) => {
                    debug!(stream = ?kind, error = %err, "daemon stream read error");
                    break;
                }
            }
        }
        debug!(stream = ?kind, "daemon stream closed");
        forward(DaemonOutput::Closed(kind));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell(script: &str) -> DaemonSupervisor {
        DaemonSupervisor::new(
            Path::new("sh"),
            vec!["-c".to_string(), script.to_string()],
        )
    }

    fn wait_for_exit(daemon: &mut DaemonSupervisor) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(status) = daemon.poll_exit().unwrap() {
                return status;
            }
            assert!(Instant::now() < deadline, "daemon did not exit");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn classifies_stderr_markers() {
        assert_eq!(
            classify_stderr("[0:motion] [NTC] [STR] Started motion-stream server on port 8081"),
            DaemonSignal::ServerReady
        );
        assert_eq!(
            classify_stderr("[1:ml1] [ERR] [VID] vid_v4lx_start: Failed to open video device /dev/video0: Permission denied"),
            DaemonSignal::PermissionDenied
        );
        assert_eq!(classify_stderr("[0:motion] [NTC] [ALL] motion_startup"), DaemonSignal::Other);
    }

    #[test]
    fn forwards_both_streams_and_reports_exit() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut daemon = shell("echo '{\"action\":\"event_start\",\"eventid\":\"1\"}'; echo ready >&2");
        daemon
            .spawn(move |output| tx.send(output).is_ok())
            .unwrap();
        assert!(daemon.is_running());

        let status = wait_for_exit(&mut daemon);
        assert!(status.success());
        assert!(!daemon.is_running());

        let mut outputs = Vec::new();
        while let Ok(output) = rx.recv_timeout(Duration::from_secs(2)) {
            outputs.push(output);
            if outputs.len() == 4 {
                break;
            }
        }
        assert!(outputs.contains(&DaemonOutput::Line(
            DaemonStream::Stdout,
            r#"{"action":"event_start","eventid":"1"}"#.to_string()
        )));
        assert!(outputs.contains(&DaemonOutput::Line(DaemonStream::Stderr, "ready".to_string())));
        assert!(outputs.contains(&DaemonOutput::Closed(DaemonStream::Stdout)));
        assert!(outputs.contains(&DaemonOutput::Closed(DaemonStream::Stderr)));
        assert_eq!(daemon.spawn_count(), 1);
    }

    #[test]
    fn stop_terminates_running_daemon() {
        let mut daemon = shell("sleep 30");
        daemon.spawn(|_| true).unwrap();
        let status = daemon.stop(Duration::from_secs(5)).unwrap();
        assert!(status.is_some());
        assert!(!status.unwrap().success());
        assert!(!daemon.is_running());
        assert_eq!(daemon.stop(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn stop_kills_daemon_ignoring_sigterm() {
        let mut daemon = shell("trap '' TERM; sleep 30");
        daemon.spawn(|_| true).unwrap();
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        let status = daemon.stop(Duration::from_millis(200)).unwrap();
        assert!(status.is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn spawn_missing_binary_fails() {
        let mut daemon = DaemonSupervisor::motion(
            Path::new("/nonexistent/motion"),
            Path::new("motion.conf"),
        );
        assert!(daemon.spawn(|_| true).is_err());
        assert!(!daemon.is_running());
    }
}
