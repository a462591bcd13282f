use std::io::{self, BufRead};
use std::thread;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    SetReference,
    Status,
    Help,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub command: ConsoleCommand,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "setref",
        description: "Capture a snapshot and use it as the reference frame.",
        command: ConsoleCommand::SetReference,
    },
    CommandSpec {
        name: "status",
        description: "Log controller state, reference frame and alert state.",
        command: ConsoleCommand::Status,
    },
    CommandSpec {
        name: "help",
        description: "List console commands.",
        command: ConsoleCommand::Help,
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(ConsoleCommand),
    Empty,
    Unknown(String),
}

pub fn parse_line(line: &str) -> ConsoleInput {
    let name = line.trim();
    if name.is_empty() {
        return ConsoleInput::Empty;
    }
    COMMANDS
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(name))
        .map(|spec| ConsoleInput::Command(spec.command))
        .unwrap_or_else(|| ConsoleInput::Unknown(name.to_string()))
}

/// Forwards stdin lines through `forward` until stdin closes or the
/// receiver goes away (`forward` returns false).
pub fn spawn_console_thread<F>(mut forward: F) -> thread::JoinHandle<()>
where
    F: FnMut(String) -> bool + Send + 'static,
{
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if !forward(line) {
                        return;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "console read error");
                    return;
                }
            }
        }
        debug!("console input closed");
    })
}
