use crate::alert::DEFAULT_ALERT_CMD;
use crate::compare::DEFAULT_DIFF_CMD;
use crate::daemon::{DEFAULT_MOTION_BIN, DEFAULT_MOTION_CONF};
use crate::keyboard::DEFAULT_SETREF_KEY;
use crate::logging::LoggingArgs;
use crate::reference::DEFAULT_SNAPSHOT_CMD;
use anyhow::{bail, Result};
use clap::error::ErrorKind;
use clap::parser::ValueSource;
use clap::{ArgAction, ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "kyyla",
    version,
    about = "Supervise motion, diff captured frames per event and fire alerts on confirmed scene changes"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Supervisor options when no subcommand is given
    #[command(flatten)]
    pub run: RunArgs,
    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::try_parse_args(std::env::args_os()).unwrap_or_else(|err| err.exit())
    }

    /// Like `try_parse_from`, but supervisor flags given before a subcommand
    /// are rejected. Global logging flags may appear anywhere.
    pub fn try_parse_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut command = Self::command();
        let matches = command.try_get_matches_from_mut(args)?;
        if let Some(subcommand) = matches.subcommand_name() {
            if let Some(flag) = top_level_run_flag(&matches) {
                return Err(command.error(
                    ErrorKind::ArgumentConflict,
                    format!("--{flag} cannot be combined with the '{subcommand}' subcommand; pass it after 'run' instead"),
                ));
            }
        }
        Self::from_arg_matches(&matches).map_err(|err| err.format(&mut command))
    }
}

fn top_level_run_flag(matches: &ArgMatches) -> Option<String> {
    RunArgs::augment_args(clap::Command::new("run"))
        .get_arguments()
        .filter(|arg| matches.value_source(arg.get_id().as_str()) == Some(ValueSource::CommandLine))
        .find_map(|arg| arg.get_long().map(str::to_string))
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start motion and run the change-detection pipeline (default)
    Run(RunArgs),
    /// Decode daemon event lines from a file or stdin and print them as JSON
    Decode(DecodeArgs),
    /// Run the diff tool once on two images and print the result as JSON
    Compare(CompareArgs),
    /// Print console commands in JSON
    Commands,
}

#[derive(Args, Debug, Clone)]
pub struct DiffToolArgs {
    /// Diff tool command; {fuzz}, {before} and {after} are substituted
    #[arg(long, env = "KYYLA_DIFF_CMD", default_value = DEFAULT_DIFF_CMD)]
    pub diff_cmd: String,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Motion daemon executable
    #[arg(long, env = "KYYLA_MOTION_BIN", default_value = DEFAULT_MOTION_BIN)]
    pub motion_bin: PathBuf,
    /// Motion configuration file passed with -c
    #[arg(long, env = "KYYLA_MOTION_CONF", default_value = DEFAULT_MOTION_CONF)]
    pub motion_conf: PathBuf,
    #[command(flatten)]
    pub diff: DiffToolArgs,
    /// Fuzz percentage for event-to-event scene comparisons
    #[arg(long, env = "KYYLA_SCENE_FUZZ", default_value_t = 20, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub scene_fuzz: u8,
    /// Fuzz percentage for comparisons against the reference frame
    #[arg(long, env = "KYYLA_REFERENCE_FUZZ", default_value_t = 30, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub reference_fuzz: u8,
    /// Command that makes the daemon capture one still
    #[arg(long, env = "KYYLA_SNAPSHOT_CMD", default_value = DEFAULT_SNAPSHOT_CMD)]
    pub snapshot_cmd: String,
    /// Command run on a confirmed scene change
    #[arg(long, env = "KYYLA_ALERT_CMD", default_value = DEFAULT_ALERT_CMD)]
    pub alert_cmd: String,
    /// Evdev keyboard device (e.g. /dev/input/event0); disabled when unset
    #[arg(long, env = "KYYLA_KEYBOARD_DEVICE")]
    pub keyboard_device: Option<PathBuf>,
    /// Key code that acts like the `setref` console command
    #[arg(long, env = "KYYLA_SETREF_KEY", default_value_t = DEFAULT_SETREF_KEY)]
    pub setref_key: u16,
    /// Grab the keyboard device exclusively
    #[arg(long, action = ArgAction::SetTrue)]
    pub grab_keyboard: bool,
    /// Event groups kept in memory (0 = unbounded, otherwise at least 2)
    #[arg(long, env = "KYYLA_KEEP_GROUPS", default_value_t = 8)]
    pub keep_groups: usize,
    /// Times the daemon is respawned after exiting before giving up
    #[arg(long, env = "KYYLA_RESTART_LIMIT", default_value_t = 0)]
    pub restart_limit: u32,
    /// Grace period between SIGTERM and SIGKILL when stopping the daemon (ms)
    #[arg(long, env = "KYYLA_STOP_GRACE_MS", default_value_t = 3000)]
    pub stop_grace_ms: u64,
    /// Do not read console commands from stdin
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_console: bool,
}

impl RunArgs {
    pub fn validate(&self) -> Result<()> {
        if self.keep_groups == 1 {
            bail!("--keep-groups must be 0 (unbounded) or at least 2 to keep the previous event group");
        }
        if self.motion_bin.as_os_str().is_empty() {
            bail!("--motion-bin must not be empty");
        }
        Ok(())
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// File of daemon output lines (default: stdin)
    pub input: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CompareArgs {
    /// Image captured first
    pub before: PathBuf,
    /// Image captured later
    pub after: PathBuf,
    /// Fuzz percentage passed to the diff tool
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub fuzz: u8,
    #[command(flatten)]
    pub diff: DiffToolArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogFormat, LogLevel};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bare_invocation_runs_with_defaults() {
        let cli = Cli::try_parse_args(["kyyla"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.motion_conf, PathBuf::from(DEFAULT_MOTION_CONF));
        assert_eq!(cli.run.scene_fuzz, 20);
        assert_eq!(cli.run.reference_fuzz, 30);
        assert!(cli.run.validate().is_ok());
    }

    #[test]
    fn run_subcommand_accepts_overrides() {
        let cli = Cli::try_parse_args([
            "kyyla",
            "run",
            "--motion-conf",
            "/etc/motion/kyyla.conf",
            "--keyboard-device",
            "/dev/input/event3",
            "--keep-groups",
            "0",
        ])
        .unwrap();
        let Some(Commands::Run(run)) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(run.motion_conf, PathBuf::from("/etc/motion/kyyla.conf"));
        assert_eq!(run.keyboard_device, Some(PathBuf::from("/dev/input/event3")));
        assert_eq!(run.keep_groups, 0);
    }

    #[test]
    fn fuzz_outside_percentage_range_is_rejected() {
        assert!(Cli::try_parse_args(["kyyla", "--scene-fuzz", "101"]).is_err());
        assert!(Cli::try_parse_args(["kyyla", "compare", "a.jpg", "b.jpg", "--fuzz", "150"]).is_err());
    }

    #[test]
    fn logging_flags_are_accepted_before_and_after_subcommands() {
        let cli = Cli::try_parse_args(["kyyla", "--log-level", "debug", "decode"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Decode(_))));
        assert_eq!(cli.logging.log_level, LogLevel::Debug);

        let cli = Cli::try_parse_args(["kyyla", "--log-format", "json", "run"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run(_))));
        assert_eq!(cli.logging.log_format, LogFormat::Json);

        let cli = Cli::try_parse_args(["kyyla", "commands", "--log-level", "warn"]).unwrap();
        assert_eq!(cli.logging.log_level, LogLevel::Warn);
    }

    #[test]
    fn supervisor_flags_before_a_subcommand_are_rejected() {
        let err = Cli::try_parse_args(["kyyla", "--scene-fuzz", "10", "decode"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
        assert!(Cli::try_parse_args(["kyyla", "--no-console", "run"]).is_err());
    }

    #[test]
    fn single_group_retention_is_rejected() {
        let cli = Cli::try_parse_args(["kyyla", "--keep-groups", "1"]).unwrap();
        assert!(cli.run.validate().is_err());
    }
}
