mod alert;
mod command;
mod compare;
mod config;
mod console;
mod daemon;
mod event;
mod frames;
mod keyboard;
mod logging;
mod pipeline;
mod reference;
mod runtime;
mod signals;

use anyhow::{Context, Result};
use chrono::Utc;
use command::CommandTemplate;
use compare::{CompareRequest, ComparisonResult, DiffTool};
use config::{Cli, Commands, CompareArgs, DecodeArgs, RunArgs};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use tracing::info;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse_args();
    cli.logging.init()?;

    match cli.command {
        None => command_run(cli.run),
        Some(Commands::Run(args)) => command_run(args),
        Some(Commands::Decode(args)) => command_decode(args).map(|_| 0),
        Some(Commands::Compare(args)) => command_compare(args).map(|_| 0),
        Some(Commands::Commands) => print_commands().map(|_| 0),
    }
}

fn command_run(args: RunArgs) -> Result<i32> {
    info!(version = env!("CARGO_PKG_VERSION"), "kyyla starting");
    let reason = runtime::run(&args)?;
    info!(reason = ?reason, "kyyla stopped");
    Ok(reason.exit_code())
}

fn command_decode(args: DecodeArgs) -> Result<()> {
    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let stdout = io::stdout();
    decode_lines(reader, &mut stdout.lock())
}

/// One JSON row per non-blank input line: the decoded event, or the decode
/// error with the raw line.
fn decode_lines<R: BufRead, W: Write>(reader: R, out: &mut W) -> Result<()> {
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input line")?;
        if line.trim().is_empty() {
            continue;
        }
        let row = match event::decode_line(&line) {
            Ok(event) => json!({ "line": index + 1, "event": event }),
            Err(err) => json!({ "line": index + 1, "error": err.to_string(), "raw": line }),
        };
        writeln!(out, "{}", serde_json::to_string(&row)?)?;
    }
    Ok(())
}

fn command_compare(args: CompareArgs) -> Result<()> {
    let diff = DiffTool::new(CommandTemplate::parse(&args.diff.diff_cmd)?)?;
    info!(command = %diff.template(), "running diff tool");
    let result = diff.compare(CompareRequest {
        before: args.before,
        after: args.after,
        fuzz_percent: args.fuzz,
    });
    println!("{}", serde_json::to_string(&compare_report(&result)?)?);
    Ok(())
}

fn compare_report(result: &ComparisonResult) -> Result<Value> {
    let mut report = serde_json::to_value(result)?;
    if let Value::Object(fields) = &mut report {
        fields.insert("compared_at".to_string(), json!(Utc::now().to_rfc3339()));
    }
    Ok(report)
}

fn print_commands() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&commands_report())?);
    Ok(())
}

fn commands_report() -> Value {
    let rows: Vec<_> = console::COMMANDS
        .iter()
        .map(|spec| {
            json!({
                "name": spec.name,
                "description": spec.description,
            })
        })
        .collect();
    json!({ "commands": rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn decode_reports_events_and_errors_per_line() {
        let input = concat!(
            "{\"action\":\"event_start\",\"eventid\":\"4\"}\n",
            "\n",
            "{not json\n",
            "{\"action\":\"picture_save\",\"eventid\":\"4\",\"img\":\"/var/lib/motion/04-01.jpg\"}\n",
        );
        let mut out = Vec::new();
        decode_lines(input.as_bytes(), &mut out).unwrap();

        let rows: Vec<Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["line"], 1);
        assert_eq!(rows[0]["event"]["action"], "event_start");
        assert_eq!(rows[1]["line"], 3);
        assert_eq!(rows[1]["raw"], "{not json");
        assert!(rows[1]["error"].is_string());
        assert!(rows[1].get("event").is_none());
        assert_eq!(rows[2]["line"], 4);
        assert_eq!(rows[2]["event"]["action"], "picture_save");
        assert_eq!(rows[2]["event"]["img"], "/var/lib/motion/04-01.jpg");
    }

    #[test]
    fn compare_report_carries_score_and_timestamp() {
        let diff = DiffTool::new(
            CommandTemplate::parse("sh -c 'echo 5 >&2' diff {fuzz} {before} {after}").unwrap(),
        )
        .unwrap();
        let result = diff.compare(CompareRequest {
            before: "a.jpg".into(),
            after: "b.jpg".into(),
            fuzz_percent: 25,
        });
        let report = compare_report(&result).unwrap();

        assert_eq!(report["score"], 5);
        assert_eq!(report["changed"], true);
        assert_eq!(report["fuzz_percent"], 25);
        assert!(report["error"].is_null());
        let stamp = report["compared_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn commands_report_lists_console_registry() {
        let report = commands_report();
        let names: Vec<_> = report["commands"]
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["setref", "status", "help"]);
        assert!(report["commands"][0]["description"].is_string());
    }
}
