use anyhow::{bail, Context, Result};
use std::fmt;
use std::process::Command;

/// A shell-style command line with `{name}` placeholders substituted per
/// argument. Never goes through a shell, so paths with spaces stay intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    raw: String,
    argv: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let argv = shell_words::split(raw)
            .with_context(|| format!("invalid command template: {raw}"))?;
        if argv.is_empty() {
            bail!("command template is empty");
        }
        Ok(Self {
            raw: raw.trim().to_string(),
            argv,
        })
    }

    pub fn mentions(&self, placeholder: &str) -> bool {
        let needle = format!("{{{placeholder}}}");
        self.argv.iter().any(|arg| arg.contains(&needle))
    }

    pub fn render(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.argv.iter().map(|arg| substitute(arg, vars)).collect()
    }

    pub fn command(&self, vars: &[(&str, &str)]) -> Command {
        let argv = self.render(vars);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// One pass over the argument; substituted values are never rescanned.
fn substitute(arg: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        let value = after_open.find('}').and_then(|close| {
            let name = &after_open[..close];
            vars.iter()
                .find(|(var, _)| *var == name)
                .map(|(_, value)| (*value, close))
        });
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after_open[close + 1..];
            }
            None => {
                out.push('{');
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Last `limit` characters of a tool's output, for log lines.
pub fn tail_text(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= limit {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - limit).collect();
    format!("...{tail}")
}
