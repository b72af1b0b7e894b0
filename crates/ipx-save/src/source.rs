use crate::builder::parse;
use crate::error::{Result, SaveError};
use crate::tokenizer::Dialect;
use ipx_core::{RuleSet, SourceConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Command { program: String, args: Vec<String> },
    File(PathBuf),
}

/// Where a rule dump comes from and how to read it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveSource {
    kind: SourceKind,
    dialect: Dialect,
}

impl SaveSource {
    pub fn command<I, S>(program: impl Into<String>, args: I, dialect: Dialect) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: SourceKind::Command {
                program: program.into(),
                args: args.into_iter().map(Into::into).collect(),
            },
            dialect,
        }
    }

    pub fn file(path: impl Into<PathBuf>, dialect: Dialect) -> Self {
        Self {
            kind: SourceKind::File(path.into()),
            dialect,
        }
    }

    /// `iptables-save -c`
    pub fn iptables_save() -> Self {
        Self::command("iptables-save", ["-c"], Dialect::Counters)
    }

    pub fn from_config(config: &SourceConfig, dialect: Dialect) -> Self {
        match config {
            SourceConfig::Command { program, args } => {
                Self::command(program.clone(), args.clone(), dialect)
            }
            SourceConfig::File { path } => Self::file(path.clone(), dialect),
        }
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Name used in logs and error messages
    pub fn name(&self) -> String {
        match &self.kind {
            SourceKind::Command { program, args } if args.is_empty() => program.clone(),
            SourceKind::Command { program, args } => format!("{} {}", program, args.join(" ")),
            SourceKind::File(path) => path.display().to_string(),
        }
    }

    /// Open the file or spawn the command without reading anything yet
    pub fn open(&self) -> Result<OpenSource> {
        let name = self.name();
        let input = match &self.kind {
            SourceKind::Command { program, args } => {
                let child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .spawn()
                    .map_err(|source| SaveError::Open {
                        name: name.clone(),
                        source,
                    })?;
                Input::Child(child)
            }
            SourceKind::File(path) => {
                let file = File::open(path).map_err(|source| SaveError::Open {
                    name: name.clone(),
                    source,
                })?;
                Input::File(file)
            }
        };
        debug!(source = %name, "opened rule source");
        Ok(OpenSource {
            name,
            dialect: self.dialect,
            input,
        })
    }
}

#[derive(Debug)]
enum Input {
    Child(Child),
    File(File),
}

/// An opened stream, owned by whichever task parses it
#[derive(Debug)]
pub struct OpenSource {
    name: String,
    dialect: Dialect,
    input: Input,
}

impl OpenSource {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the stream without parsing it, reaping a spawned command
    pub fn close(self) {
        if let Input::Child(mut child) = self.input {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Read the stream to the end and build the rule set.
    ///
    /// Blocks on I/O. A spawned command is always waited on, and a non-zero
    /// exit fails the parse even if its output was readable.
    pub fn parse(self) -> Result<RuleSet> {
        let Self {
            name,
            dialect,
            input,
        } = self;

        match input {
            Input::File(file) => {
                parse(BufReader::new(file), dialect).map_err(|source| SaveError::Parse { name, source })
            }
            Input::Child(mut child) => {
                let parsed = match child.stdout.take() {
                    Some(stdout) => parse(BufReader::new(stdout), dialect),
                    None => Ok(RuleSet::new()),
                };
                if parsed.is_err() {
                    let _ = child.kill();
                }
                let status = child.wait().map_err(|source| SaveError::Wait {
                    name: name.clone(),
                    source,
                })?;
                let ruleset = parsed.map_err(|source| SaveError::Parse {
                    name: name.clone(),
                    source,
                })?;
                if !status.success() {
                    return Err(SaveError::Exit { name, status });
                }
                Ok(ruleset)
            }
        }
    }
}
