//! Serde description of a program, loaded from TOML or JSON.
//!
//! ```toml
//! name = "power scan"
//!
//! [[ops]]
//! op = "write"
//! command = "WL 532"
//!
//! [[ops]]
//! op = "loop"
//! times = 10
//!
//!   [[ops.ops]]
//!   op = "query"
//!   command = "PM:POWER?"
//!
//!   [[ops.ops]]
//!   op = "sleep"
//!   ms = 100
//!
//! [[cleanup]]
//! op = "write"
//! command = "SHUTTER CLOSE"
//! ```
//!
//! Nested `ops` lists become linked blocks through [`ProgramBuilder`].

use super::{Condition, LoopKind, Program, ProgramBuilder, ProgramError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading a program file.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The file could not be read.
    #[error("Failed to read program file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// TOML syntax or shape error.
    #[error("Invalid TOML program: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON syntax or shape error.
    #[error("Invalid JSON program: {0}")]
    Json(#[from] serde_json::Error),

    /// A loop declared more than one iteration rule.
    #[error("Loop declares more than one of `times`, `count_from_response`, `while`")]
    AmbiguousLoop,

    /// The described structure could not be linked.
    #[error(transparent)]
    Program(#[from] ProgramError),
}

/// Top level of a program file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramFile {
    /// Human-readable name used in logs.
    #[serde(default)]
    pub name: Option<String>,
    /// Main body.
    pub ops: Vec<Op>,
    /// Cleanup region, run once on every exit path.
    #[serde(default)]
    pub cleanup: Option<Vec<Op>>,
}

/// One operation in a program file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Send a command.
    Write {
        /// Command text.
        command: String,
    },
    /// Send a command and read the reply.
    Query {
        /// Command text.
        command: String,
        /// Reply length bound.
        #[serde(default = "default_max_len")]
        max_len: usize,
    },
    /// Cancellable pause.
    Sleep {
        /// Duration in milliseconds.
        ms: u64,
    },
    /// Publish literal text.
    Emit {
        /// Payload text.
        payload: String,
    },
    /// Log a message.
    Log {
        /// Message text.
        message: String,
    },
    /// Loop. With no rule it runs until `break` or stop.
    Loop {
        /// Fixed iteration count.
        #[serde(default)]
        times: Option<u64>,
        /// Take the count from the last response.
        #[serde(default)]
        count_from_response: bool,
        /// Condition checked before every iteration.
        #[serde(default, rename = "while")]
        while_cond: Option<ConditionSpec>,
        /// Loop body.
        #[serde(default)]
        ops: Vec<Op>,
    },
    /// Conditional.
    If {
        /// Branch predicate.
        condition: ConditionSpec,
        /// Taken when the predicate holds.
        #[serde(default)]
        then: Vec<Op>,
        /// Taken otherwise.
        #[serde(default, rename = "else")]
        otherwise: Option<Vec<Op>>,
    },
    /// Leave the innermost loop.
    Break,
    /// Next iteration of the innermost loop.
    Continue,
}

/// Condition as written in a program file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSpec {
    /// Always true.
    Always,
    /// Always false.
    Never,
    /// Last response equals this text.
    Equals(String),
    /// Last response contains this text.
    Contains(String),
    /// Negation.
    Not(Box<ConditionSpec>),
}

fn default_max_len() -> usize {
    256
}

impl From<&ConditionSpec> for Condition {
    fn from(spec: &ConditionSpec) -> Self {
        match spec {
            ConditionSpec::Always => Condition::Always,
            ConditionSpec::Never => Condition::Never,
            ConditionSpec::Equals(text) => Condition::ResponseEquals(text.as_bytes().to_vec()),
            ConditionSpec::Contains(text) => Condition::ResponseContains(text.as_bytes().to_vec()),
            ConditionSpec::Not(inner) => Condition::Not(Box::new(inner.as_ref().into())),
        }
    }
}

impl ProgramFile {
    /// Parse TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, LoadError> {
        Ok(toml::from_str(text)?)
    }

    /// Parse JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, LoadError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Link into a runnable program.
    pub fn to_program(&self) -> Result<Program, LoadError> {
        let mut builder = ProgramBuilder::new();
        lower(&mut builder, &self.ops)?;
        if let Some(cleanup) = &self.cleanup {
            builder.cleanup();
            lower(&mut builder, cleanup)?;
        }
        Ok(builder.build()?)
    }
}

fn lower(builder: &mut ProgramBuilder, ops: &[Op]) -> Result<(), LoadError> {
    for op in ops {
        match op {
            Op::Write { command } => {
                builder.write(command.as_bytes());
            }
            Op::Query { command, max_len } => {
                builder.query(command.as_bytes(), *max_len);
            }
            Op::Sleep { ms } => {
                builder.sleep(Duration::from_millis(*ms));
            }
            Op::Emit { payload } => {
                builder.emit(payload.as_bytes());
            }
            Op::Log { message } => {
                builder.log(message.as_str());
            }
            Op::Loop {
                times,
                count_from_response,
                while_cond,
                ops,
            } => {
                let kind = match (times, count_from_response, while_cond) {
                    (None, false, None) => LoopKind::Forever,
                    (Some(n), false, None) => LoopKind::Times(*n),
                    (None, true, None) => LoopKind::FromResponse,
                    (None, false, Some(cond)) => LoopKind::While(cond.into()),
                    _ => return Err(LoadError::AmbiguousLoop),
                };
                builder.begin_loop(kind);
                lower(builder, ops)?;
                builder.end_loop();
            }
            Op::If {
                condition,
                then,
                otherwise,
            } => {
                builder.begin_if(condition.into());
                lower(builder, then)?;
                if let Some(otherwise) = otherwise {
                    builder.else_branch();
                    lower(builder, otherwise)?;
                }
                builder.end_if();
            }
            Op::Break => {
                builder.break_loop();
            }
            Op::Continue => {
                builder.continue_loop();
            }
        }
    }
    Ok(())
}

/// Read and link a program file. `.json` files are parsed as JSON, anything
/// else as TOML.
pub fn load(path: &Path) -> Result<(ProgramFile, Program), LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let file = if is_json {
        ProgramFile::from_json_str(&text)?
    } else {
        ProgramFile::from_toml_str(&text)?
    };
    let program = file.to_program()?;
    Ok((file, program))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Statement, Token};

    const SCAN: &str = r#"
        name = "scan"

        [[ops]]
        op = "write"
        command = "WL 532"

        [[ops]]
        op = "loop"
        times = 2

          [[ops.ops]]
          op = "query"
          command = "PM:POWER?"
          max_len = 32

          [[ops.ops]]
          op = "if"
          condition = { contains = "ERR" }
          then = [{ op = "break" }]

        [[cleanup]]
        op = "write"
        command = "SHUTTER CLOSE"
    "#;

    #[test]
    fn test_toml_lowering() {
        let file = ProgramFile::from_toml_str(SCAN).unwrap();
        assert_eq!(file.name.as_deref(), Some("scan"));
        let program = file.to_program().unwrap();

        assert_eq!(program.len(), 7);
        assert_eq!(program.cleanup(), Some(6));
        assert_eq!(
            program.token(2),
            Some(&Token::Statement(Statement::Query {
                command: b"PM:POWER?".to_vec(),
                max_len: 32
            }))
        );
        assert_eq!(program.token(4), Some(&Token::Break { target: 5 }));
    }

    #[test]
    fn test_json_with_else() {
        let json = r#"{
            "ops": [
                { "op": "query", "command": "STATE?" },
                { "op": "if", "condition": { "not": "always" },
                  "then": [{ "op": "log", "message": "never" }],
                  "else": [{ "op": "emit", "payload": "marker" }] }
            ]
        }"#;
        let program = ProgramFile::from_json_str(json).unwrap().to_program().unwrap();
        assert_eq!(
            program.token(1),
            Some(&Token::If {
                condition: Condition::Not(Box::new(Condition::Always)),
                else_at: Some(3),
                end: 5
            })
        );
        assert_eq!(program.cleanup(), None);
    }

    #[test]
    fn test_ambiguous_loop_rejected() {
        let toml = r#"
            [[ops]]
            op = "loop"
            times = 3
            count_from_response = true
        "#;
        let err = ProgramFile::from_toml_str(toml)
            .unwrap()
            .to_program()
            .unwrap_err();
        assert!(matches!(err, LoadError::AmbiguousLoop));
    }

    #[test]
    fn test_break_at_top_level_rejected() {
        let err = ProgramFile::from_toml_str("[[ops]]\nop = \"break\"\n")
            .unwrap()
            .to_program()
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::Program(ProgramError::BreakOutsideLoop { at: 0 })
        ));
    }

    #[test]
    fn test_load_picks_format_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.toml");
        std::fs::write(&path, SCAN).unwrap();
        let (file, program) = load(&path).unwrap();
        assert_eq!(file.ops.len(), 2);
        assert_eq!(program.body_end(), 6);

        let missing = dir.path().join("missing.json");
        assert!(matches!(load(&missing), Err(LoadError::Io { .. })));
    }
}
