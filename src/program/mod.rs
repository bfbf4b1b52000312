//! Token-addressed measurement programs.
//!
//! A [`Program`] is a flat vector of [`Token`]s. Structured control flow
//! (loops, conditionals, `break`, `continue`) is expressed with jump links
//! that [`ProgramBuilder::build`] resolves once, so the worker only ever
//! moves its cursor to a pre-computed index. Run-time loop state is not stored
//! here; the worker keeps it in its own frame arena.
//!
//! # Example
//!
//! ```
//! use daq_runner::program::{LoopKind, ProgramBuilder};
//! use std::time::Duration;
//!
//! let program = ProgramBuilder::new()
//!     .write("WL 532")
//!     .begin_loop(LoopKind::Times(10))
//!     .query("PM:POWER?", 64)
//!     .sleep(Duration::from_millis(100))
//!     .end_loop()
//!     .cleanup()
//!     .write("SHUTTER CLOSE")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(program.len(), 6);
//! assert_eq!(program.body_end(), 5);
//! ```

pub mod file;

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while linking a program.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProgramError {
    /// A loop or conditional was opened and never closed.
    #[error("Unclosed {kind} opened at token {at}")]
    UnclosedBlock {
        /// Block kind ("loop" or "if").
        kind: &'static str,
        /// Index of the opening token.
        at: usize,
    },

    /// A block was closed that is not the innermost open one.
    #[error("Unmatched end of {kind} at token {at}")]
    UnmatchedEnd {
        /// Block kind ("loop" or "if").
        kind: &'static str,
        /// Index where the close was attempted.
        at: usize,
    },

    /// `break` with no enclosing loop.
    #[error("break outside of a loop at token {at}")]
    BreakOutsideLoop {
        /// Offending index.
        at: usize,
    },

    /// `continue` with no enclosing loop.
    #[error("continue outside of a loop at token {at}")]
    ContinueOutsideLoop {
        /// Offending index.
        at: usize,
    },

    /// `else` with no open conditional.
    #[error("else outside of an if at token {at}")]
    ElseOutsideIf {
        /// Offending index.
        at: usize,
    },

    /// A second `else` for the same conditional.
    #[error("Duplicate else at token {at}")]
    DuplicateElse {
        /// Offending index.
        at: usize,
    },

    /// The cleanup marker was placed while a block was still open.
    #[error("Cleanup region cannot start inside an open block (token {at})")]
    CleanupInsideBlock {
        /// Where the marker was placed.
        at: usize,
    },

    /// More than one cleanup marker.
    #[error("Cleanup region already starts at token {first}")]
    DuplicateCleanup {
        /// Where the first marker was placed.
        first: usize,
    },

    /// A link does not resolve to the right kind of token.
    #[error("Token {at} links to {target}, which is not a valid target")]
    InvalidLink {
        /// Token holding the link.
        at: usize,
        /// Where it points.
        target: usize,
    },

    /// A link jumps between the main body and the cleanup region.
    #[error("Token {at} links to {target} across the start of the cleanup region")]
    CrossesCleanup {
        /// Token holding the link.
        at: usize,
        /// Where it points.
        target: usize,
    },
}

/// A single instrument or data action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Send a command, expect no reply.
    Write {
        /// Raw command bytes.
        command: Vec<u8>,
    },
    /// Send a command and read a reply of at most `max_len` bytes.
    ///
    /// The reply is published as a data unit and becomes the last response
    /// seen by conditions and response-counted loops.
    Query {
        /// Raw command bytes.
        command: Vec<u8>,
        /// Upper bound on the reply length.
        max_len: usize,
    },
    /// Cancellable pause.
    Sleep(Duration),
    /// Publish literal bytes, e.g. a marker between scans.
    Emit {
        /// Bytes to publish.
        payload: Vec<u8>,
    },
    /// Write a line to the log.
    Log {
        /// Message text.
        message: String,
    },
}

/// Predicate over the worker's last response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Always true.
    Always,
    /// Always false.
    Never,
    /// The last response, minus trailing whitespace, equals these bytes.
    ResponseEquals(Vec<u8>),
    /// The last response contains these bytes.
    ResponseContains(Vec<u8>),
    /// Negation.
    Not(Box<Condition>),
}

impl Condition {
    /// Evaluate against the last response (`None` if no query has run yet).
    pub fn evaluate(&self, last_response: Option<&[u8]>) -> bool {
        match self {
            Condition::Always => true,
            Condition::Never => false,
            Condition::ResponseEquals(expected) => {
                last_response.is_some_and(|r| trim_end(r) == expected.as_slice())
            }
            Condition::ResponseContains(needle) => last_response.is_some_and(|r| {
                needle.is_empty() || r.windows(needle.len()).any(|w| w == needle.as_slice())
            }),
            Condition::Not(inner) => !inner.evaluate(last_response),
        }
    }
}

pub(crate) fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

/// How a loop decides whether to run another iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopKind {
    /// Fixed iteration count.
    Times(u64),
    /// Count parsed from the last response on first visit, then cached.
    FromResponse,
    /// Re-evaluated before every iteration.
    While(Condition),
    /// Runs until `break` or cancellation.
    Forever,
}

/// One step of a program. Links are token indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// An action.
    Statement(Statement),
    /// Loop head. `end` is the matching [`Token::LoopEnd`].
    LoopBegin {
        /// Iteration rule.
        kind: LoopKind,
        /// Index of the matching `LoopEnd`.
        end: usize,
    },
    /// Loop tail, jumps back to `begin`.
    LoopEnd {
        /// Index of the matching `LoopBegin`.
        begin: usize,
    },
    /// Leave the loop whose `LoopEnd` is at `target`.
    Break {
        /// Index of the enclosing loop's `LoopEnd`.
        target: usize,
    },
    /// Re-test the loop whose `LoopBegin` is at `target`.
    Continue {
        /// Index of the enclosing loop's `LoopBegin`.
        target: usize,
    },
    /// Conditional head.
    If {
        /// Branch predicate.
        condition: Condition,
        /// Index of the matching `Else`, if any.
        else_at: Option<usize>,
        /// First index after the whole conditional; may be the sentinel.
        end: usize,
    },
    /// Separator between the branches; the then-branch jumps from here to
    /// `end`.
    Else {
        /// First index after the whole conditional; may be the sentinel.
        end: usize,
    },
}

/// A linked program with an optional cleanup region.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Program {
    tokens: Vec<Token>,
    cleanup: Option<usize>,
}

impl Program {
    /// Assemble a program from pre-linked tokens, checking every link.
    pub fn from_parts(tokens: Vec<Token>, cleanup: Option<usize>) -> Result<Self, ProgramError> {
        let program = Self { tokens, cleanup };
        program.validate_links()?;
        Ok(program)
    }

    /// Number of tokens. Also the "past end" sentinel index.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the program has no tokens.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Token at `index`, or `None` at or past the sentinel.
    pub fn token(&self, index: usize) -> Option<&Token> {
        self.tokens.get(index)
    }

    /// All tokens in order.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// First index of the cleanup region.
    pub fn cleanup(&self) -> Option<usize> {
        self.cleanup
    }

    /// Index where the main body stops: the cleanup start or the sentinel.
    pub fn body_end(&self) -> usize {
        self.cleanup.unwrap_or(self.tokens.len())
    }

    /// Check that every link resolves inside the program (or to the
    /// sentinel where allowed) and lands on the right kind of token. Links
    /// stay on their side of the cleanup start, and loop exits target the
    /// innermost loop.
    pub fn validate_links(&self) -> Result<(), ProgramError> {
        let len = self.tokens.len();
        if let Some(cleanup) = self.cleanup {
            if cleanup > len {
                return Err(ProgramError::InvalidLink {
                    at: len,
                    target: cleanup,
                });
            }
        }

        let body_end = self.body_end();
        for (at, token) in self.tokens.iter().enumerate() {
            let bad = |target| ProgramError::InvalidLink { at, target };
            match token {
                Token::Statement(_) => {}
                Token::LoopBegin { end, .. } => match self.tokens.get(*end) {
                    Some(Token::LoopEnd { begin }) if *begin == at && *end > at => {}
                    _ => return Err(bad(*end)),
                },
                Token::LoopEnd { begin } => match self.tokens.get(*begin) {
                    Some(Token::LoopBegin { end, .. }) if *end == at => {}
                    _ => return Err(bad(*begin)),
                },
                Token::Break { target } => match self.tokens.get(*target) {
                    Some(Token::LoopEnd { begin })
                        if *begin < at && at < *target && self.innermost_loop_at(*begin, at) => {}
                    _ => return Err(bad(*target)),
                },
                Token::Continue { target } => match self.tokens.get(*target) {
                    Some(Token::LoopBegin { end, .. })
                        if *target < at && at < *end && self.innermost_loop_at(*target, at) => {}
                    _ => return Err(bad(*target)),
                },
                Token::If { else_at, end, .. } => {
                    if *end <= at || *end > len {
                        return Err(bad(*end));
                    }
                    if let Some(else_at) = else_at {
                        match self.tokens.get(*else_at) {
                            Some(Token::Else { end: else_end })
                                if *else_at > at && *else_at < *end && else_end == end => {}
                            _ => return Err(bad(*else_at)),
                        }
                    }
                }
                Token::Else { end } => {
                    if *end <= at || *end > len {
                        return Err(bad(*end));
                    }
                }
            }
            self.check_region(at, token, body_end)?;
        }
        Ok(())
    }

    /// Reject links that jump between the main body and the cleanup region.
    /// `If` and `Else` ends may land exactly on `body_end`, which ends the
    /// main body.
    fn check_region(&self, at: usize, token: &Token, body_end: usize) -> Result<(), ProgramError> {
        let in_body = at < body_end;
        let (strict, closing): (Vec<usize>, Option<usize>) = match token {
            Token::Statement(_) => (vec![], None),
            Token::LoopBegin { end, .. } => (vec![*end], None),
            Token::LoopEnd { begin } => (vec![*begin], None),
            Token::Break { target } | Token::Continue { target } => (vec![*target], None),
            Token::If { else_at, end, .. } => (else_at.iter().copied().collect(), Some(*end)),
            Token::Else { end } => (vec![], Some(*end)),
        };

        for target in strict {
            if (target < body_end) != in_body {
                return Err(ProgramError::CrossesCleanup { at, target });
            }
        }
        if let Some(end) = closing {
            let allowed = if in_body { end <= body_end } else { end >= body_end };
            if !allowed {
                return Err(ProgramError::CrossesCleanup { at, target: end });
            }
        }
        Ok(())
    }

    /// Whether the loop opened at `begin` is the innermost loop around `at`.
    fn innermost_loop_at(&self, begin: usize, at: usize) -> bool {
        !self.tokens[begin + 1..at]
            .iter()
            .any(|token| matches!(token, Token::LoopBegin { end, .. } if *end > at))
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Write { command } => write!(f, "write {:?}", String::from_utf8_lossy(command)),
            Statement::Query { command, max_len } => {
                write!(f, "query {:?} (max {max_len} bytes)", String::from_utf8_lossy(command))
            }
            Statement::Sleep(d) => write!(f, "sleep {d:?}"),
            Statement::Emit { payload } => write!(f, "emit {} bytes", payload.len()),
            Statement::Log { message } => write!(f, "log {message:?}"),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Statement(s) => write!(f, "{s}"),
            Token::LoopBegin { kind, end } => write!(f, "loop {kind:?} -> end {end}"),
            Token::LoopEnd { begin } => write!(f, "end loop -> {begin}"),
            Token::Break { target } => write!(f, "break -> {}", target + 1),
            Token::Continue { target } => write!(f, "continue -> {target}"),
            Token::If {
                condition,
                else_at,
                end,
            } => match else_at {
                Some(e) => write!(f, "if {condition:?} else {e} end {end}"),
                None => write!(f, "if {condition:?} end {end}"),
            },
            Token::Else { end } => write!(f, "else -> {end}"),
        }
    }
}

#[derive(Debug)]
enum OpenBlock {
    Loop { begin: usize, breaks: Vec<usize> },
    If { at: usize, else_at: Option<usize> },
}

/// Incrementally assembles and links a [`Program`].
///
/// Structural mistakes are recorded and reported by [`build`](Self::build),
/// so calls can be chained without checking each one.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    tokens: Vec<Token>,
    open: Vec<OpenBlock>,
    cleanup: Option<usize>,
    error: Option<ProgramError>,
}

impl ProgramBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn fail(&mut self, error: ProgramError) -> &mut Self {
        self.error.get_or_insert(error);
        self
    }

    fn next_index(&self) -> usize {
        self.tokens.len()
    }

    /// Append a statement.
    pub fn statement(&mut self, statement: Statement) -> &mut Self {
        self.tokens.push(Token::Statement(statement));
        self
    }

    /// Append a write.
    pub fn write(&mut self, command: impl Into<Vec<u8>>) -> &mut Self {
        self.statement(Statement::Write {
            command: command.into(),
        })
    }

    /// Append a query.
    pub fn query(&mut self, command: impl Into<Vec<u8>>, max_len: usize) -> &mut Self {
        self.statement(Statement::Query {
            command: command.into(),
            max_len,
        })
    }

    /// Append a cancellable sleep.
    pub fn sleep(&mut self, duration: Duration) -> &mut Self {
        self.statement(Statement::Sleep(duration))
    }

    /// Append a literal data emission.
    pub fn emit(&mut self, payload: impl Into<Vec<u8>>) -> &mut Self {
        self.statement(Statement::Emit {
            payload: payload.into(),
        })
    }

    /// Append a log line.
    pub fn log(&mut self, message: impl Into<String>) -> &mut Self {
        self.statement(Statement::Log {
            message: message.into(),
        })
    }

    /// Open a loop.
    pub fn begin_loop(&mut self, kind: LoopKind) -> &mut Self {
        let begin = self.next_index();
        // `end` is patched by `end_loop`.
        self.tokens.push(Token::LoopBegin { kind, end: begin });
        self.open.push(OpenBlock::Loop {
            begin,
            breaks: Vec::new(),
        });
        self
    }

    /// Close the innermost loop.
    pub fn end_loop(&mut self) -> &mut Self {
        let at = self.next_index();
        let Some((begin, breaks)) = self.pop_loop() else {
            return self.fail(ProgramError::UnmatchedEnd { kind: "loop", at });
        };

        self.tokens.push(Token::LoopEnd { begin });
        if let Some(Token::LoopBegin { end, .. }) = self.tokens.get_mut(begin) {
            *end = at;
        }
        for index in breaks {
            if let Some(Token::Break { target }) = self.tokens.get_mut(index) {
                *target = at;
            }
        }
        self
    }

    /// Leave the innermost loop.
    pub fn break_loop(&mut self) -> &mut Self {
        let at = self.next_index();
        let Some(pos) = self.innermost_loop() else {
            return self.fail(ProgramError::BreakOutsideLoop { at });
        };
        if let OpenBlock::Loop { breaks, .. } = &mut self.open[pos] {
            breaks.push(at);
        }
        // `target` is patched by `end_loop`.
        self.tokens.push(Token::Break { target: at });
        self
    }

    /// Jump back to the head of the innermost loop.
    pub fn continue_loop(&mut self) -> &mut Self {
        let at = self.next_index();
        let target = match self.innermost_loop().map(|pos| &self.open[pos]) {
            Some(OpenBlock::Loop { begin, .. }) => *begin,
            _ => return self.fail(ProgramError::ContinueOutsideLoop { at }),
        };
        self.tokens.push(Token::Continue { target });
        self
    }

    /// Open a conditional.
    pub fn begin_if(&mut self, condition: Condition) -> &mut Self {
        let at = self.next_index();
        self.tokens.push(Token::If {
            condition,
            else_at: None,
            end: at,
        });
        self.open.push(OpenBlock::If { at, else_at: None });
        self
    }

    /// Start the else-branch of the innermost conditional.
    pub fn else_branch(&mut self) -> &mut Self {
        let at = self.next_index();
        match self.open.last_mut() {
            Some(OpenBlock::If { else_at: None, .. }) => {}
            Some(OpenBlock::If { .. }) => return self.fail(ProgramError::DuplicateElse { at }),
            _ => return self.fail(ProgramError::ElseOutsideIf { at }),
        }
        if let Some(OpenBlock::If { else_at, .. }) = self.open.last_mut() {
            *else_at = Some(at);
        }
        self.tokens.push(Token::Else { end: at });
        self
    }

    /// Close the innermost conditional.
    pub fn end_if(&mut self) -> &mut Self {
        let end = self.next_index();
        let Some((at, else_at)) = self.pop_if() else {
            return self.fail(ProgramError::UnmatchedEnd { kind: "if", at: end });
        };

        if let Some(Token::If {
            else_at: link,
            end: if_end,
            ..
        }) = self.tokens.get_mut(at)
        {
            *link = else_at;
            *if_end = end;
        }
        if let Some(Token::Else { end: else_end }) = else_at.and_then(|i| self.tokens.get_mut(i)) {
            *else_end = end;
        }
        self
    }

    /// Mark the start of the cleanup region. Must be at top level.
    pub fn cleanup(&mut self) -> &mut Self {
        let at = self.next_index();
        if let Some(first) = self.cleanup {
            return self.fail(ProgramError::DuplicateCleanup { first });
        }
        if !self.open.is_empty() {
            return self.fail(ProgramError::CleanupInsideBlock { at });
        }
        self.cleanup = Some(at);
        self
    }

    /// Finish linking. The builder is left empty.
    pub fn build(&mut self) -> Result<Program, ProgramError> {
        let builder = std::mem::take(self);
        if let Some(error) = builder.error {
            return Err(error);
        }
        if let Some(block) = builder.open.last() {
            return Err(match block {
                OpenBlock::Loop { begin, .. } => ProgramError::UnclosedBlock {
                    kind: "loop",
                    at: *begin,
                },
                OpenBlock::If { at, .. } => ProgramError::UnclosedBlock { kind: "if", at: *at },
            });
        }
        Program::from_parts(builder.tokens, builder.cleanup)
    }

    fn innermost_loop(&self) -> Option<usize> {
        self.open
            .iter()
            .rposition(|block| matches!(block, OpenBlock::Loop { .. }))
    }

    fn pop_loop(&mut self) -> Option<(usize, Vec<usize>)> {
        match self.open.pop() {
            Some(OpenBlock::Loop { begin, breaks }) => Some((begin, breaks)),
            Some(other) => {
                self.open.push(other);
                None
            }
            None => None,
        }
    }

    fn pop_if(&mut self) -> Option<(usize, Option<usize>)> {
        match self.open.pop() {
            Some(OpenBlock::If { at, else_at }) => Some((at, else_at)),
            Some(other) => {
                self.open.push(other);
                None
            }
            None => None,
        }
    }
}
