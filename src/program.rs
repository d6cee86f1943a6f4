//! The flat, branch-addressed program the compiler emits and the machine
//! runs.
//!
//! Every instruction names its continuations outright: a match op carries
//! both a success and a failure address, so the machine never "falls through"
//! anywhere. The two halt sentinels are ordinary [`Addr`] values, which keeps
//! the step loop a single `while let`.

use std::fmt;

use crate::execute::{Machine, Outcome};
use crate::{Names, Symbol};

/// A branch target: a program offset, or one of the two halt sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addr {
    At(usize),
    /// Halt, with the whole input structure recognized.
    Accept,
    /// Halt, no parse.
    Reject,
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::At(offset) => write!(f, "@{offset}"),
            Addr::Accept => write!(f, "accept"),
            Addr::Reject => write!(f, "reject"),
        }
    }
}

/// One resolved instruction.
///
/// Literal text is stored as code points so cursor arithmetic and comparisons
/// never touch byte lengths. Names are interned [`Symbol`]s; the owning
/// [`Program`] can turn them back into strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Compare the literal at the cursor; advance past it on a hit.
    MatchLiteral {
        literal: Box<[char]>,
        success: Addr,
        failure: Addr,
    },
    /// Test a single code point against an inclusive range.
    MatchRange {
        min: char,
        max: char,
        success: Addr,
        failure: Addr,
    },
    /// Push a checkpoint of the cursor.
    Begin { next: Addr },
    /// Drop the checkpoint, keeping the advance made since.
    Commit { next: Addr },
    /// Pop back to the checkpoint, undoing the advance.
    Abort { next: Addr },
    Jump { next: Addr },
    /// Push a call frame of the two continuations and enter a rule.
    Invoke {
        target: Addr,
        success: Addr,
        failure: Addr,
    },
    /// Pop the innermost call frame and follow its success continuation.
    RevokeSuccess,
    /// Pop the innermost call frame and follow its failure continuation.
    RevokeFailure,
    /// Open a fresh partial node at the cursor.
    Prepare { next: Addr },
    /// Finalize the top partial node under `name` and attach it below.
    Consume { name: Symbol, next: Addr },
    /// Drop the top partial node.
    Discard { next: Addr },
    /// Note that `name` was wanted at the cursor, for failure reports.
    Expect { name: Symbol, next: Addr },
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::MatchLiteral {
                literal,
                success,
                failure,
            } => {
                let text: String = literal.iter().collect();
                write!(f, "match-literal {text:?} {success} {failure}")
            }
            Op::MatchRange {
                min,
                max,
                success,
                failure,
            } => write!(f, "match-range {min:?}..={max:?} {success} {failure}"),
            Op::Begin { next } => write!(f, "begin {next}"),
            Op::Commit { next } => write!(f, "commit {next}"),
            Op::Abort { next } => write!(f, "abort {next}"),
            Op::Jump { next } => write!(f, "jump {next}"),
            Op::Invoke {
                target,
                success,
                failure,
            } => write!(f, "invoke {target} {success} {failure}"),
            Op::RevokeSuccess => write!(f, "revoke-success"),
            Op::RevokeFailure => write!(f, "revoke-failure"),
            Op::Prepare { next } => write!(f, "prepare {next}"),
            Op::Consume { name, next } => write!(f, "consume #{name} {next}"),
            Op::Discard { next } => write!(f, "discard {next}"),
            Op::Expect { name, next } => write!(f, "expect #{name} {next}"),
        }
    }
}

/// A compiled grammar: a dense instruction array plus the name table.
///
/// Execution always starts at offset 0. The program is immutable; one
/// program can back any number of concurrent [`Machine`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub(crate) ops: Vec<Op>,
    pub(crate) names: Names,
}

impl Program {
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn names(&self) -> &Names {
        &self.names
    }

    /// The symbol a rule name was interned to, if the grammar mentions it.
    pub fn symbol(&self, name: &str) -> Option<Symbol> {
        self.names.find(name)
    }

    /// The rule name behind a symbol.
    pub fn name(&self, symbol: Symbol) -> Option<&str> {
        self.names.resolve(symbol)
    }

    /// Decode the text and run the program over it in one go.
    pub fn parse(&self, text: &str) -> Outcome {
        Machine::over(self, text).run()
    }

    fn rendered(&self, name: Symbol) -> &str {
        self.names.resolve(name).unwrap_or("?")
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (offset, op) in self.ops.iter().enumerate() {
            write!(f, "{offset:03} ")?;
            // Substitute interned names back in where an op carries one.
            match op {
                Op::Consume { name, next } => {
                    writeln!(f, "consume {:?} {next}", self.rendered(*name))?;
                }
                Op::Expect { name, next } => {
                    writeln!(f, "expect {:?} {next}", self.rendered(*name))?;
                }
                other => writeln!(f, "{other}")?,
            }
        }
        Ok(())
    }
}
