//! The virtual machine that runs a compiled [`Program`].
//!
//! The machine is three explicit stacks and an instruction pointer. Nothing
//! recurses in the host: rule calls push frames, speculation pushes cursor
//! checkpoints, and tree building pushes partial nodes. Every instruction
//! assigns the next address outright, so a step is one `match` with no
//! fallthrough bookkeeping.
//!
//! Failing to parse is not an error here. The machine always halts with an
//! [`Outcome`]; a miss simply has no tree, and the expectation set plus the
//! furthest offset say where and why matching stopped.

use std::collections::BTreeSet;

use tracing::trace;

use crate::{
    node::Node,
    program::{Addr, Op, Program},
    Symbol,
};

/// Where a machine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Accepted,
    Rejected,
}

/// The continuations a rule call returns through.
#[derive(Debug, Clone, Copy)]
struct Frame {
    success: Addr,
    failure: Addr,
}

/// What a finished run hands back.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// The matched top-level rule's node; `None` when the parse failed.
    pub tree: Option<Node>,
    /// Rule names that were wanted at the furthest cursor reached.
    pub expected: BTreeSet<Symbol>,
    /// The furthest cursor reached.
    pub offset: usize,
    /// The input, handed back so spans can be sliced out of it.
    pub text: Vec<char>,
}

impl Outcome {
    pub fn matched(&self) -> bool {
        self.tree.is_some()
    }
}

/// One in-flight parse of one input over one program.
///
/// [`Machine::run`] drives to a halt; [`Machine::step`] executes a single
/// instruction, for hosts that want to interleave their own bookkeeping
/// (deadlines, step budgets) with execution.
#[derive(Debug)]
pub struct Machine<'p> {
    program: &'p Program,
    text: Vec<char>,
    pc: Addr,
    /// Cursor stack; the top is the live position, everything below is a
    /// checkpoint some enclosing speculation may rewind to.
    cursors: Vec<usize>,
    frames: Vec<Frame>,
    /// Partial nodes; the bottom is the implicit root that collects the
    /// top-level match.
    nodes: Vec<Node>,
    expected: BTreeSet<Symbol>,
    offset: usize,
}

impl<'p> Machine<'p> {
    pub fn new(program: &'p Program, text: Vec<char>) -> Self {
        Machine {
            program,
            text,
            pc: Addr::At(0),
            cursors: vec![0],
            frames: vec![Frame {
                success: Addr::Accept,
                failure: Addr::Reject,
            }],
            nodes: vec![Node::partial(0)],
            expected: BTreeSet::new(),
            offset: 0,
        }
    }

    /// Decode a string into code points and set up a machine over it.
    pub fn over(program: &'p Program, text: &str) -> Self {
        Self::new(program, text.chars().collect())
    }

    pub fn status(&self) -> Status {
        match self.pc {
            Addr::At(_) => Status::Running,
            Addr::Accept => Status::Accepted,
            Addr::Reject => Status::Rejected,
        }
    }

    /// Execute one instruction. Does nothing once the machine has halted.
    pub fn step(&mut self) -> Status {
        let pc = match self.pc {
            Addr::At(pc) => pc,
            Addr::Accept => return Status::Accepted,
            Addr::Reject => return Status::Rejected,
        };
        let program = self.program;
        let op = &program.ops[pc];
        trace!(pc, %op, cursor = self.cursor(), "step");

        match op {
            Op::MatchLiteral {
                literal,
                success,
                failure,
            } => {
                let cursor = self.cursor();
                let stop = cursor + literal.len();
                if stop <= self.text.len() && self.text[cursor..stop] == **literal {
                    self.set_cursor(stop);
                    self.pc = *success;
                } else {
                    self.pc = *failure;
                }
            }
            &Op::MatchRange {
                min,
                max,
                success,
                failure,
            } => {
                let cursor = self.cursor();
                match self.text.get(cursor) {
                    Some(&point) if min <= point && point <= max => {
                        self.set_cursor(cursor + 1);
                        self.pc = success;
                    }
                    _ => self.pc = failure,
                }
            }
            &Op::Begin { next } => {
                self.cursors.push(self.cursor());
                self.pc = next;
            }
            &Op::Commit { next } => {
                let advanced = self.pop_cursor();
                self.set_cursor(advanced);
                self.pc = next;
            }
            &Op::Abort { next } => {
                self.pop_cursor();
                self.pc = next;
            }
            &Op::Jump { next } => self.pc = next,
            &Op::Invoke {
                target,
                success,
                failure,
            } => {
                self.frames.push(Frame { success, failure });
                self.pc = target;
            }
            Op::RevokeSuccess => {
                let frame = self.pop_frame();
                self.pc = frame.success;
            }
            Op::RevokeFailure => {
                let frame = self.pop_frame();
                self.pc = frame.failure;
            }
            &Op::Prepare { next } => {
                self.nodes.push(Node::partial(self.cursor()));
                self.pc = next;
            }
            &Op::Consume { name, next } => {
                let mut child = self.pop_node();
                child.name = Some(name);
                child.stop = self.cursor();
                self.top_node().children.push(child);
                self.pc = next;
            }
            &Op::Discard { next } => {
                self.pop_node();
                self.pc = next;
            }
            &Op::Expect { name, next } => {
                let cursor = self.cursor();
                if cursor > self.offset {
                    self.expected.clear();
                    self.offset = cursor;
                }
                if cursor == self.offset {
                    self.expected.insert(name);
                }
                self.pc = next;
            }
        }
        self.status()
    }

    /// Drive to a halt and hand back the outcome.
    pub fn run(mut self) -> Outcome {
        loop {
            match self.step() {
                Status::Running => continue,
                Status::Accepted => return self.finish(true),
                Status::Rejected => return self.finish(false),
            }
        }
    }

    fn finish(mut self, accepted: bool) -> Outcome {
        let tree = if accepted {
            debug_assert_eq!(self.cursors.len(), 1, "unbalanced checkpoint stack");
            debug_assert_eq!(self.nodes.len(), 1, "unbalanced node stack");
            let mut root = self.pop_node();
            debug_assert!(root.children.len() == 1, "the root collects one match");
            root.children.pop()
        } else {
            None
        };
        Outcome {
            tree,
            expected: self.expected,
            offset: self.offset,
            text: self.text,
        }
    }

    // The stacks below never drain mid-run: the compiler brackets every
    // Begin with a Commit or Abort, every Invoke with a Revoke, and every
    // Prepare with a Consume or Discard, on all control-flow paths.

    fn cursor(&self) -> usize {
        *self.cursors.last().expect("cursor stack underflow")
    }

    fn set_cursor(&mut self, to: usize) {
        *self.cursors.last_mut().expect("cursor stack underflow") = to;
    }

    fn pop_cursor(&mut self) -> usize {
        self.cursors.pop().expect("checkpoint stack underflow")
    }

    fn pop_frame(&mut self) -> Frame {
        self.frames.pop().expect("frame stack underflow")
    }

    fn pop_node(&mut self) -> Node {
        self.nodes.pop().expect("node stack underflow")
    }

    fn top_node(&mut self) -> &mut Node {
        self.nodes.last_mut().expect("node stack underflow")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compile, compile_with, Expr, Options};

    #[test]
    fn literal_match_builds_a_node() {
        let program = compile(&Expr::rule("word", Expr::literal("hey"))).unwrap();
        let outcome = program.parse("hey");
        let node = outcome.tree.expect("should match");
        assert_eq!(node.name, program.symbol("word"));
        assert_eq!((node.start, node.stop), (0, 3));
        assert!(node.children.is_empty());
    }

    #[test]
    fn a_miss_is_an_outcome_not_an_error() {
        let program = compile(&Expr::rule("word", Expr::literal("hey"))).unwrap();
        let outcome = program.parse("hex");
        assert!(!outcome.matched());
        assert_eq!(outcome.offset, 0);
        assert_eq!(
            outcome.expected,
            BTreeSet::from([program.symbol("word").unwrap()]),
        );
    }

    #[test]
    fn literal_never_reads_past_the_end() {
        let program = compile(&Expr::rule("word", Expr::literal("hey"))).unwrap();
        assert!(!program.parse("he").matched());
        assert!(!program.parse("").matched());
    }

    #[test]
    fn range_is_inclusive_on_both_ends() {
        let program = compile(&Expr::rule("digit", Expr::range('0', '9'))).unwrap();
        assert!(program.parse("0").matched());
        assert!(program.parse("9").matched());
        assert!(!program.parse("a").matched());
        assert!(!program.parse("").matched());
    }

    #[test]
    fn match_positions_count_code_points() {
        let program = compile(&Expr::rule(
            "word",
            Expr::sequence([Expr::literal("héllo"), Expr::literal("✨")]),
        ))
        .unwrap();
        let outcome = program.parse("héllo✨");
        let node = outcome.tree.expect("should match");
        // Five letters and a sparkle: six code points, not the UTF-8 length.
        assert_eq!((node.start, node.stop), (0, 6));
    }

    #[test]
    fn stepping_reaches_the_same_halt() {
        let program = compile(&Expr::rule("word", Expr::literal("ok"))).unwrap();
        let mut machine = Machine::over(&program, "ok");
        assert_eq!(machine.status(), Status::Running);
        let mut steps = 0;
        while machine.step() == Status::Running {
            steps += 1;
            assert!(steps < 1_000, "tiny program should halt quickly");
        }
        assert_eq!(machine.status(), Status::Accepted);
        // Stepping a halted machine stays put.
        assert_eq!(machine.step(), Status::Accepted);
    }

    #[test]
    fn furthest_failure_wins_the_expectation_set() {
        // "ab" then "cd"; input dies at the 'd'.
        let program = compile(&Expr::rule(
            "pair",
            Expr::sequence([Expr::literal("ab"), Expr::literal("cd")]),
        ))
        .unwrap();
        let outcome = program.parse("abcx");
        assert!(!outcome.matched());
        assert_eq!(outcome.offset, 2);
        assert_eq!(
            outcome.expected,
            BTreeSet::from([program.symbol("pair").unwrap()]),
        );
    }

    #[test]
    fn expectations_can_be_compiled_out() {
        let program = compile_with(
            &Expr::rule("word", Expr::literal("hey")),
            Options {
                expectations: false,
            },
        )
        .unwrap();
        let outcome = program.parse("hex");
        assert!(!outcome.matched());
        assert_eq!(outcome.offset, 0);
        assert!(outcome.expected.is_empty());
    }

    #[test]
    fn the_outcome_returns_the_input() {
        let program = compile(&Expr::rule("word", Expr::literal("hey"))).unwrap();
        let outcome = program.parse("hey");
        let node = outcome.tree.as_ref().unwrap();
        assert_eq!(node.text(&outcome.text), "hey");
    }
}
