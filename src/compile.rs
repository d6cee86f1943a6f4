//! Lowering from an [`Expr`] tree to a flat [`Program`].
//!
//! ## How the flattening works
//!
//! Every construct is compiled against three labels: the *entry* its first
//! instruction must carry, and the *success* and *failure* continuations
//! control should reach afterwards. Labels are `Reference` cells living in
//! an arena; instructions store arena indices, and nobody knows any concrete
//! offset until the whole program is laid out.
//!
//! Lowering happens in two passes. The first walks the tree and appends
//! instructions in execution-layout order, creating references on demand
//! (a rule mentioned before its definition simply gets its cell early). The
//! second pass resolves every instruction's entry reference to its final
//! position and freezes the indices into [`Addr`]s. A reference that is still
//! unresolved at that point is a bug in the lowering, not in the grammar, and
//! is reported as such.
//!
//! Prioritized choice never becomes a runtime concept: alternatives are laid
//! out in order and each one's failure label is simply the entry of the next,
//! so the machine tries them first-to-last by construction.

use std::collections::{HashMap, HashSet};

use generational_arena::{Arena, Index};
use itertools::Itertools;
use thiserror::Error;
use tracing::debug;

use crate::{
    program::{Addr, Op, Program},
    Expr, Names, Symbol,
};

/// Why a grammar would not compile.
///
/// Everything except the last two variants is a malformed grammar, i.e. the
/// caller's mistake. `AlreadyResolved` and `UnresolvedReference` mean the
/// lowering itself produced an inconsistent layout and should be reported as
/// a bug in this crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("a sequence needs at least one item")]
    EmptySequence,
    #[error("a grammar needs at least one rule")]
    EmptyGrammar,
    #[error("code point range start {min:?} is above its end {max:?}")]
    InvertedRange { min: char, max: char },
    #[error("the root must be a grammar or a single rule definition")]
    MalformedRoot,
    #[error("every top-level grammar item must be a rule definition")]
    BareGrammarItem,
    #[error("rule definitions can only appear at the top level of a grammar")]
    MisplacedDefinition,
    #[error("rule {0:?} is defined more than once")]
    DuplicateRule(String),
    #[error("rule {0:?} is referenced but never defined")]
    UndefinedRule(String),
    #[error("a label was resolved twice while laying out the program")]
    AlreadyResolved,
    #[error("instruction {0} still holds an unresolved label")]
    UnresolvedReference(usize),
}

/// Compilation switches.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Emit the bookkeeping that records which rule was wanted at the
    /// furthest cursor the machine reaches. Costs one extra instruction per
    /// literal or range; turn it off for grammars that never report errors.
    pub expectations: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options { expectations: true }
    }
}

/// Compile a grammar with default [`Options`].
pub fn compile(root: &Expr) -> Result<Program, CompileError> {
    compile_with(root, Options::default())
}

/// Compile a grammar.
///
/// The root must be an [`Expr::Grammar`], or a single [`Expr::RuleDefinition`]
/// which is treated as a one-rule grammar. The first rule is the program's
/// entry point; later rules are only reachable through references.
pub fn compile_with(root: &Expr, options: Options) -> Result<Program, CompileError> {
    let rules = match root {
        Expr::Grammar(rules) => rules.as_slice(),
        Expr::RuleDefinition(..) => std::slice::from_ref(root),
        _ => return Err(CompileError::MalformedRoot),
    };

    let mut compiler = Compiler {
        refs: Arena::new(),
        rules: HashMap::new(),
        defined: HashSet::new(),
        names: Names::new(),
        current_rule: None,
        options,
    };
    let mut insts = Vec::new();
    compiler.lower_grammar(rules, &mut insts)?;
    compiler.finish(insts)
}

/// A forward-declarable label: eventually it holds the address of the
/// instruction it names.
#[derive(Debug, Default)]
struct Reference {
    addr: Option<Addr>,
}

impl Reference {
    fn resolve(&mut self, addr: Addr) -> Result<(), CompileError> {
        if self.addr.is_some() {
            return Err(CompileError::AlreadyResolved);
        }
        self.addr = Some(addr);
        Ok(())
    }
}

/// The label triple every construct is lowered against.
#[derive(Clone, Copy)]
struct Links {
    entry: Index,
    success: Index,
    failure: Index,
}

/// An instruction whose branch targets are still arena indices.
struct Inst {
    /// The label this instruction sits at; resolved to its position once the
    /// layout is final.
    entry: Index,
    kind: InstKind,
}

enum InstKind {
    MatchLiteral {
        literal: Box<[char]>,
        success: Index,
        failure: Index,
    },
    MatchRange {
        min: char,
        max: char,
        success: Index,
        failure: Index,
    },
    Begin {
        next: Index,
    },
    Commit {
        next: Index,
    },
    Abort {
        next: Index,
    },
    Jump {
        next: Index,
    },
    Invoke {
        target: Index,
        success: Index,
        failure: Index,
    },
    RevokeSuccess,
    RevokeFailure,
    Prepare {
        next: Index,
    },
    Consume {
        name: Symbol,
        next: Index,
    },
    Discard {
        next: Index,
    },
    Expect {
        name: Symbol,
        next: Index,
    },
}

struct Compiler {
    refs: Arena<Reference>,
    /// Rule name to the label of its first instruction, created on first
    /// mention. This is what lets a reference precede its definition.
    rules: HashMap<Symbol, Index>,
    defined: HashSet<Symbol>,
    names: Names,
    /// The rule whose body is being lowered, stamped into expectation ops.
    current_rule: Option<Symbol>,
    options: Options,
}

impl Compiler {
    fn fresh(&mut self) -> Index {
        self.refs.insert(Reference::default())
    }

    /// The label registered for a rule name, creating it if this is the
    /// first mention.
    fn rule_reference(&mut self, name: &str) -> Index {
        let sym = self.names.intern(name);
        match self.rules.get(&sym) {
            Some(&reference) => reference,
            None => {
                let reference = self.refs.insert(Reference::default());
                self.rules.insert(sym, reference);
                reference
            }
        }
    }

    fn lower_grammar(&mut self, rules: &[Expr], out: &mut Vec<Inst>) -> Result<(), CompileError> {
        if rules.is_empty() {
            return Err(CompileError::EmptyGrammar);
        }
        for rule in rules {
            let (name, body) = match rule {
                Expr::RuleDefinition(name, body) => (name, body),
                _ => return Err(CompileError::BareGrammarItem),
            };
            let sym = self.names.intern(name);
            if !self.defined.insert(sym) {
                return Err(CompileError::DuplicateRule(name.clone()));
            }
            let entry = self.rule_reference(name);
            self.lower_rule(sym, entry, body, out)?;
        }
        Ok(())
    }

    /// One rule block: reserve a node, run the body, then either finalize
    /// the node and return through the caller's success continuation or drop
    /// it and return through the failure one.
    fn lower_rule(
        &mut self,
        name: Symbol,
        entry: Index,
        body: &Expr,
        out: &mut Vec<Inst>,
    ) -> Result<(), CompileError> {
        let body_entry = self.fresh();
        let consume = self.fresh();
        let discard = self.fresh();
        let on_success = self.fresh();
        let on_failure = self.fresh();

        out.push(Inst {
            entry,
            kind: InstKind::Prepare { next: body_entry },
        });
        self.current_rule = Some(name);
        self.lower(
            body,
            Links {
                entry: body_entry,
                success: consume,
                failure: discard,
            },
            out,
        )?;
        self.current_rule = None;
        out.push(Inst {
            entry: consume,
            kind: InstKind::Consume {
                name,
                next: on_success,
            },
        });
        out.push(Inst {
            entry: discard,
            kind: InstKind::Discard { next: on_failure },
        });
        out.push(Inst {
            entry: on_success,
            kind: InstKind::RevokeSuccess,
        });
        out.push(Inst {
            entry: on_failure,
            kind: InstKind::RevokeFailure,
        });
        Ok(())
    }

    fn lower(&mut self, expr: &Expr, links: Links, out: &mut Vec<Inst>) -> Result<(), CompileError> {
        match expr {
            Expr::Literal(text) => {
                let entry = self.expectation(links.entry, out);
                out.push(Inst {
                    entry,
                    kind: InstKind::MatchLiteral {
                        literal: text.chars().collect(),
                        success: links.success,
                        failure: links.failure,
                    },
                });
                Ok(())
            }
            &Expr::Range(min, max) => {
                if min > max {
                    return Err(CompileError::InvertedRange { min, max });
                }
                let entry = self.expectation(links.entry, out);
                out.push(Inst {
                    entry,
                    kind: InstKind::MatchRange {
                        min,
                        max,
                        success: links.success,
                        failure: links.failure,
                    },
                });
                Ok(())
            }
            Expr::Sequence(items) => self.lower_sequence(items, links, out),
            Expr::Choice(items) => self.lower_choice(items, links, out),
            Expr::ZeroOrOne(item) => {
                // Either way the construct is "done"; only the cursor differs.
                self.lower(
                    item,
                    Links {
                        entry: links.entry,
                        success: links.success,
                        failure: links.success,
                    },
                    out,
                )
            }
            Expr::ZeroOrMore(item) => {
                // Success loops back to the item's own entry; the first miss
                // leaves the loop through the outer success continuation.
                self.lower(
                    item,
                    Links {
                        entry: links.entry,
                        success: links.entry,
                        failure: links.success,
                    },
                    out,
                )
            }
            Expr::OneOrMore(item) => {
                let desugared =
                    Expr::Sequence(vec![(**item).clone(), Expr::ZeroOrMore(item.clone())]);
                self.lower(&desugared, links, out)
            }
            Expr::And(item) => self.lower_lookahead(item, links, false, out),
            Expr::Not(item) => self.lower_lookahead(item, links, true, out),
            Expr::RuleReference(name) => {
                let target = self.rule_reference(name);
                out.push(Inst {
                    entry: links.entry,
                    kind: InstKind::Invoke {
                        target,
                        success: links.success,
                        failure: links.failure,
                    },
                });
                Ok(())
            }
            Expr::RuleDefinition(..) | Expr::Grammar(_) => Err(CompileError::MisplacedDefinition),
        }
    }

    /// `Begin` a checkpoint, run the items threaded success-to-entry, then
    /// `Commit` keeping the advance, with a single shared `Abort` unwinding
    /// any partial advance on the way to the failure continuation.
    fn lower_sequence(
        &mut self,
        items: &[Expr],
        links: Links,
        out: &mut Vec<Inst>,
    ) -> Result<(), CompileError> {
        if items.is_empty() {
            return Err(CompileError::EmptySequence);
        }
        let commit = self.fresh();
        let abort = self.fresh();

        let mut entry = self.fresh();
        out.push(Inst {
            entry: links.entry,
            kind: InstKind::Begin { next: entry },
        });
        for (idx, item) in items.iter().enumerate() {
            let success = if idx + 1 == items.len() {
                commit
            } else {
                self.fresh()
            };
            self.lower(
                item,
                Links {
                    entry,
                    success,
                    failure: abort,
                },
                out,
            )?;
            entry = success;
        }
        out.push(Inst {
            entry: commit,
            kind: InstKind::Commit {
                next: links.success,
            },
        });
        out.push(Inst {
            entry: abort,
            kind: InstKind::Abort {
                next: links.failure,
            },
        });
        Ok(())
    }

    /// Alternatives laid out in priority order; each one fails into the
    /// entry of the next, the last into the outer failure continuation.
    fn lower_choice(
        &mut self,
        items: &[Expr],
        links: Links,
        out: &mut Vec<Inst>,
    ) -> Result<(), CompileError> {
        if items.is_empty() {
            out.push(Inst {
                entry: links.entry,
                kind: InstKind::Jump {
                    next: links.failure,
                },
            });
            return Ok(());
        }
        let mut entry = links.entry;
        for (idx, item) in items.iter().enumerate() {
            let failure = if idx + 1 == items.len() {
                links.failure
            } else {
                self.fresh()
            };
            self.lower(
                item,
                Links {
                    entry,
                    success: links.success,
                    failure,
                },
                out,
            )?;
            entry = failure;
        }
        Ok(())
    }

    /// Both lookaheads checkpoint, run the item, and unconditionally `Abort`
    /// back to the checkpoint; only the continuation taken out of the two
    /// `Abort`s reflects whether the item matched. `invert` swaps them.
    fn lower_lookahead(
        &mut self,
        item: &Expr,
        links: Links,
        invert: bool,
        out: &mut Vec<Inst>,
    ) -> Result<(), CompileError> {
        let inner = self.fresh();
        let on_hit = self.fresh();
        let on_miss = self.fresh();
        let (hit_goes, miss_goes) = if invert {
            (links.failure, links.success)
        } else {
            (links.success, links.failure)
        };

        out.push(Inst {
            entry: links.entry,
            kind: InstKind::Begin { next: inner },
        });
        self.lower(
            item,
            Links {
                entry: inner,
                success: on_hit,
                failure: on_miss,
            },
            out,
        )?;
        out.push(Inst {
            entry: on_hit,
            kind: InstKind::Abort { next: hit_goes },
        });
        out.push(Inst {
            entry: on_miss,
            kind: InstKind::Abort { next: miss_goes },
        });
        Ok(())
    }

    /// Emit the op noting what the current rule hoped to see here, when
    /// expectation tracking is on. Returns the label the actual match op
    /// should carry.
    fn expectation(&mut self, entry: Index, out: &mut Vec<Inst>) -> Index {
        match self.current_rule {
            Some(name) if self.options.expectations => {
                let next = self.fresh();
                out.push(Inst {
                    entry,
                    kind: InstKind::Expect { name, next },
                });
                next
            }
            _ => entry,
        }
    }

    /// Second pass: pin every entry label to its layout position, then
    /// freeze all indices into addresses.
    fn finish(mut self, insts: Vec<Inst>) -> Result<Program, CompileError> {
        let mut undefined = self
            .rules
            .keys()
            .filter(|sym| !self.defined.contains(sym))
            .collect_vec();
        undefined.sort_unstable();
        if let Some(&&sym) = undefined.first() {
            let name = self.names.resolve(sym).unwrap_or("?").to_owned();
            return Err(CompileError::UndefinedRule(name));
        }

        for (offset, inst) in insts.iter().enumerate() {
            let cell = self
                .refs
                .get_mut(inst.entry)
                .ok_or(CompileError::UnresolvedReference(offset))?;
            cell.resolve(Addr::At(offset))?;
        }

        let ops = insts
            .into_iter()
            .enumerate()
            .map(|(offset, inst)| self.freeze(inst, offset))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(ops = ops.len(), rules = self.defined.len(), "grammar lowered");
        Ok(Program {
            ops,
            names: self.names,
        })
    }

    fn addr(&self, reference: Index, at: usize) -> Result<Addr, CompileError> {
        self.refs
            .get(reference)
            .and_then(|cell| cell.addr)
            .ok_or(CompileError::UnresolvedReference(at))
    }

    fn freeze(&self, inst: Inst, at: usize) -> Result<Op, CompileError> {
        Ok(match inst.kind {
            InstKind::MatchLiteral {
                literal,
                success,
                failure,
            } => Op::MatchLiteral {
                literal,
                success: self.addr(success, at)?,
                failure: self.addr(failure, at)?,
            },
            InstKind::MatchRange {
                min,
                max,
                success,
                failure,
            } => Op::MatchRange {
                min,
                max,
                success: self.addr(success, at)?,
                failure: self.addr(failure, at)?,
            },
            InstKind::Begin { next } => Op::Begin {
                next: self.addr(next, at)?,
            },
            InstKind::Commit { next } => Op::Commit {
                next: self.addr(next, at)?,
            },
            InstKind::Abort { next } => Op::Abort {
                next: self.addr(next, at)?,
            },
            InstKind::Jump { next } => Op::Jump {
                next: self.addr(next, at)?,
            },
            InstKind::Invoke {
                target,
                success,
                failure,
            } => Op::Invoke {
                target: self.addr(target, at)?,
                success: self.addr(success, at)?,
                failure: self.addr(failure, at)?,
            },
            InstKind::RevokeSuccess => Op::RevokeSuccess,
            InstKind::RevokeFailure => Op::RevokeFailure,
            InstKind::Prepare { next } => Op::Prepare {
                next: self.addr(next, at)?,
            },
            InstKind::Consume { name, next } => Op::Consume {
                name,
                next: self.addr(next, at)?,
            },
            InstKind::Discard { next } => Op::Discard {
                next: self.addr(next, at)?,
            },
            InstKind::Expect { name, next } => Op::Expect {
                name,
                next: self.addr(next, at)?,
            },
        })
    }
}
