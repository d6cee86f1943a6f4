//! # Parsing Expression Grammars, the flat way
//!
//! This crate takes a tree of PEG constructs and flattens it into a linear
//! program for a small virtual machine, instead of matching by recursive
//! descent. The machine does its own backtracking with explicit stacks, so a
//! deeply recursive grammar costs heap, not host stack.
//!
//! ## Pipeline
//!
//! An [`Expr`] tree goes into [`compile()`], which lowers every construct
//! into branch-addressed instructions and resolves all the forward references,
//! yielding a [`Program`]. A [`Machine`] then runs that program over a
//! code-point input and hands back an [`Outcome`]: the parse tree on a match,
//! and in either case the set of rule names it was hoping to see at the
//! furthest point it reached.
//!
//! Input is treated as a sequence of Unicode scalar values throughout.
//! Positions in [`Node`]s count code points, never bytes.
//!
//! ## Names
//!
//! Rule names are interned once, into [`Symbol`]s, and everything downstream
//! (instructions, nodes, expectation sets) traffics in those. The [`Program`]
//! keeps the [`Names`] table so callers can turn symbols back into text.

pub mod compile;
pub mod execute;
pub mod node;
pub mod program;
pub mod visit;

pub use compile::{compile, compile_with, CompileError, Options};
pub use execute::{Machine, Outcome, Status};
pub use node::Node;
pub use program::{Addr, Op, Program};
pub use visit::{NodeVisitor, VisitError};

use bimap::BiHashMap;

/// Interned string handle.
///
/// This number is the ID of a rule name and is used for quick equality
/// and looking up the original string.
pub type Symbol = u64;

/// Two-way registry of every rule name a program mentions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Names {
    interned: BiHashMap<String, Symbol>,
    /// Number of symbols that have ever been created.
    count: Symbol,
}

impl Names {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make or get the symbol handle for the given name.
    pub fn intern(&mut self, name: &str) -> Symbol {
        if let Some(&already) = self.interned.get_by_left(name) {
            already
        } else {
            let id = self.count;
            self.interned.insert(name.to_owned(), id);
            self.count += 1;
            id
        }
    }

    /// Get the ID of an already-interned name.
    pub fn find(&self, name: &str) -> Option<Symbol> {
        self.interned.get_by_left(name).copied()
    }

    /// The string a symbol was interned from.
    pub fn resolve(&self, symbol: Symbol) -> Option<&str> {
        self.interned.get_by_right(&symbol).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.interned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.is_empty()
    }
}

/// One PEG construct.
///
/// A grammar is a tree of these; [`compile()`] turns the tree into a runnable
/// [`Program`]. The variants mirror the usual PEG inventory: literals and
/// code-point ranges at the leaves, prioritized choice, sequencing, the three
/// quantifiers, the two non-consuming lookaheads, and named rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Match this exact run of code points.
    Literal(String),
    /// Match one code point inside the inclusive range.
    Range(char, char),
    /// Match every item in order, or consume nothing at all.
    Sequence(Vec<Expr>),
    /// Try each alternative in order; the first one to match wins, forever.
    Choice(Vec<Expr>),
    ZeroOrOne(Box<Expr>),
    ZeroOrMore(Box<Expr>),
    OneOrMore(Box<Expr>),
    /// Positive lookahead: succeed iff the item matches, consume nothing.
    And(Box<Expr>),
    /// Negative lookahead: succeed iff the item does *not* match.
    Not(Box<Expr>),
    /// Invoke the rule with this name. The rule may be defined later.
    RuleReference(String),
    /// Bind a name to a body; a match produces a [`Node`] carrying the name.
    RuleDefinition(String, Box<Expr>),
    /// An ordered set of rule definitions. The first rule is the entry point.
    Grammar(Vec<Expr>),
}

impl Expr {
    pub fn literal(text: impl Into<String>) -> Self {
        Expr::Literal(text.into())
    }

    pub fn range(min: char, max: char) -> Self {
        Expr::Range(min, max)
    }

    pub fn sequence(items: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Sequence(items.into_iter().collect())
    }

    pub fn choice(items: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Choice(items.into_iter().collect())
    }

    pub fn zero_or_one(item: Expr) -> Self {
        Expr::ZeroOrOne(Box::new(item))
    }

    pub fn zero_or_more(item: Expr) -> Self {
        Expr::ZeroOrMore(Box::new(item))
    }

    pub fn one_or_more(item: Expr) -> Self {
        Expr::OneOrMore(Box::new(item))
    }

    pub fn and(item: Expr) -> Self {
        Expr::And(Box::new(item))
    }

    pub fn not(item: Expr) -> Self {
        Expr::Not(Box::new(item))
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Expr::RuleReference(name.into())
    }

    pub fn rule(name: impl Into<String>, body: Expr) -> Self {
        Expr::RuleDefinition(name.into(), Box::new(body))
    }

    pub fn grammar(rules: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Grammar(rules.into_iter().collect())
    }

    /// Match one code point out of the given set.
    ///
    /// The set is collapsed into the minimal list of covering ranges first,
    /// so `set("abcdxyz")` costs two range checks rather than seven
    /// comparisons. An empty set never matches.
    pub fn set(chars: &str) -> Self {
        let mut set: Vec<char> = chars.chars().collect();
        set.sort_unstable();
        set.dedup();

        let mut ranges: Vec<Expr> = covering_ranges(&set)
            .into_iter()
            .map(|(min, max)| Expr::Range(min, max))
            .collect();
        if ranges.len() == 1 {
            ranges.pop().expect("len was checked")
        } else {
            Expr::Choice(ranges)
        }
    }

    /// Match only at the end of the input, consuming nothing.
    pub fn end_of_input() -> Self {
        Expr::not(Expr::range('\0', char::MAX))
    }

    /// Match exactly `n` occurrences of the item.
    pub fn count(item: Expr, n: usize) -> Self {
        match n {
            0 => Expr::Literal(String::new()),
            1 => item,
            _ => Expr::Sequence(vec![item; n]),
        }
    }

    /// Match `n` or more occurrences of the item.
    pub fn at_least(item: Expr, n: usize) -> Self {
        match n {
            0 => Expr::zero_or_more(item),
            1 => Expr::one_or_more(item),
            _ => {
                let more = Expr::zero_or_more(item.clone());
                let mut items = vec![item; n];
                items.push(more);
                Expr::Sequence(items)
            }
        }
    }

    /// Match up to `n` occurrences of the item, possibly none.
    pub fn at_most(item: Expr, n: usize) -> Self {
        match n {
            0 => Expr::Literal(String::new()),
            _ => {
                // Innermost first: opt(item), then opt(item opt(item)), etc.
                let mut matcher = Expr::zero_or_one(item.clone());
                for _ in 1..n {
                    matcher = Expr::zero_or_one(Expr::Sequence(vec![item.clone(), matcher]));
                }
                matcher
            }
        }
    }

    /// Match between `min` and `max` occurrences of the item, inclusive.
    /// Inverted bounds collapse to exactly `min` occurrences.
    pub fn between(item: Expr, min: usize, max: usize) -> Self {
        debug_assert!(min <= max, "repetition bounds are inverted: {min} > {max}");
        if min >= max {
            return Expr::count(item, min);
        }
        let tail = Expr::at_most(item.clone(), max - min);
        if min == 0 {
            tail
        } else {
            let mut items = vec![item; min];
            items.push(tail);
            Expr::Sequence(items)
        }
    }
}

/// Collapse a sorted, deduped list of code points into the smallest list of
/// inclusive ranges covering exactly those points.
fn covering_ranges(set: &[char]) -> Vec<(char, char)> {
    let mut out = Vec::new();
    if set.is_empty() {
        return out;
    }

    let mut run_start = 0;
    for idx in 1..=set.len() {
        // A run continues while the scalar values count up one-by-one; the
        // surrogate gap breaks a run on its own, since no char sits inside it.
        let contiguous = idx < set.len() && set[idx] as u32 == set[idx - 1] as u32 + 1;
        if !contiguous {
            out.push((set[run_start], set[idx - 1]));
            run_start = idx;
        }
    }
    out
}

#[test]
fn ranges_cover() {
    for (test, answer) in [
        ("abcde", vec![('a', 'e')]),
        ("ABCDEFGabcdefg", vec![('A', 'G'), ('a', 'g')]),
        (
            "testing 12345",
            vec![
                (' ', ' '),
                ('1', '5'),
                ('e', 'e'),
                ('g', 'g'),
                ('i', 'i'),
                ('n', 'n'),
                ('s', 't'),
            ],
        ),
        ("", vec![]),
        ("q", vec![('q', 'q')]),
    ] {
        let mut set: Vec<char> = test.chars().collect();
        set.sort_unstable();
        set.dedup();
        assert_eq!(covering_ranges(&set), answer, "for {test:?}");
    }
}

#[test]
fn interner_round_trips() {
    let mut names = Names::new();
    let a = names.intern("alpha");
    let b = names.intern("beta");
    assert_ne!(a, b);
    assert_eq!(names.intern("alpha"), a);
    assert_eq!(names.find("beta"), Some(b));
    assert_eq!(names.resolve(a), Some("alpha"));
    assert_eq!(names.find("gamma"), None);
    assert_eq!(names.len(), 2);
}

#[test]
fn repetition_helpers_desugar() {
    let a = || Expr::literal("a");
    assert_eq!(Expr::count(a(), 0), Expr::literal(""));
    assert_eq!(Expr::count(a(), 1), a());
    assert_eq!(Expr::count(a(), 3), Expr::sequence([a(), a(), a()]));
    assert_eq!(Expr::at_least(a(), 0), Expr::zero_or_more(a()));
    assert_eq!(Expr::at_least(a(), 1), Expr::one_or_more(a()));
    assert_eq!(
        Expr::at_most(a(), 2),
        Expr::zero_or_one(Expr::sequence([a(), Expr::zero_or_one(a())])),
    );
    assert_eq!(
        Expr::between(a(), 1, 2),
        Expr::sequence([a(), Expr::zero_or_one(a())]),
    );
}
