//! End-to-end runs of small grammars through the whole pipeline.

use std::collections::BTreeSet;

use magpie::{compile, Expr, Machine, Node, Status};

fn span(node: &Node) -> (usize, usize) {
    (node.start, node.stop)
}

#[test]
fn single_literal_rule() {
    let program = compile(&Expr::rule("R", Expr::literal("a"))).unwrap();
    let outcome = program.parse("a");
    let node = outcome.tree.expect("should match");
    assert_eq!(node.name, program.symbol("R"));
    assert_eq!(span(&node), (0, 1));
}

#[test]
fn choice_takes_whichever_alternative_matches() {
    let program = compile(&Expr::rule(
        "R",
        Expr::choice([Expr::literal("a"), Expr::literal("b")]),
    ))
    .unwrap();
    let node = program.parse("b").tree.expect("should match");
    assert_eq!(span(&node), (0, 1));
}

#[test]
fn choice_prefers_the_first_alternative() {
    // Both alternatives match "ab"; the first one is shorter and must win.
    let program = compile(&Expr::rule(
        "R",
        Expr::choice([Expr::literal("a"), Expr::literal("ab")]),
    ))
    .unwrap();
    let node = program.parse("ab").tree.expect("should match");
    assert_eq!(span(&node), (0, 1));
}

#[test]
fn repetition_swallows_the_whole_run() {
    let program = compile(&Expr::rule("R", Expr::zero_or_more(Expr::literal("a")))).unwrap();
    let node = program.parse("aaa").tree.expect("should match");
    assert_eq!(span(&node), (0, 3));

    // Zero occurrences is still a match.
    let node = program.parse("").tree.expect("empty input should match");
    assert_eq!(span(&node), (0, 0));
}

#[test]
fn one_or_more_requires_one() {
    let program = compile(&Expr::rule("R", Expr::one_or_more(Expr::literal("a")))).unwrap();
    assert_eq!(
        span(&program.parse("aa").tree.expect("should match")),
        (0, 2),
    );
    assert!(!program.parse("").matched());
}

#[test]
fn sequence_failure_reports_the_furthest_position() {
    let program = compile(&Expr::rule(
        "R",
        Expr::sequence([Expr::literal("a"), Expr::literal("b")]),
    ))
    .unwrap();
    let outcome = program.parse("ac");
    assert!(!outcome.matched());
    assert_eq!(outcome.offset, 1);
    assert_eq!(
        outcome.expected,
        BTreeSet::from([program.symbol("R").unwrap()]),
    );
}

#[test]
fn positive_lookahead_consumes_nothing() {
    let program = compile(&Expr::rule(
        "R",
        Expr::sequence([Expr::and(Expr::literal("a")), Expr::literal("a")]),
    ))
    .unwrap();
    let node = program.parse("a").tree.expect("should match");
    // The lookahead saw the 'a' and put the cursor back; the literal then
    // consumed it exactly once.
    assert_eq!(span(&node), (0, 1));
}

#[test]
fn negative_lookahead_gates_the_match() {
    let program = compile(&Expr::rule(
        "R",
        Expr::sequence([Expr::not(Expr::literal("a")), Expr::literal("b")]),
    ))
    .unwrap();
    let node = program.parse("b").tree.expect("should match");
    assert_eq!(span(&node), (0, 1));

    let outcome = program.parse("a");
    assert!(!outcome.matched());
    assert_eq!(outcome.offset, 0);
}

#[test]
fn recursion_nests_the_tree() {
    // R = "(" R ")" | "x"
    let program = compile(&Expr::rule(
        "R",
        Expr::choice([
            Expr::sequence([
                Expr::literal("("),
                Expr::reference("R"),
                Expr::literal(")"),
            ]),
            Expr::literal("x"),
        ]),
    ))
    .unwrap();

    let outer = program.parse("((x))").tree.expect("should match");
    assert_eq!(span(&outer), (0, 5));
    let middle = &outer.children[0];
    assert_eq!(span(middle), (1, 4));
    let inner = &middle.children[0];
    assert_eq!(span(inner), (2, 3));
    assert!(inner.children.is_empty());
}

#[test]
fn rules_can_reference_forward() {
    let program = compile(&Expr::grammar([
        Expr::rule("pair", Expr::sequence([
            Expr::reference("letter"),
            Expr::reference("letter"),
        ])),
        Expr::rule("letter", Expr::range('a', 'z')),
    ]))
    .unwrap();

    let node = program.parse("ok").tree.expect("should match");
    assert_eq!(node.name, program.symbol("pair"));
    assert_eq!(node.children.len(), 2);
    assert_eq!(span(&node.children[0]), (0, 1));
    assert_eq!(span(&node.children[1]), (1, 2));
}

#[test]
fn deep_recursion_needs_no_host_stack() {
    let program = compile(&Expr::rule(
        "R",
        Expr::choice([
            Expr::sequence([
                Expr::literal("("),
                Expr::reference("R"),
                Expr::literal(")"),
            ]),
            Expr::literal("x"),
        ]),
    ))
    .unwrap();

    // Deep enough that descent-by-host-recursion would have blown up.
    let depth = 50_000;
    let mut text = String::with_capacity(2 * depth + 1);
    for _ in 0..depth {
        text.push('(');
    }
    text.push('x');
    for _ in 0..depth {
        text.push(')');
    }

    let node = program.parse(&text).tree.expect("should match");
    assert_eq!(span(&node), (0, 2 * depth + 1));
}

#[test]
fn character_sets_collapse_to_ranges() {
    let program = compile(&Expr::rule("hex", Expr::one_or_more(Expr::set("0123456789abcdef"))))
        .unwrap();
    assert!(program.parse("c0ffee").matched());
    assert!(!program.parse("tea").matched());
}

#[test]
fn end_of_input_anchors_the_match() {
    let anchored = compile(&Expr::rule(
        "R",
        Expr::sequence([Expr::literal("a"), Expr::end_of_input()]),
    ))
    .unwrap();
    assert!(anchored.parse("a").matched());
    assert!(!anchored.parse("ab").matched());
}

#[test]
fn bounded_repetition() {
    let program = compile(&Expr::rule("R", Expr::sequence([
        Expr::between(Expr::literal("a"), 2, 3),
        Expr::end_of_input(),
    ])))
    .unwrap();
    assert!(!program.parse("a").matched());
    assert!(program.parse("aa").matched());
    assert!(program.parse("aaa").matched());
    assert!(!program.parse("aaaa").matched());
}

#[test]
fn stacks_are_balanced_at_the_halt() {
    // A grammar that exercises every bracket pair: speculation, rule calls,
    // node building, lookahead.
    let program = compile(&Expr::grammar([
        Expr::rule("top", Expr::sequence([
            Expr::not(Expr::literal("!")),
            Expr::one_or_more(Expr::reference("item")),
        ])),
        Expr::rule("item", Expr::choice([
            Expr::literal("a"),
            Expr::sequence([Expr::literal("["), Expr::reference("item"), Expr::literal("]")]),
        ])),
    ]))
    .unwrap();

    for text in ["a", "[a]", "[[a]]a", "aa[a]"] {
        let mut machine = Machine::over(&program, text);
        while machine.step() == Status::Running {}
        assert_eq!(machine.status(), Status::Accepted, "on {text:?}");
    }
}

#[test]
fn spans_nest_and_stay_ordered() {
    let program = compile(&Expr::grammar([
        Expr::rule("list", Expr::sequence([
            Expr::literal("("),
            Expr::zero_or_more(Expr::reference("list")),
            Expr::literal(")"),
        ])),
    ]))
    .unwrap();

    let node = program.parse("(()(()))").tree.expect("should match");
    check_spans(&node);
}

fn check_spans(node: &Node) {
    assert!(node.start <= node.stop);
    let mut cursor = node.start;
    for child in &node.children {
        assert!(node.start <= child.start && child.stop <= node.stop);
        assert!(cursor <= child.start, "children out of order");
        cursor = child.stop;
        check_spans(child);
    }
}
