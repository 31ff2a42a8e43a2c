use super::*;
use crate::edb::EdbLayer;
use crate::term::{adornment_to_string, Term};
use crate::test_utils::{ancestor_setup, c, literal};

#[test]
fn adorned_program_chases_call_patterns() {
    let (layer, mut program) = ancestor_setup();
    let a = c(&layer, "a");
    let query = literal(&mut program, "anc", &[Term::Const(a), Term::Var(0)]);
    let adorned = adorned_program(&query, &program).unwrap();
    assert_eq!(adorned.n_rules(), 2);
    for rule in adorned.all_rules() {
        assert_eq!(
            adornment_to_string(rule.first_head().predicate().adornment(), 2),
            "bf"
        );
    }
    // the recursive rule's IDB body atom carries the propagated pattern
    let recursive = adorned
        .all_rules()
        .iter()
        .find(|r| r.n_idb_body() > 0)
        .unwrap();
    let idb_atom = recursive
        .body()
        .iter()
        .find(|l| !l.predicate().is_edb())
        .unwrap();
    assert_eq!(
        adornment_to_string(idb_atom.predicate().adornment(), 2),
        "bf"
    );
}

#[test]
fn adorned_program_covers_every_reached_pattern_once() {
    let layer = EdbLayer::new();
    layer.add_facts_str("e", &[&["a", "b"]]);
    let mut program = Program::new(&layer);
    program
        .parse_rules("p(X,Y) :- e(X,Y)\np(X,Z) :- e(X,Y), p(Y,Z)\nq(X) :- p(X,X)")
        .unwrap();
    let query = literal(&mut program, "q", &[Term::Var(0)]);
    let adorned = adorned_program(&query, &program).unwrap();
    // q^f, then p^ff from q's body, then p^bf from the recursive rule:
    // one adorned copy of each defining rule per reached pattern
    assert_eq!(adorned.n_rules(), 5);
}

#[test]
fn magic_rewrite_guards_every_rule() {
    let (layer, mut program) = ancestor_setup();
    let a = c(&layer, "a");
    let query = literal(&mut program, "anc", &[Term::Const(a), Term::Var(0)]);
    let adorned = adorned_program(&query, &program).unwrap();
    let (magic, input_pred, output_pred) = magic_rewrite(&query, &adorned).unwrap();

    assert_eq!(output_pred, query.predicate().id());
    assert_eq!(magic.arity_of(input_pred), 1, "one bound position");

    // two guarded rules plus the magic propagation rule
    assert_eq!(magic.n_rules(), 3);
    let guarded: Vec<_> = magic
        .all_rules()
        .iter()
        .filter(|r| r.first_head().predicate().id() == output_pred)
        .collect();
    assert_eq!(guarded.len(), 2);
    for rule in guarded {
        assert!(
            rule.body()[0].predicate().is_magic(),
            "guard atom leads the body"
        );
        assert_eq!(rule.body()[0].predicate().id(), input_pred);
    }

    let magic_rules: Vec<_> = magic
        .all_rules()
        .iter()
        .filter(|r| r.first_head().predicate().is_magic())
        .collect();
    assert_eq!(magic_rules.len(), 1);
    // magic(Y) :- magic(X), par(X,Y)
    let mr = magic_rules[0];
    assert_eq!(mr.body().len(), 2);
    assert!(mr.body()[0].predicate().is_magic());
    assert!(mr.body()[1].predicate().is_edb());
}

#[test]
fn magic_rewrite_deduplicates_generated_rules() {
    let layer = EdbLayer::new();
    layer.add_facts_str("e", &[&["a", "b"]]);
    let mut program = Program::new(&layer);
    // two syntactically distinct rules that generate the same magic rule
    program
        .parse_rules("p(X,Z) :- e(X,Y), p(Y,Z)\np(X,Z) :- e(X,Y), p(Y,Z)")
        .unwrap();
    let a = layer.dictionary().get_or_add_const("a");
    let query = literal(&mut program, "p", &[Term::Const(a), Term::Var(0)]);
    let adorned = adorned_program(&query, &program).unwrap();
    let (magic, _, _) = magic_rewrite(&query, &adorned).unwrap();
    let magic_rules = magic
        .all_rules()
        .iter()
        .filter(|r| r.first_head().predicate().is_magic())
        .count();
    assert_eq!(magic_rules, 1, "identical magic rules collapse");
}

#[test]
fn magic_seed_rows_take_the_bound_values() {
    let (layer, mut program) = ancestor_setup();
    let a = c(&layer, "a");
    let b = c(&layer, "b");
    let query_tuple = literal(&mut program, "anc", &[Term::Const(a), Term::Var(0)]);
    let rows = magic_seed_rows(&query_tuple, None, None);
    assert_eq!(rows, vec![vec![a]]);

    let rows = magic_seed_rows(&query_tuple, Some(&[0][..]), Some(&[a, b][..]));
    assert_eq!(rows, vec![vec![a], vec![b]]);
}

#[test]
fn unbound_queries_get_a_zero_arity_magic_seed() {
    let (layer, mut program) = ancestor_setup();
    let _ = layer;
    let query = literal(&mut program, "anc", &[Term::Var(0), Term::Var(1)]);
    let adorned = adorned_program(&query, &program).unwrap();
    let (magic, input_pred, _) = magic_rewrite(&query, &adorned).unwrap();
    assert_eq!(magic.arity_of(input_pred), 0);
    let rows = magic_seed_rows(&query, None, None);
    assert_eq!(rows, vec![Vec::<u64>::new()]);
}
