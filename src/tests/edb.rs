use super::*;
use crate::program::Program;
use crate::term::Term;
use crate::test_utils::{c, literal};

fn setup() -> (EdbLayer, Program) {
    let layer = EdbLayer::new();
    layer.add_facts_str(
        "e",
        &[&["a", "b"], &["a", "c"], &["b", "c"], &["c", "c"]],
    );
    let program = Program::new(&layer);
    (layer, program)
}

#[test]
fn dictionary_interns_and_resolves() {
    let dict = Dictionary::new();
    let id = dict.get_or_add_const("alpha");
    assert_eq!(dict.get_or_add_const("alpha"), id);
    assert_eq!(dict.const_text(id), Some("alpha"));
    assert_eq!(dict.const_id("alpha"), Some(id));
    assert_eq!(dict.const_id("beta"), None);

    let p = dict.get_or_add_pred("edge");
    assert_eq!(dict.pred("edge"), Some(p));
    assert_eq!(dict.pred_name(p), Some("edge"));
    assert_eq!(dict.n_preds(), 1);
}

#[test]
fn facts_are_stored_sorted_and_distinct() {
    let layer = EdbLayer::new();
    let id = layer.add_facts("r", 1, vec![vec![3], vec![1], vec![3]]);
    assert!(layer.does_pred_exist(id));
    assert_eq!(layer.pred_arity(id), 1);
    let mut program = Program::new(&layer);
    let lit = literal(&mut program, "r", &[Term::Var(0)]);
    assert_eq!(layer.cardinality(&lit), 2);
}

#[test]
fn add_facts_extends_an_existing_relation() {
    let layer = EdbLayer::new();
    layer.add_facts("r", 1, vec![vec![1]]);
    layer.add_facts("r", 1, vec![vec![2]]);
    let mut program = Program::new(&layer);
    let lit = literal(&mut program, "r", &[Term::Var(0)]);
    assert_eq!(layer.cardinality(&lit), 2);
}

#[test]
fn query_projects_variable_positions() {
    let (layer, mut program) = setup();
    let a = c(&layer, "a");
    let lit = literal(&mut program, "e", &[Term::Const(a), Term::Var(0)]);
    let mut out = TupleTable::new(1);
    layer.query(&lit, &mut out, None, None);
    let mut rows: Vec<u64> = out.iter_rows().map(|r| r[0]).collect();
    rows.sort_unstable();
    assert_eq!(rows, vec![c(&layer, "b"), c(&layer, "c")]);
}

#[test]
fn query_enforces_repeated_variables() {
    let (layer, mut program) = setup();
    let lit = literal(&mut program, "e", &[Term::Var(0), Term::Var(0)]);
    let mut out = TupleTable::new(2);
    layer.query(&lit, &mut out, None, None);
    assert_eq!(out.n_rows(), 1, "only e(c,c) is reflexive");
    assert_eq!(out.row(0), &[c(&layer, "c"), c(&layer, "c")]);
}

#[test]
fn query_filters_by_join_values() {
    let (layer, mut program) = setup();
    let lit = literal(&mut program, "e", &[Term::Var(0), Term::Var(1)]);
    let keys = vec![c(&layer, "b"), c(&layer, "c")];
    let mut out = TupleTable::new(2);
    layer.query(&lit, &mut out, Some(&[0][..]), Some(&keys[..]));
    let mut rows: Vec<Vec<u64>> = out.iter_rows().map(|r| r.to_vec()).collect();
    rows.sort();
    assert_eq!(
        rows,
        vec![
            vec![c(&layer, "b"), c(&layer, "c")],
            vec![c(&layer, "c"), c(&layer, "c")],
        ]
    );
}

#[test]
fn cardinality_counts_matching_rows() {
    let (layer, mut program) = setup();
    let a = c(&layer, "a");
    let bound = literal(&mut program, "e", &[Term::Const(a), Term::Var(0)]);
    assert_eq!(layer.cardinality(&bound), 2);
    assert_eq!(layer.estimate_cardinality(&bound), 2);
    let free = literal(&mut program, "e", &[Term::Var(0), Term::Var(1)]);
    assert_eq!(layer.cardinality(&free), 4);
}

#[test]
fn is_empty_with_filters() {
    let (layer, mut program) = setup();
    let lit = literal(&mut program, "e", &[Term::Var(0), Term::Var(1)]);
    assert!(!layer.is_empty(&lit, None, None));
    let missing = vec![c(&layer, "z")];
    assert!(layer.is_empty(&lit, Some(&[0][..]), Some(&missing[..])));
    let present = vec![c(&layer, "a")];
    assert!(!layer.is_empty(&lit, Some(&[0][..]), Some(&present[..])));
}

#[test]
fn check_in_and_check_new_in_partition_the_values() {
    let (layer, mut program) = setup();
    let lit = literal(&mut program, "e", &[Term::Var(0), Term::Var(1)]);
    let mut values = vec![c(&layer, "a"), c(&layer, "c"), c(&layer, "z")];
    values.sort_unstable();
    let present = layer.check_in(&values, &lit, 0);
    let absent = layer.check_new_in(&values, &lit, 0);
    let mut expected_present = vec![c(&layer, "a"), c(&layer, "c")];
    expected_present.sort_unstable();
    assert_eq!(present, expected_present);
    assert_eq!(absent, vec![c(&layer, "z")]);
    assert_eq!(present.len() + absent.len(), 3);
}

#[test]
fn unknown_predicates_answer_empty() {
    let layer = EdbLayer::new();
    let mut program = Program::new(&layer);
    let lit = literal(&mut program, "ghost", &[Term::Var(0)]);
    assert_eq!(layer.cardinality(&lit), 0);
    assert!(layer.is_empty(&lit, None, None));
    let mut out = TupleTable::new(1);
    layer.query(&lit, &mut out, None, None);
    assert!(out.is_empty());
    assert_eq!(layer.check_new_in(&[5], &lit, 0), vec![5]);
}

#[test]
fn sorted_iterator_orders_rows() {
    let (layer, mut program) = setup();
    let lit = literal(&mut program, "e", &[Term::Var(0), Term::Var(1)]);
    let mut itr = layer.sorted_iterator(&lit, &[1, 0]);
    let mut prev: Option<(u64, u64)> = None;
    while itr.advance() {
        let cur = (itr.element_at(1), itr.element_at(0));
        if let Some(p) = prev {
            assert!(p <= cur, "rows ordered by the requested fields");
        }
        prev = Some(cur);
    }
}
