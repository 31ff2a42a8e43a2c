use super::*;
use std::time::Duration;

use crate::test_utils::{ancestor_setup, c, literal};

fn rows_of(naiver: &SemiNaiver<'_>, pred: PredId) -> Vec<Vec<u64>> {
    let mut rows: Vec<Vec<u64>> = naiver
        .full_rows_of(pred)
        .iter_rows()
        .map(|r| r.to_vec())
        .collect();
    rows.sort();
    rows
}

fn ancestor_closure(layer: &EdbLayer) -> Vec<Vec<u64>> {
    let (a, b, cc, d) = (c(layer, "a"), c(layer, "b"), c(layer, "c"), c(layer, "d"));
    let mut rows = vec![
        vec![a, b],
        vec![b, cc],
        vec![cc, d],
        vec![a, cc],
        vec![b, d],
        vec![a, d],
    ];
    rows.sort();
    rows
}

#[test]
fn ancestor_materialization_is_the_exact_closure() {
    let (layer, mut program) = ancestor_setup();
    let anc = program.get_or_add_predicate("anc", 2).unwrap();
    let mut naiver = SemiNaiver::new(&layer, &program).unwrap();
    let derived = naiver.run(0, 1, 1, None).unwrap();
    assert!(derived);
    assert!(!naiver.timed_out());
    assert_eq!(rows_of(&naiver, anc), ancestor_closure(&layer));
}

#[test]
fn no_fact_is_stored_twice_across_blocks() {
    let (layer, mut program) = ancestor_setup();
    let anc = program.get_or_add_predicate("anc", 2).unwrap();
    let mut naiver = SemiNaiver::new(&layer, &program).unwrap();
    naiver.run(0, 1, 1, None).unwrap();
    let table = naiver.table(anc).unwrap();
    let mut all: Vec<Vec<u64>> = Vec::new();
    for block in table.blocks() {
        all.extend(block.segment.iter_rows().map(|r| r.to_vec()));
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, all.len(), "blocks hold each fact exactly once");
    assert_eq!(total, 6);
}

/// Naive reference fixpoint for the ancestor program.
fn naive_ancestor(layer: &EdbLayer) -> Vec<Vec<u64>> {
    let (a, b, cc, d) = (c(layer, "a"), c(layer, "b"), c(layer, "c"), c(layer, "d"));
    let par = [(a, b), (b, cc), (cc, d)];
    let mut anc: Vec<(u64, u64)> = par.to_vec();
    loop {
        let mut added = false;
        let snapshot = anc.clone();
        for &(x, y) in &par {
            for &(y2, z) in &snapshot {
                if y == y2 && !anc.contains(&(x, z)) {
                    anc.push((x, z));
                    added = true;
                }
            }
        }
        if !added {
            break;
        }
    }
    let mut rows: Vec<Vec<u64>> = anc.into_iter().map(|(x, y)| vec![x, y]).collect();
    rows.sort();
    rows
}

#[test]
fn semi_naive_equals_the_naive_fixpoint() {
    let (layer, mut program) = ancestor_setup();
    let anc = program.get_or_add_predicate("anc", 2).unwrap();
    let mut naiver = SemiNaiver::new(&layer, &program).unwrap();
    naiver.run(0, 1, 1, None).unwrap();
    assert_eq!(rows_of(&naiver, anc), naive_ancestor(&layer));
}

#[test]
fn result_is_independent_of_rule_order() {
    let layer = EdbLayer::new();
    layer.add_facts_str("par", &[&["a", "b"], &["b", "c"], &["c", "d"]]);
    let mut program = Program::new(&layer);
    // recursive rule first this time
    program
        .parse_rules("anc(X,Z) :- par(X,Y), anc(Y,Z)\nanc(X,Y) :- par(X,Y)")
        .unwrap();
    let anc = program.get_or_add_predicate("anc", 2).unwrap();
    let mut naiver = SemiNaiver::new(&layer, &program).unwrap();
    naiver.run(0, 1, 1, None).unwrap();
    assert_eq!(rows_of(&naiver, anc), ancestor_closure(&layer));
}

#[test]
fn threaded_run_matches_the_sequential_result() {
    let (layer, mut program) = ancestor_setup();
    let anc = program.get_or_add_predicate("anc", 2).unwrap();
    let mut naiver = SemiNaiver::new(&layer, &program).unwrap();
    naiver.run(0, 1, 4, None).unwrap();
    assert_eq!(rows_of(&naiver, anc), ancestor_closure(&layer));
}

#[test]
fn rerunning_after_saturation_derives_nothing() {
    let (layer, program) = ancestor_setup();
    let mut naiver = SemiNaiver::new(&layer, &program).unwrap();
    assert!(naiver.run(0, 1, 1, None).unwrap());
    let next_iteration = naiver.iteration();
    assert!(!naiver.run(next_iteration, next_iteration + 1, 1, None).unwrap());
}

#[test]
fn exhausted_budget_sets_the_timeout_flag() {
    let (layer, program) = ancestor_setup();
    let mut naiver = SemiNaiver::new(&layer, &program).unwrap();
    let derived = naiver.run(0, 1, 1, Some(Duration::ZERO)).unwrap();
    assert!(naiver.timed_out(), "budget exhaustion is flagged, not fatal");
    assert!(!derived);
    assert_eq!(naiver.count_all_idbs(), 0, "store stays consistent");
}

#[test]
fn negated_edb_atoms_anti_join() {
    let layer = EdbLayer::new();
    layer.add_facts_str("cand", &[&["a", "b"], &["a", "c"], &["b", "a"]]);
    layer.add_facts_str("e", &[&["a", "b"]]);
    let mut program = Program::new(&layer);
    program
        .parse_rules("nonedge(X,Y) :- cand(X,Y), ~e(X,Y)")
        .unwrap();
    let nonedge = program.get_or_add_predicate("nonedge", 2).unwrap();
    let mut naiver = SemiNaiver::new(&layer, &program).unwrap();
    naiver.run(0, 1, 1, None).unwrap();
    let (a, b, cc) = (c(&layer, "a"), c(&layer, "b"), c(&layer, "c"));
    assert_eq!(rows_of(&naiver, nonedge), vec![vec![a, cc], vec![b, a]]);
}

#[test]
fn preseeded_idb_relations_feed_the_rules() {
    let layer = EdbLayer::new();
    layer.add_facts_str("par", &[&["a", "b"], &["b", "c"]]);
    let mut program = Program::new(&layer);
    program.parse_rules("reach(Y) :- seed(X), par(X,Y)").unwrap();
    let seed_id = program.get_or_add_predicate("seed", 1).unwrap();
    let reach = program.get_or_add_predicate("reach", 1).unwrap();

    let mut naiver = SemiNaiver::new(&layer, &program).unwrap();
    let mut inserter = crate::segment::SegmentInserter::new(1);
    inserter.add_row(&[c(&layer, "a")]);
    let block = FactBlock {
        iteration: 1,
        segment: std::sync::Arc::new(inserter.sort_and_unique()),
        rule: None,
        rule_exec_order: 0,
        completed: true,
    };
    let seed_pred = program.get_predicate(seed_id);
    naiver.add_data_to_idb_relation(&seed_pred, block);
    naiver.run(1, 2, 1, None).unwrap();
    assert_eq!(rows_of(&naiver, reach), vec![vec![c(&layer, "b")]]);
}

#[test]
fn derivations_with_constant_heads() {
    let layer = EdbLayer::new();
    layer.add_facts_str("par", &[&["a", "b"]]);
    let mut program = Program::new(&layer);
    program.parse_rules("flag(yes) :- par(a,b)").unwrap();
    let flag = program.get_or_add_predicate("flag", 1).unwrap();
    let mut naiver = SemiNaiver::new(&layer, &program).unwrap();
    naiver.run(0, 1, 1, None).unwrap();
    assert_eq!(rows_of(&naiver, flag), vec![vec![c(&layer, "yes")]]);
}

#[test]
fn iteration_counter_advances_per_rule_execution() {
    let (layer, program) = ancestor_setup();
    let mut naiver = SemiNaiver::new(&layer, &program).unwrap();
    naiver.run(0, 1, 1, None).unwrap();
    assert!(naiver.iteration() > 2, "every execution takes an iteration");
}
