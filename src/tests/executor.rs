use super::*;
use crate::edb::EdbLayer;
use crate::program::Program;
use crate::qsqr::{Qsqr, QueryMode};
use crate::test_utils::literal;

// ========== MERGE JOIN vs NESTED LOOP ==========

fn table(width: usize, rows: &[&[u64]]) -> TupleTable {
    let mut t = TupleTable::new(width);
    for r in rows {
        t.add_row(r);
    }
    t
}

/// Reference equi-join: every pair whose key columns agree.
fn nested_loop_join(
    lit: &TupleTable,
    suppl: &TupleTable,
    joins: &[(usize, usize)],
) -> Vec<Vec<u64>> {
    let mut out = Vec::new();
    for a in lit.iter_rows() {
        for b in suppl.iter_rows() {
            if joins.iter().all(|&(x, y)| a[x] == b[y]) {
                let mut row = a.to_vec();
                row.extend_from_slice(b);
                out.push(row);
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

fn merge_join_rows(
    lit: &TupleTable,
    suppl: &TupleTable,
    joins: &[(usize, usize)],
) -> Vec<Vec<u64>> {
    let key_lit: Vec<usize> = joins.iter().map(|&(a, _)| a).collect();
    let key_sup: Vec<usize> = joins.iter().map(|&(_, b)| b).collect();
    let layout: Vec<usize> = (0..lit.width() + suppl.width()).collect();
    let mut out = BindingsTable::with_layout(layout);
    RuleExecutor::join(
        &lit.sort_by(&key_lit),
        &suppl.sort_by(&key_sup),
        joins,
        &mut out,
    );
    let mut rows: Vec<Vec<u64>> = (0..out.n_tuples()).map(|i| out.get_tuple(i).to_vec()).collect();
    rows.sort();
    rows
}

#[test]
fn merge_join_matches_nested_loop_on_single_key() {
    let lit = table(2, &[&[1, 10], &[2, 20], &[2, 21], &[3, 30]]);
    let suppl = table(2, &[&[5, 1], &[6, 2], &[7, 4]]);
    let joins = [(0usize, 1usize)];
    assert_eq!(
        merge_join_rows(&lit, &suppl, &joins),
        nested_loop_join(&lit, &suppl, &joins)
    );
}

#[test]
fn merge_join_handles_duplicate_keys_on_both_sides() {
    let lit = table(2, &[&[1, 10], &[1, 11], &[1, 12], &[2, 20]]);
    let suppl = table(1, &[&[1], &[1], &[2], &[2]]);
    let joins = [(0usize, 0usize)];
    let got = merge_join_rows(&lit, &suppl, &joins);
    let want = nested_loop_join(&lit, &suppl, &joins);
    assert_eq!(got, want, "full cartesian product of each equal-key run");
    // the run 1x{1,1} produces 3 distinct projected rows, 2x{2,2} one
    assert_eq!(got.len(), 4);
}

#[test]
fn merge_join_with_composite_key() {
    let lit = table(3, &[&[1, 2, 10], &[1, 3, 11], &[2, 2, 12]]);
    let suppl = table(2, &[&[2, 1], &[3, 1], &[2, 2], &[9, 9]]);
    // key: (lit[0], lit[1]) == (suppl[1], suppl[0])
    let joins = [(0usize, 1usize), (1usize, 0usize)];
    assert_eq!(
        merge_join_rows(&lit, &suppl, &joins),
        nested_loop_join(&lit, &suppl, &joins)
    );
}

#[test]
fn merge_join_with_exhausted_side_terminates() {
    let lit = table(1, &[]);
    let suppl = table(1, &[&[1], &[2]]);
    let joins = [(0usize, 0usize)];
    assert!(merge_join_rows(&lit, &suppl, &joins).is_empty());
    let lit = table(1, &[&[1]]);
    let suppl = table(1, &[]);
    assert!(merge_join_rows(&lit, &suppl, &joins).is_empty());
}

#[test]
fn antijoin_keeps_unmatched_suppl_rows() {
    let lit = table(2, &[&[1, 5], &[2, 6]]);
    let suppl = table(1, &[&[1], &[2], &[3], &[4]]);
    let joins = [(0usize, 0usize)];
    // carry only the suppl column (offset past the literal width)
    let mut out = BindingsTable::with_layout(vec![2]);
    RuleExecutor::antijoin(&lit.sort_by(&[0]), &suppl.sort_by(&[0]), &joins, &mut out);
    let mut rows: Vec<u64> = (0..out.n_tuples()).map(|i| out.get_tuple(i)[0]).collect();
    rows.sort_unstable();
    assert_eq!(rows, vec![3, 4]);
}

// ========== PLAN COMPILATION ==========

fn compiled(rules: &str, head_adornment: u8) -> (EdbLayer, Program, RuleExecutor) {
    let layer = EdbLayer::new();
    layer.add_facts_str("e", &[&["a", "b"], &["b", "c"], &["c", "d"]]);
    let mut program = Program::new(&layer);
    program.parse_rules(rules).unwrap();
    let exec = RuleExecutor::new(program.rule(0), head_adornment).unwrap();
    (layer, program, exec)
}

#[test]
fn suppl_widths_follow_downstream_use() {
    let (_, _, exec) = compiled("t(X,Z) :- e(X,Y), e(Y,Z)", 0);
    // seed carries nothing; after atom 0 both X and Y are needed; after
    // atom 1 only Z plus the carried X
    assert_eq!(exec.size_suppl, vec![0, 2, 2]);
}

#[test]
fn bound_head_var_seeds_the_first_relation() {
    let (_, _, exec) = compiled("t(X,Z) :- e(X,Y), e(Y,Z)", 0b01);
    assert_eq!(exec.size_suppl[0], 1);
    assert_eq!(exec.joins_for(0), &[(0, 0)]);
}

#[test]
fn join_positions_map_to_tuple_coordinates() {
    let (_, _, exec) = compiled("t(X,Z) :- e(X,Y), e(Y,Z)", 0);
    // atom 1 joins its first variable (Y, tuple position 0) with the
    // supplementary column carrying Y
    assert_eq!(exec.join_positions_in_tuple(1), vec![0]);
    assert_eq!(exec.joins_for(1).len(), 1);
}

#[test]
fn existential_head_variable_is_rejected() {
    let layer = EdbLayer::new();
    layer.add_facts_str("e", &[&["a", "b"]]);
    let mut program = Program::new(&layer);
    program.parse_rules("t(X,W) :- e(X,Y)").unwrap();
    let err = RuleExecutor::new(program.rule(0), 0).unwrap_err();
    assert!(matches!(err, Error::UnsupportedPattern(_)));
}

#[test]
fn wide_heads_cannot_be_adorned() {
    let layer = EdbLayer::new();
    layer.add_facts_str("w", &[&["a", "b", "c", "d", "e", "f", "g", "h", "i"]]);
    let mut program = Program::new(&layer);
    program
        .parse_rules("t(A,B,C,D,E,F,G,H,I) :- w(A,B,C,D,E,F,G,H,I)")
        .unwrap();
    let err = RuleExecutor::new(program.rule(0), 0).unwrap_err();
    assert!(matches!(err, Error::ArityTooLargeForAdornment { .. }));
}

// ========== SEEDING ==========

#[test]
fn seed_keeps_only_unifiable_rows() {
    let layer = EdbLayer::new();
    layer.add_facts_str("e", &[&["a", "b"]]);
    let mut program = Program::new(&layer);
    program.parse_rules("t(X,7) :- e(X,X)").unwrap();
    // head t(X, 7) adorned bb: rows must match the constant at position 1
    let exec = RuleExecutor::new(program.rule(0), 0b11).unwrap();
    let seven = layer.dictionary().get_or_add_const("7");
    let mut input = BindingsTable::from_adornment(2, 0b11);
    input.add_raw(&[100, seven]);
    input.add_raw(&[100, 999]);
    let suppl = exec.seed(&input, 0);
    assert_eq!(suppl[0].n_tuples(), 1);
    assert_eq!(suppl[0].get_tuple(0), &[100]);
}

#[test]
fn seed_checks_repeated_head_variables() {
    let layer = EdbLayer::new();
    layer.add_facts_str("e", &[&["a", "b"]]);
    let mut program = Program::new(&layer);
    program.parse_rules("t(X,X) :- e(X,X)").unwrap();
    let exec = RuleExecutor::new(program.rule(0), 0b11).unwrap();
    let mut input = BindingsTable::from_adornment(2, 0b11);
    input.add_raw(&[5, 5]);
    input.add_raw(&[5, 6]);
    let suppl = exec.seed(&input, 0);
    assert_eq!(
        suppl[0].n_tuples(),
        1,
        "rows with unequal repeated head vars do not unify"
    );
}

#[test]
fn seed_respects_the_offset_cursor() {
    let layer = EdbLayer::new();
    layer.add_facts_str("e", &[&["a", "b"]]);
    let mut program = Program::new(&layer);
    program.parse_rules("t(X,Y) :- e(X,Y)").unwrap();
    let exec = RuleExecutor::new(program.rule(0), 0b01).unwrap();
    let mut input = BindingsTable::from_adornment(2, 0b01);
    input.add_raw(&[1]);
    input.add_raw(&[2]);
    let suppl = exec.seed(&input, 1);
    assert_eq!(suppl[0].n_tuples(), 1);
    assert_eq!(suppl[0].get_tuple(0), &[2]);
}

// ========== ONE RULE APPLICATION ==========

/// Reference: apply t(X,Z) :- e(X,Y), e(Y,Z) by nested loops over e.
fn reference_compose(rows: &[(u64, u64)]) -> Vec<Vec<u64>> {
    let mut out = Vec::new();
    for &(x, y1) in rows {
        for &(y2, z) in rows {
            if y1 == y2 {
                out.push(vec![x, z]);
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

#[test]
fn one_rule_application_is_sound_and_complete() {
    let layer = EdbLayer::new();
    let pairs = [
        ("a", "b"),
        ("b", "c"),
        ("b", "d"),
        ("c", "d"),
        ("d", "a"),
        ("d", "b"),
    ];
    let dict = layer.dictionary();
    let id_pairs: Vec<(u64, u64)> = pairs
        .iter()
        .map(|p| (dict.get_or_add_const(p.0), dict.get_or_add_const(p.1)))
        .collect();
    layer.add_facts("e", 2, id_pairs.iter().map(|&(a, b)| vec![a, b]).collect());
    let mut program = Program::new(&layer);
    program.parse_rules("t(X,Z) :- e(X,Y), e(Y,Z)").unwrap();

    let query = literal(&mut program, "t", &[Term::Var(0), Term::Var(1)]);
    let mut qsqr = Qsqr::new(&layer, &program);
    let got = qsqr
        .evaluate_query(QueryMode::Evaluate, &query, None, None, true)
        .unwrap();
    let mut got: Vec<Vec<u64>> = got.iter_rows().map(|r| r.to_vec()).collect();
    got.sort();
    got.dedup();
    assert_eq!(got, reference_compose(&id_pairs));
}

#[test]
fn empty_supplementary_relation_short_circuits() {
    let layer = EdbLayer::new();
    layer.add_facts_str("e", &[&["a", "b"]]);
    let mut program = Program::new(&layer);
    program.parse_rules("t(X,Z) :- e(X,Y), e(Y,Z)").unwrap();
    let z = layer.dictionary().get_or_add_const("zz");
    let query = literal(&mut program, "t", &[Term::Const(z), Term::Var(0)]);
    let mut qsqr = Qsqr::new(&layer, &program);
    let got = qsqr
        .evaluate_query(QueryMode::Evaluate, &query, None, None, true)
        .unwrap();
    assert!(got.is_empty());
}

#[test]
fn cartesian_products_error_instead_of_wrong_results() {
    let layer = EdbLayer::new();
    layer.add_facts_str("e", &[&["a", "a"]]);
    let mut program = Program::new(&layer);
    program.parse_rules("t(X,Y) :- e(X,X), e(Y,Y)").unwrap();
    assert!(matches!(
        RuleExecutor::new(program.rule(0), 0),
        Err(Error::UnsupportedPattern(_))
    ));
}
