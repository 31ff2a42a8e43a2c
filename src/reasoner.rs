use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::bindings::{TupleIterator, TupleTable, TupleTableItr};
use crate::edb::EdbLayer;
use crate::error::{Error, Result};
use crate::facts::FactBlock;
use crate::program::{Literal, PredId, Program};
use crate::qsqr::{Qsqr, QueryMode};
use crate::segment::SegmentInserter;
use crate::seminaive::SemiNaiver;
use crate::term::{calculate_adornment, Term};
use crate::wizard;

/// How a query gets resolved: top-down QSQR below the cost threshold,
/// magic-sets rewriting plus scoped bottom-up materialization above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningMode {
    TopDown,
    Magic,
}

/// Default cost threshold separating the two strategies.
pub const DEFAULT_THRESHOLD: u64 = 1_000_000;

/// The strategy-selecting façade over the evaluation engines.
pub struct Reasoner {
    threshold: u64,
}

impl Default for Reasoner {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl Reasoner {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    /// Strict boundary: strictly below the threshold resolves top-down.
    pub fn mode_for_cost(&self, cost: u64) -> ReasoningMode {
        if cost < self.threshold {
            ReasoningMode::TopDown
        } else {
            ReasoningMode::Magic
        }
    }

    /// Estimated cost of resolving `literal`, optionally restricted to the
    /// candidate bindings. This is the QSQR estimate-mode scalar.
    pub fn estimate(
        &self,
        literal: &Literal,
        pos_bindings: Option<&[usize]>,
        value_bindings: Option<&[u64]>,
        layer: &EdbLayer,
        program: &Program,
    ) -> Result<u64> {
        let mut qsqr = Qsqr::new(layer, program);
        let table = qsqr.evaluate_query(
            QueryMode::Estimate,
            literal,
            pos_bindings,
            value_bindings,
            true,
        )?;
        Ok(table.row(0)[0])
    }

    /// Pick the strategy for a (possibly partially bound) query.
    ///
    /// With at most ten candidate bindings the cost at one binding stands
    /// in directly; beyond that, the cost is the two-point line through
    /// (1 binding, cost1) and (10 bindings, cost10) evaluated at N.
    pub fn choose_most_efficient_algo(
        &self,
        literal: &Literal,
        pos_bindings: Option<&[usize]>,
        value_bindings: Option<&[u64]>,
        layer: &EdbLayer,
        program: &Program,
    ) -> Result<ReasoningMode> {
        let cost = match (pos_bindings, value_bindings) {
            (Some(pos), Some(values)) if !pos.is_empty() => {
                let mut tuple = literal.tuple().clone();
                for (j, &p) in pos.iter().enumerate() {
                    tuple.set(p, Term::Const(values[j]));
                }
                let bound = Literal::new(
                    literal
                        .predicate()
                        .with_adornment(calculate_adornment(&tuple)),
                    tuple,
                );
                let single_cost = self.estimate(&bound, None, None, layer, program)?;
                let n_values = (values.len() / pos.len()) as u64;
                debug!(single_cost, n_values, "estimated cost at one binding");
                if n_values > 10 {
                    let limited = &values[..10 * pos.len()];
                    let ten_cost =
                        self.estimate(literal, Some(pos), Some(limited), layer, program)?;
                    debug!(ten_cost, "estimated cost at ten bindings");
                    let slope = (ten_cost as f64 - single_cost as f64) / 10.0;
                    (slope * n_values as f64 + single_cost as f64) as u64
                } else {
                    single_cost
                }
            }
            _ => self.estimate(literal, None, None, layer, program)?,
        };
        let mode = self.mode_for_cost(cost);
        debug!(cost, threshold = self.threshold, ?mode, "strategy chosen");
        Ok(mode)
    }

    /// Resolve via QSQR and iterate the answers.
    pub fn get_topdown_iterator(
        &self,
        literal: &Literal,
        pos_joins: Option<&[usize]>,
        values: Option<&[u64]>,
        layer: &EdbLayer,
        program: &Program,
        return_only_vars: bool,
    ) -> Result<Box<dyn TupleIterator>> {
        debug!(query = %literal, "top-down iterator");
        let mut qsqr = Qsqr::new(layer, program);
        let table = qsqr.evaluate_query(
            QueryMode::Evaluate,
            literal,
            pos_joins,
            values,
            return_only_vars,
        )?;
        Ok(Box::new(TupleTableItr::new(table)))
    }

    /// Rewrite with magic sets and materialize bottom-up, seeded only with
    /// the caller's bound values, then adapt the output table to the
    /// caller's row shape.
    pub fn get_magic_iterator(
        &self,
        literal: &Literal,
        pos_joins: Option<&[usize]>,
        values: Option<&[u64]>,
        layer: &EdbLayer,
        program: &Program,
        return_only_vars: bool,
    ) -> Result<Box<dyn TupleIterator>> {
        debug!(query = %literal, "magic iterator");
        // the first candidate binding fixes the call pattern
        let mut bound_tuple = literal.tuple().clone();
        if let (Some(pos), Some(values)) = (pos_joins, values) {
            for (j, &p) in pos.iter().enumerate() {
                bound_tuple.set(p, Term::Const(values[j]));
            }
        }
        let query = Literal::new(
            literal
                .predicate()
                .with_adornment(calculate_adornment(&bound_tuple)),
            bound_tuple,
        );

        let adorned = wizard::adorned_program(&query, program)?;
        let (magic_program, input_pred, output_pred) = wizard::magic_rewrite(&query, &adorned)?;

        let mut naiver = SemiNaiver::new(layer, &magic_program)?;
        let arity = magic_program.arity_of(input_pred);
        let mut inserter = SegmentInserter::new(arity);
        for row in wizard::magic_seed_rows(&query, pos_joins, values) {
            inserter.add_row(&row);
        }
        let block = FactBlock {
            iteration: 1,
            segment: Arc::new(inserter.sort_and_unique()),
            rule: None,
            rule_exec_order: 0,
            completed: true,
        };
        let seed_pred = magic_program.get_predicate(input_pred);
        naiver.add_data_to_idb_relation(&seed_pred, block);
        naiver.run(1, 2, 1, None)?;

        let full = naiver.full_rows_of(output_pred);
        let out = shape_rows(&full, literal, pos_joins, values, return_only_vars);
        Ok(Box::new(TupleTableItr::new(out)))
    }

    /// The hybrid strategy: explicit storage first, then the predicate's
    /// cheap single-IDB-dependency rules, then the cost-based fallback for
    /// whatever bindings are still unresolved. Every stage either resolves
    /// a binding or hands it to the next stage; none is skipped.
    pub fn get_incr_reasoning_iterator(
        &self,
        literal: &Literal,
        pos_joins: Option<&[usize]>,
        values: Option<&[u64]>,
        layer: &EdbLayer,
        program: &Program,
        return_only_vars: bool,
    ) -> Result<Box<dyn TupleIterator>> {
        let (pos, vals) = match (pos_joins, values) {
            (Some(p), Some(v)) if !p.is_empty() => (p, v),
            _ => {
                // nothing to resolve incrementally; fall through to the
                // cost-based choice
                return match self.choose_most_efficient_algo(
                    literal, None, None, layer, program,
                )? {
                    ReasoningMode::TopDown => self.get_topdown_iterator(
                        literal,
                        None,
                        None,
                        layer,
                        program,
                        return_only_vars,
                    ),
                    ReasoningMode::Magic => self.get_magic_iterator(
                        literal,
                        None,
                        None,
                        layer,
                        program,
                        return_only_vars,
                    ),
                };
            }
        };
        let width = pos.len();
        let var_positions = literal.pos_vars();
        let cols: Vec<usize> = pos
            .iter()
            .map(|p| {
                var_positions
                    .iter()
                    .position(|vp| vp == p)
                    .ok_or(Error::UnsupportedPattern(
                        "candidate binding on a constant position",
                    ))
            })
            .collect::<Result<_>>()?;

        // bindings kept sorted; clean_bindings walks them in lockstep with
        // sorted result tables
        let mut bindings = sort_binding_tuples(vals, width);

        let mut output = TupleTable::new(literal.n_vars());
        if let Some(explicit) = find_explicit_relation(program, literal.predicate().id()) {
            let expl_pred = program
                .get_predicate(explicit)
                .with_adornment(literal.predicate().adornment());
            let expl_literal = Literal::new(expl_pred, literal.tuple().clone());
            layer.query(&expl_literal, &mut output, Some(pos), Some(&bindings[..]));
        }
        let mut output = output.sort_by_all();
        debug!(found = output.n_rows(), "explicit lookup");

        if output.n_rows() < bindings.len() / width {
            if !output.is_empty() {
                clean_bindings(&mut bindings, width, &output, &cols);
            }

            if bindings.len() / width <= 1000 {
                let base_ids: Vec<u32> = program
                    .rules_for(literal.predicate().id())
                    .iter()
                    .copied()
                    .filter(|&rid| program.rule(rid).n_idb_body() == 0)
                    .collect();
                let single_idb: Vec<u32> = program
                    .rules_for(literal.predicate().id())
                    .iter()
                    .copied()
                    .filter(|&rid| program.rule(rid).n_idb_body() == 1)
                    .collect();
                for rid in single_idb {
                    if bindings.is_empty() {
                        break;
                    }
                    debug!(rule = %program.rule(rid), "running single-dependency rule");
                    let mut sub = program.clone();
                    let mut ids = base_ids.clone();
                    ids.push(rid);
                    sub.set_rules_for(literal.predicate().id(), ids);
                    let mut qsqr = Qsqr::new(layer, &sub);
                    let tmp = qsqr.evaluate_query(
                        QueryMode::Evaluate,
                        literal,
                        Some(pos),
                        Some(&bindings[..]),
                        true,
                    )?;
                    let tmp = tmp.sort_by_all();
                    if !tmp.is_empty() {
                        clean_bindings(&mut bindings, width, &tmp, &cols);
                        output = output.merge(&tmp);
                    }
                }
            }

            if !bindings.is_empty() {
                let mode = self.choose_most_efficient_algo(
                    literal,
                    Some(pos),
                    Some(&bindings[..]),
                    layer,
                    program,
                )?;
                let mut itr = match mode {
                    ReasoningMode::TopDown => self.get_topdown_iterator(
                        literal,
                        Some(pos),
                        Some(&bindings[..]),
                        layer,
                        program,
                        true,
                    )?,
                    ReasoningMode::Magic => self.get_magic_iterator(
                        literal,
                        Some(pos),
                        Some(&bindings[..]),
                        layer,
                        program,
                        true,
                    )?,
                };
                let mut tmp = TupleTable::new(literal.n_vars());
                let w = itr.row_width();
                while itr.advance() {
                    for p in 0..w {
                        tmp.add_value(itr.element_at(p));
                    }
                }
                output = output.merge(&tmp.sort_by_all());
            }
        }

        let out = if return_only_vars {
            output
        } else {
            reinsert_constants(&output, literal)
        };
        Ok(Box::new(TupleTableItr::new(out)))
    }

    /// Bottom-up fixpoint over the whole program: derive until an entire
    /// pass adds nothing. `nthreads` rules may evaluate concurrently; the
    /// optional budget caps wall-clock time, leaving a valid partial store.
    pub fn full_materialization<'a>(
        &self,
        layer: &'a EdbLayer,
        program: &'a Program,
        nthreads: usize,
        budget: Option<Duration>,
    ) -> Result<SemiNaiver<'a>> {
        info!("starting full materialization");
        let mut naiver = SemiNaiver::new(layer, program)?;
        naiver.run(0, 1, nthreads, budget)?;
        Ok(naiver)
    }
}

/// Remove from the sorted candidate set every binding already satisfied by
/// a (sorted) result table; `cols` are the result-row columns carrying the
/// binding values. A true sorted difference: applying it twice with the
/// same input changes nothing.
pub fn clean_bindings(bindings: &mut Vec<u64>, width: usize, input: &TupleTable, cols: &[usize]) {
    if width == 0 || bindings.is_empty() {
        return;
    }
    debug_assert_eq!(cols.len(), width);
    // order the results on the binding columns so both streams walk in
    // lockstep
    let sorted = input.sort_by(cols);
    let key = |row: &[u64]| -> Vec<u64> { cols.iter().map(|&c| row[c]).collect() };
    let mut out = Vec::with_capacity(bindings.len());
    let n = bindings.len() / width;
    let mut j = 0usize;
    for i in 0..n {
        let b = &bindings[i * width..(i + 1) * width];
        while j < sorted.n_rows() && key(sorted.row(j)).as_slice() < b {
            j += 1;
        }
        let satisfied = j < sorted.n_rows() && key(sorted.row(j)).as_slice() == b;
        if !satisfied {
            out.extend_from_slice(b);
        }
    }
    *bindings = out;
}

fn sort_binding_tuples(values: &[u64], width: usize) -> Vec<u64> {
    let mut tuples: Vec<&[u64]> = values.chunks(width).collect();
    tuples.sort();
    tuples.into_iter().flatten().copied().collect()
}

/// The stored relation a predicate mirrors directly: a single positive EDB
/// body atom listing the same variables in the same order as the head.
fn find_explicit_relation(program: &Program, pred: PredId) -> Option<PredId> {
    for &rid in program.rules_for(pred) {
        let rule = program.rule(rid);
        if rule.body().len() != 1 {
            continue;
        }
        let body = &rule.body()[0];
        let head = rule.first_head();
        if body.predicate().is_edb()
            && !body.is_negated()
            && head.arity() == body.arity()
            && head.n_vars() == head.arity()
            && body.n_vars() == body.arity()
            && head.same_var_sequence_as(body)
        {
            return Some(body.predicate().id());
        }
    }
    None
}

/// Filter full-width rows against the caller's literal and bindings, and
/// project to the requested row shape (variables only, or the full tuple
/// with the adorned-away constants back in place).
fn shape_rows(
    full: &TupleTable,
    literal: &Literal,
    pos_joins: Option<&[usize]>,
    values: Option<&[u64]>,
    return_only_vars: bool,
) -> TupleTable {
    let vars = literal.pos_vars();
    let consts: Vec<(usize, u64)> = (0..literal.arity())
        .filter(|&i| !literal.term_at(i).is_variable())
        .map(|i| (i, literal.term_at(i).value()))
        .collect();
    let repeated = literal.repeated_vars();
    let mut out = TupleTable::new(if return_only_vars {
        vars.len()
    } else {
        literal.arity()
    });
    for row in full.iter_rows() {
        if consts.iter().any(|&(p, v)| row[p] != v) {
            continue;
        }
        if repeated.iter().any(|&(a, b)| row[a] != row[b]) {
            continue;
        }
        if let (Some(pos), Some(values)) = (pos_joins, values) {
            if !pos.is_empty() {
                let step = pos.len();
                let ok = values
                    .chunks(step)
                    .any(|chunk| pos.iter().zip(chunk).all(|(&p, &v)| row[p] == v));
                if !ok {
                    continue;
                }
            }
        }
        if return_only_vars {
            let projected: Vec<u64> = vars.iter().map(|&p| row[p]).collect();
            out.add_row(&projected);
        } else {
            out.add_row(row);
        }
    }
    out
}

/// Expand variable-projection rows back to full tuples, re-inserting the
/// literal's constants.
fn reinsert_constants(rows: &TupleTable, literal: &Literal) -> TupleTable {
    let vars = literal.pos_vars();
    let mut template: Vec<u64> = (0..literal.arity())
        .map(|i| match literal.term_at(i) {
            Term::Const(c) => c,
            Term::Var(_) => 0,
        })
        .collect();
    let mut out = TupleTable::new(literal.arity());
    for row in rows.iter_rows() {
        for (j, &p) in vars.iter().enumerate() {
            template[p] = row[j];
        }
        out.add_row(&template);
    }
    out
}

#[cfg(test)]
#[path = "tests/reasoner.rs"]
mod tests;
