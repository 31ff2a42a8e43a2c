use std::sync::Arc;

use hashbrown::HashMap;
use tracing::debug;

use crate::bindings::{BindingsTable, TupleTable};
use crate::edb::EdbLayer;
use crate::error::{Error, Result};
use crate::executor::RuleExecutor;
use crate::program::{Literal, PredId, Program, RuleId};
use crate::term::{bind_position, Adornment, Term};

/// A predicate under one call pattern.
pub type PredSig = (PredId, Adornment);

/// Estimates stop recursing past this depth and report zero cost.
pub const ESTIMATE_MAX_DEPTH: u32 = 2;

/// Whether a query run materializes answers or only costs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Evaluate,
    Estimate,
}

/// Continuation state for the explicit evaluation stack. Tasks carry only
/// what resuming needs: the signature or frame, and the body position.
enum Task {
    /// Run the next rule of a predicate, or close its fixpoint round.
    Query {
        sig: PredSig,
        offset: usize,
        repeat: bool,
        next_rule: usize,
        answers_snapshot: usize,
    },
    /// Advance one rule execution to body position `pos`.
    Rule { frame: u32, pos: usize },
    /// Re-join a rule's pending supplementary relation against a
    /// sub-predicate's answers, once those have been produced.
    RuleQuery { frame: u32, pos: usize },
}

/// One in-flight rule execution: the compiled plan plus its supplementary
/// relations.
struct Frame {
    exec: Arc<RuleExecutor>,
    suppl: Vec<BindingsTable>,
}

/// The QSQR top-down evaluator.
///
/// Per (predicate, adornment) it keeps an input table (bindings awaiting
/// resolution) and an answer table (full tuples resolved so far), both with
/// offset-cursor consumption. Evaluation runs on an explicit LIFO task
/// stack, so neither body length nor program depth consumes call stack.
/// Compiled rule plans are cached by (rule, head adornment) and reused
/// across queries on the same evaluator.
pub struct Qsqr<'a> {
    layer: &'a EdbLayer,
    program: &'a Program,
    inputs: HashMap<PredSig, BindingsTable>,
    answers: HashMap<PredSig, BindingsTable>,
    exec_cache: HashMap<(RuleId, Adornment), Arc<RuleExecutor>>,
    frames: HashMap<u32, Frame>,
    next_frame: u32,
    tasks: Vec<Task>,
}

impl<'a> Qsqr<'a> {
    pub fn new(layer: &'a EdbLayer, program: &'a Program) -> Self {
        Self {
            layer,
            program,
            inputs: HashMap::new(),
            answers: HashMap::new(),
            exec_cache: HashMap::new(),
            frames: HashMap::new(),
            next_frame: 0,
            tasks: Vec::new(),
        }
    }

    fn input_table(&mut self, sig: PredSig, arity: usize) -> &mut BindingsTable {
        self.inputs
            .entry(sig)
            .or_insert_with(|| BindingsTable::from_adornment(arity, sig.1))
    }

    fn answer_table(&mut self, sig: PredSig, arity: usize) -> &mut BindingsTable {
        self.answers
            .entry(sig)
            .or_insert_with(|| BindingsTable::with_width(arity))
    }

    /// Total answers across all predicates; growth of this number drives
    /// the fixpoint.
    pub fn total_answers(&self) -> usize {
        self.answers.values().map(|t| t.n_tuples()).sum()
    }

    /// Clear every input table (answers survive). Run between fixpoint
    /// rounds so pending inputs are re-derived against the grown answers.
    pub fn clean_all_inputs(&mut self) {
        for table in self.inputs.values_mut() {
            table.clear();
        }
    }

    /// Compiled executors for every rule defining `sig`, cached by
    /// (rule id, head adornment).
    fn executors_for(&mut self, sig: PredSig) -> Result<Vec<Arc<RuleExecutor>>> {
        let rule_ids: Vec<RuleId> = self.program.rules_for(sig.0).to_vec();
        let mut out = Vec::with_capacity(rule_ids.len());
        for rid in rule_ids {
            let key = (rid, sig.1);
            if let Some(exec) = self.exec_cache.get(&key) {
                out.push(Arc::clone(exec));
                continue;
            }
            let exec = Arc::new(RuleExecutor::new(self.program.rule(rid), sig.1)?);
            self.exec_cache.insert(key, Arc::clone(&exec));
            out.push(exec);
        }
        Ok(out)
    }

    fn alloc_frame(&mut self, frame: Frame) -> u32 {
        let id = self.next_frame;
        self.next_frame += 1;
        self.frames.insert(id, frame);
        id
    }

    /// Resolve all not-yet-processed input rows of `sig` through its rules.
    pub fn evaluate(&mut self, sig: PredSig, offset: usize, repeat: bool) -> Result<()> {
        let snapshot = self.total_answers();
        self.tasks.push(Task::Query {
            sig,
            offset,
            repeat,
            next_rule: 0,
            answers_snapshot: snapshot,
        });
        self.run_tasks()
    }

    fn run_tasks(&mut self) -> Result<()> {
        while let Some(task) = self.tasks.pop() {
            match task {
                Task::Query {
                    sig,
                    offset,
                    repeat,
                    next_rule,
                    answers_snapshot,
                } => self.process_query(sig, offset, repeat, next_rule, answers_snapshot)?,
                Task::Rule { frame, pos } => self.process_rule(frame, pos)?,
                Task::RuleQuery { frame, pos } => self.rule_query_join(frame, pos)?,
            }
        }
        Ok(())
    }

    fn process_query(
        &mut self,
        sig: PredSig,
        offset: usize,
        repeat: bool,
        next_rule: usize,
        answers_snapshot: usize,
    ) -> Result<()> {
        let execs = self.executors_for(sig)?;
        if next_rule < execs.len() {
            self.tasks.push(Task::Query {
                sig,
                offset,
                repeat,
                next_rule: next_rule + 1,
                answers_snapshot,
            });
            let exec = Arc::clone(&execs[next_rule]);
            let arity = self.program.arity_of(sig.0);
            let input = self.input_table(sig, arity);
            if input.n_tuples() > offset {
                let suppl = exec.seed(input, offset);
                if !suppl[0].is_empty() {
                    let frame = self.alloc_frame(Frame { exec, suppl });
                    self.tasks.push(Task::Rule { frame, pos: 0 });
                }
            }
        } else if repeat && self.total_answers() > answers_snapshot {
            let snapshot = self.total_answers();
            self.tasks.push(Task::Query {
                sig,
                offset,
                repeat,
                next_rule: 0,
                answers_snapshot: snapshot,
            });
        }
        Ok(())
    }

    fn process_rule(&mut self, frame: u32, pos: usize) -> Result<()> {
        let (exec, n_body) = {
            let f = &self.frames[&frame];
            (Arc::clone(&f.exec), f.exec.n_body())
        };
        if pos >= n_body {
            // all atoms satisfied: project into the answers
            let f = self.frames.remove(&frame).expect("live frame");
            let head = exec.adorned_rule().first_head();
            let sig = (head.predicate().id(), head.predicate().adornment());
            let last = &f.suppl[n_body];
            let n = last.n_tuples();
            if n > 10_000 {
                debug!(rows = n, "large final supplementary relation");
            }
            let answers = self.answer_table(sig, head.arity());
            exec.copy_last_suppl_into(last, answers);
            return Ok(());
        }
        if self.frames[&frame].suppl[pos].is_empty() {
            // no bindings survive: sound short-circuit
            self.frames.remove(&frame);
            return Ok(());
        }
        self.tasks.push(Task::Rule {
            frame,
            pos: pos + 1,
        });
        self.evaluate_atom(frame, pos)
    }

    fn evaluate_atom(&mut self, frame: u32, pos: usize) -> Result<()> {
        let exec = Arc::clone(&self.frames[&frame].exec);
        let literal = exec.body_literal(pos).clone();

        if literal.predicate().is_edb() {
            let mut retrieved = TupleTable::new(literal.n_vars());
            if !exec.joins_for(pos).is_empty() {
                let key_cols = exec.join_columns_in_suppl(pos);
                let keys = self.frames[&frame].suppl[pos].unique_sorted_projection(&key_cols);
                let full_pos = exec.join_positions_in_tuple(pos);
                self.layer
                    .query(&literal, &mut retrieved, Some(&full_pos[..]), Some(&keys[..]));
            } else {
                self.layer.query(&literal, &mut retrieved, None, None);
            }
            if retrieved.is_empty() && !literal.is_negated() {
                return Ok(());
            }
            let f = self.frames.get_mut(&frame).expect("live frame");
            return exec.advance(pos, &retrieved, &mut f.suppl);
        }

        if literal.is_negated() {
            return Err(Error::UnsupportedPattern(
                "negated IDB atom in top-down evaluation",
            ));
        }

        // IDB atom: enqueue its bindings as a sub-query, then suspend as a
        // continuation instead of recursing.
        let sub_pred = *literal.predicate();
        let sub_sig = (sub_pred.id(), sub_pred.adornment());
        let width = crate::term::count_bound(sub_pred.adornment());
        let pos_from_literal = exec.pos_from_literal[pos].clone();
        let pos_from_suppl = exec.pos_from_suppl[pos].clone();

        let mut rows: Vec<Vec<u64>> = Vec::new();
        if pos_from_suppl.is_empty() {
            let mut row = vec![0u64; width];
            for &(lit_pos, col) in &pos_from_literal {
                row[col] = literal.term_at(lit_pos).value();
            }
            rows.push(row);
        } else {
            let suppl = &self.frames[&frame].suppl[pos];
            for i in 0..suppl.n_tuples() {
                let srow = suppl.get_tuple(i);
                let mut row = vec![0u64; width];
                for &(lit_pos, col) in &pos_from_literal {
                    row[col] = literal.term_at(lit_pos).value();
                }
                for &(suppl_col, col) in &pos_from_suppl {
                    row[col] = srow[suppl_col];
                }
                rows.push(row);
            }
        }

        let input = self.input_table(sub_sig, sub_pred.arity());
        let offset_before = input.n_tuples();
        for row in &rows {
            input.add_raw(row);
        }
        if input.n_tuples() > offset_before {
            let snapshot = self.total_answers();
            self.tasks.push(Task::RuleQuery { frame, pos });
            self.tasks.push(Task::Query {
                sig: sub_sig,
                offset: offset_before,
                repeat: false,
                next_rule: 0,
                answers_snapshot: snapshot,
            });
            Ok(())
        } else {
            // nothing new to resolve: join against the answers known now
            self.rule_query_join(frame, pos)
        }
    }

    /// Join a predicate's current answers into the supplementary relation
    /// after body position `pos` of the suspended rule.
    fn rule_query_join(&mut self, frame: u32, pos: usize) -> Result<()> {
        let exec = Arc::clone(&self.frames[&frame].exec);
        let literal = exec.body_literal(pos).clone();
        let sig = (literal.predicate().id(), literal.predicate().adornment());
        let retrieved = match self.answers.get(&sig) {
            Some(answers) => answers.project_and_filter(&literal, None, None),
            None => TupleTable::new(literal.n_vars()),
        };
        if retrieved.is_empty() {
            return Ok(());
        }
        let f = self.frames.get_mut(&frame).expect("live frame");
        exec.advance(pos, &retrieved, &mut f.suppl)
    }

    /// Approximate cost of resolving the pending inputs of `sig`.
    /// Recursion past the depth cap reports zero.
    pub fn estimate(&mut self, depth: u32, sig: PredSig) -> Result<u64> {
        if depth > ESTIMATE_MAX_DEPTH {
            return Ok(0);
        }
        let execs = self.executors_for(sig)?;
        let mut total: u64 = 0;
        for exec in execs {
            total = total.saturating_add(self.estimate_rule(depth + 1, &exec, sig)?);
        }
        Ok(total)
    }

    /// Cost of one adorned rule: cardinalities chained along the body.
    /// A join absorbs the prior cost; a join-free atom multiplies it; zero
    /// anywhere makes the whole rule zero, and no later atom is costed.
    fn estimate_rule(&mut self, depth: u32, exec: &RuleExecutor, sig: PredSig) -> Result<u64> {
        let arity = self.program.arity_of(sig.0);
        let seed = {
            let input = self.input_table(sig, arity);
            exec.seed(input, 0)
        };
        if seed[0].is_empty() {
            return Ok(0);
        }
        let mut output: u64 = 1;
        for pos in 0..exec.n_body() {
            let literal = exec.body_literal(pos).clone();
            let njoins = exec.njoins[pos];
            let r: u64 = if literal.predicate().is_edb() {
                if njoins > 0 && pos == 0 {
                    self.estimate_edb_with_bindings(exec, &literal, &seed[0])
                } else {
                    self.layer.estimate_cardinality(&literal) as u64
                }
            } else {
                self.enqueue_estimate_input(exec, pos, &literal, &seed[0])?;
                let sub_sig = self.estimate_sub_sig(exec, pos, &literal);
                self.estimate(depth, sub_sig)?
            };
            if r == 0 {
                return Ok(0);
            }
            if njoins > 0 {
                output = r;
            } else {
                output = output.saturating_mul(r);
            }
        }
        Ok(output)
    }

    /// Per-binding cardinality over the distinct seed join keys, linearly
    /// extrapolated past the first ten.
    fn estimate_edb_with_bindings(
        &self,
        exec: &RuleExecutor,
        literal: &Literal,
        seed: &BindingsTable,
    ) -> u64 {
        let key_cols = exec.join_columns_in_suppl(0);
        let full_pos = exec.join_positions_in_tuple(0);
        let keys = seed.unique_sorted_projection(&key_cols);
        let step = key_cols.len();
        if step == 0 || keys.is_empty() {
            return self.layer.estimate_cardinality(literal) as u64;
        }
        let n_keys = keys.len() / step;
        let sampled = n_keys.min(10);
        let mut total: u64 = 0;
        for chunk in keys.chunks(step).take(sampled) {
            let mut tuple = literal.tuple().clone();
            for (j, &p) in full_pos.iter().enumerate() {
                tuple.set(p, Term::Const(chunk[j]));
            }
            let bound = Literal::new(*literal.predicate(), tuple);
            total = total.saturating_add(self.layer.estimate_cardinality(&bound) as u64);
        }
        if n_keys > sampled {
            total = total.saturating_mul(n_keys as u64) / sampled as u64;
        }
        total
    }

    /// Seed the sub-predicate's input for estimation. Carried-binding
    /// columns are only available at position 0 (from the seed relation);
    /// deeper positions fall back to the constants-only call pattern.
    fn enqueue_estimate_input(
        &mut self,
        exec: &RuleExecutor,
        pos: usize,
        literal: &Literal,
        seed: &BindingsTable,
    ) -> Result<()> {
        let pos_from_literal = exec.pos_from_literal[pos].clone();
        let pos_from_suppl = exec.pos_from_suppl[pos].clone();
        if pos_from_suppl.is_empty() || pos == 0 {
            let sub_sig = (
                literal.predicate().id(),
                literal.predicate().adornment(),
            );
            let width = crate::term::count_bound(sub_sig.1);
            let mut rows: Vec<Vec<u64>> = Vec::new();
            if pos_from_suppl.is_empty() {
                let mut row = vec![0u64; width];
                for &(lit_pos, col) in &pos_from_literal {
                    row[col] = literal.term_at(lit_pos).value();
                }
                rows.push(row);
            } else {
                for i in 0..seed.n_tuples() {
                    let srow = seed.get_tuple(i);
                    let mut row = vec![0u64; width];
                    for &(lit_pos, col) in &pos_from_literal {
                        row[col] = literal.term_at(lit_pos).value();
                    }
                    for &(suppl_col, col) in &pos_from_suppl {
                        row[col] = srow[suppl_col];
                    }
                    rows.push(row);
                }
            }
            let input = self.input_table(sub_sig, literal.arity());
            for row in &rows {
                input.add_raw(row);
            }
        } else {
            let sub_sig = self.estimate_sub_sig(exec, pos, literal);
            let reduced =
                Literal::new(literal.predicate().with_adornment(sub_sig.1), literal.tuple().clone());
            let input = self.input_table(sub_sig, literal.arity());
            input.add_tuple_literal(&reduced);
        }
        Ok(())
    }

    /// The call pattern used for estimating a sub-atom: the full adornment
    /// when carried bindings are available, otherwise only the positions a
    /// constant fills.
    fn estimate_sub_sig(&self, exec: &RuleExecutor, pos: usize, literal: &Literal) -> PredSig {
        let adornment = literal.predicate().adornment();
        if exec.pos_from_suppl[pos].is_empty() || pos == 0 {
            return (literal.predicate().id(), adornment);
        }
        let bound_positions: Vec<usize> = (0..literal.arity())
            .filter(|&i| adornment >> i & 1 != 0)
            .collect();
        let mut reduced = adornment;
        for &(_, col) in &exec.pos_from_suppl[pos] {
            reduced &= !(1 << bound_positions[col]);
        }
        (literal.predicate().id(), reduced)
    }

    /// Entry point: answer (or cost) one query literal, optionally seeded
    /// with candidate values at the given full-tuple positions.
    ///
    /// `return_only_vars` selects between variable-projection rows and full
    /// tuples including the literal's constants.
    pub fn evaluate_query(
        &mut self,
        mode: QueryMode,
        literal: &Literal,
        pos_joins: Option<&[usize]>,
        values: Option<&[u64]>,
        return_only_vars: bool,
    ) -> Result<TupleTable> {
        let pred = *literal.predicate();
        if pred.is_edb() {
            return match mode {
                QueryMode::Evaluate => {
                    let mut out = TupleTable::new(literal.n_vars());
                    self.layer.query(literal, &mut out, pos_joins, values);
                    Ok(out)
                }
                QueryMode::Estimate => {
                    let mut out = TupleTable::new(1);
                    out.add_row(&[self.layer.estimate_cardinality(literal) as u64]);
                    Ok(out)
                }
            };
        }

        self.clean_all_inputs();
        let mut adornment = pred.adornment();
        if let Some(pos) = pos_joins {
            for &p in pos {
                adornment = bind_position(adornment, p);
            }
        }
        let sig = (pred.id(), adornment);
        let arity = literal.arity();

        loop {
            // (re)seed the input table for this round
            {
                let mut template: Vec<u64> = vec![0; arity];
                for i in 0..arity {
                    if let Term::Const(c) = literal.term_at(i) {
                        template[i] = c;
                    }
                }
                let input = self.input_table(sig, arity);
                match (pos_joins, values) {
                    (Some(pos), Some(values)) if !pos.is_empty() => {
                        for chunk in values.chunks(pos.len()) {
                            for (j, &p) in pos.iter().enumerate() {
                                template[p] = chunk[j];
                            }
                            input.add_projected(&template);
                        }
                    }
                    _ => input.add_tuple_literal(literal),
                }
            }

            if mode == QueryMode::Estimate {
                let est = self.estimate(0, sig)?;
                let mut out = TupleTable::new(1);
                out.add_row(&[est]);
                return Ok(out);
            }

            let before = self.total_answers();
            self.evaluate(sig, 0, false)?;
            if self.total_answers() > before {
                self.clean_all_inputs();
            } else {
                break;
            }
        }

        let query_lit = Literal::new(pred.with_adornment(adornment), literal.tuple().clone());
        let out = match self.answers.get(&sig) {
            Some(answers) => {
                if return_only_vars {
                    answers.project_and_filter(&query_lit, pos_joins, values)
                } else {
                    answers.filter(&query_lit, pos_joins, values)
                }
            }
            None => TupleTable::new(if return_only_vars {
                literal.n_vars()
            } else {
                arity
            }),
        };
        Ok(out)
    }
}

#[cfg(test)]
#[path = "tests/qsqr.rs"]
mod tests;
