use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{debug, info};

use crate::bindings::TupleTable;
use crate::collector::ResultCollector;
use crate::edb::EdbLayer;
use crate::error::Result;
use crate::executor::RuleExecutor;
use crate::facts::{FactBlock, FactTable};
use crate::program::{PredId, Predicate, Program, Rule};
use crate::segment::Segment;

/// One rule prepared for bottom-up execution: the plan compiled for the
/// all-free head pattern, plus semi-naive bookkeeping.
struct RuleDetails {
    rule: Rule,
    exec: Arc<RuleExecutor>,
    /// IDB atoms in the compiled body order; one delta version each.
    n_idb: usize,
    /// Iteration of the previous execution; the delta starts here.
    last_execution: usize,
    ran: bool,
}

/// Bottom-up semi-naive materialization.
///
/// Each rule execution gets its own iteration number; derived blocks are
/// tagged with it and committed only after sort+dedup and an anti-join
/// against all earlier blocks, so the store holds every fact exactly once.
/// Within one rule execution, one IDB body atom at a time is restricted to
/// the delta (blocks since the rule last ran), atoms before it to the
/// pre-delta range, and atoms after it to everything derived so far.
pub struct SemiNaiver<'a> {
    layer: &'a EdbLayer,
    program: &'a Program,
    tables: HashMap<PredId, FactTable>,
    rules: Vec<RuleDetails>,
    iteration: usize,
    timed_out: bool,
}

impl<'a> SemiNaiver<'a> {
    pub fn new(layer: &'a EdbLayer, program: &'a Program) -> Result<Self> {
        let mut rules = Vec::with_capacity(program.n_rules());
        for rule in program.all_rules() {
            let exec = Arc::new(RuleExecutor::new(rule, 0)?);
            let n_idb = exec
                .adorned_rule()
                .body()
                .iter()
                .filter(|l| !l.predicate().is_edb())
                .count();
            rules.push(RuleDetails {
                rule: rule.clone(),
                exec,
                n_idb,
                last_execution: 0,
                ran: false,
            });
        }
        Ok(Self {
            layer,
            program,
            tables: HashMap::new(),
            rules,
            iteration: 0,
            timed_out: false,
        })
    }

    /// Pre-seed an IDB relation (the magic strategy feeds the query's bound
    /// values in through here before running).
    pub fn add_data_to_idb_relation(&mut self, pred: &Predicate, block: FactBlock) {
        self.tables
            .entry(pred.id())
            .or_insert_with(|| FactTable::new(pred.arity()))
            .add_block(block);
    }

    pub fn table(&self, pred: PredId) -> Option<&FactTable> {
        self.tables.get(&pred)
    }

    /// Full-width rows materialized for a predicate so far.
    pub fn full_rows_of(&self, pred: PredId) -> TupleTable {
        match self.tables.get(&pred) {
            Some(t) => t.full_rows(0, usize::MAX),
            None => TupleTable::new(self.program.arity_of(pred)),
        }
    }

    pub fn count_all_idbs(&self) -> usize {
        self.tables.values().map(|t| t.n_rows_total()).sum()
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Whether the last run gave up on its time budget. Materialized facts
    /// are still internally consistent, just possibly incomplete.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Run to fixpoint: passes over the rule set until one full pass
    /// derives nothing new. `nthreads > 1` evaluates the rules of each
    /// pass concurrently against the pass-start snapshot and commits
    /// sequentially. Returns whether anything was derived.
    pub fn run(
        &mut self,
        last_execution: usize,
        start_iteration: usize,
        nthreads: usize,
        budget: Option<Duration>,
    ) -> Result<bool> {
        self.iteration = start_iteration;
        self.timed_out = false;
        for d in &mut self.rules {
            d.last_execution = last_execution;
            d.ran = false;
        }
        let started = Instant::now();
        let mut derived_any = false;
        loop {
            let new_in_pass = if nthreads > 1 {
                self.run_pass_parallel(nthreads, started, budget)?
            } else {
                self.run_pass_sequential(started, budget)?
            };
            derived_any |= new_in_pass;
            if !new_in_pass || self.timed_out {
                break;
            }
        }
        info!(
            iterations = self.iteration,
            facts = self.count_all_idbs(),
            timed_out = self.timed_out,
            "materialization finished"
        );
        Ok(derived_any)
    }

    fn over_budget(&self, started: Instant, budget: Option<Duration>) -> bool {
        budget.map(|b| started.elapsed() > b).unwrap_or(false)
    }

    fn run_pass_sequential(
        &mut self,
        started: Instant,
        budget: Option<Duration>,
    ) -> Result<bool> {
        let mut new_any = false;
        for idx in 0..self.rules.len() {
            if self.over_budget(started, budget) {
                self.timed_out = true;
                break;
            }
            if !self.runnable(idx) {
                continue;
            }
            let iteration = self.iteration;
            let derived = self.execute_rule(idx, iteration)?;
            if let Some(segment) = derived {
                new_any |= self.commit(idx, segment, iteration);
            }
            self.rules[idx].last_execution = iteration;
            self.rules[idx].ran = true;
            self.iteration += 1;
        }
        Ok(new_any)
    }

    /// One parallel pass: every runnable rule evaluates against the blocks
    /// committed before the pass, workers fed through a channel; commits
    /// stay sequential, so block ordering and the delta invariant hold
    /// exactly as in the sequential path.
    fn run_pass_parallel(
        &mut self,
        nthreads: usize,
        started: Instant,
        budget: Option<Duration>,
    ) -> Result<bool> {
        if self.over_budget(started, budget) {
            self.timed_out = true;
            return Ok(false);
        }
        let pass_start = self.iteration;
        let jobs: Vec<usize> = (0..self.rules.len()).filter(|&i| self.runnable(i)).collect();
        let mut results: Vec<(usize, Result<Option<Segment>>)> = Vec::with_capacity(jobs.len());
        {
            let this: &SemiNaiver<'a> = self;
            std::thread::scope(|scope| {
                let (job_tx, job_rx) = crossbeam_channel::unbounded::<usize>();
                let (res_tx, res_rx) =
                    crossbeam_channel::unbounded::<(usize, Result<Option<Segment>>)>();
                for _ in 0..nthreads.min(jobs.len().max(1)) {
                    let job_rx = job_rx.clone();
                    let res_tx = res_tx.clone();
                    scope.spawn(move || {
                        while let Ok(idx) = job_rx.recv() {
                            let out = this.execute_rule(idx, pass_start);
                            if res_tx.send((idx, out)).is_err() {
                                return;
                            }
                        }
                    });
                }
                drop(res_tx);
                for &idx in &jobs {
                    let _ = job_tx.send(idx);
                }
                drop(job_tx);
                while let Ok(item) = res_rx.recv() {
                    results.push(item);
                }
            });
        }
        results.sort_by_key(|(idx, _)| *idx);

        let mut new_any = false;
        for (idx, outcome) in results {
            let segment = outcome?;
            let iteration = self.iteration;
            if let Some(segment) = segment {
                new_any |= self.commit(idx, segment, iteration);
            }
            self.rules[idx].last_execution = pass_start;
            self.rules[idx].ran = true;
            self.iteration += 1;
        }
        Ok(new_any)
    }

    /// EDB-only rules derive the same facts every time; run them once.
    fn runnable(&self, idx: usize) -> bool {
        let d = &self.rules[idx];
        d.n_idb > 0 || !d.ran
    }

    /// Evaluate one rule against the store as of `current_iteration`,
    /// producing its (sorted, distinct) derivations, not yet anti-joined.
    fn execute_rule(&self, idx: usize, current_iteration: usize) -> Result<Option<Segment>> {
        let d = &self.rules[idx];
        let exec = &d.exec;
        let head = exec.adorned_rule().first_head().clone();
        let mut collector = ResultCollector::new(&head);
        let known_unique = self.known_unique(idx);

        let n_versions = d.n_idb.max(1);
        for version in 0..n_versions {
            let mut suppl = exec.seed_unbound();
            let mut idb_counter = 0usize;
            let mut completed = true;
            for pos in 0..exec.n_body() {
                if suppl[pos].is_empty() {
                    completed = false;
                    break;
                }
                let literal = exec.body_literal(pos).clone();
                let retrieved: TupleTable = if literal.predicate().is_edb() {
                    let mut out = TupleTable::new(literal.n_vars());
                    if !exec.joins_for(pos).is_empty() {
                        let key_cols = exec.join_columns_in_suppl(pos);
                        let keys = suppl[pos].unique_sorted_projection(&key_cols);
                        let full_pos = exec.join_positions_in_tuple(pos);
                        self.layer
                            .query(&literal, &mut out, Some(&full_pos[..]), Some(&keys[..]));
                    } else {
                        self.layer.query(&literal, &mut out, None, None);
                    }
                    out
                } else {
                    let (min, max) = if idb_counter < version {
                        (0, d.last_execution)
                    } else if idb_counter == version {
                        (d.last_execution, current_iteration)
                    } else {
                        (0, current_iteration)
                    };
                    idb_counter += 1;
                    match self.tables.get(&literal.predicate().id()) {
                        Some(table) => (*table.matching_rows(&literal, min, max)).clone(),
                        None => TupleTable::new(literal.n_vars()),
                    }
                };
                if retrieved.is_empty() && !literal.is_negated() {
                    completed = false;
                    break;
                }
                exec.advance(pos, &retrieved, &mut suppl)?;
            }
            if completed && !suppl[exec.n_body()].is_empty() {
                exec.project_into_collector(&suppl[exec.n_body()], &mut collector, known_unique);
            }
        }
        Ok(collector.finish())
    }

    /// A single positive EDB atom whose distinct variables all reach the
    /// head exactly once cannot produce duplicate head tuples.
    fn known_unique(&self, idx: usize) -> bool {
        let d = &self.rules[idx];
        let body = d.exec.adorned_rule().body();
        if body.len() != 1 || !body[0].predicate().is_edb() || body[0].is_negated() {
            return false;
        }
        let head = d.exec.adorned_rule().first_head();
        let head_vars = head.all_vars();
        head.n_vars() == head_vars.len()
            && !body[0].has_repeated_vars()
            && head_vars.len() == body[0].all_vars().len()
            && head_vars.iter().all(|v| body[0].contains_var(*v))
    }

    /// Anti-join against everything already stored, then publish as a new
    /// block. This is the only step that mutates shared tables.
    fn commit(&mut self, idx: usize, segment: Segment, iteration: usize) -> bool {
        let head = self.rules[idx].exec.adorned_rule().first_head().clone();
        let pred_id = head.predicate().id();
        let arity = head.arity();
        let table = self
            .tables
            .entry(pred_id)
            .or_insert_with(|| FactTable::new(arity));
        let retained = table.retain_from(segment, false, iteration);
        if retained.is_empty() {
            return false;
        }
        debug!(
            rule = idx,
            iteration,
            rows = retained.n_rows(),
            "committing derivation block"
        );
        table.add(
            Arc::new(retained),
            Some(self.rules[idx].rule.id()),
            idx,
            iteration,
            true,
        );
        true
    }
}

#[cfg(test)]
#[path = "tests/seminaive.rs"]
mod tests;
