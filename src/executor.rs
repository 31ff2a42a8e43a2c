use crate::adorn::create_adornment;
use crate::bindings::{BindingsTable, TupleTable};
use crate::collector::ResultCollector;
use crate::error::{Error, Result};
use crate::program::{Literal, Rule};
use crate::term::{Term, Var};

/// A rule compiled for one head call pattern.
///
/// Compilation fixes, once per (rule, head adornment):
/// - the width and column layout of every supplementary relation
///   (position 0 = before the first body atom, position N = after the last);
/// - the merge-join key columns between each body atom and the
///   supplementary relation in front of it;
/// - which literal/supplementary columns must be carried forward because a
///   later atom or the head still needs them;
/// - the projection from the final supplementary relation onto the head.
///
/// Evaluation then threads bindings through this plan, atom by atom.
#[derive(Debug)]
pub struct RuleExecutor {
    adorned_rule: Rule,
    /// Width of the supplementary relation after each body position.
    pub(crate) size_suppl: Vec<usize>,
    /// Input-row columns seeding the first supplementary relation.
    pos_head_to_first_suppl: Vec<usize>,
    /// Per atom: columns of (literal vars ++ previous suppl) to carry on.
    pos_to_copy_from_previous: Vec<Vec<usize>>,
    /// Bound head positions that must be equal (repeated head variable).
    repeated_head_vars: Vec<(usize, usize)>,
    /// Per atom: (literal tuple position, sub-query input column) constants.
    pub(crate) pos_from_literal: Vec<Vec<(usize, usize)>>,
    /// Per atom: (suppl column, sub-query input column) carried bindings.
    pub(crate) pos_from_suppl: Vec<Vec<(usize, usize)>>,
    /// Per atom: number of join key pairs.
    pub(crate) njoins: Vec<usize>,
    start_joins: Vec<usize>,
    /// (literal variable index, suppl column) join key pairs, per atom runs.
    joins: Vec<(usize, usize)>,
    /// Final suppl column for each head variable position, in head order.
    projection_last_suppl: Vec<usize>,
}

impl RuleExecutor {
    pub fn new(rule: &Rule, head_adornment: u8) -> Result<Self> {
        if rule.first_head().arity() > 8 {
            return Err(Error::ArityTooLargeForAdornment {
                arity: rule.first_head().arity(),
            });
        }
        let adorned_rule = create_adornment(rule, head_adornment)?;
        let mut executor = Self {
            adorned_rule,
            size_suppl: Vec::new(),
            pos_head_to_first_suppl: Vec::new(),
            pos_to_copy_from_previous: Vec::new(),
            repeated_head_vars: Vec::new(),
            pos_from_literal: Vec::new(),
            pos_from_suppl: Vec::new(),
            njoins: Vec::new(),
            start_joins: Vec::new(),
            joins: Vec::new(),
            projection_last_suppl: Vec::new(),
        };
        executor.compile()?;
        Ok(executor)
    }

    pub fn adorned_rule(&self) -> &Rule {
        &self.adorned_rule
    }

    pub fn n_body(&self) -> usize {
        self.adorned_rule.body().len()
    }

    pub fn body_literal(&self, pos: usize) -> &Literal {
        &self.adorned_rule.body()[pos]
    }

    pub fn joins_for(&self, pos: usize) -> &[(usize, usize)] {
        let start = self.start_joins[pos];
        &self.joins[start..start + self.njoins[pos]]
    }

    fn compile(&mut self) -> Result<()> {
        let head = self.adorned_rule.first_head().clone();
        let head_adornment = head.predicate().adornment();

        // Seed layout: one column per distinct bound head variable, indexed
        // among the input row's bound positions.
        let mut bound_vars: Vec<Var> = Vec::new();
        let mut n_bound_in_adornment = 0usize;
        for i in 0..head.arity() {
            if head_adornment >> i & 1 != 0 {
                let t = head.term_at(i);
                if t.is_variable() {
                    match bound_vars.iter().position(|&v| v == t.var_id()) {
                        Some(prev) => {
                            self.repeated_head_vars
                                .push((self.pos_head_to_first_suppl[prev], n_bound_in_adornment));
                        }
                        None => {
                            bound_vars.push(t.var_id());
                            self.pos_head_to_first_suppl.push(n_bound_in_adornment);
                        }
                    }
                }
                n_bound_in_adornment += 1;
            }
        }
        self.size_suppl.push(bound_vars.len());

        let body = self.adorned_rule.body().to_vec();
        for (j, literal) in body.iter().enumerate() {
            let lit_adornment = literal.predicate().adornment();
            let mut current_signature: Vec<Var> = Vec::new();
            let mut pos_to_suppl: Vec<usize> = Vec::new();
            let mut bound_from_literal: Vec<(usize, usize)> = Vec::new();
            let mut bound_from_suppl: Vec<(usize, usize)> = Vec::new();

            let mut njoins_here = 0usize;
            self.start_joins.push(self.joins.len());
            let mut n_adornments = 0usize;
            let mut nvars = 0usize;
            for i in 0..literal.arity() {
                let t = literal.term_at(i);
                if t.is_variable() {
                    if !literal.is_negated()
                        && self.adorned_rule.var_appears_from(j + 1, t.var_id())
                    {
                        pos_to_suppl.push(nvars);
                        current_signature.push(t.var_id());
                    }
                    for (k, &bv) in bound_vars.iter().enumerate() {
                        if bv == t.var_id() {
                            self.joins.push((nvars, k));
                            njoins_here += 1;
                            bound_from_suppl.push((k, n_adornments));
                        }
                    }
                    nvars += 1;
                }
                if lit_adornment >> i & 1 != 0 {
                    if !t.is_variable() {
                        bound_from_literal.push((i, n_adornments));
                    }
                    n_adornments += 1;
                }
            }
            if literal.is_negated() {
                let all_joined = literal
                    .all_vars()
                    .iter()
                    .all(|v| bound_vars.contains(v));
                if !all_joined {
                    return Err(Error::UnsupportedPattern(
                        "negated atom with unbound variables",
                    ));
                }
            }
            self.njoins.push(njoins_here);
            self.pos_from_literal.push(bound_from_literal);
            self.pos_from_suppl.push(bound_from_suppl);

            // Carry forward the previous bindings still needed downstream.
            let mut pos = nvars;
            for &bv in &bound_vars {
                if !current_signature.contains(&bv)
                    && self.adorned_rule.var_appears_from(j + 1, bv)
                {
                    pos_to_suppl.push(pos);
                    current_signature.push(bv);
                }
                pos += 1;
            }

            self.size_suppl.push(pos_to_suppl.len());
            self.pos_to_copy_from_previous.push(pos_to_suppl);
            bound_vars = current_signature;
        }

        // Projection of the final supplementary relation onto head variables.
        for i in 0..head.arity() {
            let t = head.term_at(i);
            if t.is_variable() {
                match bound_vars.iter().position(|&v| v == t.var_id()) {
                    Some(k) => self.projection_last_suppl.push(k),
                    None => {
                        return Err(Error::UnsupportedPattern(
                            "existential variable in rule head",
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    /// Fresh supplementary relations for one execution.
    pub fn create_suppl_relations(&self) -> Vec<BindingsTable> {
        let mut out = Vec::with_capacity(self.n_body() + 1);
        out.push(BindingsTable::with_layout(
            self.pos_head_to_first_suppl.clone(),
        ));
        for layout in &self.pos_to_copy_from_previous {
            out.push(BindingsTable::with_layout(layout.clone()));
        }
        out
    }

    /// Whether an input row can instantiate the adorned head: constants at
    /// bound positions must match and repeated bound head variables must be
    /// equal.
    pub fn is_unifiable(&self, row: &[u64], pos_in_adornment: &[usize]) -> bool {
        let head = self.adorned_rule.first_head();
        for (i, &pos) in pos_in_adornment.iter().enumerate() {
            let t = head.term_at(pos);
            if !t.is_variable() && t.value() != row[i] {
                return false;
            }
        }
        self.repeated_head_vars
            .iter()
            .all(|&(a, b)| row[a] == row[b])
    }

    /// Build the supplementary relations and seed position 0 with every
    /// input row (from `offset` on) that unifies with the head.
    pub fn seed(&self, input: &BindingsTable, offset: usize) -> Vec<BindingsTable> {
        let mut suppl = self.create_suppl_relations();
        let pos_in_adornment = input.pos_to_copy().to_vec();
        for i in offset..input.n_tuples() {
            let row = input.get_tuple(i);
            if self.is_unifiable(row, &pos_in_adornment) {
                suppl[0].add_projected(row);
            }
        }
        suppl
    }

    /// Seed for bottom-up evaluation: the unconstrained empty binding.
    pub fn seed_unbound(&self) -> Vec<BindingsTable> {
        let mut suppl = self.create_suppl_relations();
        suppl[0].add_raw(&[]);
        suppl
    }

    /// Merge-join: both inputs sorted on their join key columns; advance the
    /// smaller side, and on equal keys emit the full cartesian product of
    /// the two equal-key runs. Handles duplicate keys on either side and
    /// keeps non-key columns untouched.
    pub fn join(
        sorted_literal: &TupleTable,
        sorted_suppl: &TupleTable,
        joins: &[(usize, usize)],
        output: &mut BindingsTable,
    ) {
        let mut idx1 = 0usize;
        let mut idx2 = 0usize;
        while idx1 < sorted_literal.n_rows() && idx2 < sorted_suppl.n_rows() {
            match cmp_join(sorted_literal.row(idx1), sorted_suppl.row(idx2), joins) {
                std::cmp::Ordering::Equal => {
                    // maximal equal-key runs on both sides
                    let mut end1 = idx1 + 1;
                    while end1 < sorted_literal.n_rows()
                        && cmp_join(sorted_literal.row(end1), sorted_suppl.row(idx2), joins)
                            == std::cmp::Ordering::Equal
                    {
                        end1 += 1;
                    }
                    let mut end2 = idx2 + 1;
                    while end2 < sorted_suppl.n_rows()
                        && cmp_join(sorted_literal.row(idx1), sorted_suppl.row(end2), joins)
                            == std::cmp::Ordering::Equal
                    {
                        end2 += 1;
                    }
                    for i in idx1..end1 {
                        for m in idx2..end2 {
                            output.add_pair(sorted_literal.row(i), sorted_suppl.row(m));
                        }
                    }
                    idx1 = end1;
                    idx2 = end2;
                }
                std::cmp::Ordering::Less => idx1 += 1,
                std::cmp::Ordering::Greater => idx2 += 1,
            }
        }
    }

    /// Anti-join for negated atoms: emit the supplementary rows whose join
    /// keys have no match among the retrieved rows. The literal contributes
    /// no columns, so its side of the output pair is a zero row.
    pub fn antijoin(
        sorted_literal: &TupleTable,
        sorted_suppl: &TupleTable,
        joins: &[(usize, usize)],
        output: &mut BindingsTable,
    ) {
        let zeros = vec![0u64; sorted_literal.width()];
        let mut idx1 = 0usize;
        for idx2 in 0..sorted_suppl.n_rows() {
            while idx1 < sorted_literal.n_rows()
                && cmp_join(sorted_literal.row(idx1), sorted_suppl.row(idx2), joins)
                    == std::cmp::Ordering::Less
            {
                idx1 += 1;
            }
            let matched = idx1 < sorted_literal.n_rows()
                && cmp_join(sorted_literal.row(idx1), sorted_suppl.row(idx2), joins)
                    == std::cmp::Ordering::Equal;
            if !matched {
                output.add_pair(&zeros, sorted_suppl.row(idx2));
            }
        }
    }

    /// Push the retrieved bindings for body position `pos` through the plan
    /// into the next supplementary relation.
    pub fn advance(
        &self,
        pos: usize,
        retrieved: &TupleTable,
        suppl: &mut [BindingsTable],
    ) -> Result<()> {
        let literal = self.body_literal(pos).clone();
        let joins = self.joins_for(pos).to_vec();
        let (before, after) = suppl.split_at_mut(pos + 1);
        let current = &before[pos];
        let next = &mut after[0];

        if literal.is_negated() {
            let key_lit: Vec<usize> = joins.iter().map(|&(a, _)| a).collect();
            let key_sup: Vec<usize> = joins.iter().map(|&(_, b)| b).collect();
            let sorted_lit = retrieved.sort_by(&key_lit);
            let sorted_sup = current.sort_by(&key_sup);
            Self::antijoin(&sorted_lit, &sorted_sup, &joins, next);
            return Ok(());
        }
        if !joins.is_empty() {
            let key_lit: Vec<usize> = joins.iter().map(|&(a, _)| a).collect();
            let key_sup: Vec<usize> = joins.iter().map(|&(_, b)| b).collect();
            let sorted_lit = retrieved.sort_by(&key_lit);
            let sorted_sup = current.sort_by(&key_sup);
            Self::join(&sorted_lit, &sorted_sup, &joins, next);
            return Ok(());
        }
        if current.width() == 0 {
            for row in retrieved.iter_rows() {
                next.add_projected(row);
            }
            Ok(())
        } else {
            Err(Error::UnsupportedPattern(
                "cartesian product between body atoms",
            ))
        }
    }

    /// Project the final supplementary relation into full head tuples.
    pub fn copy_last_suppl_into(&self, last: &BindingsTable, answers: &mut BindingsTable) {
        if last.n_tuples() == 0 {
            return;
        }
        let head = self.adorned_rule.first_head();
        let mut tuple = vec![0u64; head.arity()];
        let mut pos_vars = Vec::new();
        for i in 0..head.arity() {
            match head.term_at(i) {
                Term::Var(_) => pos_vars.push(i),
                Term::Const(c) => tuple[i] = c,
            }
        }
        for i in 0..last.n_tuples() {
            let row = last.get_tuple(i);
            for (j, &p) in pos_vars.iter().enumerate() {
                tuple[p] = row[self.projection_last_suppl[j]];
            }
            answers.add_raw(&tuple);
        }
    }

    /// Project the final supplementary relation into a derivation collector.
    pub fn project_into_collector(
        &self,
        last: &BindingsTable,
        collector: &mut ResultCollector,
        known_unique: bool,
    ) {
        let head = self.adorned_rule.first_head();
        let pos_vars: Vec<usize> = (0..head.arity())
            .filter(|&i| head.term_at(i).is_variable())
            .collect();
        for i in 0..last.n_tuples() {
            let row = last.get_tuple(i);
            {
                let template = collector.row_mut();
                for (j, &p) in pos_vars.iter().enumerate() {
                    template[p] = row[self.projection_last_suppl[j]];
                }
            }
            collector.push_row(known_unique);
        }
    }

    /// Map join key literal-variable indices to full-tuple positions, the
    /// coordinates the storage layer filters on.
    pub fn join_positions_in_tuple(&self, pos: usize) -> Vec<usize> {
        let lit_vars = self.body_literal(pos).pos_vars();
        self.joins_for(pos)
            .iter()
            .map(|&(lit_idx, _)| lit_vars[lit_idx])
            .collect()
    }

    /// Suppl-side join key columns for body position `pos`.
    pub fn join_columns_in_suppl(&self, pos: usize) -> Vec<usize> {
        self.joins_for(pos).iter().map(|&(_, b)| b).collect()
    }
}

fn cmp_join(row1: &[u64], row2: &[u64], joins: &[(usize, usize)]) -> std::cmp::Ordering {
    for &(a, b) in joins {
        match row1[a].cmp(&row2[b]) {
            std::cmp::Ordering::Equal => continue,
            ord => return ord,
        }
    }
    std::cmp::Ordering::Equal
}

#[cfg(test)]
#[path = "tests/executor.rs"]
mod tests;
