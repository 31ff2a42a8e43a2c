use std::sync::Arc;

use dashmap::DashMap;

use crate::bindings::TupleTable;
use crate::program::{Literal, RuleId};
use crate::segment::Segment;
use crate::term::Term;

/// One batch of facts derived in a single iteration by a single rule
/// application. Blocks are committed whole or not at all.
#[derive(Debug, Clone)]
pub struct FactBlock {
    pub iteration: usize,
    pub segment: Arc<Segment>,
    pub rule: Option<RuleId>,
    pub rule_exec_order: usize,
    pub completed: bool,
}

/// Per-predicate append-only list of fact blocks, totally ordered by
/// iteration. The union of all blocks never contains a tuple twice: new
/// derivations are anti-joined against every earlier block before they are
/// committed.
///
/// Filtered reads are cached by literal signature; the cache key pins the
/// iteration range actually covered, so entries stay valid as the table
/// grows.
pub struct FactTable {
    arity: usize,
    blocks: Vec<FactBlock>,
    cache: DashMap<(String, usize, usize), Arc<TupleTable>>,
}

impl FactTable {
    pub fn new(arity: usize) -> Self {
        Self {
            arity,
            blocks: Vec::new(),
            cache: DashMap::new(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn blocks(&self) -> &[FactBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|b| b.segment.is_empty())
    }

    /// True when no block at or after `iteration` holds facts.
    pub fn is_empty_from(&self, iteration: usize) -> bool {
        self.blocks
            .iter()
            .filter(|b| b.iteration >= iteration)
            .all(|b| b.segment.is_empty())
    }

    pub fn n_rows_total(&self) -> usize {
        self.blocks.iter().map(|b| b.segment.n_rows()).sum()
    }

    pub fn n_rows_at(&self, iteration: usize) -> usize {
        self.blocks
            .iter()
            .find(|b| b.iteration == iteration)
            .map(|b| b.segment.n_rows())
            .unwrap_or(0)
    }

    /// Blocks with `min <= iteration < max`.
    pub fn read(&self, min: usize, max: usize) -> &[FactBlock] {
        let start = self.blocks.partition_point(|b| b.iteration < min);
        let end = self.blocks.partition_point(|b| b.iteration < max);
        &self.blocks[start..end]
    }

    /// Append a segment for `iteration`. When the last block carries the
    /// same iteration and execution order the segment is merged into it
    /// instead of opening a new block. Returns true when a new block was
    /// created.
    pub fn add(
        &mut self,
        segment: Arc<Segment>,
        rule: Option<RuleId>,
        rule_exec_order: usize,
        iteration: usize,
        completed: bool,
    ) -> bool {
        debug_assert_eq!(segment.arity(), self.arity);
        if segment.is_empty() {
            return false;
        }
        if let Some(last) = self.blocks.last_mut() {
            debug_assert!(last.iteration <= iteration);
            if last.iteration == iteration && last.rule_exec_order == rule_exec_order {
                last.segment = Arc::new(last.segment.merge(&segment));
                // the merged block may be covered by cached ranges
                self.cache.clear();
                return false;
            }
        }
        self.blocks.push(FactBlock {
            iteration,
            segment,
            rule,
            rule_exec_order,
            completed,
        });
        true
    }

    /// Append a pre-built block; iterations must stay strictly increasing.
    pub fn add_block(&mut self, block: FactBlock) {
        debug_assert!(
            self.blocks
                .last()
                .map(|b| b.iteration < block.iteration)
                .unwrap_or(true)
        );
        self.blocks.push(block);
    }

    /// Anti-join `segment` against every block before `last_iteration`.
    /// With `dedup`, the segment's own duplicates are collapsed on the
    /// first pass. This is what keeps a fact in exactly one block.
    pub fn retain_from(&self, segment: Segment, dedup: bool, last_iteration: usize) -> Segment {
        let mut seg = segment;
        let mut dedup = dedup;
        for block in &self.blocks {
            if block.iteration >= last_iteration {
                break;
            }
            seg = seg.retain(Some(block.segment.as_ref()), dedup);
            dedup = false; // duplicates checked at most once
        }
        if dedup {
            seg = seg.retain(None, true);
        }
        seg
    }

    /// Count of stored rows matching the literal's constants in range.
    pub fn estimate_cardinality(&self, literal: &Literal, min: usize, max: usize) -> usize {
        let consts: Vec<(usize, u64)> = constant_positions(literal);
        self.read(min, max)
            .iter()
            .map(|b| {
                if consts.is_empty() {
                    b.segment.n_rows()
                } else {
                    b.segment
                        .iter_rows()
                        .filter(|row| consts.iter().all(|&(p, v)| row[p] == v))
                        .count()
                }
            })
            .sum()
    }

    /// Variable-position rows matching `literal` across the given range,
    /// cached per (signature, resolved range).
    pub fn matching_rows(&self, literal: &Literal, min: usize, max: usize) -> Arc<TupleTable> {
        let resolved_max = self
            .read(min, max)
            .last()
            .map(|b| b.iteration + 1)
            .unwrap_or(min);
        let key = (signature(literal), min, resolved_max);
        if let Some(hit) = self.cache.get(&key) {
            return Arc::clone(&hit);
        }
        let consts = constant_positions(literal);
        let repeated = literal.repeated_vars();
        let vars = literal.pos_vars();
        let mut out = TupleTable::new(vars.len());
        for block in self.read(min, max) {
            for row in block.segment.iter_rows() {
                if consts.iter().any(|&(p, v)| row[p] != v) {
                    continue;
                }
                if repeated.iter().any(|&(a, b)| row[a] != row[b]) {
                    continue;
                }
                let projected: Vec<u64> = vars.iter().map(|&p| row[p]).collect();
                out.add_row(&projected);
            }
        }
        let out = Arc::new(out);
        self.cache.insert(key, Arc::clone(&out));
        out
    }

    /// All full-width rows in range, for consumers that need the complete
    /// tuples (the magic strategy's output extraction).
    pub fn full_rows(&self, min: usize, max: usize) -> TupleTable {
        let mut out = TupleTable::new(self.arity);
        for block in self.read(min, max) {
            for row in block.segment.iter_rows() {
                out.add_row(&row);
            }
        }
        out
    }
}

fn constant_positions(literal: &Literal) -> Vec<(usize, u64)> {
    (0..literal.arity())
        .filter(|&i| !literal.term_at(i).is_variable())
        .map(|i| (i, literal.term_at(i).value()))
        .collect()
}

/// Literal signature: constants by value, variables by negative
/// first-occurrence index. Two literals with the same signature select the
/// same rows.
fn signature(literal: &Literal) -> String {
    let mut out = String::new();
    let mut seen: Vec<u8> = Vec::new();
    for t in literal.tuple().iter() {
        match t {
            Term::Const(c) => out.push_str(&format!(" {} ", c)),
            Term::Var(v) => {
                let idx = match seen.iter().position(|&s| s == v) {
                    Some(i) => i,
                    None => {
                        seen.push(v);
                        seen.len() - 1
                    }
                };
                out.push_str(&format!(" -{} ", idx + 1));
            }
        }
    }
    out
}

#[cfg(test)]
#[path = "tests/facts.rs"]
mod tests;
