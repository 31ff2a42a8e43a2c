use crate::program::Literal;
use crate::segment::{merge_segments, Segment, SegmentInserter};
use crate::term::Term;

/// Staging-buffer row threshold that triggers an eager consolidation pass,
/// so memory never grows unbounded mid-iteration.
pub const CONSOLIDATE_THRESHOLD: usize = 1 << 20;

/// Sink for the head tuples one rule execution derives.
///
/// Two insertion paths: rows known to be unique go straight into one
/// inserter; possibly-duplicate rows are staged and, past the threshold,
/// sorted and deduplicated into a consolidated run. The collector is owned
/// by the thread executing the rule, so consolidation never holds a shared
/// lock; only committing the finished segment to the fact table does.
pub struct ResultCollector {
    row: Vec<u64>,
    unique: SegmentInserter,
    staging: SegmentInserter,
    runs: Vec<Segment>,
    threshold: usize,
}

impl ResultCollector {
    /// A collector for derivations of `head`; constant head positions are
    /// pre-filled once.
    pub fn new(head: &Literal) -> Self {
        let arity = head.arity();
        let mut row = vec![0u64; arity];
        for i in 0..arity {
            if let Term::Const(c) = head.term_at(i) {
                row[i] = c;
            }
        }
        Self {
            row,
            unique: SegmentInserter::new(arity),
            staging: SegmentInserter::new(arity),
            runs: Vec::new(),
            threshold: CONSOLIDATE_THRESHOLD,
        }
    }

    #[cfg(test)]
    pub fn with_threshold(head: &Literal, threshold: usize) -> Self {
        let mut out = Self::new(head);
        out.threshold = threshold;
        out
    }

    /// The reusable row template (head constants pre-filled).
    pub fn row_mut(&mut self) -> &mut [u64] {
        &mut self.row
    }

    /// Commit the current template row. `known_unique` marks rows a
    /// duplicate-free producer guarantees distinct.
    pub fn push_row(&mut self, known_unique: bool) {
        if known_unique {
            let row = std::mem::take(&mut self.row);
            self.unique.add_row(&row);
            self.row = row;
        } else {
            let row = std::mem::take(&mut self.row);
            self.staging.add_row(&row);
            self.row = row;
            if self.staging.n_rows() > self.threshold {
                self.consolidate();
            }
        }
    }

    pub fn n_staged(&self) -> usize {
        self.unique.n_rows() + self.staging.n_rows() + self.runs.iter().map(|r| r.n_rows()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.n_staged() == 0
    }

    /// Sort+dedup the staging buffer into a run. Runs only on data this
    /// collector owns. Small runs fold into the previous one so the run
    /// list stays short.
    fn consolidate(&mut self) {
        if self.staging.is_empty() {
            return;
        }
        let run = self.staging.take().sort_and_unique();
        match self.runs.pop() {
            Some(prev) if prev.n_rows() <= run.n_rows() => self.runs.push(prev.merge(&run)),
            Some(prev) => {
                self.runs.push(prev);
                self.runs.push(run);
            }
            None => self.runs.push(run),
        }
    }

    /// Consolidate everything into one sorted, distinct segment.
    pub fn finish(mut self) -> Option<Segment> {
        self.consolidate();
        let mut segments = std::mem::take(&mut self.runs);
        if !self.unique.is_empty() {
            segments.push(self.unique.take().sort_and_unique());
        }
        merge_segments(segments)
    }
}

#[cfg(test)]
#[path = "tests/collector.rs"]
mod tests;
