use smallvec::SmallVec;

type Row = SmallVec<[u64; 4]>;

/// An immutable, columnar, arity-wide set of rows: one owned vector per
/// column, all the same length. Segments produced by this module are sorted
/// lexicographically and duplicate-free; readers borrow views, never raw
/// pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    arity: usize,
    columns: Vec<Vec<u64>>,
    zero_arity_rows: usize,
}

impl Segment {
    pub fn empty(arity: usize) -> Self {
        Self {
            arity,
            columns: vec![Vec::new(); arity],
            zero_arity_rows: 0,
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn n_rows(&self) -> usize {
        if self.arity == 0 {
            self.zero_arity_rows
        } else {
            self.columns[0].len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    pub fn get(&self, column: usize, row: usize) -> u64 {
        self.columns[column][row]
    }

    pub fn row(&self, idx: usize) -> Row {
        self.columns.iter().map(|c| c[idx]).collect()
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = Row> + '_ {
        (0..self.n_rows()).map(move |i| self.row(i))
    }

    fn cmp_row_at(&self, idx: usize, other: &Segment, other_idx: usize) -> std::cmp::Ordering {
        for c in 0..self.arity {
            match self.columns[c][idx].cmp(&other.columns[c][other_idx]) {
                std::cmp::Ordering::Equal => continue,
                ord => return ord,
            }
        }
        std::cmp::Ordering::Equal
    }

    /// Sorted union of two sorted distinct segments.
    pub fn merge(&self, other: &Segment) -> Segment {
        debug_assert_eq!(self.arity, other.arity);
        if self.arity == 0 {
            let mut out = Segment::empty(0);
            out.zero_arity_rows = (self.zero_arity_rows + other.zero_arity_rows).min(1);
            return out;
        }
        let mut inserter = SegmentInserter::new(self.arity);
        let (mut i, mut j) = (0, 0);
        while i < self.n_rows() || j < other.n_rows() {
            let ord = if i >= self.n_rows() {
                std::cmp::Ordering::Greater
            } else if j >= other.n_rows() {
                std::cmp::Ordering::Less
            } else {
                self.cmp_row_at(i, other, j)
            };
            match ord {
                std::cmp::Ordering::Less => {
                    inserter.add_row(&self.row(i));
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    inserter.add_row(&other.row(j));
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    inserter.add_row(&self.row(i));
                    i += 1;
                    j += 1;
                }
            }
        }
        inserter.into_sorted_segment()
    }

    /// The rows of `self` that do not occur in `other` — the anti-join used
    /// before a block of derivations becomes visible. With `dedup`, repeated
    /// rows of `self` are also collapsed during the walk. Both inputs must
    /// be sorted.
    pub fn retain(&self, other: Option<&Segment>, dedup: bool) -> Segment {
        if self.arity == 0 {
            let mut out = Segment::empty(0);
            let blocked = other.map(|o| o.zero_arity_rows > 0).unwrap_or(false);
            out.zero_arity_rows = if blocked { 0 } else { self.zero_arity_rows.min(1) };
            return out;
        }
        let mut inserter = SegmentInserter::new(self.arity);
        let mut j = 0usize;
        let mut last: Option<Row> = None;
        for i in 0..self.n_rows() {
            let row = self.row(i);
            if dedup && last.as_ref() == Some(&row) {
                continue;
            }
            if let Some(o) = other {
                while j < o.n_rows() && o.cmp_row_at(j, self, i) == std::cmp::Ordering::Less {
                    j += 1;
                }
                if j < o.n_rows() && o.cmp_row_at(j, self, i) == std::cmp::Ordering::Equal {
                    last = Some(row);
                    continue;
                }
            }
            inserter.add_row(&row);
            last = Some(row);
        }
        inserter.into_sorted_segment()
    }
}

/// Row-major staging area that consolidates into a sorted, distinct
/// `Segment`. The sort runs on data only this inserter owns, so callers can
/// consolidate without holding any shared lock.
#[derive(Debug)]
pub struct SegmentInserter {
    arity: usize,
    rows: Vec<u64>,
    zero_arity_rows: usize,
}

impl SegmentInserter {
    pub fn new(arity: usize) -> Self {
        Self {
            arity,
            rows: Vec::new(),
            zero_arity_rows: 0,
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn n_rows(&self) -> usize {
        if self.arity == 0 {
            self.zero_arity_rows
        } else {
            self.rows.len() / self.arity
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    pub fn add_row(&mut self, row: &[u64]) {
        if self.arity == 0 {
            self.zero_arity_rows += 1;
        } else {
            debug_assert_eq!(row.len(), self.arity);
            self.rows.extend_from_slice(row);
        }
    }

    /// Swap out the accumulated rows, leaving an empty inserter behind.
    pub fn take(&mut self) -> SegmentInserter {
        std::mem::replace(self, SegmentInserter::new(self.arity))
    }

    fn row(&self, i: usize) -> &[u64] {
        &self.rows[i * self.arity..(i + 1) * self.arity]
    }

    /// Sort, deduplicate, and freeze into a columnar segment.
    pub fn sort_and_unique(self) -> Segment {
        if self.arity == 0 {
            let mut out = Segment::empty(0);
            out.zero_arity_rows = self.zero_arity_rows.min(1);
            return out;
        }
        let n = self.n_rows();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| self.row(a).cmp(self.row(b)));
        let mut columns = vec![Vec::with_capacity(n); self.arity];
        let mut last: Option<&[u64]> = None;
        for &i in &order {
            let row = self.row(i);
            if last == Some(row) {
                continue;
            }
            for (c, col) in columns.iter_mut().enumerate() {
                col.push(row[c]);
            }
            last = Some(row);
        }
        Segment {
            arity: self.arity,
            columns,
            zero_arity_rows: 0,
        }
    }

    /// Rows assumed already sorted and distinct; freeze without re-sorting.
    fn into_sorted_segment(self) -> Segment {
        if self.arity == 0 {
            let mut out = Segment::empty(0);
            out.zero_arity_rows = self.zero_arity_rows.min(1);
            return out;
        }
        let n = self.n_rows();
        let mut columns = vec![Vec::with_capacity(n); self.arity];
        for i in 0..n {
            let row = self.row(i);
            for (c, col) in columns.iter_mut().enumerate() {
                col.push(row[c]);
            }
        }
        Segment {
            arity: self.arity,
            columns,
            zero_arity_rows: 0,
        }
    }
}

/// Pairwise-merge a list of sorted distinct segments into one.
pub fn merge_segments(mut segments: Vec<Segment>) -> Option<Segment> {
    segments.retain(|s| !s.is_empty());
    let mut current = segments.pop()?;
    while let Some(next) = segments.pop() {
        current = current.merge(&next);
    }
    Some(current)
}

#[cfg(test)]
#[path = "tests/segment.rs"]
mod tests;
