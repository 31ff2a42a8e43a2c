use hashbrown::HashSet;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::program::Literal;
use crate::term::Adornment;

type Row = SmallVec<[u64; 4]>;

/// A fixed-width, deduplicated relation of partial variable bindings.
///
/// Rows keep insertion order, which gives downstream consumers a stable
/// offset cursor ("process only rows added since N"). The column layout
/// `pos_to_copy` records which source positions feed each column; an empty
/// layout means the identity.
///
/// Width zero is legal: the empty binding is a single (deduplicated) row.
pub struct BindingsTable {
    width: usize,
    pos_to_copy: Vec<usize>,
    rows: Vec<u64>,
    unique: HashSet<Row, FxBuildHasher>,
    has_empty_row: bool,
}

impl BindingsTable {
    /// Layout over the bound positions of an adornment.
    pub fn from_adornment(arity: usize, adornment: Adornment) -> Self {
        let pos_to_copy: Vec<usize> = (0..arity).filter(|i| adornment >> i & 1 != 0).collect();
        let width = pos_to_copy.len();
        Self {
            width,
            pos_to_copy,
            rows: Vec::new(),
            unique: HashSet::with_hasher(FxBuildHasher::default()),
            has_empty_row: false,
        }
    }

    /// Identity layout of the given width.
    pub fn with_width(width: usize) -> Self {
        Self {
            width,
            pos_to_copy: Vec::new(),
            rows: Vec::new(),
            unique: HashSet::with_hasher(FxBuildHasher::default()),
            has_empty_row: false,
        }
    }

    /// Explicit column layout.
    pub fn with_layout(pos_to_copy: Vec<usize>) -> Self {
        Self {
            width: pos_to_copy.len(),
            pos_to_copy,
            rows: Vec::new(),
            unique: HashSet::with_hasher(FxBuildHasher::default()),
            has_empty_row: false,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Source positions feeding each column. Identity when empty.
    pub fn pos_to_copy(&self) -> &[usize] {
        &self.pos_to_copy
    }

    pub fn n_tuples(&self) -> usize {
        if self.width == 0 {
            self.has_empty_row as usize
        } else {
            self.rows.len() / self.width
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_tuples() == 0
    }

    pub fn get_tuple(&self, idx: usize) -> &[u64] {
        if self.width == 0 {
            &[]
        } else {
            &self.rows[idx * self.width..(idx + 1) * self.width]
        }
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.unique.clear();
        self.has_empty_row = false;
    }

    fn insert_if_new(&mut self, row: Row) {
        if self.width == 0 {
            self.has_empty_row = true;
            return;
        }
        debug_assert_eq!(row.len(), self.width);
        if self.unique.insert(row.clone()) {
            self.rows.extend_from_slice(&row);
        }
    }

    /// Copy the full row as-is (identity layout).
    pub fn add_raw(&mut self, row: &[u64]) {
        self.insert_if_new(row[..self.width].into());
    }

    /// Copy through the column layout from a full source row.
    pub fn add_projected(&mut self, source: &[u64]) {
        if self.pos_to_copy.is_empty() {
            self.add_raw(source);
            return;
        }
        let row: Row = self.pos_to_copy.iter().map(|&p| source[p]).collect();
        self.insert_if_new(row);
    }

    /// Copy through the column layout from the concatenation of two rows
    /// (the shape a merge join produces).
    pub fn add_pair(&mut self, first: &[u64], second: &[u64]) {
        let row: Row = self
            .pos_to_copy
            .iter()
            .map(|&p| {
                if p < first.len() {
                    first[p]
                } else {
                    second[p - first.len()]
                }
            })
            .collect();
        self.insert_if_new(row);
    }

    /// Copy the constant at each layout position of a fully-bound literal.
    pub fn add_tuple_literal(&mut self, literal: &Literal) {
        let row: Row = self
            .pos_to_copy
            .iter()
            .map(|&p| literal.term_at(p).value())
            .collect();
        self.insert_if_new(row);
    }

    /// Rows copied out and sorted on the given fields (stable elsewhere).
    pub fn sort_by(&self, fields: &[usize]) -> TupleTable {
        let mut out = TupleTable::new(self.width);
        if self.width == 0 {
            out.zero_width_rows = self.has_empty_row as usize;
            return out;
        }
        let n = self.n_tuples();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            let ra = self.get_tuple(a);
            let rb = self.get_tuple(b);
            for &f in fields {
                match ra[f].cmp(&rb[f]) {
                    std::cmp::Ordering::Equal => continue,
                    other => return other,
                }
            }
            std::cmp::Ordering::Equal
        });
        for i in order {
            out.add_row(self.get_tuple(i));
        }
        out
    }

    /// Concatenated values at `pos` for every row, in insertion order.
    pub fn projection(&self, pos: &[usize]) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.n_tuples() * pos.len());
        for i in 0..self.n_tuples() {
            let row = self.get_tuple(i);
            for &p in pos {
                out.push(row[p]);
            }
        }
        out
    }

    /// Distinct projected tuples, sorted lexicographically, flattened.
    pub fn unique_sorted_projection(&self, pos: &[usize]) -> Vec<u64> {
        let mut tuples: Vec<Row> = (0..self.n_tuples())
            .map(|i| {
                let row = self.get_tuple(i);
                pos.iter().map(|&p| row[p]).collect()
            })
            .collect();
        tuples.sort();
        tuples.dedup();
        tuples.into_iter().flatten().collect()
    }

    /// Project the variable positions of `literal` out of every row that
    /// matches its constants, its repeated-variable equalities, and (when
    /// given) one of the allowed filter value combinations.
    pub fn project_and_filter(
        &self,
        literal: &Literal,
        pos_filter: Option<&[usize]>,
        values_filter: Option<&[u64]>,
    ) -> TupleTable {
        let vars = literal.pos_vars();
        let mut out = TupleTable::new(vars.len());
        self.scan_filtered(literal, pos_filter, values_filter, |row| {
            let projected: Row = vars.iter().map(|&p| row[p]).collect();
            out.add_row(&projected);
        });
        out
    }

    /// Like `project_and_filter` but keeps the full row.
    pub fn filter(
        &self,
        literal: &Literal,
        pos_filter: Option<&[usize]>,
        values_filter: Option<&[u64]>,
    ) -> TupleTable {
        let mut out = TupleTable::new(self.width);
        self.scan_filtered(literal, pos_filter, values_filter, |row| {
            out.add_row(row);
        });
        out
    }

    fn scan_filtered(
        &self,
        literal: &Literal,
        pos_filter: Option<&[usize]>,
        values_filter: Option<&[u64]>,
        mut emit: impl FnMut(&[u64]),
    ) {
        let consts: Vec<(usize, u64)> = (0..literal.arity())
            .filter(|&i| !literal.term_at(i).is_variable())
            .map(|i| (i, literal.term_at(i).value()))
            .collect();
        let repeated = literal.repeated_vars();
        for i in 0..self.n_tuples() {
            let row = self.get_tuple(i);
            if consts.iter().any(|&(p, v)| row[p] != v) {
                continue;
            }
            if repeated.iter().any(|&(a, b)| row[a] != row[b]) {
                continue;
            }
            if let (Some(pos), Some(values)) = (pos_filter, values_filter) {
                if !pos.is_empty() {
                    let step = pos.len();
                    let mut ok = false;
                    for chunk in values.chunks(step) {
                        if pos.iter().zip(chunk).all(|(&p, &v)| row[p] == v) {
                            ok = true;
                            break;
                        }
                    }
                    if !ok {
                        continue;
                    }
                }
            }
            emit(row);
        }
    }
}

/// A plain row table: fixed width, duplicates allowed, optionally sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleTable {
    width: usize,
    rows: Vec<u64>,
    zero_width_rows: usize,
}

impl TupleTable {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            rows: Vec::new(),
            zero_width_rows: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn n_rows(&self) -> usize {
        if self.width == 0 {
            self.zero_width_rows
        } else {
            self.rows.len() / self.width
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    pub fn row(&self, idx: usize) -> &[u64] {
        if self.width == 0 {
            &[]
        } else {
            &self.rows[idx * self.width..(idx + 1) * self.width]
        }
    }

    pub fn add_row(&mut self, row: &[u64]) {
        if self.width == 0 {
            self.zero_width_rows += 1;
        } else {
            debug_assert_eq!(row.len(), self.width);
            self.rows.extend_from_slice(row);
        }
    }

    /// Append a single value; rows close every `width` values.
    pub fn add_value(&mut self, value: u64) {
        debug_assert!(self.width > 0);
        self.rows.push(value);
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[u64]> {
        (0..self.n_rows()).map(move |i| self.row(i))
    }

    /// A copy sorted on the given fields.
    pub fn sort_by(&self, fields: &[usize]) -> TupleTable {
        let mut order: Vec<usize> = (0..self.n_rows()).collect();
        order.sort_by(|&a, &b| {
            let ra = self.row(a);
            let rb = self.row(b);
            for &f in fields {
                match ra[f].cmp(&rb[f]) {
                    std::cmp::Ordering::Equal => continue,
                    other => return other,
                }
            }
            std::cmp::Ordering::Equal
        });
        let mut out = TupleTable::new(self.width);
        out.zero_width_rows = self.zero_width_rows;
        for i in order {
            out.add_row(self.row(i));
        }
        out
    }

    /// A copy sorted on all fields, left to right.
    pub fn sort_by_all(&self) -> TupleTable {
        let fields: Vec<usize> = (0..self.width).collect();
        self.sort_by(&fields)
    }

    /// Sorted union of two sorted tables, duplicates removed.
    pub fn merge(&self, other: &TupleTable) -> TupleTable {
        debug_assert_eq!(self.width, other.width);
        let mut out = TupleTable::new(self.width);
        if self.width == 0 {
            out.zero_width_rows = (self.zero_width_rows + other.zero_width_rows).min(1);
            return out;
        }
        let (mut i, mut j) = (0, 0);
        let mut last: Option<Vec<u64>> = None;
        while i < self.n_rows() || j < other.n_rows() {
            let take_left = if i >= self.n_rows() {
                false
            } else if j >= other.n_rows() {
                true
            } else {
                self.row(i) <= other.row(j)
            };
            let row = if take_left {
                let r = self.row(i);
                i += 1;
                r
            } else {
                let r = other.row(j);
                j += 1;
                r
            };
            if last.as_deref() != Some(row) {
                out.add_row(row);
                last = Some(row.to_vec());
            }
        }
        out
    }
}

/// Pull-style iterator over query results, the shape callers consume.
pub trait TupleIterator {
    /// Whether another row is available.
    fn has_next(&self) -> bool;
    /// Advance to the next row. Returns false when exhausted.
    fn advance(&mut self) -> bool;
    /// Value at `pos` of the current row.
    fn element_at(&self, pos: usize) -> u64;
    /// Width of each row.
    fn row_width(&self) -> usize;
}

/// Iterator over an owned `TupleTable`.
pub struct TupleTableItr {
    table: TupleTable,
    idx: Option<usize>,
}

impl TupleTableItr {
    pub fn new(table: TupleTable) -> Self {
        Self { table, idx: None }
    }
}

impl TupleIterator for TupleTableItr {
    fn has_next(&self) -> bool {
        match self.idx {
            None => self.table.n_rows() > 0,
            Some(i) => i + 1 < self.table.n_rows(),
        }
    }

    fn advance(&mut self) -> bool {
        if !self.has_next() {
            return false;
        }
        self.idx = Some(match self.idx {
            None => 0,
            Some(i) => i + 1,
        });
        true
    }

    fn element_at(&self, pos: usize) -> u64 {
        let i = self.idx.expect("advance before element_at");
        self.table.row(i)[pos]
    }

    fn row_width(&self) -> usize {
        self.table.width()
    }
}

#[cfg(test)]
#[path = "tests/bindings.rs"]
mod tests;
