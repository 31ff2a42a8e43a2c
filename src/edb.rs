use std::sync::Arc;

use hashbrown::HashMap;
use lasso::{Key, Spur, ThreadedRodeo};
use parking_lot::RwLock;

use crate::bindings::{TupleIterator, TupleTable, TupleTableItr};
use crate::program::{Literal, PredId};
use crate::term::ConstId;

/// Thread-safe interning dictionaries for predicate names and constants.
///
/// Constants are opaque 64-bit ids; the engine never interprets them.
pub struct Dictionary {
    preds: ThreadedRodeo,
    consts: ThreadedRodeo,
}

impl Dictionary {
    pub fn new() -> Self {
        Self {
            preds: ThreadedRodeo::new(),
            consts: ThreadedRodeo::new(),
        }
    }

    pub fn get_or_add_pred(&self, name: &str) -> PredId {
        self.preds.get_or_intern(name).into_usize() as PredId
    }

    pub fn pred(&self, name: &str) -> Option<PredId> {
        self.preds.get(name).map(|s| s.into_usize() as PredId)
    }

    pub fn pred_name(&self, id: PredId) -> Option<&str> {
        Spur::try_from_usize(id as usize).and_then(|s| self.preds.try_resolve(&s))
    }

    pub fn n_preds(&self) -> usize {
        self.preds.len()
    }

    pub fn get_or_add_const(&self, text: &str) -> ConstId {
        self.consts.get_or_intern(text).into_usize() as ConstId
    }

    pub fn const_id(&self, text: &str) -> Option<ConstId> {
        self.consts.get(text).map(|s| s.into_usize() as ConstId)
    }

    pub fn const_text(&self, id: ConstId) -> Option<&str> {
        Spur::try_from_usize(id as usize).and_then(|s| self.consts.try_resolve(&s))
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

/// The capability the core needs from one stored (EDB) relation.
///
/// `query` emits one output column per variable *position* of the literal
/// (repeats included), filtered by the literal's constants, its
/// repeated-variable equalities, and, when given, a set of allowed value
/// combinations at full-tuple positions.
pub trait EdbTable: Send + Sync {
    fn arity(&self) -> usize;

    fn query(
        &self,
        literal: &Literal,
        out: &mut TupleTable,
        pos_joins: Option<&[usize]>,
        join_values: Option<&[u64]>,
    );

    /// Exact number of stored tuples matching the literal's constants.
    fn cardinality(&self, literal: &Literal) -> usize;

    /// Possibly cheaper, possibly approximate count.
    fn estimate_cardinality(&self, literal: &Literal) -> usize;

    fn is_empty(
        &self,
        literal: &Literal,
        filter_pos: Option<&[usize]>,
        filter_values: Option<&[u64]>,
    ) -> bool;

    /// Of the sorted distinct `values`, those present in `column` of the
    /// rows matching the literal.
    fn check_in(&self, values: &[u64], literal: &Literal, column: usize) -> Vec<u64>;

    /// Of the sorted distinct `values`, those *not* present (the anti-join
    /// primitive).
    fn check_new_in(&self, values: &[u64], literal: &Literal, column: usize) -> Vec<u64>;
}

/// Sorted, distinct, fully materialized relation. The reference backend for
/// tests and small data sets; production backends implement `EdbTable` over
/// their own storage.
pub struct InMemoryTable {
    arity: usize,
    rows: Vec<u64>,
}

impl InMemoryTable {
    pub fn new(arity: usize, mut rows: Vec<Vec<u64>>) -> Self {
        rows.sort();
        rows.dedup();
        let mut flat = Vec::with_capacity(rows.len() * arity);
        for r in &rows {
            debug_assert_eq!(r.len(), arity);
            flat.extend_from_slice(r);
        }
        Self { arity, rows: flat }
    }

    fn n_rows(&self) -> usize {
        if self.arity == 0 {
            0
        } else {
            self.rows.len() / self.arity
        }
    }

    fn row(&self, i: usize) -> &[u64] {
        &self.rows[i * self.arity..(i + 1) * self.arity]
    }

    pub fn all_rows(&self) -> Vec<Vec<u64>> {
        (0..self.n_rows()).map(|i| self.row(i).to_vec()).collect()
    }

    fn matches(&self, row: &[u64], literal: &Literal) -> bool {
        for i in 0..literal.arity() {
            let t = literal.term_at(i);
            if !t.is_variable() && row[i] != t.value() {
                return false;
            }
        }
        literal
            .repeated_vars()
            .iter()
            .all(|&(a, b)| row[a] == row[b])
    }

    fn scan(&self, literal: &Literal, mut emit: impl FnMut(&[u64]) -> bool) {
        for i in 0..self.n_rows() {
            let row = self.row(i);
            if self.matches(row, literal) && !emit(row) {
                return;
            }
        }
    }
}

impl EdbTable for InMemoryTable {
    fn arity(&self) -> usize {
        self.arity
    }

    fn query(
        &self,
        literal: &Literal,
        out: &mut TupleTable,
        pos_joins: Option<&[usize]>,
        join_values: Option<&[u64]>,
    ) {
        let vars = literal.pos_vars();
        debug_assert_eq!(out.width(), vars.len());
        self.scan(literal, |row| {
            if let (Some(pos), Some(values)) = (pos_joins, join_values) {
                if !pos.is_empty() {
                    let step = pos.len();
                    let ok = values
                        .chunks(step)
                        .any(|chunk| pos.iter().zip(chunk).all(|(&p, &v)| row[p] == v));
                    if !ok {
                        return true;
                    }
                }
            }
            let projected: Vec<u64> = vars.iter().map(|&p| row[p]).collect();
            out.add_row(&projected);
            true
        });
    }

    fn cardinality(&self, literal: &Literal) -> usize {
        let mut n = 0;
        self.scan(literal, |_| {
            n += 1;
            true
        });
        n
    }

    fn estimate_cardinality(&self, literal: &Literal) -> usize {
        self.cardinality(literal)
    }

    fn is_empty(
        &self,
        literal: &Literal,
        filter_pos: Option<&[usize]>,
        filter_values: Option<&[u64]>,
    ) -> bool {
        let mut found = false;
        self.scan(literal, |row| {
            if let (Some(pos), Some(values)) = (filter_pos, filter_values) {
                if !pos.is_empty() {
                    let step = pos.len();
                    let ok = values
                        .chunks(step)
                        .any(|chunk| pos.iter().zip(chunk).all(|(&p, &v)| row[p] == v));
                    if !ok {
                        return true;
                    }
                }
            }
            found = true;
            false
        });
        !found
    }

    fn check_in(&self, values: &[u64], literal: &Literal, column: usize) -> Vec<u64> {
        let mut present: Vec<u64> = Vec::new();
        self.scan(literal, |row| {
            if values.binary_search(&row[column]).is_ok() {
                present.push(row[column]);
            }
            true
        });
        present.sort_unstable();
        present.dedup();
        present
    }

    fn check_new_in(&self, values: &[u64], literal: &Literal, column: usize) -> Vec<u64> {
        let present = self.check_in(values, literal, column);
        values
            .iter()
            .copied()
            .filter(|v| present.binary_search(v).is_err())
            .collect()
    }
}

/// The storage collaborator: a dictionary plus one `EdbTable` per stored
/// predicate. The engine addresses tables by predicate id only.
pub struct EdbLayer {
    dict: Arc<Dictionary>,
    tables: RwLock<HashMap<PredId, Arc<dyn EdbTable>>>,
    // raw rows of relations built through `add_facts`, kept so repeated
    // calls extend instead of replace
    mem_rows: RwLock<HashMap<PredId, Vec<Vec<u64>>>>,
}

impl EdbLayer {
    pub fn new() -> Self {
        Self {
            dict: Arc::new(Dictionary::new()),
            tables: RwLock::new(HashMap::new()),
            mem_rows: RwLock::new(HashMap::new()),
        }
    }

    pub fn dictionary(&self) -> Arc<Dictionary> {
        Arc::clone(&self.dict)
    }

    /// Register a storage-backed relation under `name`.
    pub fn add_table(&self, name: &str, table: Arc<dyn EdbTable>) -> PredId {
        let id = self.dict.get_or_add_pred(name);
        self.tables.write().insert(id, table);
        id
    }

    /// Convenience: build (or extend) an in-memory relation from raw rows.
    pub fn add_facts(&self, name: &str, arity: usize, rows: Vec<Vec<u64>>) -> PredId {
        let id = self.dict.get_or_add_pred(name);
        let mut mem = self.mem_rows.write();
        let all = mem.entry(id).or_default();
        all.extend(rows);
        self.tables
            .write()
            .insert(id, Arc::new(InMemoryTable::new(arity, all.clone())));
        id
    }

    /// Convenience for tests: rows given as constant texts.
    pub fn add_facts_str(&self, name: &str, rows: &[&[&str]]) -> PredId {
        let arity = rows.first().map(|r| r.len()).unwrap_or(0);
        let rows: Vec<Vec<u64>> = rows
            .iter()
            .map(|r| r.iter().map(|c| self.dict.get_or_add_const(c)).collect())
            .collect();
        self.add_facts(name, arity, rows)
    }

    pub fn does_pred_exist(&self, id: PredId) -> bool {
        self.tables.read().contains_key(&id)
    }

    pub fn pred_arity(&self, id: PredId) -> usize {
        self.tables.read().get(&id).map(|t| t.arity()).unwrap_or(0)
    }

    /// Snapshot of the registered predicates and their arities.
    pub fn edb_predicates(&self) -> HashMap<PredId, u8> {
        self.tables
            .read()
            .iter()
            .map(|(&id, t)| (id, t.arity() as u8))
            .collect()
    }

    fn table(&self, id: PredId) -> Option<Arc<dyn EdbTable>> {
        self.tables.read().get(&id).cloned()
    }

    pub fn query(
        &self,
        literal: &Literal,
        out: &mut TupleTable,
        pos_joins: Option<&[usize]>,
        join_values: Option<&[u64]>,
    ) {
        if let Some(t) = self.table(literal.predicate().id()) {
            t.query(literal, out, pos_joins, join_values);
        }
    }

    pub fn iterator(&self, literal: &Literal) -> Box<dyn TupleIterator> {
        let mut out = TupleTable::new(literal.n_vars());
        self.query(literal, &mut out, None, None);
        Box::new(TupleTableItr::new(out))
    }

    pub fn sorted_iterator(&self, literal: &Literal, fields: &[usize]) -> Box<dyn TupleIterator> {
        let mut out = TupleTable::new(literal.n_vars());
        self.query(literal, &mut out, None, None);
        Box::new(TupleTableItr::new(out.sort_by(fields)))
    }

    pub fn cardinality(&self, literal: &Literal) -> usize {
        self.table(literal.predicate().id())
            .map(|t| t.cardinality(literal))
            .unwrap_or(0)
    }

    pub fn estimate_cardinality(&self, literal: &Literal) -> usize {
        self.table(literal.predicate().id())
            .map(|t| t.estimate_cardinality(literal))
            .unwrap_or(0)
    }

    pub fn is_empty(
        &self,
        literal: &Literal,
        filter_pos: Option<&[usize]>,
        filter_values: Option<&[u64]>,
    ) -> bool {
        self.table(literal.predicate().id())
            .map(|t| t.is_empty(literal, filter_pos, filter_values))
            .unwrap_or(true)
    }

    pub fn check_in(&self, values: &[u64], literal: &Literal, column: usize) -> Vec<u64> {
        self.table(literal.predicate().id())
            .map(|t| t.check_in(values, literal, column))
            .unwrap_or_default()
    }

    pub fn check_new_in(&self, values: &[u64], literal: &Literal, column: usize) -> Vec<u64> {
        self.table(literal.predicate().id())
            .map(|t| t.check_new_in(values, literal, column))
            .unwrap_or_else(|| values.to_vec())
    }
}

impl Default for EdbLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/edb.rs"]
mod tests;
