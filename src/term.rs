use smallvec::SmallVec;

use crate::error::{Error, Result};

/// A constant is an opaque 64-bit identifier resolved through an external
/// dictionary.
pub type ConstId = u64;

/// Variables are small integers scoped to a single rule.
pub type Var = u8;

/// Maximum width of the fixed row representation used by binding tables.
/// Checked at rule registration time, not at evaluation time.
pub const MAX_TUPLE_WIDTH: usize = 16;

/// Adornment over a predicate's argument positions: bit `i` set means
/// "argument `i` is bound on entry".
pub type Adornment = u8;

/// A term is either a rule-scoped variable or a dictionary constant.
/// Equality is by kind plus id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    Var(Var),
    Const(ConstId),
}

impl Term {
    pub fn is_variable(self) -> bool {
        matches!(self, Term::Var(_))
    }

    /// The variable id. Panics on constants; callers check `is_variable` first.
    pub fn var_id(self) -> Var {
        match self {
            Term::Var(v) => v,
            Term::Const(_) => panic!("var_id on a constant term"),
        }
    }

    /// The constant value. Panics on variables.
    pub fn value(self) -> ConstId {
        match self {
            Term::Const(c) => c,
            Term::Var(_) => panic!("value on a variable term"),
        }
    }
}

/// An ordered, fixed-length sequence of terms; length = predicate arity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    terms: SmallVec<[Term; 4]>,
}

impl Tuple {
    /// Build a tuple from its terms, checking the width cap.
    pub fn new(terms: impl IntoIterator<Item = Term>) -> Result<Self> {
        let terms: SmallVec<[Term; 4]> = terms.into_iter().collect();
        if terms.len() > MAX_TUPLE_WIDTH {
            return Err(Error::RowWidthExceeded {
                width: terms.len(),
                limit: MAX_TUPLE_WIDTH,
            });
        }
        Ok(Self { terms })
    }

    /// A tuple of `arity` fresh variables `0..arity`.
    pub fn all_vars(arity: usize) -> Result<Self> {
        Self::new((0..arity).map(|i| Term::Var(i as Var)))
    }

    pub fn arity(&self) -> usize {
        self.terms.len()
    }

    pub fn get(&self, pos: usize) -> Term {
        self.terms[pos]
    }

    pub fn set(&mut self, pos: usize, term: Term) {
        self.terms[pos] = term;
    }

    pub fn iter(&self) -> impl Iterator<Item = Term> + '_ {
        self.terms.iter().copied()
    }

    /// Pairs of positions holding the same variable, first occurrence first.
    pub fn repeated_vars(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for i in 0..self.terms.len() {
            if let Term::Var(v) = self.terms[i] {
                for j in 0..i {
                    if self.terms[j] == Term::Var(v) {
                        out.push((j, i));
                        break;
                    }
                }
            }
        }
        out
    }
}

/// Adornment with bit `i` set for every constant position of the tuple.
/// Adornments cover the first 8 positions; adorned evaluation checks the
/// arity cap separately.
pub fn calculate_adornment(t: &Tuple) -> Adornment {
    let mut adornment = 0u8;
    for (i, term) in t.iter().enumerate().take(8) {
        if !term.is_variable() {
            adornment |= 1 << i;
        }
    }
    adornment
}

/// Mark one more position as bound.
pub fn bind_position(adornment: Adornment, pos: usize) -> Adornment {
    debug_assert!(pos < 8);
    adornment | (1 << pos)
}

/// Number of bound positions in an adornment.
pub fn count_bound(adornment: Adornment) -> usize {
    adornment.count_ones() as usize
}

/// Render an adornment as the usual `b`/`f` string, low position first.
pub fn adornment_to_string(mut adornment: Adornment, size: usize) -> String {
    let mut out = String::with_capacity(size);
    for _ in 0..size {
        out.push(if adornment & 1 != 0 { 'b' } else { 'f' });
        adornment >>= 1;
    }
    out
}
