use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::edb::{Dictionary, EdbLayer};
use crate::error::{Error, Result};
use crate::subst::Substitution;
use crate::term::{Adornment, Term, Tuple, Var};

/// Predicate identifiers are dictionary-assigned and dense.
pub type PredId = u32;

/// Rule identifiers index into the program's rule list.
pub type RuleId = u32;

/// Cap on the predicate id space; exceeding it is a schema error.
pub const MAX_PREDICATES: usize = 1 << 16;

/// Most distinct variables a single rule may use.
pub const MAX_RULE_VARS: usize = 255;

/// Whether a predicate is backed by storage or defined by rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredKind {
    Edb,
    Idb,
}

/// A predicate reference: id, arity, kind, and the adornment of this
/// particular use. Magic predicates are flagged so the body optimizer
/// leaves them in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Predicate {
    id: PredId,
    adornment: Adornment,
    kind: PredKind,
    arity: u8,
    magic: bool,
}

impl Predicate {
    pub fn new(id: PredId, adornment: Adornment, kind: PredKind, arity: u8) -> Self {
        Self {
            id,
            adornment,
            kind,
            arity,
            magic: false,
        }
    }

    pub fn new_magic(id: PredId, adornment: Adornment, arity: u8) -> Self {
        Self {
            id,
            adornment,
            kind: PredKind::Idb,
            arity,
            magic: true,
        }
    }

    pub fn id(&self) -> PredId {
        self.id
    }

    pub fn adornment(&self) -> Adornment {
        self.adornment
    }

    pub fn kind(&self) -> PredKind {
        self.kind
    }

    pub fn is_edb(&self) -> bool {
        self.kind == PredKind::Edb
    }

    pub fn arity(&self) -> usize {
        self.arity as usize
    }

    pub fn is_magic(&self) -> bool {
        self.magic
    }

    /// The same predicate under a different call pattern.
    pub fn with_adornment(&self, adornment: Adornment) -> Self {
        Self { adornment, ..*self }
    }
}

/// An atom: predicate applied to a tuple, possibly negated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Literal {
    pred: Predicate,
    tuple: Tuple,
    negated: bool,
}

impl Literal {
    pub fn new(pred: Predicate, tuple: Tuple) -> Self {
        debug_assert_eq!(pred.arity(), tuple.arity());
        Self {
            pred,
            tuple,
            negated: false,
        }
    }

    pub fn new_negated(pred: Predicate, tuple: Tuple) -> Self {
        Self {
            pred,
            tuple,
            negated: true,
        }
    }

    pub fn predicate(&self) -> &Predicate {
        &self.pred
    }

    pub fn tuple(&self) -> &Tuple {
        &self.tuple
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    pub fn arity(&self) -> usize {
        self.tuple.arity()
    }

    pub fn term_at(&self, pos: usize) -> Term {
        self.tuple.get(pos)
    }

    /// Number of variable positions (repeats counted).
    pub fn n_vars(&self) -> usize {
        self.tuple.iter().filter(|t| t.is_variable()).count()
    }

    pub fn n_constants(&self) -> usize {
        self.arity() - self.n_vars()
    }

    /// Positions holding variables, in order.
    pub fn pos_vars(&self) -> Vec<usize> {
        self.tuple
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_variable())
            .map(|(i, _)| i)
            .collect()
    }

    /// Distinct variables in first-occurrence order.
    pub fn all_vars(&self) -> Vec<Var> {
        let mut out = Vec::new();
        for t in self.tuple.iter() {
            if let Term::Var(v) = t {
                if !out.contains(&v) {
                    out.push(v);
                }
            }
        }
        out
    }

    pub fn n_unique_vars(&self) -> usize {
        self.all_vars().len()
    }

    pub fn has_repeated_vars(&self) -> bool {
        self.n_vars() > self.n_unique_vars()
    }

    pub fn repeated_vars(&self) -> Vec<(usize, usize)> {
        self.tuple.repeated_vars()
    }

    pub fn contains_var(&self, var: Var) -> bool {
        self.all_vars().contains(&var)
    }

    /// Variables of `self` that occur in `vars`, in first-occurrence order.
    pub fn shared_vars(&self, vars: &[Var]) -> Vec<Var> {
        self.all_vars()
            .into_iter()
            .filter(|v| vars.contains(v))
            .collect()
    }

    /// Variables of `self` not in `vars`, in first-occurrence order.
    pub fn new_vars(&self, vars: &[Var]) -> Vec<Var> {
        self.all_vars()
            .into_iter()
            .filter(|v| !vars.contains(v))
            .collect()
    }

    /// True when both literals list the same variables in the same order.
    pub fn same_var_sequence_as(&self, other: &Literal) -> bool {
        let mine: Vec<Var> = self
            .tuple
            .iter()
            .filter(|t| t.is_variable())
            .map(|t| t.var_id())
            .collect();
        let theirs: Vec<Var> = other
            .tuple
            .iter()
            .filter(|t| t.is_variable())
            .map(|t| t.var_id())
            .collect();
        mine == theirs
    }

    /// Apply a substitution to every variable position.
    pub fn substitute(&self, subs: &[Substitution]) -> Literal {
        let mut tuple = self.tuple.clone();
        for pos in 0..tuple.arity() {
            if let Term::Var(v) = tuple.get(pos) {
                if let Some(s) = subs.iter().find(|s| s.origin == v) {
                    tuple.set(pos, s.destination);
                }
            }
        }
        Literal {
            pred: self.pred,
            tuple,
            negated: self.negated,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "~")?;
        }
        write!(
            f,
            "p{}^{}{}(",
            self.pred.id(),
            crate::term::adornment_to_string(self.pred.adornment(), self.arity()),
            if self.pred.is_magic() { "m" } else { "" },
        )?;
        for (i, t) in self.tuple.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match t {
                Term::Var(v) => write!(f, "?{}", v)?,
                Term::Const(c) => write!(f, "{}", c)?,
            }
        }
        write!(f, ")")
    }
}

/// A rule: one or more heads entailed by a conjunctive body.
/// Body order is significant; it is the fixed left-to-right evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    id: RuleId,
    heads: Vec<Literal>,
    body: Vec<Literal>,
}

impl Rule {
    pub fn new(id: RuleId, heads: Vec<Literal>, body: Vec<Literal>) -> Self {
        Self { id, heads, body }
    }

    pub fn id(&self) -> RuleId {
        self.id
    }

    pub fn with_id(mut self, id: RuleId) -> Self {
        self.id = id;
        self
    }

    pub fn heads(&self) -> &[Literal] {
        &self.heads
    }

    pub fn body(&self) -> &[Literal] {
        &self.body
    }

    pub fn first_head(&self) -> &Literal {
        &self.heads[0]
    }

    /// Number of IDB atoms in the body.
    pub fn n_idb_body(&self) -> usize {
        self.body
            .iter()
            .filter(|l| !l.predicate().is_edb())
            .count()
    }

    /// Distinct head variables, skipping heads over `ignore`.
    pub fn vars_in_head(&self, ignore: Option<PredId>) -> Vec<Var> {
        let mut out = Vec::new();
        for head in &self.heads {
            if Some(head.predicate().id()) == ignore {
                continue;
            }
            for v in head.all_vars() {
                if !out.contains(&v) {
                    out.push(v);
                }
            }
        }
        out
    }

    /// Distinct body variables in first-occurrence order.
    pub fn vars_in_body(&self) -> Vec<Var> {
        let mut out = Vec::new();
        for lit in &self.body {
            for v in lit.all_vars() {
                if !out.contains(&v) {
                    out.push(v);
                }
            }
        }
        out
    }

    /// Head variables that do not occur in the body (fresh per derivation).
    pub fn existential_vars(&self) -> Vec<Var> {
        let body_vars = self.vars_in_body();
        self.vars_in_head(None)
            .into_iter()
            .filter(|v| !body_vars.contains(v))
            .collect()
    }

    /// Head variables shared with the body.
    pub fn frontier_vars(&self) -> Vec<Var> {
        let body_vars = self.vars_in_body();
        self.vars_in_head(None)
            .into_iter()
            .filter(|v| body_vars.contains(v))
            .collect()
    }

    pub fn is_existential(&self) -> bool {
        !self.existential_vars().is_empty()
    }

    /// Whether `var` occurs in a body atom at `start` or later, or in a head.
    pub fn var_appears_from(&self, start: usize, var: Var) -> bool {
        for lit in &self.body[start.min(self.body.len())..] {
            if lit.contains_var(var) {
                return true;
            }
        }
        for head in &self.heads {
            if head.contains_var(var) {
                return true;
            }
        }
        false
    }

    /// Renumber variables densely by first occurrence, heads first.
    /// Rewritten rule sets use this before structural deduplication.
    pub fn normalize_vars(&self) -> Rule {
        let mut vars: Vec<Var> = Vec::new();
        for head in &self.heads {
            for v in head.all_vars() {
                if !vars.contains(&v) {
                    vars.push(v);
                }
            }
        }
        for lit in &self.body {
            for v in lit.new_vars(&vars) {
                vars.push(v);
            }
        }
        let subs: Vec<Substitution> = vars
            .iter()
            .enumerate()
            .map(|(i, &v)| Substitution::new(v, Term::Var(i as Var)))
            .collect();
        Rule {
            id: self.id,
            heads: self.heads.iter().map(|h| h.substitute(&subs)).collect(),
            body: self.body.iter().map(|b| b.substitute(&subs)).collect(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, head) in self.heads.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", head)?;
        }
        write!(f, " :- ")?;
        for (i, lit) in self.body.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", lit)?;
        }
        Ok(())
    }
}

/// The rule set plus the predicate registry. Rules are validated before
/// insertion and immutable afterwards; adornment variants are derived
/// copies, never mutations.
#[derive(Clone)]
pub struct Program {
    dict: Arc<Dictionary>,
    edb_arities: HashMap<PredId, u8>,
    arities: HashMap<PredId, u8>,
    rules_by_pred: HashMap<PredId, Vec<RuleId>>,
    rules: Vec<Rule>,
    rewrite_counter: u32,
}

impl Program {
    /// A program over the predicates known to the storage layer.
    pub fn new(layer: &EdbLayer) -> Self {
        let edb_arities = layer.edb_predicates();
        let arities = edb_arities.clone();
        Self {
            dict: layer.dictionary(),
            edb_arities,
            arities,
            rules_by_pred: HashMap::new(),
            rules: Vec::new(),
            rewrite_counter: 0,
        }
    }

    /// A program with the same dictionaries and predicates but no rules.
    pub fn clone_empty(&self) -> Self {
        Self {
            dict: Arc::clone(&self.dict),
            edb_arities: self.edb_arities.clone(),
            arities: self.arities.clone(),
            rules_by_pred: HashMap::new(),
            rules: Vec::new(),
            rewrite_counter: self.rewrite_counter,
        }
    }

    /// A program with the same registry and the given rules, re-identified.
    pub fn subprogram(&self, rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut out = self.clone_empty();
        for rule in rules {
            out.add_rule_direct(rule.heads, rule.body);
        }
        out
    }

    pub fn dictionary(&self) -> Arc<Dictionary> {
        Arc::clone(&self.dict)
    }

    /// Register (or look up) a predicate by name. EDB-ness comes from the
    /// storage layer snapshot taken at construction.
    pub fn get_or_add_predicate(&mut self, name: &str, arity: usize) -> Result<PredId> {
        if self.dict.pred(name).is_none() && self.dict.n_preds() >= MAX_PREDICATES {
            return Err(Error::PredicateIdsExhausted);
        }
        let id = self.dict.get_or_add_pred(name);
        match self.arities.get(&id) {
            Some(&a) if a as usize != arity => Err(Error::ArityMismatch {
                name: name.to_string(),
                expected: a as usize,
                found: arity,
            }),
            Some(_) => Ok(id),
            None => {
                self.arities.insert(id, arity as u8);
                Ok(id)
            }
        }
    }

    pub fn predicate_name(&self, id: PredId) -> String {
        self.dict
            .pred_name(id)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("p{}", id))
    }

    pub fn is_idb(&self, id: PredId) -> bool {
        !self.edb_arities.contains_key(&id)
    }

    pub fn arity_of(&self, id: PredId) -> usize {
        self.arities.get(&id).copied().unwrap_or(0) as usize
    }

    pub fn get_predicate(&self, id: PredId) -> Predicate {
        self.predicate_with_adornment(id, 0)
    }

    pub fn predicate_with_adornment(&self, id: PredId, adornment: Adornment) -> Predicate {
        let kind = if self.is_idb(id) {
            PredKind::Idb
        } else {
            PredKind::Edb
        };
        Predicate::new(id, adornment, kind, self.arities.get(&id).copied().unwrap_or(0))
    }

    pub fn all_predicate_ids(&self) -> Vec<PredId> {
        let mut out: Vec<PredId> = self.arities.keys().copied().collect();
        out.sort_unstable();
        out
    }

    /// Validate and add a rule. Multi-head rules are rewritten through a
    /// generated auxiliary head so downstream evaluation sees single heads.
    pub fn add_rule(&mut self, heads: Vec<Literal>, body: Vec<Literal>) -> Result<()> {
        for head in &heads {
            if head.is_negated() {
                return Err(Error::NegatedHead);
            }
            if head.predicate().is_edb() {
                return Err(Error::EdbHead);
            }
        }
        let probe = Rule::new(0, heads.clone(), body.clone());
        let mut nvars = probe.vars_in_body().len();
        for v in probe.vars_in_head(None) {
            if !probe.vars_in_body().contains(&v) {
                nvars += 1;
            }
        }
        if nvars > MAX_RULE_VARS {
            return Err(Error::TooManyVariables {
                limit: MAX_RULE_VARS,
            });
        }
        if heads.len() > 1 {
            self.rewrite_multihead(heads, body)?;
        } else {
            self.add_rule_direct(heads, body);
        }
        Ok(())
    }

    fn add_rule_direct(&mut self, heads: Vec<Literal>, body: Vec<Literal>) {
        let id = self.rules.len() as RuleId;
        for head in &heads {
            self.rules_by_pred
                .entry(head.predicate().id())
                .or_default()
                .push(id);
        }
        self.rules.push(Rule::new(id, heads, body));
    }

    /// Split a multi-head rule through a generated head predicate holding
    /// all head variables, then one projection rule per original head.
    fn rewrite_multihead(&mut self, heads: Vec<Literal>, body: Vec<Literal>) -> Result<()> {
        let mut head_vars: Vec<Var> = Vec::new();
        for h in &heads {
            for v in h.all_vars() {
                if !head_vars.contains(&v) {
                    head_vars.push(v);
                }
            }
        }
        let name = format!("__generated_head_{}", self.rewrite_counter);
        self.rewrite_counter += 1;
        let gen_id = self.get_or_add_predicate(&name, head_vars.len())?;
        let gen_pred = self.predicate_with_adornment(gen_id, 0);
        let tuple = Tuple::new(head_vars.iter().map(|&v| Term::Var(v)))?;
        let gen_head = Literal::new(gen_pred, tuple);
        self.add_rule_direct(vec![gen_head.clone()], body);
        for h in heads {
            self.add_rule_direct(vec![h], vec![gen_head.clone()]);
        }
        Ok(())
    }

    pub fn rules_for(&self, pred: PredId) -> &[RuleId] {
        self.rules_by_pred
            .get(&pred)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id as usize]
    }

    pub fn all_rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn n_rules(&self) -> usize {
        self.rules.len()
    }

    /// Replace one predicate's rule list. The rules themselves stay
    /// registered; this only narrows which ones define the predicate.
    pub fn set_rules_for(&mut self, pred: PredId, ids: Vec<RuleId>) {
        self.rules_by_pred.insert(pred, ids);
    }

    /// Stable-sort each predicate's rule list by the number of IDB body
    /// atoms, so cheap rules run first in the incremental strategy.
    pub fn sort_rules_by_idb_count(&mut self) {
        let rules = &self.rules;
        for ids in self.rules_by_pred.values_mut() {
            ids.sort_by_key(|&id| rules[id as usize].n_idb_body());
        }
    }

    /// Parse newline-separated rules in `head :- body` syntax. Tokens with
    /// a leading uppercase letter are variables; everything else is a
    /// constant interned through the shared dictionary. Lines starting with
    /// `//` and blank lines are skipped.
    pub fn parse_rules(&mut self, text: &str) -> Result<()> {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            self.parse_rule(line)?;
        }
        Ok(())
    }

    pub fn parse_rule(&mut self, line: &str) -> Result<()> {
        let (head_txt, body_txt) = line
            .split_once(":-")
            .ok_or_else(|| Error::Parse(format!("missing ':-' in `{}`", line)))?;
        let mut var_names: Vec<String> = Vec::new();
        let mut heads = Vec::new();
        for part in split_literals(head_txt) {
            heads.push(self.parse_literal(&part, &mut var_names)?);
        }
        let mut body = Vec::new();
        for part in split_literals(body_txt) {
            body.push(self.parse_literal(&part, &mut var_names)?);
        }
        if heads.is_empty() {
            return Err(Error::Parse(format!("no head in `{}`", line)));
        }
        self.add_rule(heads, body)
    }

    fn parse_literal(&mut self, text: &str, var_names: &mut Vec<String>) -> Result<Literal> {
        let text = text.trim();
        let (negated, text) = match text.strip_prefix('~') {
            Some(rest) => (true, rest.trim()),
            None => (false, text),
        };
        let open = text
            .find('(')
            .ok_or_else(|| Error::Parse(format!("missing '(' in `{}`", text)))?;
        let close = text
            .rfind(')')
            .ok_or_else(|| Error::Parse(format!("missing ')' in `{}`", text)))?;
        let name = text[..open].trim();
        if name.is_empty() {
            return Err(Error::Parse(format!("missing predicate name in `{}`", text)));
        }
        let args = text[open + 1..close].trim();
        let mut terms = Vec::new();
        if !args.is_empty() {
            for tok in args.split(',') {
                let tok = tok.trim();
                if tok.is_empty() {
                    return Err(Error::Parse(format!("empty term in `{}`", text)));
                }
                if tok.chars().next().unwrap().is_ascii_uppercase() {
                    let idx = match var_names.iter().position(|n| n == tok) {
                        Some(i) => i,
                        None => {
                            var_names.push(tok.to_string());
                            var_names.len() - 1
                        }
                    };
                    if idx > MAX_RULE_VARS {
                        return Err(Error::TooManyVariables {
                            limit: MAX_RULE_VARS,
                        });
                    }
                    terms.push(Term::Var(idx as Var));
                } else {
                    terms.push(Term::Const(self.dict.get_or_add_const(tok)));
                }
            }
        }
        let id = self.get_or_add_predicate(name, terms.len())?;
        let tuple = Tuple::new(terms)?;
        let pred = self.predicate_with_adornment(id, crate::term::calculate_adornment(&tuple));
        Ok(if negated {
            Literal::new_negated(pred, tuple)
        } else {
            Literal::new(pred, tuple)
        })
    }
}

/// Split `p(a,b), q(c)` into literal strings at top-level commas.
fn split_literals(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in text.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

#[cfg(test)]
#[path = "tests/program.rs"]
mod tests;
