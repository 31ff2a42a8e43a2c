use hashbrown::HashSet;

use crate::adorn::create_adornment;
use crate::error::Result;
use crate::program::{Literal, PredId, PredKind, Program, Rule};
use crate::qsqr::PredSig;
use crate::term::{Term, Tuple};

/// Compute the adorned program for a query: starting from the query's call
/// pattern, adorn every defining rule and chase the IDB body atoms it
/// produces until no new (predicate, adornment) pair appears.
pub fn adorned_program(query: &Literal, program: &Program) -> Result<Program> {
    let mut rules: Vec<Rule> = Vec::new();
    let mut seen: HashSet<PredSig> = HashSet::new();
    let mut queries: Vec<Literal> = vec![query.clone()];
    seen.insert((query.predicate().id(), query.predicate().adornment()));

    let mut idx_queries = 0;
    let mut idx_rules = 0;
    while idx_queries < queries.len() {
        let lit = queries[idx_queries].clone();
        for &rid in program.rules_for(lit.predicate().id()) {
            rules.push(create_adornment(
                program.rule(rid),
                lit.predicate().adornment(),
            )?);
        }
        while idx_rules < rules.len() {
            let body: Vec<Literal> = rules[idx_rules].body().to_vec();
            for atom in body {
                if atom.predicate().kind() == PredKind::Idb {
                    let key = (atom.predicate().id(), atom.predicate().adornment());
                    if seen.insert(key) {
                        queries.push(atom);
                    }
                }
            }
            idx_rules += 1;
        }
        idx_queries += 1;
    }

    Ok(program.subprogram(rules))
}

/// The magic literal guarding an adorned head: one argument per bound
/// position, all of them bound.
fn magic_relation(program: &mut Program, head: &Literal) -> Result<Literal> {
    let pred = head.predicate();
    let adornment = pred.adornment();
    let name = format!("magic_{}_{}", pred.id(), adornment);

    let mut terms = Vec::new();
    let mut magic_adornment = 0u8;
    for i in 0..head.arity() {
        if adornment >> i & 1 != 0 {
            magic_adornment |= 1 << terms.len();
            terms.push(head.term_at(i));
        }
    }
    let arity = terms.len();
    let id = program.get_or_add_predicate(&name, arity)?;
    let magic_pred = crate::program::Predicate::new_magic(id, magic_adornment, arity as u8);
    Ok(Literal::new(magic_pred, Tuple::new(terms)?))
}

/// Rewrite an adorned program with magic sets.
///
/// Every rule is guarded by its head's magic literal; for each IDB body
/// atom past the guard, a magic rule derives that atom's magic relation
/// from the body prefix before it. Returns the rewritten program, the
/// magic relation to seed with the query's bound values, and the predicate
/// whose materialized table holds the answers.
pub fn magic_rewrite(query: &Literal, adorned: &Program) -> Result<(Program, PredId, PredId)> {
    let mut new_program = adorned.clone_empty();
    let mut new_rules: Vec<Rule> = Vec::new();
    let mut input_rel: Option<PredId> = None;

    for rule in adorned.all_rules() {
        for head in rule.heads() {
            let magic_literal = magic_relation(&mut new_program, head)?;
            if head.predicate().id() == query.predicate().id()
                && head.predicate().adornment() == query.predicate().adornment()
            {
                input_rel = Some(magic_literal.predicate().id());
            }
            let mut body = Vec::with_capacity(rule.body().len() + 1);
            body.push(magic_literal);
            body.extend(rule.body().iter().cloned());
            let r = Rule::new(new_rules.len() as u32, vec![head.clone()], body);
            new_rules.push(r.normalize_vars());
        }
    }

    // One magic rule per IDB body atom beyond the guard: its magic relation
    // follows from the prefix in front of it.
    let mut additional: Vec<Rule> = Vec::new();
    let mut additional_keys: HashSet<String> = HashSet::new();
    for rule in &new_rules {
        let n_idb = rule.n_idb_body();
        debug_assert!(n_idb > 0);
        for i in 1..n_idb {
            let mut body = Vec::new();
            let mut count_idb = 0;
            let mut j = 0;
            while j < rule.body().len() {
                let atom = &rule.body()[j];
                if atom.predicate().kind() == PredKind::Idb {
                    if count_idb == i {
                        break;
                    }
                    count_idb += 1;
                }
                body.push(atom.clone());
                j += 1;
            }
            let new_head = magic_relation(&mut new_program, &rule.body()[j])?;
            debug_assert!(!body.is_empty());
            let trivial = body.len() == 1
                && body[0].predicate().id() == new_head.predicate().id()
                && body[0].predicate().adornment() == new_head.predicate().adornment();
            if trivial {
                continue;
            }
            let r = Rule::new(
                (new_rules.len() + additional.len()) as u32,
                vec![new_head],
                body,
            )
            .normalize_vars();
            let key = r.to_string();
            if additional_keys.insert(key) {
                additional.push(r);
            }
        }
    }
    new_rules.extend(additional);

    let input_rel = input_rel.ok_or(crate::error::Error::UnsupportedPattern(
        "magic rewrite of a predicate with no defining rules",
    ))?;
    let output_rel = query.predicate().id();
    for rule in new_rules {
        new_program.add_rule(rule.heads().to_vec(), rule.body().to_vec())?;
    }
    Ok((new_program, input_rel, output_rel))
}

/// Seed tuple rows for the magic input relation: the query's bound values,
/// one row per candidate binding.
pub fn magic_seed_rows(
    query: &Literal,
    pos_joins: Option<&[usize]>,
    values: Option<&[u64]>,
) -> Vec<Vec<u64>> {
    let bound: Vec<usize> = (0..query.arity())
        .filter(|&i| query.predicate().adornment() >> i & 1 != 0)
        .collect();
    let mut template: Vec<u64> = bound
        .iter()
        .map(|&i| match query.term_at(i) {
            Term::Const(c) => c,
            Term::Var(_) => 0,
        })
        .collect();
    match (pos_joins, values) {
        (Some(pos), Some(values)) if !pos.is_empty() => {
            let mut rows = Vec::new();
            for chunk in values.chunks(pos.len()) {
                for (j, &p) in pos.iter().enumerate() {
                    if let Some(k) = bound.iter().position(|&b| b == p) {
                        template[k] = chunk[j];
                    }
                }
                rows.push(template.clone());
            }
            rows
        }
        _ => vec![template],
    }
}

#[cfg(test)]
#[path = "tests/wizard.rs"]
mod tests;
