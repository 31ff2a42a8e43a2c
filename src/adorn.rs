use crate::error::{Error, Result};
use crate::program::{Literal, PredKind, Rule};
use crate::term::Var;

/// Derive the adorned variant of a rule for a given head call pattern.
///
/// Boundness propagates left to right: head variables at bound positions
/// start out bound, constants are always bound, and every variable a body
/// atom introduces becomes bound for the atoms after it. The body is
/// re-arranged first so that bound and cheap atoms come early; magic guard
/// atoms keep their position.
pub fn create_adornment(rule: &Rule, head_adornment: u8) -> Result<Rule> {
    if rule.heads().len() > 1 {
        return Err(Error::UnsupportedPattern(
            "adornment of a multi-head rule",
        ));
    }
    for lit in rule.heads().iter().chain(rule.body().iter()) {
        if lit.arity() > 8 {
            return Err(Error::ArityTooLargeForAdornment { arity: lit.arity() });
        }
    }

    let head = rule.first_head();
    let new_head = Literal::new(
        head.predicate().with_adornment(head_adornment),
        head.tuple().clone(),
    );

    // Head variables bound by the call pattern, first occurrence only.
    let mut bound_vars: Vec<Var> = Vec::new();
    for i in 0..head.arity() {
        if head_adornment >> i & 1 != 0 {
            let t = head.term_at(i);
            if t.is_variable() && !bound_vars.contains(&t.var_id()) {
                bound_vars.push(t.var_id());
            }
        }
    }

    let rearranged = rearrange_body(&bound_vars, rule.body())?;

    let mut new_body = Vec::with_capacity(rearranged.len());
    for literal in rearranged {
        let mut adornment = 0u8;
        let mut unique_vars: Vec<Var> = Vec::new();
        for i in 0..literal.arity() {
            let t = literal.term_at(i);
            if t.is_variable() {
                if bound_vars.contains(&t.var_id()) {
                    adornment |= 1 << i;
                } else if !literal.is_negated() && !unique_vars.contains(&t.var_id()) {
                    unique_vars.push(t.var_id());
                }
            } else {
                adornment |= 1 << i;
            }
        }
        bound_vars.extend(unique_vars);
        let adorned = Literal::new(
            literal.predicate().with_adornment(adornment),
            literal.tuple().clone(),
        );
        new_body.push(if literal.is_negated() {
            Literal::new_negated(*adorned.predicate(), adorned.tuple().clone())
        } else {
            adorned
        });
    }

    Ok(Rule::new(rule.id(), vec![new_head], new_body))
}

/// Order the body so head bindings flow into it: magic atoms stay in place,
/// the rest are picked greedily preferring EDB atoms, more total bound
/// positions, and atoms touching the query's own bound variables. Negated
/// atoms are only eligible once all their variables are bound.
fn rearrange_body(bound_vars: &[Var], body: &[Literal]) -> Result<Vec<Literal>> {
    let mut output: Vec<Literal> = Vec::new();
    let mut remaining: Vec<&Literal> = Vec::new();
    for lit in body {
        if lit.predicate().is_magic() {
            output.push(lit.clone());
        } else {
            remaining.push(lit);
        }
    }

    // Selectivity pre-sort: EDB before IDB, then fewer variables first.
    remaining.sort_by_key(|l| {
        let kind = match l.predicate().kind() {
            PredKind::Edb => 0,
            PredKind::Idb => 1,
        };
        (kind, l.n_vars())
    });

    let mut existing_vars: Vec<Var> = bound_vars.to_vec();
    let mut plan: Vec<&Literal> = Vec::new();

    // With nothing bound, seed the plan with the most selective atom.
    if bound_vars.is_empty() && remaining.len() > 1 {
        if let Some(pos) = remaining.iter().position(|l| !l.is_negated()) {
            let first = remaining.remove(pos);
            plan.push(first);
            for v in first.all_vars() {
                if !existing_vars.contains(&v) {
                    existing_vars.push(v);
                }
            }
        }
    }

    while !remaining.is_empty() {
        if remaining.len() == 1 && !remaining[0].is_negated() {
            if remaining[0].shared_vars(&existing_vars).is_empty() && !plan.is_empty() {
                return Err(Error::UnsupportedPattern(
                    "cartesian product in rule body",
                ));
            }
            plan.push(remaining[0]);
            break;
        }

        let mut n_bounds: isize = -1;
        let mut bounds_query = false;
        let mut kind_rank = 1; // prefer EDB (rank 0)
        let mut chosen: Option<usize> = None;

        for (idx, l) in remaining.iter().enumerate() {
            let mut lit_bound_vars = 0usize;
            let mut all_bounds = 0isize;
            let mut touches_query = false;
            for i in 0..l.arity() {
                let t = l.term_at(i);
                if t.is_variable() {
                    if existing_vars.contains(&t.var_id()) {
                        lit_bound_vars += 1;
                        all_bounds += 1;
                    }
                    if bound_vars.contains(&t.var_id()) {
                        touches_query = true;
                    }
                } else {
                    all_bounds += 1;
                }
            }
            if l.is_negated() && !l.all_vars().iter().all(|v| existing_vars.contains(v)) {
                continue;
            }
            if lit_bound_vars > 0 || l.is_negated() {
                let rank = match l.predicate().kind() {
                    PredKind::Edb => 0,
                    PredKind::Idb => 1,
                };
                if rank < kind_rank
                    || (rank == kind_rank && all_bounds > n_bounds)
                    || (rank == kind_rank
                        && all_bounds == n_bounds
                        && touches_query
                        && !bounds_query)
                {
                    chosen = Some(idx);
                    n_bounds = all_bounds;
                    bounds_query = touches_query;
                    kind_rank = rank;
                }
            }
        }

        let chosen = match chosen {
            Some(idx) => idx,
            None => {
                // No connected atom: only legal as the very first pick.
                match remaining.iter().position(|l| !l.is_negated()) {
                    Some(idx) if plan.is_empty() => idx,
                    _ => {
                        return Err(Error::UnsupportedPattern(
                            "negated atom with unbound variables",
                        ))
                    }
                }
            }
        };

        let lit = remaining.remove(chosen);
        plan.push(lit);
        for v in lit.all_vars() {
            if !existing_vars.contains(&v) {
                existing_vars.push(v);
            }
        }
    }

    output.extend(plan.into_iter().cloned());
    Ok(output)
}

#[cfg(test)]
#[path = "tests/adorn.rs"]
mod tests;
