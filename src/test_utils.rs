use crate::bindings::TupleIterator;
use crate::edb::EdbLayer;
use crate::program::{Literal, Program};
use crate::term::{calculate_adornment, Term, Tuple};

/// Install a stderr tracing subscriber once; later calls are no-ops.
pub(crate) fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(filter)
        .try_init()
        .ok();
}

/// The standard ancestor fixture: par(a,b), par(b,c), par(c,d) with the
/// transitive-closure rules over anc.
pub(crate) fn ancestor_setup() -> (EdbLayer, Program) {
    let layer = EdbLayer::new();
    layer.add_facts_str("par", &[&["a", "b"], &["b", "c"], &["c", "d"]]);
    let mut program = Program::new(&layer);
    program
        .parse_rules("anc(X,Y) :- par(X,Y)\nanc(X,Z) :- par(X,Y), anc(Y,Z)")
        .unwrap();
    (layer, program)
}

/// Constant id for a dictionary text.
pub(crate) fn c(layer: &EdbLayer, text: &str) -> u64 {
    layer.dictionary().get_or_add_const(text)
}

/// Build a literal over a (possibly new) predicate, adorned by its
/// constants.
pub(crate) fn literal(program: &mut Program, name: &str, terms: &[Term]) -> Literal {
    let id = program.get_or_add_predicate(name, terms.len()).unwrap();
    let tuple = Tuple::new(terms.iter().copied()).unwrap();
    let pred = program.predicate_with_adornment(id, calculate_adornment(&tuple));
    Literal::new(pred, tuple)
}

/// Drain an iterator into sorted rows for order-independent comparison.
pub(crate) fn drain_sorted(mut itr: Box<dyn TupleIterator>) -> Vec<Vec<u64>> {
    let mut out = Vec::new();
    let width = itr.row_width();
    while itr.advance() {
        out.push((0..width).map(|p| itr.element_at(p)).collect());
    }
    out.sort();
    out
}
