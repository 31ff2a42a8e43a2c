pub mod adorn;
pub mod bindings;
pub mod collector;
pub mod edb;
pub mod error;
pub mod executor;
pub mod facts;
pub mod program;
pub mod qsqr;
pub mod reasoner;
pub mod segment;
pub mod seminaive;
pub mod subst;
pub mod term;
pub mod wizard;

#[cfg(test)]
pub(crate) mod test_utils;
