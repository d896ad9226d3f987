//! Drover verification language (DVL).
//!
//! This crate defines the Boogie-flavored intermediate language the drover
//! pipeline analyses and rewrites: global map variables, constants, axioms,
//! procedures with contracts, and implementations made of labelled blocks.
//! It also provides the text parser and the deterministic printer; stage
//! artifacts round-trip through text.

pub mod ast;
pub mod errors;
pub mod parser;
pub mod printer;

pub use ast::Program;
pub use errors::ParseError;

/// Parse a DVL program from source text.
///
/// `filename` is carried into diagnostics only.
pub fn parse(source: &str, filename: &str) -> Result<Program, ParseError> {
    parser::parse(source, filename)
}
