use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ParseError {
    #[error("Syntax error: {message}")]
    #[diagnostic(code(drover::parse::syntax))]
    Syntax {
        message: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },

    #[error("Duplicate declaration: {name}")]
    #[diagnostic(code(drover::parse::duplicate))]
    Duplicate {
        name: String,
        #[label("duplicate")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },

    #[error("Unknown type: {found}")]
    #[diagnostic(
        code(drover::parse::unknown_type),
        help("valid types are: int, bool, [int]int, [int]bool")
    )]
    UnknownType {
        found: String,
        #[label("unknown type")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },
}
