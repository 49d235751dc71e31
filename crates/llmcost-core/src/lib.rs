//! llmcost-core: Core LLM request-cost expression library for InferRouter
//!
//! This crate compiles and evaluates the CEL expressions used by request-cost
//! rules. Programs are compiled once at configuration load and evaluated per
//! request against a fixed variable set:
//!
//! - `model` (string): the resolved model name
//! - `backend` (string): the selected backend name
//! - `input_tokens`, `output_tokens`, `total_tokens` (int): accumulated usage
//!
//! CEL is not Turing-complete and has no I/O primitives, so evaluation is
//! bounded and side-effect free. Compilation rejects programs that reference
//! variables outside the set above, and a probe evaluation at compile time
//! rejects programs that do not produce a non-negative integer.
//!
//! # Example
//!
//! ```rust,ignore
//! use llmcost_core::CostProgram;
//!
//! let prog = CostProgram::compile("input_tokens * 2 + output_tokens").unwrap();
//! let cost = prog.evaluate("gpt-4o-mini", "openai", 10, 3, 13).unwrap();
//! assert_eq!(cost, 23);
//! ```

mod program;

pub use program::CostProgram;

use thiserror::Error;

/// The variables every cost program may reference.
pub const VARIABLES: [&str; 5] = [
    "model",
    "backend",
    "input_tokens",
    "output_tokens",
    "total_tokens",
];

/// Error type for cost expression operations
#[derive(Error, Debug)]
pub enum CostError {
    #[error("failed to compile expression: {0}")]
    Compile(String),

    #[error("expression references unknown variable {0:?}")]
    UnknownVariable(String),

    #[error("failed to evaluate expression: {0}")]
    Evaluate(String),

    #[error("expression produced a non-integer result")]
    NonInteger,

    #[error("expression produced a negative result: {0}")]
    Negative(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_and_evaluate() {
        let prog = CostProgram::compile("input_tokens * 2 + output_tokens").unwrap();
        assert_eq!(prog.evaluate("m", "b", 10, 3, 13).unwrap(), 23);
        // Reentrant: the same program evaluates repeatedly.
        assert_eq!(prog.evaluate("m", "b", 0, 0, 0).unwrap(), 0);
    }

    #[test]
    fn test_string_variables() {
        let prog =
            CostProgram::compile(r#"model == "premium" ? total_tokens * 10 : total_tokens"#)
                .unwrap();
        assert_eq!(prog.evaluate("premium", "openai", 1, 1, 2).unwrap(), 20);
        assert_eq!(prog.evaluate("basic", "openai", 1, 1, 2).unwrap(), 2);
    }

    #[test]
    fn test_backend_variable() {
        let prog = CostProgram::compile(r#"backend == "aws-bedrock" ? 2u : 1u"#).unwrap();
        assert_eq!(prog.evaluate("m", "aws-bedrock", 0, 0, 0).unwrap(), 2);
        assert_eq!(prog.evaluate("m", "openai", 0, 0, 0).unwrap(), 1);
    }

    #[test]
    fn test_compile_rejects_syntax_error() {
        assert!(matches!(
            CostProgram::compile("input_tokens +"),
            Err(CostError::Compile(_))
        ));
    }

    #[test]
    fn test_compile_rejects_unknown_variable() {
        assert!(matches!(
            CostProgram::compile("input_tokens + session_count"),
            Err(CostError::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_compile_rejects_non_integer_result() {
        assert!(CostProgram::compile(r#""not a number""#).is_err());
        assert!(CostProgram::compile("1.5").is_err());
    }

    #[test]
    fn test_negative_result_is_runtime_error() {
        // Compiles (the probe only checks the result is integer-typed) but
        // goes negative with real inputs; evaluation must fail, not wrap.
        let prog = CostProgram::compile("input_tokens - 5").unwrap();
        assert!(matches!(
            prog.evaluate("m", "b", 1, 0, 0),
            Err(CostError::Negative(_))
        ));
        assert_eq!(prog.evaluate("m", "b", 9, 0, 0).unwrap(), 4);
    }

    #[test]
    fn test_runtime_error_does_not_poison_program() {
        let prog = CostProgram::compile("input_tokens - 5").unwrap();
        assert!(prog.evaluate("m", "b", 0, 0, 0).is_err());
        assert_eq!(prog.evaluate("m", "b", 10, 0, 0).unwrap(), 5);
    }
}
