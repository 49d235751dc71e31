//! Compiled cost programs
//!
//! A [`CostProgram`] wraps a compiled CEL expression together with the source
//! it was compiled from. Compilation is eager (configuration load time) and
//! evaluation is cheap, reentrant, and never mutates the program.

use std::fmt;

use cel::{Context, Program, Value};

use crate::{CostError, VARIABLES};

/// A compiled request-cost expression.
pub struct CostProgram {
    source: String,
    program: Program,
}

impl CostProgram {
    /// Compile a CEL source string into a cost program.
    ///
    /// Rejects programs that fail to parse, reference variables outside the
    /// fixed set, or do not produce an integer result for a probe input.
    pub fn compile(source: &str) -> Result<Self, CostError> {
        let program =
            Program::compile(source).map_err(|e| CostError::Compile(e.to_string()))?;

        for var in program.references().variables() {
            if !VARIABLES.contains(&var) {
                return Err(CostError::UnknownVariable(var.to_string()));
            }
        }

        let compiled = CostProgram {
            source: source.to_string(),
            program,
        };
        // Probe evaluation: catches programs that evaluate to strings, floats,
        // or fail outright, before any request traffic arrives. The result
        // value itself is irrelevant; only the type is checked.
        match compiled.execute("probe", "probe", 1, 1, 2)? {
            Value::Int(_) | Value::UInt(_) => Ok(compiled),
            _ => Err(CostError::NonInteger),
        }
    }

    /// The source string this program was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate the program, yielding a non-negative integer cost.
    pub fn evaluate(
        &self,
        model: &str,
        backend: &str,
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
    ) -> Result<u64, CostError> {
        match self.execute(model, backend, input_tokens, output_tokens, total_tokens)? {
            Value::UInt(v) => Ok(v),
            Value::Int(v) if v >= 0 => Ok(v as u64),
            Value::Int(v) => Err(CostError::Negative(v)),
            _ => Err(CostError::NonInteger),
        }
    }

    fn execute(
        &self,
        model: &str,
        backend: &str,
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
    ) -> Result<Value, CostError> {
        let mut ctx = Context::default();
        ctx.add_variable_from_value("model", Value::String(model.to_string().into()));
        ctx.add_variable_from_value("backend", Value::String(backend.to_string().into()));
        // Token counts are bound as ints so expressions can mix them with
        // integer literals under CEL's strict arithmetic typing; the
        // non-negative check happens on the result instead.
        ctx.add_variable_from_value("input_tokens", Value::Int(input_tokens as i64));
        ctx.add_variable_from_value("output_tokens", Value::Int(output_tokens as i64));
        ctx.add_variable_from_value("total_tokens", Value::Int(total_tokens as i64));
        self.program
            .execute(&ctx)
            .map_err(|e| CostError::Evaluate(e.to_string()))
    }
}

impl Clone for CostProgram {
    // `cel::Program` does not implement `Clone`, so recompile from the
    // already-validated source instead. Compilation is deterministic, so
    // this yields an equivalent program.
    fn clone(&self) -> Self {
        Program::compile(&self.source)
            .map(|program| CostProgram {
                source: self.source.clone(),
                program,
            })
            .expect("source was already validated at construction")
    }
}

impl fmt::Debug for CostProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CostProgram")
            .field("source", &self.source)
            .finish()
    }
}
