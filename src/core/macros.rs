use std::collections::BTreeMap;
use std::sync::Arc;

use log::trace;

use crate::core::Interrupt;
use crate::core::context::{Context, Thunk};
use crate::core::nodes::{Expr, Node};
use crate::errors::EvaluationError;
use crate::types::Value;

/// A macro definition, extracted from the template during parsing. The first
/// definition of a name within one parse wins; evaluation never sees later
/// ones.
#[derive(Debug)]
pub(crate) struct Macro {
    /// Line the definition starts on, used in error traces.
    pub(crate) line: u32,
    pub(crate) name: String,
    pub(crate) params: Vec<String>,
    pub(crate) body: Node,
}

impl Macro {
    pub(crate) fn parameter_count(&self) -> usize {
        self.params.len()
    }

    /// Renders a call to this macro. The arguments are call-by-name: each
    /// formal parameter is bound to a thunk of the argument expression and
    /// the caller's context, so an argument is evaluated once per read of
    /// its parameter, and not at all if the parameter is never read.
    /// `body_content` is the `$bodyContent` value of a `#@name(..)` call.
    pub(crate) fn render_call(
        &self,
        ctx: &Context,
        args: &[Arc<Expr>],
        body_content: Option<Value>,
        out: &mut String,
    ) -> Result<(), Interrupt> {
        trace!("calling macro #{}", self.name);
        let mut thunks = BTreeMap::new();
        for (param, arg) in self.params.iter().zip(args) {
            thunks.insert(param.clone(), Thunk::new(arg.clone(), ctx.clone()));
        }
        let call_ctx = ctx.macro_frame(thunks, body_content);
        match self.body.render(&call_ctx, out) {
            Err(Interrupt::Fail(inner)) => {
                let message = format!(
                    "In macro #{} defined on line {}: {}",
                    self.name, self.line, inner.message
                );
                Err(Interrupt::Fail(EvaluationError::with_cause(
                    message,
                    Box::new(inner),
                )))
            }
            other => other,
        }
    }
}
