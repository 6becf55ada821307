pub(crate) mod context;
pub(crate) mod eval;
pub(crate) mod macros;
pub(crate) mod nodes;
pub(crate) mod objects;

use crate::core::nodes::ResourceName;
use crate::errors::{EvaluationError, where_at};

/// Why rendering stopped early. `Break` is the non-local control-flow signal
/// raised by `#break`; it is caught at the matching scope boundary and never
/// escapes an evaluation. `Fail` aborts the whole evaluation.
#[derive(Debug)]
pub(crate) enum Interrupt {
    Break {
        /// True for `#break($foreach)`, which only an enclosing `#foreach`
        /// may catch.
        for_each: bool,
    },
    Fail(EvaluationError),
}

impl Interrupt {
    pub(crate) fn fail(
        resource: &ResourceName,
        line: u32,
        message: impl std::fmt::Display,
    ) -> Interrupt {
        Interrupt::Fail(EvaluationError::new(format!(
            "In expression {}: {message}",
            where_at(resource.as_deref(), line)
        )))
    }

    pub(crate) fn fail_with_cause(
        resource: &ResourceName,
        line: u32,
        cause: Box<dyn std::error::Error + Send + Sync>,
    ) -> Interrupt {
        Interrupt::Fail(EvaluationError::with_cause(
            format!(
                "In expression {}: {cause}",
                where_at(resource.as_deref(), line)
            ),
            cause,
        ))
    }
}
