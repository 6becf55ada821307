use std::fmt;
use std::io;

use thiserror::Error;

/// Formats a source position as `on line N` or `on line N of <resource>`.
pub(crate) fn where_at(resource: Option<&str>, line: u32) -> String {
    match resource {
        Some(name) => format!("on line {line} of {name}"),
        None => format!("on line {line}"),
    }
}

/// An error raised while building the tree. Always fatal to that parse; there
/// is no recovery or resynchronisation.
#[derive(Debug)]
pub struct ParseError {
    pub(crate) message: String,
    pub(crate) resource: Option<String>,
    pub(crate) line: u32,
    /// Up to 20 characters of source following the error position, or `EOF`.
    pub(crate) context: Option<String>,
}

impl ParseError {
    pub(crate) fn new(
        message: impl Into<String>,
        resource: Option<&str>,
        line: u32,
        context: Option<String>,
    ) -> Self {
        ParseError {
            message: message.into(),
            resource: resource.map(str::to_owned),
            line,
            context,
        }
    }

    /// Line number the error was reported on.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Name of the resource being parsed, if the template had one.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}",
            self.message,
            where_at(self.resource.as_deref(), self.line)
        )?;
        if let Some(context) = &self.context {
            write!(f, ", at text starting: {context}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// An error raised while rendering a parsed template. The message carries the
/// location of the node that failed; errors surfaced from collaborators (a
/// failed `#parse` resource open, a nested parse failure) are preserved as
/// the `source` cause.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EvaluationError {
    pub(crate) message: String,
    #[source]
    pub(crate) cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EvaluationError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        EvaluationError {
            message: message.into(),
            cause: None,
        }
    }

    pub(crate) fn with_cause(
        message: impl Into<String>,
        cause: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        EvaluationError {
            message: message.into(),
            cause: Some(cause),
        }
    }
}

/// Umbrella error for the parse entry points.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    /// The resource opener failed to produce the template source.
    #[error("failed to open template resource {name:?}: {source}")]
    Resource {
        name: String,
        #[source]
        source: io::Error,
    },
}
