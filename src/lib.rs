//! velvet: a tree-walking template engine that reproduces, character for
//! character, the output of the Velocity template language for the subset it
//! supports, including the documented and undocumented quirks: whitespace
//! elision around `#set`, non-transitive equality, and null-propagation rules
//! that are distinct from plain nulls.
//!
//! A template is parsed once into an immutable tree and can then be evaluated
//! any number of times, concurrently if desired, against different variables:
//!
//! ```
//! use velvet::Template;
//!
//! let template = Template::parse("Hello, $name!").unwrap();
//! let output = template
//!     .evaluate_json(&serde_json::json!({ "name": "world" }))
//!     .unwrap();
//! assert_eq!(output, "Hello, world!");
//! ```
//!
//! Values of arbitrary host types take part through the [`HostObject`]
//! collaborator trait, and `#parse`/`#evaluate` resolve their targets through
//! a [`ResourceOpener`].

pub mod errors;
pub mod types;

mod core;
mod parser;
mod scanner;
mod spacing;
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, trace};

pub use crate::core::context::BlockValue;
pub use crate::core::objects::{HostObject, LoopState};
pub use crate::errors::{EvaluationError, ParseError, TemplateError};
pub use crate::types::Value;

use crate::core::Interrupt;
use crate::core::context::Context;
use crate::core::macros::Macro;
use crate::core::nodes::Node;
use crate::parser::Parser;

/// Opens named template resources for the entry template and for every
/// `#parse` target. The one external capability the engine needs.
pub trait ResourceOpener: Send + Sync {
    /// Returns the source text of the named resource. The name is `None`
    /// only when an entry template was parsed without a name.
    fn open_resource(&self, resource_name: Option<&str>) -> io::Result<String>;
}

/// The opener installed by [`Template::parse`]: every named resource fails.
struct NoResources;

impl ResourceOpener for NoResources {
    fn open_resource(&self, resource_name: Option<&str>) -> io::Result<String> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!(
                "no resource opener has been configured to read {}",
                resource_name.unwrap_or("the template")
            ),
        ))
    }
}

/// One parsed template body: the root of the tree plus the macros extracted
/// from it during parsing.
pub(crate) struct TemplateUnit {
    pub(crate) root: Node,
    pub(crate) macros: BTreeMap<String, Arc<Macro>>,
}

/// Resolves `#parse` targets to parsed units, at most once per name for the
/// lifetime of one [`Template`]. The cache is shared by nested parses and by
/// concurrent evaluations, so get-or-insert runs under a lock.
pub(crate) struct TemplateLoader {
    opener: Box<dyn ResourceOpener>,
    cache: Mutex<HashMap<String, Arc<TemplateUnit>>>,
}

impl TemplateLoader {
    fn new(opener: Box<dyn ResourceOpener>) -> TemplateLoader {
        TemplateLoader {
            opener,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get_or_parse(&self, name: &str) -> Result<Arc<TemplateUnit>, TemplateError> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(unit) = cache.get(name) {
            trace!("parse cache hit for {name}");
            return Ok(unit.clone());
        }
        debug!("opening and parsing nested template {name}");
        let source =
            self.opener
                .open_resource(Some(name))
                .map_err(|source| TemplateError::Resource {
                    name: name.to_string(),
                    source,
                })?;
        let unit = Arc::new(Parser::new(&source, Some(name)).parse()?);
        cache.insert(name.to_string(), unit.clone());
        Ok(unit)
    }
}

/// A parsed template. Immutable, and safe to evaluate repeatedly and
/// concurrently: every evaluation gets its own variable environment and its
/// own copy of the macro registry, so macros grafted in by one evaluation's
/// `#parse` directives never leak into another.
pub struct Template {
    unit: Arc<TemplateUnit>,
    loader: Arc<TemplateLoader>,
}

impl Template {
    /// Parses a template from source text. The template cannot reference
    /// other resources; for `#parse` to work, use
    /// [`Template::parse_resource`].
    pub fn parse(source: &str) -> Result<Template, TemplateError> {
        let unit = Parser::new(source, None).parse()?;
        Ok(Template {
            unit: Arc::new(unit),
            loader: Arc::new(TemplateLoader::new(Box::new(NoResources))),
        })
    }

    /// Parses the named template, reading it and every `#parse` target
    /// through `opener`.
    pub fn parse_resource(
        resource_name: &str,
        opener: impl ResourceOpener + 'static,
    ) -> Result<Template, TemplateError> {
        let source = opener
            .open_resource(Some(resource_name))
            .map_err(|source| TemplateError::Resource {
                name: resource_name.to_string(),
                source,
            })?;
        let unit = Parser::new(&source, Some(resource_name)).parse()?;
        Ok(Template {
            unit: Arc::new(unit),
            loader: Arc::new(TemplateLoader::new(Box::new(opener))),
        })
    }

    /// Evaluates the template against the given variables and returns the
    /// rendered output. The caller's map is not modified; `#set` affects
    /// only the evaluation's own environment.
    pub fn evaluate(&self, vars: &BTreeMap<String, Value>) -> Result<String, EvaluationError> {
        let context = Context::root(
            vars.clone(),
            self.unit.macros.clone(),
            self.loader.clone(),
        );
        let mut output = String::new();
        match self.unit.root.render(&context, &mut output) {
            Ok(()) => Ok(output),
            // An unscoped #break that reaches the top just ends the
            // template, keeping what was rendered so far.
            Err(Interrupt::Break { for_each: false }) => Ok(output),
            Err(Interrupt::Break { for_each: true }) => Err(EvaluationError::new(
                "#break($foreach) is not inside a #foreach",
            )),
            Err(Interrupt::Fail(error)) => Err(error),
        }
    }

    /// Convenience form of [`Template::evaluate`] taking the variables as a
    /// JSON object.
    pub fn evaluate_json(&self, vars: &serde_json::Value) -> Result<String, EvaluationError> {
        let serde_json::Value::Object(map) = vars else {
            return Err(EvaluationError::new(
                "template variables must be a JSON object",
            ));
        };
        let vars: BTreeMap<String, Value> = map
            .iter()
            .map(|(name, value)| (name.clone(), Value::from(value)))
            .collect();
        self.evaluate(&vars)
    }
}
