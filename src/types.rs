use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::core::context::BlockValue;
use crate::core::objects::{HostObject, LoopState};

/// A value flowing through template evaluation: the initial variables, every
/// intermediate expression result, and everything handed to or received from
/// the host-value collaborator.
///
/// Lists and maps carry interior mutability because template method calls can
/// mutate them (`$list.add(..)`, `$map.put(..)`), and call-by-name macro
/// arguments are observable exactly through such side effects.
#[derive(Clone, Debug)]
pub enum Value {
    /// A present-but-null value. Distinct from an undefined variable.
    Null,
    Bool(bool),
    /// Machine integer. The only arithmetic domain the engine supports.
    Int(i32),
    String(String),
    List(Rc<RefCell<Vec<Value>>>),
    /// String-keyed map. Property access on a map is direct key lookup.
    Map(Rc<RefCell<BTreeMap<String, Value>>>),
    /// A caller-supplied object resolved through the [`HostObject`] collaborator.
    Object(Rc<dyn HostObject>),
    /// The `$foreach` loop-state value, live only during a `#foreach` body.
    Loop(Rc<LoopState>),
    /// The lazily rendered value produced by `#define` and `$bodyContent`.
    Block(Rc<BlockValue>),
}

impl Value {
    pub fn list(values: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(values)))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Value {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn object(object: impl HostObject + 'static) -> Value {
        Value::Object(Rc::new(object))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Velocity truthiness: false iff null or the boolean false. Empty
    /// strings and empty collections are true.
    pub(crate) fn is_true(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            _ => true,
        }
    }

    /// Type label used in error messages.
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Loop(_) => "loop state",
            Value::Block(_) => "block",
        }
    }

    /// Identity in the sense of the reference equality rule: shared-state
    /// values compare by pointer, everything else has no identity of its own.
    pub(crate) fn same_identity(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Loop(a), Value::Loop(b)) => Rc::ptr_eq(a, b),
            (Value::Block(a), Value::Block(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Structural equality between values of the same runtime type, the way
    /// the host language's own `equals` would see them. Values of different
    /// types are never strictly equal; the cross-type string comparison lives
    /// in the evaluator.
    pub(crate) fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.strict_equals(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.strict_equals(vb))
            }
            _ => self.same_identity(other),
        }
    }
}

// Conversions from plain Rust values into engine values.
macro_rules! impl_value_from {
    ($variant:ident, $type:ty) => {
        impl From<$type> for Value {
            fn from(value: $type) -> Value {
                Value::$variant(value.into())
            }
        }
    };
}

impl_value_from!(Bool, bool);
impl_value_from!(Int, i32);
impl_value_from!(String, String);
impl_value_from!(String, &str);

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Value {
        Value::list(values)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Value {
        Value::map(entries)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Value {
        Value::from(&value)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(number) => from_number(number),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(values) => {
                Value::list(values.iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Numbers representable as `i32` become integers; anything wider, and
/// floats, are carried as their decimal text. They still display and compare
/// across types through their string form, but arithmetic on them raises the
/// integers-only error, which matches the documented arithmetic domain.
fn from_number(number: &serde_json::Number) -> Value {
    if let Some(i) = number.as_i64()
        && let Ok(i) = i32::try_from(i)
    {
        return Value::Int(i);
    }
    Value::String(number.to_string())
}
