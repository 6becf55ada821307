use std::cell::Cell;
use std::fmt::Debug;

use crate::core::eval::lossy_output;
use crate::types::Value;

/// The host-value collaborator: lets template expressions read properties of,
/// and call methods on, caller-supplied values whose structure the engine
/// does not define.
///
/// Implementations must be deterministic for a given (value, name, argument
/// types) triple and are free to cache their own lookups. Name matching is
/// the implementation's business; one mirroring Velocity's lookup rules
/// would try the literal name and the name with its initial letter
/// case-flipped.
pub trait HostObject: Debug {
    /// Looks up a zero-argument property. `Ok(None)` is the distinguishable
    /// "no such member" outcome; a present-but-null property is
    /// `Ok(Some(Value::Null))`.
    fn get_property(&self, name: &str) -> Result<Option<Value>, String>;

    /// Calls a method with already-evaluated argument values. `Ok(None)`
    /// means no method of that name exists. `Err` carries a host-reported
    /// failure, such as an ambiguous-overload message, verbatim.
    fn call_method(&self, name: &str, args: &[Value]) -> Result<Option<Value>, String>;

    /// The string form used when the object is rendered into output,
    /// concatenated, or compared across types.
    fn display(&self) -> String;

    /// The object's elements, if it can be iterated by `#foreach`.
    fn try_iter(&self) -> Option<Vec<Value>> {
        None
    }
}

/// The loop-state value bound to `$foreach` while a `#foreach` body runs.
/// The cells are shared with the running loop, so a captured `$foreach`
/// keeps showing the loop's latest position.
#[derive(Debug)]
pub struct LoopState {
    index: Cell<i32>,
    has_next: Cell<bool>,
}

impl LoopState {
    pub(crate) fn new() -> LoopState {
        LoopState {
            index: Cell::new(-1),
            has_next: Cell::new(false),
        }
    }

    pub(crate) fn advance(&self, index: i32, has_next: bool) {
        self.index.set(index);
        self.has_next.set(has_next);
    }

    pub(crate) fn property(&self, name: &str) -> Option<Value> {
        match name {
            "index" => Some(Value::Int(self.index.get())),
            "count" => Some(Value::Int(self.index.get().wrapping_add(1))),
            "hasNext" => Some(Value::Bool(self.has_next.get())),
            "first" => Some(Value::Bool(self.index.get() == 0)),
            "last" => Some(Value::Bool(!self.has_next.get())),
            _ => None,
        }
    }
}

/// Why a built-in method dispatch failed.
pub(crate) enum MethodFailure {
    NoSuchMethod,
    WrongArgumentTypes,
    /// A failure reported by the method itself or by a host object, already
    /// phrased as a message.
    Failed(String),
}

fn int_arg(args: &[Value], i: usize) -> Option<i32> {
    match args.get(i) {
        Some(Value::Int(n)) => Some(*n),
        _ => None,
    }
}

fn str_arg<'a>(args: &'a [Value], i: usize) -> Option<&'a str> {
    match args.get(i) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// The canonical string form of a value used as a map key.
pub(crate) fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => lossy_output(other),
    }
}

/// Calls a method on one of the engine's own value types, covering the
/// methods Velocity templates get from the host platform's strings, lists
/// and maps. Host objects delegate to their [`HostObject`] implementation.
pub(crate) fn call_builtin_method(
    value: &Value,
    name: &str,
    args: &[Value],
) -> Result<Value, MethodFailure> {
    match value {
        Value::String(s) => string_method(s, name, args),
        Value::List(list) => list_method(list, name, args),
        Value::Map(map) => map_method(map, name, args),
        Value::Int(i) => scalar_method(&i.to_string(), value, name, args),
        Value::Bool(b) => scalar_method(&b.to_string(), value, name, args),
        Value::Object(object) => match object.call_method(name, args) {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Err(MethodFailure::NoSuchMethod),
            Err(message) => Err(MethodFailure::Failed(message)),
        },
        Value::Null | Value::Loop(_) | Value::Block(_) => Err(MethodFailure::NoSuchMethod),
    }
}

fn scalar_method(display: &str, value: &Value, name: &str, args: &[Value]) -> Result<Value, MethodFailure> {
    match name {
        "toString" if args.is_empty() => Ok(Value::String(display.to_string())),
        "equals" if args.len() == 1 => Ok(Value::Bool(value.strict_equals(&args[0]))),
        "toString" | "equals" => Err(MethodFailure::WrongArgumentTypes),
        _ => Err(MethodFailure::NoSuchMethod),
    }
}

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Value, MethodFailure> {
    let ok = |value: Value| Ok(value);
    match name {
        "length" if args.is_empty() => ok(Value::Int(s.chars().count() as i32)),
        "isEmpty" if args.is_empty() => ok(Value::Bool(s.is_empty())),
        "toString" if args.is_empty() => ok(Value::String(s.to_string())),
        "trim" if args.is_empty() => ok(Value::String(s.trim().to_string())),
        "toUpperCase" if args.is_empty() => ok(Value::String(s.to_uppercase())),
        "toLowerCase" if args.is_empty() => ok(Value::String(s.to_lowercase())),
        "equals" if args.len() == 1 => {
            ok(Value::Bool(matches!(&args[0], Value::String(t) if t == s)))
        }
        "contains" if args.len() == 1 => match str_arg(args, 0) {
            Some(t) => ok(Value::Bool(s.contains(t))),
            None => Err(MethodFailure::WrongArgumentTypes),
        },
        "startsWith" if args.len() == 1 => match str_arg(args, 0) {
            Some(t) => ok(Value::Bool(s.starts_with(t))),
            None => Err(MethodFailure::WrongArgumentTypes),
        },
        "endsWith" if args.len() == 1 => match str_arg(args, 0) {
            Some(t) => ok(Value::Bool(s.ends_with(t))),
            None => Err(MethodFailure::WrongArgumentTypes),
        },
        "replace" if args.len() == 2 => match (str_arg(args, 0), str_arg(args, 1)) {
            (Some(from), Some(to)) => ok(Value::String(s.replace(from, to))),
            _ => Err(MethodFailure::WrongArgumentTypes),
        },
        "charAt" if args.len() == 1 => match int_arg(args, 0) {
            Some(i) => match usize::try_from(i).ok().and_then(|i| s.chars().nth(i)) {
                Some(c) => ok(Value::String(c.to_string())),
                None => Err(MethodFailure::Failed(format!(
                    "string index out of range: {i}"
                ))),
            },
            None => Err(MethodFailure::WrongArgumentTypes),
        },
        "substring" if args.len() == 1 || args.len() == 2 => {
            let len = s.chars().count() as i32;
            let begin = match int_arg(args, 0) {
                Some(begin) => begin,
                None => return Err(MethodFailure::WrongArgumentTypes),
            };
            let end = if args.len() == 2 {
                match int_arg(args, 1) {
                    Some(end) => end,
                    None => return Err(MethodFailure::WrongArgumentTypes),
                }
            } else {
                len
            };
            if begin < 0 || end > len || begin > end {
                return Err(MethodFailure::Failed(format!(
                    "string index out of range: begin {begin}, end {end}, length {len}"
                )));
            }
            let sub: String = s
                .chars()
                .skip(begin as usize)
                .take((end - begin) as usize)
                .collect();
            ok(Value::String(sub))
        }
        "indexOf" if args.len() == 1 || args.len() == 2 => {
            let needle = match str_arg(args, 0) {
                Some(needle) => needle,
                None => return Err(MethodFailure::WrongArgumentTypes),
            };
            let from = if args.len() == 2 {
                match int_arg(args, 1) {
                    Some(from) => from.max(0) as usize,
                    None => return Err(MethodFailure::WrongArgumentTypes),
                }
            } else {
                0
            };
            ok(Value::Int(char_index_of(s, needle, from)))
        }
        "length" | "isEmpty" | "toString" | "trim" | "toUpperCase" | "toLowerCase"
        | "equals" | "contains" | "startsWith" | "endsWith" | "replace" | "charAt"
        | "substring" | "indexOf" => Err(MethodFailure::WrongArgumentTypes),
        _ => Err(MethodFailure::NoSuchMethod),
    }
}

/// Index of `needle` in `haystack` in characters, starting the search at
/// character `from`, or -1.
fn char_index_of(haystack: &str, needle: &str, from: usize) -> i32 {
    let chars: Vec<char> = haystack.chars().collect();
    if from > chars.len() {
        return -1;
    }
    let tail: String = chars[from..].iter().collect();
    match tail.find(needle) {
        Some(byte_pos) => (from + tail[..byte_pos].chars().count()) as i32,
        None => -1,
    }
}

fn list_method(
    list: &std::rc::Rc<std::cell::RefCell<Vec<Value>>>,
    name: &str,
    args: &[Value],
) -> Result<Value, MethodFailure> {
    match name {
        "size" if args.is_empty() => Ok(Value::Int(list.borrow().len() as i32)),
        "isEmpty" if args.is_empty() => Ok(Value::Bool(list.borrow().is_empty())),
        "add" if args.len() == 1 => {
            list.borrow_mut().push(args[0].clone());
            Ok(Value::Bool(true))
        }
        "contains" if args.len() == 1 => Ok(Value::Bool(
            list.borrow().iter().any(|v| v.strict_equals(&args[0])),
        )),
        "indexOf" if args.len() == 1 => Ok(Value::Int(
            list.borrow()
                .iter()
                .position(|v| v.strict_equals(&args[0]))
                .map_or(-1, |i| i as i32),
        )),
        "get" if args.len() == 1 => match int_arg(args, 0) {
            Some(i) => {
                let list = list.borrow();
                match usize::try_from(i).ok().and_then(|i| list.get(i)) {
                    Some(value) => Ok(value.clone()),
                    None => Err(MethodFailure::Failed(format!(
                        "index {i} out of bounds for list of size {}",
                        list.len()
                    ))),
                }
            }
            None => Err(MethodFailure::WrongArgumentTypes),
        },
        "set" if args.len() == 2 => match int_arg(args, 0) {
            Some(i) => {
                let mut list = list.borrow_mut();
                let len = list.len();
                match usize::try_from(i).ok().filter(|&i| i < len) {
                    Some(i) => {
                        let old = std::mem::replace(&mut list[i], args[1].clone());
                        Ok(old)
                    }
                    None => Err(MethodFailure::Failed(format!(
                        "index {i} out of bounds for list of size {len}"
                    ))),
                }
            }
            None => Err(MethodFailure::WrongArgumentTypes),
        },
        "size" | "isEmpty" | "add" | "contains" | "indexOf" | "get" | "set" => {
            Err(MethodFailure::WrongArgumentTypes)
        }
        _ => Err(MethodFailure::NoSuchMethod),
    }
}

fn map_method(
    map: &std::rc::Rc<std::cell::RefCell<std::collections::BTreeMap<String, Value>>>,
    name: &str,
    args: &[Value],
) -> Result<Value, MethodFailure> {
    match name {
        "size" if args.is_empty() => Ok(Value::Int(map.borrow().len() as i32)),
        "isEmpty" if args.is_empty() => Ok(Value::Bool(map.borrow().is_empty())),
        "get" if args.len() == 1 => Ok(map
            .borrow()
            .get(&key_string(&args[0]))
            .cloned()
            .unwrap_or(Value::Null)),
        "containsKey" if args.len() == 1 => {
            Ok(Value::Bool(map.borrow().contains_key(&key_string(&args[0]))))
        }
        "put" if args.len() == 2 => Ok(map
            .borrow_mut()
            .insert(key_string(&args[0]), args[1].clone())
            .unwrap_or(Value::Null)),
        "remove" if args.len() == 1 => Ok(map
            .borrow_mut()
            .remove(&key_string(&args[0]))
            .unwrap_or(Value::Null)),
        "keySet" if args.is_empty() => Ok(Value::list(
            map.borrow().keys().cloned().map(Value::String).collect(),
        )),
        "values" if args.is_empty() => Ok(Value::list(map.borrow().values().cloned().collect())),
        "size" | "isEmpty" | "get" | "containsKey" | "put" | "remove" | "keySet" | "values" => {
            Err(MethodFailure::WrongArgumentTypes)
        }
        _ => Err(MethodFailure::NoSuchMethod),
    }
}
