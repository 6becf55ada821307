use std::fmt;
use std::rc::Rc;

use log::debug;

use crate::core::Interrupt;
use crate::core::context::{BlockValue, Context};
use crate::core::nodes::{Constant, Expr, ExprKind, Node, NodeKind, Operator, RefExpr};
use crate::core::objects::{LoopState, MethodFailure, call_builtin_method, key_string};
use crate::errors::where_at;
use crate::parser::Parser;
use crate::types::Value;

impl Node {
    fn fail(&self, message: impl fmt::Display) -> Interrupt {
        Interrupt::fail(&self.resource, self.line, message)
    }

    /// Adds this node's contribution to the output: plain text, one branch of
    /// an `#if`, the value of a reference, and so on.
    pub(crate) fn render(&self, ctx: &Context, out: &mut String) -> Result<(), Interrupt> {
        match &self.kind {
            NodeKind::Cons(nodes) => {
                for node in nodes {
                    node.render(ctx, out)?;
                }
                Ok(())
            }
            NodeKind::Text(text) => {
                out.push_str(text);
                Ok(())
            }
            NodeKind::Comment => Ok(()),
            NodeKind::Expr(expr) => {
                let value = expr.evaluate(ctx, false)?;
                if value.is_null() {
                    if expr.is_silent() {
                        return Ok(());
                    }
                    return Err(self.fail(format!("Null value for {expr}")));
                }
                out.push_str(&value_output(&value)?);
                Ok(())
            }
            NodeKind::If {
                condition,
                true_part,
                false_part,
            } => {
                // Only here is an undefined plain reference quietly false.
                if condition.is_true(ctx, true)? {
                    true_part.render(ctx, out)
                } else {
                    false_part.render(ctx, out)
                }
            }
            NodeKind::ForEach {
                var,
                collection,
                body,
            } => self.render_foreach(var, collection, body, ctx, out),
            NodeKind::Set { var, expr } => {
                let value = expr.evaluate(ctx, false)?;
                // The undo is deliberately dropped; #set rebinds for good.
                let _ = ctx.set_var(var, value);
                Ok(())
            }
            NodeKind::Define { var, body } => {
                let block = BlockValue::new(body.clone(), ctx.clone());
                let _ = ctx.set_var(var, Value::Block(Rc::new(block)));
                Ok(())
            }
            NodeKind::MacroCall { name, args, body } => {
                let Some(definition) = ctx.get_macro(name) else {
                    return Err(self.fail(format!(
                        "#{name} is neither a standard directive nor a macro that has been defined"
                    )));
                };
                if args.len() != definition.parameter_count() {
                    return Err(self.fail(format!(
                        "Wrong number of arguments to #{name}: expected {}, got {}",
                        definition.parameter_count(),
                        args.len()
                    )));
                }
                let body_content = body
                    .as_ref()
                    .map(|body| Value::Block(Rc::new(BlockValue::new(body.clone(), ctx.clone()))));
                definition.render_call(ctx, args, body_content, out)
            }
            NodeKind::Break { scope } => match scope {
                None => Err(Interrupt::Break { for_each: false }),
                Some(scope_expr) => {
                    // The scope is checked by value so that a captured
                    // $foreach works: #set ($f = $foreach) #break($f).
                    let value = scope_expr.evaluate(ctx, false)?;
                    if matches!(value, Value::Loop(_)) {
                        Err(Interrupt::Break { for_each: true })
                    } else {
                        Err(self.fail(format!(
                            "Argument to #break is not a supported scope: {scope_expr}"
                        )))
                    }
                }
            },
            NodeKind::Parse { resource_expr } => self.render_parse(resource_expr, ctx, out),
            NodeKind::Evaluate { expr } => self.render_evaluate(expr, ctx, out),
        }
    }

    fn render_foreach(
        &self,
        var: &str,
        collection: &Expr,
        body: &Node,
        ctx: &Context,
        out: &mut String,
    ) -> Result<(), Interrupt> {
        let value = collection.evaluate(ctx, false)?;
        let items: Vec<Value> = match &value {
            Value::List(list) => list.borrow().clone(),
            Value::Map(map) => map.borrow().values().cloned().collect(),
            Value::Object(object) => match object.try_iter() {
                Some(items) => items,
                None => {
                    return Err(self.fail(format!("Not iterable: {}", lossy_output(&value))));
                }
            },
            // Iterating null quietly does nothing. Bizarre, but part of the
            // behaviour being matched.
            Value::Null => return Ok(()),
            _ => return Err(self.fail(format!("Not iterable: {}", lossy_output(&value)))),
        };
        let state = Rc::new(LoopState::new());
        let undo_var = ctx.set_var(var, Value::Null);
        let undo_foreach = ctx.set_var("foreach", Value::Loop(state.clone()));
        let total = items.len();
        let mut result = Ok(());
        for (index, item) in items.into_iter().enumerate() {
            state.advance(index as i32, index + 1 < total);
            let _ = ctx.set_var(var, item);
            match body.render(ctx, out) {
                Ok(()) => {}
                // Both break flavours stop at the innermost #foreach.
                Err(Interrupt::Break { .. }) => break,
                Err(fail) => {
                    result = Err(fail);
                    break;
                }
            }
        }
        undo_foreach();
        undo_var();
        result
    }

    fn render_parse(
        &self,
        resource_expr: &Expr,
        ctx: &Context,
        out: &mut String,
    ) -> Result<(), Interrupt> {
        let value = resource_expr.evaluate(ctx, false)?;
        let name = match value {
            Value::String(name) => name,
            other => {
                return Err(self.fail(format!(
                    "Argument to #parse must be a string, not {}",
                    other.type_name()
                )));
            }
        };
        debug!("#parse {name}");
        let unit = match ctx.loader().get_or_parse(&name) {
            Ok(unit) => unit,
            Err(cause) => {
                return Err(Interrupt::fail_with_cause(
                    &self.resource,
                    self.line,
                    Box::new(cause),
                ));
            }
        };
        // Lift the nested template's macros into this evaluation, without
        // overriding any name that is already registered, then render its
        // body inline.
        for (name, definition) in &unit.macros {
            ctx.add_macro_if_absent(name, definition.clone());
        }
        match unit.root.render(ctx, out) {
            // An unscoped #break inside the nested template ends only it.
            Err(Interrupt::Break { for_each: false }) => Ok(()),
            other => other,
        }
    }

    fn render_evaluate(&self, expr: &Expr, ctx: &Context, out: &mut String) -> Result<(), Interrupt> {
        let value = expr.evaluate(ctx, false)?;
        let text = match value {
            // #evaluate with a null argument is quietly ignored.
            Value::Null => return Ok(()),
            Value::String(text) => text,
            other => {
                return Err(self.fail(format!(
                    "Argument to #evaluate must be a string: {}",
                    lossy_output(&other)
                )));
            }
        };
        debug!("#evaluate of {} chars", text.len());
        let name = format!(
            "#evaluate {}",
            where_at(self.resource.as_deref(), self.line)
        );
        let unit = match Parser::new(&text, Some(&name)).parse() {
            Ok(unit) => unit,
            Err(cause) => {
                return Err(Interrupt::fail_with_cause(
                    &self.resource,
                    self.line,
                    Box::new(cause),
                ));
            }
        };
        // Macros defined by the evaluated fragment are discarded with it.
        match unit.root.render(ctx, out) {
            Err(Interrupt::Break { for_each: false }) => Ok(()),
            other => other,
        }
    }
}

impl Expr {
    fn fail(&self, message: impl fmt::Display) -> Interrupt {
        Interrupt::fail(&self.resource, self.line, message)
    }

    /// Evaluates this expression to a value.
    ///
    /// `undefined_is_false` is true only while evaluating an `#if` condition;
    /// it makes a bare undefined `$var` act as false instead of erroring. The
    /// flag tunnels through `&&`, `||` and `!` but nothing else.
    pub(crate) fn evaluate(
        &self,
        ctx: &Context,
        undefined_is_false: bool,
    ) -> Result<Value, Interrupt> {
        match &self.kind {
            ExprKind::Constant(constant) => Ok(match constant {
                Constant::Null => Value::Null,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Int(i) => Value::Int(*i),
            }),
            ExprKind::StringLiteral { nodes, .. } => {
                let mut rendered = String::new();
                for node in nodes {
                    node.render(ctx, &mut rendered)?;
                }
                Ok(Value::String(rendered))
            }
            ExprKind::ListLiteral(elements) => {
                let mut items = Vec::with_capacity(elements.len());
                for element in elements {
                    items.push(element.evaluate(ctx, false)?);
                }
                Ok(Value::list(items))
            }
            ExprKind::RangeLiteral { first, last } => {
                let from = self.range_bound(first, ctx)?;
                let to = self.range_bound(last, ctx)?;
                let items: Vec<Value> = if from <= to {
                    (from..=to).map(Value::Int).collect()
                } else {
                    (to..=from).rev().map(Value::Int).collect()
                };
                Ok(Value::list(items))
            }
            ExprKind::Binary { lhs, op, rhs } => {
                self.evaluate_binary(lhs, *op, rhs, ctx, undefined_is_false)
            }
            ExprKind::Not(expr) => Ok(Value::Bool(!expr.is_true(ctx, undefined_is_false)?)),
            ExprKind::Ref(reference) => self.eval_ref(reference, ctx, undefined_is_false),
        }
    }

    pub(crate) fn is_true(&self, ctx: &Context, undefined_is_false: bool) -> Result<bool, Interrupt> {
        Ok(self.evaluate(ctx, undefined_is_false)?.is_true())
    }

    /// The integer value of this expression, `None` for null. Anything else
    /// is outside the arithmetic domain.
    fn int_value(&self, ctx: &Context) -> Result<Option<i32>, Interrupt> {
        match self.evaluate(ctx, false)? {
            Value::Null => Ok(None),
            Value::Int(i) => Ok(Some(i)),
            other => Err(self.fail(format!(
                "Arithmetic is only available on integers, not {}",
                show(&other)
            ))),
        }
    }

    fn range_bound(&self, bound: &Expr, ctx: &Context) -> Result<i32, Interrupt> {
        match bound.int_value(ctx)? {
            Some(i) => Ok(i),
            None => Err(self.fail(format!("Range bound {bound} must not be null"))),
        }
    }

    fn evaluate_binary(
        &self,
        lhs: &Expr,
        op: Operator,
        rhs: &Expr,
        ctx: &Context,
        undefined_is_false: bool,
    ) -> Result<Value, Interrupt> {
        match op {
            Operator::Or => {
                if lhs.is_true(ctx, undefined_is_false)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(rhs.is_true(ctx, undefined_is_false)?))
            }
            Operator::And => {
                if !lhs.is_true(ctx, undefined_is_false)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(rhs.is_true(ctx, undefined_is_false)?))
            }
            Operator::Equal => Ok(Value::Bool(self.values_equal(lhs, rhs, ctx)?)),
            Operator::NotEqual => Ok(Value::Bool(!self.values_equal(lhs, rhs, ctx)?)),
            Operator::Plus => self.plus(lhs, rhs, ctx),
            _ => {
                let left = lhs.int_value(ctx)?;
                let right = rhs.int_value(ctx)?;
                let (Some(left), Some(right)) = (left, right) else {
                    if op.is_inequality() {
                        // If both are null, only the left one is reported.
                        let (side, operand): (_, &Expr) = if left.is_none() {
                            ("Left", lhs)
                        } else {
                            ("Right", rhs)
                        };
                        return Err(self.fail(format!(
                            "{side} operand {operand} of {op} must not be null"
                        )));
                    }
                    // Null quietly propagates through the other arithmetic.
                    return Ok(Value::Null);
                };
                Ok(match op {
                    Operator::Less => Value::Bool(left < right),
                    Operator::LessOrEqual => Value::Bool(left <= right),
                    Operator::Greater => Value::Bool(left > right),
                    Operator::GreaterOrEqual => Value::Bool(left >= right),
                    Operator::Minus => Value::Int(left.wrapping_sub(right)),
                    Operator::Times => Value::Int(left.wrapping_mul(right)),
                    // Division and remainder by zero are quietly null, not
                    // an error.
                    Operator::Divide if right == 0 => Value::Null,
                    Operator::Divide => Value::Int(left.wrapping_div(right)),
                    Operator::Remainder if right == 0 => Value::Null,
                    Operator::Remainder => Value::Int(left.wrapping_rem(right)),
                    Operator::Or
                    | Operator::And
                    | Operator::Equal
                    | Operator::NotEqual
                    | Operator::Plus => unreachable!("handled above"),
                })
            }
        }
    }

    /// The non-transitive equality rule: identity, then the null cases, then
    /// structural equality for same-type values, then comparison of string
    /// forms for different types. So `123 == "123"` even though the two
    /// sides' types differ, and deliberately so.
    fn values_equal(&self, lhs: &Expr, rhs: &Expr, ctx: &Context) -> Result<bool, Interrupt> {
        let left = lhs.evaluate(ctx, false)?;
        let right = rhs.evaluate(ctx, false)?;
        if left.same_identity(&right) {
            return Ok(true);
        }
        match (&left, &right) {
            (Value::Null, Value::Null) => Ok(true),
            (Value::Null, _) | (_, Value::Null) => Ok(false),
            _ if std::mem::discriminant(&left) == std::mem::discriminant(&right) => {
                Ok(left.strict_equals(&right))
            }
            _ => Ok(value_output(&left)? == value_output(&right)?),
        }
    }

    /// `+` is integer addition unless either operand is a string, in which
    /// case it is concatenation. A null operand in a concatenation is
    /// replaced by the source text of the expression that produced it, which
    /// is why every expression can print itself.
    fn plus(&self, lhs: &Expr, rhs: &Expr, ctx: &Context) -> Result<Value, Interrupt> {
        let left = lhs.evaluate(ctx, false)?;
        let right = rhs.evaluate(ctx, false)?;
        if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) {
            let left_text = if left.is_null() {
                lhs.to_string()
            } else {
                value_output(&left)?
            };
            let right_text = if right.is_null() {
                rhs.to_string()
            } else {
                value_output(&right)?
            };
            return Ok(Value::String(format!("{left_text}{right_text}")));
        }
        if left.is_null() || right.is_null() {
            return Ok(Value::Null);
        }
        match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
            _ => Err(self.fail(format!(
                "Operands of + must both be integers, or at least one must be a string: {} + {}",
                show(&left),
                show(&right)
            ))),
        }
    }

    fn eval_ref(
        &self,
        reference: &RefExpr,
        ctx: &Context,
        undefined_is_false: bool,
    ) -> Result<Value, Interrupt> {
        match reference {
            RefExpr::Plain { id, silent } => match ctx.get_var(id)? {
                Some(value) => Ok(value),
                None if undefined_is_false || *silent => Ok(Value::Null),
                None => Err(self.fail(format!("Undefined reference ${id}"))),
            },
            RefExpr::Member { lhs, id, silent } => {
                let base = self.eval_ref(lhs, ctx, false)?;
                match self.null_or_block(reference, lhs, &base, *silent)? {
                    Chained::Done(value) => Ok(value),
                    Chained::Base(base) => self.property_of(reference, &base, id),
                }
            }
            RefExpr::Method {
                lhs,
                id,
                args,
                silent,
            } => {
                let base = self.eval_ref(lhs, ctx, false)?;
                match self.null_or_block(reference, lhs, &base, *silent)? {
                    Chained::Done(value) => Ok(value),
                    Chained::Base(base) => {
                        let mut arg_values = Vec::with_capacity(args.len());
                        for arg in args {
                            arg_values.push(arg.evaluate(ctx, false)?);
                        }
                        self.call_method(reference, &base, id, &arg_values)
                    }
                }
            }
            RefExpr::Index { lhs, index, silent } => {
                let base = self.eval_ref(lhs, ctx, false)?;
                match self.null_or_block(reference, lhs, &base, *silent)? {
                    Chained::Done(value) => Ok(value),
                    Chained::Base(base) => self.index_into(reference, &base, index, ctx),
                }
            }
        }
    }

    /// Common guards for the chained reference forms: a null left-hand side
    /// is an error unless the chain is silent, and a `#define` block cannot
    /// be dereferenced at all.
    fn null_or_block(
        &self,
        reference: &RefExpr,
        lhs: &RefExpr,
        base: &Value,
        silent: bool,
    ) -> Result<Chained, Interrupt> {
        if base.is_null() {
            if silent {
                return Ok(Chained::Done(Value::Null));
            }
            return Err(self.fail(format!("In {reference}: {lhs} must not be null")));
        }
        if matches!(base, Value::Block(_)) {
            return Err(self.fail(format!(
                "In {reference}: {lhs} comes from #define and cannot be dereferenced"
            )));
        }
        Ok(Chained::Base(base.clone()))
    }

    fn property_of(&self, reference: &RefExpr, base: &Value, id: &str) -> Result<Value, Interrupt> {
        match base {
            // A map property is the key, looked up directly. An absent key
            // is a null value, never an error.
            Value::Map(map) => Ok(map.borrow().get(id).cloned().unwrap_or(Value::Null)),
            Value::Loop(state) => state.property(id).ok_or_else(|| {
                self.fail(format!(
                    "In {reference}: member {id} does not correspond to a property of the loop state"
                ))
            }),
            Value::Object(object) => match object.get_property(id) {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(self.fail(format!(
                    "In {reference}: member {id} does not correspond to a property of {}",
                    object.display()
                ))),
                Err(message) => Err(self.fail(format!("In {reference}: {message}"))),
            },
            Value::String(s) if id == "empty" => Ok(Value::Bool(s.is_empty())),
            Value::List(list) if id == "empty" => Ok(Value::Bool(list.borrow().is_empty())),
            _ => Err(self.fail(format!(
                "In {reference}: member {id} does not correspond to a property of {} (a {})",
                lossy_output(base),
                base.type_name()
            ))),
        }
    }

    fn call_method(
        &self,
        reference: &RefExpr,
        base: &Value,
        id: &str,
        args: &[Value],
    ) -> Result<Value, Interrupt> {
        match call_builtin_method(base, id, args) {
            Ok(value) => Ok(value),
            Err(MethodFailure::NoSuchMethod) => Err(self.fail(format!(
                "In {reference}: no method {id} in {}",
                base.type_name()
            ))),
            Err(MethodFailure::WrongArgumentTypes) => {
                let shown: Vec<String> = args.iter().map(lossy_output).collect();
                Err(self.fail(format!(
                    "In {reference}: parameters for method {id} have wrong types: [{}]",
                    shown.join(", ")
                )))
            }
            Err(MethodFailure::Failed(message)) => {
                Err(self.fail(format!("In {reference}: {message}")))
            }
        }
    }

    fn index_into(
        &self,
        reference: &RefExpr,
        base: &Value,
        index: &Expr,
        ctx: &Context,
    ) -> Result<Value, Interrupt> {
        let key = index.evaluate(ctx, false)?;
        match base {
            Value::List(list) => {
                let Value::Int(i) = &key else {
                    return Err(self.fail(format!(
                        "In {reference}: list index is not an Integer: {}",
                        lossy_output(&key)
                    )));
                };
                let i = *i;
                let list = list.borrow();
                let size = list.len() as i32;
                // A negative index counts from the end of the list.
                let position = if i < 0 {
                    let position = i + size;
                    if position < 0 {
                        return Err(self.fail(format!(
                            "In {reference}: negative list index {i} counts from the end of \
                             the list, but the list size is only {size}"
                        )));
                    }
                    position
                } else {
                    if i >= size {
                        return Err(self.fail(format!(
                            "In {reference}: list index {i} is not valid for list of size {size}"
                        )));
                    }
                    i
                };
                Ok(list[position as usize].clone())
            }
            Value::Map(map) => Ok(map
                .borrow()
                .get(&key_string(&key))
                .cloned()
                .unwrap_or(Value::Null)),
            // Everything else is treated as the equivalent get(key) call.
            _ => self.call_method(reference, base, "get", &[key]),
        }
    }
}

enum Chained {
    /// The chain short-circuited to this value.
    Done(Value),
    /// The left-hand value to continue the chain on.
    Base(Value),
}

/// The string a value contributes to template output, to concatenation, and
/// to cross-type equality. Rendering a `#define` block can itself fail, so
/// this is fallible.
pub(crate) fn value_output(value: &Value) -> Result<String, Interrupt> {
    Ok(match value {
        // A bare null never reaches the output; this form only appears when
        // a null sits inside a rendered collection.
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::String(s) => s.clone(),
        Value::List(list) => {
            let mut parts = Vec::with_capacity(list.borrow().len());
            for item in list.borrow().iter() {
                parts.push(value_output(item)?);
            }
            format!("[{}]", parts.join(", "))
        }
        Value::Map(map) => {
            let mut parts = Vec::with_capacity(map.borrow().len());
            for (key, item) in map.borrow().iter() {
                parts.push(format!("{key}={}", value_output(item)?));
            }
            format!("{{{}}}", parts.join(", "))
        }
        Value::Object(object) => object.display(),
        Value::Loop(_) => "{}".to_string(),
        Value::Block(block) => block.render()?,
    })
}

/// Like [`value_output`] but never renders anything, for use inside error
/// messages. A not-yet-rendered `#define` block shows a placeholder.
pub(crate) fn lossy_output(value: &Value) -> String {
    match value {
        Value::Block(block) => block
            .memoized()
            .unwrap_or_else(|| "#define block".to_string()),
        Value::List(list) => {
            let parts: Vec<String> = list.borrow().iter().map(lossy_output).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Map(map) => {
            let parts: Vec<String> = map
                .borrow()
                .iter()
                .map(|(key, item)| format!("{key}={}", lossy_output(item)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::String(s) => s.clone(),
        Value::Object(object) => object.display(),
        Value::Loop(_) => "{}".to_string(),
    }
}

/// A value and its type, for error messages.
fn show(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        other => format!("{} (a {})", lossy_output(other), other.type_name()),
    }
}
