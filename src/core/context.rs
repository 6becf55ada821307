use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use log::trace;

use crate::TemplateLoader;
use crate::core::Interrupt;
use crate::core::macros::Macro;
use crate::core::nodes::{Expr, Node};
use crate::types::Value;

/// Restores a variable to the binding it had before a `set_var` call.
pub(crate) type Undo = Box<dyn FnOnce()>;

/// The context of one template evaluation: the variable environment, the
/// macro registry, and the loader for `#parse` targets.
///
/// Contexts form a chain. The root frame holds the variables and macros; each
/// macro call pushes a frame that intercepts reads of the macro's parameters
/// and turns them into call-by-name thunk evaluations. The chain is reference
/// counted so thunks and `#define` blocks can capture the context they were
/// created in.
#[derive(Clone)]
pub(crate) struct Context {
    frame: Rc<Frame>,
}

enum Frame {
    Root(RootFrame),
    Macro(MacroFrame),
}

struct RootFrame {
    vars: RefCell<BTreeMap<String, Value>>,
    macros: RefCell<BTreeMap<String, Arc<Macro>>>,
    loader: Arc<TemplateLoader>,
}

struct MacroFrame {
    /// Macro parameters still bound to their argument expressions. A `#set`
    /// of a parameter removes its entry, shadowing the thunk for the rest of
    /// the call.
    thunks: RefCell<BTreeMap<String, Thunk>>,
    /// The `$bodyContent` value for a `#@name(..) .. #end` invocation.
    body_content: Option<Value>,
    parent: Context,
}

/// A deferred macro argument: the argument expression plus the context of the
/// call site. Reading the parameter evaluates the expression in that context,
/// every time it is read.
#[derive(Clone)]
pub(crate) struct Thunk {
    expr: Arc<Expr>,
    ctx: Context,
}

impl Thunk {
    pub(crate) fn new(expr: Arc<Expr>, ctx: Context) -> Thunk {
        Thunk { expr, ctx }
    }
}

impl Context {
    pub(crate) fn root(
        vars: BTreeMap<String, Value>,
        macros: BTreeMap<String, Arc<Macro>>,
        loader: Arc<TemplateLoader>,
    ) -> Context {
        Context {
            frame: Rc::new(Frame::Root(RootFrame {
                vars: RefCell::new(vars),
                macros: RefCell::new(macros),
                loader,
            })),
        }
    }

    /// Pushes a macro-call frame over this context.
    pub(crate) fn macro_frame(
        &self,
        thunks: BTreeMap<String, Thunk>,
        body_content: Option<Value>,
    ) -> Context {
        Context {
            frame: Rc::new(Frame::Macro(MacroFrame {
                thunks: RefCell::new(thunks),
                body_content,
                parent: self.clone(),
            })),
        }
    }

    /// Looks up a variable. `Ok(None)` means undefined, which is distinct
    /// from being bound to a null value. Reading a macro parameter evaluates
    /// its thunk in the context of the call site, so this can itself fail.
    pub(crate) fn get_var(&self, name: &str) -> Result<Option<Value>, Interrupt> {
        match &*self.frame {
            Frame::Root(root) => Ok(root.vars.borrow().get(name).cloned()),
            Frame::Macro(frame) => {
                if name == "bodyContent"
                    && let Some(body) = &frame.body_content
                {
                    return Ok(Some(body.clone()));
                }
                let thunk = frame.thunks.borrow().get(name).cloned();
                match thunk {
                    // Evaluate in the context where the argument appeared,
                    // never in the callee's. A parameter passed its own name
                    // would otherwise recurse forever.
                    Some(thunk) => thunk.expr.evaluate(&thunk.ctx, false).map(Some),
                    None => frame.parent.get_var(name),
                }
            }
        }
    }

    /// Binds a variable and returns an action restoring the previous binding,
    /// or the previous undefined state. This is how `#foreach` scoping and
    /// macro-parameter shadowing work without an environment stack.
    pub(crate) fn set_var(&self, name: &str, value: Value) -> Undo {
        trace!("set ${name}");
        match &*self.frame {
            Frame::Root(root) => {
                let old = root.vars.borrow_mut().insert(name.to_string(), value);
                let ctx = self.clone();
                let name = name.to_string();
                Box::new(move || {
                    if let Frame::Root(root) = &*ctx.frame {
                        match old {
                            Some(value) => {
                                root.vars.borrow_mut().insert(name, value);
                            }
                            None => {
                                root.vars.borrow_mut().remove(&name);
                            }
                        }
                    }
                })
            }
            Frame::Macro(frame) => {
                // A #set of a macro parameter shadows the thunk with a plain
                // value; the thunk comes back when the undo runs.
                let thunk = frame.thunks.borrow_mut().remove(name);
                let undo_parent = frame.parent.set_var(name, value);
                match thunk {
                    None => undo_parent,
                    Some(thunk) => {
                        let ctx = self.clone();
                        let name = name.to_string();
                        Box::new(move || {
                            undo_parent();
                            if let Frame::Macro(frame) = &*ctx.frame {
                                frame.thunks.borrow_mut().insert(name, thunk);
                            }
                        })
                    }
                }
            }
        }
    }

    fn root_frame(&self) -> &RootFrame {
        match &*self.frame {
            Frame::Root(root) => root,
            Frame::Macro(frame) => frame.parent.root_frame(),
        }
    }

    pub(crate) fn get_macro(&self, name: &str) -> Option<Arc<Macro>> {
        self.root_frame().macros.borrow().get(name).cloned()
    }

    /// Grafts a macro from a `#parse`d template into this evaluation's
    /// registry. The first definition of a name wins.
    pub(crate) fn add_macro_if_absent(&self, name: &str, definition: Arc<Macro>) {
        self.root_frame()
            .macros
            .borrow_mut()
            .entry(name.to_string())
            .or_insert(definition);
    }

    pub(crate) fn loader(&self) -> Arc<TemplateLoader> {
        self.root_frame().loader.clone()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.frame {
            Frame::Root(_) => f.write_str("Context(root)"),
            Frame::Macro(_) => f.write_str("Context(macro)"),
        }
    }
}

/// The value produced by `#define ($x) .. #end`, and by the `$bodyContent` of
/// a `#@macro` call: a template fragment that renders itself on first read,
/// against the context captured when the value was created, and remembers the
/// result.
pub struct BlockValue {
    body: Arc<Node>,
    ctx: Context,
    memo: RefCell<Option<String>>,
}

impl BlockValue {
    pub(crate) fn new(body: Arc<Node>, ctx: Context) -> BlockValue {
        BlockValue {
            body,
            ctx,
            memo: RefCell::new(None),
        }
    }

    /// Renders the block, memoizing the result. A recursive read that happens
    /// while the first render is still in progress renders again, which is
    /// what makes self-referential `#define` bodies terminate on their own
    /// variable updates.
    pub(crate) fn render(&self) -> Result<String, Interrupt> {
        if let Some(memoized) = self.memo.borrow().as_ref() {
            return Ok(memoized.clone());
        }
        let mut output = String::new();
        self.body.render(&self.ctx, &mut output)?;
        *self.memo.borrow_mut() = Some(output.clone());
        Ok(output)
    }

    /// The memoized text, if the block has been rendered already. Used for
    /// diagnostics that must not trigger a render.
    pub(crate) fn memoized(&self) -> Option<String> {
        self.memo.borrow().clone()
    }
}

impl fmt::Debug for BlockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlockValue")
    }
}
