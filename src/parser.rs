use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::debug;
use once_cell::sync::Lazy;

use crate::TemplateUnit;
use crate::core::macros::Macro;
use crate::core::nodes::{
    Constant, Expr, ExprKind, Node, NodeKind, Operator, RefExpr, ResourceName,
};
use crate::errors::{ParseError, where_at};
use crate::scanner::Scanner;
use crate::spacing;

/// Directives Velocity has but this engine does not, and that are not
/// necessarily followed by `(`. Seeing one is an error rather than quietly
/// treating it as text. A directive that does need `(` falls out as an
/// undefined macro instead, which is fine.
const UNSUPPORTED_DIRECTIVES: &[&str] = &["stop"];

/// Maps a character to the operators whose symbol starts with it. Where a
/// one-character operator is a prefix of a two-character one, like `<` and
/// `<=`, the one-character operator comes first.
static OPERATOR_TABLE: Lazy<HashMap<char, Vec<Operator>>> = Lazy::new(|| {
    let mut table: HashMap<char, Vec<Operator>> = HashMap::new();
    for op in [
        Operator::Or,
        Operator::And,
        Operator::Equal,
        Operator::NotEqual,
        Operator::Less,
        Operator::LessOrEqual,
        Operator::Greater,
        Operator::GreaterOrEqual,
        Operator::Plus,
        Operator::Minus,
        Operator::Times,
        Operator::Divide,
        Operator::Remainder,
    ] {
        let first = op.symbol().as_bytes()[0] as char;
        table.entry(first).or_default().push(op);
    }
    table
});

/// The synthetic markers that end a span of nodes. They are produced while
/// parsing but never appear in a finished tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopKind {
    End,
    Else,
    ElseIf,
    Eof,
}

impl StopKind {
    fn name(self) -> &'static str {
        match self {
            StopKind::End => "#end",
            StopKind::Else => "#else",
            StopKind::ElseIf => "#elseif",
            StopKind::Eof => "end of file",
        }
    }
}

enum Parsed {
    Node(Node),
    Stop(StopKind),
}

/// A recursive-descent parser with ad-hoc lexing, plus an operator-precedence
/// climb for expressions. Macro definitions are collected here, during the
/// parse, which is why a macro can be called before it is defined.
pub(crate) struct Parser<'a> {
    scanner: Scanner<'a>,
    resource: ResourceName,
    macros: BTreeMap<String, Arc<Macro>>,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(source: &'a str, resource: Option<&str>) -> Parser<'a> {
        Parser {
            scanner: Scanner::new(source),
            resource: resource.map(Arc::from),
            macros: BTreeMap::new(),
        }
    }

    /// Parses the whole input into a template unit: one root node plus the
    /// macros that were defined along the way.
    pub(crate) fn parse(mut self) -> Result<TemplateUnit, ParseError> {
        debug!("parsing template {:?}", self.resource.as_deref());
        let (nodes, _) = self.parse_to_stop(&[StopKind::Eof], || "outside any construct".into())?;
        let root = Node::cons(&self.resource, self.scanner.line(), nodes);
        Ok(TemplateUnit {
            root,
            macros: self.macros,
        })
    }

    fn resource_str(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    fn c(&self) -> Option<char> {
        self.scanner.c()
    }

    /// Builds a parse error at the current position, consuming up to 20
    /// characters of following input as context for the message.
    fn parse_exception(&mut self, message: impl Into<String>) -> ParseError {
        let line = self.scanner.line();
        let context = match self.c() {
            None => "EOF".to_string(),
            Some(_) => {
                let mut context = String::new();
                let mut count = 0;
                while let Some(c) = self.c() {
                    if count == 20 {
                        break;
                    }
                    context.push(c);
                    self.scanner.next();
                    count += 1;
                }
                if self.c().is_some() {
                    context.push_str("...");
                }
                context
            }
        };
        ParseError::new(message, self.resource_str(), line, Some(context))
    }

    /// Skips space, then consumes `expected` or fails.
    fn expect(&mut self, expected: char) -> Result<(), ParseError> {
        self.scanner.skip_space();
        if self.c() == Some(expected) {
            self.scanner.next();
            Ok(())
        } else {
            Err(self.parse_exception(format!("Expected {expected}")))
        }
    }

    /// An identifier: an ASCII letter, then letters, digits, `-` and `_`.
    fn parse_id(&mut self, what: &str) -> Result<String, ParseError> {
        if !matches!(self.c(), Some(c) if c.is_ascii_alphabetic()) {
            return Err(self.parse_exception(format!("{what} should start with an ASCII letter")));
        }
        let mut id = String::new();
        while let Some(c) = self.c() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                id.push(c);
                self.scanner.next();
            } else {
                break;
            }
        }
        Ok(id)
    }

    /// Parses until one of `stops` ends the span. Called recursively for
    /// nested constructs: at the top level the stop is end-of-input, inside
    /// `#foreach` it is the matching `#end`, inside `#if` it can be `#end`,
    /// `#else` or `#elseif`. The `#set` spacing rule is applied as nodes are
    /// appended.
    fn parse_to_stop(
        &mut self,
        stops: &[StopKind],
        describe: impl Fn() -> String,
    ) -> Result<(Vec<Node>, StopKind), ParseError> {
        let mut nodes: Vec<Node> = Vec::new();
        let stop = loop {
            match self.parse_node()? {
                Parsed::Stop(stop) => break stop,
                Parsed::Node(node) => {
                    if node.is_set() && spacing::should_elide_before_set(&nodes) {
                        let last = nodes.len() - 1;
                        nodes[last] = node;
                    } else {
                        nodes.push(node);
                    }
                }
            }
        };
        if !stops.contains(&stop) {
            return Err(self.parse_exception(format!("Found {} {}", stop.name(), describe())));
        }
        Ok((nodes, stop))
    }

    /// Like [`Parser::parse_to_stop`] but first skips a newline, for use
    /// after constructs like `#if (condition)` where a newline directly after
    /// the `)` is not part of the body.
    fn skip_newline_and_parse_to_stop(
        &mut self,
        stops: &[StopKind],
        describe: impl Fn() -> String,
    ) -> Result<(Vec<Node>, StopKind), ParseError> {
        if self.c() == Some('\n') {
            self.scanner.next();
        }
        self.parse_to_stop(stops, describe)
    }

    /// Parses a single node.
    fn parse_node(&mut self) -> Result<Parsed, ParseError> {
        match self.c() {
            Some('#') => {
                self.scanner.next();
                match self.c() {
                    Some('#') => self.parse_line_comment().map(Parsed::Node),
                    Some('*') => self.parse_block_comment().map(Parsed::Node),
                    Some('[') => self.parse_hash_square().map(Parsed::Node),
                    Some('{') => self.parse_directive(),
                    Some('@') => self.parse_macro_call_with_body().map(Parsed::Node),
                    Some(c) if c.is_ascii_alphabetic() => self.parse_directive(),
                    // # not followed by a letter or one of the characters
                    // above is a plain character, so #$foo is a literal #
                    // followed by the reference $foo.
                    _ => self.parse_plain_text("#").map(Parsed::Node),
                }
            }
            None => Ok(Parsed::Stop(StopKind::Eof)),
            Some('$') => self.parse_dollar().map(Parsed::Node),
            Some(c) => {
                self.scanner.next();
                self.parse_plain_text(&c.to_string()).map(Parsed::Node)
            }
        }
    }

    /// We have just seen `#[`, which may or may not open a `#[[quoted
    /// block]]#`. The quoted text is copied to the output with `$` and `#`
    /// uninterpreted.
    fn parse_hash_square(&mut self) -> Result<Node, ParseError> {
        self.scanner.next();
        if self.c() != Some('[') {
            // Not a quoted block after all, just a literal #[ and whatever
            // follows.
            return self.parse_plain_text("#[");
        }
        let start_line = self.scanner.line();
        self.scanner.next();
        let mut quoted = String::new();
        loop {
            match self.c() {
                None => {
                    return Err(ParseError::new(
                        "Unterminated #[[ - did not see matching ]]#",
                        self.resource_str(),
                        start_line,
                        None,
                    ));
                }
                Some('#') if quoted.ends_with("]]") => {
                    self.scanner.next();
                    break;
                }
                Some(c) => {
                    quoted.push(c);
                    self.scanner.next();
                }
            }
        }
        quoted.truncate(quoted.len() - 2);
        Ok(Node::new(
            &self.resource,
            self.scanner.line(),
            NodeKind::Text(quoted),
        ))
    }

    /// Everything that can start with a `$`: a reference, or plain text when
    /// the `$` turns out not to introduce one.
    fn parse_dollar(&mut self) -> Result<Node, ParseError> {
        self.scanner.next();
        let silent = self.c() == Some('!');
        if silent {
            self.scanner.next();
        }
        match self.c() {
            Some(c) if c.is_ascii_alphabetic() || c == '{' => self.parse_reference(silent),
            _ if silent => self.parse_plain_text("$!"),
            _ => self.parse_plain_text("$"),
        }
    }

    /// A reference, optionally brace-delimited. `${x}y` is the reference
    /// `$x` followed by the text `y`; a `.` directly after the closing brace
    /// is never absorbed into the reference.
    fn parse_reference(&mut self, silent: bool) -> Result<Node, ParseError> {
        if self.c() == Some('{') {
            self.scanner.next();
            if !matches!(self.c(), Some(c) if c.is_ascii_alphabetic()) {
                return self.parse_plain_text(if silent { "$!{" } else { "${" });
            }
            let line = self.scanner.line();
            let reference = self.parse_reference_no_brace(silent)?;
            self.expect('}')?;
            Ok(self.ref_node(line, reference))
        } else {
            let line = self.scanner.line();
            let reference = self.parse_reference_no_brace(silent)?;
            Ok(self.ref_node(line, reference))
        }
    }

    fn ref_node(&self, line: u32, reference: RefExpr) -> Node {
        Node::new(
            &self.resource,
            line,
            NodeKind::Expr(Expr::new(&self.resource, line, ExprKind::Ref(reference))),
        )
    }

    /// Like [`Parser::parse_reference`] but in an expression, where the `$`
    /// really must start a reference. `$!` is tolerated here but has no
    /// effect, since null values are allowed in expressions anyway.
    fn parse_required_reference(&mut self) -> Result<RefExpr, ParseError> {
        if self.c() == Some('!') {
            self.scanner.next();
        }
        if self.c() == Some('{') {
            self.scanner.next();
            let reference = self.parse_reference_no_brace(false)?;
            self.expect('}')?;
            Ok(reference)
        } else {
            self.parse_reference_no_brace(false)
        }
    }

    fn parse_reference_no_brace(&mut self, silent: bool) -> Result<RefExpr, ParseError> {
        let id = self.parse_id("Reference")?;
        let lhs = RefExpr::Plain { id, silent };
        self.parse_reference_suffix(lhs, silent)
    }

    /// The suffixes a reference can chain: `.member`, `.method(..)`, and
    /// `[index]`.
    fn parse_reference_suffix(&mut self, lhs: RefExpr, silent: bool) -> Result<RefExpr, ParseError> {
        match self.c() {
            Some('.') => self.parse_reference_member(lhs, silent),
            Some('[') => self.parse_reference_index(lhs, silent),
            _ => Ok(lhs),
        }
    }

    fn parse_reference_member(&mut self, lhs: RefExpr, silent: bool) -> Result<RefExpr, ParseError> {
        self.scanner.next();
        if !matches!(self.c(), Some(c) if c.is_ascii_alphabetic()) {
            // Something like $foo.! turns out not to be a member after all.
            self.scanner.pushback('.');
            return Ok(lhs);
        }
        let id = self.parse_id("Member")?;
        let reference = if self.c() == Some('(') {
            self.parse_reference_method_params(lhs, id, silent)?
        } else {
            RefExpr::Member {
                lhs: Box::new(lhs),
                id,
                silent,
            }
        };
        self.parse_reference_suffix(reference, silent)
    }

    /// Method arguments are primaries, not arbitrary expressions, and this
    /// is the one place a bare `null` is accepted.
    fn parse_reference_method_params(
        &mut self,
        lhs: RefExpr,
        id: String,
        silent: bool,
    ) -> Result<RefExpr, ParseError> {
        self.scanner.next_non_space();
        let mut args = Vec::new();
        if self.c() != Some(')') {
            args.push(self.parse_primary(true)?);
            while self.c() == Some(',') {
                self.scanner.next_non_space();
                args.push(self.parse_primary(true)?);
            }
            if self.c() != Some(')') {
                return Err(self.parse_exception("Expected )"));
            }
        }
        self.scanner.next();
        Ok(RefExpr::Method {
            lhs: Box::new(lhs),
            id,
            args,
            silent,
        })
    }

    fn parse_reference_index(&mut self, lhs: RefExpr, silent: bool) -> Result<RefExpr, ParseError> {
        self.scanner.next();
        let index = self.parse_primary(false)?;
        if self.c() != Some(']') {
            return Err(self.parse_exception("Expected ]"));
        }
        self.scanner.next();
        let reference = RefExpr::Index {
            lhs: Box::new(lhs),
            index: Box::new(index),
            silent,
        };
        self.parse_reference_suffix(reference, silent)
    }

    /// A directive, spelled `#name` or `#{name}`. `#end`, `#else` and
    /// `#elseif` are just stop tokens; everything else parses its complete
    /// construct.
    fn parse_directive(&mut self) -> Result<Parsed, ParseError> {
        let directive = if self.c() == Some('{') {
            self.scanner.next();
            let id = self.parse_id("Directive inside #{...}")?;
            self.expect('}')?;
            id
        } else {
            self.parse_id("Directive")?
        };
        let parsed = match directive.as_str() {
            "end" => Parsed::Stop(StopKind::End),
            "if" => return self.parse_if_or_elseif("#if").map(Parsed::Node),
            "elseif" => Parsed::Stop(StopKind::ElseIf),
            "else" => Parsed::Stop(StopKind::Else),
            "foreach" => return self.parse_foreach().map(Parsed::Node),
            "break" => return self.parse_break().map(Parsed::Node),
            "set" => Parsed::Node(self.parse_set()?),
            "define" => Parsed::Node(self.parse_define()?),
            "parse" => Parsed::Node(self.parse_parse()?),
            "macro" => return self.parse_macro_definition().map(Parsed::Node),
            "evaluate" => return self.parse_evaluate().map(Parsed::Node),
            _ => Parsed::Node(self.parse_macro_call("#", &directive)?),
        };
        // A newline directly after a directive is skipped. The constructs
        // that returned above have already dealt with this at their own
        // boundaries.
        if self.c() == Some('\n') {
            self.scanner.next();
        }
        Ok(parsed)
    }

    /// `#if ( <condition> ) <text> [#elseif (..) ..] [#else ..] #end`,
    /// desugared into nested two-way choices.
    fn parse_if_or_elseif(&mut self, directive: &str) -> Result<Node, ParseError> {
        let start_line = self.scanner.line();
        self.expect('(')?;
        let condition = self.parse_expression()?;
        self.expect(')')?;
        let (true_nodes, stop) = self.skip_newline_and_parse_to_stop(
            &[StopKind::Else, StopKind::ElseIf, StopKind::End],
            || format!("parsing {directive} starting on line {start_line}"),
        )?;
        let true_part = Node::cons(&self.resource, start_line, true_nodes);
        let false_part = match stop {
            StopKind::End => Node::empty(&self.resource, self.scanner.line()),
            StopKind::ElseIf => self.parse_if_or_elseif("#elseif")?,
            StopKind::Else => {
                let else_line = self.scanner.line();
                let (false_nodes, _) = self.parse_to_stop(&[StopKind::End], || {
                    format!("parsing #else starting on line {else_line}")
                })?;
                Node::cons(&self.resource, else_line, false_nodes)
            }
            StopKind::Eof => unreachable!("parse_to_stop only returns requested stops"),
        };
        Ok(Node::new(
            &self.resource,
            start_line,
            NodeKind::If {
                condition,
                true_part: Box::new(true_part),
                false_part: Box::new(false_part),
            },
        ))
    }

    /// `#foreach ( $<id> in <expression> ) <body> #end`
    fn parse_foreach(&mut self) -> Result<Node, ParseError> {
        let start_line = self.scanner.line();
        self.expect('(')?;
        self.scanner.skip_space();
        if self.c() != Some('$') {
            return Err(self.parse_exception("Expected variable beginning with '$' for #foreach"));
        }
        let var_node = self.parse_dollar()?;
        let var = match var_node.kind {
            NodeKind::Expr(Expr {
                kind: ExprKind::Ref(RefExpr::Plain { id, .. }),
                ..
            }) => id,
            _ => return Err(self.parse_exception("Expected simple variable for #foreach")),
        };
        self.scanner.skip_space();
        let mut bad = self.c() != Some('i');
        if !bad {
            self.scanner.next();
            bad = self.c() != Some('n');
        }
        if bad {
            return Err(self.parse_exception("Expected 'in' for #foreach"));
        }
        self.scanner.next();
        let collection = self.parse_expression()?;
        self.expect(')')?;
        let (body_nodes, _) = self.skip_newline_and_parse_to_stop(&[StopKind::End], || {
            format!("parsing #foreach starting on line {start_line}")
        })?;
        let body = Node::cons(&self.resource, start_line, body_nodes);
        Ok(Node::new(
            &self.resource,
            start_line,
            NodeKind::ForEach {
                var,
                collection,
                body: Box::new(body),
            },
        ))
    }

    /// `#break`, with an optional parenthesized scope. Unlike every other
    /// directive the parameter is optional, but the spaces can be discarded
    /// either way: after a #break, following plain text never renders, so
    /// there is also no need to skip a newline here.
    fn parse_break(&mut self) -> Result<Node, ParseError> {
        self.scanner.skip_space();
        let mut scope = None;
        if self.c() == Some('(') {
            self.scanner.next();
            scope = Some(self.parse_primary(false)?);
            self.expect(')')?;
        }
        Ok(Node::new(
            &self.resource,
            self.scanner.line(),
            NodeKind::Break { scope },
        ))
    }

    /// `#set ( $<id> = <expression> )`
    fn parse_set(&mut self) -> Result<Node, ParseError> {
        self.expect('(')?;
        self.expect('$')?;
        let var = self.parse_id("#set variable")?;
        self.expect('=')?;
        let expr = self.parse_expression()?;
        self.expect(')')?;
        let line = expr.line;
        Ok(Node::new(&self.resource, line, NodeKind::Set { var, expr }))
    }

    /// `#define ( $<id> ) <body> #end`
    fn parse_define(&mut self) -> Result<Node, ParseError> {
        let start_line = self.scanner.line();
        self.expect('(')?;
        self.expect('$')?;
        let var = self.parse_id("#define variable")?;
        self.expect(')')?;
        let (body_nodes, _) = self.skip_newline_and_parse_to_stop(&[StopKind::End], || {
            format!("parsing #define starting on line {start_line}")
        })?;
        Ok(Node::new(
            &self.resource,
            start_line,
            NodeKind::Define {
                var,
                body: Arc::new(Node::cons(&self.resource, start_line, body_nodes)),
            },
        ))
    }

    /// `#parse ( <primary> )`. Nothing is opened or parsed here; the
    /// resource is resolved when the template is evaluated, through the
    /// template's parse cache.
    fn parse_parse(&mut self) -> Result<Node, ParseError> {
        let start_line = self.scanner.line();
        self.expect('(')?;
        let resource_expr = self.parse_primary(false)?;
        self.scanner.skip_space();
        self.expect(')')?;
        Ok(Node::new(
            &self.resource,
            start_line,
            NodeKind::Parse { resource_expr },
        ))
    }

    /// `#evaluate ( <primary> )`
    fn parse_evaluate(&mut self) -> Result<Node, ParseError> {
        let start_line = self.scanner.line();
        self.expect('(')?;
        let expr = self.parse_primary(false)?;
        self.expect(')')?;
        if self.c() == Some('\n') {
            self.scanner.next();
        }
        Ok(Node::new(
            &self.resource,
            start_line,
            NodeKind::Evaluate { expr },
        ))
    }

    /// `#macro ( <id> $<p1> $<p2> ... ) <body> #end`, with parameters
    /// optionally separated by commas. The definition is recorded in the
    /// parser's macro table, not in the tree; the first definition of a name
    /// wins.
    fn parse_macro_definition(&mut self) -> Result<Node, ParseError> {
        let start_line = self.scanner.line();
        self.expect('(')?;
        self.scanner.skip_space();
        let name = self.parse_id("Macro name")?;
        let mut parameters = Vec::new();
        loop {
            self.scanner.skip_space();
            if self.c() == Some(')') {
                self.scanner.next();
                break;
            }
            if self.c() == Some(',') {
                self.scanner.next();
                self.scanner.skip_space();
            }
            if self.c() != Some('$') {
                return Err(self.parse_exception("Macro parameters should look like $name"));
            }
            self.scanner.next();
            parameters.push(self.parse_id("Macro parameter name")?);
        }
        let (body_nodes, _) = self.skip_newline_and_parse_to_stop(&[StopKind::End], || {
            format!("parsing #macro starting on line {start_line}")
        })?;
        if !self.macros.contains_key(&name) {
            let mut body_nodes = body_nodes;
            spacing::strip_leading_space_before_set(&mut body_nodes);
            let body = Node::cons(&self.resource, start_line, body_nodes);
            debug!("defining macro #{name}({} parameters)", parameters.len());
            self.macros.insert(
                name.clone(),
                Arc::new(Macro {
                    line: start_line,
                    name,
                    params: parameters,
                    body,
                }),
            );
        }
        Ok(Node::empty(&self.resource, self.scanner.line()))
    }

    /// An identifier after `#` that is not a standard directive, assumed to
    /// be a macro call. Without a following `(` it is plain text, except for
    /// the reserved names handled explicitly.
    fn parse_macro_call(&mut self, prefix: &str, directive: &str) -> Result<Node, ParseError> {
        let start_line = self.scanner.line();
        let mut text = format!("{prefix}{directive}");
        while let Some(c) = self.c() {
            if !c.is_whitespace() {
                break;
            }
            text.push(c);
            self.scanner.next();
        }
        if self.c() != Some('(') {
            if UNSUPPORTED_DIRECTIVES.contains(&directive) {
                return Err(self.parse_exception(format!("#{directive} is not currently supported")));
            }
            // #foo followed by no ( cannot be a macro call and is plain
            // text, but a word beginning with "end" is always rejected.
            if directive.starts_with("end") {
                return Err(self.parse_exception(format!("Unrecognized directive #{directive}")));
            }
            return self.parse_plain_text(&text);
        }
        self.scanner.next();
        let mut args = Vec::new();
        loop {
            self.scanner.skip_space();
            if self.c() == Some(')') {
                self.scanner.next();
                break;
            }
            args.push(Arc::new(self.parse_primary(false)?));
            // An optional comma may separate macro call arguments.
            if self.c() == Some(',') {
                self.scanner.next();
            }
        }
        let body = if prefix == "#" {
            None
        } else {
            let (body_nodes, _) = self.skip_newline_and_parse_to_stop(&[StopKind::End], || {
                format!("#@{directive} starting on line {start_line}")
            })?;
            Some(Arc::new(Node::cons(&self.resource, start_line, body_nodes)))
        };
        Ok(Node::new(
            &self.resource,
            self.scanner.line(),
            NodeKind::MacroCall {
                name: directive.to_string(),
                args,
                body,
            },
        ))
    }

    /// `#@name(args) body #end`: a macro call whose body becomes the
    /// `$bodyContent` of the invocation.
    fn parse_macro_call_with_body(&mut self) -> Result<Node, ParseError> {
        self.scanner.next();
        if !matches!(self.c(), Some(c) if c.is_ascii_alphabetic()) {
            return self.parse_plain_text("#@");
        }
        let id = self.parse_id("#@")?;
        self.parse_macro_call("#@", &id)
    }

    /// `##` up to and including the next newline.
    fn parse_line_comment(&mut self) -> Result<Node, ParseError> {
        let line = self.scanner.line();
        while !matches!(self.c(), Some('\n') | None) {
            self.scanner.next();
        }
        self.scanner.next();
        Ok(Node::new(&self.resource, line, NodeKind::Comment))
    }

    /// `#*` up to and including the next `*#`. A comment left open at the
    /// end of input is not an error.
    fn parse_block_comment(&mut self) -> Result<Node, ParseError> {
        let start_line = self.scanner.line();
        let mut last = '\0';
        self.scanner.next();
        while let Some(c) = self.c() {
            if last == '*' && c == '#' {
                break;
            }
            last = c;
            self.scanner.next();
        }
        self.scanner.next();
        Ok(Node::new(&self.resource, start_line, NodeKind::Comment))
    }

    /// Text containing neither `$` nor `#`, starting with the already
    /// consumed `initial`.
    fn parse_plain_text(&mut self, initial: &str) -> Result<Node, ParseError> {
        let mut text = String::from(initial);
        loop {
            match self.c() {
                None | Some('$') | Some('#') => break,
                Some(c) => {
                    text.push(c);
                    self.scanner.next();
                }
            }
        }
        Ok(Node::new(
            &self.resource,
            self.scanner.line(),
            NodeKind::Text(text),
        ))
    }

    /// An expression, as allowed inside `#if` and `#set` but not inside
    /// reference indexes or method arguments. Operator precedence is handled
    /// by the usual precedence climb.
    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_unary_expression()?;
        let mut current = self.next_operator()?;
        self.parse_binary_rest(lhs, 1, &mut current)
    }

    /// Parses a subexpression whose left-hand side is `lhs`, consuming only
    /// operators of at least `min_precedence`. `current` plays the same role
    /// for operators that the scanner's `c` plays for characters: the one
    /// just scanned, or `None` when what follows is not an operator.
    fn parse_binary_rest(
        &mut self,
        mut lhs: Expr,
        min_precedence: u8,
        current: &mut Option<Operator>,
    ) -> Result<Expr, ParseError> {
        while let Some(op) = *current {
            if op.precedence() < min_precedence {
                break;
            }
            let mut rhs = self.parse_unary_expression()?;
            *current = self.next_operator()?;
            while let Some(next) = *current {
                if next.precedence() <= op.precedence() {
                    break;
                }
                rhs = self.parse_binary_rest(rhs, next.precedence(), current)?;
            }
            lhs = Expr::binary(lhs, op, rhs);
        }
        Ok(lhs)
    }

    /// Scans the next binary operator, or `None` if what follows is not one.
    fn next_operator(&mut self) -> Result<Option<Operator>, ParseError> {
        self.scanner.skip_space();
        match self.c() {
            Some('a') => return self.word_operator("and", Operator::And).map(Some),
            Some('o') => return self.word_operator("or", Operator::Or).map(Some),
            _ => {}
        }
        let Some(first) = self.c() else {
            return Ok(None);
        };
        let Some(candidates) = OPERATOR_TABLE.get(&first) else {
            return Ok(None);
        };
        self.scanner.next();
        let mut operator = None;
        for &candidate in candidates {
            let symbol = candidate.symbol();
            if symbol.len() == 1 {
                operator = Some(candidate);
            } else if self.c() == Some(symbol.as_bytes()[1] as char) {
                self.scanner.next();
                operator = Some(candidate);
            }
        }
        match operator {
            Some(operator) => Ok(Some(operator)),
            None => Err(self.parse_exception(format!(
                "Expected {}, not just {first}",
                candidates[0]
            ))),
        }
    }

    /// The word operators `and` and `or`. Anything else starting with those
    /// letters in operator position is an error.
    fn word_operator(&mut self, symbol: &str, operator: Operator) -> Result<Operator, ParseError> {
        let id = self.parse_id("")?;
        if id == symbol {
            Ok(operator)
        } else {
            Err(self.parse_exception(format!("Expected '{symbol}' but was '{id}'")))
        }
    }

    /// `<primary> | ( <expression> ) | ! <unary-expression>`
    fn parse_unary_expression(&mut self) -> Result<Expr, ParseError> {
        self.scanner.skip_space();
        match self.c() {
            Some('(') => {
                self.scanner.next_non_space();
                let node = self.parse_expression()?;
                self.expect(')')?;
                self.scanner.skip_space();
                Ok(node)
            }
            Some('!') => {
                self.scanner.next();
                let node = Expr::not(self.parse_unary_expression()?);
                self.scanner.skip_space();
                Ok(node)
            }
            _ => self.parse_primary(false),
        }
    }

    /// A primary: a reference or a literal, with no operators. `null` is
    /// accepted only where `null_allowed` says so, which in practice means
    /// method arguments.
    fn parse_primary(&mut self, null_allowed: bool) -> Result<Expr, ParseError> {
        self.scanner.skip_space();
        let line = self.scanner.line();
        let node = match self.c() {
            Some('$') => {
                self.scanner.next();
                let reference = self.parse_required_reference()?;
                Expr::new(&self.resource, line, ExprKind::Ref(reference))
            }
            Some('"') => self.parse_string_literal('"', true)?,
            Some('\'') => self.parse_string_literal('\'', false)?,
            Some('-') => {
                // There is no negation operator; a - here must start a
                // negative integer literal.
                self.scanner.next();
                self.parse_int_literal("-")?
            }
            Some('[') => self.parse_list_literal()?,
            Some(c) if c.is_ascii_digit() => self.parse_int_literal("")?,
            Some(c) if c.is_ascii_alphabetic() => self.parse_word_literal(null_allowed)?,
            _ => return Err(self.parse_exception("Expected a reference or a literal")),
        };
        self.scanner.skip_space();
        Ok(node)
    }

    /// A list literal `[a, b, c]` or a range literal `[a..b]`. Elements are
    /// primaries only; a general expression here is an error, an asymmetry
    /// Velocity has too.
    fn parse_list_literal(&mut self) -> Result<Expr, ParseError> {
        let line = self.scanner.line();
        self.scanner.next_non_space();
        if self.c() == Some(']') {
            self.scanner.next();
            return Ok(Expr::new(
                &self.resource,
                line,
                ExprKind::ListLiteral(Vec::new()),
            ));
        }
        let first = self.parse_primary(false)?;
        if self.c() == Some('.') {
            self.parse_range_literal(line, first)
        } else {
            self.parse_remainder_of_list_literal(line, first)
        }
    }

    fn parse_range_literal(&mut self, line: u32, first: Expr) -> Result<Expr, ParseError> {
        self.scanner.next();
        if self.c() != Some('.') {
            return Err(self.parse_exception("Expected two dots (..) not just one"));
        }
        self.scanner.next_non_space();
        let last = self.parse_primary(false)?;
        if self.c() != Some(']') {
            return Err(self.parse_exception("Expected ] at end of range literal"));
        }
        self.scanner.next_non_space();
        Ok(Expr::new(
            &self.resource,
            line,
            ExprKind::RangeLiteral {
                first: Box::new(first),
                last: Box::new(last),
            },
        ))
    }

    fn parse_remainder_of_list_literal(&mut self, line: u32, first: Expr) -> Result<Expr, ParseError> {
        let mut elements = vec![first];
        while self.c() == Some(',') {
            self.scanner.next();
            elements.push(self.parse_primary(false)?);
        }
        if self.c() != Some(']') {
            return Err(self.parse_exception("Expected ] at end of list literal"));
        }
        self.scanner.next();
        Ok(Expr::new(
            &self.resource,
            line,
            ExprKind::ListLiteral(elements),
        ))
    }

    /// A string literal. Double-quoted strings are themselves mini-templates
    /// and may contain references and directives; they are parsed here with
    /// a fresh parser, whose macro table (if the string defines any) is
    /// discarded. Single-quoted strings are verbatim.
    fn parse_string_literal(&mut self, quote: char, expand: bool) -> Result<Expr, ParseError> {
        self.scanner.next();
        let mut content = String::new();
        loop {
            match self.c() {
                Some(c) if c == quote => break,
                None => return Err(self.parse_exception("Unterminated string constant")),
                Some('\\') => {
                    return Err(self
                        .parse_exception("Escapes in string constants are not currently supported"));
                }
                Some(c) => {
                    content.push(c);
                    self.scanner.next();
                }
            }
        }
        self.scanner.next();
        let nodes = if expand {
            let nested_name = format!(
                "string {}",
                where_at(self.resource_str(), self.scanner.line())
            );
            let mut string_parser = Parser::new(&content, Some(&nested_name));
            let (nodes, _) =
                string_parser.parse_to_stop(&[StopKind::Eof], || "outside any construct".into())?;
            nodes
        } else {
            vec![Node::new(
                &self.resource,
                self.scanner.line(),
                NodeKind::Text(content),
            )]
        };
        Ok(Expr::new(
            &self.resource,
            self.scanner.line(),
            ExprKind::StringLiteral { quote, nodes },
        ))
    }

    /// A run of ASCII digits, already prefixed with `-` for a negative
    /// literal. Must fit the machine integer domain.
    fn parse_int_literal(&mut self, prefix: &str) -> Result<Expr, ParseError> {
        let mut digits = String::from(prefix);
        while let Some(c) = self.c() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.scanner.next();
            } else {
                break;
            }
        }
        match digits.parse::<i32>() {
            Ok(value) => Ok(Expr::new(
                &self.resource,
                self.scanner.line(),
                ExprKind::Constant(Constant::Int(value)),
            )),
            Err(_) => Err(self.parse_exception(format!("Invalid integer: {digits}"))),
        }
    }

    /// `true`, `false`, the word form of `!`, or (where allowed) `null`.
    fn parse_word_literal(&mut self, null_allowed: bool) -> Result<Expr, ParseError> {
        let line = self.scanner.line();
        let id = self.parse_id("Identifier without $")?;
        let constant = match id.as_str() {
            "true" => Constant::Bool(true),
            "false" => Constant::Bool(false),
            "not" => return Ok(Expr::not(self.parse_unary_expression()?)),
            "null" if null_allowed => Constant::Null,
            _ => {
                let suffix = if null_allowed { " or null" } else { "" };
                return Err(self.parse_exception(format!(
                    "Identifier must be preceded by $ or be true or false{suffix}: {id}"
                )));
            }
        };
        Ok(Expr::new(
            &self.resource,
            line,
            ExprKind::Constant(constant),
        ))
    }
}
