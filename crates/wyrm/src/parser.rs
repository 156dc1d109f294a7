//! Recursive-descent parser.
//!
//! The parser drives the [`Gen`] directly — there is no AST. Expressions are
//! parsed into [`Reference`] values describing how to read (and possibly
//! write) the result: a plain slot, a scope variable, an object property or
//! an index. Binary operators lower to method calls on the left operand
//! (`a + b` becomes `a.+(b)`), so operator overloading falls out of ordinary
//! prototype lookup.
//!
//! Two constructs need to look ahead before they can emit: compound
//! assignment (the target is parsed once to find the operator, then reparsed
//! with emission) and the `for` step clause (parsed once in the header,
//! emitted at the loop back edge). Both use a *muted* generator for the
//! first pass, so the cursor moves without touching the function body.

use std::rc::Rc;

use crate::{
    error::ParseError,
    r#gen::Gen,
    ir::{AssignType, Slot, UserFunction},
    lexer::{
        consume_keyword, consume_str, parse_float, parse_identifier, parse_integer,
        parse_string_literal, skip_filler,
    },
    optimize,
    source::{Pos, SourceId, SourceMap, SpanId, SpanTable},
};

type PRes<T> = Result<T, ParseError>;

/// How an expression result can be assigned through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefMode {
    /// Not assignable (literals, call results).
    None,
    /// A scope variable; writes overwrite the existing binding.
    Variable,
    /// An object property; writes shadow inherited keys.
    Object,
    /// An indexed element; writes go through the `[]=` protocol.
    Index,
}

/// A parsed expression: the base slot, an optional key slot, and the
/// assignment discipline implied by how the expression was written.
#[derive(Debug, Clone, Copy)]
struct Reference {
    base: Slot,
    key: Option<Slot>,
    mode: RefMode,
}

impl Reference {
    fn value(base: Slot) -> Self {
        Self {
            base,
            key: None,
            mode: RefMode::None,
        }
    }
}

/// Reads a reference into a plain slot, emitting the access if needed.
fn reference_access(r#gen: &mut Gen, reference: Reference) -> Slot {
    match reference.key {
        Some(key) => r#gen.add_access(reference.base, key),
        None => reference.base,
    }
}

/// Emits the write for `reference = value`; false when not assignable.
fn assign_slot(r#gen: &mut Gen, reference: Reference, value: Slot) -> bool {
    let key = reference.key.unwrap_or(0);
    match reference.mode {
        RefMode::None => false,
        RefMode::Variable => {
            r#gen.add_assign(reference.base, key, value, AssignType::Existing);
            true
        }
        RefMode::Object => {
            r#gen.add_assign(reference.base, key, value, AssignType::Shadowing);
            true
        }
        RefMode::Index => {
            r#gen.add_assign(reference.base, key, value, AssignType::Plain);
            true
        }
    }
}

pub(crate) struct Parser<'a> {
    map: &'a SourceMap,
    spans: &'a mut SpanTable,
    text: &'a str,
    base: Pos,
}

impl<'a> Parser<'a> {
    pub fn new(map: &'a SourceMap, spans: &'a mut SpanTable, source: SourceId) -> Self {
        Self {
            map,
            spans,
            text: map.text(source),
            base: map.base(source),
        }
    }

    /// Parses a whole source buffer into a module function.
    ///
    /// The module body runs with the root as context and returns its scope
    /// object, so top-level bindings are visible to the host afterwards.
    pub fn parse_module(mut self) -> PRes<Rc<UserFunction>> {
        let mut at = 0usize;
        let mut r#gen = Gen::module();

        // the module range is an empty marker at the first real byte;
        // prologue and epilogue instructions charge to it
        let module_range = self.new_range(at);
        let from = self.spans.get(module_range).from;
        self.spans.set_end(module_range, from);

        r#gen.use_range_start(module_range);
        r#gen.new_block();
        r#gen.scope = r#gen.add_get_context();
        r#gen.use_range_end(module_range);

        loop {
            skip_filler(self.text, &mut at);
            if at >= self.text.len() {
                break;
            }
            self.parse_statement(&mut at, &mut r#gen)?;
        }

        r#gen.use_range_start(module_range);
        r#gen.add_return(r#gen.scope);
        r#gen.use_range_end(module_range);
        Ok(Rc::new(optimize::optimize(r#gen.build())))
    }

    // ------------------------------------------------------------------
    // plumbing
    // ------------------------------------------------------------------

    fn new_range(&mut self, at: usize) -> SpanId {
        let mut probe = at;
        skip_filler(self.text, &mut probe);
        self.spans.alloc(self.base + probe as u32)
    }

    fn record_end(&mut self, id: SpanId, at: usize) {
        self.spans.set_end(id, self.base + at as u32);
    }

    fn err(&self, at: usize, message: &str) -> ParseError {
        ParseError::at(self.map, self.base + at as u32, message)
    }

    // ------------------------------------------------------------------
    // expressions
    // ------------------------------------------------------------------

    /// Literals, identifiers, parens, literals-with-braces, `fn`/`method`
    /// expressions and `new`.
    fn parse_expression_stem(&mut self, at: &mut usize, r#gen: &mut Gen) -> PRes<Reference> {
        let text = self.text;
        let range = self.new_range(*at);

        if let Some(ident) = parse_identifier(text, at) {
            self.record_end(range, *at);
            r#gen.use_range_start(range);
            let reference = if r#gen.is_muted() {
                Reference {
                    base: 0,
                    key: None,
                    mode: RefMode::Variable,
                }
            } else {
                let name_slot = r#gen.add_new_string(ident.into());
                Reference {
                    base: r#gen.scope,
                    key: Some(name_slot),
                    mode: RefMode::Variable,
                }
            };
            r#gen.use_range_end(range);
            return Ok(reference);
        }

        // floats before integers: "3.25" must not stop at the dot
        {
            let mut probe = *at;
            if let Some(value) = parse_float(text, &mut probe) {
                *at = probe;
                self.record_end(range, *at);
                r#gen.use_range_start(range);
                let slot = r#gen.add_new_float(value);
                r#gen.use_range_end(range);
                return Ok(Reference::value(slot));
            }
        }
        {
            let mut probe = *at;
            if let Some(value) = parse_integer(text, &mut probe) {
                *at = probe;
                self.record_end(range, *at);
                r#gen.use_range_start(range);
                let slot = r#gen.add_new_int(value);
                r#gen.use_range_end(range);
                return Ok(Reference::value(slot));
            }
        }
        {
            let mut probe = *at;
            match parse_string_literal(text, &mut probe) {
                Err(lex) => return Err(self.err(lex.at, lex.message)),
                Ok(Some(value)) => {
                    *at = probe;
                    self.record_end(range, *at);
                    r#gen.use_range_start(range);
                    let slot = r#gen.add_new_string(value.into());
                    r#gen.use_range_end(range);
                    return Ok(Reference::value(slot));
                }
                Ok(None) => {}
            }
        }

        if let Some(reference) = self.parse_object_literal(at, r#gen)? {
            return Ok(reference);
        }
        if let Some(reference) = self.parse_array_literal(at, r#gen)? {
            return Ok(reference);
        }

        if consume_str(text, at, "(") {
            let reference = self.parse_expression(at, r#gen, 0)?;
            if !consume_str(text, at, ")") {
                return Err(self.err(*at, "'()' expected closing paren"));
            }
            return Ok(reference);
        }

        let is_method = if consume_keyword(text, at, "fn") {
            Some(false)
        } else if consume_keyword(text, at, "method") {
            Some(true)
        } else {
            None
        };
        if let Some(is_method) = is_method {
            self.record_end(range, *at);
            let function = self.parse_function_expression(at, is_method)?;
            // the closure allocation charges to the keyword range
            r#gen.use_range_start(range);
            let slot = r#gen.add_new_closure(function);
            r#gen.use_range_end(range);
            return Ok(Reference::value(slot));
        }

        if consume_keyword(text, at, "new") {
            self.record_end(range, *at);
            let parent = self.parse_expression(at, r#gen, 0)?;
            r#gen.use_range_start(range);
            let parent_slot = reference_access(r#gen, parent);
            let object_slot = r#gen.add_new_object(parent_slot);
            r#gen.use_range_end(range);
            if consume_str(text, at, "{") {
                self.parse_object_literal_body(at, r#gen, object_slot)?;
            }
            return Ok(Reference::value(object_slot));
        }

        Err(self.err(*at, "expected expression"))
    }

    fn parse_object_literal(&mut self, at: &mut usize, r#gen: &mut Gen) -> PRes<Option<Reference>> {
        let range = self.new_range(*at);
        if !consume_str(self.text, at, "{") {
            return Ok(None);
        }
        r#gen.use_range_start(range);
        let object_slot = r#gen.add_new_object(0);
        r#gen.use_range_end(range);
        self.parse_object_literal_body(at, r#gen, object_slot)?;
        self.record_end(range, *at);
        Ok(Some(Reference::value(object_slot)))
    }

    /// Entries after the opening brace: `key = value` pairs, string keys
    /// allowed so operator names can be defined (`{ "+" = method(o) … }`).
    fn parse_object_literal_body(&mut self, at: &mut usize, r#gen: &mut Gen, object_slot: Slot) -> PRes<()> {
        let text = self.text;
        while !consume_str(text, at, "}") {
            let entry_range = self.new_range(*at);
            let key: String = match parse_identifier(text, at) {
                Some(ident) => ident.to_owned(),
                None => match parse_string_literal(text, at) {
                    Err(lex) => return Err(self.err(lex.at, lex.message)),
                    Ok(Some(s)) => s,
                    Ok(None) => return Err(self.err(*at, "expected identifier")),
                },
            };
            self.record_end(entry_range, *at);

            if !consume_str(text, at, "=") {
                return Err(self.err(*at, "object literal expects 'name = value'"));
            }

            let value = self.parse_expression(at, r#gen, 0)?;

            r#gen.use_range_start(entry_range);
            let key_slot = r#gen.add_new_string(key.into());
            let value_slot = reference_access(r#gen, value);
            r#gen.add_assign(object_slot, key_slot, value_slot, AssignType::Plain);
            r#gen.use_range_end(entry_range);

            if consume_str(text, at, ",") {
                continue;
            }
            if consume_str(text, at, "}") {
                break;
            }
            return Err(self.err(*at, "expected comma or closing brace"));
        }
        Ok(())
    }

    /// `[a, b, …]` lowers to `resize(n)` followed by `[]=(i, v)` calls.
    fn parse_array_literal(&mut self, at: &mut usize, r#gen: &mut Gen) -> PRes<Option<Reference>> {
        let text = self.text;
        let range = self.new_range(*at);
        if !consume_str(text, at, "[") {
            return Ok(None);
        }
        r#gen.use_range_start(range);
        let object_slot = r#gen.add_new_array();
        r#gen.use_range_end(range);

        let mut values = Vec::new();
        while !consume_str(text, at, "]") {
            let value = self.parse_expression(at, r#gen, 0)?;
            values.push(value);
            if consume_str(text, at, ",") {
                continue;
            }
            if consume_str(text, at, "]") {
                break;
            }
            return Err(self.err(*at, "expected comma or closing bracket"));
        }
        self.record_end(range, *at);

        r#gen.use_range_start(range);
        let resize_key = r#gen.add_new_string("resize".into());
        let assign_key = r#gen.add_new_string("[]=".into());
        let resize_fn = r#gen.add_access(object_slot, resize_key);
        let assign_fn = r#gen.add_access(object_slot, assign_key);
        let length_slot = r#gen.add_new_int(i32::try_from(values.len()).unwrap_or(i32::MAX));
        let resized = r#gen.add_call(resize_fn, object_slot, &[length_slot]);
        for (index, value) in values.into_iter().enumerate() {
            let index_slot = r#gen.add_new_int(index as i32);
            let value_slot = reference_access(r#gen, value);
            r#gen.add_call(assign_fn, resized, &[index_slot, value_slot]);
        }
        r#gen.use_range_end(range);

        Ok(Some(Reference::value(object_slot)))
    }

    /// `expr(args…)`; passes the reference base as `this`.
    fn parse_call(
        &mut self,
        at: &mut usize,
        r#gen: &mut Gen,
        expression: &mut Reference,
        expression_range: SpanId,
    ) -> PRes<bool> {
        let text = self.text;
        let call_range = self.new_range(*at);
        // freeze the callee range: the shared one keeps growing as further
        // postfix forms are parsed
        let frozen_range = self.spans.clone_span(expression_range);

        if !consume_str(text, at, "(") {
            return Ok(false);
        }

        let mut arguments: Vec<Slot> = Vec::new();
        while !consume_str(text, at, ")") {
            if !arguments.is_empty() && !consume_str(text, at, ",") {
                return Err(self.err(*at, "expected comma or closing parenthesis"));
            }
            let argument = self.parse_expression(at, r#gen, 0)?;
            r#gen.use_range_start(call_range);
            let slot = reference_access(r#gen, argument);
            r#gen.use_range_end(call_range);
            arguments.push(slot);
        }
        self.record_end(call_range, *at);

        let this_slot = expression.base;
        r#gen.use_range_start(frozen_range);
        let function_slot = reference_access(r#gen, *expression);
        let result = r#gen.add_call(function_slot, this_slot, &arguments);
        r#gen.use_range_end(frozen_range);
        *expression = Reference::value(result);
        Ok(true)
    }

    /// `expr[key]` — an index reference; reads and writes go through the
    /// `[]` / `[]=` protocol when the key is not a string.
    fn parse_array_access(&mut self, at: &mut usize, r#gen: &mut Gen, expression: &mut Reference) -> PRes<bool> {
        let text = self.text;
        let access_range = self.new_range(*at);
        if !consume_str(text, at, "[") {
            return Ok(false);
        }

        let key = self.parse_expression(at, r#gen, 0)?;
        if !consume_str(text, at, "]") {
            return Err(self.err(*at, "expected closing ']'"));
        }
        self.record_end(access_range, *at);

        r#gen.use_range_start(access_range);
        let key_slot = reference_access(r#gen, key);
        let base = reference_access(r#gen, *expression);
        *expression = Reference {
            base,
            key: Some(key_slot),
            mode: RefMode::Index,
        };
        r#gen.use_range_end(access_range);
        Ok(true)
    }

    /// `expr.name` — a property reference.
    fn parse_property_access(&mut self, at: &mut usize, r#gen: &mut Gen, expression: &mut Reference) -> PRes<bool> {
        let text = self.text;
        let property_range = self.new_range(*at);
        if !consume_str(text, at, ".") {
            return Ok(false);
        }

        let Some(name) = parse_identifier(text, at) else {
            return Err(self.err(*at, "expected identifier after '.'"));
        };
        self.record_end(property_range, *at);

        r#gen.use_range_start(property_range);
        let key_slot = if r#gen.is_muted() {
            None
        } else {
            Some(r#gen.add_new_string(name.into()))
        };
        let base = reference_access(r#gen, *expression);
        *expression = Reference {
            base,
            key: key_slot,
            mode: RefMode::Object,
        };
        r#gen.use_range_end(property_range);
        Ok(true)
    }

    /// Postfix `++`/`--`: writes back through the reference and yields the
    /// prior value.
    fn parse_postfix(&mut self, at: &mut usize, r#gen: &mut Gen, expression: &mut Reference) -> PRes<bool> {
        let text = self.text;
        let operator_range = self.new_range(*at);
        let operation = if consume_str(text, at, "++") {
            "+"
        } else if consume_str(text, at, "--") {
            "-"
        } else {
            return Ok(false);
        };
        self.record_end(operator_range, *at);

        r#gen.use_range_start(operator_range);
        let prior = reference_access(r#gen, *expression);
        let one = r#gen.add_new_int(1);
        r#gen.use_range_end(operator_range);

        let sum = self.build_operation(r#gen, operation, *expression, Reference::value(one), operator_range);

        r#gen.use_range_start(operator_range);
        let sum_slot = reference_access(r#gen, sum);
        let assigned = assign_slot(r#gen, *expression, sum_slot);
        r#gen.use_range_end(operator_range);
        if !assigned {
            return Err(self.err(*at, "postfix cannot assign: expression is non-reference"));
        }
        *expression = Reference::value(prior);
        Ok(true)
    }

    /// A stem followed by any chain of calls, member and index accesses and
    /// postfix operators. No binary operators at this level.
    fn parse_expression_base(&mut self, at: &mut usize, r#gen: &mut Gen) -> PRes<Reference> {
        let expression_range = self.new_range(*at);
        let mut reference = self.parse_expression_stem(at, r#gen)?;
        loop {
            self.record_end(expression_range, *at);
            if self.parse_call(at, r#gen, &mut reference, expression_range)? {
                continue;
            }
            if self.parse_property_access(at, r#gen, &mut reference)? {
                continue;
            }
            if self.parse_array_access(at, r#gen, &mut reference)? {
                continue;
            }
            if self.parse_postfix(at, r#gen, &mut reference)? {
                continue;
            }
            break;
        }
        Ok(reference)
    }

    /// Lowers `lhs op rhs` to `lhs.<op>(rhs)` with `this = lhs`.
    fn build_operation(
        &mut self,
        r#gen: &mut Gen,
        operation: &str,
        lhs: Reference,
        rhs: Reference,
        range: SpanId,
    ) -> Reference {
        r#gen.use_range_start(range);
        let lhs_slot = reference_access(r#gen, lhs);
        let rhs_slot = reference_access(r#gen, rhs);
        let operation_key = r#gen.add_new_string(operation.into());
        let function = r#gen.add_access(lhs_slot, operation_key);
        let result = r#gen.add_call(function, lhs_slot, &[rhs_slot]);
        r#gen.use_range_end(range);
        Reference::value(result)
    }

    /// Full expression parse with precedence climbing.
    ///
    /// Levels, loosest first: comparisons (0), `+ -` (1), `* /` (2),
    /// `|` (3), `&` (4). `level` is the loosest level this call may consume.
    fn parse_expression(&mut self, at: &mut usize, r#gen: &mut Gen, level: u8) -> PRes<Reference> {
        let text = self.text;

        let negated_range = self.new_range(*at);
        let negate = consume_str(text, at, "-");
        if negate {
            self.record_end(negated_range, *at);
        }

        let mut reference = self.parse_expression_base(at, r#gen)?;

        if negate {
            r#gen.use_range_start(negated_range);
            let zero = r#gen.add_new_int(0);
            r#gen.use_range_end(negated_range);
            reference = self.build_operation(r#gen, "-", Reference::value(zero), reference, negated_range);
        }

        if level > 4 {
            return Ok(reference);
        }
        loop {
            let range = self.new_range(*at);
            if consume_str(text, at, "&") {
                self.record_end(range, *at);
                let rhs = self.parse_expression(at, r#gen, 4)?;
                reference = self.build_operation(r#gen, "&", reference, rhs, range);
                continue;
            }
            break;
        }

        if level > 3 {
            return Ok(reference);
        }
        loop {
            let range = self.new_range(*at);
            if consume_str(text, at, "|") {
                self.record_end(range, *at);
                let rhs = self.parse_expression(at, r#gen, 4)?;
                reference = self.build_operation(r#gen, "|", reference, rhs, range);
                continue;
            }
            break;
        }

        if level > 2 {
            return Ok(reference);
        }
        loop {
            let range = self.new_range(*at);
            if consume_str(text, at, "*") {
                self.record_end(range, *at);
                let rhs = self.parse_expression(at, r#gen, 3)?;
                reference = self.build_operation(r#gen, "*", reference, rhs, range);
                continue;
            }
            if consume_str(text, at, "/") {
                self.record_end(range, *at);
                let rhs = self.parse_expression(at, r#gen, 3)?;
                reference = self.build_operation(r#gen, "/", reference, rhs, range);
                continue;
            }
            break;
        }

        if level > 1 {
            return Ok(reference);
        }
        loop {
            let range = self.new_range(*at);
            if consume_str(text, at, "+") {
                self.record_end(range, *at);
                let rhs = self.parse_expression(at, r#gen, 2)?;
                reference = self.build_operation(r#gen, "+", reference, rhs, range);
                continue;
            }
            if consume_str(text, at, "-") {
                self.record_end(range, *at);
                let rhs = self.parse_expression(at, r#gen, 2)?;
                reference = self.build_operation(r#gen, "-", reference, rhs, range);
                continue;
            }
            break;
        }

        if level > 0 {
            return Ok(reference);
        }

        let mut negated = false;
        let range = self.new_range(*at);
        if consume_str(text, at, "==") {
            self.record_end(range, *at);
            let rhs = self.parse_expression(at, r#gen, 1)?;
            reference = self.build_operation(r#gen, "==", reference, rhs, range);
        } else if consume_str(text, at, "!=") {
            self.record_end(range, *at);
            let rhs = self.parse_expression(at, r#gen, 1)?;
            reference = self.build_operation(r#gen, "==", reference, rhs, range);
            negated = true;
        } else {
            // a lone '!' negates whichever comparison follows: !<, !>=, …
            if consume_str(text, at, "!") {
                negated = true;
            }
            if consume_str(text, at, "<=") {
                self.record_end(range, *at);
                let rhs = self.parse_expression(at, r#gen, 1)?;
                reference = self.build_operation(r#gen, "<=", reference, rhs, range);
            } else if consume_str(text, at, ">=") {
                self.record_end(range, *at);
                let rhs = self.parse_expression(at, r#gen, 1)?;
                reference = self.build_operation(r#gen, ">=", reference, rhs, range);
            } else if consume_str(text, at, "<") {
                self.record_end(range, *at);
                let rhs = self.parse_expression(at, r#gen, 1)?;
                reference = self.build_operation(r#gen, "<", reference, rhs, range);
            } else if consume_str(text, at, ">") {
                self.record_end(range, *at);
                let rhs = self.parse_expression(at, r#gen, 1)?;
                reference = self.build_operation(r#gen, ">", reference, rhs, range);
            } else if negated {
                return Err(self.err(*at, "expected comparison operator"));
            }
        }

        if negated {
            r#gen.use_range_start(range);
            let value = reference_access(r#gen, reference);
            let not_key = r#gen.add_new_string("!".into());
            let not_fn = r#gen.add_access(value, not_key);
            let result = r#gen.add_call(not_fn, value, &[]);
            r#gen.use_range_end(range);
            reference = Reference::value(result);
        }

        Ok(reference)
    }

    // ------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------

    /// Assignment statements: `target = e` and the compound forms.
    ///
    /// The target is parsed twice: a muted pass to find the operator, then a
    /// real pass that emits. Returns false (cursor untouched) when the text
    /// is not an assignment at all.
    fn parse_assign(&mut self, at: &mut usize, r#gen: &mut Gen) -> PRes<bool> {
        let text = self.text;
        let mut probe = *at;
        let mut muted = Gen::muted();
        self.parse_expression_base(&mut probe, &mut muted)?;

        let (operation, assignment) = if consume_str(text, &mut probe, "+=") {
            (Some("+"), "+=")
        } else if consume_str(text, &mut probe, "-=") {
            (Some("-"), "-=")
        } else if consume_str(text, &mut probe, "*=") {
            (Some("*"), "*=")
        } else if consume_str(text, &mut probe, "/=") {
            (Some("/"), "/=")
        } else if !text_starts_with(text, probe, "==") && consume_str(text, &mut probe, "=") {
            (None, "=")
        } else {
            return Ok(false);
        };

        let mut cursor = *at;
        let target = self.parse_expression_base(&mut cursor, r#gen)?;
        let assign_range = self.new_range(cursor);
        let operator_present = consume_str(text, &mut cursor, assignment);
        assert!(operator_present, "assignment operator vanished between parses");
        self.record_end(assign_range, cursor);

        let mut value = self.parse_expression(&mut cursor, r#gen, 0)?;
        if let Some(operation) = operation {
            value = self.build_operation(r#gen, operation, target, value, assign_range);
        }

        r#gen.use_range_start(assign_range);
        let value_slot = reference_access(r#gen, value);
        let assigned = assign_slot(r#gen, target, value_slot);
        r#gen.use_range_end(assign_range);
        if !assigned {
            return Err(self.err(cursor, "cannot perform assignment: expression is non-reference"));
        }

        *at = cursor;
        Ok(true)
    }

    /// `let`/`const` declarations, including lists (`let a, b = 1;`).
    ///
    /// Each declaration allocates a fresh scope object, binds the name to
    /// null and closes the scope *before* evaluating the initializer —
    /// that is what lets `let f = fn() { f(); };` recurse. `const`
    /// additionally freezes the scope after the initializing write.
    fn parse_let_declaration(
        &mut self,
        at: &mut usize,
        r#gen: &mut Gen,
        let_range: SpanId,
        is_const: bool,
    ) -> PRes<()> {
        let text = self.text;

        r#gen.use_range_start(let_range);
        r#gen.scope = r#gen.add_new_object(r#gen.scope);
        let let_scope = r#gen.scope;
        r#gen.use_range_end(let_range);

        let name_range = self.new_range(*at);
        let Some(name) = parse_identifier(text, at) else {
            return Err(self.err(*at, "expected identifier"));
        };
        self.record_end(name_range, *at);

        r#gen.use_range_start(name_range);
        let name_slot = if r#gen.is_muted() { 0 } else { r#gen.add_new_string(name.into()) };
        r#gen.add_assign(let_scope, name_slot, 0, AssignType::Plain);
        r#gen.add_close_object(let_scope);
        r#gen.use_range_end(name_range);

        let (assign_range, value_slot) = if consume_str(text, at, "=") {
            let assign_range = self.new_range(*at);
            self.record_end(assign_range, *at);

            let expression_range = self.new_range(*at);
            let value = self.parse_expression(at, r#gen, 0)?;
            self.record_end(expression_range, *at);

            r#gen.use_range_start(expression_range);
            let value_slot = reference_access(r#gen, value);
            r#gen.use_range_end(expression_range);
            (assign_range, value_slot)
        } else {
            (name_range, 0)
        };

        r#gen.use_range_start(assign_range);
        r#gen.add_assign(let_scope, name_slot, value_slot, AssignType::Existing);
        if is_const {
            r#gen.add_freeze(let_scope);
        }
        r#gen.use_range_end(assign_range);

        if consume_str(text, at, ",") {
            return self.parse_let_declaration(at, r#gen, let_range, is_const);
        }
        Ok(())
    }

    /// `fn name(args) { … };` — binds a named closure in a fresh scope that
    /// is then closed and frozen.
    fn parse_function_declaration(&mut self, at: &mut usize, r#gen: &mut Gen, range: SpanId) -> PRes<()> {
        r#gen.use_range_start(range);
        r#gen.scope = r#gen.add_new_object(r#gen.scope);
        r#gen.use_range_end(range);

        let name_at = *at;
        let function = self.parse_function_expression(at, false)?;
        let Some(name) = function.name().map(str::to_owned) else {
            return Err(self.err(name_at, "expected function name"));
        };

        r#gen.use_range_start(range);
        let name_slot = r#gen.add_new_string(name.into());
        let closure_slot = r#gen.add_new_closure(function);
        r#gen.add_assign(r#gen.scope, name_slot, closure_slot, AssignType::Plain);
        r#gen.add_close_object(r#gen.scope);
        r#gen.add_freeze(r#gen.scope);
        r#gen.use_range_end(range);
        Ok(())
    }

    fn parse_if_statement(&mut self, at: &mut usize, r#gen: &mut Gen, keyword_range: SpanId) -> PRes<()> {
        let text = self.text;
        if !consume_str(text, at, "(") {
            return Err(self.err(*at, "expected opening paren after 'if'"));
        }

        let test = self.parse_expression(at, r#gen, 0)?;
        if !consume_str(text, at, ")") {
            return Err(self.err(*at, "expected closing paren after 'if'"));
        }

        r#gen.use_range_start(keyword_range);
        let test_slot = reference_access(r#gen, test);
        let (true_ref, false_ref) = r#gen.add_test_branch(test_slot);
        r#gen.use_range_end(keyword_range);

        let true_block = r#gen.new_block();
        r#gen.set_block_ref(true_ref, true_block);
        self.parse_block(at, r#gen)?;

        r#gen.use_range_start(keyword_range);
        let end_ref = r#gen.add_branch();
        r#gen.use_range_end(keyword_range);

        let false_block = r#gen.new_block();
        r#gen.set_block_ref(false_ref, false_block);
        if consume_keyword(text, at, "else") {
            self.parse_block(at, r#gen)?;
            r#gen.use_range_start(keyword_range);
            let else_end_ref = r#gen.add_branch();
            r#gen.use_range_end(keyword_range);

            let join_block = r#gen.new_block();
            r#gen.set_block_ref(else_end_ref, join_block);
            r#gen.set_block_ref(end_ref, join_block);
        } else {
            r#gen.set_block_ref(end_ref, false_block);
        }
        Ok(())
    }

    fn parse_while_statement(&mut self, at: &mut usize, r#gen: &mut Gen, range: SpanId) -> PRes<()> {
        let text = self.text;
        if !consume_str(text, at, "(") {
            return Err(self.err(*at, "expected opening paren after 'while'"));
        }

        r#gen.use_range_start(range);
        let test_ref = r#gen.add_branch();
        r#gen.use_range_end(range);
        let test_block = r#gen.new_block();
        r#gen.set_block_ref(test_ref, test_block);

        let test = self.parse_expression(at, r#gen, 0)?;
        if !consume_str(text, at, ")") {
            return Err(self.err(*at, "expected closing paren after 'while'"));
        }

        r#gen.use_range_start(range);
        let test_slot = reference_access(r#gen, test);
        let (loop_ref, end_ref) = r#gen.add_test_branch(test_slot);
        r#gen.use_range_end(range);

        let loop_block = r#gen.new_block();
        r#gen.set_block_ref(loop_ref, loop_block);
        self.parse_block(at, r#gen)?;

        r#gen.use_range_start(range);
        let back_ref = r#gen.add_branch();
        r#gen.use_range_end(range);
        r#gen.set_block_ref(back_ref, test_block);

        let end_block = r#gen.new_block();
        r#gen.set_block_ref(end_ref, end_block);
        Ok(())
    }

    /// `for (init; cond; step) body` — the step clause is pre-parsed muted
    /// in the header and emitted for real at the loop back edge.
    fn parse_for_statement(&mut self, at: &mut usize, r#gen: &mut Gen, range: SpanId) -> PRes<()> {
        let text = self.text;
        if !consume_str(text, at, "(") {
            return Err(self.err(*at, "expected opening parenthesis in 'for'"));
        }

        // init-declared variables go out of scope after the loop
        let scope_backup = r#gen.scope_enter();

        let declaration_range = self.new_range(*at);
        if consume_keyword(text, at, "let") {
            self.parse_let_declaration(at, r#gen, declaration_range, false)?;
        } else if !self.parse_assign(at, r#gen)? {
            return Err(self.err(*at, "expected let declaration or assignment in 'for'"));
        }
        if !consume_str(text, at, ";") {
            return Err(self.err(*at, "expected semicolon in 'for'"));
        }

        r#gen.use_range_start(range);
        let test_ref = r#gen.add_branch();
        r#gen.use_range_end(range);
        let test_block = r#gen.new_block();
        r#gen.set_block_ref(test_ref, test_block);

        let test = self.parse_expression(at, r#gen, 0)?;
        if !consume_str(text, at, ";") {
            return Err(self.err(*at, "expected semicolon in 'for'"));
        }

        let step_at = *at;
        {
            let mut probe = *at;
            let mut muted = Gen::muted();
            self.parse_semicolon_statement(&mut probe, &mut muted)?;
            *at = probe;
            if !consume_str(text, at, ")") {
                return Err(self.err(*at, "expected closing parenthesis in 'for'"));
            }
        }

        r#gen.use_range_start(range);
        let test_slot = reference_access(r#gen, test);
        let (loop_ref, end_ref) = r#gen.add_test_branch(test_slot);
        r#gen.use_range_end(range);

        let loop_block = r#gen.new_block();
        r#gen.set_block_ref(loop_ref, loop_block);
        self.parse_block(at, r#gen)?;

        // emit the step at the back edge
        let mut step_cursor = step_at;
        self.parse_semicolon_statement(&mut step_cursor, r#gen)?;

        r#gen.use_range_start(range);
        let back_ref = r#gen.add_branch();
        r#gen.use_range_end(range);
        r#gen.set_block_ref(back_ref, test_block);

        let end_block = r#gen.new_block();
        r#gen.set_block_ref(end_ref, end_block);

        r#gen.scope_leave(scope_backup);
        Ok(())
    }

    fn parse_return_statement(&mut self, at: &mut usize, r#gen: &mut Gen, keyword_range: SpanId) -> PRes<()> {
        let value = self.parse_expression(at, r#gen, 0)?;
        r#gen.use_range_start(keyword_range);
        let value_slot = reference_access(r#gen, value);
        r#gen.add_return(value_slot);
        r#gen.new_block();
        r#gen.use_range_end(keyword_range);
        Ok(())
    }

    /// Statements that require a trailing semicolon: `return`, `let`,
    /// `const`, assignments and bare expressions.
    fn parse_semicolon_statement(&mut self, at: &mut usize, r#gen: &mut Gen) -> PRes<()> {
        let text = self.text;
        let keyword_range = self.new_range(*at);
        if consume_keyword(text, at, "return") {
            self.record_end(keyword_range, *at);
            return self.parse_return_statement(at, r#gen, keyword_range);
        }
        if consume_keyword(text, at, "let") {
            self.record_end(keyword_range, *at);
            return self.parse_let_declaration(at, r#gen, keyword_range, false);
        }
        if consume_keyword(text, at, "const") {
            self.record_end(keyword_range, *at);
            return self.parse_let_declaration(at, r#gen, keyword_range, true);
        }
        if self.parse_assign(at, r#gen)? {
            return Ok(());
        }
        self.parse_expression_base(at, r#gen)?;
        Ok(())
    }

    fn parse_statement(&mut self, at: &mut usize, r#gen: &mut Gen) -> PRes<()> {
        let text = self.text;
        let keyword_range = self.new_range(*at);
        if consume_keyword(text, at, "if") {
            self.record_end(keyword_range, *at);
            return self.parse_if_statement(at, r#gen, keyword_range);
        }
        if consume_keyword(text, at, "fn") {
            self.record_end(keyword_range, *at);
            self.parse_function_declaration(at, r#gen, keyword_range)?;
            // a trailing semicolon after the declaration body is allowed
            consume_str(text, at, ";");
            return Ok(());
        }
        if consume_keyword(text, at, "while") {
            self.record_end(keyword_range, *at);
            return self.parse_while_statement(at, r#gen, keyword_range);
        }
        if consume_keyword(text, at, "for") {
            self.record_end(keyword_range, *at);
            return self.parse_for_statement(at, r#gen, keyword_range);
        }

        self.parse_semicolon_statement(at, r#gen)?;
        if !consume_str(text, at, ";") {
            return Err(self.err(*at, "expected ';' after statement"));
        }
        Ok(())
    }

    /// `{ stmt* }` or a single statement. Blocks do not open scopes; any
    /// `let` scopes created inside end when the block does.
    fn parse_block(&mut self, at: &mut usize, r#gen: &mut Gen) -> PRes<()> {
        let text = self.text;
        let scope_backup = r#gen.scope_enter();
        if consume_str(text, at, "{") {
            while !consume_str(text, at, "}") {
                if *at >= text.len() {
                    return Err(self.err(*at, "expected '}'"));
                }
                self.parse_statement(at, r#gen)?;
            }
        } else {
            self.parse_statement(at, r#gen)?;
        }
        r#gen.scope_leave(scope_backup);
        Ok(())
    }

    /// `name? (params) body` — compiles a fresh function. Block 0 loads the
    /// caller context, builds the parameter scope and closes it, then the
    /// body follows. The result is optimized before it is wrapped.
    fn parse_function_expression(&mut self, at: &mut usize, is_method: bool) -> PRes<Rc<UserFunction>> {
        let text = self.text;
        let name: Option<Rc<str>> = parse_identifier(text, at).map(Rc::from);

        let frame_range = self.new_range(*at);
        if !consume_str(text, at, "(") {
            return Err(self.err(*at, "expected opening paren for parameter list"));
        }
        let mut parameters: Vec<&str> = Vec::new();
        while !consume_str(text, at, ")") {
            if !parameters.is_empty() && !consume_str(text, at, ",") {
                return Err(self.err(*at, "expected comma in parameter list"));
            }
            let Some(parameter) = parse_identifier(text, at) else {
                return Err(self.err(*at, "expected identifier for parameter in parameter list"));
            };
            parameters.push(parameter);
        }
        self.record_end(frame_range, *at);

        let mut r#gen = Gen::function(name, parameters.len(), is_method);
        r#gen.new_block();
        r#gen.use_range_start(frame_range);
        let context_slot = r#gen.add_get_context();
        r#gen.scope = r#gen.add_new_object(context_slot);
        for (index, parameter) in parameters.iter().enumerate() {
            let key_slot = r#gen.add_new_string((*parameter).into());
            r#gen.add_assign(r#gen.scope, key_slot, index + 1, AssignType::Plain);
        }
        r#gen.add_close_object(r#gen.scope);
        r#gen.use_range_end(frame_range);

        self.parse_block(at, &mut r#gen)?;

        r#gen.use_range_start(frame_range);
        r#gen.terminate();
        r#gen.use_range_end(frame_range);

        Ok(Rc::new(optimize::optimize(r#gen.build())))
    }
}

/// Peeks past filler without committing the cursor.
fn text_starts_with(text: &str, at: usize, what: &str) -> bool {
    let mut probe = at;
    skip_filler(text, &mut probe);
    text[probe..].starts_with(what)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::source::SourceMap;

    fn parse(source: &str) -> Result<Rc<UserFunction>, ParseError> {
        let mut map = SourceMap::new();
        let mut spans = SpanTable::new();
        let id = map.register("test.wy", source, 0, 0);
        Parser::new(&map, &mut spans, id).parse_module()
    }

    #[test]
    fn every_block_ends_with_a_terminator() {
        let module = parse(
            "fn f(a, b) { if (a == b) return 1; return 0; }\n\
             let i = 0;\n\
             while (i < 10) { i = i + 1; }\n\
             for (let j = 0; j < 3; j = j + 1) { print(j); }\n",
        )
        .unwrap();
        for block in 0..module.body.blocks.len() {
            let instrs = module.block_instrs(block);
            let (last, rest) = instrs.split_last().expect("empty block");
            assert!(last.op.is_terminator(), "block {block} not terminated");
            assert!(
                rest.iter().all(|i| !i.op.is_terminator()),
                "block {block} has an interior terminator"
            );
        }
    }

    #[test]
    fn spans_point_into_the_registered_buffer() {
        let source = "let a = 1 + 2;\nprint(a);\n";
        let mut map = SourceMap::new();
        let mut spans = SpanTable::new();
        let id = map.register("test.wy", source, 0, 0);
        let module = Parser::new(&map, &mut spans, id).parse_module().unwrap();
        for instr in &module.body.instrs {
            let span = spans.get(instr.span);
            assert!(map.locate(span.from).is_some(), "span start escapes the buffer");
            assert!(span.to <= map.base(id) + source.len() as u32 + 1);
        }
    }

    #[test]
    fn missing_semicolon_is_reported() {
        let err = parse("let a = 1").unwrap_err();
        assert!(err.to_string().contains("expected ';' after statement"), "{err}");
    }

    #[test]
    fn unknown_escape_is_reported_with_location() {
        let err = parse("let s = \"a\\q\";").unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("unknown escape sequence"), "{rendered}");
        assert!(rendered.starts_with("test.wy:1:"), "{rendered}");
    }

    #[test]
    fn keywords_are_not_identifiers() {
        let err = parse("let while = 1;").unwrap_err();
        assert!(err.to_string().contains("expected identifier"), "{err}");
    }

    #[test]
    fn stray_negated_operator_is_reported() {
        let err = parse("let a = 1 ! 2;").unwrap_err();
        assert!(err.to_string().contains("expected comparison operator"), "{err}");
    }

    #[test]
    fn postfix_on_literal_is_rejected() {
        let err = parse("let a = 1++;").unwrap_err();
        assert!(err.to_string().contains("postfix cannot assign"), "{err}");
    }

    #[test]
    fn compound_assignment_parses() {
        assert!(parse("let a = 1; a += 2; a -= 1; a *= 3; a /= 2;").is_ok());
    }

    #[test]
    fn object_literals_accept_string_keys() {
        assert!(parse("let v = { \"+\" = 1, plain = 2 };").is_ok());
    }

    #[test]
    fn module_returns_its_scope() {
        let module = parse("let a = 1;").unwrap();
        let last = module.body.instrs.last().unwrap();
        assert!(matches!(&last.op, crate::ir::Op::Return { .. }));
        assert_eq!(module.arity(), 0);
    }
}
