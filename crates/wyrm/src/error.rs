//! Error types for parsing and execution.
//!
//! Parse errors are rendered eagerly (the parser has the source map at hand)
//! into the classic `file:row:col: error: message` shape with a caret line.
//! Runtime errors carry a typed kind plus the backtrace captured from the
//! frame stack at the point of failure; frames stay intact on error exactly
//! so this capture can happen.

use std::fmt;

use crate::source::{Pos, SourceMap};

/// A diagnostic produced by the lexer or parser.
///
/// The parser stops at the first error; the rendered text already includes
/// the offending line and a caret marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    rendered: String,
}

impl ParseError {
    /// Builds a rendered diagnostic for `pos` with the given message.
    pub(crate) fn at(map: &SourceMap, pos: Pos, message: &str) -> Self {
        let mut rendered = String::new();
        if let Some(loc) = map.locate(pos) {
            rendered.push_str(&format!(
                "{}:{}:{}: error: {message}\n",
                loc.name,
                loc.row + 1,
                loc.col + 1
            ));
            rendered.push_str(loc.line);
            rendered.push('\n');
            // caret under the offending column, counted in characters so the
            // marker lines up for multi-byte text
            let caret_col = utf8_len(&loc.line.as_bytes()[..(loc.col as usize).min(loc.line.len())]);
            for _ in 0..caret_col {
                rendered.push(' ');
            }
            rendered.push('^');
        } else {
            rendered.push_str(&format!("error: {message}"));
        }
        Self { rendered }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl std::error::Error for ParseError {}

/// Counts characters in a byte slice by skipping UTF-8 continuation bytes.
fn utf8_len(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| (b & 0xC0) != 0x80).count()
}

/// The failure classes a running script can hit.
///
/// Kinds that name a key carry it for the message; internal addressing
/// violations indicate a code generation bug rather than a script bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmErrorKind {
    /// The called value has neither a function nor a closure on its chain.
    NotCallable,
    /// The call passed the wrong number of arguments.
    ArityMismatch {
        expected: usize,
        got: usize,
        variadic: bool,
    },
    /// Property lookup failed along the whole prototype chain.
    KeyNotFound(String),
    /// An `Existing` or `Shadowing` write found no owner for the key.
    AssignKeyNotFound(String),
    /// A `Plain` write tried to add a key to a closed object.
    AssignToClosed(String),
    /// A `Plain` write tried to replace a key on an immutable object.
    AssignToImmutable(String),
    /// `new` was applied to a parent carrying the no-inherit flag.
    InheritFromNoInherit,
    /// A non-string key was used and the object has no `[]`/`[]=` overload.
    IndexOperationMissing,
    /// A value failed the constraint recorded on the field it was written to.
    ConstraintViolated(String),
    /// `close` on an already closed object.
    AlreadyClosed,
    /// `freeze` on an already frozen object.
    AlreadyFrozen,
    /// A slot index was outside the frame's slot buffer.
    SlotAddressing,
    /// A fast-slot index was outside the frame's fast-slot buffer.
    FastSlotAddressing,
    /// A branch targeted a block index outside the function body.
    BlockAddressing,
    /// Anything else, preformatted (builtin type errors, bounds, etc.).
    Message(String),
}

impl fmt::Display for VmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCallable => write!(f, "object is not callable"),
            Self::ArityMismatch {
                expected,
                got,
                variadic,
            } => {
                if *variadic {
                    write!(f, "arity violation in call: expected at least {expected} arguments, got {got}")
                } else {
                    write!(f, "arity violation in call: expected {expected} arguments, got {got}")
                }
            }
            Self::KeyNotFound(key) => write!(f, "property not found: '{key}'"),
            Self::AssignKeyNotFound(key) => write!(f, "key '{key}' not found in object"),
            Self::AssignToClosed(key) => write!(f, "cannot add key '{key}': object is closed"),
            Self::AssignToImmutable(key) => write!(f, "cannot set key '{key}': object is frozen"),
            Self::InheritFromNoInherit => write!(f, "cannot inherit from this object"),
            Self::IndexOperationMissing => write!(f, "key is not a string"),
            Self::ConstraintViolated(key) => write!(f, "value violates constraint on key '{key}'"),
            Self::AlreadyClosed => write!(f, "object is already closed"),
            Self::AlreadyFrozen => write!(f, "object is already frozen"),
            Self::SlotAddressing => write!(f, "slot addressing error"),
            Self::FastSlotAddressing => write!(f, "fast slot addressing error"),
            Self::BlockAddressing => write!(f, "block addressing error"),
            Self::Message(message) => f.write_str(message),
        }
    }
}

/// One rendered backtrace entry: the function name and its source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Function name, or `<anonymous>` / `<module>` placeholders.
    pub function: String,
    /// Rendered `file:row:col` of the frame's current instruction.
    pub location: String,
}

/// A runtime error with the backtrace captured when it surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmError {
    kind: VmErrorKind,
    trace: Vec<TraceFrame>,
}

impl VmError {
    pub(crate) fn new(kind: VmErrorKind) -> Self {
        Self { kind, trace: Vec::new() }
    }

    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::new(VmErrorKind::Message(message.into()))
    }

    pub(crate) fn set_trace(&mut self, trace: Vec<TraceFrame>) {
        if self.trace.is_empty() {
            self.trace = trace;
        }
    }

    /// The failure class.
    #[must_use]
    pub fn kind(&self) -> &VmErrorKind {
        &self.kind
    }

    /// Innermost-first frames active when the error surfaced.
    #[must_use]
    pub fn backtrace(&self) -> &[TraceFrame] {
        &self.trace
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error: {}", self.kind)?;
        for frame in &self.trace {
            write!(f, "\n  at {} ({})", frame.function, frame.location)?;
        }
        Ok(())
    }
}

impl std::error::Error for VmError {}

/// Result alias used throughout the interpreter.
pub(crate) type RunResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::source::SourceMap;

    #[test]
    fn parse_error_renders_caret() {
        let mut map = SourceMap::new();
        let id = map.register("t.wy", "let x = @;\n", 0, 0);
        let err = ParseError::at(&map, map.base(id) + 8, "expected expression");
        assert_eq!(
            err.to_string(),
            "t.wy:1:9: error: expected expression\nlet x = @;\n        ^"
        );
    }

    #[test]
    fn parse_error_without_location() {
        let map = SourceMap::new();
        let err = ParseError::at(&map, 99, "boom");
        assert_eq!(err.to_string(), "error: boom");
    }

    #[test]
    fn vm_error_displays_trace() {
        let mut err = VmError::new(VmErrorKind::NotCallable);
        err.set_trace(vec![TraceFrame {
            function: "fact".to_owned(),
            location: "t.wy:3:5".to_owned(),
        }]);
        assert_eq!(
            err.to_string(),
            "error: object is not callable\n  at fact (t.wy:3:5)"
        );
    }
}
