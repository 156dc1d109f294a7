//! Source registration and position resolution.
//!
//! Every script buffer handed to the engine is registered in a [`SourceMap`],
//! which assigns it a contiguous range of *global offsets*. Diagnostics, the
//! backtrace renderer and the profiler all work in terms of global offsets and
//! resolve them back to `{file, row, col, line}` on demand.
//!
//! Instructions do not carry offsets directly: the parser allocates a
//! [`SpanId`] per emitted range in a [`SpanTable`] (an append-only arena that
//! outlives the parse), and every instruction references its span by id.

/// Global byte offset into the space of all registered sources.
pub(crate) type Pos = u32;

/// Identifier of a registered source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u32);

/// A registered source buffer with its display name and starting position.
///
/// `row0`/`col0` let a host register a buffer that is an excerpt of a larger
/// file (e.g. a script embedded in a level description) and still report
/// positions in the enclosing file's coordinates.
#[derive(Debug)]
struct SourceRecord {
    name: String,
    text: String,
    base: Pos,
    row0: u32,
    col0: u32,
}

/// Resolved location of a global offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location<'a> {
    /// Display name of the containing source.
    pub name: &'a str,
    /// Zero-based row, offset by the record's starting row.
    pub row: u32,
    /// Zero-based column, offset by the starting column on the first row.
    pub col: u32,
    /// The full text of the containing line, without its newline.
    pub line: &'a str,
}

/// Registry of all source buffers known to an engine.
///
/// Registration is append-only. Lookup scans records newest-first so that a
/// re-registered buffer shadows an older one covering the same offsets.
#[derive(Debug, Default)]
pub struct SourceMap {
    records: Vec<SourceRecord>,
    next_base: Pos,
}

impl SourceMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a source buffer and returns its id.
    pub(crate) fn register(&mut self, name: &str, text: &str, row0: u32, col0: u32) -> SourceId {
        let id = SourceId(u32::try_from(self.records.len()).expect("too many registered sources"));
        let base = self.next_base;
        let len = u32::try_from(text.len()).expect("source buffer exceeds u32 offsets");
        self.next_base = base.checked_add(len + 1).expect("source offset space exhausted");
        self.records.push(SourceRecord {
            name: name.to_owned(),
            text: text.to_owned(),
            base,
            row0,
            col0,
        });
        id
    }

    /// Returns the text of a registered source.
    #[must_use]
    pub fn text(&self, id: SourceId) -> &str {
        &self.records[id.0 as usize].text
    }

    /// Returns the display name of a registered source.
    #[must_use]
    pub fn name(&self, id: SourceId) -> &str {
        &self.records[id.0 as usize].name
    }

    /// Returns the global offset of the first byte of a registered source.
    pub(crate) fn base(&self, id: SourceId) -> Pos {
        self.records[id.0 as usize].base
    }

    /// Resolves a global offset to its source location.
    ///
    /// Scans records newest-first; within the matching record, walks line by
    /// line from the start of the buffer until the containing line is found.
    /// An offset equal to the buffer length (one past the end) resolves to the
    /// last line, so errors at end of input still render.
    #[must_use]
    pub fn locate(&self, pos: Pos) -> Option<Location<'_>> {
        for record in self.records.iter().rev() {
            let len = record.text.len() as u32;
            if pos < record.base || pos > record.base + len {
                continue;
            }
            let local = (pos - record.base) as usize;
            let mut row = 0u32;
            let mut line_start = 0usize;
            loop {
                let rest = &record.text[line_start..];
                let line_len = rest.find('\n').unwrap_or(rest.len());
                // the containing half-open line includes its newline byte
                let line_end_incl = line_start + line_len + usize::from(line_len < rest.len());
                if local < line_end_incl || line_end_incl == record.text.len() {
                    let col = (local.min(line_start + line_len) - line_start) as u32;
                    return Some(Location {
                        name: &record.name,
                        row: row + record.row0,
                        col: col + if row == 0 { record.col0 } else { 0 },
                        line: &record.text[line_start..line_start + line_len],
                    });
                }
                line_start = line_end_incl;
                row += 1;
            }
        }
        None
    }
}

/// Identifier of a recorded source span.
///
/// Spans are the unit the profiler attributes samples to; they are shared
/// between every instruction emitted while the range was active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u32);

/// Half-open `[from, to)` range in global offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub from: Pos,
    pub to: Pos,
}

/// Append-only arena of spans, one per parsed range.
///
/// Owned by the engine alongside the [`SourceMap`]; instructions reference
/// spans by [`SpanId`] so functions stay free of borrowed text.
#[derive(Debug, Default)]
pub struct SpanTable {
    spans: Vec<Span>,
}

impl SpanTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Opens a new span starting at `from`. The end is set later by
    /// [`SpanTable::set_end`]; until then the span is empty.
    pub(crate) fn alloc(&mut self, from: Pos) -> SpanId {
        let id = SpanId(u32::try_from(self.spans.len()).expect("span arena exhausted"));
        self.spans.push(Span { from, to: from });
        id
    }

    pub(crate) fn set_end(&mut self, id: SpanId, to: Pos) {
        self.spans[id.0 as usize].to = to;
    }

    pub(crate) fn get(&self, id: SpanId) -> Span {
        self.spans[id.0 as usize]
    }

    /// Snapshots a span into a new id. The parser uses this to freeze an
    /// expression range that will keep extending as postfix forms accrete.
    pub(crate) fn clone_span(&mut self, id: SpanId) -> SpanId {
        let span = self.get(id);
        let copy = self.alloc(span.from);
        self.set_end(copy, span.to);
        copy
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn locate_finds_row_and_col() {
        let mut map = SourceMap::new();
        let id = map.register("test.wy", "let a = 1;\nlet b = 2;\n", 0, 0);
        let base = map.base(id);

        let loc = map.locate(base).unwrap();
        assert_eq!((loc.row, loc.col), (0, 0));
        assert_eq!(loc.line, "let a = 1;");

        // the 'b' on the second line
        let loc = map.locate(base + 15).unwrap();
        assert_eq!((loc.row, loc.col), (1, 4));
        assert_eq!(loc.line, "let b = 2;");
    }

    #[test]
    fn locate_honors_start_offsets() {
        let mut map = SourceMap::new();
        let id = map.register("level.cfg", "x\ny\n", 10, 3);
        let base = map.base(id);

        // first row carries the column offset, later rows do not
        assert_eq!(map.locate(base).unwrap().col, 3);
        let loc = map.locate(base + 2).unwrap();
        assert_eq!((loc.row, loc.col), (11, 0));
    }

    #[test]
    fn newer_registration_wins() {
        let mut map = SourceMap::new();
        map.register("old.wy", "aaaa", 0, 0);
        let id = map.register("new.wy", "bbbb", 0, 0);
        let loc = map.locate(map.base(id)).unwrap();
        assert_eq!(loc.name, "new.wy");
    }

    #[test]
    fn locate_outside_any_source() {
        let map = SourceMap::new();
        assert_eq!(map.locate(0), None);
    }

    #[test]
    fn span_end_patching() {
        let mut table = SpanTable::new();
        let id = table.alloc(4);
        table.set_end(id, 9);
        assert_eq!(table.get(id), Span { from: 4, to: 9 });
    }
}
