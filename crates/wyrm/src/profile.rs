//! Sampling profiler and its HTML heatmap report.
//!
//! Between dispatch batches the VM offers the profiler a look at the live
//! frame stack. If the configured stride has elapsed on the monotonic clock,
//! one *direct* sample is charged to the innermost frame's source span and
//! one *indirect* sample to each enclosing frame's span — at most once per
//! cycle per span, so a function that appears many times in a deep recursion
//! is not over-counted.
//!
//! The report reproduces the source inside `<pre>`, wrapping every sampled
//! range in a `<span>`: background heat follows the direct share, font
//! weight, size and bottom border follow the indirect share, and z-index
//! decreases with nesting so inner spans stay on top. Ranges are emitted in
//! `(start ascending, end descending)` order, outermost first at any given
//! start.

use std::{
    io::{self, Write},
    time::{Duration, Instant},
};

use ahash::AHashMap;

use crate::source::{Pos, SourceId, SourceMap, SpanId, SpanTable};

/// Default sampling stride: one sample per 100 µs of wall time.
pub const DEFAULT_SAMPLE_STRIDE: Duration = Duration::from_micros(100);

/// Accumulated samples, keyed by source span.
#[derive(Debug)]
pub struct ProfileState {
    stride: Duration,
    last_sample: Option<Instant>,
    direct: AHashMap<SpanId, u64>,
    indirect: AHashMap<SpanId, u64>,
    /// Cycle stamp of the last indirect attribution per span; dedups
    /// recursive frames within one sample.
    last_cycle_seen: AHashMap<SpanId, u64>,
}

impl ProfileState {
    #[must_use]
    pub(crate) fn new(stride: Duration) -> Self {
        Self {
            stride,
            last_sample: None,
            direct: AHashMap::new(),
            indirect: AHashMap::new(),
            last_cycle_seen: AHashMap::new(),
        }
    }

    /// Total number of direct samples taken so far.
    #[must_use]
    pub fn direct_samples(&self) -> u64 {
        self.direct.values().sum()
    }

    /// Offers a sample; `frames` yields the span of each live frame,
    /// innermost first. Ignored unless the stride has elapsed.
    pub(crate) fn sample(&mut self, cycle: u64, frames: impl Iterator<Item = SpanId>) {
        let now = Instant::now();
        match self.last_sample {
            None => {
                self.last_sample = Some(now);
                return;
            }
            Some(last) if now.duration_since(last) <= self.stride => return,
            Some(_) => self.last_sample = Some(now),
        }
        for (depth, span) in frames.enumerate() {
            if depth == 0 {
                *self.direct.entry(span).or_insert(0) += 1;
            } else if self.last_cycle_seen.get(&span) != Some(&cycle) {
                *self.indirect.entry(span).or_insert(0) += 1;
            }
            self.last_cycle_seen.insert(span, cycle);
        }
    }

    /// Writes the HTML heatmap for one registered source.
    pub fn dump(
        &self,
        map: &SourceMap,
        spans: &SpanTable,
        source: SourceId,
        out: &mut impl Write,
    ) -> io::Result<()> {
        let text = map.text(source);
        let base = map.base(source);
        let end = base + text.len() as u32;

        let in_source = |from: Pos, to: Pos| from >= base && to <= end && from <= to;
        let mut records: Vec<ProfileRecord> = Vec::new();
        for (&span, &samples) in &self.direct {
            let span = spans.get(span);
            if in_source(span.from, span.to) {
                records.push(ProfileRecord {
                    from: span.from,
                    to: span.to,
                    samples,
                    direct: true,
                });
            }
        }
        for (&span, &samples) in &self.indirect {
            let span = spans.get(span);
            if in_source(span.from, span.to) {
                records.push(ProfileRecord {
                    from: span.from,
                    to: span.to,
                    samples,
                    direct: false,
                });
            }
        }

        // ranges starting earlier first; at the same start the longer
        // (outer) range comes first
        records.sort_by(|a, b| a.from.cmp(&b.from).then(b.to.cmp(&a.to)));

        let max_direct = records
            .iter()
            .filter(|r| r.direct)
            .map(|r| r.samples)
            .max()
            .unwrap_or(0)
            .max(1);
        let sum_direct = records
            .iter()
            .filter(|r| r.direct)
            .map(|r| r.samples)
            .sum::<u64>()
            .max(1);

        writeln!(out, "<!DOCTYPE html>")?;
        writeln!(out, "<html>")?;
        writeln!(out, "<head>")?;
        writeln!(out, "<style>")?;
        writeln!(out, "span {{ position: relative; }}")?;
        writeln!(out, "</style>")?;
        writeln!(out, "</head>")?;
        writeln!(out, "<body>")?;
        writeln!(out, "<pre>")?;

        let mut open: Vec<usize> = Vec::new();
        let mut next_record = 0usize;
        let mut z_index = 100_000i64;

        for (offset, byte) in text.bytes().enumerate() {
            let position = base + offset as u32;

            while open.last().is_some_and(|&r| records[r].to == position) {
                open.pop();
                write!(out, "</span>")?;
            }
            while next_record < records.len() && records[next_record].from < position {
                next_record += 1;
            }
            while next_record < records.len() && records[next_record].from == position {
                open.push(next_record);
                write_span_open(out, &records, &open, sum_direct, max_direct, &mut z_index)?;
                next_record += 1;
            }
            // zero-width ranges close again immediately
            while open.last().is_some_and(|&r| records[r].to == position) {
                open.pop();
                write!(out, "</span>")?;
            }

            match byte {
                b'<' => write!(out, "&lt;")?,
                b'>' => write!(out, "&gt;")?,
                _ => out.write_all(&[byte])?,
            }
        }
        for _ in open.drain(..) {
            write!(out, "</span>")?;
        }

        writeln!(out, "</pre>")?;
        writeln!(out, "</body>")?;
        writeln!(out, "</html>")?;
        Ok(())
    }

}

/// Opens one `<span>`, styled from the innermost direct and indirect
/// sample counts visible on the open-range stack.
fn write_span_open(
    out: &mut impl Write,
    records: &[ProfileRecord],
    open: &[usize],
    sum_direct: u64,
    max_direct: u64,
    z_index: &mut i64,
) -> io::Result<()> {
    let mut samples_direct = 0u64;
    let mut samples_indirect = 0u64;
    let mut seen_direct = false;
    let mut seen_indirect = false;
    for &index in open.iter().rev() {
        let record = &records[index];
        if record.direct && !seen_direct {
            samples_direct = record.samples;
            seen_direct = true;
        }
        if !record.direct && !seen_indirect {
            samples_indirect = record.samples;
            seen_indirect = true;
        }
        if seen_direct && seen_indirect {
            break;
        }
    }

    let percent_direct = samples_direct as f64 * 100.0 / sum_direct as f64;
    let percent_indirect = samples_indirect as f64 * 100.0 / sum_direct as f64;
    let hex_direct = 255 - (samples_direct * 255 / max_direct) as i64;
    let weight_indirect = 100 + 100 * (samples_indirect * 8 / sum_direct);
    let border_indirect = samples_indirect as f64 * 3.0 / sum_direct as f64;
    let font_size_indirect = 100 + samples_indirect * 10 / sum_direct;
    let border_column = 15 - (15.0 * border_indirect.min(1.0)) as i64;

    write!(
        out,
        "<span title=\"{percent_direct:.2}% active, {percent_indirect:.2}% in backtrace\" style=\""
    )?;
    if hex_direct <= 250 {
        write!(out, "background-color:#ff{hex_direct:02x}{hex_direct:02x};")?;
    }
    write!(
        out,
        "font-weight:{weight_indirect}; border-bottom:{border_indirect}px solid \
         #{border_column:x}{border_column:x}{border_column:x}; font-size: {font_size_indirect}%;"
    )?;
    *z_index -= 1;
    write!(out, "z-index: {z_index};")?;
    write!(out, "\">")?;
    Ok(())
}

/// One sampled range flattened for rendering.
#[derive(Debug, Clone, Copy)]
struct ProfileRecord {
    from: Pos,
    to: Pos,
    samples: u64,
    direct: bool,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn state_with_samples(map: &SourceMap, spans: &mut SpanTable, source: SourceId) -> ProfileState {
        let base = map.base(source);
        let outer = spans.alloc(base);
        spans.set_end(outer, base + 12);
        let inner = spans.alloc(base + 4);
        spans.set_end(inner, base + 8);
        let mut state = ProfileState::new(DEFAULT_SAMPLE_STRIDE);
        state.direct.insert(inner, 10);
        state.direct.insert(outer, 2);
        state.indirect.insert(outer, 6);
        state
    }

    #[test]
    fn dump_escapes_and_nests() {
        let mut map = SourceMap::new();
        let mut spans = SpanTable::new();
        let id = map.register("p.wy", "abcd<efg>hijk", 0, 0);
        let state = state_with_samples(&map, &mut spans, id);

        let mut out = Vec::new();
        state.dump(&map, &spans, id, &mut out).unwrap();
        let html = String::from_utf8(out).unwrap();

        assert!(html.contains("&lt;"), "{html}");
        assert!(html.contains("&gt;"), "{html}");
        assert!(!html.contains("<efg>"), "{html}");
        assert!(html.contains("background-color:#ff"), "{html}");
        assert_eq!(html.matches("<span").count(), html.matches("</span>").count());
    }

    #[test]
    fn spans_open_in_sorted_order() {
        let mut map = SourceMap::new();
        let mut spans = SpanTable::new();
        let id = map.register("p.wy", "abcdefghijkl", 0, 0);
        let state = state_with_samples(&map, &mut spans, id);

        let mut out = Vec::new();
        state.dump(&map, &spans, id, &mut out).unwrap();
        let html = String::from_utf8(out).unwrap();

        // the outer range opens before the first character, the inner one
        // only after "abcd" has been emitted
        let body = &html[html.find("<pre>").unwrap()..];
        let first_char = body.find('a').unwrap();
        let first_span = body.find("<span").unwrap();
        let last_span = body.rfind("<span").unwrap();
        let after_d = body.find('d').unwrap();
        assert!(first_span < first_char, "{body}");
        assert!(last_span > after_d, "{body}");
    }

    #[test]
    fn sampling_respects_the_stride() {
        let mut spans = SpanTable::new();
        let span = spans.alloc(0);
        spans.set_end(span, 4);
        let mut state = ProfileState::new(Duration::from_secs(3600));
        // first call arms the clock, second is inside the stride
        state.sample(9, [span].into_iter());
        state.sample(18, [span].into_iter());
        assert_eq!(state.direct_samples(), 0);

        let mut eager = ProfileState::new(Duration::ZERO);
        eager.sample(9, [span].into_iter());
        std::thread::sleep(Duration::from_millis(2));
        eager.sample(18, [span].into_iter());
        assert_eq!(eager.direct_samples(), 1);
    }

    #[test]
    fn indirect_samples_dedup_within_a_cycle() {
        let mut spans = SpanTable::new();
        let inner = spans.alloc(0);
        spans.set_end(inner, 2);
        let outer = spans.alloc(4);
        spans.set_end(outer, 8);
        let mut state = ProfileState::new(Duration::ZERO);
        state.sample(1, std::iter::empty());
        std::thread::sleep(Duration::from_millis(2));
        // recursive stack: the same enclosing span appears twice
        state.sample(9, [inner, outer, outer].into_iter());
        assert_eq!(state.indirect.get(&outer), Some(&1));
    }
}
