//! An embeddable, prototype-based scripting language.
//!
//! wyrm is a small dynamically-typed language with first-class closures,
//! bound methods, operator overloading through prototype method lookup, a
//! cooperative slot-machine VM, a mark-and-sweep garbage collector and a
//! sampling profiler that renders an HTML heatmap of the source.
//!
//! The pipeline: source bytes go through the scanning primitives into the
//! recursive-descent parser, which emits three-address IR directly through
//! the generator; three optimization passes (string-key inlining, predicted
//! miss redirection, fast-slot promotion) rewrite the finished function; the
//! VM then interprets it against the object heap.
//!
//! ```
//! use wyrm::{CollectStringPrint, Engine};
//!
//! let mut engine = Engine::new();
//! let (_, module) = engine
//!     .parse("fact.wy", "fn fact(n) { if (n == 0) return 1; return n * fact(n - 1); } print(fact(6));")
//!     .unwrap();
//! let mut print = CollectStringPrint::new();
//! engine.run_module(&module, &mut print).unwrap();
//! assert_eq!(print.output(), "720\n");
//! ```
#![expect(dead_code, reason = "the generator keeps emitters for every instruction form")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior matches the VM's int semantics")]

mod builtins;
mod error;
mod r#gen;
mod heap;
mod io;
mod ir;
mod lexer;
mod object;
mod optimize;
mod parser;
mod profile;
mod run;
mod source;
mod vm;

pub use crate::{
    error::{ParseError, TraceFrame, VmError, VmErrorKind},
    heap::{Heap, HeapId, RootSetHandle, Value},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    ir::{AssignType, Slot, UserFunction},
    profile::{DEFAULT_SAMPLE_STRIDE, ProfileState},
    run::Engine,
    source::{Location, SourceId, SourceMap},
};
