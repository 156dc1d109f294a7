//! Public interface for embedding the runtime.
//!
//! An [`Engine`] owns everything a script needs: the heap with its root
//! prototype chain, the registered sources and span arena, and (optionally)
//! the profiler. Parsing and execution are separate steps so a module can be
//! compiled once and run many times:
//!
//! ```
//! use wyrm::{CollectStringPrint, Engine};
//!
//! let mut engine = Engine::new();
//! let (_, module) = engine.parse("hello.wy", "print(1 + 2);").unwrap();
//! let mut print = CollectStringPrint::new();
//! engine.run_module(&module, &mut print).unwrap();
//! assert_eq!(print.output(), "3\n");
//! ```
//!
//! Running a module returns its scope object; `lookup` reads bindings off it
//! so hosts can fetch and [`Engine::call`] script functions directly.

use std::{io, rc::Rc, time::Duration};

use crate::{
    builtins::{self, ValueCache},
    error::{ParseError, VmError},
    heap::{Heap, RootSetHandle, Value},
    io::PrintWriter,
    ir::UserFunction,
    object::{ClosureData, FLAG_NO_INHERIT, ObjectData},
    parser::Parser,
    profile::{DEFAULT_SAMPLE_STRIDE, ProfileState},
    source::{SourceId, SourceMap, SpanTable},
    vm::Vm,
};

/// The embedding entry point: heap, root, sources and profiler in one place.
#[derive(Debug)]
pub struct Engine {
    heap: Heap,
    root: Value,
    cache: ValueCache,
    map: SourceMap,
    spans: SpanTable,
    profile: Option<ProfileState>,
    cycle: u64,
}

impl Engine {
    /// Creates an engine with a freshly built root prototype chain.
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let (root, cache) = builtins::create_root(&mut heap);
        Self {
            heap,
            root,
            cache,
            map: SourceMap::new(),
            spans: SpanTable::new(),
            profile: None,
            cycle: 0,
        }
    }

    /// The root object scripts resolve their outermost names against.
    #[must_use]
    pub fn root(&self) -> Value {
        self.root
    }

    /// Registers a source buffer and parses it into a module function.
    ///
    /// The returned [`SourceId`] identifies the buffer for diagnostics and
    /// [`Engine::dump_profile`].
    pub fn parse(&mut self, name: &str, source: &str) -> Result<(SourceId, Rc<UserFunction>), ParseError> {
        let id = self.map.register(name, source, 0, 0);
        let function = Parser::new(&self.map, &mut self.spans, id).parse_module()?;
        Ok((id, function))
    }

    /// Runs a parsed module with the root as context and returns its scope
    /// object.
    pub fn run_module(
        &mut self,
        module: &Rc<UserFunction>,
        print: &mut impl PrintWriter,
    ) -> Result<Value, VmError> {
        let closure = self.heap.allocate(
            Some(self.cache.closure_proto),
            ObjectData::Closure(ClosureData {
                context: self.root,
                function: module.clone(),
            }),
            0,
        );
        self.call(Some(closure), None, &[], print)
    }

    /// Calls any callable value — a parsed module, a script closure fetched
    /// via [`Engine::lookup`], or a builtin.
    ///
    /// On error the returned [`VmError`] carries the backtrace captured from
    /// the frames that were live when the error surfaced.
    pub fn call(
        &mut self,
        callee: Value,
        this: Value,
        args: &[Value],
        print: &mut impl PrintWriter,
    ) -> Result<Value, VmError> {
        // pin the host's arguments for the duration of the call
        let mut pinned: Vec<Value> = Vec::with_capacity(args.len() + 1);
        pinned.extend_from_slice(args);
        pinned.push(callee);
        let handle = self.heap.add_roots(pinned);

        let mut vm = Vm {
            heap: &mut self.heap,
            root: self.root,
            cache: &self.cache,
            spans: &self.spans,
            map: &self.map,
            profile: self.profile.as_mut(),
            print,
            frames: Vec::new(),
            result: None,
            cycle: self.cycle,
        };
        let outcome = vm.call_value(callee, this, args);
        let outcome = match outcome {
            Ok(value) => Ok(value),
            Err(mut error) => {
                error.set_trace(vm.trace_frames());
                Err(error)
            }
        };
        self.cycle = vm.cycle;
        self.heap.del_roots(handle);
        outcome
    }

    // ------------------------------------------------------------------
    // values
    // ------------------------------------------------------------------

    /// Looks a key up along an object's prototype chain; the outer `Option`
    /// is presence, the inner value may itself be null.
    #[must_use]
    pub fn lookup(&self, object: Value, key: &str) -> Option<Value> {
        self.heap.lookup(object, key)
    }

    #[must_use]
    pub fn new_int(&mut self, value: i32) -> Value {
        builtins::new_int(&mut self.heap, &self.cache, value)
    }

    #[must_use]
    pub fn new_float(&mut self, value: f32) -> Value {
        builtins::new_float(&mut self.heap, &self.cache, value)
    }

    #[must_use]
    pub fn new_string(&mut self, value: &str) -> Value {
        builtins::new_string(&mut self.heap, &self.cache, value)
    }

    #[must_use]
    pub fn new_bool(&self, value: bool) -> Value {
        builtins::new_bool(&self.cache, value)
    }

    #[must_use]
    pub fn int_value(&self, value: Value) -> Option<i32> {
        self.heap.as_int(value)
    }

    #[must_use]
    pub fn float_value(&self, value: Value) -> Option<f32> {
        self.heap.as_float(value)
    }

    #[must_use]
    pub fn bool_value(&self, value: Value) -> Option<bool> {
        self.heap.as_bool(value)
    }

    #[must_use]
    pub fn string_value(&self, value: Value) -> Option<&str> {
        self.heap.as_str(value)
    }

    /// The compiled function behind a closure value, if it is one. Lets the
    /// host inspect arity or switch on the variadic tail.
    #[must_use]
    pub fn closure_function(&self, value: Value) -> Option<Rc<UserFunction>> {
        let id = self.heap.find_callable(value)?;
        match &self.heap.get(id).data {
            ObjectData::Closure(closure) => Some(closure.function.clone()),
            _ => None,
        }
    }

    /// Marks an object as uninheritable: `new` on it reports an error.
    /// There is no surface syntax for this; it is an embedding-level switch.
    pub fn set_no_inherit(&mut self, value: Value) {
        if let Some(id) = value {
            self.heap.get_mut(id).flags |= FLAG_NO_INHERIT;
        }
    }

    // ------------------------------------------------------------------
    // GC control
    // ------------------------------------------------------------------

    /// Pins an object against collection for the engine's lifetime.
    pub fn add_permanent(&mut self, value: Value) {
        self.heap.add_permanent(value);
    }

    /// Registers a host root set; the listed objects stay live until the
    /// set is removed. Removal is strictly LIFO.
    pub fn add_roots(&mut self, objects: Vec<Value>) -> RootSetHandle {
        self.heap.add_roots(objects)
    }

    pub fn del_roots(&mut self, handle: RootSetHandle) {
        self.heap.del_roots(handle);
    }

    /// Direct access to the heap for GC bracketing (`disable_gc` /
    /// `enable_gc`) and statistics.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // ------------------------------------------------------------------
    // profiling
    // ------------------------------------------------------------------

    /// Turns on sampling with the default 100 µs stride.
    pub fn enable_profiling(&mut self) {
        self.enable_profiling_with_stride(DEFAULT_SAMPLE_STRIDE);
    }

    /// Turns on sampling with a custom stride.
    pub fn enable_profiling_with_stride(&mut self, stride: Duration) {
        self.profile = Some(ProfileState::new(stride));
    }

    /// The collected samples so far, if profiling is on.
    #[must_use]
    pub fn profile(&self) -> Option<&ProfileState> {
        self.profile.as_ref()
    }

    /// Writes the HTML heatmap for one registered source. Without profiling
    /// enabled this still renders the escaped source, just without heat.
    pub fn dump_profile(&self, source: SourceId, out: &mut impl io::Write) -> io::Result<()> {
        match &self.profile {
            Some(profile) => profile.dump(&self.map, &self.spans, source, out),
            None => ProfileState::new(DEFAULT_SAMPLE_STRIDE).dump(&self.map, &self.spans, source, out),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::io::CollectStringPrint;

    fn run(source: &str) -> String {
        let mut engine = Engine::new();
        let (_, module) = engine.parse("test.wy", source).unwrap();
        let mut print = CollectStringPrint::new();
        engine.run_module(&module, &mut print).unwrap();
        print.into_output()
    }

    #[test]
    fn module_scope_is_returned() {
        let mut engine = Engine::new();
        let (_, module) = engine.parse("test.wy", "let answer = 42;").unwrap();
        let mut print = CollectStringPrint::new();
        let scope = engine.run_module(&module, &mut print).unwrap();
        let answer = engine.lookup(scope, "answer").unwrap();
        assert_eq!(engine.int_value(answer), Some(42));
    }

    #[test]
    fn host_calls_a_script_function() {
        let mut engine = Engine::new();
        let (_, module) = engine
            .parse("test.wy", "fn double(n) { return n * 2; }")
            .unwrap();
        let mut print = CollectStringPrint::new();
        let scope = engine.run_module(&module, &mut print).unwrap();
        let double = engine.lookup(scope, "double").unwrap();
        let argument = engine.new_int(21);
        let result = engine.call(double, None, &[argument], &mut print).unwrap();
        assert_eq!(engine.int_value(result), Some(42));
    }

    #[test]
    fn arity_mismatch_reports_an_error() {
        let mut engine = Engine::new();
        let (_, module) = engine.parse("test.wy", "fn one(a) { return a; }").unwrap();
        let mut print = CollectStringPrint::new();
        let scope = engine.run_module(&module, &mut print).unwrap();
        let one = engine.lookup(scope, "one").unwrap();
        let err = engine.call(one, None, &[], &mut print).unwrap_err();
        assert!(err.to_string().contains("arity violation"), "{err}");
    }

    #[test]
    fn variadic_tail_accepts_extra_arguments() {
        let mut engine = Engine::new();
        let (_, module) = engine.parse("test.wy", "fn head(a) { return a; }").unwrap();
        let mut print = CollectStringPrint::new();
        let scope = engine.run_module(&module, &mut print).unwrap();
        let head = engine.lookup(scope, "head").unwrap();

        let args: Vec<Value> = (0..3).map(|i| engine.new_int(i)).collect();
        let err = engine.call(head, None, &args, &mut print).unwrap_err();
        assert!(err.to_string().contains("arity violation"), "{err}");

        let function = engine.closure_function(head).unwrap();
        function.set_variadic_tail(true);
        let result = engine.call(head, None, &args, &mut print).unwrap();
        assert_eq!(engine.int_value(result), Some(0));
    }

    #[test]
    fn no_inherit_blocks_new() {
        let mut engine = Engine::new();
        let (_, module) = engine.parse("setup.wy", "let base = { x = 1 };").unwrap();
        let mut print = CollectStringPrint::new();
        let scope = engine.run_module(&module, &mut print).unwrap();
        let base = engine.lookup(scope, "base").unwrap();
        engine.set_no_inherit(base);

        let (_, bad) = engine.parse("bad.wy", "let child = new base { y = 2 };").unwrap();
        // the module chains to the root, not the setup scope, so bind base
        // on the root for the second script to find
        if let Some(root) = engine.root() {
            engine.heap_mut().set_plain(root, "base", base).unwrap();
        }
        let err = engine.run_module(&bad, &mut print).unwrap_err();
        assert!(err.to_string().contains("cannot inherit"), "{err}");
    }

    #[test]
    fn backtrace_names_the_failing_frames() {
        let mut engine = Engine::new();
        let (_, module) = engine
            .parse("trace.wy", "fn inner() { return missing; }\nfn outer() { return inner(); }\nouter();")
            .unwrap();
        let mut print = CollectStringPrint::new();
        let err = engine.run_module(&module, &mut print).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("property not found: 'missing'"), "{rendered}");
        assert!(rendered.contains("at inner (trace.wy:1:"), "{rendered}");
        assert!(rendered.contains("at outer (trace.wy:2:"), "{rendered}");
    }

    #[test]
    fn print_runs_through_the_writer() {
        assert_eq!(run("print(1, 2, 3);"), "123\n");
    }
}
