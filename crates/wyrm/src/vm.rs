//! The bytecode interpreter.
//!
//! Execution is a flat loop over a frame stack: closure calls push a frame
//! and the loop continues, so script recursion never grows the Rust stack.
//! Native functions run inline; when one calls back into script code (the
//! `[]`/`[]=` overload path does) the nested execution runs on the same
//! frame stack with a boundary index.
//!
//! Dispatch runs in batches of nine instructions; between batches sits the
//! safe point where deferred collections run against the live frame view and
//! the profiler takes its clock-driven sample. Nothing else can interleave —
//! the VM is single-threaded and cooperative.
//!
//! On error the frame stack is left intact so the caller can render a
//! backtrace from each frame's current instruction.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    builtins::ValueCache,
    error::{RunResult, TraceFrame, VmError, VmErrorKind},
    heap::{Heap, HeapId, Value},
    io::PrintWriter,
    ir::{AssignType, Op, Slot, UserFunction},
    object::{ClosureData, FLAG_CLOSED, FLAG_IMMUTABLE, ObjectData},
    profile::ProfileState,
    source::{SourceMap, SpanTable},
};

/// Instructions dispatched between safe points (collection + profiling).
const DISPATCH_BATCH: usize = 9;

/// Calls with fewer arguments than this marshal on the stack.
const INLINE_CALL_ARGS: usize = 10;

/// One activation record. The slot buffer is owned by the frame; fast slots
/// are `(object, field index)` cell addresses into closed objects.
#[derive(Debug)]
pub(crate) struct Frame {
    pub function: Rc<UserFunction>,
    pub context: Value,
    pub slots: Vec<Value>,
    pub fast_slots: Vec<Option<(HeapId, usize)>>,
    pub ip: usize,
}

/// The interpreter over an engine's heap and shared state.
pub(crate) struct Vm<'a> {
    pub heap: &'a mut Heap,
    pub root: Value,
    pub cache: &'a ValueCache,
    pub spans: &'a SpanTable,
    pub map: &'a SourceMap,
    pub profile: Option<&'a mut ProfileState>,
    pub print: &'a mut dyn PrintWriter,
    pub frames: Vec<Frame>,
    pub result: Value,
    pub cycle: u64,
}

impl Vm<'_> {
    // ------------------------------------------------------------------
    // value construction (payload + prototype from the cache)
    // ------------------------------------------------------------------

    pub(crate) fn new_int(&mut self, value: i32) -> Value {
        crate::builtins::new_int(self.heap, self.cache, value)
    }

    pub(crate) fn new_float(&mut self, value: f32) -> Value {
        crate::builtins::new_float(self.heap, self.cache, value)
    }

    pub(crate) fn new_string(&mut self, value: &str) -> Value {
        crate::builtins::new_string(self.heap, self.cache, value)
    }

    pub(crate) fn new_bool(&self, value: bool) -> Value {
        crate::builtins::new_bool(self.cache, value)
    }

    pub(crate) fn new_array(&mut self, elements: Vec<Value>) -> RunResult<Value> {
        crate::builtins::new_array(self.heap, self.cache, elements)
    }

    // ------------------------------------------------------------------
    // frame plumbing
    // ------------------------------------------------------------------

    fn load(&self, frame: usize, slot: Slot) -> RunResult<Value> {
        self.frames[frame]
            .slots
            .get(slot)
            .copied()
            .ok_or_else(|| VmError::new(VmErrorKind::SlotAddressing))
    }

    fn store(&mut self, frame: usize, slot: Slot, value: Value) -> RunResult<()> {
        match self.frames[frame].slots.get_mut(slot) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(VmError::new(VmErrorKind::SlotAddressing)),
        }
    }

    fn advance(&mut self, frame: usize) {
        self.frames[frame].ip += 1;
    }

    /// Renders the live frame stack, innermost first, for error reports.
    pub(crate) fn trace_frames(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let span = self.spans.get(frame.function.body.instrs[frame.ip].span);
                let location = match self.map.locate(span.from) {
                    Some(loc) => format!("{}:{}:{}", loc.name, loc.row + 1, loc.col + 1),
                    None => "<unknown>".to_owned(),
                };
                TraceFrame {
                    function: frame.function.name().unwrap_or("<anonymous>").to_owned(),
                    location,
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // calls
    // ------------------------------------------------------------------

    /// Calls any callable to completion and returns its result.
    ///
    /// Natives run inline. Closures push a frame and run the dispatch loop
    /// until the stack returns to its current depth, so this is safe to use
    /// from inside instruction handlers and native functions.
    pub(crate) fn call_value(&mut self, callee: Value, this: Value, args: &[Value]) -> RunResult<Value> {
        let Some(id) = self.heap.find_callable(callee) else {
            return Err(VmError::new(VmErrorKind::NotCallable));
        };
        match &self.heap.get(id).data {
            ObjectData::Function(native) => {
                let native = *native;
                native(self, this, args)
            }
            ObjectData::Closure(_) => {
                let base = self.frames.len();
                self.push_closure_frame(id, this, args)?;
                self.run_to(base)?;
                Ok(self.result.take())
            }
            _ => unreachable!("find_callable returned a non-callable"),
        }
    }

    /// The `Call` instruction body: natives complete immediately into the
    /// pending result, closures push a frame for the main loop to continue.
    fn invoke(&mut self, callee: Value, this: Value, args: &[Value]) -> RunResult<()> {
        let Some(id) = self.heap.find_callable(callee) else {
            return Err(VmError::new(VmErrorKind::NotCallable));
        };
        match &self.heap.get(id).data {
            ObjectData::Function(native) => {
                let native = *native;
                self.result = native(self, this, args)?;
                Ok(())
            }
            ObjectData::Closure(_) => self.push_closure_frame(id, this, args),
            _ => unreachable!("find_callable returned a non-callable"),
        }
    }

    /// Pushes an activation of a closure: arity check, `this` binding for
    /// methods, the `$` tail array for variadics, argument marshalling.
    fn push_closure_frame(&mut self, closure: HeapId, this: Value, args: &[Value]) -> RunResult<()> {
        let (mut context, function) = match &self.heap.get(closure).data {
            ObjectData::Closure(data) => (data.context, data.function.clone()),
            _ => unreachable!("caller checked the payload"),
        };

        let arity = function.arity();
        let variadic = function.has_variadic_tail();
        if (variadic && args.len() < arity) || (!variadic && args.len() != arity) {
            return Err(VmError::new(VmErrorKind::ArityMismatch {
                expected: arity,
                got: args.len(),
                variadic,
            }));
        }
        if function.body.blocks.is_empty() {
            return Err(VmError::msg("invalid function"));
        }

        // context building allocates in several steps; keep the collector out
        self.heap.disable_gc();
        let built = self.build_call_context(context, &function, this, args);
        self.heap.enable_gc();
        context = built?;

        let mut frame = Frame {
            context,
            slots: vec![None; function.slots],
            fast_slots: vec![None; function.fast_slots],
            ip: function.body.blocks[0].start,
            function,
        };
        for (index, &arg) in args.iter().take(arity).enumerate() {
            frame.slots[index + 1] = arg;
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Builds the effective context for a call: the method `this` binding
    /// and the variadic `$` tail, each in its own closed sub-context.
    fn build_call_context(
        &mut self,
        mut context: Value,
        function: &Rc<UserFunction>,
        this: Value,
        args: &[Value],
    ) -> RunResult<Value> {
        if function.is_method() {
            let bound = self.heap.allocate(context, ObjectData::Plain, 0);
            self.heap.set_plain(bound, "this", this)?;
            self.heap.get_mut(bound).flags |= FLAG_CLOSED;
            context = Some(bound);
        }
        if function.has_variadic_tail() {
            let tail = self.new_array(args[function.arity()..].to_vec())?;
            let sub = self.heap.allocate(context, ObjectData::Plain, 0);
            self.heap.set_plain(sub, "$", tail)?;
            self.heap.get_mut(sub).flags |= FLAG_CLOSED;
            context = Some(sub);
        }
        Ok(context)
    }

    // ------------------------------------------------------------------
    // the dispatch loop
    // ------------------------------------------------------------------

    /// Runs until the frame stack shrinks back to `base` frames.
    pub(crate) fn run_to(&mut self, base: usize) -> RunResult<()> {
        while self.frames.len() > base {
            for _ in 0..DISPATCH_BATCH {
                if self.frames.len() == base {
                    break;
                }
                self.step()?;
            }
            self.cycle += DISPATCH_BATCH as u64;
            self.safe_point();
        }
        Ok(())
    }

    /// Collection and profiling; runs only between dispatch batches.
    fn safe_point(&mut self) {
        if self.heap.wants_collection() {
            let mut roots: Vec<HeapId> = Vec::new();
            for frame in &self.frames {
                roots.extend(frame.slots.iter().flatten());
                roots.extend(frame.context);
            }
            roots.extend(self.result);
            roots.extend(self.root);
            self.heap.collect(roots);
        }
        if let Some(profile) = self.profile.as_deref_mut() {
            profile.sample(
                self.cycle,
                self.frames
                    .iter()
                    .rev()
                    .map(|frame| frame.function.body.instrs[frame.ip].span),
            );
        }
    }

    fn truthy(&self, value: Value) -> bool {
        if let Some(b) = self.heap.as_bool(value) {
            return b;
        }
        if let Some(i) = self.heap.as_int(value) {
            return i != 0;
        }
        value.is_some()
    }

    /// Executes a single instruction of the innermost frame.
    fn step(&mut self) -> RunResult<()> {
        let frame = self.frames.len() - 1;
        let function = self.frames[frame].function.clone();
        let ip = self.frames[frame].ip;
        let instr = &function.body.instrs[ip];

        match &instr.op {
            Op::GetRoot { target } => {
                self.store(frame, *target, self.root)?;
                self.advance(frame);
            }
            Op::GetContext { target } => {
                let context = self.frames[frame].context;
                self.store(frame, *target, context)?;
                self.advance(frame);
            }
            Op::NewObject { target, parent } => {
                let parent = self.load(frame, *parent)?;
                if let Some(parent_id) = parent
                    && self.heap.get(parent_id).is_no_inherit()
                {
                    return Err(VmError::new(VmErrorKind::InheritFromNoInherit));
                }
                let id = self.heap.allocate(parent, ObjectData::Plain, 0);
                self.store(frame, *target, Some(id))?;
                self.advance(frame);
            }
            Op::NewInt { target, value } => {
                let cached = function.const_cache.borrow().get(&ip).copied();
                let id = match cached {
                    Some(id) => id,
                    None => {
                        let id = self
                            .heap
                            .allocate(Some(self.cache.int_proto), ObjectData::Int(*value), FLAG_CLOSED | FLAG_IMMUTABLE);
                        self.heap.add_permanent(Some(id));
                        function.const_cache.borrow_mut().insert(ip, id);
                        id
                    }
                };
                self.store(frame, *target, Some(id))?;
                self.advance(frame);
            }
            Op::NewFloat { target, value } => {
                let cached = function.const_cache.borrow().get(&ip).copied();
                let id = match cached {
                    Some(id) => id,
                    None => {
                        let id = self.heap.allocate(
                            Some(self.cache.float_proto),
                            ObjectData::Float(*value),
                            FLAG_CLOSED | FLAG_IMMUTABLE,
                        );
                        self.heap.add_permanent(Some(id));
                        function.const_cache.borrow_mut().insert(ip, id);
                        id
                    }
                };
                self.store(frame, *target, Some(id))?;
                self.advance(frame);
            }
            Op::NewString { target, value } => {
                let cached = function.const_cache.borrow().get(&ip).copied();
                let id = match cached {
                    Some(id) => id,
                    None => {
                        let id = self.heap.allocate(
                            Some(self.cache.string_proto),
                            ObjectData::Str(value.to_string().into_boxed_str()),
                            FLAG_CLOSED | FLAG_IMMUTABLE,
                        );
                        self.heap.add_permanent(Some(id));
                        function.const_cache.borrow_mut().insert(ip, id);
                        id
                    }
                };
                self.store(frame, *target, Some(id))?;
                self.advance(frame);
            }
            Op::NewArray { target } => {
                let array = self.new_array(Vec::new())?;
                self.store(frame, *target, array)?;
                self.advance(frame);
            }
            Op::NewClosure { target, function: closure_fn } => {
                let context = self.load(frame, instr.context_slot)?;
                let id = self.heap.allocate(
                    Some(self.cache.closure_proto),
                    ObjectData::Closure(ClosureData {
                        context,
                        function: closure_fn.clone(),
                    }),
                    0,
                );
                self.store(frame, *target, Some(id))?;
                self.advance(frame);
            }
            Op::CloseObject { slot } => {
                let Some(id) = self.load(frame, *slot)? else {
                    return Err(VmError::msg("cannot close null object"));
                };
                if self.heap.get(id).is_closed() {
                    return Err(VmError::new(VmErrorKind::AlreadyClosed));
                }
                self.heap.get_mut(id).flags |= FLAG_CLOSED;
                self.advance(frame);
            }
            Op::Freeze { slot } => {
                let Some(id) = self.load(frame, *slot)? else {
                    return Err(VmError::msg("cannot freeze null object"));
                };
                if self.heap.get(id).is_immutable() {
                    return Err(VmError::new(VmErrorKind::AlreadyFrozen));
                }
                self.heap.get_mut(id).flags |= FLAG_IMMUTABLE;
                self.advance(frame);
            }
            Op::SetConstraint { object, key, constraint } => {
                let object_value = self.load(frame, *object)?;
                let key_value = self.load(frame, *key)?;
                let constraint_value = self.load(frame, *constraint)?;
                let Some(key_str) = self.heap.as_str(key_value).map(str::to_owned) else {
                    return Err(VmError::msg("constraint key is not a string"));
                };
                let Some(id) = object_value else {
                    return Err(VmError::msg("constraint on null object"));
                };
                self.heap.set_field_constraint(id, &key_str, constraint_value)?;
                self.advance(frame);
            }
            Op::SetConstraintStringKey { object, constraint, key } => {
                let object_value = self.load(frame, *object)?;
                let constraint_value = self.load(frame, *constraint)?;
                let Some(id) = object_value else {
                    return Err(VmError::msg("constraint on null object"));
                };
                self.heap.set_field_constraint(id, key, constraint_value)?;
                self.advance(frame);
            }
            Op::Access { target, object, key } => {
                let object_value = self.load(frame, *object)?;
                let key_value = self.load(frame, *key)?;
                if key_value.is_none() {
                    return Err(VmError::msg("null key slot"));
                }
                let key_str = self.heap.as_str(key_value).map(str::to_owned);
                let found = key_str.as_deref().and_then(|k| self.heap.lookup(object_value, k));
                match found {
                    Some(value) => self.store(frame, *target, value)?,
                    None => match self.heap.lookup(object_value, "[]") {
                        Some(overload) => {
                            let value = self.call_value(overload, object_value, &[key_value])?;
                            self.store(frame, *target, value)?;
                        }
                        None => {
                            return Err(match key_str {
                                Some(k) => VmError::new(VmErrorKind::KeyNotFound(k)),
                                None => VmError::new(VmErrorKind::IndexOperationMissing),
                            });
                        }
                    },
                }
                self.advance(frame);
            }
            Op::AccessStringKey { target, object, key } => {
                let object_value = self.load(frame, *object)?;
                match self.heap.lookup(object_value, key) {
                    Some(value) => self.store(frame, *target, value)?,
                    None => match self.heap.lookup(object_value, "[]") {
                        Some(overload) => {
                            let key_object = self.new_string(key);
                            let value = self.call_value(overload, object_value, &[key_object])?;
                            self.store(frame, *target, value)?;
                        }
                        None => return Err(VmError::new(VmErrorKind::KeyNotFound(key.to_string()))),
                    },
                }
                self.advance(frame);
            }
            Op::Assign { object, key, value, ty } => {
                let object_value = self.load(frame, *object)?;
                let key_value = self.load(frame, *key)?;
                let assigned = self.load(frame, *value)?;
                if key_value.is_none() {
                    return Err(VmError::msg("null key slot"));
                }
                match self.heap.as_str(key_value).map(str::to_owned) {
                    Some(key_str) => self.assign_string(object_value, &key_str, assigned, *ty)?,
                    None => match self.heap.lookup(object_value, "[]=") {
                        Some(overload) => {
                            self.call_value(overload, object_value, &[key_value, assigned])?;
                        }
                        None => return Err(VmError::new(VmErrorKind::IndexOperationMissing)),
                    },
                }
                self.advance(frame);
            }
            Op::AssignStringKey { object, value, key, ty } => {
                let object_value = self.load(frame, *object)?;
                let assigned = self.load(frame, *value)?;
                self.assign_string(object_value, key, assigned, *ty)?;
                self.advance(frame);
            }
            Op::Call { function: callee, this, args } => {
                let callee_value = self.load(frame, *callee)?;
                let this_value = self.load(frame, *this)?;
                let mut argument_values: SmallVec<[Value; INLINE_CALL_ARGS]> = SmallVec::new();
                for &arg in args.iter() {
                    argument_values.push(self.load(frame, arg)?);
                }
                // step past the call first: the callee's frame runs next and
                // this frame resumes at the following instruction
                self.advance(frame);
                self.invoke(callee_value, this_value, &argument_values)?;
            }
            Op::SaveResult { target } => {
                let result = self.result.take();
                self.store(frame, *target, result)?;
                self.advance(frame);
            }
            Op::Return { value } => {
                self.result = self.load(frame, *value)?;
                self.frames.pop();
            }
            Op::Branch { block } => {
                let Some(target) = function.body.blocks.get(*block) else {
                    return Err(VmError::new(VmErrorKind::BlockAddressing));
                };
                self.frames[frame].ip = target.start;
            }
            Op::TestBranch { test, on_true, on_false } => {
                let test_value = self.load(frame, *test)?;
                let block = if self.truthy(test_value) { *on_true } else { *on_false };
                let Some(target) = function.body.blocks.get(block) else {
                    return Err(VmError::new(VmErrorKind::BlockAddressing));
                };
                self.frames[frame].ip = target.start;
            }
            Op::DefineFastSlot { target, object, key } => {
                let object_value = self.load(frame, *object)?;
                let Some(cell) = self.heap.lookup_ref(object_value, key) else {
                    return Err(VmError::new(VmErrorKind::KeyNotFound(key.to_string())));
                };
                match self.frames[frame].fast_slots.get_mut(*target) {
                    Some(slot) => *slot = Some(cell),
                    None => return Err(VmError::new(VmErrorKind::FastSlotAddressing)),
                }
                self.advance(frame);
            }
            Op::ReadFastSlot { source, target } => {
                let cell = self.frames[frame]
                    .fast_slots
                    .get(*source)
                    .copied()
                    .flatten()
                    .ok_or_else(|| VmError::new(VmErrorKind::FastSlotAddressing))?;
                let value = self.heap.get(cell.0).table.entry(cell.1).value;
                self.store(frame, *target, value)?;
                self.advance(frame);
            }
            Op::WriteFastSlot { source, target } => {
                let value = self.load(frame, *source)?;
                let cell = self.frames[frame]
                    .fast_slots
                    .get(*target)
                    .copied()
                    .flatten()
                    .ok_or_else(|| VmError::new(VmErrorKind::FastSlotAddressing))?;
                self.heap.get_mut(cell.0).table.entry_mut(cell.1).value = value;
                self.advance(frame);
            }
        }
        Ok(())
    }

    fn assign_string(&mut self, object: Value, key: &str, value: Value, ty: AssignType) -> RunResult<()> {
        let Some(id) = object else {
            return Err(VmError::msg("assignment to null object"));
        };
        match ty {
            AssignType::Plain => self.heap.set_plain(id, key, value),
            AssignType::Existing => self.heap.set_existing(id, key, value),
            AssignType::Shadowing => self.heap.set_shadowing(id, key, value),
        }
    }
}
