//! IR generator.
//!
//! The parser (and the optimizer, when rebuilding a function) appends
//! instructions through a `Gen`. The generator owns slot allocation, the
//! active scope slot, block termination state and the patching of forward
//! branches whose target blocks do not exist yet.
//!
//! Invariants enforced here:
//! - a slot index, once handed out, is never reused within a function;
//! - a new block may only be opened once the previous one is terminated;
//! - nothing can be appended to a terminated block;
//! - every appended instruction carries the active source range.
//!
//! A generator can be *muted*: every emitter becomes a no-op returning slot 0.
//! The parser uses a muted generator for its speculative passes (compound
//! assignment detection, `for`-step pre-parse) where only cursor movement
//! matters.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{
    ir::{AssignType, Block, FunctionBody, Instr, Op, Slot, UNRESOLVED_BLOCK, UserFunction},
    source::SpanId,
};

/// Which branch field of an emitted instruction a [`BlockRef`] patches.
#[derive(Debug, Clone, Copy)]
enum RefField {
    Branch,
    TrueTarget,
    FalseTarget,
}

/// A forward reference to a block that has not been created yet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockRef {
    instr: usize,
    field: RefField,
    muted: bool,
}

#[derive(Debug)]
pub(crate) struct Gen {
    pub name: Option<Rc<str>>,
    pub arity: usize,
    pub scope: Slot,
    pub is_method: bool,
    pub variadic_tail: bool,
    slot: Slot,
    fast_slot: Slot,
    terminated: bool,
    current_span: Option<SpanId>,
    body: FunctionBody,
    muted: bool,
}

impl Gen {
    /// Generator for a function with `arity` parameters; slots `1..=arity`
    /// are reserved for them, slot 0 stays null.
    pub fn function(name: Option<Rc<str>>, arity: usize, is_method: bool) -> Self {
        Self {
            name,
            arity,
            scope: 0,
            is_method,
            variadic_tail: false,
            slot: arity + 1,
            fast_slot: 0,
            terminated: true,
            current_span: None,
            body: FunctionBody::default(),
            muted: false,
        }
    }

    /// Generator for a module body (no parameters).
    pub fn module() -> Self {
        Self::function(None, 0, false)
    }

    /// Generator used by the optimizer to rebuild a function, keeping the
    /// fast-slot counter where the source function left it.
    pub fn rewrite(fast_slot_base: Slot) -> Self {
        let mut r#gen = Self::function(None, 0, false);
        r#gen.slot = 1;
        r#gen.fast_slot = fast_slot_base;
        r#gen
    }

    /// A muted generator: all emitters are no-ops returning slot 0.
    pub fn muted() -> Self {
        let mut r#gen = Self::module();
        r#gen.muted = true;
        r#gen
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    fn alloc_slot(&mut self) -> Slot {
        if self.muted {
            return 0;
        }
        let slot = self.slot;
        self.slot += 1;
        slot
    }

    fn alloc_fast_slot(&mut self) -> Slot {
        if self.muted {
            return 0;
        }
        let slot = self.fast_slot;
        self.fast_slot += 1;
        slot
    }

    /// Activates a source range; all instructions emitted until the matching
    /// [`Gen::use_range_end`] belong to it. Ranges do not nest.
    pub fn use_range_start(&mut self, span: SpanId) {
        if self.muted {
            return;
        }
        assert!(self.current_span.is_none(), "source range already active");
        self.current_span = Some(span);
    }

    pub fn use_range_end(&mut self, span: SpanId) {
        if self.muted {
            return;
        }
        assert_eq!(self.current_span, Some(span), "mismatched source range");
        self.current_span = None;
    }

    /// Opens a new block. The previous block must be terminated.
    pub fn new_block(&mut self) -> usize {
        if self.muted {
            return 0;
        }
        assert!(self.terminated, "opened a block while the previous one is unterminated");
        self.body.blocks.push(Block {
            start: self.body.instrs.len(),
            len: 0,
        });
        self.terminated = false;
        self.body.blocks.len() - 1
    }

    fn push(&mut self, op: Op) {
        if self.muted {
            return;
        }
        assert!(!self.terminated, "emitted into a terminated block");
        let span = self.current_span.expect("emitted without an active source range");
        let terminates = op.is_terminator();
        self.body.instrs.push(Instr {
            op,
            context_slot: self.scope,
            span,
        });
        self.body.blocks.last_mut().expect("emitted without a block").len += 1;
        if terminates {
            self.terminated = true;
        }
    }

    /// Appends a copy of an instruction, keeping its original span and
    /// context slot. Used by the optimizer when rebuilding bodies.
    pub fn add_like(&mut self, basis: &Instr, op: Op) {
        self.add_with(basis.span, basis.context_slot, op);
    }

    /// Appends an instruction with an explicit span and context slot.
    pub fn add_with(&mut self, span: SpanId, context_slot: Slot, op: Op) {
        assert!(!self.terminated, "emitted into a terminated block");
        let terminates = op.is_terminator();
        self.body.instrs.push(Instr { op, context_slot, span });
        self.body.blocks.last_mut().expect("emitted without a block").len += 1;
        if terminates {
            self.terminated = true;
        }
    }

    /// Hands out a fresh fast-slot index without emitting anything; the
    /// optimizer pairs this with an explicit `DefineFastSlot` emission.
    pub fn next_fast_slot(&mut self) -> Slot {
        self.alloc_fast_slot()
    }

    /// Appends `Return` of slot 0 (null) to finish the trailing block.
    pub fn terminate(&mut self) {
        self.add_return(0);
    }

    pub fn add_get_root(&mut self) -> Slot {
        let target = self.alloc_slot();
        self.push(Op::GetRoot { target });
        target
    }

    pub fn add_get_context(&mut self) -> Slot {
        let target = self.alloc_slot();
        self.push(Op::GetContext { target });
        target
    }

    pub fn add_new_object(&mut self, parent: Slot) -> Slot {
        let target = self.alloc_slot();
        self.push(Op::NewObject { target, parent });
        target
    }

    pub fn add_new_int(&mut self, value: i32) -> Slot {
        let target = self.alloc_slot();
        self.push(Op::NewInt { target, value });
        target
    }

    pub fn add_new_float(&mut self, value: f32) -> Slot {
        let target = self.alloc_slot();
        self.push(Op::NewFloat { target, value });
        target
    }

    pub fn add_new_array(&mut self) -> Slot {
        let target = self.alloc_slot();
        self.push(Op::NewArray { target });
        target
    }

    pub fn add_new_string(&mut self, value: Rc<str>) -> Slot {
        let target = self.alloc_slot();
        self.push(Op::NewString { target, value });
        target
    }

    pub fn add_new_closure(&mut self, function: Rc<UserFunction>) -> Slot {
        let target = self.alloc_slot();
        self.push(Op::NewClosure { target, function });
        target
    }

    pub fn add_close_object(&mut self, slot: Slot) {
        self.push(Op::CloseObject { slot });
    }

    pub fn add_freeze(&mut self, slot: Slot) {
        self.push(Op::Freeze { slot });
    }

    pub fn add_set_constraint(&mut self, object: Slot, key: Slot, constraint: Slot) {
        self.push(Op::SetConstraint { object, key, constraint });
    }

    pub fn add_access(&mut self, object: Slot, key: Slot) -> Slot {
        let target = self.alloc_slot();
        self.push(Op::Access { target, object, key });
        target
    }

    pub fn add_assign(&mut self, object: Slot, key: Slot, value: Slot, ty: AssignType) {
        self.push(Op::Assign { object, key, value, ty });
    }

    /// Emits a call followed by `SaveResult`; returns the result slot.
    pub fn add_call(&mut self, function: Slot, this: Slot, args: &[Slot]) -> Slot {
        self.push(Op::Call {
            function,
            this,
            args: args.into(),
        });
        let target = self.alloc_slot();
        self.push(Op::SaveResult { target });
        target
    }

    pub fn add_return(&mut self, value: Slot) {
        self.push(Op::Return { value });
    }

    /// Emits an unconditional branch with an unresolved target.
    pub fn add_branch(&mut self) -> BlockRef {
        if self.muted {
            return BlockRef {
                instr: 0,
                field: RefField::Branch,
                muted: true,
            };
        }
        let instr = self.body.instrs.len();
        self.push(Op::Branch { block: UNRESOLVED_BLOCK });
        BlockRef {
            instr,
            field: RefField::Branch,
            muted: false,
        }
    }

    /// Emits a conditional branch; both targets start unresolved.
    pub fn add_test_branch(&mut self, test: Slot) -> (BlockRef, BlockRef) {
        if self.muted {
            let dummy = BlockRef {
                instr: 0,
                field: RefField::Branch,
                muted: true,
            };
            return (dummy, dummy);
        }
        let instr = self.body.instrs.len();
        self.push(Op::TestBranch {
            test,
            on_true: UNRESOLVED_BLOCK,
            on_false: UNRESOLVED_BLOCK,
        });
        (
            BlockRef {
                instr,
                field: RefField::TrueTarget,
                muted: false,
            },
            BlockRef {
                instr,
                field: RefField::FalseTarget,
                muted: false,
            },
        )
    }

    /// Patches a forward branch once its target block exists.
    pub fn set_block_ref(&mut self, reference: BlockRef, block: usize) {
        if reference.muted {
            return;
        }
        let instr = &mut self.body.instrs[reference.instr];
        match (&mut instr.op, reference.field) {
            (Op::Branch { block: target }, RefField::Branch)
            | (Op::TestBranch { on_true: target, .. }, RefField::TrueTarget)
            | (Op::TestBranch { on_false: target, .. }, RefField::FalseTarget) => *target = block,
            _ => panic!("block reference does not match its instruction"),
        }
    }

    pub fn add_define_fast_slot(&mut self, object: Slot, key: Rc<str>) -> Slot {
        let target = self.alloc_fast_slot();
        self.push(Op::DefineFastSlot { target, object, key });
        target
    }

    pub fn add_read_fast_slot(&mut self, source: Slot, target: Slot) {
        self.push(Op::ReadFastSlot { source, target });
    }

    pub fn add_write_fast_slot(&mut self, source: Slot, target: Slot) {
        self.push(Op::WriteFastSlot { source, target });
    }

    /// Saves the active scope slot; statements that open sub-scopes restore
    /// it with [`Gen::scope_leave`] on exit.
    pub fn scope_enter(&mut self) -> Slot {
        self.scope
    }

    pub fn scope_leave(&mut self, backup: Slot) {
        self.scope = backup;
    }

    /// Finishes the function. The trailing block must be terminated and all
    /// forward branches patched.
    pub fn build(self) -> UserFunction {
        assert!(!self.muted, "built a function from a muted generator");
        assert!(self.terminated, "built a function with an unterminated block");
        debug_assert!(
            !self.body.instrs.iter().any(|i| match &i.op {
                Op::Branch { block } => *block == UNRESOLVED_BLOCK,
                Op::TestBranch { on_true, on_false, .. } =>
                    *on_true == UNRESOLVED_BLOCK || *on_false == UNRESOLVED_BLOCK,
                _ => false,
            }),
            "built a function with unresolved branches"
        );
        UserFunction {
            arity: self.arity,
            slots: self.slot,
            fast_slots: self.fast_slot,
            name: self.name,
            is_method: self.is_method,
            variadic_tail: Cell::new(self.variadic_tail),
            body: self.body,
            const_cache: RefCell::new(ahash::AHashMap::new()),
        }
    }

    pub(crate) fn body(&self) -> &FunctionBody {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SpanTable;

    fn span(table: &mut SpanTable) -> SpanId {
        table.alloc(0)
    }

    #[test]
    fn slots_are_never_reused() {
        let mut spans = SpanTable::new();
        let s = span(&mut spans);
        let mut r#gen = Gen::module();
        r#gen.new_block();
        r#gen.use_range_start(s);
        let a = r#gen.add_new_int(1);
        let b = r#gen.add_new_int(2);
        let c = r#gen.add_access(a, b);
        r#gen.use_range_end(s);
        assert!(a < b && b < c);
    }

    #[test]
    fn build_requires_termination() {
        let mut spans = SpanTable::new();
        let s = span(&mut spans);
        let mut r#gen = Gen::module();
        r#gen.new_block();
        r#gen.use_range_start(s);
        r#gen.terminate();
        r#gen.use_range_end(s);
        let function = r#gen.build();
        assert_eq!(function.body.blocks.len(), 1);
        assert!(function.body.instrs.last().unwrap().op.is_terminator());
    }

    #[test]
    #[should_panic(expected = "terminated block")]
    fn emitting_into_terminated_block_panics() {
        let mut spans = SpanTable::new();
        let s = span(&mut spans);
        let mut r#gen = Gen::module();
        r#gen.new_block();
        r#gen.use_range_start(s);
        r#gen.terminate();
        r#gen.add_new_int(1);
    }

    #[test]
    fn forward_branches_are_patched() {
        let mut spans = SpanTable::new();
        let s = span(&mut spans);
        let mut r#gen = Gen::module();
        r#gen.new_block();
        r#gen.use_range_start(s);
        let branch = r#gen.add_branch();
        let target = r#gen.new_block();
        r#gen.set_block_ref(branch, target);
        r#gen.terminate();
        r#gen.use_range_end(s);
        let function = r#gen.build();
        match &function.body.instrs[0].op {
            Op::Branch { block } => assert_eq!(*block, target),
            op => panic!("expected branch, got {op:?}"),
        }
    }

    #[test]
    fn muted_generator_emits_nothing() {
        let mut r#gen = Gen::muted();
        r#gen.new_block();
        let slot = r#gen.add_new_int(7);
        assert_eq!(slot, 0);
        let (t, f) = r#gen.add_test_branch(slot);
        r#gen.set_block_ref(t, 3);
        r#gen.set_block_ref(f, 4);
        assert!(r#gen.body().instrs.is_empty());
    }
}
