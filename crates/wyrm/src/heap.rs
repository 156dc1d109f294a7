//! Object heap and mark-and-sweep collector.
//!
//! Objects live in an arena addressed by [`HeapId`] handles; a null reference
//! is simply `None`. The collector threads an intrusive singly-linked
//! allocation list through the objects (`Object::prev`) and sweeps it after
//! marking everything reachable from the registered roots: the permanents,
//! the host root sets, and whatever root view the VM passes in (its frame
//! slots, contexts and pending result).
//!
//! Collection runs only at VM safe points, between dispatch batches; an
//! allocation that crosses the threshold schedules a collection rather than
//! performing one. The `disable`/`enable` counter additionally lets multi-step
//! allocation sequences hold collection off; a collection requested while
//! disabled is remembered and runs at the next safe point after re-enabling.

use crate::{
    error::{RunResult, VmError, VmErrorKind},
    object::{FLAG_MARKED, Object, ObjectData},
};

/// Handle to an object in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

/// A nullable object reference — the only value type scripts ever see.
pub type Value = Option<HeapId>;

/// Handle returned by [`Heap::add_roots`]; deregistration is strictly LIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootSetHandle(usize);

/// Collections trigger once this many objects exist, before the adaptive
/// threshold takes over.
const INITIAL_RUN_THRESHOLD: usize = 10_000;

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Object>>,
    free: Vec<u32>,
    last_allocated: Value,
    num_allocated: usize,
    next_run: usize,
    disabled: usize,
    missed: bool,
    permanents: Vec<Value>,
    host_roots: Vec<Option<Vec<Value>>>,
}

impl Heap {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            next_run: INITIAL_RUN_THRESHOLD,
            ..Self::default()
        }
    }

    /// Number of live objects.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.num_allocated
    }

    pub(crate) fn get(&self, id: HeapId) -> &Object {
        self.slots[id.0 as usize].as_ref().expect("stale heap id")
    }

    pub(crate) fn get_mut(&mut self, id: HeapId) -> &mut Object {
        self.slots[id.0 as usize].as_mut().expect("stale heap id")
    }

    /// Allocates a new object, linking it into the allocation list.
    pub(crate) fn allocate(&mut self, parent: Value, data: ObjectData, flags: u8) -> HeapId {
        let mut object = Object::new(parent, data, flags);
        object.prev = self.last_allocated;
        let id = if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(object);
            HeapId(index)
        } else {
            let index = u32::try_from(self.slots.len()).expect("heap exhausted");
            self.slots.push(Some(object));
            HeapId(index)
        };
        self.last_allocated = Some(id);
        self.num_allocated += 1;
        id
    }

    // ------------------------------------------------------------------
    // collection
    // ------------------------------------------------------------------

    /// Whether the VM should run a collection at the next safe point.
    pub(crate) fn wants_collection(&self) -> bool {
        (self.num_allocated > self.next_run || self.missed) && self.disabled == 0
    }

    /// Suspends collection; nested calls stack.
    pub fn disable_gc(&mut self) {
        self.disabled += 1;
    }

    /// Re-enables collection. A collection that was requested while disabled
    /// stays scheduled and runs at the next safe point.
    pub fn enable_gc(&mut self) {
        assert!(self.disabled > 0, "enable_gc without matching disable_gc");
        self.disabled -= 1;
    }

    /// Pins an object for the lifetime of the heap.
    pub fn add_permanent(&mut self, value: Value) {
        self.permanents.push(value);
    }

    /// Registers a host-managed root set. The objects listed stay live until
    /// the set is removed with [`Heap::del_roots`].
    pub fn add_roots(&mut self, objects: Vec<Value>) -> RootSetHandle {
        self.host_roots.push(Some(objects));
        RootSetHandle(self.host_roots.len() - 1)
    }

    /// Removes a host root set. Sets must be removed in reverse registration
    /// order.
    pub fn del_roots(&mut self, handle: RootSetHandle) {
        assert_eq!(
            handle.0 + 1,
            self.host_roots.len(),
            "root sets must be deregistered LIFO"
        );
        self.host_roots.pop();
        while self.host_roots.last().is_some_and(Option::is_none) {
            self.host_roots.pop();
        }
    }

    /// Runs mark and sweep with the given extra roots (the VM's live view).
    ///
    /// When collection is disabled the request is remembered and re-attempted
    /// at the next safe point.
    pub(crate) fn collect(&mut self, extra_roots: impl IntoIterator<Item = HeapId>) {
        if self.disabled > 0 {
            self.missed = true;
            return;
        }
        self.missed = false;
        self.mark(extra_roots);
        self.sweep();
        self.next_run = self.num_allocated + self.num_allocated / 2 + INITIAL_RUN_THRESHOLD;
    }

    fn mark(&mut self, extra_roots: impl IntoIterator<Item = HeapId>) {
        let mut worklist: Vec<HeapId> = Vec::new();
        worklist.extend(self.permanents.iter().flatten());
        for set in self.host_roots.iter().flatten() {
            worklist.extend(set.iter().flatten());
        }
        worklist.extend(extra_roots);

        while let Some(id) = worklist.pop() {
            let object = self.get_mut(id);
            if object.is_marked() {
                continue;
            }
            object.flags |= FLAG_MARKED;
            let object = self.get(id);
            if let Some(parent) = object.parent {
                worklist.push(parent);
            }
            for field in object.table.iter() {
                if let Some(value) = field.value {
                    worklist.push(value);
                }
                if let Some(constraint) = field.constraint {
                    worklist.push(constraint);
                }
            }
            match &object.data {
                ObjectData::Array(elements) => worklist.extend(elements.iter().flatten()),
                ObjectData::Closure(closure) => worklist.extend(closure.context),
                _ => {}
            }
        }
    }

    fn sweep(&mut self) {
        let mut cursor = self.last_allocated;
        let mut previous_kept: Value = None;
        self.last_allocated = None;
        while let Some(id) = cursor {
            let next = self.get(id).prev;
            if self.get(id).is_marked() {
                let object = self.get_mut(id);
                object.flags &= !FLAG_MARKED;
                object.prev = None;
                match previous_kept {
                    Some(kept) => self.get_mut(kept).prev = Some(id),
                    None => self.last_allocated = Some(id),
                }
                previous_kept = Some(id);
            } else {
                self.slots[id.0 as usize] = None;
                self.free.push(id.0);
                self.num_allocated -= 1;
            }
            cursor = next;
        }
    }

    // ------------------------------------------------------------------
    // prototype-chain operations
    // ------------------------------------------------------------------

    /// Walks the prototype chain and returns the value of `key` from the
    /// first table that contains it.
    ///
    /// The outer `Option` is "was the key found"; the inner [`Value`] may
    /// itself be null (e.g. the root's `null` binding).
    pub(crate) fn lookup(&self, object: Value, key: &str) -> Option<Value> {
        let mut current = object;
        while let Some(id) = current {
            let object = self.get(id);
            if let Some(index) = object.table.lookup(key) {
                return Some(object.table.entry(index).value);
            }
            current = object.parent;
        }
        None
    }

    /// Like [`Heap::lookup`] but returns the owning object and field index —
    /// the stable cell address backing fast slots.
    pub(crate) fn lookup_ref(&self, object: Value, key: &str) -> Option<(HeapId, usize)> {
        let mut current = object;
        while let Some(id) = current {
            let object = self.get(id);
            if let Some(index) = object.table.lookup(key) {
                return Some((id, index));
            }
            current = object.parent;
        }
        None
    }

    fn check_constraint(&self, key: &str, constraint: Value, value: Value) -> RunResult<()> {
        let Some(constraint) = constraint else {
            return Ok(());
        };
        if self.instance_of(value, constraint).is_none() {
            return Err(VmError::new(VmErrorKind::ConstraintViolated(key.to_owned())));
        }
        Ok(())
    }

    /// Plain write: add or replace `key` on the object itself.
    pub(crate) fn set_plain(&mut self, id: HeapId, key: &str, value: Value) -> RunResult<()> {
        let object = self.get(id);
        match object.table.lookup(key) {
            Some(index) => {
                if object.is_immutable() {
                    return Err(VmError::new(VmErrorKind::AssignToImmutable(key.to_owned())));
                }
                let constraint = object.table.entry(index).constraint;
                self.check_constraint(key, constraint, value)?;
                self.get_mut(id).table.entry_mut(index).value = value;
            }
            None => {
                if object.is_closed() {
                    return Err(VmError::new(VmErrorKind::AssignToClosed(key.to_owned())));
                }
                if object.is_immutable() {
                    return Err(VmError::new(VmErrorKind::AssignToImmutable(key.to_owned())));
                }
                let (index, _) = self.get_mut(id).table.lookup_or_insert(key);
                self.get_mut(id).table.entry_mut(index).value = value;
            }
        }
        Ok(())
    }

    /// Existing write: replace `key` in place at its first owner on the
    /// chain. An immutable owner (or no owner at all) reports the key as
    /// not found — this is what makes rebinding a `const` an error.
    pub(crate) fn set_existing(&mut self, id: HeapId, key: &str, value: Value) -> RunResult<()> {
        let mut current = Some(id);
        while let Some(owner) = current {
            let object = self.get(owner);
            if let Some(index) = object.table.lookup(key) {
                if object.is_immutable() {
                    return Err(VmError::new(VmErrorKind::AssignKeyNotFound(key.to_owned())));
                }
                let constraint = object.table.entry(index).constraint;
                self.check_constraint(key, constraint, value)?;
                self.get_mut(owner).table.entry_mut(index).value = value;
                return Ok(());
            }
            current = object.parent;
        }
        Err(VmError::new(VmErrorKind::AssignKeyNotFound(key.to_owned())))
    }

    /// Shadowing write: if `key` exists anywhere on the chain, write it on
    /// the object itself; otherwise the key is unknown.
    pub(crate) fn set_shadowing(&mut self, id: HeapId, key: &str, value: Value) -> RunResult<()> {
        let mut current = Some(id);
        while let Some(owner) = current {
            if self.get(owner).table.lookup(key).is_some() {
                return self.set_plain(id, key, value);
            }
            current = self.get(owner).parent;
        }
        Err(VmError::new(VmErrorKind::AssignKeyNotFound(key.to_owned())))
    }

    /// Records a constraint object on a field of the object itself; later
    /// plain/existing writes to the field must satisfy it.
    pub(crate) fn set_field_constraint(&mut self, id: HeapId, key: &str, constraint: Value) -> RunResult<()> {
        match self.get(id).table.lookup(key) {
            Some(index) => {
                self.get_mut(id).table.entry_mut(index).constraint = constraint;
                Ok(())
            }
            None => Err(VmError::new(VmErrorKind::KeyNotFound(key.to_owned()))),
        }
    }

    /// Returns the first object on the chain whose parent is `prototype`.
    pub(crate) fn instance_of(&self, object: Value, prototype: HeapId) -> Option<HeapId> {
        let mut current = object;
        while let Some(id) = current {
            let object = self.get(id);
            if object.parent == Some(prototype) {
                return Some(id);
            }
            current = object.parent;
        }
        None
    }

    /// Finds the first object on the chain whose payload satisfies `pred`.
    fn chain_find(&self, object: Value, pred: impl Fn(&ObjectData) -> bool) -> Option<HeapId> {
        let mut current = object;
        while let Some(id) = current {
            let object = self.get(id);
            if pred(&object.data) {
                return Some(id);
            }
            current = object.parent;
        }
        None
    }

    pub(crate) fn as_int(&self, value: Value) -> Option<i32> {
        let id = self.chain_find(value, |d| matches!(d, ObjectData::Int(_)))?;
        match &self.get(id).data {
            ObjectData::Int(i) => Some(*i),
            _ => unreachable!(),
        }
    }

    pub(crate) fn as_float(&self, value: Value) -> Option<f32> {
        let id = self.chain_find(value, |d| matches!(d, ObjectData::Float(_)))?;
        match &self.get(id).data {
            ObjectData::Float(f) => Some(*f),
            _ => unreachable!(),
        }
    }

    pub(crate) fn as_bool(&self, value: Value) -> Option<bool> {
        let id = self.chain_find(value, |d| matches!(d, ObjectData::Bool(_)))?;
        match &self.get(id).data {
            ObjectData::Bool(b) => Some(*b),
            _ => unreachable!(),
        }
    }

    pub(crate) fn as_str(&self, value: Value) -> Option<&str> {
        let id = self.chain_find(value, |d| matches!(d, ObjectData::Str(_)))?;
        match &self.get(id).data {
            ObjectData::Str(s) => Some(s),
            _ => unreachable!(),
        }
    }

    /// Finds the object on the chain carrying the array payload.
    pub(crate) fn find_array(&self, value: Value) -> Option<HeapId> {
        self.chain_find(value, |d| matches!(d, ObjectData::Array(_)))
    }

    /// Finds the object on the chain carrying a callable payload.
    pub(crate) fn find_callable(&self, value: Value) -> Option<HeapId> {
        self.chain_find(value, |d| {
            matches!(d, ObjectData::Function(_) | ObjectData::Closure(_))
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::object::{FLAG_CLOSED, FLAG_IMMUTABLE};

    fn plain(heap: &mut Heap, parent: Value) -> HeapId {
        heap.allocate(parent, ObjectData::Plain, 0)
    }

    #[test]
    fn collect_frees_unreachable_keeps_rooted() {
        let mut heap = Heap::new();
        let kept = plain(&mut heap, None);
        let _garbage = plain(&mut heap, None);
        assert_eq!(heap.live_objects(), 2);
        heap.collect([kept]);
        assert_eq!(heap.live_objects(), 1);
        // the kept object is still addressable
        assert!(heap.get(kept).table.len() == 0);
    }

    #[test]
    fn fields_and_parents_keep_objects_alive() {
        let mut heap = Heap::new();
        let parent = plain(&mut heap, None);
        let child = plain(&mut heap, Some(parent));
        let held = plain(&mut heap, None);
        heap.set_plain(child, "held", Some(held)).unwrap();
        heap.collect([child]);
        assert_eq!(heap.live_objects(), 3);
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::new();
        let a = plain(&mut heap, None);
        let b = plain(&mut heap, None);
        heap.set_plain(a, "other", Some(b)).unwrap();
        heap.set_plain(b, "other", Some(a)).unwrap();
        heap.collect(None);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn permanents_survive_collection() {
        let mut heap = Heap::new();
        let pinned = plain(&mut heap, None);
        heap.add_permanent(Some(pinned));
        heap.collect(None);
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn host_root_sets_are_lifo() {
        let mut heap = Heap::new();
        let a = plain(&mut heap, None);
        let b = plain(&mut heap, None);
        let first = heap.add_roots(vec![Some(a)]);
        let second = heap.add_roots(vec![Some(b)]);
        heap.collect(None);
        assert_eq!(heap.live_objects(), 2);
        heap.del_roots(second);
        heap.collect(None);
        assert_eq!(heap.live_objects(), 1);
        heap.del_roots(first);
        heap.collect(None);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn disabled_collection_is_deferred() {
        let mut heap = Heap::new();
        let _garbage = plain(&mut heap, None);
        heap.disable_gc();
        heap.collect(None);
        assert_eq!(heap.live_objects(), 1);
        heap.enable_gc();
        assert!(heap.wants_collection());
        heap.collect(None);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn set_existing_walks_the_chain() {
        let mut heap = Heap::new();
        let parent = plain(&mut heap, None);
        heap.set_plain(parent, "x", None).unwrap();
        let child = plain(&mut heap, Some(parent));
        let value = plain(&mut heap, None);
        heap.set_existing(child, "x", Some(value)).unwrap();
        assert_eq!(heap.lookup(Some(child), "x"), Some(Some(value)));
        // the write landed on the parent, not the child
        assert_eq!(heap.get(child).table.len(), 0);
    }

    #[test]
    fn set_existing_on_immutable_owner_reports_missing_key() {
        let mut heap = Heap::new();
        let scope = plain(&mut heap, None);
        heap.set_plain(scope, "k", None).unwrap();
        heap.get_mut(scope).flags |= FLAG_CLOSED | FLAG_IMMUTABLE;
        let err = heap.set_existing(scope, "k", None).unwrap_err();
        assert_eq!(err.kind(), &VmErrorKind::AssignKeyNotFound("k".to_owned()));
    }

    #[test]
    fn set_shadowing_writes_on_the_receiver() {
        let mut heap = Heap::new();
        let proto = plain(&mut heap, None);
        heap.set_plain(proto, "x", None).unwrap();
        let object = plain(&mut heap, Some(proto));
        let value = plain(&mut heap, None);
        heap.set_shadowing(object, "x", Some(value)).unwrap();
        assert_eq!(heap.get(object).table.len(), 1);
        assert_eq!(heap.lookup(Some(proto), "x"), Some(None));
    }

    #[test]
    fn set_plain_respects_closed() {
        let mut heap = Heap::new();
        let object = plain(&mut heap, None);
        heap.set_plain(object, "a", None).unwrap();
        heap.get_mut(object).flags |= FLAG_CLOSED;
        // existing key stays writable, new keys are refused
        heap.set_plain(object, "a", None).unwrap();
        let err = heap.set_plain(object, "b", None).unwrap_err();
        assert_eq!(err.kind(), &VmErrorKind::AssignToClosed("b".to_owned()));
    }

    #[test]
    fn constraints_gate_later_writes() {
        let mut heap = Heap::new();
        let proto = plain(&mut heap, None);
        let scope = plain(&mut heap, None);
        heap.set_plain(scope, "v", None).unwrap();
        heap.set_field_constraint(scope, "v", Some(proto)).unwrap();
        let conforming = plain(&mut heap, Some(proto));
        heap.set_plain(scope, "v", Some(conforming)).unwrap();
        let stray = plain(&mut heap, None);
        let err = heap.set_plain(scope, "v", Some(stray)).unwrap_err();
        assert_eq!(err.kind(), &VmErrorKind::ConstraintViolated("v".to_owned()));
    }

    #[test]
    fn instance_of_finds_the_typed_child() {
        let mut heap = Heap::new();
        let proto = plain(&mut heap, None);
        let instance = plain(&mut heap, Some(proto));
        let derived = plain(&mut heap, Some(instance));
        assert_eq!(heap.instance_of(Some(derived), proto), Some(instance));
        let unrelated = plain(&mut heap, None);
        assert_eq!(heap.instance_of(Some(unrelated), proto), None);
    }
}
