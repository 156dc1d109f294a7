//! Optimization passes over a finished function.
//!
//! Three passes run in order, each reading the previous body and rebuilding
//! it through a fresh [`Gen`]:
//!
//! 1. **Inline string keys** — slots whose only producer is `NewString` and
//!    which never escape ("primitive slots") are folded into the consuming
//!    `Access`/`Assign`/`SetConstraint`, dropping the allocation.
//! 2. **Predict misses** — accesses on a *static object* (one fully built
//!    between `NewObject` and `CloseObject`) whose key is provably absent are
//!    redirected to the parent slot, collapsing the inheritance walk.
//! 3. **Fast slots** — every declared key of a static object gets a fast
//!    slot defined at the point the object closes; later accesses and
//!    assignments on it become direct cell reads and writes.
//!
//! All passes preserve arity, slot count, name, method flag and variadic
//! flag; only the fast-slot pass grows the fast-slot count. Scope objects
//! from `let` declarations and function parameter scopes are exactly the
//! static shape pass 2 and 3 feed on, so ordinary variable access compiles
//! down to fast-slot traffic.

use std::rc::Rc;

use crate::{
    r#gen::Gen,
    ir::{AssignType, Op, Slot, UserFunction},
    source::SpanId,
};

/// Runs all three passes.
pub(crate) fn optimize(function: UserFunction) -> UserFunction {
    fast_slot_pass(predict_pass(inline_pass(function)))
}

/// Copies the identity of `from` onto a rebuilt function. The fast-slot
/// count is deliberately left alone: the rebuild's generator tracks it.
fn copy_stats(from: &UserFunction, to: &mut UserFunction) {
    to.arity = from.arity;
    to.slots = from.slots;
    to.name = from.name.clone();
    to.is_method = from.is_method;
    to.variadic_tail.set(from.variadic_tail.get());
}

/// Finds slots whose value is only ever consumed as a key or discarded —
/// never stored, passed, returned or tested. Such slots can be folded away.
fn find_primitive_slots(function: &UserFunction) -> Vec<bool> {
    let mut primitive = vec![true; function.slots];
    let mut mark = |slot: Slot| {
        if slot < primitive.len() {
            primitive[slot] = false;
        }
    };
    for instr in &function.body.instrs {
        match &instr.op {
            Op::NewObject { parent, .. } => mark(*parent),
            Op::Access { object, .. } => mark(*object),
            Op::Assign { object, value, .. } => {
                mark(*object);
                mark(*value);
            }
            Op::SetConstraint { object, constraint, .. } => {
                mark(*object);
                mark(*constraint);
            }
            Op::Call { function, this, args } => {
                mark(*function);
                mark(*this);
                for &arg in args.iter() {
                    mark(arg);
                }
            }
            Op::Return { value } => mark(*value),
            Op::TestBranch { test, .. } => mark(*test),
            _ => {}
        }
    }
    primitive
}

/// Pass 1: rewrite key-slot plumbing into literal-key instructions.
fn inline_pass(function: UserFunction) -> UserFunction {
    let primitive = find_primitive_slots(&function);
    let mut r#gen = Gen::rewrite(function.fast_slots);
    // last known literal string per primitive slot; persists across blocks
    // because slots are single-assignment for string literals
    let mut slot_keys: Vec<Option<Rc<str>>> = vec![None; function.slots];

    for block in 0..function.body.blocks.len() {
        r#gen.new_block();
        for instr in function.block_instrs(block) {
            match &instr.op {
                Op::NewString { target, value } if primitive[*target] => {
                    slot_keys[*target] = Some(value.clone());
                }
                Op::SetConstraint { object, key, constraint }
                    if slot_keys.get(*key).is_some_and(Option::is_some) =>
                {
                    let key = slot_keys[*key].clone().expect("checked above");
                    r#gen.add_like(
                        instr,
                        Op::SetConstraintStringKey {
                            object: *object,
                            constraint: *constraint,
                            key,
                        },
                    );
                }
                Op::Access { target, object, key } if slot_keys.get(*key).is_some_and(Option::is_some) => {
                    let key = slot_keys[*key].clone().expect("checked above");
                    r#gen.add_like(
                        instr,
                        Op::AccessStringKey {
                            target: *target,
                            object: *object,
                            key,
                        },
                    );
                }
                Op::Assign { object, key, value, ty } if slot_keys.get(*key).is_some_and(Option::is_some) => {
                    let key = slot_keys[*key].clone().expect("checked above");
                    r#gen.add_like(
                        instr,
                        Op::AssignStringKey {
                            object: *object,
                            value: *value,
                            key,
                            ty: *ty,
                        },
                    );
                }
                op => r#gen.add_like(instr, op.clone()),
            }
        }
    }

    let mut rebuilt = r#gen.build();
    copy_stats(&function, &mut rebuilt);
    rebuilt
}

/// A slot known to hold an object whose full key set is visible statically.
#[derive(Debug)]
struct StaticObject {
    parent: Slot,
    names: Vec<Rc<str>>,
    /// Span and context of the closing instruction; fast-slot definitions
    /// inserted after the close inherit them.
    close_span: SpanId,
    close_context: Slot,
    /// Global instruction index just past the `CloseObject`.
    after_decl: usize,
    /// A `Freeze` targets this slot somewhere in the function. Assignments
    /// must then keep their immutability check and stay unrewritten;
    /// `const` rebinding has to surface as a runtime error.
    frozen: bool,
}

/// Finds static objects: `NewObject` immediately followed by plain
/// string-keyed assignments on it, terminated by `CloseObject`, with no
/// intervening instructions.
fn find_static_objects(function: &UserFunction) -> Vec<Option<StaticObject>> {
    let mut info: Vec<Option<StaticObject>> = (0..function.slots).map(|_| None).collect();
    for block in &function.body.blocks {
        let mut index = block.start;
        let end = block.start + block.len;
        while index < end {
            let (target, parent) = match &function.body.instrs[index].op {
                Op::NewObject { target, parent } => (*target, *parent),
                _ => {
                    index += 1;
                    continue;
                }
            };
            let mut names = Vec::new();
            let mut scan = index + 1;
            let mut closed_at = None;
            while scan < end {
                match &function.body.instrs[scan].op {
                    Op::AssignStringKey {
                        object,
                        key,
                        ty: AssignType::Plain,
                        ..
                    } if *object == target => {
                        names.push(key.clone());
                        scan += 1;
                    }
                    Op::CloseObject { slot } if *slot == target => {
                        closed_at = Some(scan);
                        break;
                    }
                    _ => break,
                }
            }
            let Some(closed_at) = closed_at else {
                index += 1;
                continue;
            };
            let close = &function.body.instrs[closed_at];
            info[target] = Some(StaticObject {
                parent,
                names,
                close_span: close.span,
                close_context: close.context_slot,
                after_decl: closed_at + 1,
                frozen: false,
            });
            index = closed_at + 1;
        }
    }
    for instr in &function.body.instrs {
        if let Op::Freeze { slot } = &instr.op
            && let Some(Some(static_object)) = info.get_mut(*slot)
        {
            static_object.frozen = true;
        }
    }
    info
}

/// Pass 2: redirect accesses that are guaranteed to miss to the parent.
fn predict_pass(function: UserFunction) -> UserFunction {
    let info = find_static_objects(&function);
    let mut r#gen = Gen::rewrite(function.fast_slots);

    for block in 0..function.body.blocks.len() {
        r#gen.new_block();
        for instr in function.block_instrs(block) {
            if let Op::AccessStringKey { target, object, key } = &instr.op {
                let mut object = *object;
                while let Some(Some(static_object)) = info.get(object) {
                    if static_object.names.iter().any(|name| **name == **key) {
                        break;
                    }
                    // the key cannot live here, so neither can the lookup
                    object = static_object.parent;
                }
                r#gen.add_like(
                    instr,
                    Op::AccessStringKey {
                        target: *target,
                        object,
                        key: key.clone(),
                    },
                );
            } else {
                r#gen.add_like(instr, instr.op.clone());
            }
        }
    }

    let mut rebuilt = r#gen.build();
    copy_stats(&function, &mut rebuilt);
    rebuilt
}

/// Pass 3: promote declared keys of static objects to fast slots.
fn fast_slot_pass(function: UserFunction) -> UserFunction {
    let info = find_static_objects(&function);
    let mut r#gen = Gen::rewrite(function.fast_slots);

    let mut fast_slots: Vec<Vec<Slot>> = vec![Vec::new(); function.slots];
    let mut initialized = vec![false; function.slots];
    let static_slots: Vec<Slot> = (0..function.slots).filter(|&s| info[s].is_some()).collect();

    let mut index = 0usize;
    for block in 0..function.body.blocks.len() {
        r#gen.new_block();
        for instr in function.block_instrs(block) {
            for &slot in &static_slots {
                let static_object = info[slot].as_ref().expect("static slot list is filtered");
                if static_object.after_decl == index && !initialized[slot] {
                    for name in &static_object.names {
                        let fast = r#gen.next_fast_slot();
                        r#gen.add_with(
                            static_object.close_span,
                            static_object.close_context,
                            Op::DefineFastSlot {
                                target: fast,
                                object: slot,
                                key: name.clone(),
                            },
                        );
                        fast_slots[slot].push(fast);
                    }
                    initialized[slot] = true;
                }
            }

            let rewritten = match &instr.op {
                Op::AccessStringKey { target, object, key } if initialized.get(*object).copied().unwrap_or(false) => {
                    let static_object = info[*object].as_ref().expect("initialized implies static");
                    static_object
                        .names
                        .iter()
                        .position(|name| **name == **key)
                        .map(|position| Op::ReadFastSlot {
                            source: fast_slots[*object][position],
                            target: *target,
                        })
                }
                Op::AssignStringKey { object, value, key, .. }
                    if initialized.get(*object).copied().unwrap_or(false) =>
                {
                    let static_object = info[*object].as_ref().expect("initialized implies static");
                    if static_object.frozen {
                        // a direct cell write would skip the immutability
                        // check this object relies on
                        None
                    } else {
                        static_object
                            .names
                            .iter()
                            .position(|name| **name == **key)
                            .map(|position| Op::WriteFastSlot {
                                source: *value,
                                target: fast_slots[*object][position],
                            })
                    }
                }
                _ => None,
            };
            match rewritten {
                Some(op) => r#gen.add_like(instr, op),
                None => r#gen.add_like(instr, instr.op.clone()),
            }
            index += 1;
        }
    }

    let mut rebuilt = r#gen.build();
    copy_stats(&function, &mut rebuilt);
    rebuilt
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        parser::Parser,
        source::{SourceMap, SpanTable},
    };

    fn parse(source: &str) -> Rc<UserFunction> {
        let mut map = SourceMap::new();
        let mut spans = SpanTable::new();
        let id = map.register("opt.wy", source, 0, 0);
        Parser::new(&map, &mut spans, id).parse_module().unwrap()
    }

    fn count_ops(function: &UserFunction, pred: impl Fn(&Op) -> bool) -> usize {
        function.body.instrs.iter().filter(|i| pred(&i.op)).count()
    }

    #[test]
    fn accesses_use_literal_keys() {
        let module = parse("let a = 1; print(a);");
        assert_eq!(count_ops(&module, |op| matches!(op, Op::Access { .. })), 0);
        assert!(count_ops(&module, |op| matches!(op, Op::AccessStringKey { .. })) > 0);
        // generic assigns are gone too
        assert_eq!(count_ops(&module, |op| matches!(op, Op::Assign { .. })), 0);
    }

    #[test]
    fn string_values_survive_inlining() {
        // the string is stored, not used as a key, so it must not be folded
        let module = parse("let s = \"hello\";");
        assert_eq!(
            count_ops(&module, |op| matches!(op, Op::NewString { value, .. } if &**value == "hello")),
            1
        );
    }

    #[test]
    fn let_scopes_become_fast_slots() {
        let module = parse("let a = 1; a = 2; print(a);");
        assert!(count_ops(&module, |op| matches!(op, Op::DefineFastSlot { .. })) > 0);
        assert!(count_ops(&module, |op| matches!(op, Op::WriteFastSlot { .. })) > 0);
        assert!(count_ops(&module, |op| matches!(op, Op::ReadFastSlot { .. })) > 0);
        assert!(module.fast_slots > 0);
    }

    #[test]
    fn predicted_misses_skip_the_scope_chain() {
        // `print` cannot live on the `a` scope (its only key is "a"), so the
        // lookup must be redirected to the scope's parent, the context slot
        let module = parse("let a = 1; print(a);");
        let context_slot = 1;
        let print_access = module
            .body
            .instrs
            .iter()
            .find_map(|i| match &i.op {
                Op::AccessStringKey { object, key, .. } if &**key == "print" => Some(*object),
                _ => None,
            })
            .expect("print is looked up via a literal key");
        assert_eq!(print_access, context_slot);
    }

    #[test]
    fn passes_preserve_function_identity() {
        let module = parse("fn add(a, b) { return a + b; }");
        let closure = module
            .body
            .instrs
            .iter()
            .find_map(|i| match &i.op {
                Op::NewClosure { function, .. } => Some(function.clone()),
                _ => None,
            })
            .expect("module declares a closure");
        assert_eq!(closure.arity(), 2);
        assert_eq!(closure.name(), Some("add"));
        assert!(!closure.is_method());
        assert!(!closure.has_variadic_tail());
    }
}
