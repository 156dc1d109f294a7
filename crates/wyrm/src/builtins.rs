//! The root object and its builtin prototypes.
//!
//! `create_root` builds the prototype chain every script runs against:
//! `int`, `float`, `bool`, `string`, `array`, `function` and `closure`
//! prototypes hang off the root, each carrying its operators as native
//! function objects. Binary operators in the language lower to method calls,
//! so `1 + 2` lands in [`int_add`] through ordinary prototype lookup —
//! scripts overload operators by defining the same names on their own
//! objects.
//!
//! Arithmetic coercion: `int op int` stays int, every mix with a float
//! produces a float. Comparisons accept the same mixes and return the two
//! cached bool instances.

use crate::{
    error::{RunResult, VmError, VmErrorKind},
    heap::{Heap, HeapId, Value},
    object::{FLAG_CLOSED, FLAG_IMMUTABLE, NativeFn, ObjectData},
    vm::Vm,
};

/// Prototype and constant handles shared by every execution.
///
/// All of these are pinned as GC permanents at creation, so the cache never
/// goes stale even if a script rebinds the root's names.
#[derive(Debug)]
pub(crate) struct ValueCache {
    pub int_proto: HeapId,
    pub float_proto: HeapId,
    pub bool_proto: HeapId,
    pub string_proto: HeapId,
    pub array_proto: HeapId,
    pub function_proto: HeapId,
    pub closure_proto: HeapId,
    pub bool_true: HeapId,
    pub bool_false: HeapId,
}

// ----------------------------------------------------------------------
// value constructors
// ----------------------------------------------------------------------

pub(crate) fn new_int(heap: &mut Heap, cache: &ValueCache, value: i32) -> Value {
    Some(heap.allocate(Some(cache.int_proto), ObjectData::Int(value), FLAG_CLOSED | FLAG_IMMUTABLE))
}

pub(crate) fn new_float(heap: &mut Heap, cache: &ValueCache, value: f32) -> Value {
    Some(heap.allocate(
        Some(cache.float_proto),
        ObjectData::Float(value),
        FLAG_CLOSED | FLAG_IMMUTABLE,
    ))
}

pub(crate) fn new_string(heap: &mut Heap, cache: &ValueCache, value: &str) -> Value {
    Some(heap.allocate(
        Some(cache.string_proto),
        ObjectData::Str(value.into()),
        FLAG_CLOSED | FLAG_IMMUTABLE,
    ))
}

/// Booleans are the two cached instances; no allocation.
pub(crate) fn new_bool(cache: &ValueCache, value: bool) -> Value {
    Some(if value { cache.bool_true } else { cache.bool_false })
}

/// A fresh array with its `length` field mirror.
pub(crate) fn new_array(heap: &mut Heap, cache: &ValueCache, elements: Vec<Value>) -> RunResult<Value> {
    let length = i32::try_from(elements.len()).unwrap_or(i32::MAX);
    let length_object = new_int(heap, cache, length);
    let id = heap.allocate(Some(cache.array_proto), ObjectData::Array(elements), 0);
    heap.set_plain(id, "length", length_object)?;
    Ok(Some(id))
}

/// Builds the root object with the full prototype chain and returns it with
/// the handle cache. Everything reachable here is pinned as permanent.
pub(crate) fn create_root(heap: &mut Heap) -> (Value, ValueCache) {
    let root = heap.allocate(None, ObjectData::Plain, 0);

    let function_proto = heap.allocate(None, ObjectData::Plain, 0);
    let closure_proto = heap.allocate(None, ObjectData::Plain, 0);
    let bool_proto = heap.allocate(None, ObjectData::Plain, 0);
    let int_proto = heap.allocate(None, ObjectData::Plain, 0);
    let float_proto = heap.allocate(None, ObjectData::Plain, 0);
    let string_proto = heap.allocate(None, ObjectData::Plain, 0);
    let array_proto = heap.allocate(None, ObjectData::Plain, 0);

    let bool_true = heap.allocate(Some(bool_proto), ObjectData::Bool(true), FLAG_CLOSED | FLAG_IMMUTABLE);
    let bool_false = heap.allocate(Some(bool_proto), ObjectData::Bool(false), FLAG_CLOSED | FLAG_IMMUTABLE);

    let set = |heap: &mut Heap, object: HeapId, key: &str, value: Value| {
        heap.set_plain(object, key, value)
            .expect("builtin prototypes are open during construction");
    };
    let native = |heap: &mut Heap, object: HeapId, key: &str, function: NativeFn| {
        let value = heap.allocate(Some(function_proto), ObjectData::Function(function), 0);
        heap.set_plain(object, key, Some(value))
            .expect("builtin prototypes are open during construction");
    };

    set(heap, root, "null", None);
    set(heap, root, "function", Some(function_proto));
    set(heap, root, "closure", Some(closure_proto));
    set(heap, root, "bool", Some(bool_proto));
    set(heap, root, "int", Some(int_proto));
    set(heap, root, "float", Some(float_proto));
    set(heap, root, "string", Some(string_proto));
    set(heap, root, "array", Some(array_proto));

    native(heap, bool_proto, "!", bool_not);
    native(heap, bool_proto, "==", bool_eq);

    native(heap, int_proto, "+", int_add);
    native(heap, int_proto, "-", int_sub);
    native(heap, int_proto, "*", int_mul);
    native(heap, int_proto, "/", int_div);
    native(heap, int_proto, "==", int_eq);
    native(heap, int_proto, "<", int_lt);
    native(heap, int_proto, ">", int_gt);
    native(heap, int_proto, "<=", int_le);
    native(heap, int_proto, ">=", int_ge);

    native(heap, float_proto, "+", float_add);
    native(heap, float_proto, "-", float_sub);
    native(heap, float_proto, "*", float_mul);
    native(heap, float_proto, "/", float_div);
    native(heap, float_proto, "==", float_eq);
    native(heap, float_proto, "<", float_lt);
    native(heap, float_proto, ">", float_gt);
    native(heap, float_proto, "<=", float_le);
    native(heap, float_proto, ">=", float_ge);

    native(heap, string_proto, "+", string_add);
    native(heap, string_proto, "==", string_eq);

    native(heap, array_proto, "resize", array_resize);
    native(heap, array_proto, "push", array_push);
    native(heap, array_proto, "pop", array_pop);
    native(heap, array_proto, "[]", array_index);
    native(heap, array_proto, "[]=", array_index_assign);

    native(heap, root, "print", print);

    let cache = ValueCache {
        int_proto,
        float_proto,
        bool_proto,
        string_proto,
        array_proto,
        function_proto,
        closure_proto,
        bool_true,
        bool_false,
    };

    // pin the chain: the cache handles must stay valid even if a script
    // rebinds the root's names
    for id in [
        root,
        function_proto,
        closure_proto,
        bool_proto,
        int_proto,
        float_proto,
        string_proto,
        array_proto,
        bool_true,
        bool_false,
    ] {
        heap.add_permanent(Some(id));
    }

    (Some(root), cache)
}

// ----------------------------------------------------------------------
// helpers
// ----------------------------------------------------------------------

fn expect_arity(args: &[Value], expected: usize) -> RunResult<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(VmError::new(VmErrorKind::ArityMismatch {
            expected,
            got: args.len(),
            variadic: false,
        }))
    }
}

#[derive(Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Clone, Copy)]
enum Compare {
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
}

fn int_arith(vm: &mut Vm<'_>, this: Value, args: &[Value], op: Arith) -> RunResult<Value> {
    expect_arity(args, 1)?;
    let lhs = vm.heap.as_int(this).ok_or_else(|| VmError::msg("int operation on a non-int"))?;
    if let Some(rhs) = vm.heap.as_int(args[0]) {
        let value = match op {
            Arith::Add => lhs.wrapping_add(rhs),
            Arith::Sub => lhs.wrapping_sub(rhs),
            Arith::Mul => lhs.wrapping_mul(rhs),
            Arith::Div => {
                if rhs == 0 {
                    return Err(VmError::msg("division by zero"));
                }
                lhs.wrapping_div(rhs)
            }
        };
        return Ok(vm.new_int(value));
    }
    if let Some(rhs) = vm.heap.as_float(args[0]) {
        let lhs = lhs as f32;
        let value = match op {
            Arith::Add => lhs + rhs,
            Arith::Sub => lhs - rhs,
            Arith::Mul => lhs * rhs,
            Arith::Div => lhs / rhs,
        };
        return Ok(vm.new_float(value));
    }
    Err(VmError::msg("invalid operand to int operation"))
}

fn float_arith(vm: &mut Vm<'_>, this: Value, args: &[Value], op: Arith) -> RunResult<Value> {
    expect_arity(args, 1)?;
    let lhs = vm
        .heap
        .as_float(this)
        .ok_or_else(|| VmError::msg("float operation on a non-float"))?;
    let rhs = match (vm.heap.as_float(args[0]), vm.heap.as_int(args[0])) {
        (Some(f), _) => f,
        (None, Some(i)) => i as f32,
        (None, None) => return Err(VmError::msg("invalid operand to float operation")),
    };
    let value = match op {
        Arith::Add => lhs + rhs,
        Arith::Sub => lhs - rhs,
        Arith::Mul => lhs * rhs,
        Arith::Div => lhs / rhs,
    };
    Ok(vm.new_float(value))
}

fn int_compare(vm: &mut Vm<'_>, this: Value, args: &[Value], op: Compare) -> RunResult<Value> {
    expect_arity(args, 1)?;
    let lhs = vm.heap.as_int(this).ok_or_else(|| VmError::msg("int comparison on a non-int"))?;
    if let Some(rhs) = vm.heap.as_int(args[0]) {
        let value = match op {
            Compare::Eq => lhs == rhs,
            Compare::Lt => lhs < rhs,
            Compare::Gt => lhs > rhs,
            Compare::Le => lhs <= rhs,
            Compare::Ge => lhs >= rhs,
        };
        return Ok(vm.new_bool(value));
    }
    if let Some(rhs) = vm.heap.as_float(args[0]) {
        let lhs = lhs as f32;
        let value = match op {
            Compare::Eq => lhs == rhs,
            Compare::Lt => lhs < rhs,
            Compare::Gt => lhs > rhs,
            Compare::Le => lhs <= rhs,
            Compare::Ge => lhs >= rhs,
        };
        return Ok(vm.new_bool(value));
    }
    Err(VmError::msg("invalid operand to int comparison"))
}

fn float_compare(vm: &mut Vm<'_>, this: Value, args: &[Value], op: Compare) -> RunResult<Value> {
    expect_arity(args, 1)?;
    let lhs = vm
        .heap
        .as_float(this)
        .ok_or_else(|| VmError::msg("float comparison on a non-float"))?;
    let rhs = match (vm.heap.as_float(args[0]), vm.heap.as_int(args[0])) {
        (Some(f), _) => f,
        (None, Some(i)) => i as f32,
        (None, None) => return Err(VmError::msg("invalid operand to float comparison")),
    };
    let value = match op {
        Compare::Eq => lhs == rhs,
        Compare::Lt => lhs < rhs,
        Compare::Gt => lhs > rhs,
        Compare::Le => lhs <= rhs,
        Compare::Ge => lhs >= rhs,
    };
    Ok(vm.new_bool(value))
}

// ----------------------------------------------------------------------
// bool
// ----------------------------------------------------------------------

fn bool_not(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    expect_arity(args, 0)?;
    let value = vm.heap.as_bool(this).ok_or_else(|| VmError::msg("'!' on a non-bool"))?;
    Ok(vm.new_bool(!value))
}

fn bool_eq(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    expect_arity(args, 1)?;
    let lhs = vm.heap.as_bool(this).ok_or_else(|| VmError::msg("bool comparison on a non-bool"))?;
    let Some(rhs) = vm.heap.as_bool(args[0]) else {
        return Err(VmError::msg("invalid operand to bool comparison"));
    };
    Ok(vm.new_bool(lhs == rhs))
}

// ----------------------------------------------------------------------
// int / float operator entry points
// ----------------------------------------------------------------------

fn int_add(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    int_arith(vm, this, args, Arith::Add)
}

fn int_sub(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    int_arith(vm, this, args, Arith::Sub)
}

fn int_mul(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    int_arith(vm, this, args, Arith::Mul)
}

fn int_div(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    int_arith(vm, this, args, Arith::Div)
}

fn int_eq(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    int_compare(vm, this, args, Compare::Eq)
}

fn int_lt(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    int_compare(vm, this, args, Compare::Lt)
}

fn int_gt(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    int_compare(vm, this, args, Compare::Gt)
}

fn int_le(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    int_compare(vm, this, args, Compare::Le)
}

fn int_ge(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    int_compare(vm, this, args, Compare::Ge)
}

fn float_add(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    float_arith(vm, this, args, Arith::Add)
}

fn float_sub(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    float_arith(vm, this, args, Arith::Sub)
}

fn float_mul(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    float_arith(vm, this, args, Arith::Mul)
}

fn float_div(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    float_arith(vm, this, args, Arith::Div)
}

fn float_eq(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    float_compare(vm, this, args, Compare::Eq)
}

fn float_lt(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    float_compare(vm, this, args, Compare::Lt)
}

fn float_gt(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    float_compare(vm, this, args, Compare::Gt)
}

fn float_le(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    float_compare(vm, this, args, Compare::Le)
}

fn float_ge(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    float_compare(vm, this, args, Compare::Ge)
}

// ----------------------------------------------------------------------
// string
// ----------------------------------------------------------------------

fn string_add(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    expect_arity(args, 1)?;
    let lhs = vm
        .heap
        .as_str(this)
        .ok_or_else(|| VmError::msg("string operation on a non-string"))?
        .to_owned();
    let Some(rhs) = vm.heap.as_str(args[0]) else {
        return Err(VmError::msg("invalid operand to string concatenation"));
    };
    let joined = format!("{lhs}{rhs}");
    Ok(vm.new_string(&joined))
}

fn string_eq(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    expect_arity(args, 1)?;
    let lhs = vm
        .heap
        .as_str(this)
        .ok_or_else(|| VmError::msg("string comparison on a non-string"))?
        .to_owned();
    let Some(rhs) = vm.heap.as_str(args[0]) else {
        return Err(VmError::msg("invalid operand to string comparison"));
    };
    let equal = lhs == rhs;
    Ok(vm.new_bool(equal))
}

// ----------------------------------------------------------------------
// array
// ----------------------------------------------------------------------

fn array_object(vm: &Vm<'_>, this: Value) -> RunResult<HeapId> {
    vm.heap
        .find_array(this)
        .ok_or_else(|| VmError::msg("array operation on a non-array"))
}

fn set_length(vm: &mut Vm<'_>, array: HeapId, length: usize) -> RunResult<()> {
    let length_object = vm.new_int(i32::try_from(length).unwrap_or(i32::MAX));
    vm.heap.set_plain(array, "length", length_object)
}

fn array_resize(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    expect_arity(args, 1)?;
    let array = array_object(vm, this)?;
    let Some(requested) = vm.heap.as_int(args[0]) else {
        return Err(VmError::msg("array resize takes an int"));
    };
    let Ok(new_length) = usize::try_from(requested) else {
        return Err(VmError::msg("array resize takes a non-negative size"));
    };
    match &mut vm.heap.get_mut(array).data {
        ObjectData::Array(elements) => elements.resize(new_length, None),
        _ => unreachable!("find_array returned a non-array"),
    }
    set_length(vm, array, new_length)?;
    Ok(this)
}

fn array_push(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    expect_arity(args, 1)?;
    let array = array_object(vm, this)?;
    let length = match &mut vm.heap.get_mut(array).data {
        ObjectData::Array(elements) => {
            elements.push(args[0]);
            elements.len()
        }
        _ => unreachable!("find_array returned a non-array"),
    };
    set_length(vm, array, length)?;
    Ok(this)
}

fn array_pop(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    expect_arity(args, 0)?;
    let array = array_object(vm, this)?;
    let (popped, length) = match &mut vm.heap.get_mut(array).data {
        ObjectData::Array(elements) => match elements.pop() {
            Some(value) => (value, elements.len()),
            None => return Err(VmError::msg("pop from an empty array")),
        },
        _ => unreachable!("find_array returned a non-array"),
    };
    set_length(vm, array, length)?;
    Ok(popped)
}

fn array_index(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    expect_arity(args, 1)?;
    let array = array_object(vm, this)?;
    let Some(index) = vm.heap.as_int(args[0]) else {
        // non-int keys fall through to a null read, like a missed lookup
        return Ok(None);
    };
    match &vm.heap.get(array).data {
        ObjectData::Array(elements) => usize::try_from(index)
            .ok()
            .and_then(|i| elements.get(i))
            .copied()
            .map_or_else(|| Err(VmError::msg("array index out of bounds")), Ok),
        _ => unreachable!("find_array returned a non-array"),
    }
}

fn array_index_assign(vm: &mut Vm<'_>, this: Value, args: &[Value]) -> RunResult<Value> {
    expect_arity(args, 2)?;
    let array = array_object(vm, this)?;
    let Some(index) = vm.heap.as_int(args[0]) else {
        return Err(VmError::msg("array index must be an int"));
    };
    match &mut vm.heap.get_mut(array).data {
        ObjectData::Array(elements) => match usize::try_from(index).ok().and_then(|i| elements.get_mut(i)) {
            Some(cell) => {
                *cell = args[1];
                Ok(None)
            }
            None => Err(VmError::msg("array index out of bounds")),
        },
        _ => unreachable!("find_array returned a non-array"),
    }
}

// ----------------------------------------------------------------------
// print
// ----------------------------------------------------------------------

/// Writes each argument's payload back to back, then a newline. Arguments
/// with no printable payload are skipped.
fn print(vm: &mut Vm<'_>, _this: Value, args: &[Value]) -> RunResult<Value> {
    for &arg in args {
        if let Some(value) = vm.heap.as_int(arg) {
            vm.print.write(&value.to_string());
            continue;
        }
        if let Some(value) = vm.heap.as_float(arg) {
            vm.print.write(&value.to_string());
            continue;
        }
        if let Some(value) = vm.heap.as_str(arg) {
            let owned = value.to_owned();
            vm.print.write(&owned);
            continue;
        }
        if let Some(value) = vm.heap.as_bool(arg) {
            vm.print.write(if value { "true" } else { "false" });
        }
    }
    vm.print.push('\n');
    Ok(None)
}
