//! Constructors and utilities for heap values.
//!
//! Every constructor allocates, so every heap reference a caller retains
//! across one of these calls must be registered through a scoped root
//! handle; the handle-typed parameters below make that explicit at the
//! signature level. Returned [`Obj`]s are valid until the next allocation.

use core::ffi::c_void;
use core::ptr;

use katsu_types::{Obj, Value};

use crate::error::VmResult;
use crate::gc::roots::{ObjRoot, OptObjRoot, ValueRoot};
use crate::gc::Heap;
use crate::interpreter::frame::Frame;
use crate::object::{
    Array, Assoc, ByteArray, CallSegment, Closure, Code, DataclassInstance, Foreign,
    IntrinsicHandler, Method, MultiMethod, NativeHandler, Ref, Str, Tuple, Type, TypeKind,
    Vector,
};

/// Make a [`Ref`] boxing the rooted value.
pub fn make_ref(heap: &mut Heap<'_>, referent: &ValueRoot<'_>) -> VmResult<Obj<Ref>> {
    let mut obj = heap.alloc::<Ref>(Ref::size())?;
    obj.referent = referent.get();
    Ok(obj)
}

/// Make a [`Tuple`] of the given length, filled with nulls.
pub fn make_tuple(heap: &mut Heap<'_>, length: u64) -> VmResult<Obj<Tuple>> {
    let mut tuple = make_tuple_nofill(heap, length)?;
    tuple.components_mut().fill(Value::NULL);
    Ok(tuple)
}

/// Make a [`Tuple`] of the given length with uninitialized components; the
/// caller must fill every component before the next allocation.
pub fn make_tuple_nofill(heap: &mut Heap<'_>, length: u64) -> VmResult<Obj<Tuple>> {
    let mut tuple = heap.alloc::<Tuple>(Tuple::size_for(length))?;
    tuple.length = length;
    Ok(tuple)
}

/// Make an [`Array`] of the given length, filled with nulls.
pub fn make_array(heap: &mut Heap<'_>, length: u64) -> VmResult<Obj<Array>> {
    let mut array = make_array_nofill(heap, length)?;
    array.components_mut().fill(Value::NULL);
    Ok(array)
}

/// Make an [`Array`] of the given length with uninitialized components;
/// the caller must fill every component before the next allocation.
pub fn make_array_nofill(heap: &mut Heap<'_>, length: u64) -> VmResult<Obj<Array>> {
    let mut array = heap.alloc::<Array>(Array::size_for(length))?;
    array.length = length;
    Ok(array)
}

/// Make an empty [`Vector`] with a null-filled backing array of the given
/// capacity.
pub fn make_vector(heap: &mut Heap<'_>, capacity: u64) -> VmResult<Obj<Vector>> {
    let backing = make_array(heap, capacity)?;
    let r_backing = ObjRoot::new(heap.roots(), backing);
    make_vector_with(heap, 0, &r_backing)
}

/// Make a [`Vector`] of the given length over a rooted backing array.
pub fn make_vector_with(
    heap: &mut Heap<'_>,
    length: u64,
    backing: &ObjRoot<'_, Array>,
) -> VmResult<Obj<Vector>> {
    debug_assert!(length <= backing.length);
    let mut vector = heap.alloc::<Vector>(Vector::size())?;
    vector.length = length;
    vector.backing = backing.value();
    Ok(vector)
}

/// Make an empty [`Assoc`] with room for `capacity` entries.
pub fn make_assoc(heap: &mut Heap<'_>, capacity: u64) -> VmResult<Obj<Assoc>> {
    let backing = make_array(heap, capacity * 2)?;
    let r_backing = ObjRoot::new(heap.roots(), backing);
    let mut assoc = heap.alloc::<Assoc>(Assoc::size())?;
    assoc.length = 0;
    assoc.backing = r_backing.value();
    Ok(assoc)
}

/// Make a [`Str`] with contents copied from a native string.
pub fn make_string(heap: &mut Heap<'_>, src: &str) -> VmResult<Obj<Str>> {
    let mut string = make_string_nofill(heap, src.len() as u64)?;
    string.bytes_mut().copy_from_slice(src.as_bytes());
    Ok(string)
}

/// Make a [`Str`] of the given length with uninitialized contents; the
/// caller must fill it before it becomes visible to anything comparing
/// strings.
pub fn make_string_nofill(heap: &mut Heap<'_>, length: u64) -> VmResult<Obj<Str>> {
    let mut string = heap.alloc::<Str>(Str::size_for(length))?;
    string.length = length;
    Ok(string)
}

/// Make a zero-filled [`ByteArray`] of the given length.
pub fn make_byte_array(heap: &mut Heap<'_>, length: u64) -> VmResult<Obj<ByteArray>> {
    let mut bytes = make_byte_array_nofill(heap, length)?;
    bytes.bytes_mut().fill(0);
    Ok(bytes)
}

/// Make a [`ByteArray`] of the given length with uninitialized contents.
pub fn make_byte_array_nofill(heap: &mut Heap<'_>, length: u64) -> VmResult<Obj<ByteArray>> {
    let mut bytes = heap.alloc::<ByteArray>(ByteArray::size_for(length))?;
    bytes.length = length;
    Ok(bytes)
}

/// Make a [`Code`] template with the given fields.
///
/// Aborts on compiler contract violations: more parameters than registers,
/// or instruction and span arrays of different lengths.
#[allow(clippy::too_many_arguments)]
pub fn make_code(
    heap: &mut Heap<'_>,
    module: &ObjRoot<'_, Assoc>,
    num_params: u32,
    num_regs: u32,
    num_data: u32,
    upreg_map: &OptObjRoot<'_, Array>,
    insts: &ObjRoot<'_, Array>,
    args: &ObjRoot<'_, Array>,
    span: &ObjRoot<'_, Tuple>,
    inst_spans: &ObjRoot<'_, Array>,
) -> VmResult<Obj<Code>> {
    assert!(num_params <= num_regs, "more parameters than registers");
    assert_eq!(
        insts.length, inst_spans.length,
        "instruction and span arrays must have equal length"
    );

    let mut code = heap.alloc::<Code>(Code::size())?;
    code.module = module.value();
    code.num_params = num_params;
    code.num_regs = num_regs;
    code.num_data = num_data;
    code.upreg_map = upreg_map.value();
    code.insts = insts.value();
    code.args = args.value();
    code.span = span.value();
    code.inst_spans = inst_spans.value();
    Ok(code)
}

/// Make a [`Closure`] over a code template and its captured values.
pub fn make_closure(
    heap: &mut Heap<'_>,
    code: &ObjRoot<'_, Code>,
    upregs: &ObjRoot<'_, Array>,
) -> VmResult<Obj<Closure>> {
    debug_assert_eq!(
        Obj::<Array>::from_value(code.upreg_map).length,
        upregs.length,
        "captured values must match the code's upreg map"
    );
    let mut closure = heap.alloc::<Closure>(Closure::size())?;
    closure.code = code.value();
    closure.upregs = upregs.value();
    Ok(closure)
}

/// Make a [`Method`]. Exactly one of `code`, `native_handler` and
/// `intrinsic_handler` must be provided; anything else is an invariant
/// break.
pub fn make_method(
    heap: &mut Heap<'_>,
    param_matchers: &ObjRoot<'_, Array>,
    return_type: &OptObjRoot<'_, Type>,
    code: &OptObjRoot<'_, Code>,
    attributes: &ObjRoot<'_, Vector>,
    native_handler: Option<NativeHandler>,
    intrinsic_handler: Option<IntrinsicHandler>,
) -> VmResult<Obj<Method>> {
    let bodies = usize::from(code.is_some())
        + usize::from(native_handler.is_some())
        + usize::from(intrinsic_handler.is_some());
    assert_eq!(
        bodies, 1,
        "exactly one of code, native handler and intrinsic handler must be set"
    );
    if let Some(code) = code.get() {
        assert_eq!(
            param_matchers.length,
            u64::from(code.num_params),
            "matcher count must equal the code's parameter count"
        );
    }
    if cfg!(debug_assertions) {
        for matcher in param_matchers.get().components() {
            assert!(
                matcher.is_null()
                    || Obj::<Type>::try_from_value(*matcher).is_some()
                    || Obj::<Ref>::try_from_value(*matcher).is_some(),
                "parameter matcher must be null, a type or a ref"
            );
        }
    }

    let mut method = heap.alloc::<Method>(Method::size())?;
    method.param_matchers = param_matchers.value();
    method.return_type = return_type.value();
    method.code = code.value();
    method.attributes = attributes.value();
    method.native_handler = native_handler;
    method.intrinsic_handler = intrinsic_handler;
    Ok(method)
}

/// Make a [`MultiMethod`] with the given member methods.
pub fn make_multimethod(
    heap: &mut Heap<'_>,
    name: &ObjRoot<'_, Str>,
    num_params: u32,
    methods: &ObjRoot<'_, Vector>,
    attributes: &ObjRoot<'_, Vector>,
) -> VmResult<Obj<MultiMethod>> {
    if cfg!(debug_assertions) {
        for method in methods.get().components() {
            let method = Obj::<Method>::from_value(*method);
            assert_eq!(
                Obj::<Array>::from_value(method.param_matchers).length,
                u64::from(num_params),
                "member method arity must match the multimethod"
            );
        }
    }
    let mut multimethod = heap.alloc::<MultiMethod>(MultiMethod::size())?;
    multimethod.name = name.value();
    multimethod.num_params = num_params;
    multimethod.methods = methods.value();
    multimethod.attributes = attributes.value();
    Ok(multimethod)
}

/// Make a [`Type`] without computing its linearization or registering it
/// with its ancestors; see [`crate::types::make_type`] for the full
/// construction.
///
/// Dataclasses carry slots and a total slot count; primitives and mixins
/// carry neither.
#[allow(clippy::too_many_arguments)]
pub fn make_type_raw(
    heap: &mut Heap<'_>,
    name: &ObjRoot<'_, Str>,
    bases: &ObjRoot<'_, Array>,
    sealed: bool,
    linearization: &ObjRoot<'_, Array>,
    subtypes: &ObjRoot<'_, Vector>,
    kind: TypeKind,
    slots: &OptObjRoot<'_, Array>,
    num_total_slots: Option<u32>,
) -> VmResult<Obj<Type>> {
    match kind {
        TypeKind::Dataclass => {
            let slot_count = slots
                .get()
                .expect("dataclass type must have a slots array")
                .length;
            let total = num_total_slots.expect("dataclass type must have a total slot count");
            assert!(u64::from(total) >= slot_count);
        }
        TypeKind::Primitive | TypeKind::Mixin => {
            assert!(!slots.is_some(), "only dataclass types carry slots");
            assert!(
                num_total_slots.is_none(),
                "only dataclass types carry a total slot count"
            );
        }
    }

    let mut ty = heap.alloc::<Type>(Type::size())?;
    ty.name = name.value();
    ty.bases = bases.value();
    ty.sealed = sealed;
    ty.linearization = linearization.value();
    ty.subtypes = subtypes.value();
    ty.kind = kind;
    ty.slots = slots.value();
    ty.num_total_slots = num_total_slots.unwrap_or(0);
    Ok(ty)
}

/// Make a [`DataclassInstance`] of a dataclass type, with uninitialized
/// slots; the caller must fill every slot before the next allocation.
pub fn make_instance_nofill(
    heap: &mut Heap<'_>,
    ty: &ObjRoot<'_, Type>,
) -> VmResult<Obj<DataclassInstance>> {
    assert_eq!(ty.kind, TypeKind::Dataclass, "instances require a dataclass type");
    let num_slots = u64::from(ty.num_total_slots);
    let mut instance =
        heap.alloc::<DataclassInstance>(DataclassInstance::size_for(num_slots))?;
    instance.ty = ty.value();
    Ok(instance)
}

/// Make a [`CallSegment`] holding a byte-exact copy of `total_length`
/// bytes of frames starting at `segment_bottom`, with every copied frame's
/// caller pointer nulled.
///
/// # Safety
///
/// `segment_bottom` must point at the lowest of a run of whole, live,
/// contiguous frames spanning exactly `total_length` bytes.
pub unsafe fn make_call_segment(
    heap: &mut Heap<'_>,
    segment_bottom: *mut Frame,
    total_length: usize,
) -> VmResult<Obj<CallSegment>> {
    let mut segment = heap.alloc::<CallSegment>(CallSegment::size_for(total_length as u64))?;
    segment.length = total_length as u64;
    // Safety: the segment's trailing bytes span `total_length`; the source
    // frames are live (a collection triggered by the allocation above
    // updates them in place, never moves them).
    unsafe {
        let dest = CallSegment::frames_ptr(segment.as_ptr());
        ptr::copy_nonoverlapping(segment_bottom.cast::<u8>(), dest, total_length);
        let past_end = dest.add(total_length).cast::<Frame>();
        let mut frame = dest.cast::<Frame>();
        while frame < past_end {
            (*frame).caller = ptr::null_mut();
            frame = (*frame).next();
        }
        debug_assert_eq!(frame, past_end, "segment copy covered partial frames");
    }
    Ok(segment)
}

/// Make a [`Foreign`] wrapping an opaque pointer.
pub fn make_foreign(heap: &mut Heap<'_>, value: *mut c_void) -> VmResult<Obj<Foreign>> {
    let mut foreign = heap.alloc::<Foreign>(Foreign::size())?;
    foreign.value = value;
    Ok(foreign)
}

/// Append to a vector, doubling the backing array when full. Returns the
/// (possibly relocated) vector.
pub fn vector_push(
    heap: &mut Heap<'_>,
    vector: &ObjRoot<'_, Vector>,
    value: &ValueRoot<'_>,
) -> VmResult<Obj<Vector>> {
    let capacity = vector.get().capacity();
    if vector.get().length == capacity {
        // Grow. The old backing array (and the vector) stay alive through
        // the roots while components are copied over.
        let new_capacity = if capacity == 0 { 1 } else { capacity * 2 };
        let mut new_backing = make_array_nofill(heap, new_capacity)?;
        let mut vector = vector.get();
        {
            let old = vector.backing_array();
            let (used, rest) = new_backing.components_mut().split_at_mut(capacity as usize);
            used.copy_from_slice(old.components());
            rest.fill(Value::NULL);
        }
        vector.backing = new_backing.value();
    }

    let mut vector = vector.get();
    let length = vector.length as usize;
    vector.backing_array().components_mut()[length] = value.get();
    vector.length += 1;
    Ok(vector)
}

/// Append an entry to an assoc, doubling the backing array when full.
/// Returns the (possibly relocated) assoc. Existing keys are not
/// deduplicated; lookup finds the first match.
pub fn assoc_push(
    heap: &mut Heap<'_>,
    assoc: &ObjRoot<'_, Assoc>,
    key: &ValueRoot<'_>,
    value: &ValueRoot<'_>,
) -> VmResult<Obj<Assoc>> {
    let capacity = assoc.get().capacity();
    if assoc.get().length == capacity {
        let new_capacity = if capacity == 0 { 1 } else { capacity * 2 };
        let mut new_backing = make_array_nofill(heap, new_capacity * 2)?;
        let mut assoc = assoc.get();
        {
            let old = assoc.backing_array();
            let split = old.length as usize;
            let (used, rest) = new_backing.components_mut().split_at_mut(split);
            used.copy_from_slice(old.components());
            rest.fill(Value::NULL);
        }
        assoc.backing = new_backing.value();
    }

    let mut assoc = assoc.get();
    let base = 2 * assoc.length as usize;
    {
        let mut backing = assoc.backing_array();
        let components = backing.components_mut();
        components[base] = key.get();
        components[base + 1] = value.get();
    }
    assoc.length += 1;
    Ok(assoc)
}

/// Copy a vector's live prefix into a fresh array of exactly that length.
pub fn vector_to_array(
    heap: &mut Heap<'_>,
    vector: &ObjRoot<'_, Vector>,
) -> VmResult<Obj<Array>> {
    let mut array = make_array_nofill(heap, vector.get().length)?;
    array
        .components_mut()
        .copy_from_slice(vector.get().components());
    Ok(array)
}

/// Find the entry index of `name` in an assoc. Non-string keys are
/// skipped; string keys compare byte-exact.
pub fn assoc_index_of(assoc: &Assoc, name: &Str) -> Option<u64> {
    for i in 0..assoc.length {
        if let Some(key) = Obj::<Str>::try_from_value(assoc.key(i)) {
            if string_eq(&key, name) {
                return Some(i);
            }
        }
    }
    None
}

/// Look up `name` in an assoc, returning the mapped value.
pub fn assoc_get(assoc: &Assoc, name: &Str) -> Option<Value> {
    assoc_index_of(assoc, name).map(|i| assoc.value(i))
}

/// Look up a native-string `name` in an assoc.
pub fn assoc_get_native(assoc: &Assoc, name: &str) -> Option<Value> {
    for i in 0..assoc.length {
        if let Some(key) = Obj::<Str>::try_from_value(assoc.key(i)) {
            if key.bytes() == name.as_bytes() {
                return Some(assoc.value(i));
            }
        }
    }
    None
}

/// Whether two strings have identical contents.
pub fn string_eq(a: &Str, b: &Str) -> bool {
    a.bytes() == b.bytes()
}

/// Concatenate two rooted strings.
pub fn concat(
    heap: &mut Heap<'_>,
    a: &ObjRoot<'_, Str>,
    b: &ObjRoot<'_, Str>,
) -> VmResult<Obj<Str>> {
    let length_a = a.get().length;
    let length_b = b.get().length;
    let mut cat = make_string_nofill(heap, length_a + length_b)?;
    let (head, tail) = cat.bytes_mut().split_at_mut(length_a as usize);
    head.copy_from_slice(a.get().bytes());
    tail.copy_from_slice(b.get().bytes());
    Ok(cat)
}

/// Concatenate native string parts into a fresh [`Str`].
pub fn concat_native(heap: &mut Heap<'_>, parts: &[&str]) -> VmResult<Obj<Str>> {
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut cat = make_string_nofill(heap, total as u64)?;
    let mut offset = 0;
    for part in parts {
        cat.bytes_mut()[offset..offset + part.len()].copy_from_slice(part.as_bytes());
        offset += part.len();
    }
    Ok(cat)
}

/// Whether `array` contains `value`, by value equality (object identity,
/// not structural equality).
pub fn array_contains(array: &Array, value: Value) -> bool {
    array.components().contains(&value)
}

/// As [`array_contains`], starting the scan at `start_index` (which may be
/// past the end).
pub fn array_contains_starting_at(array: &Array, value: Value, start_index: u64) -> bool {
    let components = array.components();
    let start = (start_index as usize).min(components.len());
    components[start..].contains(&value)
}
