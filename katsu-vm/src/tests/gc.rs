//! Collector behavior: preservation, relocation, sharing, and the
//! kind-specific scan subtleties.

use katsu_asm::ConditionTag;
use katsu_types::{Obj, Value};

use crate::gc::roots::{ObjRoot, OptObjRoot, RootList, ValueRoot};
use crate::gc::{Gc, Heap, NoExtraRoots};
use crate::interpreter::frame::CallStack;
use crate::object::{Array, CallSegment, DataclassInstance, Str, Tuple, TypeKind, Vector};
use crate::values::{
    make_call_segment, make_instance_nofill, make_string, make_tuple, make_vector, vector_push,
};

use super::test_helpers::fix;

fn small_gc() -> (Gc, RootList) {
    (Gc::new(1 << 16), RootList::new())
}

#[test]
fn rooted_objects_survive_collection_and_move() {
    let (mut gc, roots) = small_gc();
    let mut provider = NoExtraRoots;
    let mut heap = Heap::new(&mut gc, &roots, &mut provider);

    let s = make_string(&mut heap, "survivor").unwrap();
    let r_s = ObjRoot::new(heap.roots(), s);
    let before = r_s.get().as_ptr();

    heap.collect();

    let after = r_s.get().as_ptr();
    assert_ne!(before, after, "semispace flip relocates survivors");
    assert_eq!(r_s.get().bytes(), b"survivor");
}

#[test]
fn unreachable_objects_are_dropped() {
    let (mut gc, roots) = small_gc();
    let mut provider = NoExtraRoots;
    let mut heap = Heap::new(&mut gc, &roots, &mut provider);

    let keep = make_string(&mut heap, "keep").unwrap();
    let r_keep = ObjRoot::new(heap.roots(), keep);
    for _ in 0..8 {
        let _ = make_string(&mut heap, "garbage garbage garbage").unwrap();
    }
    let used_before = heap.used();

    heap.collect();

    assert!(heap.used() < used_before);
    assert_eq!(r_keep.get().bytes(), b"keep");
}

#[test]
fn shared_references_stay_shared() {
    let (mut gc, roots) = small_gc();
    let mut provider = NoExtraRoots;
    let mut heap = Heap::new(&mut gc, &roots, &mut provider);

    let s = make_string(&mut heap, "shared").unwrap();
    let r_s = ObjRoot::new(heap.roots(), s);
    let mut tuple = make_tuple(&mut heap, 2).unwrap();
    tuple.components_mut()[0] = r_s.value();
    tuple.components_mut()[1] = r_s.value();
    let r_tuple = ObjRoot::new(heap.roots(), tuple);

    heap.collect();

    let tuple = r_tuple.get();
    // One copy, both slots rewritten to it.
    assert_eq!(tuple.components()[0], tuple.components()[1]);
    assert_eq!(
        Obj::<Str>::from_value(tuple.components()[0]).bytes(),
        b"shared"
    );
}

#[test]
fn allocation_collects_when_the_space_fills() {
    let mut gc = Gc::new(1 << 10);
    let roots = RootList::new();
    let mut provider = NoExtraRoots;
    let mut heap = Heap::new(&mut gc, &roots, &mut provider);

    // Fill the space with garbage; fresh allocations keep succeeding
    // because each collection drops the previous ones.
    for i in 0..64 {
        let s = make_string(&mut heap, &"x".repeat(100)).unwrap();
        assert_eq!(s.length, 100, "allocation {i} succeeded");
    }
}

#[test]
fn exhaustion_with_live_data_is_out_of_memory() {
    let mut gc = Gc::new(256);
    let roots = RootList::new();
    let mut provider = NoExtraRoots;
    let mut heap = Heap::new(&mut gc, &roots, &mut provider);

    let a = make_string(&mut heap, &"a".repeat(100)).unwrap();
    let _r_a = ObjRoot::new(heap.roots(), a);
    let b = make_string(&mut heap, &"b".repeat(100)).unwrap();
    let _r_b = ObjRoot::new(heap.roots(), b);

    let err = make_string(&mut heap, &"c".repeat(100)).unwrap_err();
    assert_eq!(
        err.as_condition().map(|c| c.tag),
        Some(ConditionTag::OutOfMemory)
    );
}

#[test]
fn oversized_requests_fail_without_collecting() {
    let (mut gc, roots) = small_gc();
    let mut provider = NoExtraRoots;
    let mut heap = Heap::new(&mut gc, &roots, &mut provider);

    let err = make_string(&mut heap, &"x".repeat(1 << 17)).unwrap_err();
    assert_eq!(
        err.as_condition().map(|c| c.tag),
        Some(ConditionTag::OutOfMemory)
    );
}

#[test]
fn vectors_grow_correctly_under_constant_collection() {
    let (mut gc, roots) = small_gc();
    gc.set_stress(true);
    let mut provider = NoExtraRoots;
    let mut heap = Heap::new(&mut gc, &roots, &mut provider);

    let vector = make_vector(&mut heap, 0).unwrap();
    let r_vector = ObjRoot::new(heap.roots(), vector);
    for i in 0..100 {
        let r_item = ValueRoot::new(heap.roots(), fix(i));
        vector_push(&mut heap, &r_vector, &r_item).unwrap();
    }

    let vector = r_vector.get();
    assert_eq!(vector.length, 100);
    for (i, item) in vector.components().iter().enumerate() {
        assert_eq!(item.as_fixnum(), Some(i as i64), "append order preserved");
    }
}

#[test]
fn instance_sizing_follows_an_already_forwarded_type() {
    let (mut gc, roots) = small_gc();
    let mut provider = NoExtraRoots;
    let mut heap = Heap::new(&mut gc, &roots, &mut provider);

    // Build a two-slot dataclass type.
    let name = make_string(&mut heap, "Pair").unwrap();
    let r_name = ObjRoot::new(heap.roots(), name);
    let bases = crate::values::make_array(&mut heap, 0).unwrap();
    let r_bases = ObjRoot::new(heap.roots(), bases);
    let slots = crate::values::make_array(&mut heap, 2).unwrap();
    let r_slots_arr = ObjRoot::new(heap.roots(), slots);
    let r_slots = OptObjRoot::<Array>::new(heap.roots(), Some(r_slots_arr.get()));
    let ty = crate::types::make_type(
        &mut heap,
        &r_name,
        &r_bases,
        false,
        TypeKind::Dataclass,
        &r_slots,
        Some(2),
    )
    .unwrap();

    // Root order matters for the regression: the type is visited (and
    // forwarded) before the instance, so sizing the instance during the
    // scan must chase the forwarding pointer.
    let r_ty = ObjRoot::new(heap.roots(), ty);
    let mut instance = make_instance_nofill(&mut heap, &r_ty).unwrap();
    instance.slots_mut()[0] = fix(10);
    instance.slots_mut()[1] = fix(20);
    let r_instance = ObjRoot::new(heap.roots(), instance);

    heap.collect();
    heap.collect();

    let instance: Obj<DataclassInstance> = r_instance.get();
    assert_eq!(instance.num_slots(), 2);
    assert_eq!(instance.slots()[0].as_fixnum(), Some(10));
    assert_eq!(instance.slots()[1].as_fixnum(), Some(20));
    assert_eq!(instance.ty, r_ty.value());
}

#[test]
fn call_segments_trace_their_embedded_frames() {
    let (mut gc, roots) = small_gc();
    let mut stack = CallStack::new(4096);

    // Two synthetic frames holding heap values in registers, data and the
    // marker.
    let f1 = stack
        .alloc_frame(1, 2, Value::NULL, Value::NULL, Value::NULL)
        .unwrap();
    unsafe {
        (*f1).regs_mut().fill(Value::NULL);
    }
    stack.set_current(f1);
    let f2 = stack
        .alloc_frame(2, 1, Value::NULL, Value::NULL, fix(5))
        .unwrap();
    unsafe {
        (*f2).regs_mut().fill(Value::NULL);
    }
    stack.set_current(f2);

    let (reg_str, data_str) = {
        let mut heap = Heap::new(&mut gc, &roots, &mut stack);
        let a = make_string(&mut heap, "in a register").unwrap();
        let r_a = ObjRoot::new(heap.roots(), a);
        let b = make_string(&mut heap, "on the data stack").unwrap();
        (r_a.get().value(), b.value())
    };
    unsafe {
        (*f1).regs_mut()[0] = reg_str;
        (*f2).push(data_str);
    }

    // Reify the whole two-frame stack.
    let total_length = unsafe { (*f2).next() as usize - f1 as usize };
    let segment = {
        let mut heap = Heap::new(&mut gc, &roots, &mut stack);
        unsafe { make_call_segment(&mut heap, f1, total_length).unwrap() }
    };
    let r_segment = ObjRoot::new(&roots, segment);

    // Collect with the stack deliberately absent from the roots: only the
    // segment keeps the strings alive.
    let mut provider = NoExtraRoots;
    gc.collect(&roots, &mut provider);

    let segment = r_segment.get();
    unsafe {
        let first = CallSegment::frames_ptr(segment.as_ptr())
            .cast::<crate::interpreter::frame::Frame>();
        assert!((*first).caller.is_null(), "copied frames drop their callers");
        assert_eq!((*first).num_regs, 1);
        let reg = (*first).regs()[0];
        assert_eq!(Obj::<Str>::from_value(reg).bytes(), b"in a register");

        let second = (*first).next();
        assert!((*second).caller.is_null());
        assert_eq!((*second).marker.as_fixnum(), Some(5));
        assert_eq!((*second).data_depth, 1);
        let data = (*second).data()[0];
        assert_eq!(Obj::<Str>::from_value(data).bytes(), b"on the data stack");
    }
}

#[test]
fn strings_and_byte_arrays_copy_byte_exact() {
    let (mut gc, roots) = small_gc();
    let mut provider = NoExtraRoots;
    let mut heap = Heap::new(&mut gc, &roots, &mut provider);

    let s = make_string(&mut heap, "exact \u{00e9}\u{0001}bytes").unwrap();
    let r_s = ObjRoot::new(heap.roots(), s);
    let mut bytes = crate::values::make_byte_array(&mut heap, 5).unwrap();
    bytes.bytes_mut().copy_from_slice(&[0, 1, 254, 255, 42]);
    let r_bytes = ObjRoot::new(heap.roots(), bytes);

    heap.collect();

    assert_eq!(r_s.get().bytes(), "exact \u{00e9}\u{0001}bytes".as_bytes());
    assert_eq!(r_bytes.get().bytes(), &[0, 1, 254, 255, 42]);
}

#[test]
fn tuples_arrays_and_vectors_trace_their_components() {
    let (mut gc, roots) = small_gc();
    let mut provider = NoExtraRoots;
    let mut heap = Heap::new(&mut gc, &roots, &mut provider);

    let s = make_string(&mut heap, "element").unwrap();
    let r_s = ObjRoot::new(heap.roots(), s);

    let vector = make_vector(&mut heap, 2).unwrap();
    let r_vector = ObjRoot::new(heap.roots(), vector);
    {
        let r_item = ValueRoot::new(heap.roots(), r_s.value());
        vector_push(&mut heap, &r_vector, &r_item).unwrap();
    }

    heap.collect();

    let vector: Obj<Vector> = r_vector.get();
    assert_eq!(vector.length, 1);
    assert_eq!(
        Obj::<Str>::from_value(vector.get(0)).bytes(),
        b"element"
    );
    // The vector's backing array moved with it.
    let backing: Obj<Array> = vector.backing_array();
    assert_eq!(backing.length, 2);
}

#[test]
fn tuple_identity_is_preserved_across_collections() {
    let (mut gc, roots) = small_gc();
    let mut provider = NoExtraRoots;
    let mut heap = Heap::new(&mut gc, &roots, &mut provider);

    let mut tuple = make_tuple(&mut heap, 1).unwrap();
    tuple.components_mut()[0] = fix(9);
    let r_a = ObjRoot::new(heap.roots(), tuple);
    let r_b = ValueRoot::new(heap.roots(), r_a.value());

    heap.collect();

    // Two roots to the same object still agree after relocation.
    assert_eq!(r_a.value(), r_b.get());
    assert_eq!(Obj::<Tuple>::from_value(r_b.get()).components()[0], fix(9));
}
