//! The type system: C3 linearization, subtype testing, and the mapping
//! from values to their types.
//!
//! Each type stores its full linearization with itself at position 0,
//! computed by the C3 merge over the linearizations of its bases plus the
//! bases list itself. The subtype test and dispatch specificity both read
//! linearizations; nothing here is recomputed after construction.

use katsu_asm::ConditionTag;
use katsu_types::{Obj, Value};

use crate::error::{VmError, VmResult};
use crate::gc::roots::{ObjRoot, OptObjRoot, ValueRoot};
use crate::gc::Heap;
use crate::interpreter::{BuiltinId, Interpreter};
use crate::object::{Array, DataclassInstance, Method, MultiMethod, Type, TypeKind, Vector};
use crate::values::{
    array_contains, array_contains_starting_at, make_array, make_array_nofill, make_type_raw,
    make_vector, vector_push, vector_to_array,
};
use katsu_types::{ObjectTag, Tag};

/// Merge the rooted array of linearization arrays into `merged`, appending
/// C3-style. Returns false if no merge exists; in that case `merged` may
/// hold a partial result.
pub fn c3_merge(
    heap: &mut Heap<'_>,
    linearizations: &ObjRoot<'_, Array>,
    merged: &ObjRoot<'_, Vector>,
) -> VmResult<bool> {
    // Cursor into each linearization; everything before it is consumed.
    let mut spots = vec![0u64; linearizations.length as usize];

    loop {
        // A candidate is any cursor head; a head wins if it appears in no
        // linearization's tail.
        let mut candidates_remaining = false;
        let mut head: Option<Value> = None;
        for (i, spot) in spots.iter().enumerate() {
            let linearization =
                Obj::<Array>::from_value(linearizations.get().components()[i]);
            if *spot == linearization.length {
                continue;
            }
            candidates_remaining = true;

            let candidate = linearization.components()[*spot as usize];
            let is_head = (0..spots.len()).all(|j| {
                let other = Obj::<Array>::from_value(linearizations.get().components()[j]);
                !array_contains_starting_at(&other, candidate, spots[j] + 1)
            });
            if is_head {
                head = Some(candidate);
                break;
            }
        }

        if !candidates_remaining {
            return Ok(true);
        }

        match head {
            Some(head) => {
                let r_head = ValueRoot::new(heap.roots(), head);
                vector_push(heap, merged, &r_head)?;
                let head = r_head.get();
                // Ratchet every linearization whose cursor sits on the head.
                for (i, spot) in spots.iter_mut().enumerate() {
                    let linearization =
                        Obj::<Array>::from_value(linearizations.get().components()[i]);
                    if *spot == linearization.length {
                        continue;
                    }
                    if linearization.components()[*spot as usize] == head {
                        *spot += 1;
                    }
                }
            }
            None => return Ok(false),
        }
    }
}

/// Compute the C3 linearization of a rooted type from its bases. The
/// type's stored linearization is ignored and not modified.
///
/// Signals `inheritance-cycle` when the type appears in a base's
/// linearization and `type-linearization-failure` when the merge has no
/// solution.
pub fn c3_linearization(
    heap: &mut Heap<'_>,
    ty: &ObjRoot<'_, Type>,
) -> VmResult<Obj<Array>> {
    let num_bases = Obj::<Array>::from_value(ty.bases).length;
    for i in 0..num_bases {
        let base = Obj::<Type>::from_value(Obj::<Array>::from_value(ty.bases).components()[i as usize]);
        if array_contains(&base.linearization_array(), ty.value()) {
            return Err(VmError::condition(
                ConditionTag::InheritanceCycle,
                format!(
                    "inheritance cycle starting from {}",
                    Obj::<crate::object::Str>::from_value(ty.get().name).to_string_lossy()
                ),
            ));
        }
    }

    // Initial capacity is a guess; growth handles the rest.
    let merged = make_vector(heap, 1 + num_bases + 1)?;
    let r_merged = ObjRoot::new(heap.roots(), merged);
    {
        let rv_type = ValueRoot::new(heap.roots(), ty.value());
        vector_push(heap, &r_merged, &rv_type)?;
    }

    let linearizations = make_array_nofill(heap, num_bases + 1)?;
    {
        let mut linearizations = linearizations;
        let bases = Obj::<Array>::from_value(ty.bases);
        for i in 0..num_bases as usize {
            let base = Obj::<Type>::from_value(bases.components()[i]);
            linearizations.components_mut()[i] = base.linearization;
        }
        linearizations.components_mut()[num_bases as usize] = ty.bases;
    }
    let r_linearizations = ObjRoot::new(heap.roots(), linearizations);

    if !c3_merge(heap, &r_linearizations, &r_merged)? {
        return Err(VmError::condition(
            ConditionTag::TypeLinearizationFailure,
            format!(
                "could not determine linearization of {}",
                Obj::<crate::object::Str>::from_value(ty.get().name).to_string_lossy()
            ),
        ));
    }

    vector_to_array(heap, &r_merged)
}

/// Make a fully constructed [`Type`]: compute its linearization and
/// register it in the subtypes vector of every proper ancestor.
pub fn make_type(
    heap: &mut Heap<'_>,
    name: &ObjRoot<'_, crate::object::Str>,
    bases: &ObjRoot<'_, Array>,
    sealed: bool,
    kind: TypeKind,
    slots: &OptObjRoot<'_, Array>,
    num_total_slots: Option<u32>,
) -> VmResult<Obj<Type>> {
    let init_linearization = make_array(heap, 0)?;
    let r_init_linearization = ObjRoot::new(heap.roots(), init_linearization);
    let subtypes = make_vector(heap, 0)?;
    let r_subtypes = ObjRoot::new(heap.roots(), subtypes);
    let ty = make_type_raw(
        heap,
        name,
        bases,
        sealed,
        &r_init_linearization,
        &r_subtypes,
        kind,
        slots,
        num_total_slots,
    )?;
    let r_type = ObjRoot::new(heap.roots(), ty);

    let linearization = c3_linearization(heap, &r_type)?;
    let r_linearization = ObjRoot::new(heap.roots(), linearization);
    r_type.get().linearization = r_linearization.value();

    // The type itself sits at position 0; register with every proper
    // ancestor.
    let linearization_length = r_linearization.length;
    for i in 1..linearization_length {
        let base = Obj::<Type>::from_value(r_linearization.get().components()[i as usize]);
        let r_base_subtypes =
            ObjRoot::new(heap.roots(), Obj::<Vector>::from_value(base.subtypes));
        let rv_type = ValueRoot::new(heap.roots(), r_type.value());
        vector_push(heap, &r_base_subtypes, &rv_type)?;
    }

    Ok(r_type.get())
}

/// Whether `a` is a subtype of `b`: `b`'s linearization is a suffix of
/// `a`'s.
pub fn is_subtype(a: Obj<Type>, b: Obj<Type>) -> bool {
    let lin_a = a.linearization_array();
    let lin_b = b.linearization_array();
    lin_a.length >= lin_b.length
        && lin_a.components()[(lin_a.length - lin_b.length) as usize] == lin_b.components()[0]
}

/// Whether a type-matcher `matcher` accepts a value of type `value_type`:
/// the matcher appears in the value type's linearization.
pub fn linearization_contains(value_type: Obj<Type>, matcher: Obj<Type>) -> bool {
    array_contains(&value_type.linearization_array(), matcher.value())
}

/// The type of a value. Inline values and non-instance objects map to the
/// built-in primitive types; a dataclass instance carries its own type.
/// Never allocates.
pub fn type_of(vm: &Interpreter, value: Value) -> Value {
    match value.tag() {
        Tag::Fixnum => vm.builtin(BuiltinId::Fixnum),
        Tag::Float => vm.builtin(BuiltinId::Float),
        Tag::Bool => vm.builtin(BuiltinId::Bool),
        Tag::Null => vm.builtin(BuiltinId::NullType),
        Tag::Object => {
            // Safety: object values point at live headers.
            let tag = unsafe { *value.expect_object().as_ptr() }.tag();
            match tag {
                ObjectTag::Ref => vm.builtin(BuiltinId::Ref),
                ObjectTag::Tuple => vm.builtin(BuiltinId::Tuple),
                ObjectTag::Array => vm.builtin(BuiltinId::Array),
                ObjectTag::Vector => vm.builtin(BuiltinId::Vector),
                ObjectTag::Assoc => vm.builtin(BuiltinId::Assoc),
                ObjectTag::Str => vm.builtin(BuiltinId::String),
                ObjectTag::ByteArray => vm.builtin(BuiltinId::ByteArray),
                ObjectTag::Code => vm.builtin(BuiltinId::Code),
                ObjectTag::Closure => vm.builtin(BuiltinId::Closure),
                ObjectTag::Method => vm.builtin(BuiltinId::Method),
                ObjectTag::MultiMethod => vm.builtin(BuiltinId::MultiMethod),
                ObjectTag::Type => vm.builtin(BuiltinId::Type),
                ObjectTag::Instance => Obj::<DataclassInstance>::from_value(value).ty,
                ObjectTag::CallSegment => vm.builtin(BuiltinId::CallSegment),
                ObjectTag::Foreign => vm.builtin(BuiltinId::Foreign),
            }
        }
    }
}

/// Whether `value` is an instance of `ty` (its type is a subtype of
/// `ty`). Never allocates.
pub fn is_instance(vm: &Interpreter, value: Value, ty: Obj<Type>) -> bool {
    is_subtype(Obj::from_value(type_of(vm, value)), ty)
}

/// Add a method to a multimethod. The method's arity must match.
pub fn add_method(
    heap: &mut Heap<'_>,
    multimethod: &ObjRoot<'_, MultiMethod>,
    method: &ObjRoot<'_, Method>,
) -> VmResult<()> {
    assert_eq!(
        Obj::<Array>::from_value(method.param_matchers).length,
        u64::from(multimethod.num_params),
        "method arity must match the multimethod"
    );
    let r_methods = ObjRoot::new(
        heap.roots(),
        Obj::<Vector>::from_value(multimethod.methods),
    );
    let rv_method = ValueRoot::new(heap.roots(), method.value());
    vector_push(heap, &r_methods, &rv_method)?;
    Ok(())
}
