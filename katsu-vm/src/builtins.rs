//! The builtin interface surface.
//!
//! Builtins proper are external collaborators: methods whose body is a
//! [`NativeHandler`] or [`IntrinsicHandler`] instead of code. This module
//! carries the registration machinery plus the minimal surface the
//! runtime itself relies on — the base types, fixnum arithmetic, the call
//! family, continuations, type predicates and condition-handler
//! installation — registered into a `core.builtin.default` module.

use katsu_asm::ConditionTag;
use katsu_types::{Obj, Value};

use crate::error::{VmError, VmResult};
use crate::gc::roots::{ObjRoot, OptObjRoot, RootList, ValueRoot};
use crate::gc::{Gc, Heap};
use crate::interpreter::flow::{
    intrinsic_call_dc, intrinsic_call_marked, intrinsic_get_call_stack,
};
use crate::interpreter::{BuiltinId, Interpreter, MachineState, OpenVm};
use crate::object::{
    Array, Assoc, Code, IntrinsicHandler, NativeHandler, Str, Tuple, Type, TypeKind,
};
use crate::pretty::render;
use crate::types::{is_instance, is_subtype, make_type, type_of};
use crate::values::{
    assoc_get_native, assoc_push, concat, make_array, make_assoc, make_method,
    make_multimethod, make_string, make_vector, string_eq,
};

/// How one method parameter is matched, for registration.
#[derive(Debug, Clone, Copy)]
pub enum MatcherSpec {
    /// Match any value.
    Any,
    /// Match instances of the registered base type.
    Of(BuiltinId),
}

/// Install the builtin surface into a fresh machine: the
/// `core.builtin.default` module and the module table.
pub fn install(vm: &mut Interpreter) -> VmResult<()> {
    use BuiltinId::*;
    use MatcherSpec::{Any, Of};

    let Interpreter { gc, roots, machine } = vm;

    let defaults = {
        let mut heap = Heap::new(gc, roots, machine);
        make_assoc(&mut heap, 64)?
    };
    let r_defaults = ObjRoot::new(roots, defaults);

    register(gc, roots, machine, &r_defaults, Some(Null), "null", Value::NULL)?;
    register(gc, roots, machine, &r_defaults, Some(True), "t", Value::TRUE)?;
    register(gc, roots, machine, &r_defaults, Some(False), "f", Value::FALSE)?;

    for (id, name) in [
        (Fixnum, "Fixnum"),
        (Float, "Float"),
        (Bool, "Bool"),
        (NullType, "Null"),
        (Ref, "Ref"),
        (Tuple, "Tuple"),
        (Array, "Array"),
        (Vector, "Vector"),
        (Assoc, "Assoc"),
        (String, "String"),
        (ByteArray, "ByteArray"),
        (Code, "Code"),
        (Closure, "Closure"),
        (Method, "Method"),
        (MultiMethod, "MultiMethod"),
        (Type, "Type"),
        (CallSegment, "CallSegment"),
        (Foreign, "Foreign"),
    ] {
        let ty = make_base_type(gc, roots, machine, name)?;
        register(gc, roots, machine, &r_defaults, Some(id), name, ty)?;
    }

    let natives: &[(&str, &[MatcherSpec], NativeHandler)] = &[
        ("+:", &[Of(Fixnum), Of(Fixnum)], native_add),
        ("-:", &[Of(Fixnum), Of(Fixnum)], native_sub),
        ("*:", &[Of(Fixnum), Of(Fixnum)], native_mul),
        ("/:", &[Of(Fixnum), Of(Fixnum)], native_div),
        ("<:", &[Of(Fixnum), Of(Fixnum)], native_lt),
        ("=:", &[Any, Any], native_eq),
        ("~:", &[Of(String), Of(String)], native_concat),
        ("print:", &[Any, Any], native_print),
        ("pr", &[Any], native_pr),
        ("type", &[Any], native_type),
        ("subtype?:", &[Of(Type), Of(Type)], native_subtype),
        ("instance?:", &[Any, Of(Type)], native_instance),
    ];
    for &(name, matchers, handler) in natives {
        add_handler(
            gc,
            roots,
            machine,
            &r_defaults,
            name,
            matchers,
            Some(handler),
            None,
        )?;
    }

    let intrinsics: &[(&str, &[MatcherSpec], IntrinsicHandler)] = &[
        ("then:else:", &[Any, Any, Any], intrinsic_then_else),
        ("call", &[Any], intrinsic_call),
        ("call:", &[Any, Any], intrinsic_call_with),
        ("call*:", &[Any, Any], intrinsic_call_star),
        ("call/marked:", &[Any, Any], intrinsic_call_marked),
        ("call/dc:", &[Any, Any], intrinsic_call_dc),
        ("get-call-stack", &[Any], intrinsic_get_call_stack),
        (
            "set-condition-handler-from-module",
            &[Any],
            intrinsic_set_condition_handler,
        ),
        ("loaded-modules", &[Any], intrinsic_loaded_modules),
    ];
    for &(name, matchers, handler) in intrinsics {
        add_handler(
            gc,
            roots,
            machine,
            &r_defaults,
            name,
            matchers,
            None,
            Some(handler),
        )?;
    }

    // The module table, seeded with the defaults module.
    {
        let modules = {
            let mut heap = Heap::new(gc, roots, machine);
            make_assoc(&mut heap, 4)?
        };
        let r_modules = ObjRoot::new(roots, modules);
        let key = {
            let mut heap = Heap::new(gc, roots, machine);
            make_string(&mut heap, "core.builtin.default")?
        };
        let r_key = ValueRoot::new(roots, key.value());
        let r_value = ValueRoot::new(roots, r_defaults.value());
        {
            let mut heap = Heap::new(gc, roots, machine);
            assoc_push(&mut heap, &r_modules, &r_key, &r_value)?;
        }
        machine.modules = r_modules.value();
    }

    Ok(())
}

/// Register `value` under `name` in `module`, and under `id` in the
/// machine's builtin table when given.
fn register(
    gc: &mut Gc,
    roots: &RootList,
    machine: &mut MachineState,
    module: &ObjRoot<'_, Assoc>,
    id: Option<BuiltinId>,
    name: &str,
    value: Value,
) -> VmResult<()> {
    let r_value = ValueRoot::new(roots, value);
    let key = {
        let mut heap = Heap::new(gc, roots, machine);
        make_string(&mut heap, name)?
    };
    let r_key = ValueRoot::new(roots, key.value());
    {
        let mut heap = Heap::new(gc, roots, machine);
        assoc_push(&mut heap, module, &r_key, &r_value)?;
    }
    if let Some(id) = id {
        machine.builtins[id as usize] = r_value.get();
    }
    Ok(())
}

/// Make a sealed primitive base type with no bases.
fn make_base_type(
    gc: &mut Gc,
    roots: &RootList,
    machine: &mut MachineState,
    name: &str,
) -> VmResult<Value> {
    let name_s = {
        let mut heap = Heap::new(gc, roots, machine);
        make_string(&mut heap, name)?
    };
    let r_name = ObjRoot::new(roots, name_s);
    let bases = {
        let mut heap = Heap::new(gc, roots, machine);
        make_array(&mut heap, 0)?
    };
    let r_bases = ObjRoot::new(roots, bases);
    let r_slots = OptObjRoot::<Array>::new(roots, None);
    let ty = {
        let mut heap = Heap::new(gc, roots, machine);
        make_type(
            &mut heap,
            &r_name,
            &r_bases,
            true,
            TypeKind::Primitive,
            &r_slots,
            None,
        )?
    };
    Ok(ty.value())
}

/// Build a one-method multimethod around a native or intrinsic handler and
/// register it in `module`.
#[allow(clippy::too_many_arguments)]
fn add_handler(
    gc: &mut Gc,
    roots: &RootList,
    machine: &mut MachineState,
    module: &ObjRoot<'_, Assoc>,
    name: &str,
    matchers: &[MatcherSpec],
    native: Option<NativeHandler>,
    intrinsic: Option<IntrinsicHandler>,
) -> VmResult<()> {
    let matcher_array = {
        let mut heap = Heap::new(gc, roots, machine);
        make_array(&mut heap, matchers.len() as u64)?
    };
    {
        let mut matcher_array = matcher_array;
        for (slot, spec) in matcher_array.components_mut().iter_mut().zip(matchers) {
            *slot = match spec {
                MatcherSpec::Any => Value::NULL,
                MatcherSpec::Of(id) => machine.builtins[*id as usize],
            };
        }
    }
    let r_matchers = ObjRoot::new(roots, matcher_array);

    let attributes = {
        let mut heap = Heap::new(gc, roots, machine);
        make_vector(&mut heap, 0)?
    };
    let r_attributes = ObjRoot::new(roots, attributes);
    let r_return_type = OptObjRoot::<Type>::new(roots, None);
    let r_code = OptObjRoot::<Code>::new(roots, None);
    let method = {
        let mut heap = Heap::new(gc, roots, machine);
        make_method(
            &mut heap,
            &r_matchers,
            &r_return_type,
            &r_code,
            &r_attributes,
            native,
            intrinsic,
        )?
    };
    let r_method = ObjRoot::new(roots, method);

    let methods = {
        let mut heap = Heap::new(gc, roots, machine);
        make_vector(&mut heap, 1)?
    };
    let r_methods = ObjRoot::new(roots, methods);
    {
        let rv_method = ValueRoot::new(roots, r_method.value());
        let mut heap = Heap::new(gc, roots, machine);
        crate::values::vector_push(&mut heap, &r_methods, &rv_method)?;
    }

    let name_s = {
        let mut heap = Heap::new(gc, roots, machine);
        make_string(&mut heap, name)?
    };
    let r_name = ObjRoot::new(roots, name_s);
    let mm_attributes = {
        let mut heap = Heap::new(gc, roots, machine);
        make_vector(&mut heap, 0)?
    };
    let r_mm_attributes = ObjRoot::new(roots, mm_attributes);
    let multimethod = {
        let mut heap = Heap::new(gc, roots, machine);
        make_multimethod(
            &mut heap,
            &r_name,
            matchers.len() as u32,
            &r_methods,
            &r_mm_attributes,
        )?
    };

    register(gc, roots, machine, module, None, name, multimethod.value())
}

// Arithmetic. Matchers guarantee fixnum arguments; results re-pack through
// the range check, so overflow surfaces as `out-of-range`.

fn native_add(_vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 2);
    Ok(Value::fixnum(args[0].expect_fixnum() + args[1].expect_fixnum())?)
}

fn native_sub(_vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 2);
    Ok(Value::fixnum(args[0].expect_fixnum() - args[1].expect_fixnum())?)
}

fn native_mul(_vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 2);
    let product = args[0]
        .expect_fixnum()
        .checked_mul(args[1].expect_fixnum())
        .ok_or_else(|| {
            VmError::condition(ConditionTag::OutOfRange, "product does not fit a fixnum")
        })?;
    Ok(Value::fixnum(product)?)
}

fn native_div(_vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 2);
    let divisor = args[1].expect_fixnum();
    if divisor == 0 {
        return Err(VmError::condition(
            ConditionTag::DivideByZero,
            "cannot divide by integer 0",
        ));
    }
    Ok(Value::fixnum(args[0].expect_fixnum() / divisor)?)
}

fn native_lt(_vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 2);
    Ok(Value::bool(args[0].expect_fixnum() < args[1].expect_fixnum()))
}

/// Value equality; strings compare byte-exact, everything else by
/// identity.
fn native_eq(_vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 2);
    let equal = match (
        Obj::<Str>::try_from_value(args[0]),
        Obj::<Str>::try_from_value(args[1]),
    ) {
        (Some(a), Some(b)) => string_eq(&a, &b),
        _ => args[0] == args[1],
    };
    Ok(Value::bool(equal))
}

fn native_concat(vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 2);
    let Interpreter { gc, roots, machine } = vm;
    let r_a = ObjRoot::new(roots, Obj::<Str>::from_value(args[0]));
    let r_b = ObjRoot::new(roots, Obj::<Str>::from_value(args[1]));
    let mut heap = Heap::new(gc, roots, machine);
    Ok(concat(&mut heap, &r_a, &r_b)?.value())
}

fn native_print(_vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 2);
    match Obj::<Str>::try_from_value(args[1]) {
        Some(s) => println!("{}", s.to_string_lossy()),
        None => println!("{}", render(args[1])),
    }
    Ok(Value::NULL)
}

fn native_pr(_vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 1);
    match Obj::<Str>::try_from_value(args[0]) {
        Some(s) => println!("{}", s.to_string_lossy()),
        None => println!("{}", render(args[0])),
    }
    Ok(args[0])
}

fn native_type(vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 1);
    Ok(type_of(vm, args[0]))
}

fn native_subtype(_vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 2);
    Ok(Value::bool(is_subtype(
        Obj::from_value(args[0]),
        Obj::from_value(args[1]),
    )))
}

fn native_instance(vm: &mut Interpreter, nargs: i64, args: &[Value]) -> VmResult<Value> {
    debug_assert_eq!(nargs, 2);
    Ok(Value::bool(is_instance(
        vm,
        args[0],
        Obj::from_value(args[1]),
    )))
}

/// `cond then: a else: b` — call the matching branch with no arguments.
/// Anything but true selects the else branch.
fn intrinsic_then_else(
    open: &mut OpenVm<'_>,
    tail_call: bool,
    nargs: i64,
    args: &[Value],
) -> VmResult<()> {
    debug_assert_eq!(nargs, 3);
    let body = if args[0].as_bool().unwrap_or(false) {
        args[1]
    } else {
        args[2]
    };
    open.vm.call_value(body, tail_call, &[], Value::NULL)
}

/// `value call` — call with no arguments.
fn intrinsic_call(
    open: &mut OpenVm<'_>,
    tail_call: bool,
    nargs: i64,
    args: &[Value],
) -> VmResult<()> {
    debug_assert_eq!(nargs, 1);
    open.vm.call_value(args[0], tail_call, &[], Value::NULL)
}

/// `value call: arg` — call with one argument.
fn intrinsic_call_with(
    open: &mut OpenVm<'_>,
    tail_call: bool,
    nargs: i64,
    args: &[Value],
) -> VmResult<()> {
    debug_assert_eq!(nargs, 2);
    open.vm
        .call_value(args[0], tail_call, &args[1..2], Value::NULL)
}

/// `value call*: args` — call with a non-empty tuple of arguments.
fn intrinsic_call_star(
    open: &mut OpenVm<'_>,
    tail_call: bool,
    nargs: i64,
    args: &[Value],
) -> VmResult<()> {
    debug_assert_eq!(nargs, 2);
    let tuple = Obj::<Tuple>::try_from_value(args[1]).ok_or_else(|| {
        VmError::condition(ConditionTag::InvalidArgument, "arguments must be a tuple")
    })?;
    if tuple.length == 0 {
        return Err(VmError::condition(
            ConditionTag::InvalidArgument,
            "arguments must be non-empty",
        ));
    }
    let call_args: Vec<Value> = tuple.components().to_vec();
    open.vm
        .call_value(args[0], tail_call, &call_args, Value::NULL)
}

/// `_ set-condition-handler-from-module` — install the handler bound as
/// `handle-raw-condition-with-message:` in the current frame's module.
fn intrinsic_set_condition_handler(
    open: &mut OpenVm<'_>,
    _tail_call: bool,
    nargs: i64,
    _args: &[Value],
) -> VmResult<()> {
    debug_assert_eq!(nargs, 1);
    let frame = open.frame();
    // Safety: a live frame is invoking.
    let module = unsafe { Obj::<Assoc>::from_value((*frame).module) };
    let handler = assoc_get_native(&module, "handle-raw-condition-with-message:")
        .expect("module must bind handle-raw-condition-with-message:");
    open.vm.set_condition_handler(handler);
    // Safety: as above.
    unsafe {
        (*frame).push(Value::NULL);
        (*frame).inst_spot += 1;
    }
    Ok(())
}

/// `_ loaded-modules` — the machine's module table.
fn intrinsic_loaded_modules(
    open: &mut OpenVm<'_>,
    _tail_call: bool,
    nargs: i64,
    _args: &[Value],
) -> VmResult<()> {
    debug_assert_eq!(nargs, 1);
    let modules = open.vm.modules();
    let frame = open.frame();
    // Safety: a live frame is invoking.
    unsafe {
        (*frame).push(modules);
        (*frame).inst_spot += 1;
    }
    Ok(())
}
