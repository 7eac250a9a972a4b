//! Multimethod dispatch downselection.

use katsu_asm::ConditionTag;
use katsu_types::Value;

use crate::interpreter::BuiltinId;

use super::test_helpers::*;

/// Three methods on `m:` — `((a: Fixnum) m: b)`, `(a m: (b: Fixnum))`,
/// `(a m: b)` — each returning a distinct literal so the selected method
/// is observable.
fn multimethod_with_three_specificities(vm: &mut crate::interpreter::Interpreter) -> Value {
    let module = empty_module(vm);
    let fixnum_ty = vm.builtin(BuiltinId::Fixnum);
    let mm = fresh_multimethod(vm, "m:", 2);

    for (matchers, result) in [
        ([fixnum_ty, Value::NULL], 1),
        ([Value::NULL, fixnum_ty], 2),
        ([Value::NULL, Value::NULL], 3),
    ] {
        let mut body = CodeBuilder::new(2, 2, 1);
        body.load_value(fix(result));
        let body = body.build(vm, module).value();
        add_code_method(vm, mm, &matchers, body);
    }
    mm
}

fn call_mm(vm: &mut crate::interpreter::Interpreter, mm: Value, a: Value, b: Value) -> crate::error::VmResult<Value> {
    let module = empty_module(vm);
    let mut top = CodeBuilder::new(0, 0, 2);
    top.load_value(a).load_value(b).invoke(mm, 2);
    let code = top.build(vm, module);
    vm.eval_toplevel(code)
}

#[test]
fn the_most_specific_method_wins() {
    let mut vm = test_vm();
    let mm = multimethod_with_three_specificities(&mut vm);
    let x = string_value(&mut vm, "x");
    let y = string_value(&mut vm, "y");

    // 5 m: "x" selects the first-position specialization.
    let result = call_mm(&mut vm, mm, fix(5), x).unwrap();
    assert_eq!(result.as_fixnum(), Some(1));

    // "x" m: 5 selects the second-position specialization.
    let result = call_mm(&mut vm, mm, x, fix(5)).unwrap();
    assert_eq!(result.as_fixnum(), Some(2));

    // "x" m: "y" falls through to the catch-all.
    let result = call_mm(&mut vm, mm, x, y).unwrap();
    assert_eq!(result.as_fixnum(), Some(3));
}

#[test]
fn incomparable_matches_are_ambiguous() {
    let mut vm = test_vm();
    let mm = multimethod_with_three_specificities(&mut vm);

    // 5 m: 10 matches both one-position specializations; neither
    // dominates the other.
    let err = call_mm(&mut vm, mm, fix(5), fix(10)).unwrap_err();
    assert_eq!(
        err.as_condition().map(|c| c.tag),
        Some(ConditionTag::AmbiguousMethodResolution)
    );
}

#[test]
fn no_matching_method_is_its_own_condition() {
    let mut vm = test_vm();
    let module = empty_module(&mut vm);
    let fixnum_ty = vm.builtin(BuiltinId::Fixnum);
    let mm = fresh_multimethod(&mut vm, "strict:", 2);
    let mut body = CodeBuilder::new(2, 2, 1);
    body.load_value(fix(0));
    let body = body.build(&mut vm, module).value();
    add_code_method(&mut vm, mm, &[fixnum_ty, fixnum_ty], body);

    let x = string_value(&mut vm, "x");
    let err = call_mm(&mut vm, mm, x, x).unwrap_err();
    assert_eq!(
        err.as_condition().map(|c| c.tag),
        Some(ConditionTag::NoMatchingMethod)
    );
}

#[test]
fn value_matchers_outrank_type_matchers() {
    let mut vm = test_vm();
    let module = empty_module(&mut vm);
    let fixnum_ty = vm.builtin(BuiltinId::Fixnum);
    let mm = fresh_multimethod(&mut vm, "pick:", 1);

    // A ref matcher on the literal 0 against a Fixnum type matcher.
    let zero_matcher = ref_cell(&mut vm, fix(0));
    let mut zero_body = CodeBuilder::new(1, 1, 1);
    zero_body.load_value(fix(100));
    let zero_body = zero_body.build(&mut vm, module).value();
    add_code_method(&mut vm, mm, &[zero_matcher], zero_body);

    let mut any_fixnum_body = CodeBuilder::new(1, 1, 1);
    any_fixnum_body.load_value(fix(200));
    let any_fixnum_body = any_fixnum_body.build(&mut vm, module).value();
    add_code_method(&mut vm, mm, &[fixnum_ty], any_fixnum_body);

    let call1 = |vm: &mut crate::interpreter::Interpreter, arg: Value| {
        let module = empty_module(vm);
        let mut top = CodeBuilder::new(0, 0, 1);
        top.load_value(arg).invoke(mm, 1);
        let code = top.build(vm, module);
        vm.eval_toplevel(code)
    };

    assert_eq!(call1(&mut vm, fix(0)).unwrap().as_fixnum(), Some(100));
    assert_eq!(call1(&mut vm, fix(3)).unwrap().as_fixnum(), Some(200));
}

#[test]
fn plain_values_return_themselves_when_called() {
    // Invoking a non-callable pushes it back.
    let mut vm = test_vm();
    let module = empty_module(&mut vm);
    let call = builtin_op(&vm, "call");
    let mut top = CodeBuilder::new(0, 0, 1);
    top.load_value(fix(17)).invoke(call, 1);
    let code = top.build(&mut vm, module);

    let result = vm.eval_toplevel(code).expect("evaluates");
    assert_eq!(result.as_fixnum(), Some(17));
}

#[test]
fn raw_code_requiring_captures_cannot_be_called() {
    let mut vm = test_vm();
    let module = empty_module(&mut vm);
    let call = builtin_op(&vm, "call");

    let mut block = CodeBuilder::new(1, 2, 1).with_upreg_map(&[1]);
    block.load_reg(1);
    let block = block.build(&mut vm, module).value();

    // Passing the raw template instead of wrapping it in a closure.
    let mut top = CodeBuilder::new(0, 0, 1);
    top.load_value(block).invoke(call, 1);
    let code = top.build(&mut vm, module);

    let err = vm.eval_toplevel(code).unwrap_err();
    assert_eq!(
        err.as_condition().map(|c| c.tag),
        Some(ConditionTag::RawClosureCall)
    );
}
