//! Shared helpers for interpreter tests.
//!
//! The compiler is an external collaborator, so tests hand-assemble
//! [`Code`] objects with [`CodeBuilder`]. The builder keeps literal
//! operands in host vectors while instructions accumulate; tests therefore
//! build against a roomy heap so no collection happens mid-build (running
//! the built code is fully GC-safe afterwards — everything reachable hangs
//! off the frame or the module).

use katsu_asm::{Instruction, Opcode, RawInstruction};
use katsu_types::{Obj, Value};

use crate::gc::roots::{ObjRoot, OptObjRoot, ValueRoot};
use crate::gc::Heap;
use crate::interpreter::{Interpreter, VmParams};
use crate::object::{Array, Assoc, Code, MultiMethod, Str, Tuple, Type, TypeKind};
use crate::values::{
    assoc_get_native, assoc_push, make_array, make_array_nofill, make_assoc, make_method,
    make_multimethod, make_ref, make_string, make_tuple, make_vector,
};

/// A machine with the builtin surface installed and room to spare.
pub(crate) fn test_vm() -> Interpreter {
    Interpreter::bootstrapped(VmParams {
        heap_size: 16 * 1024 * 1024,
        call_stack_size: 16 * 1024,
    })
    .expect("bootstrap succeeds")
}

/// As [`test_vm`], with a deliberately small call stack for tail-call
/// tests.
pub(crate) fn test_vm_with_small_stack() -> Interpreter {
    Interpreter::bootstrapped(VmParams {
        heap_size: 16 * 1024 * 1024,
        call_stack_size: 2 * 1024,
    })
    .expect("bootstrap succeeds")
}

pub(crate) fn fix(n: i64) -> Value {
    Value::fixnum(n).expect("test literal in range")
}

/// The `core.builtin.default` binding registered under `name`.
pub(crate) fn builtin_op(vm: &Interpreter, name: &str) -> Value {
    let modules = Obj::<Assoc>::from_value(vm.modules());
    let defaults = Obj::<Assoc>::from_value(
        assoc_get_native(&modules, "core.builtin.default").expect("defaults module"),
    );
    assoc_get_native(&defaults, name)
        .unwrap_or_else(|| panic!("builtin {name} is registered"))
}

/// A fresh empty module assoc.
pub(crate) fn empty_module(vm: &mut Interpreter) -> Value {
    let Interpreter { gc, roots, machine } = vm;
    let mut heap = Heap::new(gc, roots, machine);
    make_assoc(&mut heap, 8).expect("module allocates").value()
}

/// Bind `value` under `name` in a module assoc.
pub(crate) fn bind_in_module(vm: &mut Interpreter, module: Value, name: &str, value: Value) {
    let Interpreter { gc, roots, machine } = vm;
    let r_module = ObjRoot::new(roots, Obj::<Assoc>::from_value(module));
    let r_value = ValueRoot::new(roots, value);
    let key = {
        let mut heap = Heap::new(gc, roots, machine);
        make_string(&mut heap, name).expect("key allocates")
    };
    let r_key = ValueRoot::new(roots, key.value());
    let mut heap = Heap::new(gc, roots, machine);
    assoc_push(&mut heap, &r_module, &r_key, &r_value).expect("binding allocates");
}

/// A heap string.
pub(crate) fn string_value(vm: &mut Interpreter, contents: &str) -> Value {
    let Interpreter { gc, roots, machine } = vm;
    let mut heap = Heap::new(gc, roots, machine);
    make_string(&mut heap, contents).expect("string allocates").value()
}

/// A mutable ref cell, for module-style bindings.
pub(crate) fn ref_cell(vm: &mut Interpreter, initial: Value) -> Value {
    let Interpreter { gc, roots, machine } = vm;
    let r_initial = ValueRoot::new(roots, initial);
    let mut heap = Heap::new(gc, roots, machine);
    make_ref(&mut heap, &r_initial).expect("ref allocates").value()
}

/// An empty multimethod of the given arity.
pub(crate) fn fresh_multimethod(vm: &mut Interpreter, name: &str, num_params: u32) -> Value {
    let Interpreter { gc, roots, machine } = vm;
    let name_s = {
        let mut heap = Heap::new(gc, roots, machine);
        make_string(&mut heap, name).expect("name allocates")
    };
    let r_name = ObjRoot::new(roots, name_s);
    let methods = {
        let mut heap = Heap::new(gc, roots, machine);
        make_vector(&mut heap, 4).expect("methods allocate")
    };
    let r_methods = ObjRoot::new(roots, methods);
    let attributes = {
        let mut heap = Heap::new(gc, roots, machine);
        make_vector(&mut heap, 0).expect("attributes allocate")
    };
    let r_attributes = ObjRoot::new(roots, attributes);
    let mut heap = Heap::new(gc, roots, machine);
    make_multimethod(&mut heap, &r_name, num_params, &r_methods, &r_attributes)
        .expect("multimethod allocates")
        .value()
}

/// Add a code-bodied method to a multimethod. `matchers` entries are null,
/// types, or refs.
pub(crate) fn add_code_method(
    vm: &mut Interpreter,
    multimethod: Value,
    matchers: &[Value],
    code: Value,
) {
    let Interpreter { gc, roots, machine } = vm;
    let r_mm = ObjRoot::new(roots, Obj::<MultiMethod>::from_value(multimethod));
    let r_code_obj = ObjRoot::new(roots, Obj::<Code>::from_value(code));

    let mut matcher_array = {
        let mut heap = Heap::new(gc, roots, machine);
        make_array_nofill(&mut heap, matchers.len() as u64).expect("matchers allocate")
    };
    matcher_array.components_mut().copy_from_slice(matchers);
    let r_matchers = ObjRoot::new(roots, matcher_array);

    let attributes = {
        let mut heap = Heap::new(gc, roots, machine);
        make_vector(&mut heap, 0).expect("attributes allocate")
    };
    let r_attributes = ObjRoot::new(roots, attributes);
    let r_return_type = OptObjRoot::<Type>::new(roots, None);
    let r_code = OptObjRoot::<Code>::new(roots, Some(r_code_obj.get()));
    let method = {
        let mut heap = Heap::new(gc, roots, machine);
        make_method(
            &mut heap,
            &r_matchers,
            &r_return_type,
            &r_code,
            &r_attributes,
            None,
            None,
        )
        .expect("method allocates")
    };
    let r_method = ObjRoot::new(roots, method);

    let mut heap = Heap::new(gc, roots, machine);
    crate::types::add_method(&mut heap, &r_mm, &r_method).expect("method registers");
}

/// Make a fresh dataclass type with the given slot names and no bases.
pub(crate) fn dataclass(vm: &mut Interpreter, name: &str, slot_names: &[&str]) -> Obj<Type> {
    let Interpreter { gc, roots, machine } = vm;
    let name_s = {
        let mut heap = Heap::new(gc, roots, machine);
        make_string(&mut heap, name).expect("name allocates")
    };
    let r_name = ObjRoot::new(roots, name_s);
    let bases = {
        let mut heap = Heap::new(gc, roots, machine);
        make_array(&mut heap, 0).expect("bases allocate")
    };
    let r_bases = ObjRoot::new(roots, bases);

    let slots = {
        let mut heap = Heap::new(gc, roots, machine);
        make_array(&mut heap, slot_names.len() as u64).expect("slots allocate")
    };
    let r_slots_arr = ObjRoot::new(roots, slots);
    for (i, slot_name) in slot_names.iter().enumerate() {
        let slot_s = {
            let mut heap = Heap::new(gc, roots, machine);
            make_string(&mut heap, slot_name).expect("slot name allocates")
        };
        r_slots_arr.get().components_mut()[i] = slot_s.value();
    }
    let r_slots = OptObjRoot::new(roots, Some(r_slots_arr.get()));

    let mut heap = Heap::new(gc, roots, machine);
    crate::types::make_type(
        &mut heap,
        &r_name,
        &r_bases,
        false,
        TypeKind::Dataclass,
        &r_slots,
        Some(slot_names.len() as u32),
    )
    .expect("type constructs")
}

/// Hand-assembler for [`Code`] objects.
///
/// Instructions and literal operands accumulate host-side; `build`
/// transfers them into the heap. Nothing may collect between adding the
/// first heap-object operand and `build` (tests run with heap headroom,
/// so nothing does).
pub(crate) struct CodeBuilder {
    num_params: u32,
    num_regs: u32,
    num_data: u32,
    upreg_map: Option<Vec<i64>>,
    insts: Vec<RawInstruction>,
    args: Vec<Value>,
}

impl CodeBuilder {
    pub(crate) fn new(num_params: u32, num_regs: u32, num_data: u32) -> Self {
        CodeBuilder {
            num_params,
            num_regs,
            num_data,
            upreg_map: None,
            insts: Vec::new(),
            args: Vec::new(),
        }
    }

    /// Mark this code as a closure body with the given upreg-to-register
    /// map.
    pub(crate) fn with_upreg_map(mut self, map: &[i64]) -> Self {
        self.upreg_map = Some(map.to_vec());
        self
    }

    pub(crate) fn op(&mut self, opcode: Opcode, operands: &[Value]) -> &mut Self {
        let base = self.args.len() as u32;
        self.insts.push(Instruction::new(opcode, base).into());
        self.args.extend_from_slice(operands);
        self
    }

    pub(crate) fn load_value(&mut self, value: Value) -> &mut Self {
        self.op(Opcode::LoadValue, &[value])
    }

    pub(crate) fn load_reg(&mut self, index: i64) -> &mut Self {
        self.op(Opcode::LoadReg, &[fix(index)])
    }

    pub(crate) fn store_reg(&mut self, index: i64) -> &mut Self {
        self.op(Opcode::StoreReg, &[fix(index)])
    }

    pub(crate) fn invoke(&mut self, callee: Value, nargs: i64) -> &mut Self {
        self.op(Opcode::Invoke, &[callee, fix(nargs)])
    }

    pub(crate) fn invoke_tail(&mut self, callee: Value, nargs: i64) -> &mut Self {
        self.op(Opcode::InvokeTail, &[callee, fix(nargs)])
    }

    pub(crate) fn make_closure(&mut self, template: Value) -> &mut Self {
        self.op(Opcode::MakeClosure, &[template])
    }

    pub(crate) fn make_tuple(&mut self, count: i64) -> &mut Self {
        self.op(Opcode::MakeTuple, &[fix(count)])
    }

    pub(crate) fn make_instance(&mut self, count: i64) -> &mut Self {
        self.op(Opcode::MakeInstance, &[fix(count)])
    }

    pub(crate) fn verify_is_type(&mut self) -> &mut Self {
        self.op(Opcode::VerifyIsType, &[])
    }

    pub(crate) fn get_slot(&mut self, index: i64) -> &mut Self {
        self.op(Opcode::GetSlot, &[fix(index)])
    }

    pub(crate) fn set_slot(&mut self, index: i64) -> &mut Self {
        self.op(Opcode::SetSlot, &[fix(index)])
    }

    pub(crate) fn drop_top(&mut self) -> &mut Self {
        self.op(Opcode::Drop, &[])
    }

    pub(crate) fn load_module(&mut self, slot: Value) -> &mut Self {
        self.op(Opcode::LoadModule, &[slot])
    }

    pub(crate) fn store_module(&mut self, slot: Value) -> &mut Self {
        self.op(Opcode::StoreModule, &[slot])
    }

    /// Assemble into a heap [`Code`] compiled against `module`.
    pub(crate) fn build(self, vm: &mut Interpreter, module: Value) -> Obj<Code> {
        let Interpreter { gc, roots, machine } = vm;
        let r_module = ObjRoot::new(roots, Obj::<Assoc>::from_value(module));

        // Operand values leave the host vector first, before anything else
        // allocates.
        let mut args = {
            let mut heap = Heap::new(gc, roots, machine);
            make_array_nofill(&mut heap, self.args.len() as u64).expect("args allocate")
        };
        args.components_mut().copy_from_slice(&self.args);
        let r_args = ObjRoot::new(roots, args);

        let mut insts = {
            let mut heap = Heap::new(gc, roots, machine);
            make_array_nofill(&mut heap, self.insts.len() as u64).expect("insts allocate")
        };
        for (slot, word) in insts.components_mut().iter_mut().zip(&self.insts) {
            *slot = fix(i64::from(*word));
        }
        let r_insts = ObjRoot::new(roots, insts);

        let upreg_map = match &self.upreg_map {
            None => None,
            Some(map) => {
                let mut array = {
                    let mut heap = Heap::new(gc, roots, machine);
                    make_array_nofill(&mut heap, map.len() as u64).expect("upreg map allocates")
                };
                for (slot, index) in array.components_mut().iter_mut().zip(map) {
                    *slot = fix(*index);
                }
                Some(array)
            }
        };
        let r_upreg_map = OptObjRoot::<Array>::new(roots, upreg_map);

        let span = {
            let mut heap = Heap::new(gc, roots, machine);
            make_tuple(&mut heap, 7).expect("span allocates")
        };
        let r_span = ObjRoot::<Tuple>::new(roots, span);

        let mut inst_spans = {
            let mut heap = Heap::new(gc, roots, machine);
            make_array_nofill(&mut heap, self.insts.len() as u64).expect("spans allocate")
        };
        inst_spans.components_mut().fill(r_span.value());
        let r_inst_spans = ObjRoot::new(roots, inst_spans);

        let mut heap = Heap::new(gc, roots, machine);
        crate::values::make_code(
            &mut heap,
            &r_module,
            self.num_params,
            self.num_regs,
            self.num_data,
            &r_upreg_map,
            &r_insts,
            &r_args,
            &r_span,
            &r_inst_spans,
        )
        .expect("code allocates")
    }
}

/// Fetch a string result's contents.
pub(crate) fn string_contents(value: Value) -> String {
    Obj::<Str>::from_value(value).to_string_lossy().into_owned()
}
