//! The interpreter loop.
//!
//! `eval_toplevel` drives `step` until the single bottom frame runs out of
//! instructions; `step` decodes one instruction word and performs its
//! effect. Opcode handlers that allocate root every retained value first
//! (arguments still on the data stack count: the stack walk covers them),
//! and re-derive frame and operand pointers after any allocation, since a
//! collection rewrites values in place.

use core::ptr;

use katsu_asm::{ConditionTag, Instruction, Opcode};
use katsu_types::{Obj, Value};

use crate::error::{Condition, VmError, VmResult};
use crate::gc::roots::{ObjRoot, ValueRoot};
use crate::gc::Heap;
use crate::interpreter::frame::Frame;
use crate::interpreter::Interpreter;
use crate::object::{Array, Code, DataclassInstance, Ref, Type, TypeKind};
use crate::state::ExecuteState;
use crate::values::{make_array_nofill, make_instance_nofill, make_ref, make_tuple_nofill,
    make_vector_with};

/// The operand at `base + index` in the current frame's argument array.
///
/// # Safety
///
/// `frame` must be a live frame. The result is stale after any allocation;
/// re-read it (or root it) across GC points.
unsafe fn operand(frame: *mut Frame, base: usize, index: usize) -> Value {
    // Safety: per the function contract.
    let code = unsafe { (*frame).code_obj() };
    code.args_array().components()[base + index]
}

/// Advance past the instruction being executed.
///
/// # Safety
///
/// `frame` must be a live frame.
unsafe fn advance(frame: *mut Frame) {
    unsafe { (*frame).inst_spot += 1 };
}

impl Interpreter {
    /// Evaluate a toplevel code object to a value.
    ///
    /// Requires an idle machine. On a fatal error (a condition with no
    /// handler installed, or a failure inside the handler itself) the
    /// machine is reset to idle and the error returned.
    pub fn eval_toplevel(&mut self, code: Obj<Code>) -> VmResult<Value> {
        assert!(
            self.machine.stack.is_idle(),
            "eval_toplevel requires an idle machine"
        );

        let frame = self.machine.stack.alloc_frame(
            code.num_regs,
            code.num_data,
            code.value(),
            code.module,
            Value::NULL,
        )?;
        // Safety: freshly allocated frame; registers initialized before
        // anything can collect.
        unsafe { (*frame).regs_mut().fill(Value::NULL) };
        self.machine.stack.set_current(frame);

        loop {
            match self.step() {
                Ok(ExecuteState::Proceed) => {}
                Ok(ExecuteState::Finished(result)) => {
                    self.machine.stack.set_current(ptr::null_mut());
                    return Ok(result);
                }
                Err(VmError::Condition(condition))
                    if !self.machine.condition_handler.is_null() =>
                {
                    if let Err(fatal) = self.recover_with_handler(condition) {
                        self.machine.stack.set_current(ptr::null_mut());
                        return Err(fatal);
                    }
                }
                Err(fatal) => {
                    self.machine.stack.set_current(ptr::null_mut());
                    return Err(fatal);
                }
            }
        }
    }

    /// Deliver a condition to the installed handler, invoked on the stack
    /// where the fault occurred. The handler's return value completes the
    /// faulted invocation (the recovery invoke advances the frame past the
    /// faulted instruction and pushes the handler's result in its place).
    fn recover_with_handler(&mut self, condition: Condition) -> VmResult<()> {
        let handler = self.machine.condition_handler;
        let (tag, message) = {
            let Interpreter { gc, roots, machine } = &mut *self;
            let mut heap = Heap::new(gc, roots, machine);
            let tag = crate::values::make_string(&mut heap, condition.tag.as_str())?;
            let r_tag = ObjRoot::new(heap.roots(), tag);
            let message = crate::values::make_string(&mut heap, &condition.message)?;
            (r_tag.value(), message.value())
        };
        // No allocation between here and the invoke; the strings stay put.
        self.invoke(handler, false, &[tag, message])
    }

    /// Execute one instruction (or unwind one completed frame).
    pub(crate) fn step(&mut self) -> VmResult<ExecuteState> {
        let frame = self.machine.stack.current();
        assert!(!frame.is_null(), "stepping an idle machine");

        // Safety: the current frame is live throughout; re-derived after
        // every allocation point below.
        let (opcode, base) = unsafe {
            let code = (*frame).code_obj();
            let num_insts = code.insts_array().length;
            let spot = u64::from((*frame).inst_spot);
            if spot >= num_insts {
                assert_eq!(spot, num_insts, "ran past the instruction stream");
                if self.machine.stack.current_is_base() {
                    assert!(
                        (*frame).data_depth > 0,
                        "toplevel finished without a result"
                    );
                    return Ok(ExecuteState::Finished((*frame).data()[0]));
                }
                self.unwind_frame(false);
                return Ok(ExecuteState::Proceed);
            }

            let word = code.insts_array().components()[spot as usize].expect_fixnum();
            let inst = Instruction::try_from(word as u32)
                .expect("malformed instruction word in code object");
            tracing::trace!(spot, %inst, "step");
            (inst.opcode(), inst.args_base())
        };

        match opcode {
            Opcode::LoadReg => unsafe {
                let index = operand(frame, base, 0).expect_fixnum() as usize;
                let value = (*frame).regs()[index];
                (*frame).push(value);
                advance(frame);
            },
            Opcode::StoreReg => unsafe {
                let index = operand(frame, base, 0).expect_fixnum() as usize;
                let value = (*frame).pop();
                (*frame).regs_mut()[index] = value;
                advance(frame);
            },
            Opcode::LoadRef => unsafe {
                let index = operand(frame, base, 0).expect_fixnum() as usize;
                let cell = Obj::<Ref>::from_value((*frame).regs()[index]);
                (*frame).push(cell.referent);
                advance(frame);
            },
            Opcode::StoreRef => unsafe {
                let index = operand(frame, base, 0).expect_fixnum() as usize;
                let mut cell = Obj::<Ref>::from_value((*frame).regs()[index]);
                cell.referent = (*frame).pop();
                advance(frame);
            },
            Opcode::LoadValue => unsafe {
                let value = operand(frame, base, 0);
                (*frame).push(value);
                advance(frame);
            },
            Opcode::InitRef => unsafe {
                let index = operand(frame, base, 0).expect_fixnum() as usize;
                let value = (*frame).pop();
                let cell = {
                    let Interpreter { gc, roots, machine } = &mut *self;
                    let r_value = ValueRoot::new(roots, value);
                    let mut heap = Heap::new(gc, roots, machine);
                    make_ref(&mut heap, &r_value)?
                };
                let frame = self.machine.stack.current();
                (*frame).regs_mut()[index] = cell.value();
                advance(frame);
            },
            Opcode::LoadModule => unsafe {
                let slot = Obj::<Ref>::from_value(operand(frame, base, 0));
                (*frame).push(slot.referent);
                advance(frame);
            },
            Opcode::StoreModule => unsafe {
                let mut slot = Obj::<Ref>::from_value(operand(frame, base, 0));
                slot.referent = (*frame).pop();
                advance(frame);
            },
            Opcode::Invoke | Opcode::InvokeTail => unsafe {
                let callable = operand(frame, base, 0);
                let count = operand(frame, base, 1).expect_fixnum() as usize;
                let args = (*frame).pop_many(count);
                self.invoke(callable, opcode == Opcode::InvokeTail, &args)?;
            },
            Opcode::Drop => unsafe {
                let _ = (*frame).pop();
                advance(frame);
            },
            Opcode::MakeTuple => unsafe {
                let count = operand(frame, base, 0).expect_fixnum() as usize;
                // Allocate first: the components still on the data stack
                // are roots until they are moved into the tuple.
                let mut tuple = {
                    let Interpreter { gc, roots, machine } = &mut *self;
                    let mut heap = Heap::new(gc, roots, machine);
                    make_tuple_nofill(&mut heap, count as u64)?
                };
                let frame = self.machine.stack.current();
                let depth = (*frame).data_depth as usize;
                tuple
                    .components_mut()
                    .copy_from_slice(&(*frame).data()[depth - count..]);
                (*frame).data_depth -= count as u32;
                (*frame).data_mut()[depth - count..depth].fill(Value::NULL);
                (*frame).push(tuple.value());
                advance(frame);
            },
            Opcode::MakeArray => unsafe {
                let count = operand(frame, base, 0).expect_fixnum() as usize;
                let mut array = {
                    let Interpreter { gc, roots, machine } = &mut *self;
                    let mut heap = Heap::new(gc, roots, machine);
                    make_array_nofill(&mut heap, count as u64)?
                };
                let frame = self.machine.stack.current();
                let depth = (*frame).data_depth as usize;
                array
                    .components_mut()
                    .copy_from_slice(&(*frame).data()[depth - count..]);
                (*frame).data_depth -= count as u32;
                (*frame).data_mut()[depth - count..depth].fill(Value::NULL);
                (*frame).push(array.value());
                advance(frame);
            },
            Opcode::MakeVector => unsafe {
                let count = operand(frame, base, 0).expect_fixnum() as usize;
                let Interpreter { gc, roots, machine } = self;
                let mut backing = {
                    let mut heap = Heap::new(gc, roots, machine);
                    make_array_nofill(&mut heap, count as u64)?
                };
                let frame = machine.stack.current();
                let depth = (*frame).data_depth as usize;
                backing
                    .components_mut()
                    .copy_from_slice(&(*frame).data()[depth - count..]);
                (*frame).data_depth -= count as u32;
                (*frame).data_mut()[depth - count..depth].fill(Value::NULL);
                let vector = {
                    let r_backing = ObjRoot::new(roots, backing);
                    let mut heap = Heap::new(gc, roots, machine);
                    make_vector_with(&mut heap, count as u64, &r_backing)?
                };
                let frame = machine.stack.current();
                (*frame).push(vector.value());
                advance(frame);
            },
            Opcode::MakeClosure => unsafe {
                let template = operand(frame, base, 0);
                let count =
                    Obj::<Array>::from_value(Obj::<Code>::from_value(template).upreg_map).length;
                let Interpreter { gc, roots, machine } = self;
                let r_template = ValueRoot::new(roots, template);
                let mut upregs = {
                    let mut heap = Heap::new(gc, roots, machine);
                    make_array_nofill(&mut heap, count)?
                };
                let frame = machine.stack.current();
                let depth = (*frame).data_depth as usize;
                let count = count as usize;
                upregs
                    .components_mut()
                    .copy_from_slice(&(*frame).data()[depth - count..]);
                (*frame).data_depth -= count as u32;
                (*frame).data_mut()[depth - count..depth].fill(Value::NULL);
                let closure = {
                    let r_upregs = ObjRoot::new(roots, upregs);
                    let r_code =
                        ObjRoot::new(roots, Obj::<Code>::from_value(r_template.get()));
                    let mut heap = Heap::new(gc, roots, machine);
                    crate::values::make_closure(&mut heap, &r_code, &r_upregs)?
                };
                let frame = machine.stack.current();
                (*frame).push(closure.value());
                advance(frame);
            },
            Opcode::MakeInstance => unsafe {
                let count = operand(frame, base, 0).expect_fixnum() as usize;
                let ty = (*frame).pop();
                let ty = Obj::<Type>::try_from_value(ty).ok_or_else(|| {
                    VmError::condition(
                        ConditionTag::InvalidArgument,
                        "instance construction requires a type",
                    )
                })?;
                assert_eq!(ty.kind, TypeKind::Dataclass, "instances require a dataclass type");
                assert_eq!(
                    ty.num_total_slots as usize, count,
                    "slot count must match the type"
                );
                let Interpreter { gc, roots, machine } = self;
                let mut instance = {
                    let r_type = ObjRoot::new(roots, ty);
                    let mut heap = Heap::new(gc, roots, machine);
                    make_instance_nofill(&mut heap, &r_type)?
                };
                let frame = machine.stack.current();
                let depth = (*frame).data_depth as usize;
                instance
                    .slots_mut()
                    .copy_from_slice(&(*frame).data()[depth - count..]);
                (*frame).data_depth -= count as u32;
                (*frame).data_mut()[depth - count..depth].fill(Value::NULL);
                (*frame).push(instance.value());
                advance(frame);
            },
            Opcode::VerifyIsType => unsafe {
                let top = (*frame).peek();
                if Obj::<Type>::try_from_value(top).is_none() {
                    return Err(VmError::condition(
                        ConditionTag::InvalidArgument,
                        "expected a type",
                    ));
                }
                advance(frame);
            },
            Opcode::GetSlot => unsafe {
                let index = operand(frame, base, 0).expect_fixnum() as usize;
                let instance = Obj::<DataclassInstance>::from_value((*frame).pop());
                (*frame).push(instance.slots()[index]);
                advance(frame);
            },
            Opcode::SetSlot => unsafe {
                let index = operand(frame, base, 0).expect_fixnum() as usize;
                let value = (*frame).pop();
                let mut instance = Obj::<DataclassInstance>::from_value((*frame).pop());
                instance.slots_mut()[index] = value;
                advance(frame);
            },
        }

        Ok(ExecuteState::Proceed)
    }
}
