//! Structural pretty-printing of values, with cycle cut-off.
//!
//! A debug aid: renders the object graph with indentation, marks
//! back-references as `^up n`, and disassembles code objects inline.

use core::fmt::Write;

use katsu_asm::{Instruction, Opcode};
use katsu_types::{Obj, ObjectHeader, Tag, Value};

use crate::object::{
    Array, Assoc, Closure, Code, DataclassInstance, Foreign, Method, MultiMethod, Ref, Str,
    Tuple, Type, TypeKind, Vector,
};

/// Render a value into a multi-line description.
pub fn render(value: Value) -> String {
    let mut out = String::new();
    let mut seen = Vec::new();
    node(&mut out, &mut seen, value, 0, "", true);
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn node(
    out: &mut String,
    seen: &mut Vec<*mut ObjectHeader>,
    value: Value,
    depth: usize,
    prefix: &str,
    initial_indent: bool,
) {
    if initial_indent {
        indent(out, depth);
    }
    out.push_str(prefix);

    match value.tag() {
        Tag::Fixnum => {
            let _ = writeln!(out, "fixnum {}", value.expect_fixnum());
        }
        Tag::Float => {
            let _ = writeln!(out, "float {}", value.as_float32().unwrap());
        }
        Tag::Bool => {
            let _ = writeln!(out, "bool {}", value.as_bool().unwrap());
        }
        Tag::Null => {
            out.push_str("null\n");
        }
        Tag::Object => {
            let header = value.expect_object().as_ptr();
            if let Some(position) = seen.iter().position(|&p| p == header) {
                let _ = writeln!(out, "^up {}", seen.len() - position);
                return;
            }
            seen.push(header);
            object_node(out, seen, value, depth);
            seen.pop();
        }
    }
}

fn object_node(out: &mut String, seen: &mut Vec<*mut ObjectHeader>, value: Value, depth: usize) {
    let child =
        |out: &mut String, seen: &mut Vec<*mut ObjectHeader>, v: Value, prefix: &str| {
            node(out, seen, v, depth + 1, prefix, true);
        };

    if let Some(o) = Obj::<Ref>::try_from_value(value) {
        out.push_str("*ref:\n");
        child(out, seen, o.referent, "");
    } else if let Some(o) = Obj::<Tuple>::try_from_value(value) {
        let _ = writeln!(out, "*tuple: length={} (", o.length);
        for (i, &component) in o.components().iter().enumerate() {
            child(out, seen, component, &format!("{i} = "));
        }
        indent(out, depth);
        out.push_str(")\n");
    } else if let Some(o) = Obj::<Array>::try_from_value(value) {
        let _ = writeln!(out, "*array: length={}", o.length);
        for (i, &component) in o.components().iter().enumerate() {
            child(out, seen, component, &format!("{i} = "));
        }
    } else if let Some(o) = Obj::<Vector>::try_from_value(value) {
        let _ = writeln!(out, "*vector: length={} [", o.length);
        for (i, &component) in o.components().iter().enumerate() {
            child(out, seen, component, &format!("{i} = "));
        }
        indent(out, depth);
        out.push_str("]\n");
    } else if let Some(o) = Obj::<Assoc>::try_from_value(value) {
        let _ = writeln!(out, "*assoc: length={}", o.length);
        for i in 0..o.length {
            child(out, seen, o.key(i), "key = ");
            child(out, seen, Assoc::value(&o, i), "value = ");
        }
    } else if let Some(o) = Obj::<Str>::try_from_value(value) {
        let _ = writeln!(out, "*string: {:?}", o.to_string_lossy());
    } else if let Some(o) = Obj::<crate::object::ByteArray>::try_from_value(value) {
        let _ = writeln!(out, "*byte-array: length={}", o.length);
    } else if let Some(o) = Obj::<Code>::try_from_value(value) {
        out.push_str("*code\n");
        indent(out, depth + 1);
        let _ = writeln!(out, "num_params = {}", o.num_params);
        indent(out, depth + 1);
        let _ = writeln!(out, "num_regs = {}", o.num_regs);
        indent(out, depth + 1);
        let _ = writeln!(out, "num_data = {}", o.num_data);
        child(out, seen, o.upreg_map, "upreg_map = ");
        indent(out, depth + 1);
        out.push_str("bytecode:\n");
        disassemble(out, seen, o, depth + 1);
    } else if let Some(o) = Obj::<Closure>::try_from_value(value) {
        out.push_str("*closure\n");
        child(out, seen, o.code, "code = ");
        child(out, seen, o.upregs, "upregs = ");
    } else if let Some(o) = Obj::<Method>::try_from_value(value) {
        out.push_str("*method\n");
        child(out, seen, o.param_matchers, "param_matchers = ");
        child(out, seen, o.return_type, "return_type = ");
        child(out, seen, o.code, "code = ");
        indent(out, depth + 1);
        let _ = writeln!(out, "native = {}", o.native_handler.is_some());
        indent(out, depth + 1);
        let _ = writeln!(out, "intrinsic = {}", o.intrinsic_handler.is_some());
    } else if let Some(o) = Obj::<MultiMethod>::try_from_value(value) {
        out.push_str("*multimethod\n");
        child(out, seen, o.name, "name = ");
        child(out, seen, o.methods, "methods = ");
    } else if let Some(o) = Obj::<Type>::try_from_value(value) {
        out.push_str("*type\n");
        child(out, seen, o.name, "name = ");
        child(out, seen, o.bases, "bases = ");
        indent(out, depth + 1);
        let _ = writeln!(out, "sealed = {}", o.sealed);
        indent(out, depth + 1);
        let _ = writeln!(
            out,
            "kind = {}",
            match o.kind {
                TypeKind::Primitive => "primitive",
                TypeKind::Dataclass => "dataclass",
                TypeKind::Mixin => "mixin",
            }
        );
        child(out, seen, o.slots, "slots = ");
    } else if let Some(o) = Obj::<DataclassInstance>::try_from_value(value) {
        out.push_str("*instance\n");
        child(out, seen, o.ty, "type = ");
        for (i, &slot) in o.slots().iter().enumerate() {
            child(out, seen, slot, &format!("slot {i} = "));
        }
    } else if let Some(o) = Obj::<crate::object::CallSegment>::try_from_value(value) {
        let _ = writeln!(out, "*call-segment: length={}", o.length);
    } else if let Some(o) = Obj::<Foreign>::try_from_value(value) {
        let _ = writeln!(out, "*foreign: {:p}", o.value);
    } else {
        out.push_str("object: ???\n");
    }
}

fn disassemble(out: &mut String, seen: &mut Vec<*mut ObjectHeader>, code: Obj<Code>, depth: usize) {
    let insts = code.insts_array();
    let args = code.args_array();
    for (spot, word) in insts.components().iter().enumerate() {
        indent(out, depth);
        let Ok(inst) = Instruction::try_from(word.expect_fixnum() as u32) else {
            let _ = writeln!(out, "[{spot}]: ??? ({:#x})", word.expect_fixnum());
            continue;
        };
        let base = inst.args_base();
        let operand = |i: usize| args.components()[base + i];
        match inst.opcode() {
            Opcode::LoadReg
            | Opcode::StoreReg
            | Opcode::LoadRef
            | Opcode::StoreRef
            | Opcode::InitRef => {
                let _ = writeln!(
                    out,
                    "[{spot}]: {} @{}",
                    inst.opcode().mnemonic(),
                    operand(0).expect_fixnum()
                );
            }
            Opcode::GetSlot | Opcode::SetSlot => {
                let _ = writeln!(
                    out,
                    "[{spot}]: {} ${}",
                    inst.opcode().mnemonic(),
                    operand(0).expect_fixnum()
                );
            }
            Opcode::MakeTuple | Opcode::MakeArray | Opcode::MakeVector | Opcode::MakeInstance => {
                let _ = writeln!(
                    out,
                    "[{spot}]: {} #{}",
                    inst.opcode().mnemonic(),
                    operand(0).expect_fixnum()
                );
            }
            Opcode::Drop | Opcode::VerifyIsType => {
                let _ = writeln!(out, "[{spot}]: {}", inst.opcode().mnemonic());
            }
            Opcode::LoadValue | Opcode::LoadModule | Opcode::StoreModule
            | Opcode::MakeClosure => {
                let _ = write!(out, "[{spot}]: {}: ", inst.opcode().mnemonic());
                node(out, seen, operand(0), depth + 1, "", false);
            }
            Opcode::Invoke | Opcode::InvokeTail => {
                let _ = write!(
                    out,
                    "[{spot}]: {} #{} ",
                    inst.opcode().mnemonic(),
                    operand(1).expect_fixnum()
                );
                let callee = operand(0);
                match Obj::<MultiMethod>::try_from_value(callee) {
                    Some(mm) => node(out, seen, mm.name, depth + 1, "", false),
                    None => node(out, seen, callee, depth + 1, "", false),
                }
            }
        }
    }
}
