//! Callable invocation and multimethod dispatch.
//!
//! `invoke` is the single entry point for calling anything: multimethods
//! dispatch to their most specific matching method; closures and raw code
//! objects get a fresh frame; call segments splice back onto the stack;
//! everything else returns itself.
//!
//! Instruction-position discipline: `invoke` runs with the current frame's
//! `inst_spot` still at the invoking instruction, and each terminal path
//! advances it exactly once (for tail calls, before unwinding). A path
//! that signals a condition does so before mutating the machine, so that
//! condition recovery can complete the invocation by running the handler
//! in its place.

use core::cmp::Ordering;

use itertools::Itertools;

use katsu_asm::ConditionTag;
use katsu_types::{Obj, Value};

use crate::error::{VmError, VmResult};
use crate::interpreter::{Interpreter, OpenVm};
use crate::object::{
    Array, CallSegment, Closure, Code, Method, MultiMethod, NativeHandler, Ref, Type, Vector,
};
use crate::types::{linearization_contains, type_of};

/// Parameter matcher shapes; see [`Method::param_matchers`].
enum Matcher {
    /// Null: matches any value.
    Any,
    /// Matches values whose type's linearization contains this type.
    Type(Obj<Type>),
    /// Matches values equal to the referent.
    Value(Obj<Ref>),
}

impl Matcher {
    fn classify(matcher: Value) -> Matcher {
        if matcher.is_null() {
            Matcher::Any
        } else if let Some(ty) = Obj::<Type>::try_from_value(matcher) {
            Matcher::Type(ty)
        } else if let Some(r) = Obj::<Ref>::try_from_value(matcher) {
            Matcher::Value(r)
        } else {
            unreachable!("parameter matcher must be null, a type or a ref")
        }
    }
}

impl Interpreter {
    /// Invoke `callable` with `args` (a host-side copy of the popped
    /// argument values).
    ///
    /// Tail calls unwind the invoking frame before the callee takes over;
    /// the bottom frame never unwinds this way, so a tail call from it
    /// degrades to a plain call (the toplevel result has to land
    /// somewhere).
    pub(crate) fn invoke(
        &mut self,
        callable: Value,
        tail_call: bool,
        args: &[Value],
    ) -> VmResult<()> {
        let tail_call = tail_call && !self.machine.stack.current_is_base();

        let Some(mm) = Obj::<MultiMethod>::try_from_value(callable) else {
            return self.call_value(callable, tail_call, args, Value::NULL);
        };

        let method = self.select_method(mm, args)?;
        if let Some(handler) = method.intrinsic_handler {
            let mut open = OpenVm { vm: self };
            return handler(&mut open, tail_call, args.len() as i64, args);
        }
        if let Some(handler) = method.native_handler {
            return self.invoke_native(handler, tail_call, args);
        }
        // Bytecode body; methods have no captured registers.
        let code = method.code;
        debug_assert!(Obj::<Code>::from_value(code).upreg_map.is_null());
        self.enter_code(code, None, tail_call, args, Value::NULL)
    }

    /// Call a non-multimethod value: closure, raw code, call segment, or a
    /// self-returning plain value. `marker` lands in the callee frame for
    /// continuation delimiting.
    pub(crate) fn call_value(
        &mut self,
        callable: Value,
        tail_call: bool,
        args: &[Value],
        marker: Value,
    ) -> VmResult<()> {
        let tail_call = tail_call && !self.machine.stack.current_is_base();

        if let Some(closure) = Obj::<Closure>::try_from_value(callable) {
            let code = Obj::<Code>::from_value(closure.code);
            check_arity(code.num_params, args.len(), "closure")?;
            self.enter_code(closure.code, Some(closure), tail_call, args, marker)
        } else if let Some(segment) = Obj::<CallSegment>::try_from_value(callable) {
            if args.len() != 1 {
                return Err(VmError::condition(
                    ConditionTag::ArgumentCountMismatch,
                    "called a call segment with wrong number of arguments (should be 1)",
                ));
            }
            assert!(!tail_call, "tail-calling a call segment is not supported");
            self.splice_segment(segment, args[0])
        } else if let Some(code) = Obj::<Code>::try_from_value(callable) {
            if !code.upreg_map.is_null() {
                return Err(VmError::condition(
                    ConditionTag::RawClosureCall,
                    "cannot call a raw code object which requires captured registers",
                ));
            }
            check_arity(code.num_params, args.len(), "raw code object")?;
            self.enter_code(callable, None, tail_call, args, marker)
        } else {
            // Anything else returns itself.
            if tail_call {
                let frame = self.machine.stack.current();
                // Safety: a live frame is invoking.
                unsafe { (*frame).inst_spot += 1 };
                self.unwind_frame(true);
            }
            let frame = self.machine.stack.current();
            // Safety: the (possibly new) top frame is live.
            unsafe {
                if !tail_call {
                    (*frame).inst_spot += 1;
                }
                (*frame).push(callable);
            }
            Ok(())
        }
    }

    fn invoke_native(
        &mut self,
        handler: NativeHandler,
        tail_call: bool,
        args: &[Value],
    ) -> VmResult<()> {
        if tail_call {
            let frame = self.machine.stack.current();
            // Safety: a live frame is invoking.
            unsafe { (*frame).inst_spot += 1 };
            self.unwind_frame(true);
        }
        let result = handler(self, args.len() as i64, args)?;
        let frame = self.machine.stack.current();
        // Safety: the top frame is live; for tail calls the caller already
        // sits past its own invoke.
        unsafe {
            if !tail_call {
                (*frame).inst_spot += 1;
            }
            (*frame).push(result);
        }
        Ok(())
    }

    /// Create and enter a frame for `code` (with `closure`'s captured
    /// registers loaded, when present).
    fn enter_code(
        &mut self,
        code_value: Value,
        closure: Option<Obj<Closure>>,
        tail_call: bool,
        args: &[Value],
        marker: Value,
    ) -> VmResult<()> {
        if tail_call {
            let frame = self.machine.stack.current();
            // Safety: a live frame is invoking.
            unsafe { (*frame).inst_spot += 1 };
            self.unwind_frame(true);
        }

        let code = Obj::<Code>::from_value(code_value);
        let frame = self.machine.stack.alloc_frame(
            code.num_regs,
            code.num_data,
            code_value,
            code.module,
            marker,
        )?;

        // Safety: freshly allocated frame in the stack region; no
        // collection can happen before the registers are initialized.
        unsafe {
            let regs = (*frame).regs_mut();
            regs.fill(Value::NULL);
            // A zero-argument call to a one-parameter callable leaves the
            // default `it` parameter null, which the fill above did.
            regs[..args.len()].copy_from_slice(args);

            if let Some(closure) = closure {
                let upregs = Obj::<Array>::from_value(closure.upregs);
                let upreg_map = Obj::<Array>::from_value(code.upreg_map);
                debug_assert_eq!(upregs.length, upreg_map.length);
                for (i, dest) in upreg_map.components().iter().enumerate() {
                    let dest = dest.expect_fixnum() as usize;
                    regs[dest] = upregs.components()[i];
                }
            }
        }

        if !tail_call {
            let caller = self.machine.stack.current();
            // Safety: a live frame is invoking.
            unsafe { (*caller).inst_spot += 1 };
        }
        self.machine.stack.set_current(frame);
        Ok(())
    }

    /// Select the unique most specific method of `mm` matching `args`.
    fn select_method(&self, mm: Obj<MultiMethod>, args: &[Value]) -> VmResult<Obj<Method>> {
        debug_assert_eq!(mm.num_params as usize, args.len());

        let methods = Obj::<Vector>::from_value(mm.methods);
        let mut matching: Vec<Obj<Method>> = Vec::new();
        for &method in methods.components() {
            let method = Obj::<Method>::from_value(method);
            if self.method_matches(method, args) {
                matching.push(method);
            }
        }

        match matching.len() {
            0 => Err(VmError::condition(
                ConditionTag::NoMatchingMethod,
                "multimethod has no methods matching the given arguments",
            )),
            1 => Ok(matching[0]),
            _ => {
                // The winner must strictly dominate every other match
                // under the product order of per-parameter specificity.
                let winner = matching
                    .iter()
                    .enumerate()
                    .filter(|(i, method)| {
                        matching
                            .iter()
                            .enumerate()
                            .all(|(j, other)| *i == j || strictly_more_specific(**method, *other))
                    })
                    .map(|(_, method)| *method)
                    .at_most_one();
                match winner {
                    Ok(Some(method)) => Ok(method),
                    Ok(None) => Err(VmError::condition(
                        ConditionTag::AmbiguousMethodResolution,
                        "multimethod has multiple best methods matching the given arguments",
                    )),
                    Err(_) => unreachable!("strict dominance is antisymmetric"),
                }
            }
        }
    }

    fn method_matches(&self, method: Obj<Method>, args: &[Value]) -> bool {
        let matchers = Obj::<Array>::from_value(method.param_matchers);
        debug_assert_eq!(matchers.length as usize, args.len());
        matchers
            .components()
            .iter()
            .zip(args)
            .all(|(&matcher, &arg)| match Matcher::classify(matcher) {
                Matcher::Any => true,
                Matcher::Type(ty) => {
                    linearization_contains(Obj::from_value(type_of(self, arg)), ty)
                }
                Matcher::Value(r) => arg == r.referent,
            })
    }
}

/// Arity check shared by closures and raw code objects: a zero-argument
/// call to a one-parameter callable is allowed (the default `it`
/// parameter), everything else must match exactly.
fn check_arity(num_params: u32, nargs: usize, what: &str) -> VmResult<()> {
    let ok = if nargs == 0 {
        num_params == 1
    } else {
        num_params as usize == nargs
    };
    if ok {
        Ok(())
    } else {
        Err(VmError::condition(
            ConditionTag::ArgumentCountMismatch,
            format!("called a {what} with wrong number of arguments"),
        ))
    }
}

/// Specificity of matcher `a` against matcher `b` for one parameter:
/// value matchers beat type matchers beat any-matchers; type matchers
/// order by subtyping, unrelated types are incomparable.
fn matcher_specificity(a: Value, b: Value) -> Option<Ordering> {
    use crate::types::is_subtype;
    match (Matcher::classify(a), Matcher::classify(b)) {
        (Matcher::Value(_), Matcher::Value(_)) => Some(Ordering::Equal),
        (Matcher::Value(_), _) => Some(Ordering::Greater),
        (_, Matcher::Value(_)) => Some(Ordering::Less),
        (Matcher::Type(a), Matcher::Type(b)) => {
            if a == b {
                Some(Ordering::Equal)
            } else if is_subtype(a, b) {
                Some(Ordering::Greater)
            } else if is_subtype(b, a) {
                Some(Ordering::Less)
            } else {
                None
            }
        }
        (Matcher::Type(_), Matcher::Any) => Some(Ordering::Greater),
        (Matcher::Any, Matcher::Type(_)) => Some(Ordering::Less),
        (Matcher::Any, Matcher::Any) => Some(Ordering::Equal),
    }
}

/// Whether `a` is strictly more specific than `b`: at least as specific in
/// every parameter and strictly more specific in one.
fn strictly_more_specific(a: Obj<Method>, b: Obj<Method>) -> bool {
    let matchers_a = Obj::<Array>::from_value(a.param_matchers);
    let matchers_b = Obj::<Array>::from_value(b.param_matchers);
    debug_assert_eq!(matchers_a.length, matchers_b.length);

    let mut any_strict = false;
    for (&ma, &mb) in matchers_a.components().iter().zip(matchers_b.components()) {
        match matcher_specificity(ma, mb) {
            Some(Ordering::Greater) => any_strict = true,
            Some(Ordering::Equal) => {}
            Some(Ordering::Less) | None => return false,
        }
    }
    any_strict
}
