//! Frame unwinding and delimited continuations.
//!
//! A continuation is captured by bulk-copying the frames from the
//! innermost marked frame through the current top into a heap
//! [`CallSegment`] (caller pointers nulled in the copies), and resumed by
//! copying those bytes back on top of the stack and re-linking the caller
//! chain. Frames themselves never move during collection, so the copies
//! are byte-exact either way; only the values inside them are traced.

use core::ptr;

use katsu_asm::ConditionTag;
use katsu_types::{Obj, Value};

use crate::error::{VmError, VmResult};
use crate::gc::roots::ValueRoot;
use crate::gc::Heap;
use crate::interpreter::frame::Frame;
use crate::interpreter::{Interpreter, OpenVm};
use crate::object::CallSegment;
use crate::values::make_call_segment;

impl Interpreter {
    /// Pop the current frame. On the non-tail path the popped frame's
    /// top-of-stack value is the call's result and is pushed onto the
    /// caller; on the tail path the frame simply disappears (its callee
    /// will produce the caller's result).
    pub(crate) fn unwind_frame(&mut self, tail_call: bool) {
        let frame = self.machine.stack.current();
        assert!(!frame.is_null(), "unwinding with no live frame");
        // Safety: the current frame is live; its caller (when non-null)
        // is the live frame below it.
        unsafe {
            let caller = (*frame).caller;
            if tail_call {
                self.machine.stack.set_current(caller);
            } else {
                assert!(!caller.is_null(), "the bottom frame never unwinds");
                let result = (*frame).pop();
                self.machine.stack.set_current(caller);
                (*caller).push(result);
            }
        }
    }

    /// Copy a segment's frames on top of the current frame, re-link the
    /// caller chain, make the new top current, and push `arg` as the value
    /// the resumed frame was waiting for.
    pub(crate) fn splice_segment(
        &mut self,
        segment: Obj<CallSegment>,
        arg: Value,
    ) -> VmResult<()> {
        let length = segment.length as usize;
        let start = self.machine.stack.alloc_frames(length)?;

        let old_top = self.machine.stack.current();
        // Safety: `start` spans `length` reserved bytes contiguous with
        // the current top; the segment holds whole frames.
        unsafe {
            (*old_top).inst_spot += 1;
            ptr::copy_nonoverlapping(
                CallSegment::frames_ptr(segment.as_ptr()).cast_const(),
                start,
                length,
            );

            let past_end = start.add(length).cast::<Frame>();
            let mut prev = old_top;
            let mut cur = start.cast::<Frame>();
            while cur < past_end {
                (*cur).caller = prev;
                prev = cur;
                cur = (*cur).next();
            }
            debug_assert_eq!(cur, past_end, "segment splice covered partial frames");

            self.machine.stack.set_current(prev);
            (*prev).push(arg);
        }
        Ok(())
    }
}

/// `callable call/marked: marker` — call with a frame whose marker
/// delimits later continuation capture.
pub(crate) fn intrinsic_call_marked(
    open: &mut OpenVm<'_>,
    tail_call: bool,
    nargs: i64,
    args: &[Value],
) -> VmResult<()> {
    debug_assert_eq!(nargs, 2);
    let callable = args[0];
    let marker = args[1];
    open.vm.call_value(callable, tail_call, &[], marker)
}

/// `callable call/dc: marker` — reify the stack from the innermost frame
/// carrying `marker` through the top into a [`CallSegment`], unwind to
/// below the marked frame, and call `callable` with the segment.
pub(crate) fn intrinsic_call_dc(
    open: &mut OpenVm<'_>,
    tail_call: bool,
    nargs: i64,
    args: &[Value],
) -> VmResult<()> {
    debug_assert_eq!(nargs, 2);
    assert!(!tail_call, "call/dc: is never compiled in tail position");
    let callable = args[0];
    let marker = args[1];
    let vm = &mut *open.vm;

    // Innermost frame carrying the marker, top towards base.
    let mut marked = vm.machine.stack.current();
    // Safety: the caller chain walks live frames down to the base.
    unsafe {
        while !marked.is_null() && (*marked).marker != marker {
            marked = (*marked).caller;
        }
    }
    if marked.is_null() {
        return Err(VmError::condition(
            ConditionTag::MarkerNotFound,
            "did not find marker in call stack",
        ));
    }
    // Safety: `marked` is a live frame.
    let resume_to = unsafe { (*marked).caller };
    if resume_to.is_null() {
        return Err(VmError::condition(
            ConditionTag::InvalidArgument,
            "cannot capture a segment delimited by the toplevel frame",
        ));
    }

    // Advance the top frame first so the captured copy resumes after this
    // invocation when the segment is later called.
    let top = vm.machine.stack.current();
    let total_length;
    // Safety: the top frame is live.
    unsafe {
        (*top).inst_spot += 1;
        total_length = (*top).next() as usize - marked as usize;
    }

    let (callable, segment) = {
        let Interpreter { gc, roots, machine } = &mut *vm;
        let r_callable = ValueRoot::new(roots, callable);
        let mut heap = Heap::new(gc, roots, machine);
        // Safety: `marked` through the top are whole live frames spanning
        // `total_length` bytes.
        let segment = unsafe { make_call_segment(&mut heap, marked, total_length)? };
        (r_callable.get(), segment.value())
    };

    vm.machine.stack.set_current(resume_to);
    // Rewind the new top so the callable's invocation below re-advances
    // it; the result of `callable` then lands as the result of the
    // original delimiting call.
    // Safety: `resume_to` is a live frame.
    unsafe {
        (*resume_to).inst_spot -= 1;
    }
    vm.call_value(callable, false, &[segment], Value::NULL)
}

/// `_ get-call-stack` — reify the entire call stack as a [`CallSegment`].
pub(crate) fn intrinsic_get_call_stack(
    open: &mut OpenVm<'_>,
    _tail_call: bool,
    nargs: i64,
    _args: &[Value],
) -> VmResult<()> {
    debug_assert_eq!(nargs, 1);
    let vm = &mut *open.vm;

    let top = vm.machine.stack.current();
    let bottom = vm.machine.stack.base_ptr();
    let total_length;
    // Safety: the top frame is live.
    unsafe {
        (*top).inst_spot += 1;
        total_length = (*top).next() as usize - bottom as usize;
    }

    let segment = {
        let Interpreter { gc, roots, machine } = vm;
        let mut heap = Heap::new(gc, roots, machine);
        // Safety: the whole stack is whole live frames.
        unsafe { make_call_segment(&mut heap, bottom, total_length)? }
    };

    // Frames never move; `top` is still the current frame.
    // Safety: as above.
    unsafe { (*top).push(segment.value()) };
    Ok(())
}
