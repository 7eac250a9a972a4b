//! The bytecode machine.
//!
//! [`Interpreter`] owns the collector, the auxiliary root list and the
//! machine state the collector treats as roots: the call stack, the
//! builtin-value table, the module table and the condition handler slot.
//! No global state — one machine, one heap, one stack region.

use core::fmt;

use katsu_types::Value;

use crate::error::VmResult;
use crate::gc::roots::RootList;
use crate::gc::{Gc, Heap, RootProvider};

mod constructors;
mod dispatch;
mod executor;
pub(crate) mod flow;
pub mod frame;

use self::frame::{CallStack, Frame};

/// Well-known values the machine needs constant-time access to. All of
/// them live in the heap and are collector roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(usize)]
#[allow(missing_docs)]
pub enum BuiltinId {
    /// The null singleton binding (`null`).
    Null = 0,
    /// The true singleton binding (`t`).
    True,
    /// The false singleton binding (`f`).
    False,
    Fixnum,
    Float,
    Bool,
    NullType,
    Ref,
    Tuple,
    Array,
    Vector,
    Assoc,
    String,
    ByteArray,
    Code,
    Closure,
    Method,
    MultiMethod,
    Type,
    CallSegment,
    Foreign,
}

impl BuiltinId {
    /// Number of builtin slots.
    pub const COUNT: usize = 21;
}

/// GC-visible machine state: everything the collector must treat as roots
/// beyond the scoped handles.
pub(crate) struct MachineState {
    /// The call-stack region and current-frame pointer.
    pub stack: CallStack,
    /// Builtin values, indexed by [`BuiltinId`].
    pub builtins: [Value; BuiltinId::COUNT],
    /// [`crate::object::Assoc`] mapping module-name strings to module
    /// assocs; null until bootstrapped.
    pub modules: Value,
    /// User-installed condition handler; null when absent.
    pub condition_handler: Value,
}

impl RootProvider for MachineState {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.stack.visit_frame_values(visitor);
        for builtin in &mut self.builtins {
            visitor(builtin);
        }
        visitor(&mut self.modules);
        visitor(&mut self.condition_handler);
    }
}

/// Construction parameters for a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmParams {
    /// Bytes per heap semispace.
    pub heap_size: usize,
    /// Bytes of call-stack region.
    pub call_stack_size: usize,
}

impl Default for VmParams {
    fn default() -> Self {
        VmParams {
            heap_size: crate::consts::DEFAULT_HEAP_SIZE,
            call_stack_size: crate::consts::DEFAULT_CALL_STACK_SIZE,
        }
    }
}

/// The virtual machine: collector, roots, call stack, builtins, modules.
pub struct Interpreter {
    pub(crate) gc: Gc,
    pub(crate) roots: RootList,
    pub(crate) machine: MachineState,
}

impl Interpreter {
    /// The builtin value registered under `id`.
    pub fn builtin(&self, id: BuiltinId) -> Value {
        self.machine.builtins[id as usize]
    }

    /// Register a builtin value.
    pub fn register_builtin(&mut self, id: BuiltinId, value: Value) {
        self.machine.builtins[id as usize] = value;
    }

    /// The table of loaded modules (an assoc of name to module assoc).
    pub fn modules(&self) -> Value {
        self.machine.modules
    }

    /// Replace the table of loaded modules.
    pub fn set_modules(&mut self, modules: Value) {
        self.machine.modules = modules;
    }

    /// The installed condition handler, or null.
    pub fn condition_handler(&self) -> Value {
        self.machine.condition_handler
    }

    /// Install (or with null, clear) the condition handler.
    pub fn set_condition_handler(&mut self, handler: Value) {
        self.machine.condition_handler = handler;
    }

    /// Bytes currently in use in the heap.
    pub fn heap_used(&self) -> usize {
        self.gc.used()
    }

    /// Collect on every allocation from now on. Slow; for tests hunting
    /// missing roots.
    pub fn set_gc_stress(&mut self, stress: bool) {
        self.gc.set_stress(stress);
    }

    /// Split the machine into an allocation context. Scoped handles built
    /// from [`Heap::roots`] stay valid after the context is dropped.
    pub fn heap(&mut self) -> Heap<'_> {
        let Interpreter {
            gc,
            roots,
            machine,
        } = self;
        Heap::new(gc, roots, machine)
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("gc", &self.gc)
            .field("roots", &self.roots.len())
            .field("idle", &self.machine.stack.is_idle())
            .finish_non_exhaustive()
    }
}

/// The restricted machine surface handed to intrinsic handlers.
///
/// Exposes exactly the frame machinery an intrinsic needs to reshape the
/// stack — plus the machine itself, for allocation. An intrinsic is
/// responsible for leaving the top frame's instruction position at the
/// next instruction to execute.
pub struct OpenVm<'a> {
    /// The machine.
    pub vm: &'a mut Interpreter,
}

impl OpenVm<'_> {
    /// The frame at the base of the call stack.
    pub fn bottom_frame(&self) -> *mut Frame {
        self.vm.machine.stack.base_ptr()
    }

    /// The current top-of-stack frame (null when idle).
    pub fn frame(&self) -> *mut Frame {
        self.vm.machine.stack.current()
    }

    /// Set the current top-of-stack frame.
    pub fn set_frame(&mut self, frame: *mut Frame) {
        self.vm.machine.stack.set_current(frame);
    }

    /// Allocate a frame above the current top. See
    /// [`CallStack::alloc_frame`].
    pub fn alloc_frame(
        &mut self,
        num_regs: u32,
        num_data: u32,
        code: Value,
        module: Value,
        marker: Value,
    ) -> VmResult<*mut Frame> {
        self.vm
            .machine
            .stack
            .alloc_frame(num_regs, num_data, code, module, marker)
    }

    /// Reserve room for `total_length` bytes of frames above the current
    /// top. See [`CallStack::alloc_frames`].
    pub fn alloc_frames(&mut self, total_length: usize) -> VmResult<*mut u8> {
        self.vm.machine.stack.alloc_frames(total_length)
    }

    /// Pop the current frame. See [`Interpreter::unwind_frame`].
    pub fn unwind_frame(&mut self, tail_call: bool) {
        self.vm.unwind_frame(tail_call);
    }
}
