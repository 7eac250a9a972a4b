//! Machine constructors.

use katsu_types::Value;

use crate::error::VmResult;
use crate::gc::roots::RootList;
use crate::gc::Gc;
use crate::interpreter::frame::CallStack;
use crate::interpreter::{BuiltinId, Interpreter, MachineState, VmParams};

impl Interpreter {
    /// Create an idle machine with no builtins registered; see
    /// [`crate::builtins::install`] for the bootstrapped surface.
    pub fn new(params: VmParams) -> Self {
        Interpreter {
            gc: Gc::new(params.heap_size),
            roots: RootList::new(),
            machine: MachineState {
                stack: CallStack::new(params.call_stack_size),
                builtins: [Value::NULL; BuiltinId::COUNT],
                modules: Value::NULL,
                condition_handler: Value::NULL,
            },
        }
    }

    /// Create a machine and install the builtin surface.
    pub fn bootstrapped(params: VmParams) -> VmResult<Self> {
        let mut vm = Interpreter::new(params);
        crate::builtins::install(&mut vm)?;
        Ok(vm)
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter::new(VmParams::default())
    }
}
