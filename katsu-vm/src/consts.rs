//! Machine parameters.

/// Default size of the collected heap, in bytes (one semispace).
pub const DEFAULT_HEAP_SIZE: usize = 100 * 1024 * 1024;

/// Default size of the call-stack region, in bytes.
pub const DEFAULT_CALL_STACK_SIZE: usize = 100 * 1024;

/// Byte written over fresh allocations and dead regions in debug builds to
/// make stale reads obvious.
pub const POISON_BYTE: u8 = 0x42;
