//! Runtime error plumbing.
//!
//! Recoverable failures are [`Condition`]s: a short tag paired with a human
//! message, deliverable to a user-installed handler. Everything else — a
//! broken layout, an impossible tag, a compiler contract violated — is an
//! internal invariant break and aborts the process via `panic!`, never
//! through this module.

use katsu_asm::ConditionTag;
use katsu_types::ValueError;

/// A signalled condition: the tag names the failure class, the message is
/// for humans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// The failure class.
    pub tag: ConditionTag,
    /// Human-readable detail.
    pub message: String,
}

impl Condition {
    /// Build a condition.
    pub fn new(tag: ConditionTag, message: impl Into<String>) -> Self {
        Condition {
            tag,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for Condition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.tag, self.message)
    }
}

/// Machine error variants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum VmError {
    /// The machine signalled a well-formed condition. Recoverable through
    /// the user-installed condition handler.
    #[error("condition signalled: {0}")]
    Condition(Condition),
}

impl VmError {
    /// Shorthand for signalling a condition.
    pub fn condition(tag: ConditionTag, message: impl Into<String>) -> Self {
        VmError::Condition(Condition::new(tag, message))
    }

    /// The condition carried by this error, if any.
    pub fn as_condition(&self) -> Option<&Condition> {
        match self {
            VmError::Condition(c) => Some(c),
        }
    }
}

impl From<Condition> for VmError {
    fn from(condition: Condition) -> Self {
        VmError::Condition(condition)
    }
}

impl From<ValueError> for VmError {
    fn from(err: ValueError) -> Self {
        match err {
            ValueError::FixnumOutOfRange => VmError::condition(
                ConditionTag::OutOfRange,
                "integer is too large to be represented as a fixnum",
            ),
            ValueError::UnalignedObjectPointer => {
                // Misaligned object pointers cannot come from user programs.
                panic!("object pointer is not aligned to a value boundary")
            }
            _ => unreachable!("ValueError is non_exhaustive but has no other variants"),
        }
    }
}

/// Result of a machine operation.
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_render_tag_and_message() {
        let err = VmError::condition(ConditionTag::DivideByZero, "cannot divide by integer 0");
        assert_eq!(
            err.to_string(),
            "condition signalled: divide-by-zero: cannot divide by integer 0"
        );
    }

    #[test]
    fn out_of_range_maps_to_a_condition() {
        let err = VmError::from(ValueError::FixnumOutOfRange);
        assert_eq!(
            err.as_condition().map(|c| c.tag),
            Some(ConditionTag::OutOfRange)
        );
    }
}
