use core::fmt;

/// Errors produced while packing or unpacking [`Value`](crate::Value)s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum ValueError {
    /// The integer does not fit the fixnum payload range
    /// `[FIXNUM_MIN, FIXNUM_MAX]`.
    FixnumOutOfRange,
    /// An object pointer was not aligned to a value boundary and therefore
    /// cannot be tagged.
    UnalignedObjectPointer,
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixnumOutOfRange => {
                write!(f, "integer is too large to be represented as a fixnum")
            }
            Self::UnalignedObjectPointer => {
                write!(f, "object pointer is not aligned to a value boundary")
            }
        }
    }
}

impl std::error::Error for ValueError {}
