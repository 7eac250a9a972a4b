use core::fmt;

/// Tag identifying a condition signalled by the runtime.
///
/// Conditions are the recoverable error shape of the machine: a short tag
/// paired with a human message, delivered to a user-installed handler when
/// one is present. Broken internal invariants are not conditions; they abort
/// the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[non_exhaustive]
pub enum ConditionTag {
    /// Fixnum packing outside the representable range.
    OutOfRange = 0x00,
    /// Integer division by zero.
    DivideByZero = 0x01,
    /// The collector failed to make room even after a collection.
    OutOfMemory = 0x02,
    /// Frame allocation ran past the call-stack region.
    StackOverflow = 0x03,
    /// A callable was invoked with the wrong number of arguments.
    ArgumentCountMismatch = 0x04,
    /// No method of the multimethod matches the given arguments.
    NoMatchingMethod = 0x05,
    /// Several methods match and none is strictly most specific.
    AmbiguousMethodResolution = 0x06,
    /// A raw code object requiring captured registers was called without
    /// being wrapped in a closure.
    RawClosureCall = 0x07,
    /// An argument failed a structural requirement.
    InvalidArgument = 0x08,
    /// No frame on the call stack carries the requested marker.
    MarkerNotFound = 0x09,
    /// A type appears in the linearization of one of its own bases.
    InheritanceCycle = 0x0a,
    /// The C3 merge over the base linearizations has no solution.
    TypeLinearizationFailure = 0x0b,
    /// An external collaborator reported an input/output failure.
    IoError = 0x0c,
}

impl ConditionTag {
    /// The stable surface string of the tag, as delivered to condition
    /// handlers.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConditionTag::OutOfRange => "out-of-range",
            ConditionTag::DivideByZero => "divide-by-zero",
            ConditionTag::OutOfMemory => "out-of-memory",
            ConditionTag::StackOverflow => "stack-overflow",
            ConditionTag::ArgumentCountMismatch => "argument-count-mismatch",
            ConditionTag::NoMatchingMethod => "no-matching-method",
            ConditionTag::AmbiguousMethodResolution => "ambiguous-method-resolution",
            ConditionTag::RawClosureCall => "raw-closure-call",
            ConditionTag::InvalidArgument => "invalid-argument",
            ConditionTag::MarkerNotFound => "marker-not-found",
            ConditionTag::InheritanceCycle => "inheritance-cycle",
            ConditionTag::TypeLinearizationFailure => "type-linearization-failure",
            ConditionTag::IoError => "io-error",
        }
    }
}

impl fmt::Display for ConditionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn surface_strings_are_kebab_case_and_distinct() {
        let mut seen = std::collections::HashSet::new();
        for tag in ConditionTag::iter() {
            let s = tag.as_str();
            assert!(seen.insert(s), "duplicate condition tag string {s}");
            assert!(s
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '-'));
            assert_eq!(tag.to_string(), s);
        }
    }
}
