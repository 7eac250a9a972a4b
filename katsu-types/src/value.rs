use core::fmt;
use core::ptr::NonNull;

use crate::{ObjectHeader, ValueError};

/// Number of low bits holding the tag of a [`Value`].
pub const TAG_BITS: u32 = 3;

/// Number of payload bits in a [`Value`].
pub const INLINE_BITS: u32 = 64 - TAG_BITS;

/// Mask selecting the tag bits of a raw value word.
pub const TAG_MASK: u64 = (1u64 << TAG_BITS) - 1;

/// Largest integer representable as a fixnum.
pub const FIXNUM_MAX: i64 = (1i64 << (INLINE_BITS - 1)) - 1;

/// Smallest integer representable as a fixnum.
pub const FIXNUM_MIN: i64 = -(1i64 << (INLINE_BITS - 1));

/// Mask selecting the `INLINE_BITS`-wide fixnum payload.
pub const FIXNUM_MASK: u64 = !(TAG_MASK << INLINE_BITS);

static_assertions::const_assert_eq!((FIXNUM_MASK << TAG_BITS) | TAG_MASK, u64::MAX);

/// Primary tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Tag {
    /// Small signed integer stored inline.
    Fixnum = 0,
    /// 32-bit float stored inline in the low payload bits.
    Float = 1,
    /// Boolean stored inline.
    Bool = 2,
    /// The null singleton.
    Null = 3,
    /// Pointer to a garbage-collected heap object.
    Object = 4,
}

impl Tag {
    /// Number of distinct tags.
    pub const COUNT: usize = 5;

    /// All tags, in payload order. Handy for exhaustive pairwise tests.
    pub const ALL: [Tag; Tag::COUNT] =
        [Tag::Fixnum, Tag::Float, Tag::Bool, Tag::Null, Tag::Object];

    const fn from_bits(bits: u64) -> Tag {
        match bits {
            0 => Tag::Fixnum,
            1 => Tag::Float,
            2 => Tag::Bool,
            3 => Tag::Null,
            4 => Tag::Object,
            _ => unreachable!(),
        }
    }

    /// Lowercase human-readable name of the tag.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Tag::Fixnum => "fixnum",
            Tag::Float => "float",
            Tag::Bool => "bool",
            Tag::Null => "null",
            Tag::Object => "object",
        }
    }
}

static_assertions::const_assert!(Tag::COUNT <= (1 << TAG_BITS) as usize);

/// A 64-bit tagged value: either an inline scalar (fixnum, float32, bool,
/// null) or a pointer to a heap object.
///
/// Equality is raw word equality; for objects that is pointer identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct Value(u64);

static_assertions::assert_eq_size!(Value, u64);
static_assertions::assert_eq_align!(Value, u64);

impl Value {
    const fn pack(tag: Tag, payload: u64) -> Self {
        Value((payload << TAG_BITS) | tag as u64)
    }

    /// The null singleton.
    pub const NULL: Value = Value::pack(Tag::Null, 0);

    /// The true singleton.
    pub const TRUE: Value = Value::pack(Tag::Bool, 1);

    /// The false singleton.
    pub const FALSE: Value = Value::pack(Tag::Bool, 0);

    /// Pack a fixnum. Fails with [`ValueError::FixnumOutOfRange`] outside
    /// `[FIXNUM_MIN, FIXNUM_MAX]`.
    pub fn fixnum(num: i64) -> Result<Self, ValueError> {
        if !(FIXNUM_MIN..=FIXNUM_MAX).contains(&num) {
            return Err(ValueError::FixnumOutOfRange);
        }
        // The input is 64-bit two's-complement; mask down to INLINE_BITS-bit
        // two's-complement for the payload.
        Ok(Value::pack(Tag::Fixnum, (num as u64) & FIXNUM_MASK))
    }

    /// Pack a 32-bit float.
    pub fn float32(val: f32) -> Self {
        Value::pack(Tag::Float, val.to_bits() as u64)
    }

    /// Pack a boolean.
    pub const fn bool(val: bool) -> Self {
        if val {
            Value::TRUE
        } else {
            Value::FALSE
        }
    }

    /// The null singleton.
    pub const fn null() -> Self {
        Value::NULL
    }

    /// Tag a heap object pointer. The pointer must be aligned to a value
    /// boundary.
    pub fn object(object: NonNull<ObjectHeader>) -> Result<Self, ValueError> {
        let raw = object.as_ptr() as u64;
        if raw & TAG_MASK != 0 {
            return Err(ValueError::UnalignedObjectPointer);
        }
        Ok(Value::pack(Tag::Object, raw >> TAG_BITS))
    }

    /// The tag of this value.
    pub const fn tag(self) -> Tag {
        Tag::from_bits(self.0 & TAG_MASK)
    }

    /// The untyped payload bits (everything above the tag).
    pub const fn raw_payload(self) -> u64 {
        self.0 >> TAG_BITS
    }

    /// The full raw tagged word.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Rebuild a value from a raw tagged word previously read with
    /// [`Value::raw`].
    ///
    /// # Safety
    ///
    /// `raw` must be a word produced by this representation; an object word
    /// must point at a live heap object.
    pub const unsafe fn from_raw(raw: u64) -> Self {
        Value(raw)
    }

    /// Whether the value is stored entirely inline (i.e. not an object
    /// pointer).
    pub const fn is_inline(self) -> bool {
        (self.0 & TAG_MASK) < Tag::Object as u64
    }

    /// Whether the value is a fixnum.
    pub const fn is_fixnum(self) -> bool {
        matches!(self.tag(), Tag::Fixnum)
    }

    /// Whether the value is a float.
    pub const fn is_float(self) -> bool {
        matches!(self.tag(), Tag::Float)
    }

    /// Whether the value is a boolean.
    pub const fn is_bool(self) -> bool {
        matches!(self.tag(), Tag::Bool)
    }

    /// Whether the value is null.
    pub const fn is_null(self) -> bool {
        matches!(self.tag(), Tag::Null)
    }

    /// Whether the value is a heap object pointer.
    pub const fn is_object(self) -> bool {
        matches!(self.tag(), Tag::Object)
    }

    /// Unpack a fixnum, sign-extending the payload back to 64 bits.
    pub fn as_fixnum(self) -> Option<i64> {
        if !self.is_fixnum() {
            return None;
        }
        let raw = self.raw_payload();
        let extended = if raw >> (INLINE_BITS - 1) != 0 {
            raw | !FIXNUM_MASK
        } else {
            raw
        };
        Some(extended as i64)
    }

    /// Unpack a float.
    pub fn as_float32(self) -> Option<f32> {
        if !self.is_float() {
            return None;
        }
        // The upper payload bits are zero by construction.
        Some(f32::from_bits(self.raw_payload() as u32))
    }

    /// Unpack a boolean.
    pub fn as_bool(self) -> Option<bool> {
        if !self.is_bool() {
            return None;
        }
        Some(self.raw_payload() != 0)
    }

    /// Unpack a heap object pointer.
    pub fn as_object(self) -> Option<NonNull<ObjectHeader>> {
        if !self.is_object() {
            return None;
        }
        NonNull::new((self.raw_payload() << TAG_BITS) as *mut ObjectHeader)
    }

    /// Unpack a fixnum, aborting on tag mismatch. For paths where the tag is
    /// an established invariant.
    #[track_caller]
    pub fn expect_fixnum(self) -> i64 {
        self.as_fixnum().expect("value is not a fixnum")
    }

    /// Unpack an object pointer, aborting on tag mismatch. For paths where
    /// the tag is an established invariant.
    #[track_caller]
    pub fn expect_object(self) -> NonNull<ObjectHeader> {
        self.as_object().expect("value is not an object")
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NULL
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Tag::Fixnum => write!(f, "Value::Fixnum({})", self.expect_fixnum()),
            Tag::Float => write!(f, "Value::Float({})", self.as_float32().unwrap()),
            Tag::Bool => write!(f, "Value::Bool({})", self.as_bool().unwrap()),
            Tag::Null => write!(f, "Value::Null"),
            Tag::Object => write!(
                f,
                "Value::Object({:#x})",
                self.raw_payload() << TAG_BITS
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use rstest::rstest;

    #[test]
    fn null_is_default() {
        assert!(Value::default().is_null());
        assert_eq!(Value::default(), Value::NULL);
    }

    #[test]
    fn fixnum_round_trips_at_the_boundaries() {
        for n in [
            0,
            1,
            -1,
            42,
            -42,
            FIXNUM_MAX,
            FIXNUM_MIN,
            FIXNUM_MAX - 1,
            FIXNUM_MIN + 1,
        ] {
            let v = Value::fixnum(n).expect("in range");
            assert_eq!(v.as_fixnum(), Some(n));
            assert_eq!(v.tag(), Tag::Fixnum);
        }
    }

    #[test]
    fn fixnum_out_of_range_is_rejected() {
        for n in [FIXNUM_MAX + 1, FIXNUM_MIN - 1, i64::MAX, i64::MIN] {
            assert_eq!(Value::fixnum(n), Err(ValueError::FixnumOutOfRange));
        }
    }

    #[quickcheck]
    fn fixnum_round_trips_everywhere(n: i64) -> bool {
        match Value::fixnum(n) {
            Ok(v) => v.as_fixnum() == Some(n),
            Err(_) => !(FIXNUM_MIN..=FIXNUM_MAX).contains(&n),
        }
    }

    #[quickcheck]
    fn float32_round_trips(bits: u32) -> bool {
        let f = f32::from_bits(bits);
        let v = Value::float32(f);
        v.as_float32().map(f32::to_bits) == Some(bits)
    }

    #[test]
    fn bool_round_trips() {
        assert_eq!(Value::bool(true).as_bool(), Some(true));
        assert_eq!(Value::bool(false).as_bool(), Some(false));
        assert_ne!(Value::TRUE, Value::FALSE);
    }

    #[rstest]
    #[case(Value::fixnum(7).unwrap(), Tag::Fixnum)]
    #[case(Value::float32(1.5), Tag::Float)]
    #[case(Value::TRUE, Tag::Bool)]
    #[case(Value::NULL, Tag::Null)]
    fn accessors_reject_every_other_tag(#[case] value: Value, #[case] tag: Tag) {
        assert_eq!(value.tag(), tag);
        assert_eq!(value.as_fixnum().is_some(), tag == Tag::Fixnum);
        assert_eq!(value.as_float32().is_some(), tag == Tag::Float);
        assert_eq!(value.as_bool().is_some(), tag == Tag::Bool);
        assert_eq!(value.is_null(), tag == Tag::Null);
        assert_eq!(value.as_object().is_some(), tag == Tag::Object);
    }

    #[test]
    fn unaligned_object_pointers_are_rejected() {
        let ptr = NonNull::new(0x1001 as *mut ObjectHeader).unwrap();
        assert_eq!(Value::object(ptr), Err(ValueError::UnalignedObjectPointer));

        let aligned = NonNull::new(0x1000 as *mut ObjectHeader).unwrap();
        let v = Value::object(aligned).unwrap();
        assert_eq!(v.as_object(), Some(aligned));
    }

    #[test]
    fn equality_is_raw_word_equality() {
        assert_eq!(Value::fixnum(3).unwrap(), Value::fixnum(3).unwrap());
        assert_ne!(Value::fixnum(3).unwrap(), Value::fixnum(4).unwrap());
        // A fixnum zero is not the float zero, nor false, nor null.
        assert_ne!(Value::fixnum(0).unwrap(), Value::float32(0.0));
        assert_ne!(Value::fixnum(0).unwrap(), Value::FALSE);
        assert_ne!(Value::fixnum(0).unwrap(), Value::NULL);
    }
}
