//! The universal value carrier crossing every loader boundary.
//!
//! This module defines the closed type-id enumeration ([`ValueId`]) and the
//! tagged carrier ([`Value`]) itself. `Value` uses a hybrid design: small
//! scalar payloads (booleans, integers, floats, pointers) are stored inline,
//! while composite payloads (strings, buffers, arrays, maps) and reflection
//! entities (functions, classes, objects, exceptions, throwables, futures)
//! live in the reference-counted arena and are referenced via `Ref(HeapId)`.
//!
//! NOTE: `Clone` is intentionally NOT derived. Use `clone_with_heap()` to copy
//! a value (incrementing the refcount for heap-backed payloads) and
//! `drop_with_heap()` to release one. Direct cloning would bypass reference
//! counting and leak or double-free heap slots.

use std::fmt::{self, Write};

use crate::heap::{Heap, HeapData, HeapId};

/// The closed enumeration of value sorts.
///
/// The numeric discriminants are part of the wire ABI: introspection
/// documents and cross-process consumers rely on them never changing. `Size`
/// is not a sort at all but the count of concrete ids, kept in the
/// enumeration for parity with the C-era public header; `Invalid` marks types
/// a backend reported but the registry could not resolve.
#[repr(u8)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum ValueId {
    Bool = 0,
    Char = 1,
    Short = 2,
    Int = 3,
    Long = 4,
    Float = 5,
    Double = 6,
    String = 7,
    Buffer = 8,
    Array = 9,
    Map = 10,
    Ptr = 11,
    Future = 12,
    Function = 13,
    Class = 14,
    Object = 15,
    Exception = 16,
    Throwable = 17,
    Null = 18,
    /// Count sentinel: the number of concrete sorts above.
    Size = 19,
    Invalid = 20,
}

impl ValueId {
    /// Number of concrete value sorts (everything before the `Size` sentinel).
    pub const COUNT: u8 = Self::Size as u8;

    /// Recovers an id from its wire discriminant.
    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Bool),
            1 => Some(Self::Char),
            2 => Some(Self::Short),
            3 => Some(Self::Int),
            4 => Some(Self::Long),
            5 => Some(Self::Float),
            6 => Some(Self::Double),
            7 => Some(Self::String),
            8 => Some(Self::Buffer),
            9 => Some(Self::Array),
            10 => Some(Self::Map),
            11 => Some(Self::Ptr),
            12 => Some(Self::Future),
            13 => Some(Self::Function),
            14 => Some(Self::Class),
            15 => Some(Self::Object),
            16 => Some(Self::Exception),
            17 => Some(Self::Throwable),
            18 => Some(Self::Null),
            19 => Some(Self::Size),
            20 => Some(Self::Invalid),
            _ => None,
        }
    }

    /// Whether this id is one of the integral sorts (bool and char included,
    /// as in the C type ladder).
    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(self, Self::Bool | Self::Char | Self::Short | Self::Int | Self::Long)
    }

    /// Whether this id is a floating-point sort.
    #[must_use]
    pub fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Whether this id is numeric (integral or floating).
    #[must_use]
    pub fn is_numeric(self) -> bool {
        self.is_integral() || self.is_floating()
    }

    /// Whether this id names a composite payload with an element count.
    #[must_use]
    pub fn is_composite(self) -> bool {
        matches!(self, Self::Array | Self::Map)
    }

    /// Width rank inside the integral ladder, used for implicit widening.
    /// `None` for non-integral ids.
    #[must_use]
    pub(crate) fn integral_rank(self) -> Option<u8> {
        match self {
            Self::Bool => Some(0),
            Self::Char => Some(1),
            Self::Short => Some(2),
            Self::Int => Some(3),
            Self::Long => Some(4),
            _ => None,
        }
    }

    /// Whether an argument of id `self` implicitly widens into a slot of id
    /// `slot` without loss: integral→wider integral, integral→floating,
    /// float→double.
    #[must_use]
    pub fn widens_into(self, slot: Self) -> bool {
        if let (Some(a), Some(s)) = (self.integral_rank(), slot.integral_rank()) {
            return a <= s;
        }
        if self.is_integral() && slot.is_floating() {
            return true;
        }
        self == Self::Float && slot == Self::Double
    }
}

/// Primary tagged value, either an inline scalar or a reference into the heap
/// arena. See the module docs for the ownership discipline.
#[derive(Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Char(char),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Opaque native address. Never dereferenced by the core.
    Ptr(usize),
    /// Heap-allocated payload (string, buffer, array, map, or a reflection
    /// entity) stored in the arena.
    Ref(HeapId),
    /// Sentinel indicating this value was cleaned up via `drop_with_heap`.
    /// Only exists when `ref-count-panic` is enabled; used to verify that no
    /// `Ref` is ever dropped without decrementing its slot.
    #[cfg(feature = "ref-count-panic")]
    Dereferenced,
}

#[cfg(feature = "ref-count-panic")]
impl Drop for Value {
    fn drop(&mut self) {
        if let Self::Ref(id) = self {
            panic!("Value::Ref({id:?}) dropped without calling drop_with_heap() - this is a reference counting bug");
        }
    }
}

/// Raised when `cast` is asked for a conversion outside the implicit and
/// explicit conversion tables. The dispatcher reifies this into a TypeError
/// throwable at the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CastError {
    pub from: ValueId,
    pub to: ValueId,
}

impl fmt::Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot cast {} to {}", self.from, self.to)
    }
}

/// Scalar payload lifted out of a value for numeric conversion.
enum Scalar {
    I(i64),
    F(f64),
}

impl Value {
    /// Returns the type id of this value. Heap references report the id of
    /// their payload kind.
    #[must_use]
    pub fn value_id(&self, heap: &Heap) -> ValueId {
        match self {
            Self::Null => ValueId::Null,
            Self::Bool(_) => ValueId::Bool,
            Self::Char(_) => ValueId::Char,
            Self::Short(_) => ValueId::Short,
            Self::Int(_) => ValueId::Int,
            Self::Long(_) => ValueId::Long,
            Self::Float(_) => ValueId::Float,
            Self::Double(_) => ValueId::Double,
            Self::Ptr(_) => ValueId::Ptr,
            Self::Ref(id) => heap.get(*id).value_id(),
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("cannot access dereferenced value"),
        }
    }

    /// The heap id behind this value, if it is heap-backed.
    #[must_use]
    pub fn ref_id(&self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Copies this value, incrementing the refcount when it is heap-backed.
    /// This is a shallow copy: composites share their payload.
    #[must_use]
    pub fn clone_with_heap(&self, heap: &Heap) -> Self {
        match self {
            Self::Null => Self::Null,
            Self::Bool(b) => Self::Bool(*b),
            Self::Char(c) => Self::Char(*c),
            Self::Short(s) => Self::Short(*s),
            Self::Int(i) => Self::Int(*i),
            Self::Long(l) => Self::Long(*l),
            Self::Float(x) => Self::Float(*x),
            Self::Double(x) => Self::Double(*x),
            Self::Ptr(p) => Self::Ptr(*p),
            Self::Ref(id) => {
                heap.inc_ref(*id);
                Self::Ref(*id)
            }
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("cannot clone dereferenced value"),
        }
    }

    /// Releases this value, decrementing the refcount when it is heap-backed.
    /// Dropping the last reference frees the payload and recursively releases
    /// owned children.
    pub fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Ref(id) = &self {
            heap.dec_ref(*id);
        }
        // Bypass the ref-count-panic Drop guard: the ref was just released.
        std::mem::forget(self);
    }

    /// Structural deep copy. Strings, buffers, arrays and maps are duplicated
    /// slot by slot; reflection entities are shared (refcount incremented)
    /// since a loader-owned function or class has no meaningful structural
    /// copy.
    #[must_use]
    pub fn deep_copy(&self, heap: &mut Heap) -> Self {
        let Some(id) = self.ref_id() else {
            return self.clone_with_heap(heap);
        };
        match heap.get(id) {
            HeapData::Str(s) => {
                let s = s.clone();
                heap.new_string(s)
            }
            HeapData::Buffer(b) => {
                let b = b.clone();
                heap.new_buffer(b)
            }
            HeapData::Array(items) => {
                let shallow: Vec<Self> = items.iter().map(|v| v.clone_with_heap(heap)).collect();
                let mut deep = Vec::with_capacity(shallow.len());
                for item in shallow {
                    deep.push(item.deep_copy(heap));
                    item.drop_with_heap(heap);
                }
                heap.new_array(deep)
            }
            HeapData::Map(pairs) => {
                let shallow: Vec<(Self, Self)> = pairs
                    .iter()
                    .map(|(k, v)| (k.clone_with_heap(heap), v.clone_with_heap(heap)))
                    .collect();
                let mut deep = Vec::with_capacity(shallow.len());
                for (k, v) in shallow {
                    let pair = (k.deep_copy(heap), v.deep_copy(heap));
                    k.drop_with_heap(heap);
                    v.drop_with_heap(heap);
                    deep.push(pair);
                }
                heap.new_map(deep)
            }
            _ => self.clone_with_heap(heap),
        }
    }

    /// Bytes of payload carried by this value.
    #[must_use]
    pub fn size(&self, heap: &Heap) -> usize {
        match self {
            Self::Null => 0,
            Self::Bool(_) => size_of::<bool>(),
            Self::Char(_) => size_of::<char>(),
            Self::Short(_) => size_of::<i16>(),
            Self::Int(_) => size_of::<i32>(),
            Self::Long(_) => size_of::<i64>(),
            Self::Float(_) => size_of::<f32>(),
            Self::Double(_) => size_of::<f64>(),
            Self::Ptr(_) => size_of::<usize>(),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => s.len(),
                HeapData::Buffer(b) => b.len(),
                HeapData::Array(items) => items.len() * size_of::<Self>(),
                HeapData::Map(pairs) => pairs.len() * size_of::<(Self, Self)>(),
                other => std::mem::size_of_val(other),
            },
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => 0,
        }
    }

    /// Element count: array/map length for composites, 1 otherwise.
    #[must_use]
    pub fn count(&self, heap: &Heap) -> usize {
        match self.ref_id().map(|id| heap.get(id)) {
            Some(HeapData::Array(items)) => items.len(),
            Some(HeapData::Map(pairs)) => pairs.len(),
            _ => 1,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_char(&self) -> Option<char> {
        match self {
            Self::Char(c) => Some(*c),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_short(&self) -> Option<i16> {
        match self {
            Self::Short(s) => Some(*s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(l) => Some(*l),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(x) => Some(*x),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(x) => Some(*x),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_ptr(&self) -> Option<usize> {
        match self {
            Self::Ptr(p) => Some(*p),
            _ => None,
        }
    }

    /// Borrows the string payload, if this value is a heap string.
    #[must_use]
    pub fn as_str<'h>(&self, heap: &'h Heap) -> Option<&'h str> {
        match self.ref_id().map(|id| heap.get(id)) {
            Some(HeapData::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Borrows the buffer payload, if this value is a heap buffer.
    #[must_use]
    pub fn as_buffer<'h>(&self, heap: &'h Heap) -> Option<&'h [u8]> {
        match self.ref_id().map(|id| heap.get(id)) {
            Some(HeapData::Buffer(b)) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Borrows the element slice of an array value.
    #[must_use]
    pub fn as_array<'h>(&self, heap: &'h Heap) -> Option<&'h [Self]> {
        match self.ref_id().map(|id| heap.get(id)) {
            Some(HeapData::Array(items)) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Borrows the pair slice of a map value.
    #[must_use]
    pub fn as_map<'h>(&self, heap: &'h Heap) -> Option<&'h [(Self, Self)]> {
        match self.ref_id().map(|id| heap.get(id)) {
            Some(HeapData::Map(pairs)) => Some(pairs.as_slice()),
            _ => None,
        }
    }

    /// Lifts the scalar payload for numeric conversion, parsing string
    /// payloads with the number-prefix rules.
    fn scalar_of(&self, heap: &Heap) -> Option<Scalar> {
        match self {
            Self::Bool(b) => Some(Scalar::I(i64::from(*b))),
            Self::Char(c) => Some(Scalar::I(i64::from(u32::from(*c)))),
            Self::Short(s) => Some(Scalar::I(i64::from(*s))),
            Self::Int(i) => Some(Scalar::I(i64::from(*i))),
            Self::Long(l) => Some(Scalar::I(*l)),
            Self::Float(x) => Some(Scalar::F(f64::from(*x))),
            Self::Double(x) => Some(Scalar::F(*x)),
            Self::Ref(_) => self.as_str(heap).map(|s| Scalar::F(parse_double_prefix(s))),
            _ => None,
        }
    }

    /// Explicit conversion between value sorts.
    ///
    /// Identity is preserved when the requested id already matches (the same
    /// value is returned, refcount untouched). Otherwise a new value is
    /// produced and the original is released. Failed conversions also release
    /// the original, mirroring the ownership-transferring call boundary.
    ///
    /// Conversion table: any numeric/bool/char to any numeric/bool/char
    /// (narrowing saturates, floats widen through IEEE 754 double); strings
    /// parse with the base-10 prefix rules; anything stringifies. Casting a
    /// pointer to a non-numeric sort returns the pointer unchanged.
    pub fn cast(self, heap: &mut Heap, target: ValueId) -> Result<Self, CastError> {
        let current = self.value_id(heap);
        if current == target {
            return Ok(self);
        }
        if let Self::Ptr(addr) = &self {
            if target.is_numeric() {
                #[expect(clippy::cast_possible_wrap, reason = "addresses convert as raw bits")]
                let scalar = Scalar::I(*addr as i64);
                let out = scalar_to_value(target, &scalar);
                self.drop_with_heap(heap);
                return Ok(out);
            }
            // Foreign pointee: the address is all we have, hand it back as-is.
            return Ok(self);
        }
        if target.is_numeric() {
            if let Some(scalar) = self.scalar_of(heap) {
                // Integral targets parse strings with the integer prefix rule
                // rather than through the double intermediate.
                let scalar = if target.is_integral() {
                    match self.as_str(heap) {
                        Some(text) => Scalar::I(parse_long_prefix(text)),
                        None => scalar,
                    }
                } else {
                    scalar
                };
                let out = scalar_to_value(target, &scalar);
                self.drop_with_heap(heap);
                return Ok(out);
            }
        }
        if target == ValueId::String {
            let text = self.stringify(heap);
            self.drop_with_heap(heap);
            return Ok(heap.new_string(text));
        }
        self.drop_with_heap(heap);
        Err(CastError { from: current, to: target })
    }

    /// Renders this value as text. Defined for every sort: scalars print
    /// their natural form, composites recurse, reflection entities print the
    /// same opaque tags the serial bridge uses, null prints `(null)`.
    #[must_use]
    pub fn stringify(&self, heap: &Heap) -> String {
        let mut out = String::new();
        self.stringify_fmt(&mut out, heap).expect("write to String cannot fail");
        out
    }

    /// `stringify` into any formatter.
    pub fn stringify_fmt<W: Write>(&self, f: &mut W, heap: &Heap) -> fmt::Result {
        match self {
            Self::Null => f.write_str("(null)"),
            Self::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            Self::Char(c) => f.write_char(*c),
            Self::Short(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Long(l) => write!(f, "{l}"),
            Self::Float(x) => f.write_str(ryu::Buffer::new().format(*x)),
            Self::Double(x) => f.write_str(ryu::Buffer::new().format(*x)),
            Self::Ptr(p) => write!(f, "0x{p:x}"),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => f.write_str(s),
                HeapData::Buffer(bytes) => {
                    for byte in bytes {
                        write!(f, "{byte:02x}")?;
                    }
                    Ok(())
                }
                HeapData::Array(items) => {
                    f.write_char('[')?;
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            f.write_char(',')?;
                        }
                        item.stringify_fmt(f, heap)?;
                    }
                    f.write_char(']')
                }
                HeapData::Map(pairs) => {
                    f.write_char('{')?;
                    for (i, (key, value)) in pairs.iter().enumerate() {
                        if i > 0 {
                            f.write_char(',')?;
                        }
                        key.stringify_fmt(f, heap)?;
                        f.write_char(':')?;
                        value.stringify_fmt(f, heap)?;
                    }
                    f.write_char('}')
                }
                HeapData::Function(_) => f.write_str("[Function]"),
                HeapData::Class(_) => f.write_str("[Class]"),
                HeapData::Object(_) => f.write_str("[Object]"),
                HeapData::Future(_) => f.write_str("[Future]"),
                HeapData::Exception(e) => write!(f, "{}: {}", e.label, e.message),
                HeapData::Throwable(t) => {
                    f.write_str("Throwable(")?;
                    t.inner.stringify_fmt(f, heap)?;
                    f.write_char(')')
                }
            },
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => f.write_str("<dereferenced>"),
        }
    }
}

/// Builds the target scalar value, saturating on narrowing conversions.
fn scalar_to_value(target: ValueId, scalar: &Scalar) -> Value {
    match target {
        ValueId::Bool => Value::Bool(match scalar {
            Scalar::I(i) => *i != 0,
            Scalar::F(x) => *x != 0.0,
        }),
        ValueId::Char => {
            let raw = match scalar {
                Scalar::I(i) => u32::try_from(*i).unwrap_or(0),
                #[expect(clippy::cast_sign_loss, reason = "negative codepoints clamp to zero")]
                Scalar::F(x) => x.max(0.0) as u32,
            };
            Value::Char(char::from_u32(raw).unwrap_or('\u{FFFD}'))
        }
        ValueId::Short => Value::Short(match scalar {
            Scalar::I(i) => (*i).clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16,
            Scalar::F(x) => *x as i16,
        }),
        ValueId::Int => Value::Int(match scalar {
            Scalar::I(i) => (*i).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
            Scalar::F(x) => *x as i32,
        }),
        ValueId::Long => Value::Long(match scalar {
            Scalar::I(i) => *i,
            Scalar::F(x) => *x as i64,
        }),
        ValueId::Float => Value::Float(match scalar {
            Scalar::I(i) => *i as f32,
            Scalar::F(x) => *x as f32,
        }),
        ValueId::Double => Value::Double(match scalar {
            Scalar::I(i) => *i as f64,
            Scalar::F(x) => *x,
        }),
        _ => unreachable!("scalar_to_value called with non-scalar target"),
    }
}

/// Parses a base-10 integer prefix: optional leading sign, then digits,
/// stopping at the first non-digit. Returns 0 when no digit was consumed.
/// Overflow saturates.
#[must_use]
pub fn parse_long_prefix(text: &str) -> i64 {
    let bytes = text.as_bytes();
    let mut idx = 0;
    let negative = match bytes.first() {
        Some(b'-') => {
            idx = 1;
            true
        }
        Some(b'+') => {
            idx = 1;
            false
        }
        _ => false,
    };
    let mut value: i64 = 0;
    let mut consumed = false;
    while let Some(digit) = bytes.get(idx).and_then(|b| char::from(*b).to_digit(10)) {
        consumed = true;
        value = value.saturating_mul(10);
        value = if negative {
            value.saturating_sub(i64::from(digit))
        } else {
            value.saturating_add(i64::from(digit))
        };
        idx += 1;
    }
    if consumed { value } else { 0 }
}

/// Parses a base-10 floating prefix: optional sign, digits, optional decimal
/// part, optional exponent. Returns 0.0 when no digit was consumed.
#[must_use]
pub fn parse_double_prefix(text: &str) -> f64 {
    let bytes = text.as_bytes();
    let mut end = 0;
    let mut saw_digit = false;
    if matches!(bytes.first(), Some(b'-' | b'+')) {
        end = 1;
    }
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
        saw_digit = true;
    }
    if bytes.get(end) == Some(&b'.') {
        let mut frac = end + 1;
        while bytes.get(frac).is_some_and(u8::is_ascii_digit) {
            frac += 1;
            saw_digit = true;
        }
        if frac > end + 1 {
            end = frac;
        }
    }
    if saw_digit && matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'-' | b'+')) {
            exp += 1;
        }
        let exp_digits_start = exp;
        while bytes.get(exp).is_some_and(u8::is_ascii_digit) {
            exp += 1;
        }
        if exp > exp_digits_start {
            end = exp;
        }
    }
    if !saw_digit {
        return 0.0;
    }
    text[..end].parse().unwrap_or(0.0)
}
