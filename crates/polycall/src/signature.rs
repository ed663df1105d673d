//! Function signature representation and overload comparison.
//!
//! A signature is an ordered list of `(name, type)` slots plus a return
//! type. Any slot may be left unresolved (`None`) to mean "inferred at call
//! site" — dynamic-language backends rarely know argument types at discovery
//! time. The ternary comparison result drives overload resolution for
//! constructors and methods.

use smallvec::SmallVec;

use crate::{types::Type, value::ValueId};

/// One signature slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    name: Box<str>,
    ty: Option<Type>,
}

impl Param {
    #[must_use]
    pub fn new(name: impl Into<Box<str>>, ty: Option<Type>) -> Self {
        Self { name: name.into(), ty }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ty(&self) -> Option<&Type> {
        self.ty.as_ref()
    }
}

/// Outcome of matching call-site argument sorts against a signature.
/// The discriminants are the comparison contract: 0 exact, 1 convertible
/// via implicit widening, 2 mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SignatureMatch {
    Exact = 0,
    Convertible = 1,
    Mismatch = 2,
}

/// An ordered parameter list plus return type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    params: SmallVec<[Param; 4]>,
    ret: Option<Type>,
}

impl Signature {
    /// An empty signature (niladic, unresolved return).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A signature with `arity` unresolved, unnamed slots for backends that
    /// fill slots incrementally during discovery.
    #[must_use]
    pub fn with_arity(arity: usize) -> Self {
        Self {
            params: (0..arity).map(|_| Param::new("", None)).collect(),
            ret: None,
        }
    }

    /// Builds a signature from complete slots.
    #[must_use]
    pub fn from_params(params: impl IntoIterator<Item = Param>, ret: Option<Type>) -> Self {
        Self {
            params: params.into_iter().collect(),
            ret,
        }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Overwrites slot `index`.
    ///
    /// # Panics
    /// Panics when `index` is outside the declared arity.
    pub fn set(&mut self, index: usize, name: impl Into<Box<str>>, ty: Option<Type>) {
        self.params[index] = Param::new(name, ty);
    }

    pub fn set_return(&mut self, ty: Option<Type>) {
        self.ret = ty;
    }

    #[must_use]
    pub fn param(&self, index: usize) -> Option<&Param> {
        self.params.get(index)
    }

    #[must_use]
    pub fn ret(&self) -> Option<&Type> {
        self.ret.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    /// Whether any slot still carries an `Invalid` placeholder type. The
    /// dispatcher refuses to invoke through such signatures unless the
    /// function is variadic.
    #[must_use]
    pub fn has_invalid_slot(&self) -> bool {
        self.params.iter().any(|p| p.ty.as_ref().is_some_and(Type::is_invalid))
    }

    /// Matches argument sorts (and optionally an expected return sort)
    /// against this signature.
    ///
    /// Grading per slot: an unresolved slot accepts anything as convertible;
    /// an `Invalid` placeholder never matches; a resolved slot grades exact
    /// on identical sorts and convertible when the argument implicitly
    /// widens into the slot. The overall grade is the worst slot grade, so a
    /// single incompatible argument fails the whole candidate.
    #[must_use]
    pub fn compare(&self, expected_ret: Option<ValueId>, args: &[ValueId]) -> SignatureMatch {
        if args.len() != self.params.len() {
            return SignatureMatch::Mismatch;
        }
        let mut worst = SignatureMatch::Exact;
        if let (Some(expected), Some(ret)) = (expected_ret, self.ret.as_ref()) {
            // The produced sort must satisfy the expectation, widening up.
            worst = if ret.is_invalid() {
                SignatureMatch::Mismatch
            } else if ret.id() == expected {
                SignatureMatch::Exact
            } else if ret.id().widens_into(expected) {
                SignatureMatch::Convertible
            } else {
                SignatureMatch::Mismatch
            };
        }
        for (arg, param) in args.iter().zip(&self.params) {
            let slot = match &param.ty {
                None => SignatureMatch::Convertible,
                Some(ty) => grade(*arg, ty),
            };
            worst = worst.max(slot);
            if worst == SignatureMatch::Mismatch {
                return SignatureMatch::Mismatch;
            }
        }
        worst
    }
}

fn grade(arg: ValueId, slot: &Type) -> SignatureMatch {
    if slot.is_invalid() {
        SignatureMatch::Mismatch
    } else if arg == slot.id() {
        SignatureMatch::Exact
    } else if arg.widens_into(slot.id()) {
        SignatureMatch::Convertible
    } else {
        SignatureMatch::Mismatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(id: ValueId) -> Option<Type> {
        Some(Type::new(id, id.to_string()))
    }

    fn sig(ids: &[ValueId], ret: ValueId) -> Signature {
        Signature::from_params(
            ids.iter().enumerate().map(|(i, id)| Param::new(format!("a{i}"), ty(*id))),
            ty(ret),
        )
    }

    #[test]
    fn exact_match_is_zero() {
        let s = sig(&[ValueId::Int, ValueId::Int], ValueId::Int);
        assert_eq!(s.compare(None, &[ValueId::Int, ValueId::Int]), SignatureMatch::Exact);
        assert_eq!(SignatureMatch::Exact as u8, 0);
        assert_eq!(SignatureMatch::Convertible as u8, 1);
        assert_eq!(SignatureMatch::Mismatch as u8, 2);
    }

    #[test]
    fn widening_is_convertible() {
        let s = sig(&[ValueId::Long, ValueId::Double], ValueId::Int);
        assert_eq!(
            s.compare(None, &[ValueId::Int, ValueId::Float]),
            SignatureMatch::Convertible
        );
    }

    #[test]
    fn narrowing_is_mismatch() {
        let s = sig(&[ValueId::Int], ValueId::Int);
        assert_eq!(s.compare(None, &[ValueId::Long]), SignatureMatch::Mismatch);
    }

    #[test]
    fn arity_mismatch_fails() {
        let s = sig(&[ValueId::Int], ValueId::Int);
        assert_eq!(s.compare(None, &[]), SignatureMatch::Mismatch);
        assert_eq!(s.compare(None, &[ValueId::Int, ValueId::Int]), SignatureMatch::Mismatch);
    }

    #[test]
    fn unresolved_slot_accepts_anything_as_convertible() {
        let s = Signature::from_params([Param::new("x", None)], None);
        assert_eq!(s.compare(None, &[ValueId::Class]), SignatureMatch::Convertible);
    }

    #[test]
    fn invalid_placeholder_never_matches() {
        let s = Signature::from_params([Param::new("x", Some(Type::new(ValueId::Invalid, "Widget")))], None);
        assert!(s.has_invalid_slot());
        assert_eq!(s.compare(None, &[ValueId::Int]), SignatureMatch::Mismatch);
    }

    #[test]
    fn return_sort_participates_when_expected() {
        let s = sig(&[ValueId::Int], ValueId::Float);
        assert_eq!(s.compare(Some(ValueId::Float), &[ValueId::Int]), SignatureMatch::Exact);
        assert_eq!(
            s.compare(Some(ValueId::Double), &[ValueId::Int]),
            SignatureMatch::Convertible,
            "a float return widens into a double expectation"
        );
        assert_eq!(
            s.compare(Some(ValueId::String), &[ValueId::Int]),
            SignatureMatch::Mismatch
        );
    }

    #[test]
    fn mutable_slot_updates() {
        let mut s = Signature::with_arity(2);
        s.set(0, "a", ty(ValueId::Int));
        s.set(1, "b", ty(ValueId::String));
        s.set_return(ty(ValueId::Bool));
        assert_eq!(s.param(0).unwrap().name(), "a");
        assert_eq!(s.param(1).unwrap().ty().unwrap().id(), ValueId::String);
        assert_eq!(s.ret().unwrap().id(), ValueId::Bool);
    }
}
