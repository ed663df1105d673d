//! The host boundary: detached values exchanged with embedders.
//!
//! Internal [`Value`]s thread the heap through every operation, which is the
//! wrong shape for a public API. [`HostValue`] is the detached counterpart:
//! plain data for the data sorts, opaque counted references for the entity
//! sorts. A `HostValue` holding entity references owns one reference per
//! entity and must be handed back to [`Runtime::release`] (or consumed by a
//! call) when the embedder is done with it; plain data needs no cleanup.
//!
//! [`Runtime::release`]: crate::dispatch::Runtime::release

use crate::{
    exceptions::Exception,
    heap::{Heap, HeapData, HeapId},
    value::{Value, ValueId},
};

macro_rules! entity_ref {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) HeapId);

        impl $name {
            /// The arena slot behind this reference. Diagnostic only.
            #[must_use]
            pub fn raw(&self) -> usize {
                self.0.index()
            }
        }
    };
}

entity_ref!(
    /// Opaque counted reference to a function entity.
    FunctionRef
);
entity_ref!(
    /// Opaque counted reference to a class entity.
    ClassRef
);
entity_ref!(
    /// Opaque counted reference to a constructed object.
    ObjectRef
);
entity_ref!(
    /// Opaque counted reference to a future.
    FutureRef
);

/// Detached exception payload crossing the boundary.
#[derive(Debug, PartialEq, Default)]
pub struct ExceptionData {
    pub message: String,
    pub label: String,
    pub code: i64,
    pub stacktrace: String,
    pub attached: Option<Box<HostValue>>,
}

impl ExceptionData {
    #[must_use]
    pub fn new(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            label: label.into(),
            ..Self::default()
        }
    }
}

/// A value at the host boundary.
///
/// NOTE: deliberately not `Clone`. Entity references own exactly one counted
/// share each; a structural clone would alias that share and double-release.
#[derive(Debug, PartialEq)]
pub enum HostValue {
    Null,
    Bool(bool),
    Char(char),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Buffer(Vec<u8>),
    Array(Vec<HostValue>),
    Map(Vec<(HostValue, HostValue)>),
    Ptr(usize),
    Function(FunctionRef),
    Class(ClassRef),
    Object(ObjectRef),
    Future(FutureRef),
    Exception(ExceptionData),
    Throwable(Box<HostValue>),
}

impl HostValue {
    /// The value sort this boundary value carries.
    #[must_use]
    pub fn value_id(&self) -> ValueId {
        match self {
            Self::Null => ValueId::Null,
            Self::Bool(_) => ValueId::Bool,
            Self::Char(_) => ValueId::Char,
            Self::Short(_) => ValueId::Short,
            Self::Int(_) => ValueId::Int,
            Self::Long(_) => ValueId::Long,
            Self::Float(_) => ValueId::Float,
            Self::Double(_) => ValueId::Double,
            Self::Str(_) => ValueId::String,
            Self::Buffer(_) => ValueId::Buffer,
            Self::Array(_) => ValueId::Array,
            Self::Map(_) => ValueId::Map,
            Self::Ptr(_) => ValueId::Ptr,
            Self::Function(_) => ValueId::Function,
            Self::Class(_) => ValueId::Class,
            Self::Object(_) => ValueId::Object,
            Self::Future(_) => ValueId::Future,
            Self::Exception(_) => ValueId::Exception,
            Self::Throwable(_) => ValueId::Throwable,
        }
    }

    /// Whether this is the error-path marker.
    #[must_use]
    pub fn is_throwable(&self) -> bool {
        matches!(self, Self::Throwable(_))
    }

    /// The inner exception data, when this is a throwable wrapping one.
    #[must_use]
    pub fn throwable_exception(&self) -> Option<&ExceptionData> {
        match self {
            Self::Throwable(inner) => match inner.as_ref() {
                Self::Exception(data) => Some(data),
                _ => None,
            },
            _ => None,
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
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Converts a boundary value into a heap value, consuming it. Entity
/// references transfer their counted share to the produced `Value`.
pub(crate) fn intake(heap: &mut Heap, host: HostValue) -> Value {
    match host {
        HostValue::Null => Value::Null,
        HostValue::Bool(b) => Value::Bool(b),
        HostValue::Char(c) => Value::Char(c),
        HostValue::Short(s) => Value::Short(s),
        HostValue::Int(i) => Value::Int(i),
        HostValue::Long(l) => Value::Long(l),
        HostValue::Float(x) => Value::Float(x),
        HostValue::Double(x) => Value::Double(x),
        HostValue::Str(s) => heap.new_string(s),
        HostValue::Buffer(bytes) => heap.new_buffer(bytes),
        HostValue::Array(items) => {
            let values: Vec<Value> = items.into_iter().map(|item| intake(heap, item)).collect();
            heap.new_array(values)
        }
        HostValue::Map(pairs) => {
            let pairs: Vec<(Value, Value)> = pairs
                .into_iter()
                .map(|(k, v)| (intake(heap, k), intake(heap, v)))
                .collect();
            heap.new_map(pairs)
        }
        HostValue::Ptr(addr) => Value::Ptr(addr),
        HostValue::Function(FunctionRef(id))
        | HostValue::Class(ClassRef(id))
        | HostValue::Object(ObjectRef(id))
        | HostValue::Future(FutureRef(id)) => Value::Ref(id),
        HostValue::Exception(data) => {
            let exception = intake_exception(heap, data);
            heap.new_exception(exception)
        }
        HostValue::Throwable(inner) => {
            let inner = intake(heap, *inner);
            heap.new_throwable(inner)
        }
    }
}

fn intake_exception(heap: &mut Heap, data: ExceptionData) -> Exception {
    let mut exception = Exception::new(data.label, data.message)
        .with_code(data.code)
        .with_stacktrace(data.stacktrace);
    exception.attached = data.attached.map(|inner| intake(heap, *inner));
    exception
}

/// Converts a boundary value into a heap value without consuming it. Data
/// sorts are copied in; entity references gain one counted share for the
/// produced `Value`, which the caller owns.
pub(crate) fn intake_borrowed(heap: &mut Heap, host: &HostValue) -> Value {
    match host {
        HostValue::Null => Value::Null,
        HostValue::Bool(b) => Value::Bool(*b),
        HostValue::Char(c) => Value::Char(*c),
        HostValue::Short(s) => Value::Short(*s),
        HostValue::Int(i) => Value::Int(*i),
        HostValue::Long(l) => Value::Long(*l),
        HostValue::Float(x) => Value::Float(*x),
        HostValue::Double(x) => Value::Double(*x),
        HostValue::Str(s) => heap.new_string(s.clone()),
        HostValue::Buffer(bytes) => heap.new_buffer(bytes.clone()),
        HostValue::Array(items) => {
            let values: Vec<Value> = items.iter().map(|item| intake_borrowed(heap, item)).collect();
            heap.new_array(values)
        }
        HostValue::Map(pairs) => {
            let pairs: Vec<(Value, Value)> = pairs
                .iter()
                .map(|(k, v)| (intake_borrowed(heap, k), intake_borrowed(heap, v)))
                .collect();
            heap.new_map(pairs)
        }
        HostValue::Ptr(addr) => Value::Ptr(*addr),
        HostValue::Function(FunctionRef(id))
        | HostValue::Class(ClassRef(id))
        | HostValue::Object(ObjectRef(id))
        | HostValue::Future(FutureRef(id)) => {
            heap.inc_ref(*id);
            Value::Ref(*id)
        }
        HostValue::Exception(data) => {
            let mut exception = Exception::new(data.label.clone(), data.message.clone())
                .with_code(data.code)
                .with_stacktrace(data.stacktrace.clone());
            exception.attached = data.attached.as_deref().map(|inner| intake_borrowed(heap, inner));
            heap.new_exception(exception)
        }
        HostValue::Throwable(inner) => {
            let inner = intake_borrowed(heap, inner);
            heap.new_throwable(inner)
        }
    }
}

/// [`outtake`] followed by releasing the source value: converts an owned
/// heap value into a boundary value, transferring entity shares.
pub(crate) fn outtake_owned(heap: &mut Heap, value: Value) -> HostValue {
    let host = outtake(heap, &value);
    value.drop_with_heap(heap);
    host
}

/// Converts a heap value into a boundary value without consuming it. Data
/// sorts are copied out; entity sorts gain one counted share for the
/// produced reference.
pub(crate) fn outtake(heap: &Heap, value: &Value) -> HostValue {
    match value {
        Value::Null => HostValue::Null,
        Value::Bool(b) => HostValue::Bool(*b),
        Value::Char(c) => HostValue::Char(*c),
        Value::Short(s) => HostValue::Short(*s),
        Value::Int(i) => HostValue::Int(*i),
        Value::Long(l) => HostValue::Long(*l),
        Value::Float(x) => HostValue::Float(*x),
        Value::Double(x) => HostValue::Double(*x),
        Value::Ptr(p) => HostValue::Ptr(*p),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => HostValue::Str(s.clone()),
            HeapData::Buffer(b) => HostValue::Buffer(b.clone()),
            HeapData::Array(items) => HostValue::Array(items.iter().map(|item| outtake(heap, item)).collect()),
            HeapData::Map(pairs) => HostValue::Map(
                pairs
                    .iter()
                    .map(|(k, v)| (outtake(heap, k), outtake(heap, v)))
                    .collect(),
            ),
            HeapData::Function(_) => {
                heap.inc_ref(*id);
                HostValue::Function(FunctionRef(*id))
            }
            HeapData::Class(_) => {
                heap.inc_ref(*id);
                HostValue::Class(ClassRef(*id))
            }
            HeapData::Object(_) => {
                heap.inc_ref(*id);
                HostValue::Object(ObjectRef(*id))
            }
            HeapData::Future(_) => {
                heap.inc_ref(*id);
                HostValue::Future(FutureRef(*id))
            }
            HeapData::Exception(e) => HostValue::Exception(ExceptionData {
                message: e.message.clone(),
                label: e.label.clone(),
                code: e.code,
                stacktrace: e.stacktrace.clone(),
                attached: e.attached.as_ref().map(|inner| Box::new(outtake(heap, inner))),
            }),
            HeapData::Throwable(t) => HostValue::Throwable(Box::new(outtake(heap, &t.inner))),
        },
        #[cfg(feature = "ref-count-panic")]
        Value::Dereferenced => HostValue::Null,
    }
}

/// Releases every counted share a boundary value owns. Plain data is a
/// no-op; containers recurse.
pub(crate) fn release(heap: &mut Heap, host: HostValue) {
    match host {
        HostValue::Array(items) => {
            for item in items {
                release(heap, item);
            }
        }
        HostValue::Map(pairs) => {
            for (k, v) in pairs {
                release(heap, k);
                release(heap, v);
            }
        }
        HostValue::Function(FunctionRef(id))
        | HostValue::Class(ClassRef(id))
        | HostValue::Object(ObjectRef(id))
        | HostValue::Future(FutureRef(id)) => heap.dec_ref(id),
        HostValue::Exception(data) => {
            if let Some(attached) = data.attached {
                release(heap, *attached);
            }
        }
        HostValue::Throwable(inner) => release(heap, *inner),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_sorts_round_trip_without_heap_residue() {
        let mut heap = Heap::new();
        let host = HostValue::Array(vec![
            HostValue::Int(1),
            HostValue::Str("two".to_string()),
            HostValue::Map(vec![(HostValue::Str("k".to_string()), HostValue::Double(3.0))]),
        ]);
        let value = intake(&mut heap, host);
        let back = outtake(&heap, &value);
        let HostValue::Array(items) = &back else { panic!() };
        assert_eq!(items[0], HostValue::Int(1));
        assert_eq!(items[1].as_str(), Some("two"));
        value.drop_with_heap(&mut heap);
        release(&mut heap, back);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn entity_refs_own_one_share() {
        let mut heap = Heap::new();
        let fun = heap.new_function(crate::function::Function::new(
            "f",
            crate::signature::Signature::new(),
            Box::new(Inert),
        ));
        let id = fun.ref_id().unwrap();
        let host = outtake(&heap, &fun);
        assert_eq!(heap.refcount(id), 2);
        assert!(matches!(host, HostValue::Function(_)));
        release(&mut heap, host);
        assert_eq!(heap.refcount(id), 1);
        fun.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn throwable_outtake_carries_exception_data() {
        let mut heap = Heap::new();
        let throwable = crate::exceptions::throwable_from(
            &mut heap,
            Exception::new("ValueError", "x").with_code(7),
        );
        let host = outtake(&heap, &throwable);
        assert!(host.is_throwable());
        let data = host.throwable_exception().unwrap();
        assert_eq!(data.label, "ValueError");
        assert_eq!(data.message, "x");
        assert_eq!(data.code, 7);
        throwable.drop_with_heap(&mut heap);
        release(&mut heap, host);
        assert_eq!(heap.stats().live_objects, 0);
    }

    struct Inert;

    impl crate::function::FunctionBackend for Inert {
        fn invoke(&self, heap: &mut Heap, args: Vec<Value>) -> Result<Value, Exception> {
            crate::function::release_args(heap, args);
            Ok(Value::Null)
        }
    }
}
