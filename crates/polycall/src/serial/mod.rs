//! Pluggable codecs between value graphs and byte buffers.
//!
//! A [`Serial`] turns a heap value into a structurally independent byte
//! buffer and back. Callables, classes, objects, futures, and pointers are
//! forbidden on the wire: they encode as their opaque tag strings
//! (`"[Function]"`, `"[Class]"`, ...) and decode back as plain strings, so
//! deserialization never resolves foreign entities.
//!
//! Two formats ship with the core: `json` (the reference format, also the
//! introspection wire) and `binary` (a compact postcard encoding that
//! preserves every sort exactly).

pub mod binary;
pub mod json;

use std::fmt;

use indexmap::IndexMap;

use crate::{
    heap::{Heap, HeapData},
    value::Value,
};

/// Opaque-kind wire tags shared by every format.
pub(crate) const TAG_FUNCTION: &str = "[Function]";
pub(crate) const TAG_CLASS: &str = "[Class]";
pub(crate) const TAG_OBJECT: &str = "[Object]";
pub(crate) const TAG_FUTURE: &str = "[Future]";
pub(crate) const TAG_PTR: &str = "[Ptr]";

/// Encoding/decoding failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
            Self::Decode(msg) => write!(f, "decode failed: {msg}"),
        }
    }
}

impl std::error::Error for SerialError {}

/// One wire format.
pub trait Serial: Send + Sync {
    /// Registry name, e.g. `"json"`.
    fn name(&self) -> &'static str;

    /// Customary file extension, without the dot.
    fn extension(&self) -> &'static str;

    /// Encodes a value graph into a fresh buffer. The graph is only read.
    fn serialize(&self, heap: &Heap, value: &Value) -> Result<Vec<u8>, SerialError>;

    /// Decodes a buffer into a freshly allocated value graph owned by the
    /// caller.
    fn deserialize(&self, heap: &mut Heap, bytes: &[u8]) -> Result<Value, SerialError>;
}

/// Directory of wire formats keyed by name.
pub struct SerialRegistry {
    formats: IndexMap<String, Box<dyn Serial>>,
}

impl Default for SerialRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl SerialRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            formats: IndexMap::new(),
        }
    }

    /// A registry with the built-in formats registered.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(json::JsonSerial));
        registry.register(Box::new(binary::BinarySerial));
        registry
    }

    pub fn register(&mut self, serial: Box<dyn Serial>) {
        self.formats.insert(serial.name().to_string(), serial);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Serial> {
        self.formats.get(name).map(AsRef::as_ref)
    }

    /// Registered format names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formats.keys().map(String::as_str)
    }
}

/// Intermediate self-describing wire tree. The binary format serializes
/// this directly; it also documents the single shape every format agrees
/// on for the forbidden sorts (a plain string tag).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub(crate) enum WireValue {
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
    Array(Vec<WireValue>),
    Map(Vec<(WireValue, WireValue)>),
    Exception {
        message: String,
        label: String,
        code: i64,
        stacktrace: String,
    },
    Throwable(Box<WireValue>),
}

/// Lowers a heap value into the wire tree, producing a structurally
/// independent copy. Opaque sorts collapse to tag strings.
pub(crate) fn wire_encode(heap: &Heap, value: &Value) -> WireValue {
    match value {
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Char(c) => WireValue::Char(*c),
        Value::Short(s) => WireValue::Short(*s),
        Value::Int(i) => WireValue::Int(*i),
        Value::Long(l) => WireValue::Long(*l),
        Value::Float(x) => WireValue::Float(*x),
        Value::Double(x) => WireValue::Double(*x),
        Value::Ptr(_) => WireValue::Str(TAG_PTR.to_string()),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => WireValue::Str(s.clone()),
            HeapData::Buffer(b) => WireValue::Buffer(b.clone()),
            HeapData::Array(items) => WireValue::Array(items.iter().map(|item| wire_encode(heap, item)).collect()),
            HeapData::Map(pairs) => WireValue::Map(
                pairs
                    .iter()
                    .map(|(k, v)| (wire_encode(heap, k), wire_encode(heap, v)))
                    .collect(),
            ),
            HeapData::Function(_) => WireValue::Str(TAG_FUNCTION.to_string()),
            HeapData::Class(_) => WireValue::Str(TAG_CLASS.to_string()),
            HeapData::Object(_) => WireValue::Str(TAG_OBJECT.to_string()),
            HeapData::Future(_) => WireValue::Str(TAG_FUTURE.to_string()),
            HeapData::Exception(e) => WireValue::Exception {
                message: e.message.clone(),
                label: e.label.clone(),
                code: e.code,
                stacktrace: e.stacktrace.clone(),
            },
            HeapData::Throwable(t) => WireValue::Throwable(Box::new(wire_encode(heap, &t.inner))),
        },
        #[cfg(feature = "ref-count-panic")]
        Value::Dereferenced => WireValue::Null,
    }
}

/// Raises a wire tree into freshly allocated heap values.
pub(crate) fn wire_decode(heap: &mut Heap, wire: WireValue) -> Value {
    match wire {
        WireValue::Null => Value::Null,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Char(c) => Value::Char(c),
        WireValue::Short(s) => Value::Short(s),
        WireValue::Int(i) => Value::Int(i),
        WireValue::Long(l) => Value::Long(l),
        WireValue::Float(x) => Value::Float(x),
        WireValue::Double(x) => Value::Double(x),
        WireValue::Str(s) => heap.new_string(s),
        WireValue::Buffer(b) => heap.new_buffer(b),
        WireValue::Array(items) => {
            let values: Vec<Value> = items.into_iter().map(|item| wire_decode(heap, item)).collect();
            heap.new_array(values)
        }
        WireValue::Map(pairs) => {
            let pairs: Vec<(Value, Value)> = pairs
                .into_iter()
                .map(|(k, v)| (wire_decode(heap, k), wire_decode(heap, v)))
                .collect();
            heap.new_map(pairs)
        }
        WireValue::Exception {
            message,
            label,
            code,
            stacktrace,
        } => {
            let exception = crate::exceptions::Exception::new(label, message)
                .with_code(code)
                .with_stacktrace(stacktrace);
            heap.new_exception(exception)
        }
        WireValue::Throwable(inner) => {
            let inner = wire_decode(heap, *inner);
            heap.new_throwable(inner)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_json_and_binary() {
        let registry = SerialRegistry::with_builtin();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["json", "binary"]);
        assert_eq!(registry.get("json").unwrap().extension(), "json");
        assert!(registry.get("msgpack").is_none());
    }

    #[test]
    fn wire_encoding_is_structurally_independent() {
        let mut heap = Heap::new();
        let inner = heap.new_string("payload");
        let array = heap.new_array(vec![inner, Value::Int(1)]);
        let wire = wire_encode(&heap, &array);
        // Mutating the source after encoding must not affect the wire copy.
        array.drop_with_heap(&mut heap);
        assert_eq!(
            wire,
            WireValue::Array(vec![WireValue::Str("payload".to_string()), WireValue::Int(1)])
        );
        let decoded = wire_decode(&mut heap, wire);
        assert_eq!(decoded.as_array(&heap).unwrap().len(), 2);
        decoded.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn forbidden_sorts_collapse_to_tags() {
        let mut heap = Heap::new();
        let fun = heap.new_function(crate::function::Function::new(
            "f",
            crate::signature::Signature::new(),
            Box::new(InertFn),
        ));
        assert_eq!(wire_encode(&heap, &fun), WireValue::Str(TAG_FUNCTION.to_string()));
        assert_eq!(wire_encode(&heap, &Value::Ptr(0x10)), WireValue::Str(TAG_PTR.to_string()));
        fun.drop_with_heap(&mut heap);
    }

    struct InertFn;

    impl crate::function::FunctionBackend for InertFn {
        fn invoke(&self, heap: &mut Heap, args: Vec<Value>) -> Result<Value, crate::exceptions::Exception> {
            crate::function::release_args(heap, args);
            Ok(Value::Null)
        }
    }
}
