//! The JSON wire format (reference implementation).
//!
//! Mapping:
//! - bool → `true`/`false`, numerics → JSON numbers (longs outside the
//!   exact-double range are emitted as strings to survive 53-bit parsers;
//!   chars and floats come back as strings and doubles respectively)
//! - string → JSON string, buffer → `{"data": [..], "length": N}`
//! - array → JSON array; map → JSON object when every key is a string,
//!   otherwise a JSON array of 2-element arrays
//! - exception → `{"message", "label", "code", "stacktrace"}`,
//!   throwable → `{"ExceptionThrown": <inner>}`
//! - function/class/object/future/pointer → their tag strings, which decode
//!   back as plain strings
//! - null → `null`; non-finite floats have no JSON form and encode as null

use serde_json::{Map as JsonMap, Number, Value as Json};

use crate::{
    heap::{Heap, HeapData},
    value::Value,
};

use super::{Serial, SerialError, TAG_CLASS, TAG_FUNCTION, TAG_FUTURE, TAG_OBJECT, TAG_PTR};

/// Longs beyond ±2^53 cannot survive a double-only JSON parser.
const EXACT_DOUBLE_RANGE: i64 = 1 << 53;

const THROWABLE_KEY: &str = "ExceptionThrown";

pub struct JsonSerial;

impl Serial for JsonSerial {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extension(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, heap: &Heap, value: &Value) -> Result<Vec<u8>, SerialError> {
        let json = encode(heap, value);
        serde_json::to_vec(&json).map_err(|err| SerialError::Encode(err.to_string()))
    }

    fn deserialize(&self, heap: &mut Heap, bytes: &[u8]) -> Result<Value, SerialError> {
        let json: Json = serde_json::from_slice(bytes).map_err(|err| SerialError::Decode(err.to_string()))?;
        Ok(decode(heap, json))
    }
}

fn float_number(x: f64) -> Json {
    Number::from_f64(x).map_or(Json::Null, Json::Number)
}

/// Lowers a heap value into a `serde_json` tree.
pub(crate) fn encode(heap: &Heap, value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Char(c) => Json::String(c.to_string()),
        Value::Short(s) => Json::Number(Number::from(*s)),
        Value::Int(i) => Json::Number(Number::from(*i)),
        Value::Long(l) => {
            if l.unsigned_abs() > EXACT_DOUBLE_RANGE.unsigned_abs() {
                Json::String(l.to_string())
            } else {
                Json::Number(Number::from(*l))
            }
        }
        Value::Float(x) => float_number(f64::from(*x)),
        Value::Double(x) => float_number(*x),
        Value::Ptr(_) => Json::String(TAG_PTR.to_string()),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Str(s) => Json::String(s.clone()),
            HeapData::Buffer(bytes) => {
                let mut object = JsonMap::new();
                object.insert(
                    "data".to_string(),
                    Json::Array(bytes.iter().map(|b| Json::Number(Number::from(*b))).collect()),
                );
                object.insert("length".to_string(), Json::Number(Number::from(bytes.len())));
                Json::Object(object)
            }
            HeapData::Array(items) => Json::Array(items.iter().map(|item| encode(heap, item)).collect()),
            HeapData::Map(pairs) => {
                let all_string_keys = pairs.iter().all(|(key, _)| key.as_str(heap).is_some());
                if all_string_keys {
                    let mut object = JsonMap::new();
                    for (key, val) in pairs {
                        let key = key.as_str(heap).expect("checked above").to_string();
                        object.insert(key, encode(heap, val));
                    }
                    Json::Object(object)
                } else {
                    Json::Array(
                        pairs
                            .iter()
                            .map(|(key, val)| Json::Array(vec![encode(heap, key), encode(heap, val)]))
                            .collect(),
                    )
                }
            }
            HeapData::Function(_) => Json::String(TAG_FUNCTION.to_string()),
            HeapData::Class(_) => Json::String(TAG_CLASS.to_string()),
            HeapData::Object(_) => Json::String(TAG_OBJECT.to_string()),
            HeapData::Future(_) => Json::String(TAG_FUTURE.to_string()),
            HeapData::Exception(e) => {
                let mut object = JsonMap::new();
                object.insert("message".to_string(), Json::String(e.message.clone()));
                object.insert("label".to_string(), Json::String(e.label.clone()));
                object.insert("code".to_string(), Json::Number(Number::from(e.code)));
                object.insert("stacktrace".to_string(), Json::String(e.stacktrace.clone()));
                Json::Object(object)
            }
            HeapData::Throwable(t) => {
                let mut object = JsonMap::new();
                object.insert(THROWABLE_KEY.to_string(), encode(heap, &t.inner));
                Json::Object(object)
            }
        },
        #[cfg(feature = "ref-count-panic")]
        Value::Dereferenced => Json::Null,
    }
}

fn is_buffer_shape(object: &JsonMap<String, Json>) -> bool {
    object.len() == 2
        && object.get("length").is_some_and(Json::is_u64)
        && object
            .get("data")
            .and_then(Json::as_array)
            .is_some_and(|data| data.iter().all(Json::is_u64))
}

fn is_exception_shape(object: &JsonMap<String, Json>) -> bool {
    object.len() == 4
        && object.get("message").is_some_and(Json::is_string)
        && object.get("label").is_some_and(Json::is_string)
        && object.get("code").is_some_and(Json::is_i64)
        && object.get("stacktrace").is_some_and(Json::is_string)
}

/// Raises a `serde_json` tree into freshly allocated heap values.
///
/// The structured shapes (buffer, exception, throwable) are recognized by
/// their fixed key sets; any other object becomes a string-keyed map.
pub(crate) fn decode(heap: &mut Heap, json: Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(number) => {
            if let Some(i) = number.as_i64() {
                if let Ok(int) = i32::try_from(i) {
                    Value::Int(int)
                } else {
                    Value::Long(i)
                }
            } else {
                Value::Double(number.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => heap.new_string(s),
        Json::Array(items) => {
            let values: Vec<Value> = items.into_iter().map(|item| decode(heap, item)).collect();
            heap.new_array(values)
        }
        Json::Object(mut object) => {
            if object.len() == 1
                && let Some(inner) = object.remove(THROWABLE_KEY)
            {
                let inner = decode(heap, inner);
                return heap.new_throwable(inner);
            }
            if is_buffer_shape(&object) {
                let data = object.remove("data").expect("checked above");
                let bytes: Vec<u8> = data
                    .as_array()
                    .expect("checked above")
                    .iter()
                    .filter_map(Json::as_u64)
                    .map(|b| u8::try_from(b).unwrap_or(u8::MAX))
                    .collect();
                return heap.new_buffer(bytes);
            }
            if is_exception_shape(&object) {
                let text = |key: &str| {
                    object
                        .get(key)
                        .and_then(Json::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                let exception = crate::exceptions::Exception::new(text("label"), text("message"))
                    .with_code(object.get("code").and_then(Json::as_i64).unwrap_or(0))
                    .with_stacktrace(text("stacktrace"));
                return heap.new_exception(exception);
            }
            let pairs: Vec<(Value, Value)> = object
                .into_iter()
                .map(|(key, val)| {
                    let key = heap.new_string(key);
                    let val = decode(heap, val);
                    (key, val)
                })
                .collect();
            heap.new_map(pairs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueId;

    fn roundtrip(heap: &mut Heap, value: &Value) -> Value {
        let serial = JsonSerial;
        let bytes = serial.serialize(heap, value).unwrap();
        serial.deserialize(heap, &bytes).unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        let mut heap = Heap::new();
        let back = roundtrip(&mut heap, &Value::Int(42));
        assert_eq!(back.as_int(), Some(42));
        let back = roundtrip(&mut heap, &Value::Bool(true));
        assert_eq!(back.as_bool(), Some(true));
        let back = roundtrip(&mut heap, &Value::Double(1.5));
        assert_eq!(back.as_double(), Some(1.5));
        let back = roundtrip(&mut heap, &Value::Null);
        assert_eq!(back.value_id(&heap), ValueId::Null);
    }

    #[test]
    fn big_longs_are_emitted_as_strings() {
        let heap = Heap::new();
        let json = encode(&heap, &Value::Long(1 << 60));
        assert_eq!(json, Json::String((1i64 << 60).to_string()));
        // In-range longs stay numbers.
        let json = encode(&heap, &Value::Long(1 << 40));
        assert!(json.is_number());
    }

    #[test]
    fn buffers_use_the_data_length_shape() {
        let mut heap = Heap::new();
        let buffer = heap.new_buffer(vec![1, 2, 3]);
        let json = encode(&heap, &buffer);
        assert_eq!(json["length"], 3);
        assert_eq!(json["data"][1], 2);
        let back = roundtrip(&mut heap, &buffer);
        assert_eq!(back.as_buffer(&heap), Some(&[1u8, 2, 3][..]));
        buffer.drop_with_heap(&mut heap);
        back.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn string_keyed_maps_become_objects() {
        let mut heap = Heap::new();
        let key = heap.new_string("answer");
        let map = heap.new_map(vec![(key, Value::Int(42))]);
        let json = encode(&heap, &map);
        assert!(json.is_object());
        assert_eq!(json["answer"], 42);
        let back = roundtrip(&mut heap, &map);
        assert_eq!(back.value_id(&heap), ValueId::Map);
        map.drop_with_heap(&mut heap);
        back.drop_with_heap(&mut heap);
    }

    #[test]
    fn non_string_keyed_maps_become_pair_arrays() {
        let mut heap = Heap::new();
        let map = heap.new_map(vec![(Value::Int(1), Value::Bool(true))]);
        let json = encode(&heap, &map);
        assert_eq!(json, serde_json::json!([[1, true]]));
        map.drop_with_heap(&mut heap);
    }

    #[test]
    fn throwable_round_trips_through_the_wrapper_shape() {
        let mut heap = Heap::new();
        let throwable = crate::exceptions::throwable_from(
            &mut heap,
            crate::exceptions::Exception::new("ValueError", "boom").with_code(3),
        );
        let json = encode(&heap, &throwable);
        assert_eq!(json["ExceptionThrown"]["label"], "ValueError");
        let back = roundtrip(&mut heap, &throwable);
        assert_eq!(back.value_id(&heap), ValueId::Throwable);
        throwable.drop_with_heap(&mut heap);
        back.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn functions_decode_back_as_tag_strings() {
        let mut heap = Heap::new();
        let fun = heap.new_function(crate::function::Function::new(
            "f",
            crate::signature::Signature::new(),
            Box::new(InertFn),
        ));
        let back = roundtrip(&mut heap, &fun);
        assert_eq!(back.as_str(&heap), Some(TAG_FUNCTION));
        fun.drop_with_heap(&mut heap);
        back.drop_with_heap(&mut heap);
    }

    struct InertFn;

    impl crate::function::FunctionBackend for InertFn {
        fn invoke(&self, heap: &mut Heap, args: Vec<Value>) -> Result<Value, crate::exceptions::Exception> {
            crate::function::release_args(heap, args);
            Ok(Value::Null)
        }
    }
}
