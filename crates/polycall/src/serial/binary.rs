//! The compact binary wire format.
//!
//! Rides the shared [`WireValue`] tree through postcard. Unlike JSON it
//! preserves every sort exactly (floats stay floats, longs stay longs,
//! chars stay chars), so it is the format of choice for host-to-host
//! transport between two runtimes. The forbidden sorts collapse to the same
//! tag strings as every other format.
//!
//! [`WireValue`]: super::WireValue

use crate::{heap::Heap, value::Value};

use super::{Serial, SerialError, wire_decode, wire_encode};

pub struct BinarySerial;

impl Serial for BinarySerial {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn extension(&self) -> &'static str {
        "bin"
    }

    fn serialize(&self, heap: &Heap, value: &Value) -> Result<Vec<u8>, SerialError> {
        let wire = wire_encode(heap, value);
        postcard::to_allocvec(&wire).map_err(|err| SerialError::Encode(err.to_string()))
    }

    fn deserialize(&self, heap: &mut Heap, bytes: &[u8]) -> Result<Value, SerialError> {
        let wire = postcard::from_bytes(bytes).map_err(|err| SerialError::Decode(err.to_string()))?;
        Ok(wire_decode(heap, wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueId;

    fn roundtrip(heap: &mut Heap, value: &Value) -> Value {
        let serial = BinarySerial;
        let bytes = serial.serialize(heap, value).unwrap();
        serial.deserialize(heap, &bytes).unwrap()
    }

    #[test]
    fn every_numeric_sort_survives_exactly() {
        let mut heap = Heap::new();
        for value in [
            Value::Short(-7),
            Value::Int(42),
            Value::Long(1 << 60),
            Value::Float(1.5),
            Value::Double(2.25),
            Value::Char('λ'),
            Value::Bool(true),
        ] {
            let id = value.value_id(&heap);
            let back = roundtrip(&mut heap, &value);
            assert_eq!(back.value_id(&heap), id, "sort drifted for {value:?}");
        }
        assert_eq!(roundtrip(&mut heap, &Value::Long(1 << 60)).as_long(), Some(1 << 60));
        assert_eq!(roundtrip(&mut heap, &Value::Float(1.5)).as_float(), Some(1.5));
    }

    #[test]
    fn composite_graphs_round_trip() {
        let mut heap = Heap::new();
        let s = heap.new_string("nested");
        let key = heap.new_string("k");
        let inner = heap.new_array(vec![s, Value::Int(1)]);
        let map = heap.new_map(vec![(key, inner)]);
        let back = roundtrip(&mut heap, &map);
        assert_eq!(back.value_id(&heap), ValueId::Map);
        let pairs = back.as_map(&heap).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1.count(&heap), 2);
        map.drop_with_heap(&mut heap);
        back.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn malformed_bytes_report_decode_errors() {
        let mut heap = Heap::new();
        let err = BinarySerial.deserialize(&mut heap, &[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, SerialError::Decode(_)));
    }
}
