//! Introspection and the RPC round trip: the inspect document serializes
//! to JSON, travels as bytes, and deserializes back into a value graph
//! whose structure matches the registered functions verbatim.

use std::sync::Arc;

use polycall::{Configuration, HostValue, Runtime, ValueId, tracer::NoopTracer};

fn runtime() -> Runtime {
    Runtime::initialize_with(Configuration::default(), Arc::new(NoopTracer))
}

const MANIFEST: &[u8] = br#"
fn add(a: int, b: int) -> int = sum
async fn hello() -> string = "world"

class Point(x: double, y: double)
  attr x: double
  method distance() -> double = norm
end
"#;

/// Looks up a string key in a deserialized map graph.
fn get<'a>(value: &'a HostValue, key: &str) -> Option<&'a HostValue> {
    let HostValue::Map(pairs) = value else { return None };
    pairs
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn items(value: &HostValue) -> &[HostValue] {
    let HostValue::Array(items) = value else { panic!("expected array, got {value:?}") };
    items
}

#[test]
fn typed_document_matches_the_loaded_surface() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "api", MANIFEST).unwrap();
    let doc = runtime.inspect().unwrap();
    let handles = doc.get("mock").unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].name, "api");
    let scope = &handles[0].scope;
    assert_eq!(scope.name, "api");
    assert_eq!(scope.funcs.len(), 2);
    assert_eq!(scope.classes.len(), 1);
    assert_eq!(scope.classes[0].name, "Point");
    assert_eq!(scope.classes[0].constructors.len(), 1);
    assert_eq!(scope.classes[0].methods.len(), 1);
    assert!(scope.classes[0].attributes.contains_key("x"));
}

/// The wire form parses back into a graph with the function names,
/// signatures, and numerically stable type ids intact.
#[test]
fn inspect_round_trips_through_the_serial_bridge() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "api", MANIFEST).unwrap();
    let json = runtime.inspect_json().unwrap();

    let graph = runtime.deserialize("json", json.as_bytes()).unwrap();
    let handles = items(get(&graph, "mock").expect("tag entry"));
    assert_eq!(handles.len(), 1);
    let handle = &handles[0];
    assert_eq!(get(handle, "name").unwrap().as_str(), Some("api"));

    let scope = get(handle, "scope").expect("scope");
    let funcs = items(get(scope, "funcs").expect("funcs"));
    assert_eq!(funcs.len(), 2);

    let add = funcs
        .iter()
        .find(|f| get(f, "name").unwrap().as_str() == Some("add"))
        .expect("add present");
    assert_eq!(get(add, "async").unwrap().as_bool(), Some(false));
    let signature = get(add, "signature").unwrap();
    let args = items(get(signature, "args").unwrap());
    assert_eq!(args.len(), 2);
    let first_ty = get(&args[0], "type").expect("arg type");
    assert_eq!(get(first_ty, "name").unwrap().as_str(), Some("int"));
    assert_eq!(
        get(first_ty, "id").unwrap().as_int(),
        Some(i32::from(ValueId::Int as u8)),
        "type ids on the wire are the stable discriminants"
    );
    let ret = get(signature, "ret").expect("return type");
    assert_eq!(get(ret, "id").unwrap().as_int(), Some(i32::from(ValueId::Int as u8)));

    let hello = funcs
        .iter()
        .find(|f| get(f, "name").unwrap().as_str() == Some("hello"))
        .expect("hello present");
    assert_eq!(get(hello, "async").unwrap().as_bool(), Some(true));
    let hello_ret = get(get(hello, "signature").unwrap(), "ret").unwrap();
    assert_eq!(
        get(hello_ret, "id").unwrap().as_int(),
        Some(i32::from(ValueId::String as u8))
    );
}

/// Private handles stay out of the public document.
#[test]
fn private_handles_are_not_inspectable() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "shown", b"fn a() -> int = 1").unwrap();
    let hidden = runtime
        .load_from_memory_handle("mock", "hidden", b"fn b() -> int = 2")
        .unwrap();
    let doc = runtime.inspect().unwrap();
    let handles = doc.get("mock").unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].name, "shown");
    runtime.clear(&hidden).unwrap();
}
