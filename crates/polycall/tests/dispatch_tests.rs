//! End-to-end dispatcher scenarios against the mock loader: loading,
//! calling, transparent awaiting, throwable propagation, class lifecycle,
//! and handle isolation.

use std::sync::Arc;

use polycall::{Configuration, HostValue, Runtime, ValueId, tracer::NoopTracer};

fn runtime() -> Runtime {
    Runtime::initialize_with(Configuration::default(), Arc::new(NoopTracer))
}

const MANIFEST: &[u8] = br#"
fn add(a: int, b: int) -> int = sum
async fn hello() -> string = "world"
fn boom() = raise ValueError x
fn greet(who: string) -> string = concat
fn collect(...) -> string = concat
fn weird(w: Widget) -> int = sum

class Point(x: double, y: double)
  attr x: double
  attr y: double
  method distance() -> double = norm
  static method origin() -> string = "0,0"
end
"#;

/// Loading a script and calling a pure function returns the declared sort.
#[test]
fn load_and_call_a_pure_function() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "scenario", MANIFEST).unwrap();
    let result = runtime
        .call("add", vec![HostValue::Int(2), HostValue::Int(3)])
        .unwrap();
    assert_eq!(result.value_id(), ValueId::Int);
    assert_eq!(result.as_int(), Some(5));
}

/// Calling an asynchronous function through the synchronous entry point
/// transparently drives the loader's event loop to completion.
#[test]
fn async_call_via_sync_dispatcher() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "scenario", MANIFEST).unwrap();
    let result = runtime.call("hello", vec![]).unwrap();
    assert_eq!(result.value_id(), ValueId::String);
    assert_eq!(result.as_str(), Some("world"));
}

/// Guest exceptions come back as throwable values, never as Err.
#[test]
fn throwable_propagation() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "scenario", MANIFEST).unwrap();
    let result = runtime.call("boom", vec![]).unwrap();
    assert_eq!(result.value_id(), ValueId::Throwable);
    let exception = result.throwable_exception().unwrap();
    assert_eq!(exception.message, "x");
    assert_eq!(exception.label, "ValueError");
}

/// Arguments are coerced against the signature: longs narrow to int slots,
/// numeric strings parse.
#[test]
fn argument_coercion_follows_the_signature() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "scenario", MANIFEST).unwrap();
    let result = runtime
        .call("add", vec![HostValue::Long(40), HostValue::Str("2".to_string())])
        .unwrap();
    assert_eq!(result.as_int(), Some(42));
}

/// Signatures still carrying unresolved (invalid) types are refused with a
/// TypeError throwable, unless the function is variadic.
#[test]
fn invalid_slots_refused_unless_variadic() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "scenario", MANIFEST).unwrap();
    let result = runtime.call("weird", vec![HostValue::Int(1)]).unwrap();
    assert_eq!(result.value_id(), ValueId::Throwable);
    assert_eq!(result.throwable_exception().unwrap().label, "TypeError");

    let result = runtime
        .call("collect", vec![HostValue::Int(1), HostValue::Str("x".to_string())])
        .unwrap();
    assert_eq!(result.as_str(), Some("1x"));
}

/// Construct a class, call a method, and verify the object releases its
/// share of the class on release.
#[test]
fn class_lifecycle() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "scenario", MANIFEST).unwrap();
    let before = runtime.heap_stats().live_objects;

    let constructed = runtime
        .call("Point", vec![HostValue::Int(3), HostValue::Int(4)])
        .unwrap();
    let HostValue::Object(point) = &constructed else {
        panic!("constructing a class must yield an object, got {constructed:?}");
    };
    let distance = runtime.call_method(point, "distance", vec![]).unwrap();
    assert_eq!(distance.value_id(), ValueId::Double);
    assert_eq!(distance.as_double(), Some(5.0));

    let x = runtime.get_attribute(point, "x").unwrap();
    assert_eq!(x.as_double(), Some(3.0));
    runtime.set_attribute(point, "x", HostValue::Double(6.0)).unwrap();
    let x = runtime.get_attribute(point, "x").unwrap();
    assert_eq!(x.as_double(), Some(6.0));

    // Undeclared attributes are refused under the static accessor mode.
    let refused = runtime.get_attribute(point, "z").unwrap();
    assert_eq!(refused.value_id(), ValueId::Throwable);

    runtime.release(constructed);
    assert_eq!(
        runtime.heap_stats().live_objects,
        before,
        "releasing the object must return the heap to its pre-construction shape"
    );
}

/// The `class.method` call path reaches static methods.
#[test]
fn dotted_path_reaches_static_methods() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "scenario", MANIFEST).unwrap();
    let result = runtime.call("Point.origin", vec![]).unwrap();
    assert_eq!(result.as_str(), Some("0,0"));
}

/// The `handle.symbol` call path scopes resolution to one handle.
#[test]
fn dotted_path_reaches_handle_symbols() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "scenario", MANIFEST).unwrap();
    let result = runtime.call("scenario.add", vec![HostValue::Int(1), HostValue::Int(1)]).unwrap();
    assert_eq!(result.as_int(), Some(2));
}

/// Loading the same source twice as private handles produces isolated
/// contexts: redefinitions do not leak and clearing one leaves the other.
#[test]
fn handle_isolation() {
    let runtime = runtime();
    let first = runtime
        .load_from_memory_handle("mock", "iso", b"fn value() -> int = 1")
        .unwrap();
    let second = runtime
        .load_from_memory_handle("mock", "iso", b"fn value() -> int = 2")
        .unwrap();

    let a = runtime.call_with_handle(&first, "value", vec![]).unwrap();
    let b = runtime.call_with_handle(&second, "value", vec![]).unwrap();
    assert_eq!(a.as_int(), Some(1));
    assert_eq!(b.as_int(), Some(2));

    // Private handles are not visible to bare-name resolution.
    assert!(runtime.call("value", vec![]).is_err());

    runtime.clear(&first).unwrap();
    assert!(runtime.call_with_handle(&first, "value", vec![]).is_err());
    let b = runtime.call_with_handle(&second, "value", vec![]).unwrap();
    assert_eq!(b.as_int(), Some(2), "clearing one handle must not invalidate the other");
}

/// Unknown symbols and tags are fatal: Err plus a thread-local message.
#[test]
fn fatal_errors_set_the_thread_local_message() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "scenario", MANIFEST).unwrap();
    let err = runtime.call("nonexistent", vec![]).unwrap_err();
    assert!(err.to_string().contains("nonexistent"));
    assert!(polycall::last_error().unwrap().contains("nonexistent"));

    let err = runtime.load_from_memory("cobol", "x", b"").unwrap_err();
    assert!(err.to_string().contains("cobol"));
    assert!(polycall::last_error().unwrap().contains("cobol"));
}

/// Duplicate public handle names are refused; the first load stays intact.
#[test]
fn duplicate_public_loads_are_refused() {
    let runtime = runtime();
    runtime.load_from_memory("mock", "dup", b"fn value() -> int = 1").unwrap();
    let err = runtime.load_from_memory("mock", "dup", b"fn value() -> int = 2").unwrap_err();
    assert!(err.to_string().contains("dup"));
    let result = runtime.call("value", vec![]).unwrap();
    assert_eq!(result.as_int(), Some(1));
}

/// Composite arguments echo back as structurally equal, independent copies.
#[test]
fn composites_cross_the_boundary_structurally() {
    let runtime = runtime();
    runtime
        .load_from_memory("mock", "echoer", b"fn echo(v: array) -> array = echo")
        .unwrap();
    let result = runtime
        .call(
            "echo",
            vec![HostValue::Array(vec![
                HostValue::Int(1),
                HostValue::Str("two".to_string()),
                HostValue::Array(vec![HostValue::Bool(true)]),
            ])],
        )
        .unwrap();
    let HostValue::Array(items) = &result else { panic!("expected array") };
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_int(), Some(1));
    assert_eq!(items[1].as_str(), Some("two"));
    runtime.release(result);
}
