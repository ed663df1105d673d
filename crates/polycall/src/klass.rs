//! Class and object reflection entities.
//!
//! A [`Class`] records what a loader discovered about a guest class: its
//! constructors, method overloads, and declared attributes, plus the backend
//! that actually talks to the guest runtime. An [`Instance`] is one
//! constructed object; it holds a counted reference to its class, so a class
//! released by its scope stays alive until the last object dies.
//!
//! Methods refer to their owning class by name only. The ownership tree must
//! stay acyclic; a counted back-reference from method to class would leak
//! the whole cluster.

use indexmap::IndexMap;

use crate::{
    exceptions::Exception,
    function::AsyncStart,
    future::{CallTicket, Future, PendingFutures, SettleFn},
    heap::{Heap, HeapData, HeapId, drain_value},
    signature::{Signature, SignatureMatch},
    types::Type,
    value::{Value, ValueId},
};

/// Member visibility reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr, serde::Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

/// How attribute names are validated on access.
///
/// `Static` requires attributes to be declared before get/set; `Dynamic`
/// forwards arbitrary names to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr, serde::Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum AccessorMode {
    Static,
    Dynamic,
}

/// A constructor overload.
#[derive(Debug, Clone)]
pub struct Constructor {
    signature: Signature,
    visibility: Visibility,
}

impl Constructor {
    #[must_use]
    pub fn new(signature: Signature, visibility: Visibility) -> Self {
        Self { signature, visibility }
    }

    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }
}

/// One method overload. `class_name` is a weak owner reference by name.
#[derive(Debug, Clone)]
pub struct Method {
    name: Box<str>,
    signature: Signature,
    visibility: Visibility,
    asynchronous: bool,
    class_name: Box<str>,
}

impl Method {
    #[must_use]
    pub fn new(
        name: impl Into<Box<str>>,
        signature: Signature,
        visibility: Visibility,
        class_name: impl Into<Box<str>>,
    ) -> Self {
        Self {
            name: name.into(),
            signature,
            visibility,
            asynchronous: false,
            class_name: class_name.into(),
        }
    }

    #[must_use]
    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    #[must_use]
    pub fn is_async(&self) -> bool {
        self.asynchronous
    }

    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }
}

/// A declared attribute. `default` is owned by the class and released with
/// it; a "static" attribute lives on the class, a member attribute on each
/// object.
#[derive(Debug)]
pub struct Attribute {
    name: Box<str>,
    ty: Option<Type>,
    visibility: Visibility,
    default: Option<Value>,
    class_name: Box<str>,
}

impl Attribute {
    #[must_use]
    pub fn new(
        name: impl Into<Box<str>>,
        ty: Option<Type>,
        visibility: Visibility,
        class_name: impl Into<Box<str>>,
    ) -> Self {
        Self {
            name: name.into(),
            ty,
            visibility,
            default: None,
            class_name: class_name.into(),
        }
    }

    /// Attaches a default value (ownership transferred to the class).
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ty(&self) -> Option<&Type> {
        self.ty.as_ref()
    }

    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    #[must_use]
    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }
}

/// Backend behavior of one class, implemented per loader.
pub trait ClassBackend: Send + Sync {
    /// Constructs a native instance and returns its behavior object.
    fn construct(&self, heap: &mut Heap, ctor: &Constructor, args: &[Value]) -> Result<Box<dyn InstanceBackend>, Exception>;

    /// Reads a static attribute.
    fn static_get(&self, heap: &mut Heap, attr: &str) -> Result<Value, Exception> {
        let _ = heap;
        Err(Exception::type_error(format!("static attribute {attr:?} is not readable")))
    }

    /// Writes a static attribute (ownership of `value` transfers in).
    fn static_set(&self, heap: &mut Heap, attr: &str, value: Value) -> Result<(), Exception> {
        value.drop_with_heap(heap);
        Err(Exception::type_error(format!("static attribute {attr:?} is not writable")))
    }

    /// Invokes a static method (ownership of `args` transfers in).
    fn static_call(&self, heap: &mut Heap, method: &Method, args: Vec<Value>) -> Result<Value, Exception> {
        crate::function::release_args(heap, args);
        Err(Exception::type_error(format!("static method {:?} is not callable", method.name())))
    }

    /// Reports counted heap references held by backend state.
    fn collect_refs(&mut self, out: &mut Vec<HeapId>) {
        let _ = out;
    }
}

/// Backend behavior of one constructed object.
pub trait InstanceBackend: Send + Sync {
    /// Reads an attribute, returning an owned value.
    fn get(&self, heap: &mut Heap, attr: &str) -> Result<Value, Exception>;

    /// Writes an attribute (ownership of `value` transfers in).
    fn set(&mut self, heap: &mut Heap, attr: &str, value: Value) -> Result<(), Exception>;

    /// Invokes a method (ownership of `args` transfers in). The backend
    /// receives the resolved overload descriptor and the raw arguments; it
    /// may coerce per its own type system.
    fn call(&mut self, heap: &mut Heap, method: &Method, args: Vec<Value>) -> Result<Value, Exception>;

    /// Begins an asynchronous method invocation. Defaults to the sync path.
    fn call_async(&mut self, heap: &mut Heap, method: &Method, args: Vec<Value>, ticket: CallTicket) -> AsyncStart {
        let _ = ticket;
        AsyncStart::Ready(self.call(heap, method, args))
    }

    /// Reports counted heap references held by backend state.
    fn collect_refs(&mut self, out: &mut Vec<HeapId>) {
        let _ = out;
    }
}

/// A guest class as discovered by a loader.
pub struct Class {
    name: Box<str>,
    accessor: AccessorMode,
    constructors: Vec<Constructor>,
    methods: IndexMap<String, Vec<Method>>,
    static_methods: IndexMap<String, Vec<Method>>,
    attributes: IndexMap<String, Attribute>,
    static_attributes: IndexMap<String, Attribute>,
    /// Tag of the loader that discovered this class (weak, by name).
    origin: Option<Box<str>>,
    backend: Box<dyn ClassBackend>,
}

impl Class {
    #[must_use]
    pub fn new(name: impl Into<Box<str>>, accessor: AccessorMode, backend: Box<dyn ClassBackend>) -> Self {
        Self {
            name: name.into(),
            accessor,
            constructors: Vec::new(),
            methods: IndexMap::new(),
            static_methods: IndexMap::new(),
            attributes: IndexMap::new(),
            static_attributes: IndexMap::new(),
            origin: None,
            backend,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stamps the loader tag this class was discovered by.
    #[must_use]
    pub fn with_origin(mut self, tag: impl Into<Box<str>>) -> Self {
        self.origin = Some(tag.into());
        self
    }

    /// The tag of the loader that discovered this class, if any.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    #[must_use]
    pub fn accessor(&self) -> AccessorMode {
        self.accessor
    }

    pub fn add_constructor(&mut self, ctor: Constructor) {
        self.constructors.push(ctor);
    }

    pub fn add_method(&mut self, method: Method) {
        self.methods.entry(method.name().to_string()).or_default().push(method);
    }

    pub fn add_static_method(&mut self, method: Method) {
        self.static_methods.entry(method.name().to_string()).or_default().push(method);
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.insert(attribute.name().to_string(), attribute);
    }

    pub fn add_static_attribute(&mut self, attribute: Attribute) {
        self.static_attributes.insert(attribute.name().to_string(), attribute);
    }

    #[must_use]
    pub fn constructors(&self) -> &[Constructor] {
        &self.constructors
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.values().flatten()
    }

    pub fn static_methods(&self) -> impl Iterator<Item = &Method> {
        self.static_methods.values().flatten()
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    pub fn static_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.static_attributes.values()
    }

    /// Constructor resolution: first exact signature match in registration
    /// order, else the first registered constructor (dynamic languages pass
    /// variadically), else `None` when no constructor was declared at all.
    #[must_use]
    pub fn resolve_constructor(&self, args: &[ValueId]) -> Option<usize> {
        for (index, ctor) in self.constructors.iter().enumerate() {
            if ctor.signature.compare(None, args) == SignatureMatch::Exact {
                return Some(index);
            }
        }
        if self.constructors.is_empty() { None } else { Some(0) }
    }

    /// Overload resolution for (static or member) methods: the first exact
    /// match in registration order wins, then the first convertible one.
    /// Registration order makes selection deterministic even for overloads
    /// differing only in argument order.
    fn resolve_overload(table: &IndexMap<String, Vec<Method>>, name: &str, args: &[ValueId]) -> Option<Method> {
        let candidates = table.get(name)?;
        let mut convertible = None;
        for method in candidates {
            match method.signature.compare(None, args) {
                SignatureMatch::Exact => return Some(method.clone()),
                SignatureMatch::Convertible if convertible.is_none() => convertible = Some(method.clone()),
                _ => {}
            }
        }
        convertible
    }

    #[must_use]
    pub fn resolve_method(&self, name: &str, args: &[ValueId]) -> Option<Method> {
        Self::resolve_overload(&self.methods, name, args)
    }

    #[must_use]
    pub fn resolve_static_method(&self, name: &str, args: &[ValueId]) -> Option<Method> {
        Self::resolve_overload(&self.static_methods, name, args)
    }

    /// Validates an attribute name under the class accessor mode.
    fn check_accessor(&self, table: &IndexMap<String, Attribute>, attr: &str) -> Result<(), Exception> {
        match self.accessor {
            AccessorMode::Dynamic => Ok(()),
            AccessorMode::Static if table.contains_key(attr) => Ok(()),
            AccessorMode::Static => Err(Exception::type_error(format!(
                "class {:?} has no declared attribute {attr:?}",
                &*self.name
            ))),
        }
    }

    pub(crate) fn collect_child_ids(&mut self, out: &mut Vec<HeapId>) {
        for attribute in self.attributes.values_mut().chain(self.static_attributes.values_mut()) {
            if let Some(default) = attribute.default.take() {
                drain_value(default, out);
            }
        }
        self.backend.collect_refs(out);
    }
}

/// One constructed object: a counted reference to its class plus the
/// backend wrapping the native instance.
pub struct Instance {
    class: HeapId,
    name: Box<str>,
    backend: Box<dyn InstanceBackend>,
}

impl Instance {
    #[must_use]
    pub fn class_id(&self) -> HeapId {
        self.class
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn collect_child_ids(&mut self, out: &mut Vec<HeapId>) {
        out.push(self.class);
        self.backend.collect_refs(out);
    }
}

/// Constructs an object of the class at `class_id`.
///
/// Resolution: an explicit `ctor_index` wins; otherwise the class picks per
/// [`Class::resolve_constructor`]. A class with no declared constructor at
/// all cannot be constructed; the call fails. The new object takes one
/// counted reference to its class. Arguments are borrowed; the caller keeps
/// them.
pub fn class_new(
    heap: &mut Heap,
    class_id: HeapId,
    instance_name: &str,
    ctor_index: Option<usize>,
    args: &[Value],
) -> Result<Value, Exception> {
    let arg_ids: Vec<ValueId> = args.iter().map(|a| a.value_id(heap)).collect();
    let backend = heap.with_entry_mut(class_id, |heap, data| {
        let HeapData::Class(cls) = data else {
            return Err(Exception::type_error("construct target is not a class"));
        };
        let index = match ctor_index.or_else(|| cls.resolve_constructor(&arg_ids)) {
            Some(index) => index,
            None => {
                return Err(Exception::type_error(format!(
                    "class {:?} does not have any constructor",
                    &*cls.name
                )));
            }
        };
        let Some(ctor) = cls.constructors.get(index) else {
            return Err(Exception::type_error(format!("class {:?} has no constructor #{index}", &*cls.name)));
        };
        cls.backend.construct(heap, ctor, args)
    })?;
    heap.inc_ref(class_id);
    let instance = Instance {
        class: class_id,
        name: instance_name.into(),
        backend,
    };
    Ok(Value::Ref(heap.alloc(HeapData::Object(instance))))
}

fn class_of(heap: &Heap, object_id: HeapId) -> Result<HeapId, Exception> {
    match heap.get(object_id) {
        HeapData::Object(instance) => Ok(instance.class_id()),
        _ => Err(Exception::type_error("target is not an object")),
    }
}

/// Reads an attribute from the object at `object_id`, honoring the class
/// accessor mode.
pub fn object_get(heap: &mut Heap, object_id: HeapId, attr: &str) -> Result<Value, Exception> {
    let class_id = class_of(heap, object_id)?;
    if let HeapData::Class(cls) = heap.get(class_id) {
        cls.check_accessor(&cls.attributes, attr)?;
    }
    heap.with_entry_mut(object_id, |heap, data| {
        let HeapData::Object(instance) = data else {
            return Err(Exception::type_error("target is not an object"));
        };
        instance.backend.get(heap, attr)
    })
}

/// Writes an attribute on the object at `object_id` (ownership of `value`
/// transfers to the backend), honoring the class accessor mode.
pub fn object_set(heap: &mut Heap, object_id: HeapId, attr: &str, value: Value) -> Result<(), Exception> {
    let class_id = match class_of(heap, object_id) {
        Ok(id) => id,
        Err(err) => {
            value.drop_with_heap(heap);
            return Err(err);
        }
    };
    if let HeapData::Class(cls) = heap.get(class_id) {
        if let Err(err) = cls.check_accessor(&cls.attributes, attr) {
            value.drop_with_heap(heap);
            return Err(err);
        }
    }
    heap.with_entry_mut(object_id, |heap, data| {
        let HeapData::Object(instance) = data else {
            value.drop_with_heap(heap);
            return Err(Exception::type_error("target is not an object"));
        };
        instance.backend.set(heap, attr, value)
    })
}

/// Invokes a method on the object at `object_id`, resolving the overload
/// from the argument sorts.
pub fn object_call(heap: &mut Heap, object_id: HeapId, method_name: &str, args: Vec<Value>) -> Result<Value, Exception> {
    let method = match resolve_instance_method(heap, object_id, method_name, &args) {
        Ok(method) => method,
        Err(err) => {
            crate::function::release_args(heap, args);
            return Err(err);
        }
    };
    heap.with_entry_mut(object_id, |heap, data| {
        let HeapData::Object(instance) = data else {
            crate::function::release_args(heap, args);
            return Err(Exception::type_error("target is not an object"));
        };
        instance.backend.call(heap, &method, args)
    })
}

/// Awaits a method on the object at `object_id`: same contract as awaiting a
/// function. Returns the future value.
pub fn object_await(
    heap: &mut Heap,
    object_id: HeapId,
    method_name: &str,
    args: Vec<Value>,
    on_resolve: Option<SettleFn>,
    on_reject: Option<SettleFn>,
    pending: &mut PendingFutures,
) -> Result<Value, Exception> {
    let method = match resolve_instance_method(heap, object_id, method_name, &args) {
        Ok(method) => method,
        Err(err) => {
            crate::function::release_args(heap, args);
            return Err(err);
        }
    };
    let future = heap.new_future(Future::with_callbacks(on_resolve, on_reject));
    let future_id = future.ref_id().expect("freshly allocated future");
    if method.is_async() {
        let ticket = pending.allocate();
        let start = heap.with_entry_mut(object_id, |heap, data| {
            let HeapData::Object(instance) = data else {
                crate::function::release_args(heap, args);
                return AsyncStart::Ready(Err(Exception::type_error("target is not an object")));
            };
            instance.backend.call_async(heap, &method, args, ticket)
        });
        match start {
            AsyncStart::Ready(result) => crate::function::settle_with_result(heap, future_id, result),
            AsyncStart::Scheduled => pending.register(heap, ticket, future_id),
        }
    } else {
        let result = heap.with_entry_mut(object_id, |heap, data| {
            let HeapData::Object(instance) = data else {
                crate::function::release_args(heap, args);
                return Err(Exception::type_error("target is not an object"));
            };
            instance.backend.call(heap, &method, args)
        });
        crate::function::settle_with_result(heap, future_id, result);
    }
    Ok(future)
}

fn resolve_instance_method(heap: &Heap, object_id: HeapId, method_name: &str, args: &[Value]) -> Result<Method, Exception> {
    let class_id = class_of(heap, object_id)?;
    let arg_ids: Vec<ValueId> = args.iter().map(|a| a.value_id(heap)).collect();
    let HeapData::Class(cls) = heap.get(class_id) else {
        return Err(Exception::type_error("object's class is gone"));
    };
    cls.resolve_method(method_name, &arg_ids)
        .ok_or_else(|| Exception::type_error(format!("no overload of {method_name:?} accepts the given arguments")))
}

/// Reads a static attribute of the class at `class_id`.
pub fn class_static_get(heap: &mut Heap, class_id: HeapId, attr: &str) -> Result<Value, Exception> {
    if let HeapData::Class(cls) = heap.get(class_id) {
        cls.check_accessor(&cls.static_attributes, attr)?;
    }
    heap.with_entry_mut(class_id, |heap, data| {
        let HeapData::Class(cls) = data else {
            return Err(Exception::type_error("target is not a class"));
        };
        cls.backend.static_get(heap, attr)
    })
}

/// Writes a static attribute of the class at `class_id`.
pub fn class_static_set(heap: &mut Heap, class_id: HeapId, attr: &str, value: Value) -> Result<(), Exception> {
    if let HeapData::Class(cls) = heap.get(class_id) {
        if let Err(err) = cls.check_accessor(&cls.static_attributes, attr) {
            value.drop_with_heap(heap);
            return Err(err);
        }
    }
    heap.with_entry_mut(class_id, |heap, data| {
        let HeapData::Class(cls) = data else {
            value.drop_with_heap(heap);
            return Err(Exception::type_error("target is not a class"));
        };
        cls.backend.static_set(heap, attr, value)
    })
}

/// Invokes a static method of the class at `class_id`.
pub fn class_static_call(heap: &mut Heap, class_id: HeapId, method_name: &str, args: Vec<Value>) -> Result<Value, Exception> {
    let arg_ids: Vec<ValueId> = args.iter().map(|a| a.value_id(heap)).collect();
    let method = match heap.get(class_id) {
        HeapData::Class(cls) => cls.resolve_static_method(method_name, &arg_ids),
        _ => {
            crate::function::release_args(heap, args);
            return Err(Exception::type_error("target is not a class"));
        }
    };
    let Some(method) = method else {
        crate::function::release_args(heap, args);
        return Err(Exception::type_error(format!(
            "no static overload of {method_name:?} accepts the given arguments"
        )));
    };
    heap.with_entry_mut(class_id, |heap, data| {
        let HeapData::Class(cls) = data else {
            crate::function::release_args(heap, args);
            return Err(Exception::type_error("target is not a class"));
        };
        cls.backend.static_call(heap, &method, args)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Param;

    fn ty(id: ValueId) -> Option<Type> {
        Some(Type::new(id, id.to_string()))
    }

    fn sig(ids: &[ValueId]) -> Signature {
        Signature::from_params(
            ids.iter().enumerate().map(|(i, id)| Param::new(format!("a{i}"), ty(*id))),
            None,
        )
    }

    /// Cartesian point class used across the tests: instances store the two
    /// coordinates handed to the constructor.
    struct PointClassBackend;

    struct PointInstance {
        x: f64,
        y: f64,
    }

    fn as_f64(value: &Value) -> f64 {
        match value {
            Value::Int(i) => f64::from(*i),
            Value::Long(l) => *l as f64,
            Value::Double(d) => *d,
            _ => f64::NAN,
        }
    }

    impl ClassBackend for PointClassBackend {
        fn construct(
            &self,
            _heap: &mut Heap,
            _ctor: &Constructor,
            args: &[Value],
        ) -> Result<Box<dyn InstanceBackend>, Exception> {
            let x = args.first().map_or(0.0, as_f64);
            let y = args.get(1).map_or(0.0, as_f64);
            Ok(Box::new(PointInstance { x, y }))
        }
    }

    impl InstanceBackend for PointInstance {
        fn get(&self, _heap: &mut Heap, attr: &str) -> Result<Value, Exception> {
            match attr {
                "x" => Ok(Value::Double(self.x)),
                "y" => Ok(Value::Double(self.y)),
                other => Err(Exception::type_error(format!("no attribute {other:?}"))),
            }
        }

        fn set(&mut self, heap: &mut Heap, attr: &str, value: Value) -> Result<(), Exception> {
            let number = as_f64(&value);
            value.drop_with_heap(heap);
            match attr {
                "x" => self.x = number,
                "y" => self.y = number,
                other => return Err(Exception::type_error(format!("no attribute {other:?}"))),
            }
            Ok(())
        }

        fn call(&mut self, heap: &mut Heap, method: &Method, args: Vec<Value>) -> Result<Value, Exception> {
            crate::function::release_args(heap, args);
            match method.name() {
                "distance" => Ok(Value::Double(self.x.hypot(self.y))),
                other => Err(Exception::type_error(format!("no method {other:?}"))),
            }
        }
    }

    fn point_class(heap: &mut Heap) -> Value {
        let mut cls = Class::new("Point", AccessorMode::Static, Box::new(PointClassBackend));
        cls.add_constructor(Constructor::new(sig(&[ValueId::Double, ValueId::Double]), Visibility::Public));
        cls.add_constructor(Constructor::new(sig(&[ValueId::Int, ValueId::Int]), Visibility::Public));
        cls.add_method(Method::new("distance", sig(&[]), Visibility::Public, "Point"));
        cls.add_attribute(Attribute::new("x", ty(ValueId::Double), Visibility::Public, "Point"));
        cls.add_attribute(Attribute::new("y", ty(ValueId::Double), Visibility::Public, "Point"));
        heap.new_class(cls)
    }

    #[test]
    fn construct_and_call_method() {
        let mut heap = Heap::new();
        let cls = point_class(&mut heap);
        let class_id = cls.ref_id().unwrap();
        let args = [Value::Int(3), Value::Int(4)];
        let obj = class_new(&mut heap, class_id, "p", None, &args).unwrap();
        let distance = object_call(&mut heap, obj.ref_id().unwrap(), "distance", vec![]).unwrap();
        assert_eq!(distance.as_double(), Some(5.0));
        obj.drop_with_heap(&mut heap);
        cls.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn object_holds_class_reference() {
        let mut heap = Heap::new();
        let cls = point_class(&mut heap);
        let class_id = cls.ref_id().unwrap();
        assert_eq!(heap.refcount(class_id), 1);
        let obj = class_new(&mut heap, class_id, "p", None, &[]).unwrap();
        assert_eq!(heap.refcount(class_id), 2);
        obj.drop_with_heap(&mut heap);
        assert_eq!(heap.refcount(class_id), 1, "object release returns the class share");
        cls.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn class_survives_until_last_object_dies() {
        let mut heap = Heap::new();
        let cls = point_class(&mut heap);
        let class_id = cls.ref_id().unwrap();
        let obj = class_new(&mut heap, class_id, "p", None, &[]).unwrap();
        // The scope releases the class first; the object keeps it alive.
        cls.drop_with_heap(&mut heap);
        assert!(heap.get_if_live(class_id).is_some());
        let x = object_get(&mut heap, obj.ref_id().unwrap(), "x").unwrap();
        assert_eq!(x.as_double(), Some(0.0));
        obj.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0, "dropping the last object drops the class too");
    }

    #[test]
    fn static_accessor_refuses_undeclared_names() {
        let mut heap = Heap::new();
        let cls = point_class(&mut heap);
        let obj = class_new(&mut heap, cls.ref_id().unwrap(), "p", None, &[]).unwrap();
        let err = object_get(&mut heap, obj.ref_id().unwrap(), "z").unwrap_err();
        assert_eq!(err.label, "TypeError");
        let err = object_set(&mut heap, obj.ref_id().unwrap(), "z", Value::Double(1.0)).unwrap_err();
        assert_eq!(err.label, "TypeError");
        obj.drop_with_heap(&mut heap);
        cls.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn attribute_set_then_get_round_trips() {
        let mut heap = Heap::new();
        let cls = point_class(&mut heap);
        let obj = class_new(&mut heap, cls.ref_id().unwrap(), "p", None, &[]).unwrap();
        object_set(&mut heap, obj.ref_id().unwrap(), "x", Value::Double(7.5)).unwrap();
        let x = object_get(&mut heap, obj.ref_id().unwrap(), "x").unwrap();
        assert_eq!(x.as_double(), Some(7.5));
        obj.drop_with_heap(&mut heap);
        cls.drop_with_heap(&mut heap);
    }

    #[test]
    fn constructor_resolution_prefers_exact_then_first() {
        let mut heap = Heap::new();
        let cls = point_class(&mut heap);
        let class_id = cls.ref_id().unwrap();
        let get = |heap: &Heap| match heap.get(class_id) {
            HeapData::Class(c) => c.resolve_constructor(&[ValueId::Int, ValueId::Int]),
            _ => None,
        };
        assert_eq!(get(&heap), Some(1), "exact (int,int) overload wins");
        let fallback = match heap.get(class_id) {
            HeapData::Class(c) => c.resolve_constructor(&[ValueId::String]),
            _ => None,
        };
        assert_eq!(fallback, Some(0), "no match falls back to the first registered constructor");
        cls.drop_with_heap(&mut heap);
    }

    #[test]
    fn overload_selection_is_stable_under_argument_order() {
        let mut heap = Heap::new();
        let mut cls = Class::new("Pair", AccessorMode::Dynamic, Box::new(PointClassBackend));
        cls.add_method(Method::new("make", sig(&[ValueId::Int, ValueId::String]), Visibility::Public, "Pair"));
        cls.add_method(Method::new("make", sig(&[ValueId::String, ValueId::Int]), Visibility::Public, "Pair"));
        let v = heap.new_class(cls);
        let class_id = v.ref_id().unwrap();
        let HeapData::Class(cls) = heap.get(class_id) else { panic!() };
        let a = cls.resolve_method("make", &[ValueId::Int, ValueId::String]).unwrap();
        let b = cls.resolve_method("make", &[ValueId::String, ValueId::Int]).unwrap();
        assert_eq!(a.signature().param(0).unwrap().ty().unwrap().id(), ValueId::Int);
        assert_eq!(b.signature().param(0).unwrap().ty().unwrap().id(), ValueId::String);
        v.drop_with_heap(&mut heap);
    }

    #[test]
    fn class_without_constructors_cannot_be_constructed() {
        let mut heap = Heap::new();
        let cls = heap.new_class(Class::new("Bare", AccessorMode::Dynamic, Box::new(PointClassBackend)));
        let class_id = cls.ref_id().unwrap();
        let resolved = match heap.get(class_id) {
            HeapData::Class(c) => c.resolve_constructor(&[]),
            _ => None,
        };
        assert_eq!(resolved, None, "no declared constructor must resolve to nothing");
        let err = class_new(&mut heap, class_id, "b", None, &[]).unwrap_err();
        assert_eq!(err.label, "TypeError");
        assert!(err.message.contains("does not have any constructor"), "got: {}", err.message);
        // The failed construction must not have taken a class reference.
        assert_eq!(heap.refcount(class_id), 1);
        cls.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn releasing_class_releases_attribute_defaults() {
        let mut heap = Heap::new();
        let default = heap.new_string("origin");
        let mut cls = Class::new("Named", AccessorMode::Dynamic, Box::new(PointClassBackend));
        cls.add_static_attribute(
            Attribute::new("label", ty(ValueId::String), Visibility::Public, "Named").with_default(default),
        );
        let v = heap.new_class(cls);
        v.drop_with_heap(&mut heap);
        assert_eq!(heap.stats().live_objects, 0);
    }
}
