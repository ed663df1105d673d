//! Runtime introspection.
//!
//! Builds the JSON document consumed by RPC peers: tag → handles → scope →
//! functions/classes/objects, with every type slot carrying both the
//! backend's name for it and the numerically stable sort id.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    heap::{Heap, HeapData},
    klass::Class,
    registry::Registry,
    signature::Signature,
    types::Type,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectType {
    pub name: String,
    /// The wire-stable sort discriminant.
    pub id: u8,
}

impl From<&Type> for InspectType {
    fn from(ty: &Type) -> Self {
        Self {
            name: ty.name().to_string(),
            id: ty.id() as u8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectParam {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Option<InspectType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectSignature {
    pub args: Vec<InspectParam>,
    pub ret: Option<InspectType>,
}

impl From<&Signature> for InspectSignature {
    fn from(signature: &Signature) -> Self {
        Self {
            args: signature
                .iter()
                .map(|param| InspectParam {
                    name: param.name().to_string(),
                    ty: param.ty().map(InspectType::from),
                })
                .collect(),
            ret: signature.ret().map(InspectType::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectFunction {
    pub name: String,
    #[serde(rename = "async")]
    pub asynchronous: bool,
    pub signature: InspectSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectConstructor {
    pub visibility: String,
    pub signature: InspectSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectMethod {
    pub name: String,
    pub visibility: String,
    #[serde(rename = "async")]
    pub asynchronous: bool,
    pub signature: InspectSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectAttribute {
    #[serde(rename = "type")]
    pub ty: Option<InspectType>,
    pub visibility: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectClass {
    pub name: String,
    pub constructors: Vec<InspectConstructor>,
    pub methods: Vec<InspectMethod>,
    pub static_methods: Vec<InspectMethod>,
    pub attributes: IndexMap<String, InspectAttribute>,
    pub static_attributes: IndexMap<String, InspectAttribute>,
}

impl From<&Class> for InspectClass {
    fn from(class: &Class) -> Self {
        Self {
            name: class.name().to_string(),
            constructors: class
                .constructors()
                .iter()
                .map(|ctor| InspectConstructor {
                    visibility: ctor.visibility().to_string(),
                    signature: InspectSignature::from(ctor.signature()),
                })
                .collect(),
            methods: class.methods().map(inspect_method).collect(),
            static_methods: class.static_methods().map(inspect_method).collect(),
            attributes: class
                .attributes()
                .map(|attr| (attr.name().to_string(), inspect_attribute(attr)))
                .collect(),
            static_attributes: class
                .static_attributes()
                .map(|attr| (attr.name().to_string(), inspect_attribute(attr)))
                .collect(),
        }
    }
}

fn inspect_method(method: &crate::klass::Method) -> InspectMethod {
    InspectMethod {
        name: method.name().to_string(),
        visibility: method.visibility().to_string(),
        asynchronous: method.is_async(),
        signature: InspectSignature::from(method.signature()),
    }
}

fn inspect_attribute(attribute: &crate::klass::Attribute) -> InspectAttribute {
    InspectAttribute {
        ty: attribute.ty().map(InspectType::from),
        visibility: attribute.visibility().to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectObject {
    pub name: String,
    pub class: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectScope {
    pub name: String,
    pub funcs: Vec<InspectFunction>,
    pub classes: Vec<InspectClass>,
    pub objects: Vec<InspectObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectHandle {
    pub name: String,
    pub scope: InspectScope,
}

/// The whole introspection document: tag → loaded public handles.
pub type InspectDocument = IndexMap<String, Vec<InspectHandle>>;

/// Walks every loader's public handles and captures their surfaces.
#[must_use]
pub fn document(heap: &Heap, registry: &Registry) -> InspectDocument {
    let mut doc = InspectDocument::new();
    for loader in registry.iter() {
        let mut handles = Vec::new();
        for handle in loader.public_handles() {
            let scope = handle.context().root();
            let mut funcs = Vec::new();
            let mut classes = Vec::new();
            let mut objects = Vec::new();
            for (name, value) in scope.iter() {
                let Some(id) = value.ref_id() else { continue };
                match heap.get(id) {
                    HeapData::Function(fun) => funcs.push(InspectFunction {
                        name: name.to_string(),
                        asynchronous: fun.is_async(),
                        signature: InspectSignature::from(fun.signature()),
                    }),
                    HeapData::Class(class) => classes.push(InspectClass::from(class)),
                    HeapData::Object(instance) => {
                        let class_name = match heap.get_if_live(instance.class_id()) {
                            Some(HeapData::Class(class)) => class.name().to_string(),
                            _ => String::new(),
                        };
                        objects.push(InspectObject {
                            name: name.to_string(),
                            class: class_name,
                        });
                    }
                    _ => {}
                }
            }
            handles.push(InspectHandle {
                name: handle.name().to_string(),
                scope: InspectScope {
                    name: scope.name().to_string(),
                    funcs,
                    classes,
                    objects,
                },
            });
        }
        doc.insert(loader.tag().to_string(), handles);
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Configuration,
        loader::{LoaderImpl, LoadSource},
        loaders::mock::MockLoader,
    };

    #[test]
    fn document_captures_functions_with_stable_ids() {
        let mut heap = Heap::new();
        let mut registry = Registry::new();
        let mut loader = LoaderImpl::new(MockLoader::TAG, Box::new(MockLoader::new()));
        loader.initialize(&Configuration::default()).unwrap();
        loader
            .load(
                &mut heap,
                &LoadSource::Memory {
                    name: "inspectable".to_string(),
                    buffer: b"fn add(a: int, b: int) -> int = sum\nasync fn hello() -> string = \"world\"".to_vec(),
                },
                true,
            )
            .unwrap();
        registry.insert(loader);

        let doc = document(&heap, &registry);
        let handles = doc.get(MockLoader::TAG).unwrap();
        assert_eq!(handles.len(), 1);
        let scope = &handles[0].scope;
        assert_eq!(scope.funcs.len(), 2);
        let add = scope.funcs.iter().find(|f| f.name == "add").unwrap();
        assert!(!add.asynchronous);
        assert_eq!(add.signature.args.len(), 2);
        let ty = add.signature.args[0].ty.as_ref().unwrap();
        assert_eq!(ty.name, "int");
        assert_eq!(ty.id, crate::value::ValueId::Int as u8);
        let hello = scope.funcs.iter().find(|f| f.name == "hello").unwrap();
        assert!(hello.asynchronous);

        // The document serializes and parses back without loss.
        let json = serde_json::to_string(&doc).unwrap();
        let parsed: InspectDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, doc);

        registry.destroy_all(&mut heap, &crate::tracer::NoopTracer);
        assert_eq!(heap.stats().live_objects, 0);
    }
}
