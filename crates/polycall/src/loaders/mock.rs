//! The mock loader: a scriptable backend with no guest runtime.
//!
//! Sources are tiny manifests, one directive per line:
//!
//! ```text
//! # functions: [async] fn name(param: type, ...) [-> type] = body
//! fn add(a: int, b: int) -> int = sum
//! async fn hello() -> string = "world"
//! fn boom() = raise ValueError x
//!
//! # classes: constructor params on the class line, members until `end`
//! class Point(x: double, y: double)
//!   attr x: double
//!   attr y: double
//!   method distance() -> double = norm
//! end
//! ```
//!
//! Bodies are opcodes, not expressions: `sum` adds numeric arguments,
//! `concat` stringifies and joins them, `echo` returns a structural copy of
//! the first argument, `norm` (methods only) is the Euclidean norm of the
//! instance's numeric fields, `raise LABEL text` raises, and any literal
//! (`"str"`, `42`, `1.5`, `true`, `null`) returns itself. A trailing `...`
//! in the parameter list marks the function variadic.
//!
//! Asynchronous bodies evaluate eagerly but deliver their completion
//! through the loader's event loop, one completion per `drive` pump, which
//! exercises the full await path.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    error::{LoadError, LoadResult},
    exceptions::Exception,
    function::{AsyncStart, Function, FunctionBackend},
    future::CallTicket,
    heap::Heap,
    klass::{AccessorMode, Attribute, Class, ClassBackend, Constructor, InstanceBackend, Method, Visibility},
    loader::{Completion, Discovery, LoaderBackend, LoaderConfig, ModuleId},
    signature::Signature,
    value::{Value, ValueId},
};

/// Heap-free scalar snapshot used for queued async completions.
#[derive(Debug, Clone, PartialEq)]
enum MockScalar {
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    Str(String),
}

impl MockScalar {
    /// Snapshots a value under a declared sort, so constructor fields land
    /// in the representation the manifest promised (a `double` parameter
    /// stores a double even when the call site passed an int).
    fn from_value_typed(heap: &Heap, value: &Value, declared: Option<ValueId>) -> Self {
        let raw = Self::from_value(heap, value);
        match declared {
            Some(ValueId::Float | ValueId::Double) => match raw {
                Self::Long(l) => Self::Double(l as f64),
                Self::Bool(b) => Self::Double(f64::from(u8::from(b))),
                other => other,
            },
            Some(id) if id.is_integral() => match raw {
                Self::Double(d) => Self::Long(d as i64),
                other => other,
            },
            Some(ValueId::String) => match raw {
                Self::Str(s) => Self::Str(s),
                _ => Self::Str(value.stringify(heap)),
            },
            _ => raw,
        }
    }

    fn from_value(heap: &Heap, value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Short(s) => Self::Long(i64::from(*s)),
            Value::Int(i) => Self::Long(i64::from(*i)),
            Value::Long(l) => Self::Long(*l),
            Value::Float(x) => Self::Double(f64::from(*x)),
            Value::Double(x) => Self::Double(*x),
            other => match other.as_str(heap) {
                Some(s) => Self::Str(s.to_string()),
                None => Self::Str(other.stringify(heap)),
            },
        }
    }

    fn into_value(self, heap: &mut Heap) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(b),
            Self::Long(l) => Value::Long(l),
            Self::Double(d) => Value::Double(d),
            Self::Str(s) => heap.new_string(s),
        }
    }
}

type CompletionQueue = Arc<Mutex<VecDeque<(CallTicket, Result<MockScalar, (String, String)>)>>>;

/// Literal payload of a `= <literal>` body.
#[derive(Debug, Clone, PartialEq)]
enum MockLiteral {
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    Str(String),
}

/// Body opcode of a mock function or method.
#[derive(Debug, Clone, PartialEq)]
enum MockBody {
    Sum,
    Concat,
    Echo,
    Norm,
    Raise { label: String, message: String },
    Literal(MockLiteral),
}

#[derive(Debug, Clone)]
struct FnDirective {
    name: String,
    params: Vec<(String, String)>,
    variadic: bool,
    ret: Option<String>,
    body: MockBody,
    asynchronous: bool,
}

#[derive(Debug, Clone)]
struct MethodDirective {
    name: String,
    params: Vec<(String, String)>,
    ret: Option<String>,
    body: MockBody,
    asynchronous: bool,
    statik: bool,
}

#[derive(Debug, Clone)]
struct AttrDirective {
    name: String,
    ty: String,
    statik: bool,
}

#[derive(Debug, Clone)]
struct ClassDirective {
    name: String,
    ctor_params: Vec<(String, String)>,
    methods: Vec<MethodDirective>,
    attrs: Vec<AttrDirective>,
}

#[derive(Debug, Clone)]
enum Directive {
    Function(FnDirective),
    Class(ClassDirective),
}

/// The mock loader backend.
pub struct MockLoader {
    modules: AHashMap<u32, Vec<Directive>>,
    next_module: u32,
    queue: CompletionQueue,
    exec_paths: Vec<PathBuf>,
    script_paths: Vec<PathBuf>,
    thread_confined: bool,
}

impl Default for MockLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLoader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: AHashMap::new(),
            next_module: 0,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            exec_paths: Vec::new(),
            script_paths: Vec::new(),
            thread_confined: false,
        }
    }

    /// The canonical tag the mock loader registers under.
    pub const TAG: &'static str = "mock";

    fn resolve_path(&self, path: &Path) -> Option<PathBuf> {
        if path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }
        self.exec_paths
            .iter()
            .chain(&self.script_paths)
            .map(|base| base.join(path))
            .find(|candidate| candidate.exists())
            .or_else(|| path.exists().then(|| path.to_path_buf()))
    }

    fn insert_module(&mut self, directives: Vec<Directive>) -> ModuleId {
        let id = self.next_module;
        self.next_module += 1;
        self.modules.insert(id, directives);
        ModuleId(id)
    }
}

impl LoaderBackend for MockLoader {
    fn initialize(&mut self, config: &LoaderConfig<'_>) -> LoadResult<()> {
        self.script_paths = config.script_paths.to_vec();
        if let Some(options) = config.options {
            self.thread_confined = options
                .get("thread_confined")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
        }
        Ok(())
    }

    fn is_thread_confined(&self) -> bool {
        self.thread_confined
    }

    fn execution_path(&mut self, path: &Path) -> LoadResult<()> {
        self.exec_paths.push(path.to_path_buf());
        Ok(())
    }

    fn load_from_file(&mut self, paths: &[PathBuf]) -> LoadResult<ModuleId> {
        let mut directives = Vec::new();
        for path in paths {
            let resolved = self
                .resolve_path(path)
                .ok_or_else(|| LoadError::FileNotFound(path.display().to_string()))?;
            let text = std::fs::read_to_string(&resolved)
                .map_err(|err| LoadError::Backend(format!("{}: {err}", resolved.display())))?;
            directives.extend(parse_manifest(&text).map_err(LoadError::Backend)?);
        }
        Ok(self.insert_module(directives))
    }

    fn load_from_memory(&mut self, _name: &str, buffer: &[u8]) -> LoadResult<ModuleId> {
        let text = std::str::from_utf8(buffer).map_err(|err| LoadError::Backend(err.to_string()))?;
        let directives = parse_manifest(text).map_err(LoadError::Backend)?;
        Ok(self.insert_module(directives))
    }

    fn clear(&mut self, module: ModuleId) -> LoadResult<()> {
        self.modules.remove(&module.0);
        Ok(())
    }

    fn discover(&mut self, module: ModuleId, discovery: &mut Discovery<'_>) -> LoadResult<()> {
        let directives = self.modules.get(&module.0).cloned().ok_or(LoadError::InvalidHandle)?;
        for directive in directives {
            match directive {
                Directive::Function(fun) => define_function(discovery, &self.queue, fun),
                Directive::Class(cls) => define_class(discovery, &self.queue, cls),
            }
        }
        Ok(())
    }

    fn drive(&mut self, heap: &mut Heap) -> Vec<Completion> {
        // One completion per pump keeps the await loop honest.
        let popped = self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner).pop_front();
        match popped {
            Some((ticket, Ok(scalar))) => vec![Completion {
                ticket,
                result: Ok(scalar.into_value(heap)),
            }],
            Some((ticket, Err((label, message)))) => vec![Completion {
                ticket,
                result: Err(Exception::new(label, message)),
            }],
            None => Vec::new(),
        }
    }
}

/// Maps the manifest's canonical type names onto value sorts.
fn core_id(name: &str) -> Option<ValueId> {
    use std::str::FromStr;
    ValueId::from_str(name).ok().filter(|id| *id as u8 <= ValueId::Null as u8)
}

fn resolve_manifest_type(discovery: &mut Discovery<'_>, name: &str) -> crate::types::Type {
    match core_id(name) {
        Some(id) => discovery.register_type(name, id),
        // Unknown names become Invalid placeholders, the contract for
        // backend-reported types nobody registered.
        None => discovery.resolve_type(name),
    }
}

fn build_signature(discovery: &mut Discovery<'_>, params: &[(String, String)], ret: Option<&str>) -> Signature {
    let mut signature = Signature::with_arity(params.len());
    for (index, (name, ty)) in params.iter().enumerate() {
        let ty = resolve_manifest_type(discovery, ty);
        signature.set(index, name.as_str(), Some(ty));
    }
    signature.set_return(ret.map(|name| resolve_manifest_type(discovery, name)));
    signature
}

fn define_function(discovery: &mut Discovery<'_>, queue: &CompletionQueue, directive: FnDirective) {
    let signature = build_signature(discovery, &directive.params, directive.ret.as_deref());
    let ret_id = signature.ret().map(crate::types::Type::id);
    let backend = MockFunction {
        body: directive.body,
        ret: ret_id,
        queue: Arc::clone(queue),
    };
    let mut function = Function::new(directive.name, signature, Box::new(backend));
    if directive.asynchronous {
        function = function.asynchronous();
    }
    if directive.variadic {
        function = function.variadic();
    }
    discovery.define_function(function);
}

fn define_class(discovery: &mut Discovery<'_>, queue: &CompletionQueue, directive: ClassDirective) {
    let ctor_signature = build_signature(discovery, &directive.ctor_params, None);
    let mut bodies = AHashMap::new();
    for method in &directive.methods {
        bodies.insert(method.name.clone(), (method.body.clone(), method.ret.as_deref().and_then(core_id)));
    }
    let backend = MockClass {
        ctor_params: directive
            .ctor_params
            .iter()
            .map(|(name, ty)| (name.clone(), core_id(ty)))
            .collect(),
        bodies,
        queue: Arc::clone(queue),
    };
    let mut class = Class::new(directive.name.as_str(), AccessorMode::Static, Box::new(backend));
    class.add_constructor(Constructor::new(ctor_signature, Visibility::Public));
    for attr in &directive.attrs {
        let ty = resolve_manifest_type(discovery, &attr.ty);
        let attribute = Attribute::new(attr.name.as_str(), Some(ty), Visibility::Public, directive.name.as_str());
        if attr.statik {
            class.add_static_attribute(attribute);
        } else {
            class.add_attribute(attribute);
        }
    }
    for method in directive.methods {
        let signature = build_signature(discovery, &method.params, method.ret.as_deref());
        let mut descriptor = Method::new(method.name.as_str(), signature, Visibility::Public, directive.name.as_str());
        if method.asynchronous {
            descriptor = descriptor.asynchronous();
        }
        if method.statik {
            class.add_static_method(descriptor);
        } else {
            class.add_method(descriptor);
        }
    }
    discovery.define_class(class);
}

/// Shared body evaluator for functions and static methods.
fn evaluate_body(
    heap: &mut Heap,
    body: &MockBody,
    args: &[Value],
    fields: Option<&IndexMap<String, MockScalar>>,
) -> Result<Value, Exception> {
    match body {
        MockBody::Sum => {
            let mut int_total = 0i64;
            let mut float_total = 0f64;
            let mut floating = false;
            for arg in args {
                match arg {
                    Value::Bool(b) => int_total += i64::from(*b),
                    Value::Char(c) => int_total += i64::from(u32::from(*c)),
                    Value::Short(s) => int_total += i64::from(*s),
                    Value::Int(i) => int_total += i64::from(*i),
                    Value::Long(l) => int_total += *l,
                    Value::Float(x) => {
                        floating = true;
                        float_total += f64::from(*x);
                    }
                    Value::Double(x) => {
                        floating = true;
                        float_total += *x;
                    }
                    other => {
                        return Err(Exception::type_error(format!(
                            "sum cannot consume a {}",
                            other.value_id(heap)
                        )));
                    }
                }
            }
            if floating {
                Ok(Value::Double(float_total + int_total as f64))
            } else {
                Ok(Value::Long(int_total))
            }
        }
        MockBody::Concat => {
            let mut text = String::new();
            for arg in args {
                text.push_str(&arg.stringify(heap));
            }
            Ok(heap.new_string(text))
        }
        MockBody::Echo => Ok(args.first().map_or(Value::Null, |arg| arg.deep_copy(heap))),
        MockBody::Norm => {
            let Some(fields) = fields else {
                return Err(Exception::type_error("norm is only defined on instances"));
            };
            let mut sum = 0f64;
            for scalar in fields.values() {
                match scalar {
                    MockScalar::Long(l) => sum += (*l as f64) * (*l as f64),
                    MockScalar::Double(d) => sum += d * d,
                    _ => {}
                }
            }
            Ok(Value::Double(sum.sqrt()))
        }
        MockBody::Raise { label, message } => Err(Exception::new(label.clone(), message.clone())),
        MockBody::Literal(literal) => Ok(match literal {
            MockLiteral::Null => Value::Null,
            MockLiteral::Bool(b) => Value::Bool(*b),
            MockLiteral::Long(l) => Value::Long(*l),
            MockLiteral::Double(d) => Value::Double(*d),
            MockLiteral::Str(s) => heap.new_string(s.clone()),
        }),
    }
}

/// Casts a body result to the declared return sort, when one was declared.
fn apply_return(heap: &mut Heap, result: Value, ret: Option<ValueId>) -> Result<Value, Exception> {
    match ret {
        Some(target) if target != ValueId::Invalid => result
            .cast(heap, target)
            .map_err(|err| Exception::type_error(err.to_string())),
        _ => Ok(result),
    }
}

struct MockFunction {
    body: MockBody,
    ret: Option<ValueId>,
    queue: CompletionQueue,
}

impl MockFunction {
    fn evaluate(&self, heap: &mut Heap, args: &[Value]) -> Result<Value, Exception> {
        let result = evaluate_body(heap, &self.body, args, None)?;
        apply_return(heap, result, self.ret)
    }
}

impl FunctionBackend for MockFunction {
    fn invoke(&self, heap: &mut Heap, args: Vec<Value>) -> Result<Value, Exception> {
        let result = self.evaluate(heap, &args);
        crate::function::release_args(heap, args);
        result
    }

    fn invoke_async(&self, heap: &mut Heap, args: Vec<Value>, ticket: CallTicket) -> AsyncStart {
        let result = self.evaluate(heap, &args);
        crate::function::release_args(heap, args);
        let queued = match result {
            Ok(value) => {
                let scalar = MockScalar::from_value(heap, &value);
                value.drop_with_heap(heap);
                Ok(scalar)
            }
            Err(exception) => {
                let entry = (exception.label.clone(), exception.message.clone());
                exception.release(heap);
                Err(entry)
            }
        };
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back((ticket, queued));
        AsyncStart::Scheduled
    }
}

struct MockClass {
    ctor_params: Vec<(String, Option<ValueId>)>,
    bodies: AHashMap<String, (MockBody, Option<ValueId>)>,
    queue: CompletionQueue,
}

impl ClassBackend for MockClass {
    fn construct(
        &self,
        heap: &mut Heap,
        _ctor: &Constructor,
        args: &[Value],
    ) -> Result<Box<dyn InstanceBackend>, Exception> {
        let mut fields = IndexMap::new();
        for (index, (name, declared)) in self.ctor_params.iter().enumerate() {
            let scalar = args
                .get(index)
                .map_or(MockScalar::Null, |arg| MockScalar::from_value_typed(heap, arg, *declared));
            fields.insert(name.clone(), scalar);
        }
        Ok(Box::new(MockInstance {
            fields,
            bodies: self.bodies.clone(),
            queue: Arc::clone(&self.queue),
        }))
    }

    fn static_call(&self, heap: &mut Heap, method: &Method, args: Vec<Value>) -> Result<Value, Exception> {
        let result = match self.bodies.get(method.name()) {
            Some((body, ret)) => {
                evaluate_body(heap, body, &args, None).and_then(|value| apply_return(heap, value, *ret))
            }
            None => Err(Exception::type_error(format!("no static method {:?}", method.name()))),
        };
        crate::function::release_args(heap, args);
        result
    }
}

struct MockInstance {
    fields: IndexMap<String, MockScalar>,
    bodies: AHashMap<String, (MockBody, Option<ValueId>)>,
    queue: CompletionQueue,
}

impl MockInstance {
    fn evaluate(&self, heap: &mut Heap, method: &Method, args: &[Value]) -> Result<Value, Exception> {
        match self.bodies.get(method.name()) {
            Some((body, ret)) => {
                let value = evaluate_body(heap, body, args, Some(&self.fields))?;
                apply_return(heap, value, *ret)
            }
            None => Err(Exception::type_error(format!("no method {:?}", method.name()))),
        }
    }
}

impl InstanceBackend for MockInstance {
    fn get(&self, heap: &mut Heap, attr: &str) -> Result<Value, Exception> {
        match self.fields.get(attr) {
            Some(scalar) => Ok(scalar.clone().into_value(heap)),
            None => Ok(Value::Null),
        }
    }

    fn set(&mut self, heap: &mut Heap, attr: &str, value: Value) -> Result<(), Exception> {
        let scalar = MockScalar::from_value(heap, &value);
        value.drop_with_heap(heap);
        self.fields.insert(attr.to_string(), scalar);
        Ok(())
    }

    fn call(&mut self, heap: &mut Heap, method: &Method, args: Vec<Value>) -> Result<Value, Exception> {
        let result = self.evaluate(heap, method, &args);
        crate::function::release_args(heap, args);
        result
    }

    fn call_async(&mut self, heap: &mut Heap, method: &Method, args: Vec<Value>, ticket: CallTicket) -> AsyncStart {
        let result = self.evaluate(heap, method, &args);
        crate::function::release_args(heap, args);
        let queued = match result {
            Ok(value) => {
                let scalar = MockScalar::from_value(heap, &value);
                value.drop_with_heap(heap);
                Ok(scalar)
            }
            Err(exception) => {
                let entry = (exception.label.clone(), exception.message.clone());
                exception.release(heap);
                Err(entry)
            }
        };
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back((ticket, queued));
        AsyncStart::Scheduled
    }
}

fn parse_params(text: &str) -> Result<(Vec<(String, String)>, bool), String> {
    let mut params = Vec::new();
    let mut variadic = false;
    for part in text.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        if part == "..." {
            variadic = true;
            continue;
        }
        let (name, ty) = part
            .split_once(':')
            .ok_or_else(|| format!("malformed parameter {part:?} (expected name: type)"))?;
        params.push((name.trim().to_string(), ty.trim().to_string()));
    }
    Ok((params, variadic))
}

fn parse_body(text: &str) -> Result<MockBody, String> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("raise ") {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let label = parts.next().unwrap_or("Error").to_string();
        let message = parts.next().unwrap_or("").trim().to_string();
        return Ok(MockBody::Raise { label, message });
    }
    match text {
        "sum" => return Ok(MockBody::Sum),
        "concat" => return Ok(MockBody::Concat),
        "echo" => return Ok(MockBody::Echo),
        "norm" => return Ok(MockBody::Norm),
        "null" => return Ok(MockBody::Literal(MockLiteral::Null)),
        "true" => return Ok(MockBody::Literal(MockLiteral::Bool(true))),
        "false" => return Ok(MockBody::Literal(MockLiteral::Bool(false))),
        _ => {}
    }
    if let Some(stripped) = text.strip_prefix('"') {
        let Some(inner) = stripped.strip_suffix('"') else {
            return Err(format!("unterminated string literal in body {text:?}"));
        };
        return Ok(MockBody::Literal(MockLiteral::Str(inner.to_string())));
    }
    if text.contains('.') {
        if let Ok(double) = text.parse::<f64>() {
            return Ok(MockBody::Literal(MockLiteral::Double(double)));
        }
    } else if let Ok(long) = text.parse::<i64>() {
        return Ok(MockBody::Literal(MockLiteral::Long(long)));
    }
    Err(format!("unknown body {text:?}"))
}

/// Parses `name(params) [-> type] [= body]`, returning the pieces.
#[expect(clippy::type_complexity, reason = "internal parse helper returns raw pieces")]
fn parse_callable(text: &str, body_required: bool) -> Result<(String, Vec<(String, String)>, bool, Option<String>, Option<MockBody>), String> {
    let open = text.find('(').ok_or_else(|| format!("missing ( in {text:?}"))?;
    let close = text.find(')').ok_or_else(|| format!("missing ) in {text:?}"))?;
    if close < open {
        return Err(format!("mismatched parentheses in {text:?}"));
    }
    let name = text[..open].trim().to_string();
    if name.is_empty() {
        return Err(format!("missing name in {text:?}"));
    }
    let (params, variadic) = parse_params(&text[open + 1..close])?;
    let mut rest = text[close + 1..].trim();
    let mut ret = None;
    if let Some(after) = rest.strip_prefix("->") {
        let (ty, tail) = match after.find('=') {
            Some(eq) => (&after[..eq], &after[eq..]),
            None => (after, ""),
        };
        ret = Some(ty.trim().to_string());
        rest = tail.trim();
    }
    let body = match rest.strip_prefix('=') {
        Some(body_text) => Some(parse_body(body_text)?),
        None if body_required => return Err(format!("missing body in {text:?}")),
        None if rest.is_empty() => None,
        None => return Err(format!("trailing garbage in {text:?}")),
    };
    Ok((name, params, variadic, ret, body))
}

fn parse_manifest(text: &str) -> Result<Vec<Directive>, String> {
    let mut directives = Vec::new();
    let mut current_class: Option<ClassDirective> = None;
    for (line_number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let err_at = |msg: String| format!("line {}: {msg}", line_number + 1);

        if current_class.is_some() {
            if line == "end" {
                directives.push(Directive::Class(current_class.take().expect("class in progress")));
                continue;
            }
            let class = current_class.as_mut().expect("class in progress");
            let (line, statik) = match line.strip_prefix("static ") {
                Some(rest) => (rest.trim(), true),
                None => (line, false),
            };
            let (line, asynchronous) = match line.strip_prefix("async ") {
                Some(rest) => (rest.trim(), true),
                None => (line, false),
            };
            if let Some(rest) = line.strip_prefix("method ") {
                let (name, params, _, ret, body) = parse_callable(rest, true).map_err(err_at)?;
                class.methods.push(MethodDirective {
                    name,
                    params,
                    ret,
                    body: body.expect("body required"),
                    asynchronous,
                    statik,
                });
            } else if let Some(rest) = line.strip_prefix("attr ") {
                let (name, ty) = rest
                    .split_once(':')
                    .ok_or_else(|| err_at(format!("malformed attribute {rest:?}")))?;
                class.attrs.push(AttrDirective {
                    name: name.trim().to_string(),
                    ty: ty.trim().to_string(),
                    statik,
                });
            } else {
                return Err(err_at(format!("unknown class member {line:?}")));
            }
            continue;
        }

        let (line, asynchronous) = match line.strip_prefix("async ") {
            Some(rest) => (rest.trim(), true),
            None => (line, false),
        };
        if let Some(rest) = line.strip_prefix("fn ") {
            let (name, params, variadic, ret, body) = parse_callable(rest, true).map_err(err_at)?;
            directives.push(Directive::Function(FnDirective {
                name,
                params,
                variadic,
                ret,
                body: body.expect("body required"),
                asynchronous,
            }));
        } else if let Some(rest) = line.strip_prefix("class ") {
            if asynchronous {
                return Err(err_at("classes cannot be async".to_string()));
            }
            let (name, ctor_params, _, _, _) = parse_callable(rest, false).map_err(err_at)?;
            current_class = Some(ClassDirective {
                name,
                ctor_params,
                methods: Vec::new(),
                attrs: Vec::new(),
            });
        } else {
            return Err(err_at(format!("unknown directive {line:?}")));
        }
    }
    if let Some(class) = current_class {
        return Err(format!("class {:?} is missing its end line", class.name));
    }
    Ok(directives)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_functions_and_classes() {
        let manifest = r#"
            # demo manifest
            fn add(a: int, b: int) -> int = sum
            async fn hello() -> string = "world"
            fn boom() = raise ValueError x

            class Point(x: double, y: double)
              attr x: double
              attr y: double
              method distance() -> double = norm
              static method origin() -> string = "0,0"
            end
        "#;
        let directives = parse_manifest(manifest).unwrap();
        assert_eq!(directives.len(), 4);
        let Directive::Function(add) = &directives[0] else { panic!() };
        assert_eq!(add.name, "add");
        assert_eq!(add.params.len(), 2);
        assert_eq!(add.ret.as_deref(), Some("int"));
        assert_eq!(add.body, MockBody::Sum);
        assert!(!add.asynchronous);
        let Directive::Function(hello) = &directives[1] else { panic!() };
        assert!(hello.asynchronous);
        assert_eq!(hello.body, MockBody::Literal(MockLiteral::Str("world".to_string())));
        let Directive::Function(boom) = &directives[2] else { panic!() };
        assert_eq!(
            boom.body,
            MockBody::Raise {
                label: "ValueError".to_string(),
                message: "x".to_string()
            }
        );
        let Directive::Class(point) = &directives[3] else { panic!() };
        assert_eq!(point.name, "Point");
        assert_eq!(point.ctor_params.len(), 2);
        assert_eq!(point.attrs.len(), 2);
        assert_eq!(point.methods.len(), 2);
        assert!(point.methods[1].statik);
    }

    #[test]
    fn variadic_marker_is_recognized() {
        let directives = parse_manifest("fn printall(...) -> string = concat").unwrap();
        let Directive::Function(fun) = &directives[0] else { panic!() };
        assert!(fun.variadic);
        assert!(fun.params.is_empty());
    }

    #[test]
    fn malformed_lines_report_line_numbers() {
        let err = parse_manifest("fn broken").unwrap_err();
        assert!(err.starts_with("line 1:"), "got: {err}");
        let err = parse_manifest("\nnonsense here").unwrap_err();
        assert!(err.starts_with("line 2:"), "got: {err}");
    }

    #[test]
    fn unterminated_class_is_rejected() {
        let err = parse_manifest("class Foo()\n  attr a: int").unwrap_err();
        assert!(err.contains("missing its end line"));
    }

    #[test]
    fn sum_body_follows_numeric_tower() {
        let mut heap = Heap::new();
        let out = evaluate_body(&mut heap, &MockBody::Sum, &[Value::Int(2), Value::Int(3)], None).unwrap();
        assert_eq!(out.as_long(), Some(5));
        let out = evaluate_body(&mut heap, &MockBody::Sum, &[Value::Int(1), Value::Double(0.5)], None).unwrap();
        assert_eq!(out.as_double(), Some(1.5));
    }
}
