//! Runtime values exchanged between the script runtime and host objects.
use crate::{
    dispatch::NativeDispatch,
    dynamic::{DynamicMetaObject, ListAccess, PropertyBag},
    error::BindError,
    types::TypeDescription,
};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::Arc,
};

/// Discriminant of a [`Value`], used for argument shapes and marshaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int32,
    Int64,
    Float64,
    Str,
    List,
    Object,
    Type,
    Callable,
    ByRef,
}

#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Str(Arc<str>),
    List(ListHandle),
    Object(ObjectHandle),
    Type(TypeDescription),
    Callable(ScriptCallable),
    /// Reference-capturing argument wrapper; mutations through it are
    /// visible to whoever shares the underlying cell.
    ByRef(ByRefSlot),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int32(_) => ValueKind::Int32,
            Value::Int64(_) => ValueKind::Int64,
            Value::Float64(_) => ValueKind::Float64,
            Value::Str(_) => ValueKind::Str,
            Value::List(_) => ValueKind::List,
            Value::Object(_) => ValueKind::Object,
            Value::Type(_) => ValueKind::Type,
            Value::Callable(_) => ValueKind::Callable,
            Value::ByRef(_) => ValueKind::ByRef,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Identity address for values that carry a stable heap identity.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::List(l) => Some(Arc::as_ptr(&l.0) as usize),
            Value::Object(o) => Some(Arc::as_ptr(&o.0) as usize),
            Value::Callable(c) => Some(c.addr()),
            Value::Type(t) => Some(t.key()),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(i) => Some(*i as i64),
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(i) => Some(*i as f64),
            Value::Int64(i) => Some(*i as f64),
            Value::Float64(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int32(i) => write!(f, "{}i32", i),
            Value::Int64(i) => write!(f, "{}i64", i),
            Value::Float64(x) => write!(f, "{}f64", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(l) => write!(f, "List(len={})", l.len()),
            Value::Object(o) => write!(f, "{:?}", o),
            Value::Type(t) => write!(f, "Type({:?})", t),
            Value::Callable(c) => write!(f, "Callable@{:x}", c.addr()),
            Value::ByRef(b) => write!(f, "ByRef({:?}, {:?})", b.kind, b.read()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(&a.0, &b.0),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(&a.0, &b.0),
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::Callable(a), Value::Callable(b)) => a.addr() == b.addr(),
            (Value::ByRef(a), Value::ByRef(b)) => {
                Arc::ptr_eq(&a.cell, &b.cell) && a.kind == b.kind
            }
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Arc::from(v.as_str()))
    }
}

/// A shared, growable host list with integer-indexed access.
#[derive(Clone)]
pub struct ListHandle(pub Arc<RwLock<Vec<Value>>>);

impl ListHandle {
    pub fn new(items: Vec<Value>) -> Self {
        Self(Arc::new(RwLock::new(items)))
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.read().get(index).cloned()
    }

    pub fn set(&self, index: usize, value: Value) -> bool {
        let mut items = self.0.write();
        match items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn push(&self, value: Value) {
        self.0.write().push(value);
    }
}

/// Optional dynamic capabilities a host object may expose. The capability
/// router inspects these once at wrap time (priority order lives there).
#[derive(Default, Clone)]
pub struct Capabilities {
    pub dispatch: Option<Arc<dyn NativeDispatch>>,
    pub bag: Option<Arc<dyn PropertyBag>>,
    pub list: Option<Arc<dyn ListAccess>>,
    pub meta: Option<Arc<dyn DynamicMetaObject>>,
}

pub struct HostObject {
    ty: TypeDescription,
    fields: RwLock<HashMap<Arc<str>, Value>>,
    capabilities: Capabilities,
}

/// Shared handle to a live host instance. Identity-compared.
#[derive(Clone)]
pub struct ObjectHandle(pub Arc<HostObject>);

impl ObjectHandle {
    pub fn new(ty: TypeDescription) -> Self {
        Self::with_capabilities(ty, Capabilities::default())
    }

    pub fn with_capabilities(ty: TypeDescription, capabilities: Capabilities) -> Self {
        let fields = ty
            .fields()
            .iter()
            .filter(|f| !f.is_static)
            .map(|f| (f.name.clone(), f.default.clone()))
            .collect();
        Self(Arc::new(HostObject {
            ty,
            fields: RwLock::new(fields),
            capabilities,
        }))
    }

    pub fn ty(&self) -> &TypeDescription {
        &self.0.ty
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.0.capabilities
    }

    pub fn get_field(&self, name: &str) -> Option<Value> {
        self.0.fields.read().get(name).cloned()
    }

    /// Write a declared instance field. Returns false for unknown names;
    /// expando-style additions are the capability router's business.
    pub fn set_field(&self, name: &str, value: Value) -> bool {
        let mut fields = self.0.fields.write();
        match fields.get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

impl Debug for ObjectHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{:x}",
            self.0.ty.name(),
            Arc::as_ptr(&self.0) as usize
        )
    }
}

/// A script-side callable the host can invoke through a shim.
#[derive(Clone)]
pub struct ScriptCallable {
    f: Arc<dyn Fn(&mut [Value]) -> Result<Value, BindError> + Send + Sync>,
}

impl ScriptCallable {
    pub fn new(
        f: impl Fn(&mut [Value]) -> Result<Value, BindError> + Send + Sync + 'static,
    ) -> Self {
        Self { f: Arc::new(f) }
    }

    pub fn invoke(&self, args: &mut [Value]) -> Result<Value, BindError> {
        (self.f)(args)
    }

    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.f) as *const () as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Callee is expected to write; initial value is not meaningful.
    Out,
    /// Callee may read and write.
    Ref,
}

/// A mutable slot shared between a caller and a callee for output semantics.
#[derive(Clone)]
pub struct ByRefSlot {
    pub cell: Arc<RwLock<Value>>,
    pub kind: RefKind,
}

impl ByRefSlot {
    pub fn new(kind: RefKind, initial: Value) -> Self {
        Self {
            cell: Arc::new(RwLock::new(initial)),
            kind,
        }
    }

    pub fn read(&self) -> Value {
        self.cell.read().clone()
    }

    pub fn write(&self, value: Value) {
        *self.cell.write() = value;
    }
}
