//! Host type and member descriptors.
//!
//! The binding engine resolves member operations against these descriptors,
//! which stand in for the host platform's reflection surface. A
//! [`TypeDescription`] is identity-compared: two descriptions are the same
//! type exactly when they share the same backing allocation.
use crate::{
    error::BindError,
    value::{Value, ValueKind},
};
use dashmap::DashMap;
use std::{
    fmt::{Debug, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Identifier of a script access context. Members may be restricted to a
/// single context; the binder carries the active one.
pub type AccessContextId = u64;

/// How a member is exposed to script code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptAccess {
    Full,
    ReadOnly,
    Blocked,
}

/// Engine-wide default policy for members restricted to a specific context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultAccess {
    /// Restricted members are visible regardless of the active context.
    Full,
    /// Restricted members are visible only to their declaring context.
    Restricted,
}

/// Coarse static-type tag used for overload scoring and argument shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Any,
    Bool,
    Int32,
    Int64,
    Float64,
    Str,
    List,
    Object,
    Type,
    Callable,
}

impl TypeTag {
    pub fn of(value: &Value) -> TypeTag {
        match value.kind() {
            ValueKind::Null => TypeTag::Any,
            ValueKind::Bool => TypeTag::Bool,
            ValueKind::Int32 => TypeTag::Int32,
            ValueKind::Int64 => TypeTag::Int64,
            ValueKind::Float64 => TypeTag::Float64,
            ValueKind::Str => TypeTag::Str,
            ValueKind::List => TypeTag::List,
            ValueKind::Object => TypeTag::Object,
            ValueKind::Type => TypeTag::Type,
            ValueKind::Callable => TypeTag::Callable,
            // By-ref slots do not participate in overload resolution by
            // static type; they match any parameter.
            ValueKind::ByRef => TypeTag::Any,
        }
    }

    /// Conversion penalty from an argument tag to a parameter tag.
    /// `None` means incompatible. Lower is a better match.
    pub fn conversion_cost(param: TypeTag, arg: TypeTag) -> Option<u32> {
        if param == arg {
            return Some(0);
        }
        match (param, arg) {
            (TypeTag::Any, _) | (_, TypeTag::Any) => Some(3),
            (TypeTag::Int64, TypeTag::Int32) => Some(1),
            (TypeTag::Float64, TypeTag::Int64) => Some(1),
            (TypeTag::Float64, TypeTag::Int32) => Some(2),
            _ => None,
        }
    }
}

/// True when a member with the given policy is reachable from `context`.
pub fn member_visible(
    access: ScriptAccess,
    restricted_to: Option<AccessContextId>,
    context: AccessContextId,
    default_access: DefaultAccess,
) -> bool {
    if access == ScriptAccess::Blocked {
        return false;
    }
    match restricted_to {
        None => true,
        Some(owner) => owner == context || default_access == DefaultAccess::Full,
    }
}

/// Host-side implementation of a method, property accessor, or constructor.
/// Receives the receiver (`None` for static members) and the marshaled
/// argument buffer, which it may mutate for by-ref parameters.
pub type MethodImpl =
    Arc<dyn Fn(Option<&Value>, &mut [Value]) -> Result<Value, BindError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamDescription {
    pub tag: TypeTag,
    pub by_ref: bool,
}

impl ParamDescription {
    pub fn by_value(tag: TypeTag) -> Self {
        Self { tag, by_ref: false }
    }

    pub fn by_ref(tag: TypeTag) -> Self {
        Self { tag, by_ref: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub params: Vec<ParamDescription>,
    pub type_params: usize,
    pub returns: TypeTag,
}

pub struct MethodDescription {
    pub name: Arc<str>,
    /// Script-visible names that map to this member through renaming or
    /// decoration rules, tried only after exact-name resolution fails.
    pub alt_names: Vec<Arc<str>>,
    pub is_static: bool,
    pub access: ScriptAccess,
    pub restricted_to: Option<AccessContextId>,
    /// Invoking this member requires the binder's reflection permission.
    pub reflection_sensitive: bool,
    pub signature: MethodSignature,
    pub body: MethodImpl,
}

impl Debug for MethodDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MethodDescription({}/{})",
            self.name,
            self.signature.params.len()
        )
    }
}

impl MethodDescription {
    pub fn new(
        name: impl Into<Arc<str>>,
        params: Vec<ParamDescription>,
        returns: TypeTag,
        body: impl Fn(Option<&Value>, &mut [Value]) -> Result<Value, BindError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            alt_names: vec![],
            is_static: false,
            access: ScriptAccess::Full,
            restricted_to: None,
            reflection_sensitive: false,
            signature: MethodSignature {
                params,
                type_params: 0,
                returns,
            },
            body: Arc::new(body),
        }
    }

    pub fn with_alt_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.alt_names.push(name.into());
        self
    }

    pub fn with_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn with_access(mut self, access: ScriptAccess) -> Self {
        self.access = access;
        self
    }

    pub fn restricted(mut self, context: AccessContextId) -> Self {
        self.restricted_to = Some(context);
        self
    }

    pub fn with_reflection_sensitive(mut self) -> Self {
        self.reflection_sensitive = true;
        self
    }

    pub fn with_type_params(mut self, count: usize) -> Self {
        self.signature.type_params = count;
        self
    }
}

#[derive(Clone)]
pub struct FieldDescription {
    pub name: Arc<str>,
    pub tag: TypeTag,
    pub is_static: bool,
    pub access: ScriptAccess,
    pub restricted_to: Option<AccessContextId>,
    pub default: Value,
}

impl Debug for FieldDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FieldDescription({})", self.name)
    }
}

impl FieldDescription {
    pub fn new(name: impl Into<Arc<str>>, tag: TypeTag, default: Value) -> Self {
        Self {
            name: name.into(),
            tag,
            is_static: false,
            access: ScriptAccess::Full,
            restricted_to: None,
            default,
        }
    }

    pub fn with_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn with_access(mut self, access: ScriptAccess) -> Self {
        self.access = access;
        self
    }

    pub fn restricted(mut self, context: AccessContextId) -> Self {
        self.restricted_to = Some(context);
        self
    }
}

pub struct PropertyDescription {
    pub name: Arc<str>,
    pub alt_names: Vec<Arc<str>>,
    pub tag: TypeTag,
    /// Number of index parameters; zero for plain properties.
    pub index_params: usize,
    pub is_static: bool,
    pub access: ScriptAccess,
    pub restricted_to: Option<AccessContextId>,
    pub getter: Option<MethodImpl>,
    pub setter: Option<MethodImpl>,
}

impl Debug for PropertyDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PropertyDescription({})", self.name)
    }
}

impl PropertyDescription {
    pub fn new(name: impl Into<Arc<str>>, tag: TypeTag) -> Self {
        Self {
            name: name.into(),
            alt_names: vec![],
            tag,
            index_params: 0,
            is_static: false,
            access: ScriptAccess::Full,
            restricted_to: None,
            getter: None,
            setter: None,
        }
    }

    pub fn with_getter(
        mut self,
        getter: impl Fn(Option<&Value>, &mut [Value]) -> Result<Value, BindError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.getter = Some(Arc::new(getter));
        self
    }

    pub fn with_setter(
        mut self,
        setter: impl Fn(Option<&Value>, &mut [Value]) -> Result<Value, BindError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    pub fn with_index_params(mut self, count: usize) -> Self {
        self.index_params = count;
        self
    }

    pub fn with_access(mut self, access: ScriptAccess) -> Self {
        self.access = access;
        self
    }
}

#[derive(Debug, Clone)]
pub struct EventDescription {
    pub name: Arc<str>,
}

struct TypeInner {
    name: Arc<str>,
    is_interface: bool,
    /// Type with no statically known members; candidates for the native
    /// dynamic-dispatch adapter.
    is_opaque: bool,
    base_interfaces: Vec<TypeDescription>,
    fields: Vec<FieldDescription>,
    methods: Vec<Arc<MethodDescription>>,
    properties: Vec<Arc<PropertyDescription>>,
    events: Vec<EventDescription>,
    constructors: Vec<Arc<MethodDescription>>,
}

/// A resolved host type. Cheap to clone; equality and hashing use the
/// identity of the backing descriptor, never its name.
#[derive(Clone)]
pub struct TypeDescription(Arc<TypeInner>);

impl TypeDescription {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_interface(&self) -> bool {
        self.0.is_interface
    }

    pub fn is_opaque(&self) -> bool {
        self.0.is_opaque
    }

    pub fn base_interfaces(&self) -> &[TypeDescription] {
        &self.0.base_interfaces
    }

    pub fn fields(&self) -> &[FieldDescription] {
        &self.0.fields
    }

    pub fn methods(&self) -> &[Arc<MethodDescription>] {
        &self.0.methods
    }

    pub fn properties(&self) -> &[Arc<PropertyDescription>] {
        &self.0.properties
    }

    pub fn events(&self) -> &[EventDescription] {
        &self.0.events
    }

    pub fn constructors(&self) -> &[Arc<MethodDescription>] {
        &self.0.constructors
    }

    /// Stable identity key for cache maps.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn builder(name: impl Into<Arc<str>>) -> TypeBuilder {
        TypeBuilder {
            name: name.into(),
            is_interface: false,
            is_opaque: false,
            base_interfaces: vec![],
            fields: vec![],
            methods: vec![],
            properties: vec![],
            events: vec![],
            constructors: vec![],
        }
    }
}

impl Debug for TypeDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

impl PartialEq for TypeDescription {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TypeDescription {}

impl Hash for TypeDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

pub struct TypeBuilder {
    name: Arc<str>,
    is_interface: bool,
    is_opaque: bool,
    base_interfaces: Vec<TypeDescription>,
    fields: Vec<FieldDescription>,
    methods: Vec<Arc<MethodDescription>>,
    properties: Vec<Arc<PropertyDescription>>,
    events: Vec<EventDescription>,
    constructors: Vec<Arc<MethodDescription>>,
}

impl TypeBuilder {
    pub fn interface(mut self) -> Self {
        self.is_interface = true;
        self
    }

    pub fn opaque(mut self) -> Self {
        self.is_opaque = true;
        self
    }

    pub fn extends(mut self, base: TypeDescription) -> Self {
        self.base_interfaces.push(base);
        self
    }

    pub fn field(mut self, field: FieldDescription) -> Self {
        self.fields.push(field);
        self
    }

    pub fn method(mut self, method: MethodDescription) -> Self {
        self.methods.push(Arc::new(method));
        self
    }

    pub fn property(mut self, property: PropertyDescription) -> Self {
        self.properties.push(Arc::new(property));
        self
    }

    pub fn event(mut self, name: impl Into<Arc<str>>) -> Self {
        self.events.push(EventDescription { name: name.into() });
        self
    }

    pub fn constructor(mut self, ctor: MethodDescription) -> Self {
        self.constructors.push(Arc::new(ctor));
        self
    }

    pub fn register(self, registry: &TypeRegistry) -> TypeDescription {
        let td = TypeDescription(Arc::new(TypeInner {
            name: self.name,
            is_interface: self.is_interface,
            is_opaque: self.is_opaque,
            base_interfaces: self.base_interfaces,
            fields: self.fields,
            methods: self.methods,
            properties: self.properties,
            events: self.events,
            constructors: self.constructors,
        }));
        registry.register(td.clone());
        td
    }
}

/// Process registry of host types, including the universal root type that
/// every wrapped value falls back to.
pub struct TypeRegistry {
    types: DashMap<Arc<str>, TypeDescription>,
    statics: DashMap<(usize, Arc<str>), Value>,
    root: TypeDescription,
}

impl TypeRegistry {
    pub fn new() -> Arc<Self> {
        let root = TypeDescription(Arc::new(TypeInner {
            name: Arc::from("Object"),
            is_interface: false,
            is_opaque: false,
            base_interfaces: vec![],
            fields: vec![],
            methods: vec![
                Arc::new(MethodDescription::new(
                    "ToString",
                    vec![],
                    TypeTag::Str,
                    |this, _args| {
                        let text = match this {
                            Some(v) => format!("{:?}", v),
                            None => "null".to_string(),
                        };
                        Ok(Value::from(text))
                    },
                )),
                Arc::new(
                    MethodDescription::new("GetType", vec![], TypeTag::Type, |this, _args| {
                        match this {
                            Some(Value::Object(o)) => Ok(Value::Type(o.ty().clone())),
                            _ => Ok(Value::Null),
                        }
                    })
                    .with_reflection_sensitive(),
                ),
            ],
            properties: vec![],
            events: vec![],
            constructors: vec![],
        }));

        let registry = Arc::new(Self {
            types: DashMap::new(),
            statics: DashMap::new(),
            root: root.clone(),
        });
        registry.register(root);
        registry
    }

    pub fn register(&self, td: TypeDescription) {
        self.types.insert(Arc::from(td.name()), td);
    }

    pub fn lookup(&self, name: &str) -> Option<TypeDescription> {
        self.types.get(name).map(|t| t.clone())
    }

    pub fn root(&self) -> &TypeDescription {
        &self.root
    }

    /// Read a static field, lazily initialized from its declared default.
    pub fn get_static(&self, ty: &TypeDescription, name: &str) -> Option<Value> {
        let field = ty
            .fields()
            .iter()
            .find(|f| f.is_static && &*f.name == name)?;
        let key = (ty.key(), field.name.clone());
        Some(
            self.statics
                .entry(key)
                .or_insert_with(|| field.default.clone())
                .clone(),
        )
    }

    pub fn set_static(&self, ty: &TypeDescription, name: &str, value: Value) -> bool {
        match ty
            .fields()
            .iter()
            .find(|f| f.is_static && &*f.name == name)
        {
            Some(field) => {
                self.statics.insert((ty.key(), field.name.clone()), value);
                true
            }
            None => false,
        }
    }
}
