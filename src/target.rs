//! The target model: uniform wrappers around host values, types, bound
//! members, and variable cells.
//!
//! Wrappers are immutable after construction. Repeated exposure of the
//! same identity-carrying value with the same capability flags returns the
//! same wrapper through a weak, non-owning identity cache; dead entries
//! are dropped opportunistically during lookups, never on a timer.
use crate::{
    dynamic::{classify, DynamicBinding},
    error::BindError,
    metrics::BindMetrics,
    names::NameCacheState,
    types::{TypeDescription, TypeRegistry, TypeTag},
    value::Value,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::{
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, OnceLock, Weak,
    },
};

/// Binding-capability flags carried by every target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetFlags(u8);

impl TargetFlags {
    pub const ALLOW_STATIC: TargetFlags = TargetFlags(1);
    pub const ALLOW_INSTANCE: TargetFlags = TargetFlags(2);
    pub const ALLOW_EXTENSIONS: TargetFlags = TargetFlags(4);
    /// Caller has suppressed dynamic member visibility; the generic
    /// metaobject adapter is skipped during classification.
    pub const SUPPRESS_DYNAMIC: TargetFlags = TargetFlags(8);

    pub const fn empty() -> TargetFlags {
        TargetFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: TargetFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: TargetFlags) -> TargetFlags {
        TargetFlags(self.0 | other.0)
    }

    pub const fn without(self, other: TargetFlags) -> TargetFlags {
        TargetFlags(self.0 & !other.0)
    }
}

impl Default for TargetFlags {
    fn default() -> Self {
        TargetFlags::ALLOW_INSTANCE.with(TargetFlags::ALLOW_EXTENSIONS)
    }
}

/// A typed, mutable variable slot. Reassignment bumps the generation
/// counter, which forces the owning target to recompute its capability
/// adapter on next use.
#[derive(Clone)]
pub struct VariableCell {
    slot: Arc<RwLock<Value>>,
    tag: TypeTag,
    generation: Arc<AtomicU64>,
}

impl VariableCell {
    pub fn new(tag: TypeTag, initial: Value) -> Result<VariableCell, BindError> {
        if matches!(initial, Value::ByRef(_)) {
            return Err(BindError::UnsupportedTargetType(
                "cannot construct a variable over a by-ref wrapper".to_string(),
            ));
        }
        if !initial.is_null() && TypeTag::conversion_cost(tag, TypeTag::of(&initial)).is_none() {
            return Err(BindError::UnsupportedTargetType(format!(
                "initial value {:?} is not assignable to a {:?} variable",
                initial, tag
            )));
        }
        Ok(VariableCell {
            slot: Arc::new(RwLock::new(initial)),
            tag,
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn get(&self) -> Value {
        self.slot.read().clone()
    }

    pub fn set(&self, value: Value) -> Result<(), BindError> {
        if matches!(value, Value::ByRef(_)) {
            return Err(BindError::UnsupportedTargetType(
                "cannot store a by-ref wrapper in a variable".to_string(),
            ));
        }
        if !value.is_null() && TypeTag::conversion_cost(self.tag, TypeTag::of(&value)).is_none() {
            return Err(BindError::UnsupportedTargetType(format!(
                "value {:?} is not assignable to a {:?} variable",
                value, self.tag
            )));
        }
        *self.slot.write() = value;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn slot(&self) -> Arc<RwLock<Value>> {
        self.slot.clone()
    }
}

impl Debug for VariableCell {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "VariableCell({:?})", self.tag)
    }
}

#[derive(Clone)]
pub enum TargetKind {
    /// A plain wrapped runtime value.
    Value,
    /// A type object exposed for static member access.
    TypeObject,
    /// A method bound to a receiver; invoked with an empty member name.
    BoundMethod(Arc<str>),
    /// An indexed property bound to a receiver.
    IndexedProperty(Arc<str>),
    Variable(VariableCell),
}

impl Debug for TargetKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Value => write!(f, "Value"),
            TargetKind::TypeObject => write!(f, "TypeObject"),
            TargetKind::BoundMethod(name) => write!(f, "BoundMethod({})", name),
            TargetKind::IndexedProperty(name) => write!(f, "IndexedProperty({})", name),
            TargetKind::Variable(cell) => write!(f, "Variable({:?})", cell),
        }
    }
}

pub(crate) struct TargetInner {
    pub(crate) kind: TargetKind,
    pub(crate) value: Value,
    pub(crate) ty: TypeDescription,
    pub(crate) flags: TargetFlags,
    /// Capability adapter, computed once per target identity. The u64 is
    /// the variable-cell generation the binding was computed against.
    pub(crate) dynamic: RwLock<Option<(u64, DynamicBinding)>>,
    pub(crate) names: RwLock<Option<NameCacheState>>,
}

#[derive(Clone)]
pub struct Target {
    inner: Arc<TargetInner>,
}

impl Debug for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target({:?}, {:?})", self.inner.kind, self.inner.ty)
    }
}

impl Target {
    /// Wrap a runtime value for member access.
    ///
    /// Wrapping an already-wrapped indirection (a by-ref wrapper around
    /// another by-ref wrapper) is rejected; unwrap first. Wrapping null
    /// yields a null wrapper whose member operations resolve nothing.
    pub fn wrap(
        value: Value,
        declared: Option<TypeDescription>,
        flags: TargetFlags,
        registry: &TypeRegistry,
        metrics: Option<&BindMetrics>,
    ) -> Result<Target, BindError> {
        if let Value::ByRef(slot) = &value {
            if matches!(slot.read(), Value::ByRef(_)) {
                return Err(BindError::UnsupportedTargetType(
                    "target is already a reference wrapper; unwrap it first".to_string(),
                ));
            }
        }

        if let Value::Type(td) = &value {
            let inner = Arc::new(TargetInner {
                kind: TargetKind::TypeObject,
                ty: td.clone(),
                value,
                flags: flags.with(TargetFlags::ALLOW_STATIC),
                dynamic: RwLock::new(None),
                names: RwLock::new(None),
            });
            return Ok(Target { inner });
        }

        let ty = declared
            .or_else(|| match &value {
                Value::Object(o) => Some(o.ty().clone()),
                _ => None,
            })
            .unwrap_or_else(|| registry.root().clone());

        if let Some(identity) = value.identity() {
            let cache = TargetIdentityCache::global();
            if let Some(existing) = cache.lookup(identity, flags, metrics) {
                return Ok(Target { inner: existing });
            }
            let inner = Arc::new(TargetInner {
                kind: TargetKind::Value,
                value,
                ty,
                flags,
                dynamic: RwLock::new(None),
                names: RwLock::new(None),
            });
            cache.insert(identity, flags, &inner);
            return Ok(Target { inner });
        }

        Ok(Target {
            inner: Arc::new(TargetInner {
                kind: TargetKind::Value,
                value,
                ty,
                flags,
                dynamic: RwLock::new(None),
                names: RwLock::new(None),
            }),
        })
    }

    pub fn for_variable(cell: VariableCell, registry: &TypeRegistry) -> Target {
        Target {
            inner: Arc::new(TargetInner {
                kind: TargetKind::Variable(cell),
                value: Value::Null,
                ty: registry.root().clone(),
                flags: TargetFlags::default(),
                dynamic: RwLock::new(None),
                names: RwLock::new(None),
            }),
        }
    }

    pub fn bound_method(receiver: Value, name: impl Into<Arc<str>>, ty: TypeDescription) -> Target {
        Target {
            inner: Arc::new(TargetInner {
                kind: TargetKind::BoundMethod(name.into()),
                value: receiver,
                ty,
                flags: TargetFlags::ALLOW_INSTANCE,
                dynamic: RwLock::new(None),
                names: RwLock::new(None),
            }),
        }
    }

    pub fn indexed_property(
        receiver: Value,
        name: impl Into<Arc<str>>,
        ty: TypeDescription,
    ) -> Target {
        Target {
            inner: Arc::new(TargetInner {
                kind: TargetKind::IndexedProperty(name.into()),
                value: receiver,
                ty,
                flags: TargetFlags::ALLOW_INSTANCE,
                dynamic: RwLock::new(None),
                names: RwLock::new(None),
            }),
        }
    }

    pub fn kind(&self) -> &TargetKind {
        &self.inner.kind
    }

    pub fn ty(&self) -> &TypeDescription {
        &self.inner.ty
    }

    pub fn flags(&self) -> TargetFlags {
        self.inner.flags
    }

    pub fn cell(&self) -> Option<&VariableCell> {
        match &self.inner.kind {
            TargetKind::Variable(cell) => Some(cell),
            _ => None,
        }
    }

    /// The value member operations apply to right now. For variable cells
    /// this reads the slot; for everything else it is the wrapped value.
    pub fn current_value(&self) -> Value {
        match &self.inner.kind {
            TargetKind::Variable(cell) => cell.get(),
            _ => self.inner.value.clone(),
        }
    }

    /// The capability adapter for this target, classified once and reused
    /// until the target's identity changes (a reassigned variable cell).
    pub fn dynamic_binding(&self) -> DynamicBinding {
        let generation = self.cell().map(|c| c.generation()).unwrap_or(0);
        if let Some((cached_gen, binding)) = &*self.inner.dynamic.read() {
            if *cached_gen == generation {
                return binding.clone();
            }
        }
        let binding = classify(self);
        *self.inner.dynamic.write() = Some((generation, binding.clone()));
        binding
    }

    pub(crate) fn name_state(&self) -> &RwLock<Option<NameCacheState>> {
        &self.inner.names
    }
}

const DEAD_COMPACTION_THRESHOLD: usize = 16;

/// Weak, non-owning identity cache for target wrappers. The script
/// runtime's live reference graph is the canonical owner; this map never
/// keeps a host value alive.
pub struct TargetIdentityCache {
    map: DashMap<(usize, u8), Weak<TargetInner>>,
    dead_seen: AtomicUsize,
}

static IDENTITY_CACHE: OnceLock<TargetIdentityCache> = OnceLock::new();

impl TargetIdentityCache {
    fn new() -> Self {
        Self {
            map: DashMap::new(),
            dead_seen: AtomicUsize::new(0),
        }
    }

    pub fn global() -> &'static TargetIdentityCache {
        IDENTITY_CACHE.get_or_init(TargetIdentityCache::new)
    }

    fn lookup(
        &self,
        identity: usize,
        flags: TargetFlags,
        metrics: Option<&BindMetrics>,
    ) -> Option<Arc<TargetInner>> {
        let key = (identity, flags.bits());
        let found = self.map.get(&key).and_then(|weak| weak.upgrade());
        match &found {
            Some(_) => {
                if let Some(m) = metrics {
                    m.record_identity_hit();
                }
            }
            None => {
                if self.map.contains_key(&key) {
                    // Entry exists but its wrapper died.
                    self.dead_seen.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(m) = metrics {
                    m.record_identity_miss();
                }
                self.maybe_compact(metrics);
            }
        }
        found
    }

    fn insert(&self, identity: usize, flags: TargetFlags, inner: &Arc<TargetInner>) {
        self.map
            .insert((identity, flags.bits()), Arc::downgrade(inner));
    }

    fn maybe_compact(&self, metrics: Option<&BindMetrics>) {
        if self.dead_seen.load(Ordering::Relaxed) < DEAD_COMPACTION_THRESHOLD {
            return;
        }
        self.dead_seen.store(0, Ordering::Relaxed);
        self.map.retain(|_, weak| weak.strong_count() > 0);
        if let Some(m) = metrics {
            m.record_weak_compaction();
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
        self.dead_seen.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ListHandle, ObjectHandle};

    #[test]
    fn same_identity_and_flags_share_a_wrapper() {
        let registry = TypeRegistry::new();
        let ty = TypeDescription::builder("Sample").register(&registry);
        let obj = Value::Object(ObjectHandle::new(ty));

        let a = Target::wrap(obj.clone(), None, TargetFlags::default(), &registry, None).unwrap();
        let b = Target::wrap(obj, None, TargetFlags::default(), &registry, None).unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn different_flags_produce_distinct_wrappers() {
        let registry = TypeRegistry::new();
        let list = Value::List(ListHandle::new(vec![]));
        let a = Target::wrap(list.clone(), None, TargetFlags::default(), &registry, None).unwrap();
        let b = Target::wrap(
            list,
            None,
            TargetFlags::default().with(TargetFlags::SUPPRESS_DYNAMIC),
            &registry,
            None,
        )
        .unwrap();
        assert!(!Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn nested_byref_wrap_is_rejected() {
        use crate::value::{ByRefSlot, RefKind};
        let registry = TypeRegistry::new();
        let inner = Value::ByRef(ByRefSlot::new(RefKind::Ref, Value::Int32(1)));
        let nested = Value::ByRef(ByRefSlot::new(RefKind::Ref, inner));
        let err = Target::wrap(nested, None, TargetFlags::default(), &registry, None).unwrap_err();
        assert!(matches!(err, BindError::UnsupportedTargetType(_)));
    }

    #[test]
    fn variable_cell_rejects_incompatible_writes() {
        let cell = VariableCell::new(TypeTag::Int32, Value::Int32(42)).unwrap();
        assert!(cell.set(Value::Str("no".into())).is_err());
        assert!(cell.set(Value::Int32(100)).is_ok());
        assert_eq!(cell.get(), Value::Int32(100));
    }
}
