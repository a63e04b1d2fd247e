//! Member-name enumeration and its two caches.
//!
//! Reflection-derived name sets are shared across all targets of the same
//! type through a weak, non-owning cache. Each target then keeps its own
//! merged view (adapter names, extension methods), tagged with everything
//! it was computed against so a changed extension registry or reassigned
//! variable cell forces a recompute.
use crate::{
    dynamic::{AdapterKind, DynamicOps},
    extensions::ExtensionRegistry,
    metrics::BindMetrics,
    target::{Target, TargetFlags},
    types::{member_visible, AccessContextId, DefaultAccess, TypeDescription},
};
use dashmap::DashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, OnceLock, Weak,
};

/// Script-visible member names of a target, split by member kind.
#[derive(Debug, Default)]
pub struct MemberNames {
    pub fields: Vec<Arc<str>>,
    pub methods: Vec<Arc<str>>,
    pub properties: Vec<Arc<str>>,
    pub events: Vec<Arc<str>>,
}

impl MemberNames {
    /// Every name, de-duplicated, in field/method/property/event order.
    pub fn all(&self) -> Vec<Arc<str>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = vec![];
        for name in self
            .fields
            .iter()
            .chain(self.methods.iter())
            .chain(self.properties.iter())
            .chain(self.events.iter())
        {
            if seen.insert(name.clone()) {
                out.push(name.clone());
            }
        }
        out
    }
}

/// Everything a per-target name set was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameCacheKey {
    pub context: AccessContextId,
    pub default_access: DefaultAccess,
    pub flags: TargetFlags,
    pub extension_version: u64,
    pub cell_generation: u64,
}

/// Per-target cached name set; lives inside the target wrapper.
pub struct NameCacheState {
    pub key: NameCacheKey,
    pub names: Arc<MemberNames>,
}

const DEAD_COMPACTION_THRESHOLD: usize = 16;

type SharedKey = (usize, AccessContextId, DefaultAccess);

/// Weak cache of reflection-derived name sets, shared by every target of
/// the same type under the same access context and policy.
pub struct SharedMemberDataCache {
    map: DashMap<SharedKey, Weak<MemberNames>>,
    dead_seen: AtomicUsize,
}

static SHARED: OnceLock<SharedMemberDataCache> = OnceLock::new();

impl SharedMemberDataCache {
    fn new() -> Self {
        Self {
            map: DashMap::new(),
            dead_seen: AtomicUsize::new(0),
        }
    }

    pub fn global() -> &'static SharedMemberDataCache {
        SHARED.get_or_init(SharedMemberDataCache::new)
    }

    fn get_or_compute(
        &self,
        ty: &TypeDescription,
        context: AccessContextId,
        default_access: DefaultAccess,
        metrics: Option<&BindMetrics>,
    ) -> Arc<MemberNames> {
        let key = (ty.key(), context, default_access);
        if let Some(existing) = self.map.get(&key).and_then(|weak| weak.upgrade()) {
            return existing;
        }
        if self.map.contains_key(&key) {
            self.dead_seen.fetch_add(1, Ordering::Relaxed);
            self.maybe_compact(metrics);
        }
        let computed = Arc::new(reflection_names(ty, context, default_access));
        self.map.insert(key, Arc::downgrade(&computed));
        computed
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

fn push_unique(out: &mut Vec<Arc<str>>, name: &Arc<str>) {
    if !out.iter().any(|n| n == name) {
        out.push(name.clone());
    }
}

fn collect_type(
    ty: &TypeDescription,
    context: AccessContextId,
    default_access: DefaultAccess,
    visited: &mut Vec<usize>,
    out: &mut MemberNames,
) {
    if visited.contains(&ty.key()) {
        return;
    }
    visited.push(ty.key());

    for field in ty.fields() {
        if member_visible(field.access, field.restricted_to, context, default_access) {
            push_unique(&mut out.fields, &field.name);
        }
    }
    for method in ty.methods() {
        if member_visible(method.access, method.restricted_to, context, default_access) {
            push_unique(&mut out.methods, &method.name);
            for alt in &method.alt_names {
                push_unique(&mut out.methods, alt);
            }
        }
    }
    for property in ty.properties() {
        // Indexed properties are reachable only through index access and
        // never show up in name enumeration.
        if property.index_params == 0
            && member_visible(
                property.access,
                property.restricted_to,
                context,
                default_access,
            )
        {
            push_unique(&mut out.properties, &property.name);
            for alt in &property.alt_names {
                push_unique(&mut out.properties, alt);
            }
        }
    }
    for event in ty.events() {
        push_unique(&mut out.events, &event.name);
    }

    for base in ty.base_interfaces() {
        collect_type(base, context, default_access, visited, out);
    }
}

fn reflection_names(
    ty: &TypeDescription,
    context: AccessContextId,
    default_access: DefaultAccess,
) -> MemberNames {
    let mut out = MemberNames::default();
    let mut visited = vec![];
    collect_type(ty, context, default_access, &mut visited, &mut out);
    out
}

/// The target's current member names.
///
/// The reflection-and-extension base set is recomputed only when the
/// access context, policy, flags, extension-registry version, or
/// variable-cell generation changed since the last enumeration. Adapter
/// names (bag keys, dispatch members, list indices) are merged fresh on
/// every call, so expando additions and deletions show up immediately.
pub fn names_for(
    target: &Target,
    context: AccessContextId,
    default_access: DefaultAccess,
    registry_root: &TypeDescription,
    metrics: Option<&BindMetrics>,
) -> Arc<MemberNames> {
    let adapter = target.dynamic_binding();
    let key = NameCacheKey {
        context,
        default_access,
        flags: target.flags(),
        extension_version: ExtensionRegistry::global().version(),
        cell_generation: target.cell().map(|c| c.generation()).unwrap_or(0),
    };

    let cached = target.name_state().read().as_ref().and_then(|state| {
        if state.key == key {
            Some(state.names.clone())
        } else {
            None
        }
    });

    let base = match cached {
        Some(base) => base,
        None => {
            if let Some(m) = metrics {
                m.record_name_cache_recompute();
            }

            let mut base = MemberNames::default();

            // Exclusive adapters (native dispatch) and property bags own
            // the member namespace outright; reflection names are
            // suppressed for them.
            let suppress_reflection =
                adapter.exclusive() || adapter.adapter_kind() == AdapterKind::PropertyBag;

            if !suppress_reflection {
                let reflected = SharedMemberDataCache::global().get_or_compute(
                    target.ty(),
                    context,
                    default_access,
                    metrics,
                );
                base.fields = reflected.fields.clone();
                base.methods = reflected.methods.clone();
                base.properties = reflected.properties.clone();
                base.events = reflected.events.clone();

                if target.ty() != registry_root {
                    let root = SharedMemberDataCache::global().get_or_compute(
                        registry_root,
                        context,
                        default_access,
                        metrics,
                    );
                    for name in &root.methods {
                        push_unique(&mut base.methods, name);
                    }
                }
            }

            if target.flags().contains(TargetFlags::ALLOW_EXTENSIONS)
                && adapter.adapter_kind() == AdapterKind::None
            {
                for name in ExtensionRegistry::global().method_names() {
                    push_unique(&mut base.methods, &name);
                }
            }

            let base = Arc::new(base);
            *target.name_state().write() = Some(NameCacheState {
                key,
                names: base.clone(),
            });
            base
        }
    };

    let adapter_names = adapter.member_names();
    if adapter_names.is_empty() {
        return base;
    }
    let mut merged = MemberNames {
        fields: base.fields.clone(),
        methods: base.methods.clone(),
        properties: base.properties.clone(),
        events: base.events.clone(),
    };
    for name in adapter_names {
        push_unique(&mut merged.properties, &name);
    }
    Arc::new(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::{
            FieldDescription, MethodDescription, ParamDescription, TypeRegistry, TypeTag,
        },
        value::{ObjectHandle, Value},
    };

    fn sample_target(registry: &Arc<TypeRegistry>) -> Target {
        let ty = TypeDescription::builder("Widget")
            .field(FieldDescription::new("Size", TypeTag::Int32, Value::Int32(0)))
            .method(MethodDescription::new(
                "Refresh",
                vec![],
                TypeTag::Any,
                |_, _| Ok(Value::Null),
            ))
            .register(registry);
        Target::wrap(
            Value::Object(ObjectHandle::new(ty)),
            None,
            TargetFlags::default(),
            registry,
            None,
        )
        .unwrap()
    }

    #[test]
    fn enumeration_includes_root_methods() {
        let registry = TypeRegistry::new();
        let target = sample_target(&registry);
        let names = names_for(&target, 0, DefaultAccess::Restricted, registry.root(), None);
        assert!(names.fields.iter().any(|n| &**n == "Size"));
        assert!(names.methods.iter().any(|n| &**n == "Refresh"));
        assert!(names.methods.iter().any(|n| &**n == "ToString"));
    }

    #[test]
    fn extension_registration_invalidates_cached_names() {
        let registry = TypeRegistry::new();
        let target = sample_target(&registry);
        let metrics = BindMetrics::new();

        let before = names_for(
            &target,
            0,
            DefaultAccess::Restricted,
            registry.root(),
            Some(&metrics),
        );
        assert!(!before.methods.iter().any(|n| &**n == "Embiggen"));
        // Second enumeration with nothing changed reuses the cached set.
        let again = names_for(
            &target,
            0,
            DefaultAccess::Restricted,
            registry.root(),
            Some(&metrics),
        );
        assert!(Arc::ptr_eq(&before, &again));
        assert_eq!(metrics.snapshot().name_cache_recomputes, 1);

        let ext = TypeDescription::builder("WidgetExtensions")
            .method(
                MethodDescription::new(
                    "Embiggen",
                    vec![ParamDescription::by_value(TypeTag::Object)],
                    TypeTag::Any,
                    |_, _| Ok(Value::Null),
                )
                .with_static(),
            )
            .register(&registry);
        ExtensionRegistry::global().register(ext.clone());

        let after = names_for(
            &target,
            0,
            DefaultAccess::Restricted,
            registry.root(),
            Some(&metrics),
        );
        assert!(after.methods.iter().any(|n| &**n == "Embiggen"));
        assert_eq!(metrics.snapshot().name_cache_recomputes, 2);

        ExtensionRegistry::global().unregister(&ext);
    }

    #[test]
    fn restricted_members_hidden_from_other_contexts() {
        let registry = TypeRegistry::new();
        let ty = TypeDescription::builder("Private")
            .field(
                FieldDescription::new("Secret", TypeTag::Str, Value::Null).restricted(7),
            )
            .register(&registry);

        let mine = reflection_names(&ty, 7, DefaultAccess::Restricted);
        assert!(mine.fields.iter().any(|n| &**n == "Secret"));

        let theirs = reflection_names(&ty, 8, DefaultAccess::Restricted);
        assert!(!theirs.fields.iter().any(|n| &**n == "Secret"));

        // Full default policy ignores the restriction.
        let relaxed = reflection_names(&ty, 8, DefaultAccess::Full);
        assert!(relaxed.fields.iter().any(|n| &**n == "Secret"));
    }
}
