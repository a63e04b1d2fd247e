//! The binding engine: resolves member operations against wrapped targets
//! and invokes what it finds.
//!
//! Resolution runs in a fixed order: type-argument filtering, the two
//! cache tiers, scored structural resolution on the target's type, its
//! alternate names, interface and root fallback, an arity-only manual
//! scan, and finally extension methods. Every outcome, failures included,
//! lands back in the caches under its structural signature.
use crate::{
    cache::{CachedBind, ContextBindCache, GlobalBindCache, MethodBindData},
    dynamic::{AdapterKind, DynamicBinding, DynamicOps, NoAdapter},
    error::{BindError, FailureReason},
    extensions::ExtensionRegistry,
    metrics::{BindMetrics, BindStats},
    names::{names_for, MemberNames},
    signature::{BindSignature, InvokeMode},
    target::{Target, TargetFlags, TargetKind},
    types::{
        member_visible, AccessContextId, DefaultAccess, FieldDescription, MethodDescription,
        ParamDescription, PropertyDescription, ScriptAccess, TypeDescription, TypeRegistry,
        TypeTag,
    },
    value::{ByRefSlot, ScriptCallable, Value},
};
use std::sync::Arc;

/// Name used for constructor binds in cache signatures.
const CTOR_NAME: &str = ".ctor";

/// Per-binder policy switches.
#[derive(Debug, Clone, Copy)]
pub struct BinderOptions {
    /// Permit invocation of reflection-sensitive members.
    pub allow_reflection: bool,
    /// Permit the arity-only manual scan when scored resolution fails.
    pub use_reflection_fallback: bool,
    /// Ignore native dispatch capabilities entirely.
    pub disable_native_binding: bool,
}

impl Default for BinderOptions {
    fn default() -> Self {
        Self {
            allow_reflection: false,
            use_reflection_fallback: true,
            disable_native_binding: false,
        }
    }
}

/// One engine's view of the binding machinery: an access context, a
/// default-access policy, a contextual cache tier, and counters.
pub struct Binder {
    context: AccessContextId,
    default_access: DefaultAccess,
    options: BinderOptions,
    registry: Arc<TypeRegistry>,
    contextual: ContextBindCache,
    metrics: Arc<BindMetrics>,
}

impl Binder {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            context: 0,
            default_access: DefaultAccess::Restricted,
            options: BinderOptions::default(),
            registry,
            contextual: ContextBindCache::new(),
            metrics: Arc::new(BindMetrics::new()),
        }
    }

    pub fn with_context(mut self, context: AccessContextId) -> Self {
        self.context = context;
        self
    }

    pub fn with_default_access(mut self, default_access: DefaultAccess) -> Self {
        self.default_access = default_access;
        self
    }

    pub fn with_options(mut self, options: BinderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn context(&self) -> AccessContextId {
        self.context
    }

    pub fn metrics(&self) -> &BindMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> BindStats {
        self.metrics.snapshot()
    }

    pub fn clear_contextual_cache(&self) {
        self.contextual.clear();
    }

    /// Wrap a value for member access through this binder, sharing wrapper
    /// identity with previous wraps of the same value and flags.
    pub fn wrap(
        &self,
        value: Value,
        declared: Option<TypeDescription>,
        flags: TargetFlags,
    ) -> Result<Target, BindError> {
        Target::wrap(value, declared, flags, &self.registry, Some(&self.metrics))
    }

    fn adapter_for(&self, target: &Target) -> DynamicBinding {
        let adapter = target.dynamic_binding();
        if self.options.disable_native_binding && adapter.adapter_kind() == AdapterKind::Dispatch {
            return NoAdapter.into();
        }
        adapter
    }

    /// The type member resolution runs against. Variables and untyped
    /// wrappers resolve against the value they currently hold; an explicit
    /// declared type wins otherwise.
    fn effective_type(&self, target: &Target) -> TypeDescription {
        let declared = target.ty();
        if target.cell().is_none() && declared != self.registry.root() {
            return declared.clone();
        }
        match target.current_value() {
            Value::Object(o) => o.ty().clone(),
            Value::ByRef(slot) => match slot.read() {
                Value::Object(o) => o.ty().clone(),
                _ => declared.clone(),
            },
            _ => declared.clone(),
        }
    }

    /// The receiver instance methods and accessors are invoked against.
    fn receiver_value(&self, target: &Target) -> Value {
        match target.current_value() {
            Value::ByRef(slot) => slot.read(),
            other => other,
        }
    }

    fn visible(&self, access: ScriptAccess, restricted_to: Option<AccessContextId>) -> bool {
        member_visible(access, restricted_to, self.context, self.default_access)
    }

    fn static_allowed(&self, target: &Target, is_static: bool) -> bool {
        match target.kind() {
            TargetKind::TypeObject => is_static,
            _ => {
                if is_static {
                    target.flags().contains(TargetFlags::ALLOW_STATIC)
                } else {
                    target.flags().contains(TargetFlags::ALLOW_INSTANCE)
                }
            }
        }
    }

    /// The target's type followed by its interfaces (depth-first) and the
    /// universal root, visited at most once each.
    fn type_chain(&self, ty: &TypeDescription) -> Vec<TypeDescription> {
        fn walk(ty: &TypeDescription, out: &mut Vec<TypeDescription>) {
            if out.contains(ty) {
                return;
            }
            out.push(ty.clone());
            for base in ty.base_interfaces() {
                walk(base, out);
            }
        }
        let mut chain = vec![];
        walk(ty, &mut chain);
        let root = self.registry.root();
        if !chain.contains(root) {
            chain.push(root.clone());
        }
        chain
    }

    fn find_field(
        &self,
        target: &Target,
        ty: &TypeDescription,
        name: &str,
    ) -> Option<(TypeDescription, FieldDescription)> {
        for link in self.type_chain(ty) {
            for field in link.fields() {
                if &*field.name == name
                    && self.visible(field.access, field.restricted_to)
                    && self.static_allowed(target, field.is_static)
                {
                    return Some((link.clone(), field.clone()));
                }
            }
        }
        None
    }

    fn find_property(
        &self,
        target: &Target,
        ty: &TypeDescription,
        name: &str,
    ) -> Option<Arc<PropertyDescription>> {
        // Exact names, then alternates, one chain link at a time: an
        // alternate name on the declared type beats an exact name further
        // up the chain.
        for link in self.type_chain(ty) {
            for alt_pass in [false, true] {
                for property in link.properties() {
                    let matched = if alt_pass {
                        property.alt_names.iter().any(|a| &**a == name)
                    } else {
                        &*property.name == name
                    };
                    if matched
                        && property.index_params == 0
                        && self.visible(property.access, property.restricted_to)
                        && self.static_allowed(target, property.is_static)
                    {
                        return Some(property.clone());
                    }
                }
            }
        }
        None
    }

    /// Matching methods declared on one chain link.
    fn methods_on(
        &self,
        target: &Target,
        link: &TypeDescription,
        name: &str,
        alt_pass: bool,
    ) -> Vec<(TypeDescription, Arc<MethodDescription>)> {
        let mut found = vec![];
        for method in link.methods() {
            let matched = if alt_pass {
                method.alt_names.iter().any(|a| &**a == name)
            } else {
                &*method.name == name
            };
            if matched
                && self.visible(method.access, method.restricted_to)
                && self.static_allowed(target, method.is_static)
            {
                found.push((link.clone(), method.clone()));
            }
        }
        found
    }

    /// Matching methods across the whole chain.
    fn methods_named(
        &self,
        target: &Target,
        ty: &TypeDescription,
        name: &str,
        alt_pass: bool,
    ) -> Vec<(TypeDescription, Arc<MethodDescription>)> {
        let mut found = vec![];
        for link in self.type_chain(ty) {
            found.extend(self.methods_on(target, &link, name, alt_pass));
        }
        found
    }

    // ---- method binding -------------------------------------------------

    /// Resolve a method bind for `name` against the target, consulting and
    /// feeding both cache tiers.
    fn bind_method(
        &self,
        target: &Target,
        name: &str,
        mode: InvokeMode,
        type_args: &[TypeDescription],
        bind_args: &[Value],
    ) -> Result<MethodBindData, BindError> {
        let ty = self.effective_type(target);
        let signature = BindSignature::new(
            self.context,
            mode,
            target.flags(),
            ty.clone(),
            name,
            type_args,
            bind_args,
        );

        if let Some(cached) = self.contextual.lookup(&signature) {
            self.metrics.record_contextual_hit();
            return self.materialize(cached, name, mode);
        }
        self.metrics.record_contextual_miss();

        if let Some(cached) = GlobalBindCache::global().lookup(&signature) {
            self.metrics.record_core_hit();
            self.contextual.store(signature, cached.clone());
            return self.materialize(cached, name, mode);
        }
        self.metrics.record_core_miss();

        let resolved = self.resolve_uncached(target, &ty, name, type_args, bind_args);
        self.metrics.record_structural_resolution();

        let cached = match &resolved {
            Ok(data) => CachedBind::Method(data.clone()),
            Err(reason) => CachedBind::Failure(reason.clone()),
        };
        GlobalBindCache::global().store(signature.clone(), cached.clone());
        self.contextual.store(signature, cached);

        resolved.map_err(|reason| reason.surface(name, mode))
    }

    fn materialize(
        &self,
        cached: CachedBind,
        name: &str,
        mode: InvokeMode,
    ) -> Result<MethodBindData, BindError> {
        match cached {
            CachedBind::Method(data) => Ok(data),
            CachedBind::Failure(reason) => Err(reason.surface(name, mode)),
        }
    }

    fn resolve_uncached(
        &self,
        target: &Target,
        ty: &TypeDescription,
        name: &str,
        type_args: &[TypeDescription],
        bind_args: &[Value],
    ) -> Result<MethodBindData, FailureReason> {
        let shape = arg_shape(bind_args);

        // Scored resolution walks the chain one link at a time, exact
        // names then alternates on each link. An alternate name on the
        // declared type is tried before anything inherited from an
        // interface or the root.
        for link in self.type_chain(ty) {
            for alt_pass in [false, true] {
                let candidates = self.methods_on(target, &link, name, alt_pass);
                match score_candidates(&candidates, type_args.len(), &shape) {
                    Resolution::One(declaring, method) => {
                        return Ok(MethodBindData {
                            declaring,
                            method,
                            via_extension: None,
                            type_args: type_args.to_vec().into(),
                        });
                    }
                    Resolution::Tie(count) => {
                        return Err(FailureReason::Ambiguous { candidates: count })
                    }
                    Resolution::None => {}
                }
            }
        }

        // Manual scan: arity only, static types ignored.
        if self.options.use_reflection_fallback {
            let mut by_arity: Vec<(TypeDescription, Arc<MethodDescription>)> = vec![];
            for alt_pass in [false, true] {
                for (declaring, method) in self.methods_named(target, ty, name, alt_pass) {
                    if method.signature.type_params == type_args.len()
                        && method.signature.params.len() == bind_args.len()
                        && !by_arity.iter().any(|(_, m)| Arc::ptr_eq(m, &method))
                    {
                        by_arity.push((declaring, method));
                    }
                }
            }
            match by_arity.len() {
                0 => {}
                1 => {
                    let (declaring, method) = by_arity.remove(0);
                    return Ok(MethodBindData {
                        declaring,
                        method,
                        via_extension: None,
                        type_args: type_args.to_vec().into(),
                    });
                }
                n => return Err(FailureReason::Ambiguous { candidates: n }),
            }
        }

        // Extension methods: the target becomes the implicit first argument.
        if target.flags().contains(TargetFlags::ALLOW_EXTENSIONS)
            && self.adapter_for(target).adapter_kind() == AdapterKind::None
            && !matches!(target.kind(), TargetKind::TypeObject)
        {
            let target_tag = Some(TypeTag::of(&self.receiver_value(target)));
            let mut extended_shape = Vec::with_capacity(shape.len() + 1);
            extended_shape.push(target_tag);
            extended_shape.extend_from_slice(&shape);

            let candidates = ExtensionRegistry::global().candidates(name);
            let mut best: Option<(u32, TypeDescription, Arc<MethodDescription>)> = None;
            let mut tie = 0usize;
            for (declaring, method) in candidates {
                if method.signature.type_params != type_args.len() {
                    continue;
                }
                if let Some(cost) = score_params(&method.signature.params, &extended_shape) {
                    match &best {
                        Some((b, _, _)) if *b < cost => {}
                        Some((b, _, _)) if *b == cost => tie += 1,
                        _ => {
                            best = Some((cost, declaring, method));
                            tie = 1;
                        }
                    }
                }
            }
            match (best, tie) {
                (Some((_, declaring, method)), 1) => {
                    return Ok(MethodBindData {
                        declaring: declaring.clone(),
                        method,
                        via_extension: Some(declaring),
                        type_args: type_args.to_vec().into(),
                    });
                }
                (Some(_), n) => return Err(FailureReason::Ambiguous { candidates: n }),
                (None, _) => {}
            }
        }

        Err(FailureReason::NotFound)
    }

    /// Invoke a resolved bind against live arguments. By-ref positions are
    /// written back to the caller whether the body succeeded or failed.
    fn invoke_bound(
        &self,
        data: &MethodBindData,
        target: &Target,
        name: &str,
        args: &mut [Value],
    ) -> Result<Value, BindError> {
        if data.method.reflection_sensitive && !self.options.allow_reflection {
            return Err(BindError::AccessDenied {
                name: name.to_string(),
                reason: "reflection-sensitive member and reflection is disabled".to_string(),
            });
        }

        let receiver = self.receiver_value(target);
        if data.via_extension.is_some() {
            invoke_method_body(&data.method, None, args, Some(receiver))
        } else if data.method.is_static {
            invoke_method_body(&data.method, None, args, None)
        } else {
            invoke_method_body(&data.method, Some(&receiver), args, None)
        }
    }

    // ---- member operations ----------------------------------------------

    /// Pseudo-members exposed on variable-cell targets: `value` reads or
    /// writes the cell, `ref`/`out` expose it as a by-ref wrapper.
    fn cell_pseudo_get(&self, target: &Target, name: &str) -> Option<Result<Value, BindError>> {
        let cell = target.cell()?;
        match name {
            "value" => Some(Ok(cell.get())),
            "ref" => Some(Ok(Value::ByRef(ByRefSlot {
                cell: cell.slot(),
                kind: crate::value::RefKind::Ref,
            }))),
            "out" => Some(Ok(Value::ByRef(ByRefSlot {
                cell: cell.slot(),
                kind: crate::value::RefKind::Out,
            }))),
            _ => None,
        }
    }

    pub fn get_member(&self, target: &Target, name: &str) -> Result<Value, BindError> {
        if let Some(result) = self.cell_pseudo_get(target, name) {
            return result;
        }

        let adapter = self.adapter_for(target);
        if let Some(result) = adapter.get_member(name) {
            return result;
        }
        if adapter.exclusive() {
            return Err(BindError::MemberNotFound {
                name: name.to_string(),
                mode: InvokeMode::Get,
            });
        }

        let ty = self.effective_type(target);

        if let Some((declaring, field)) = self.find_field(target, &ty, name) {
            return Ok(if field.is_static {
                self.registry
                    .get_static(&declaring, name)
                    .unwrap_or(Value::Null)
            } else {
                match self.receiver_value(target) {
                    Value::Object(o) => o.get_field(name).unwrap_or(Value::Null),
                    _ => Value::Null,
                }
            });
        }

        if let Some(property) = self.find_property(target, &ty, name) {
            let getter = property.getter.clone().ok_or_else(|| BindError::AccessDenied {
                name: name.to_string(),
                reason: "property has no getter".to_string(),
            })?;
            let receiver = self.receiver_value(target);
            let this = if property.is_static { None } else { Some(&receiver) };
            return getter(this, &mut []);
        }

        // A method name under Get produces a bound callable over the
        // overload group of the nearest declaring chain link; selection
        // happens at call time.
        let mut group = vec![];
        'links: for link in self.type_chain(&ty) {
            for alt_pass in [false, true] {
                group = self.methods_on(target, &link, name, alt_pass);
                if !group.is_empty() {
                    break 'links;
                }
            }
        }
        if !group.is_empty() {
            if group
                .iter()
                .any(|(_, m)| m.reflection_sensitive && !self.options.allow_reflection)
            {
                return Err(BindError::AccessDenied {
                    name: name.to_string(),
                    reason: "reflection-sensitive member and reflection is disabled".to_string(),
                });
            }
            return Ok(bound_method_callable(
                name,
                group.into_iter().map(|(_, m)| m).collect(),
                if group_is_static(target) {
                    None
                } else {
                    Some(self.receiver_value(target))
                },
                None,
            ));
        }

        if target.flags().contains(TargetFlags::ALLOW_EXTENSIONS)
            && adapter.adapter_kind() == AdapterKind::None
            && !matches!(target.kind(), TargetKind::TypeObject)
        {
            let ext: Vec<Arc<MethodDescription>> = ExtensionRegistry::global()
                .candidates(name)
                .into_iter()
                .map(|(_, m)| m)
                .collect();
            if !ext.is_empty() {
                return Ok(bound_method_callable(
                    name,
                    ext,
                    None,
                    Some(self.receiver_value(target)),
                ));
            }
        }

        Err(BindError::MemberNotFound {
            name: name.to_string(),
            mode: InvokeMode::Get,
        })
    }

    pub fn set_member(&self, target: &Target, name: &str, value: Value) -> Result<(), BindError> {
        if target.cell().is_some() && name == "value" {
            return target
                .cell()
                .map(|c| c.set(value.clone()))
                .unwrap_or(Ok(()));
        }

        let adapter = self.adapter_for(target);
        if let Some(result) = adapter.set_member(name, &value) {
            return result;
        }
        if adapter.exclusive() {
            return Err(BindError::MemberNotFound {
                name: name.to_string(),
                mode: InvokeMode::Set,
            });
        }

        let ty = self.effective_type(target);

        if let Some((declaring, field)) = self.find_field(target, &ty, name) {
            if field.access != ScriptAccess::Full {
                return Err(BindError::AccessDenied {
                    name: name.to_string(),
                    reason: "member is read-only".to_string(),
                });
            }
            if field.is_static {
                self.registry.set_static(&declaring, name, value);
                return Ok(());
            }
            return match self.receiver_value(target) {
                Value::Object(o) => {
                    o.set_field(name, value);
                    Ok(())
                }
                other => Err(BindError::UnsupportedTargetType(format!(
                    "cannot write instance field on {:?}",
                    other.kind()
                ))),
            };
        }

        if let Some(property) = self.find_property(target, &ty, name) {
            if property.access == ScriptAccess::ReadOnly {
                return Err(BindError::AccessDenied {
                    name: name.to_string(),
                    reason: "member is read-only".to_string(),
                });
            }
            let setter = property.setter.clone().ok_or_else(|| BindError::AccessDenied {
                name: name.to_string(),
                reason: "property has no setter".to_string(),
            })?;
            let receiver = self.receiver_value(target);
            let this = if property.is_static { None } else { Some(&receiver) };
            let mut args = [value];
            return setter(this, &mut args).map(|_| ());
        }

        if !self.methods_named(target, &ty, name, false).is_empty() {
            return Err(BindError::InvalidInvocationMode {
                name: name.to_string(),
                mode: InvokeMode::Set,
            });
        }

        // Nothing statically known and the adapter already declined the
        // write above; an expando creation has nowhere to go.
        Err(BindError::CapabilityNotSupported(
            "expando member creation".to_string(),
        ))
    }

    /// Call the named member with the given arguments. `bind_args`, when
    /// provided, drive overload resolution instead of the live arguments.
    pub fn invoke(
        &self,
        target: &Target,
        name: &str,
        type_args: &[TypeDescription],
        args: &mut [Value],
        bind_args: Option<&[Value]>,
    ) -> Result<Value, BindError> {
        let name: &str = match target.kind() {
            TargetKind::BoundMethod(bound) if name.is_empty() => &**bound,
            _ => name,
        };

        let adapter = self.adapter_for(target);
        if let Some(result) = adapter.invoke_member(name, args) {
            return result;
        }
        if adapter.exclusive() {
            return Err(BindError::MemberNotFound {
                name: name.to_string(),
                mode: InvokeMode::Call,
            });
        }

        // Leading type tokens stand in for explicit type arguments when a
        // generic overload of matching type arity exists; peel them off
        // and bind against the remainder.
        let mut peeled: Vec<TypeDescription> = if type_args.is_empty() {
            args.iter()
                .map_while(|arg| match arg {
                    Value::Type(td) => Some(td.clone()),
                    _ => None,
                })
                .collect()
        } else {
            vec![]
        };
        if !peeled.is_empty() {
            let ty = self.effective_type(target);
            let exact = self.methods_named(target, &ty, name, false);
            let alts = self.methods_named(target, &ty, name, true);
            if !exact
                .iter()
                .chain(alts.iter())
                .any(|(_, m)| m.signature.type_params == peeled.len())
            {
                peeled.clear();
            }
        }
        let split = peeled.len();
        let type_args = if split > 0 { &peeled[..] } else { type_args };
        let args = &mut args[split..];

        let binding_args: &[Value] = match bind_args {
            Some(bound) => bound.get(split..).unwrap_or(&[]),
            None => args,
        };
        match self.bind_method(target, name, InvokeMode::Call, type_args, binding_args) {
            Ok(data) => self.invoke_bound(&data, target, name, args),
            Err(BindError::MemberNotFound { .. }) => {
                // A field or property holding a callable is still callable.
                match self.get_member(target, name) {
                    Ok(Value::Callable(callable)) => callable.invoke(args),
                    Ok(_) => Err(BindError::InvalidInvocationMode {
                        name: name.to_string(),
                        mode: InvokeMode::Call,
                    }),
                    Err(_) => Err(BindError::MemberNotFound {
                        name: name.to_string(),
                        mode: InvokeMode::Call,
                    }),
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Construct an instance of a type-object target.
    pub fn construct(&self, target: &Target, args: &mut [Value]) -> Result<Value, BindError> {
        let ty = match target.kind() {
            TargetKind::TypeObject => target.ty().clone(),
            _ => {
                return Err(BindError::InvalidInvocationMode {
                    name: target.ty().name().to_string(),
                    mode: InvokeMode::Construct,
                })
            }
        };

        let signature = BindSignature::new(
            self.context,
            InvokeMode::Construct,
            target.flags(),
            ty.clone(),
            CTOR_NAME,
            &[],
            args,
        );

        if let Some(cached) = self.contextual.lookup(&signature) {
            self.metrics.record_contextual_hit();
            let data = self.materialize(cached, CTOR_NAME, InvokeMode::Construct)?;
            return invoke_method_body(&data.method, None, args, None);
        }
        self.metrics.record_contextual_miss();
        if let Some(cached) = GlobalBindCache::global().lookup(&signature) {
            self.metrics.record_core_hit();
            self.contextual.store(signature, cached.clone());
            let data = self.materialize(cached, CTOR_NAME, InvokeMode::Construct)?;
            return invoke_method_body(&data.method, None, args, None);
        }
        self.metrics.record_core_miss();

        let shape = arg_shape(args);
        let candidates: Vec<(TypeDescription, Arc<MethodDescription>)> = ty
            .constructors()
            .iter()
            .filter(|c| self.visible(c.access, c.restricted_to))
            .map(|c| (ty.clone(), c.clone()))
            .collect();
        let resolved = match score_candidates(&candidates, 0, &shape) {
            Resolution::One(declaring, method) => Ok(MethodBindData {
                declaring,
                method,
                via_extension: None,
                type_args: Vec::new().into(),
            }),
            Resolution::Tie(count) => Err(FailureReason::Ambiguous { candidates: count }),
            Resolution::None => Err(FailureReason::NotFound),
        };
        self.metrics.record_structural_resolution();

        let cached = match &resolved {
            Ok(data) => CachedBind::Method(data.clone()),
            Err(reason) => CachedBind::Failure(reason.clone()),
        };
        GlobalBindCache::global().store(signature.clone(), cached.clone());
        self.contextual.store(signature, cached);

        let data = resolved.map_err(|r| r.surface(CTOR_NAME, InvokeMode::Construct))?;
        invoke_method_body(&data.method, None, args, None)
    }

    /// Delete a member. Only capability adapters can delete; reflection
    /// members are fixed.
    pub fn delete_member(&self, target: &Target, name: &str) -> Result<bool, BindError> {
        let adapter = self.adapter_for(target);
        match adapter.delete_member(name) {
            Some(result) => result,
            None => Err(BindError::CapabilityNotSupported(
                "member deletion".to_string(),
            )),
        }
    }

    pub fn get_index(&self, target: &Target, indices: &mut [Value]) -> Result<Value, BindError> {
        let adapter = self.adapter_for(target);
        if indices.len() == 1 {
            if let Some(index) = indices[0].as_i64().and_then(|i| usize::try_from(i).ok()) {
                if let Some(result) = adapter.get_index(index) {
                    return result;
                }
            }
        }

        let ty = self.effective_type(target);
        if let Some(property) = self.find_indexed_property(target, &ty, indices.len()) {
            let getter = property.getter.clone().ok_or_else(|| BindError::AccessDenied {
                name: property.name.to_string(),
                reason: "indexed property has no getter".to_string(),
            })?;
            let receiver = self.receiver_value(target);
            let this = if property.is_static { None } else { Some(&receiver) };
            return getter(this, indices);
        }
        Err(BindError::CapabilityNotSupported(
            "indexed access".to_string(),
        ))
    }

    pub fn set_index(
        &self,
        target: &Target,
        indices: &[Value],
        value: Value,
    ) -> Result<(), BindError> {
        let adapter = self.adapter_for(target);
        if indices.len() == 1 {
            if let Some(index) = indices[0].as_i64().and_then(|i| usize::try_from(i).ok()) {
                if let Some(result) = adapter.set_index(index, &value) {
                    return result;
                }
            }
        }

        let ty = self.effective_type(target);
        if let Some(property) = self.find_indexed_property(target, &ty, indices.len()) {
            if property.access == ScriptAccess::ReadOnly {
                return Err(BindError::AccessDenied {
                    name: property.name.to_string(),
                    reason: "member is read-only".to_string(),
                });
            }
            let setter = property.setter.clone().ok_or_else(|| BindError::AccessDenied {
                name: property.name.to_string(),
                reason: "indexed property has no setter".to_string(),
            })?;
            let receiver = self.receiver_value(target);
            let this = if property.is_static { None } else { Some(&receiver) };
            let mut args: Vec<Value> = indices.to_vec();
            args.push(value);
            return setter(this, &mut args).map(|_| ());
        }
        Err(BindError::CapabilityNotSupported(
            "indexed access".to_string(),
        ))
    }

    fn find_indexed_property(
        &self,
        target: &Target,
        ty: &TypeDescription,
        index_count: usize,
    ) -> Option<Arc<PropertyDescription>> {
        let wanted = match target.kind() {
            TargetKind::IndexedProperty(name) => Some(name.clone()),
            _ => None,
        };
        for link in self.type_chain(ty) {
            for property in link.properties() {
                if property.index_params == index_count
                    && self.visible(property.access, property.restricted_to)
                    && self.static_allowed(target, property.is_static)
                    && wanted
                        .as_ref()
                        .map(|w| w == &property.name)
                        .unwrap_or(true)
                {
                    return Some(property.clone());
                }
            }
        }
        None
    }

    /// All member names currently visible on the target. Cached per target
    /// and invalidated by extension-registry changes. Integer index names
    /// stay out of this set; they surface through
    /// [`enumerate_indices`](Self::enumerate_indices) instead.
    pub fn enumerate_members(&self, target: &Target) -> Arc<MemberNames> {
        let names = names_for(
            target,
            self.context,
            self.default_access,
            self.registry.root(),
            Some(&self.metrics),
        );
        if names.properties.iter().all(|n| n.parse::<usize>().is_err()) {
            return names;
        }
        Arc::new(MemberNames {
            fields: names.fields.clone(),
            methods: names.methods.clone(),
            properties: names
                .properties
                .iter()
                .filter(|n| n.parse::<usize>().is_err())
                .cloned()
                .collect(),
            events: names.events.clone(),
        })
    }

    pub fn enumerate_indices(&self, target: &Target) -> Vec<usize> {
        self.adapter_for(target).indices()
    }
}

fn group_is_static(target: &Target) -> bool {
    matches!(target.kind(), TargetKind::TypeObject)
}

fn arg_shape(args: &[Value]) -> Vec<Option<TypeTag>> {
    args.iter()
        .map(|arg| match arg {
            Value::ByRef(_) => None,
            other => Some(TypeTag::of(other)),
        })
        .collect()
}

enum Resolution {
    One(TypeDescription, Arc<MethodDescription>),
    Tie(usize),
    None,
}

/// Total conversion cost of calling `params` with `shape`; `None` when
/// incompatible. By-ref arguments (shape `None`) match any parameter.
fn score_params(params: &[ParamDescription], shape: &[Option<TypeTag>]) -> Option<u32> {
    if params.len() != shape.len() {
        return None;
    }
    let mut total = 0u32;
    for (param, arg) in params.iter().zip(shape) {
        match arg {
            None => {}
            Some(tag) => total += TypeTag::conversion_cost(param.tag, *tag)?,
        }
    }
    Some(total)
}

fn score_candidates(
    candidates: &[(TypeDescription, Arc<MethodDescription>)],
    type_arg_count: usize,
    shape: &[Option<TypeTag>],
) -> Resolution {
    let mut best: Option<(u32, TypeDescription, Arc<MethodDescription>)> = None;
    let mut tie = 0usize;
    for (declaring, method) in candidates {
        if method.signature.type_params != type_arg_count {
            continue;
        }
        if let Some(cost) = score_params(&method.signature.params, shape) {
            match &best {
                Some((b, _, _)) if *b < cost => {}
                Some((b, _, _)) if *b == cost => tie += 1,
                _ => {
                    best = Some((cost, declaring.clone(), method.clone()));
                    tie = 1;
                }
            }
        }
    }
    match (best, tie) {
        (Some((_, declaring, method)), 1) => Resolution::One(declaring, method),
        (Some(_), n) => Resolution::Tie(n),
        (None, _) => Resolution::None,
    }
}

/// Free-function overload pick used by bound-method callables, where no
/// binder (and no cache) is in scope.
fn pick_overload(
    name: &str,
    candidates: &[Arc<MethodDescription>],
    args: &[Value],
) -> Result<Arc<MethodDescription>, BindError> {
    let shape = arg_shape(args);
    let mut best: Option<(u32, Arc<MethodDescription>)> = None;
    let mut tie = 0usize;
    for method in candidates {
        if let Some(cost) = score_params(&method.signature.params, &shape) {
            match &best {
                Some((b, _)) if *b < cost => {}
                Some((b, _)) if *b == cost => tie += 1,
                _ => {
                    best = Some((cost, method.clone()));
                    tie = 1;
                }
            }
        }
    }
    match (best, tie) {
        (Some((_, method)), 1) => Ok(method),
        (Some(_), n) => Err(BindError::AmbiguousMember {
            name: name.to_string(),
            candidates: n,
        }),
        (None, _) => Err(BindError::InvalidArgumentCount {
            name: name.to_string(),
            expected: candidates
                .first()
                .map(|m| m.signature.params.len())
                .unwrap_or(0),
            actual: args.len(),
        }),
    }
}

/// Invoke a method body with by-ref marshaling.
///
/// Caller arguments that are by-ref wrappers are dereferenced into a
/// scratch buffer before the call; afterwards the scratch contents flow
/// back into the wrappers (and into plain caller slots for declared
/// by-ref parameters) on both the success and the failure path.
/// `prepend` supplies the implicit first argument for extension methods.
fn invoke_method_body(
    method: &Arc<MethodDescription>,
    receiver: Option<&Value>,
    caller_args: &mut [Value],
    prepend: Option<Value>,
) -> Result<Value, BindError> {
    let offset = usize::from(prepend.is_some());
    let expected = method.signature.params.len();
    if caller_args.len() + offset != expected {
        return Err(BindError::InvalidArgumentCount {
            name: method.name.to_string(),
            expected: expected.saturating_sub(offset),
            actual: caller_args.len(),
        });
    }

    let mut scratch = Vec::with_capacity(expected);
    if let Some(first) = prepend {
        scratch.push(first);
    }
    // (scratch index, caller index, caller's by-ref slot if any)
    let mut writes: Vec<(usize, usize, Option<ByRefSlot>)> = vec![];
    for (i, arg) in caller_args.iter().enumerate() {
        let j = i + offset;
        match arg {
            Value::ByRef(slot) => {
                scratch.push(slot.read());
                writes.push((j, i, Some(slot.clone())));
            }
            other => {
                scratch.push(other.clone());
                if method.signature.params[j].by_ref {
                    writes.push((j, i, None));
                }
            }
        }
    }

    let result = (method.body)(receiver, &mut scratch);

    for (j, i, slot) in writes {
        match slot {
            Some(slot) => slot.write(scratch[j].clone()),
            None => caller_args[i] = scratch[j].clone(),
        }
    }

    result
}

/// A callable over a method group, bound to a receiver (or, for extension
/// groups, to an implicit first argument).
fn bound_method_callable(
    name: &str,
    candidates: Vec<Arc<MethodDescription>>,
    receiver: Option<Value>,
    extension_target: Option<Value>,
) -> Value {
    let name = name.to_string();
    Value::Callable(ScriptCallable::new(move |args| {
        let adjusted: Vec<Value> = match &extension_target {
            Some(first) => {
                let mut v = Vec::with_capacity(args.len() + 1);
                v.push(first.clone());
                v.extend(args.iter().cloned());
                v
            }
            None => args.to_vec(),
        };
        let method = pick_overload(&name, &candidates, &adjusted)?;
        invoke_method_body(&method, receiver.as_ref(), args, extension_target.clone())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObjectHandle;

    fn registry_with_counter() -> (Arc<TypeRegistry>, TypeDescription) {
        let registry = TypeRegistry::new();
        let ty = TypeDescription::builder("Counter")
            .field(FieldDescription::new(
                "Count",
                TypeTag::Int32,
                Value::Int32(0),
            ))
            .method(MethodDescription::new(
                "Add",
                vec![ParamDescription::by_value(TypeTag::Int32)],
                TypeTag::Int32,
                |this, args| {
                    let base = match this {
                        Some(Value::Object(o)) => {
                            o.get_field("Count").and_then(|v| v.as_i32()).unwrap_or(0)
                        }
                        _ => 0,
                    };
                    Ok(Value::Int32(base + args[0].as_i32().unwrap_or(0)))
                },
            ))
            .method(MethodDescription::new(
                "Add",
                vec![ParamDescription::by_value(TypeTag::Float64)],
                TypeTag::Float64,
                |_, args| Ok(Value::Float64(args[0].as_f64().unwrap_or(0.0))),
            ))
            .register(&registry);
        (registry, ty)
    }

    #[test]
    fn overload_resolution_prefers_exact_parameter_types() {
        let (registry, ty) = registry_with_counter();
        let binder = Binder::new(registry);
        let target = binder
            .wrap(
                Value::Object(ObjectHandle::new(ty)),
                None,
                TargetFlags::default(),
            )
            .unwrap();

        let mut int_args = [Value::Int32(5)];
        assert_eq!(
            binder.invoke(&target, "Add", &[], &mut int_args, None).unwrap(),
            Value::Int32(5)
        );
        let mut float_args = [Value::Float64(2.5)];
        assert_eq!(
            binder
                .invoke(&target, "Add", &[], &mut float_args, None)
                .unwrap(),
            Value::Float64(2.5)
        );
    }

    #[test]
    fn field_get_and_set_round_trip() {
        let (registry, ty) = registry_with_counter();
        let binder = Binder::new(registry);
        let target = binder
            .wrap(
                Value::Object(ObjectHandle::new(ty)),
                None,
                TargetFlags::default(),
            )
            .unwrap();

        assert_eq!(binder.get_member(&target, "Count").unwrap(), Value::Int32(0));
        binder
            .set_member(&target, "Count", Value::Int32(9))
            .unwrap();
        assert_eq!(binder.get_member(&target, "Count").unwrap(), Value::Int32(9));
    }

    #[test]
    fn calling_a_missing_member_reports_not_found() {
        let (registry, ty) = registry_with_counter();
        let binder = Binder::new(registry);
        let target = binder
            .wrap(
                Value::Object(ObjectHandle::new(ty)),
                None,
                TargetFlags::default(),
            )
            .unwrap();
        let mut args = [];
        assert!(matches!(
            binder.invoke(&target, "NoSuchThing", &[], &mut args, None),
            Err(BindError::MemberNotFound { .. })
        ));
    }

    #[test]
    fn reflection_sensitive_member_is_gated() {
        let (registry, ty) = registry_with_counter();
        let obj = Value::Object(ObjectHandle::new(ty));

        let locked = Binder::new(registry.clone());
        let target = locked.wrap(obj.clone(), None, TargetFlags::default()).unwrap();
        let mut args = [];
        assert!(matches!(
            locked.invoke(&target, "GetType", &[], &mut args, None),
            Err(BindError::AccessDenied { .. })
        ));

        let open = Binder::new(registry).with_options(BinderOptions {
            allow_reflection: true,
            ..Default::default()
        });
        let target = open.wrap(obj, None, TargetFlags::default()).unwrap();
        let mut args = [];
        assert!(matches!(
            open.invoke(&target, "GetType", &[], &mut args, None),
            Ok(Value::Type(_))
        ));
    }

    #[test]
    fn construct_rejects_non_type_targets() {
        let (registry, ty) = registry_with_counter();
        let binder = Binder::new(registry);
        let target = binder
            .wrap(
                Value::Object(ObjectHandle::new(ty)),
                None,
                TargetFlags::default(),
            )
            .unwrap();
        let mut args = [];
        assert!(matches!(
            binder.construct(&target, &mut args),
            Err(BindError::InvalidInvocationMode {
                mode: InvokeMode::Construct,
                ..
            })
        ));
    }

    #[test]
    fn expando_writes_need_a_capability_adapter() {
        let (registry, ty) = registry_with_counter();
        let binder = Binder::new(registry);
        let target = binder
            .wrap(
                Value::Object(ObjectHandle::new(ty)),
                None,
                TargetFlags::default(),
            )
            .unwrap();
        assert!(matches!(
            binder.set_member(&target, "Invented", Value::Int32(1)),
            Err(BindError::CapabilityNotSupported(_))
        ));
    }

    #[test]
    fn variable_cell_pseudo_members() {
        use crate::target::VariableCell;
        let (registry, _) = registry_with_counter();
        let binder = Binder::new(registry.clone());
        let cell = VariableCell::new(TypeTag::Int32, Value::Int32(1)).unwrap();
        let target = Target::for_variable(cell.clone(), &registry);

        assert_eq!(binder.get_member(&target, "value").unwrap(), Value::Int32(1));
        binder
            .set_member(&target, "value", Value::Int32(2))
            .unwrap();
        assert_eq!(cell.get(), Value::Int32(2));

        // The "ref" pseudo-member shares the cell's storage.
        let by_ref = binder.get_member(&target, "ref").unwrap();
        if let Value::ByRef(slot) = by_ref {
            slot.write(Value::Int32(3));
        }
        assert_eq!(cell.get(), Value::Int32(3));
    }
}
