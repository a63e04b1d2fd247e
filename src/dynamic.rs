//! Dynamic capability detection and routing.
//!
//! A wrapped target is classified exactly once into at most one capability
//! adapter; member operations consult the adapter before falling through
//! to reflection-based resolution. The adapter union is an explicit
//! tagged enum rather than any dynamic-call mechanism.
use crate::{
    dispatch::DispatchAdapter,
    error::BindError,
    signature::InvokeMode,
    target::{Target, TargetFlags, TargetKind},
    value::{ListHandle, ScriptCallable, Value},
};
use enum_dispatch::enum_dispatch;
use parking_lot::Mutex;
use std::sync::Arc;

/// String-keyed property-bag capability.
pub trait PropertyBag: Send + Sync {
    fn get(&self, name: &str) -> Option<Value>;
    fn set(&self, name: &str, value: Value);
    fn delete(&self, name: &str) -> bool;
    fn names(&self) -> Vec<Arc<str>>;
}

/// Integer-indexed list capability.
pub trait ListAccess: Send + Sync {
    fn len(&self) -> usize;
    fn get_index(&self, index: usize) -> Option<Value>;
    fn set_index(&self, index: usize, value: Value) -> bool;
}

/// Generic "provide my own binding" capability. Every operation may
/// decline, in which case the binder falls through to reflection against
/// the target's static type.
pub trait DynamicMetaObject: Send + Sync {
    fn try_get(&self, name: &str) -> Option<Value>;
    fn try_set(&self, name: &str, value: Value) -> bool;
    fn try_invoke(&self, name: &str, args: &mut [Value]) -> Option<Result<Value, BindError>>;
    fn try_delete(&self, name: &str) -> bool;
    fn try_get_index(&self, index: usize) -> Option<Value>;
    fn try_set_index(&self, index: usize, value: Value) -> bool;
    fn try_delete_index(&self, index: usize) -> bool;
    fn member_names(&self) -> Vec<Arc<str>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    None,
    Dispatch,
    PropertyBag,
    List,
    MetaObject,
}

/// Operations every capability adapter answers. `None` from a member
/// operation means the adapter does not claim it and the binder should
/// fall through to reflection.
#[enum_dispatch]
pub trait DynamicOps {
    fn adapter_kind(&self) -> AdapterKind;
    /// Exclusive adapters replace reflection entirely (native dispatch on
    /// an otherwise-unknown type); non-exclusive adapters augment it.
    fn exclusive(&self) -> bool;
    fn supports_expando(&self) -> bool;
    fn get_member(&self, name: &str) -> Option<Result<Value, BindError>>;
    fn set_member(&self, name: &str, value: &Value) -> Option<Result<(), BindError>>;
    fn invoke_member(&self, name: &str, args: &mut [Value]) -> Option<Result<Value, BindError>>;
    fn delete_member(&self, name: &str) -> Option<Result<bool, BindError>>;
    fn get_index(&self, index: usize) -> Option<Result<Value, BindError>>;
    fn set_index(&self, index: usize, value: &Value) -> Option<Result<(), BindError>>;
    fn member_names(&self) -> Vec<Arc<str>>;
    fn indices(&self) -> Vec<usize>;
}

#[derive(Clone)]
pub struct NoAdapter;

impl DynamicOps for NoAdapter {
    fn adapter_kind(&self) -> AdapterKind {
        AdapterKind::None
    }

    fn exclusive(&self) -> bool {
        false
    }

    fn supports_expando(&self) -> bool {
        false
    }

    fn get_member(&self, _name: &str) -> Option<Result<Value, BindError>> {
        None
    }

    fn set_member(&self, _name: &str, _value: &Value) -> Option<Result<(), BindError>> {
        None
    }

    fn invoke_member(&self, _name: &str, _args: &mut [Value]) -> Option<Result<Value, BindError>> {
        None
    }

    fn delete_member(&self, _name: &str) -> Option<Result<bool, BindError>> {
        None
    }

    fn get_index(&self, _index: usize) -> Option<Result<Value, BindError>> {
        None
    }

    fn set_index(&self, _index: usize, _value: &Value) -> Option<Result<(), BindError>> {
        None
    }

    fn member_names(&self) -> Vec<Arc<str>> {
        vec![]
    }

    fn indices(&self) -> Vec<usize> {
        vec![]
    }
}

#[derive(Clone)]
pub struct PropertyBagAdapter {
    bag: Arc<dyn PropertyBag>,
}

impl PropertyBagAdapter {
    pub fn new(bag: Arc<dyn PropertyBag>) -> Self {
        Self { bag }
    }
}

impl DynamicOps for PropertyBagAdapter {
    fn adapter_kind(&self) -> AdapterKind {
        AdapterKind::PropertyBag
    }

    fn exclusive(&self) -> bool {
        false
    }

    fn supports_expando(&self) -> bool {
        true
    }

    fn get_member(&self, name: &str) -> Option<Result<Value, BindError>> {
        self.bag.get(name).map(Ok)
    }

    fn set_member(&self, name: &str, value: &Value) -> Option<Result<(), BindError>> {
        self.bag.set(name, value.clone());
        Some(Ok(()))
    }

    fn invoke_member(&self, name: &str, args: &mut [Value]) -> Option<Result<Value, BindError>> {
        match self.bag.get(name)? {
            Value::Callable(callable) => Some(callable.invoke(args)),
            _ => Some(Err(BindError::InvalidInvocationMode {
                name: name.to_string(),
                mode: InvokeMode::Call,
            })),
        }
    }

    fn delete_member(&self, name: &str) -> Option<Result<bool, BindError>> {
        Some(Ok(self.bag.delete(name)))
    }

    fn get_index(&self, _index: usize) -> Option<Result<Value, BindError>> {
        None
    }

    fn set_index(&self, _index: usize, _value: &Value) -> Option<Result<(), BindError>> {
        None
    }

    fn member_names(&self) -> Vec<Arc<str>> {
        self.bag.names()
    }

    fn indices(&self) -> Vec<usize> {
        vec![]
    }
}

#[derive(Clone)]
enum ListBacking {
    Natural(ListHandle),
    Capability(Arc<dyn ListAccess>),
}

impl ListBacking {
    fn len(&self) -> usize {
        match self {
            ListBacking::Natural(l) => l.len(),
            ListBacking::Capability(l) => l.len(),
        }
    }

    fn get(&self, index: usize) -> Option<Value> {
        match self {
            ListBacking::Natural(l) => l.get(index),
            ListBacking::Capability(l) => l.get_index(index),
        }
    }

    fn set(&self, index: usize, value: Value) -> bool {
        match self {
            ListBacking::Natural(l) => l.set(index, value),
            ListBacking::Capability(l) => l.set_index(index, value),
        }
    }
}

/// Name of the enumerator-producing pseudo-member on list targets.
pub const ENUMERATOR_MEMBER: &str = "GetEnumerator";

#[derive(Clone)]
pub struct ListAdapter {
    backing: ListBacking,
}

impl ListAdapter {
    pub fn natural(list: ListHandle) -> Self {
        Self {
            backing: ListBacking::Natural(list),
        }
    }

    pub fn capability(list: Arc<dyn ListAccess>) -> Self {
        Self {
            backing: ListBacking::Capability(list),
        }
    }

    fn enumerator(&self) -> Value {
        let backing = self.backing.clone();
        let cursor = Mutex::new(0usize);
        // Each call yields the next element, then null when exhausted.
        Value::Callable(ScriptCallable::new(move |_args| {
            let mut cursor = cursor.lock();
            match backing.get(*cursor) {
                Some(item) => {
                    *cursor += 1;
                    Ok(item)
                }
                None => Ok(Value::Null),
            }
        }))
    }
}

impl DynamicOps for ListAdapter {
    fn adapter_kind(&self) -> AdapterKind {
        AdapterKind::List
    }

    fn exclusive(&self) -> bool {
        false
    }

    fn supports_expando(&self) -> bool {
        false
    }

    fn get_member(&self, name: &str) -> Option<Result<Value, BindError>> {
        if name == "Count" {
            return Some(Ok(Value::Int32(self.backing.len() as i32)));
        }
        if name == ENUMERATOR_MEMBER {
            return Some(Ok(self.enumerator()));
        }
        let index: usize = name.parse().ok()?;
        match self.backing.get(index) {
            Some(v) => Some(Ok(v)),
            None => Some(Err(BindError::MemberNotFound {
                name: name.to_string(),
                mode: InvokeMode::Get,
            })),
        }
    }

    fn set_member(&self, name: &str, value: &Value) -> Option<Result<(), BindError>> {
        let index: usize = name.parse().ok()?;
        if self.backing.set(index, value.clone()) {
            Some(Ok(()))
        } else {
            Some(Err(BindError::MemberNotFound {
                name: name.to_string(),
                mode: InvokeMode::Set,
            }))
        }
    }

    fn invoke_member(&self, name: &str, _args: &mut [Value]) -> Option<Result<Value, BindError>> {
        if name == ENUMERATOR_MEMBER {
            return Some(Ok(self.enumerator()));
        }
        None
    }

    fn delete_member(&self, _name: &str) -> Option<Result<bool, BindError>> {
        None
    }

    fn get_index(&self, index: usize) -> Option<Result<Value, BindError>> {
        self.backing.get(index).map(Ok)
    }

    fn set_index(&self, index: usize, value: &Value) -> Option<Result<(), BindError>> {
        if self.backing.set(index, value.clone()) {
            Some(Ok(()))
        } else {
            None
        }
    }

    fn member_names(&self) -> Vec<Arc<str>> {
        (0..self.backing.len())
            .map(|i| Arc::from(i.to_string().as_str()))
            .collect()
    }

    fn indices(&self) -> Vec<usize> {
        (0..self.backing.len()).collect()
    }
}

#[derive(Clone)]
pub struct MetaObjectAdapter {
    meta: Arc<dyn DynamicMetaObject>,
}

impl MetaObjectAdapter {
    pub fn new(meta: Arc<dyn DynamicMetaObject>) -> Self {
        Self { meta }
    }
}

impl DynamicOps for MetaObjectAdapter {
    fn adapter_kind(&self) -> AdapterKind {
        AdapterKind::MetaObject
    }

    fn exclusive(&self) -> bool {
        false
    }

    fn supports_expando(&self) -> bool {
        true
    }

    fn get_member(&self, name: &str) -> Option<Result<Value, BindError>> {
        self.meta.try_get(name).map(Ok)
    }

    fn set_member(&self, name: &str, value: &Value) -> Option<Result<(), BindError>> {
        if self.meta.try_set(name, value.clone()) {
            Some(Ok(()))
        } else {
            None
        }
    }

    fn invoke_member(&self, name: &str, args: &mut [Value]) -> Option<Result<Value, BindError>> {
        self.meta.try_invoke(name, args)
    }

    fn delete_member(&self, name: &str) -> Option<Result<bool, BindError>> {
        if self.meta.try_delete(name) {
            Some(Ok(true))
        } else {
            None
        }
    }

    fn get_index(&self, index: usize) -> Option<Result<Value, BindError>> {
        self.meta.try_get_index(index).map(Ok)
    }

    fn set_index(&self, index: usize, value: &Value) -> Option<Result<(), BindError>> {
        if self.meta.try_set_index(index, value.clone()) {
            Some(Ok(()))
        } else {
            None
        }
    }

    fn member_names(&self) -> Vec<Arc<str>> {
        self.meta.member_names()
    }

    fn indices(&self) -> Vec<usize> {
        self.meta
            .member_names()
            .iter()
            .filter_map(|n| n.parse().ok())
            .collect()
    }
}

/// The tagged adapter union stored alongside each target wrapper.
#[enum_dispatch(DynamicOps)]
#[derive(Clone)]
pub enum DynamicBinding {
    None(NoAdapter),
    Dispatch(DispatchAdapter),
    Bag(PropertyBagAdapter),
    List(ListAdapter),
    Meta(MetaObjectAdapter),
}

/// Classify a target into at most one capability adapter.
///
/// Priority: native dispatch (opaque types only), property bag, list,
/// metaobject (unless suppressed). Host types and bound member targets
/// never participate.
pub fn classify(target: &Target) -> DynamicBinding {
    match target.kind() {
        TargetKind::TypeObject | TargetKind::BoundMethod(_) | TargetKind::IndexedProperty(_) => {
            return NoAdapter.into();
        }
        TargetKind::Value | TargetKind::Variable(_) => {}
    }

    let value = match target.current_value() {
        Value::ByRef(slot) => slot.read(),
        other => other,
    };

    match value {
        Value::Object(obj) => {
            let caps = obj.capabilities().clone();
            if let Some(dispatch) = caps.dispatch {
                if obj.ty().is_opaque() {
                    return DispatchAdapter::new(dispatch).into();
                }
            }
            if let Some(bag) = caps.bag {
                return PropertyBagAdapter::new(bag).into();
            }
            if let Some(list) = caps.list {
                return ListAdapter::capability(list).into();
            }
            if let Some(meta) = caps.meta {
                if !target.flags().contains(TargetFlags::SUPPRESS_DYNAMIC) {
                    return MetaObjectAdapter::new(meta).into();
                }
            }
            NoAdapter.into()
        }
        Value::List(list) => ListAdapter::natural(list).into(),
        _ => NoAdapter.into(),
    }
}

/// Insertion-ordered in-memory property bag, usable as a host capability.
pub struct MemoryPropertyBag {
    entries: Mutex<Vec<(Arc<str>, Value)>>,
}

impl MemoryPropertyBag {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(vec![]),
        }
    }
}

impl Default for MemoryPropertyBag {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyBag for MemoryPropertyBag {
    fn get(&self, name: &str) -> Option<Value> {
        self.entries
            .lock()
            .iter()
            .find(|(k, _)| &**k == name)
            .map(|(_, v)| v.clone())
    }

    fn set(&self, name: &str, value: Value) {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|(k, _)| &**k == name) {
            Some(entry) => entry.1 = value,
            None => entries.push((Arc::from(name), value)),
        }
    }

    fn delete(&self, name: &str) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(k, _)| &**k != name);
        entries.len() != before
    }

    fn names(&self) -> Vec<Arc<str>> {
        self.entries.lock().iter().map(|(k, _)| k.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::{TypeDescription, TypeRegistry},
        value::{Capabilities, ObjectHandle},
    };

    struct EchoMeta;

    impl DynamicMetaObject for EchoMeta {
        fn try_get(&self, name: &str) -> Option<Value> {
            Some(Value::from(name))
        }
        fn try_set(&self, _name: &str, _value: Value) -> bool {
            true
        }
        fn try_invoke(&self, _name: &str, _args: &mut [Value]) -> Option<Result<Value, BindError>> {
            None
        }
        fn try_delete(&self, _name: &str) -> bool {
            false
        }
        fn try_get_index(&self, _index: usize) -> Option<Value> {
            None
        }
        fn try_set_index(&self, _index: usize, _value: Value) -> bool {
            false
        }
        fn try_delete_index(&self, _index: usize) -> bool {
            false
        }
        fn member_names(&self) -> Vec<Arc<str>> {
            vec![]
        }
    }

    #[test]
    fn property_bag_wins_over_metaobject() {
        let registry = TypeRegistry::new();
        let ty = TypeDescription::builder("Both").register(&registry);
        let obj = ObjectHandle::with_capabilities(
            ty,
            Capabilities {
                bag: Some(Arc::new(MemoryPropertyBag::new())),
                meta: Some(Arc::new(EchoMeta)),
                ..Default::default()
            },
        );
        let target = Target::wrap(
            Value::Object(obj),
            None,
            crate::target::TargetFlags::default(),
            &registry,
            None,
        )
        .unwrap();
        assert_eq!(
            target.dynamic_binding().adapter_kind(),
            AdapterKind::PropertyBag
        );
    }

    #[test]
    fn suppressed_metaobject_falls_back_to_none() {
        let registry = TypeRegistry::new();
        let ty = TypeDescription::builder("MetaOnly").register(&registry);
        let obj = ObjectHandle::with_capabilities(
            ty,
            Capabilities {
                meta: Some(Arc::new(EchoMeta)),
                ..Default::default()
            },
        );
        let target = Target::wrap(
            Value::Object(obj),
            None,
            crate::target::TargetFlags::default().with(crate::target::TargetFlags::SUPPRESS_DYNAMIC),
            &registry,
            None,
        )
        .unwrap();
        assert_eq!(target.dynamic_binding().adapter_kind(), AdapterKind::None);
    }

    #[test]
    fn list_adapter_exposes_numeric_names_and_enumerator() {
        let adapter = ListAdapter::natural(ListHandle::new(vec![
            Value::Int32(10),
            Value::Int32(20),
        ]));
        assert_eq!(adapter.member_names().len(), 2);
        assert_eq!(adapter.indices(), vec![0, 1]);
        assert_eq!(adapter.get_member("1").unwrap().unwrap(), Value::Int32(20));

        let enumerator = match adapter.get_member(ENUMERATOR_MEMBER).unwrap().unwrap() {
            Value::Callable(c) => c,
            other => panic!("expected callable, got {:?}", other),
        };
        assert_eq!(enumerator.invoke(&mut []).unwrap(), Value::Int32(10));
        assert_eq!(enumerator.invoke(&mut []).unwrap(), Value::Int32(20));
        assert_eq!(enumerator.invoke(&mut []).unwrap(), Value::Null);
    }
}
