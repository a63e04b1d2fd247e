//! Structural cache keys for member-resolution requests.
use crate::{
    target::TargetFlags,
    types::{AccessContextId, TypeDescription, TypeTag},
    value::Value,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeMode {
    Get,
    Set,
    Call,
    Construct,
}

/// Identifies a member-resolution request independent of the concrete
/// runtime arguments. Immutable once constructed: the type-argument and
/// argument-shape arrays are owned `Arc` slices, never borrowed caller
/// arrays, so a stored signature can never alias caller-mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindSignature {
    pub context: AccessContextId,
    pub mode: InvokeMode,
    pub flags: TargetFlags,
    pub target_type: TypeDescription,
    pub name: Arc<str>,
    pub type_args: Arc<[TypeDescription]>,
    /// One entry per argument: `Some(tag)` when the argument participates
    /// in overload resolution by static type, `None` when it does not.
    pub arg_shape: Arc<[Option<TypeTag>]>,
}

impl BindSignature {
    pub fn new(
        context: AccessContextId,
        mode: InvokeMode,
        flags: TargetFlags,
        target_type: TypeDescription,
        name: &str,
        type_args: &[TypeDescription],
        bind_args: &[Value],
    ) -> Self {
        let arg_shape = bind_args
            .iter()
            .map(|arg| match arg {
                Value::ByRef(_) => None,
                other => Some(TypeTag::of(other)),
            })
            .collect();
        Self {
            context,
            mode,
            flags,
            target_type,
            name: Arc::from(name),
            type_args: type_args.to_vec().into(),
            arg_shape,
        }
    }
}
