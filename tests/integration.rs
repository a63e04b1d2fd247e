use hostbridge::{
    binder::{Binder, BinderOptions},
    cache::GlobalBindCache,
    dispatch::MemoryDispatch,
    dynamic::MemoryPropertyBag,
    error::BindError,
    extensions::ExtensionRegistry,
    shim::{DelegateShim, ShimDescriptor},
    signature::InvokeMode,
    target::{Target, TargetFlags, VariableCell},
    types::{
        FieldDescription, MethodDescription, ParamDescription, PropertyDescription,
        TypeDescription, TypeRegistry, TypeTag,
    },
    value::{ByRefSlot, Capabilities, ListHandle, ObjectHandle, RefKind, ScriptCallable, Value},
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Tests that assert on cache counters or clear the process-wide caches
/// serialize through this lock so they do not disturb each other.
static CACHE_LOCK: Mutex<()> = Mutex::new(());

fn point_type(registry: &Arc<TypeRegistry>) -> TypeDescription {
    let lookup = registry.clone();
    TypeDescription::builder("Point")
        .field(FieldDescription::new("X", TypeTag::Int32, Value::Int32(0)))
        .field(FieldDescription::new("Y", TypeTag::Int32, Value::Int32(0)))
        .method(MethodDescription::new(
            "Translate",
            vec![
                ParamDescription::by_value(TypeTag::Int32),
                ParamDescription::by_value(TypeTag::Int32),
            ],
            TypeTag::Any,
            |this, args| {
                if let Some(Value::Object(o)) = this {
                    let x = o.get_field("X").and_then(|v| v.as_i32()).unwrap_or(0);
                    let y = o.get_field("Y").and_then(|v| v.as_i32()).unwrap_or(0);
                    o.set_field("X", Value::Int32(x + args[0].as_i32().unwrap_or(0)));
                    o.set_field("Y", Value::Int32(y + args[1].as_i32().unwrap_or(0)));
                }
                Ok(Value::Null)
            },
        ))
        .constructor(MethodDescription::new(
            ".ctor",
            vec![
                ParamDescription::by_value(TypeTag::Int32),
                ParamDescription::by_value(TypeTag::Int32),
            ],
            TypeTag::Object,
            move |_, args| {
                let ty = lookup
                    .lookup("Point")
                    .ok_or_else(|| BindError::HostFault("Point not registered".to_string()))?;
                let obj = ObjectHandle::new(ty);
                obj.set_field("X", args[0].clone());
                obj.set_field("Y", args[1].clone());
                Ok(Value::Object(obj))
            },
        ))
        .register(registry)
}

#[test]
fn repeated_invocation_resolves_structurally_once() {
    let _guard = CACHE_LOCK.lock();
    let registry = TypeRegistry::new();
    let ty = point_type(&registry);
    let binder = Binder::new(registry);
    let target = binder
        .wrap(
            Value::Object(ObjectHandle::new(ty)),
            None,
            TargetFlags::default(),
        )
        .unwrap();

    let mut args = [Value::Int32(1), Value::Int32(2)];
    binder.invoke(&target, "Translate", &[], &mut args, None).unwrap();
    let mut args = [Value::Int32(3), Value::Int32(4)];
    binder.invoke(&target, "Translate", &[], &mut args, None).unwrap();

    let stats = binder.stats();
    assert_eq!(stats.structural_resolutions, 1);
    assert_eq!(stats.contextual_cache.hits, 1);
    assert_eq!(binder.get_member(&target, "X").unwrap(), Value::Int32(4));
    assert_eq!(binder.get_member(&target, "Y").unwrap(), Value::Int32(6));
}

#[test]
fn second_binder_hits_the_core_tier() {
    let _guard = CACHE_LOCK.lock();
    let registry = TypeRegistry::new();
    let ty = point_type(&registry);
    let obj = Value::Object(ObjectHandle::new(ty));

    let first = Binder::new(registry.clone());
    let target = first.wrap(obj.clone(), None, TargetFlags::default()).unwrap();
    let mut args = [Value::Int32(1), Value::Int32(1)];
    first.invoke(&target, "Translate", &[], &mut args, None).unwrap();

    let second = Binder::new(registry);
    let target = second.wrap(obj, None, TargetFlags::default()).unwrap();
    let mut args = [Value::Int32(1), Value::Int32(1)];
    second.invoke(&target, "Translate", &[], &mut args, None).unwrap();

    let stats = second.stats();
    assert_eq!(stats.structural_resolutions, 0);
    assert_eq!(stats.core_cache.hits, 1);
}

#[test]
fn clearing_the_caches_forces_re_resolution() {
    let _guard = CACHE_LOCK.lock();
    let registry = TypeRegistry::new();
    let ty = point_type(&registry);
    let binder = Binder::new(registry);
    let target = binder
        .wrap(
            Value::Object(ObjectHandle::new(ty)),
            None,
            TargetFlags::default(),
        )
        .unwrap();

    let mut args = [Value::Int32(1), Value::Int32(1)];
    binder.invoke(&target, "Translate", &[], &mut args, None).unwrap();
    assert_eq!(binder.stats().structural_resolutions, 1);

    GlobalBindCache::global().clear();
    binder.clear_contextual_cache();

    let mut args = [Value::Int32(1), Value::Int32(1)];
    binder.invoke(&target, "Translate", &[], &mut args, None).unwrap();
    assert_eq!(binder.stats().structural_resolutions, 2);
}

#[test]
fn exact_names_beat_alternate_names() {
    let registry = TypeRegistry::new();
    let ty = TypeDescription::builder("Named")
        .method(
            MethodDescription::new("Render", vec![], TypeTag::Str, |_, _| {
                Ok(Value::from("exact"))
            })
            .with_alt_name("draw"),
        )
        .method(MethodDescription::new("draw", vec![], TypeTag::Str, |_, _| {
            Ok(Value::from("lowercase"))
        }))
        .register(&registry);
    let binder = Binder::new(registry);
    let target = binder
        .wrap(
            Value::Object(ObjectHandle::new(ty)),
            None,
            TargetFlags::default(),
        )
        .unwrap();

    // "draw" matches a method exactly, so the alternate name on Render
    // never participates.
    let mut args = [];
    assert_eq!(
        binder.invoke(&target, "draw", &[], &mut args, None).unwrap(),
        Value::from("lowercase")
    );
    // The alternate spelling still reaches Render when nothing matches
    // exactly.
    let mut args = [];
    assert_eq!(
        binder.invoke(&target, "Render", &[], &mut args, None).unwrap(),
        Value::from("exact")
    );
}

#[test]
fn alternate_names_on_the_declared_type_beat_root_members() {
    let registry = TypeRegistry::new();
    let ty = TypeDescription::builder("Styled")
        .method(
            MethodDescription::new("Show", vec![], TypeTag::Str, |_, _| {
                Ok(Value::from("alternate"))
            })
            .with_alt_name("ToString"),
        )
        .register(&registry);
    let binder = Binder::new(registry);
    let target = binder
        .wrap(
            Value::Object(ObjectHandle::new(ty)),
            None,
            TargetFlags::default(),
        )
        .unwrap();

    // The alternate spelling on the declared type wins over the root
    // Object's own ToString.
    let mut args = [];
    assert_eq!(
        binder
            .invoke(&target, "ToString", &[], &mut args, None)
            .unwrap(),
        Value::from("alternate")
    );
}

#[test]
fn leading_type_tokens_become_type_arguments() {
    let registry = TypeRegistry::new();
    let ty = TypeDescription::builder("Fabricator")
        .method(
            MethodDescription::new(
                "Make",
                vec![ParamDescription::by_value(TypeTag::Int32)],
                TypeTag::Str,
                |_, args| {
                    Ok(Value::from(format!(
                        "made {}",
                        args[0].as_i32().unwrap_or(0)
                    )))
                },
            )
            .with_type_params(1),
        )
        .method(MethodDescription::new(
            "Describe",
            vec![ParamDescription::by_value(TypeTag::Type)],
            TypeTag::Str,
            |_, args| match &args[0] {
                Value::Type(td) => Ok(Value::from(td.name().to_string())),
                _ => Ok(Value::Null),
            },
        ))
        .register(&registry);
    let token = TypeDescription::builder("FabricatedPart").register(&registry);
    let binder = Binder::new(registry);
    let target = binder
        .wrap(
            Value::Object(ObjectHandle::new(ty)),
            None,
            TargetFlags::default(),
        )
        .unwrap();

    // The leading type token is consumed as the generic type argument,
    // leaving a single-argument call.
    let mut args = [Value::Type(token.clone()), Value::Int32(1)];
    assert_eq!(
        binder.invoke(&target, "Make", &[], &mut args, None).unwrap(),
        Value::from("made 1")
    );

    // A Type-typed parameter on a non-generic method is an ordinary
    // argument and is not peeled.
    let mut args = [Value::Type(token)];
    assert_eq!(
        binder
            .invoke(&target, "Describe", &[], &mut args, None)
            .unwrap(),
        Value::from("FabricatedPart")
    );
}

#[test]
fn interface_members_resolve_on_implementing_types() {
    let registry = TypeRegistry::new();
    let shape = TypeDescription::builder("IShape")
        .interface()
        .method(MethodDescription::new("Area", vec![], TypeTag::Float64, |this, _| {
            let side = match this {
                Some(Value::Object(o)) => {
                    o.get_field("Side").and_then(|v| v.as_f64()).unwrap_or(0.0)
                }
                _ => 0.0,
            };
            Ok(Value::Float64(side * side))
        }))
        .register(&registry);
    let square = TypeDescription::builder("Square")
        .extends(shape)
        .field(FieldDescription::new(
            "Side",
            TypeTag::Float64,
            Value::Float64(3.0),
        ))
        .register(&registry);

    let binder = Binder::new(registry);
    let target = binder
        .wrap(
            Value::Object(ObjectHandle::new(square)),
            None,
            TargetFlags::default(),
        )
        .unwrap();
    let mut args = [];
    assert_eq!(
        binder.invoke(&target, "Area", &[], &mut args, None).unwrap(),
        Value::Float64(9.0)
    );
}

#[test]
fn interface_typed_targets_reach_base_interface_members() {
    let registry = TypeRegistry::new();
    let emitter = TypeDescription::builder("IEmitter")
        .interface()
        .method(MethodDescription::new("Emit", vec![], TypeTag::Str, |_, _| {
            Ok(Value::from("emitted"))
        }))
        .register(&registry);
    let loud = TypeDescription::builder("ILoudEmitter")
        .interface()
        .extends(emitter)
        .register(&registry);
    let siren = TypeDescription::builder("Siren").register(&registry);

    let binder = Binder::new(registry);
    // Declared as the derived interface, which has no members of its own;
    // the member lives on the base interface.
    let target = binder
        .wrap(
            Value::Object(ObjectHandle::new(siren)),
            Some(loud),
            TargetFlags::default(),
        )
        .unwrap();
    let mut args = [];
    assert_eq!(
        binder.invoke(&target, "Emit", &[], &mut args, None).unwrap(),
        Value::from("emitted")
    );
}

#[test]
fn extension_method_receives_target_and_mutates_by_ref() {
    let registry = TypeRegistry::new();
    let ty = point_type(&registry);
    let ext = TypeDescription::builder("PointTools")
        .method(
            MethodDescription::new(
                "StealX",
                vec![
                    ParamDescription::by_value(TypeTag::Object),
                    ParamDescription::by_ref(TypeTag::Int32),
                ],
                TypeTag::Any,
                |_, args| {
                    let x = match &args[0] {
                        Value::Object(o) => {
                            o.get_field("X").and_then(|v| v.as_i32()).unwrap_or(0)
                        }
                        _ => 0,
                    };
                    args[1] = Value::Int32(x);
                    Ok(Value::Null)
                },
            )
            .with_static(),
        )
        .register(&registry);
    ExtensionRegistry::global().register(ext.clone());

    let binder = Binder::new(registry);
    let obj = ObjectHandle::new(ty);
    obj.set_field("X", Value::Int32(77));
    let target = binder
        .wrap(Value::Object(obj), None, TargetFlags::default())
        .unwrap();

    // Plain caller slot for a declared by-ref parameter gets overwritten.
    let mut args = [Value::Int32(0)];
    binder.invoke(&target, "StealX", &[], &mut args, None).unwrap();
    assert_eq!(args[0], Value::Int32(77));

    // A by-ref wrapper sees the write through its shared cell.
    let slot = ByRefSlot::new(RefKind::Out, Value::Null);
    let mut args = [Value::ByRef(slot.clone())];
    binder.invoke(&target, "StealX", &[], &mut args, None).unwrap();
    assert_eq!(slot.read(), Value::Int32(77));

    ExtensionRegistry::global().unregister(&ext);
}

#[test]
fn variable_cell_reassignment_rebinds_members() {
    let registry = TypeRegistry::new();
    let a = TypeDescription::builder("TagA")
        .method(MethodDescription::new("Tag", vec![], TypeTag::Str, |_, _| {
            Ok(Value::from("A"))
        }))
        .register(&registry);
    let b = TypeDescription::builder("TagB")
        .method(MethodDescription::new("Tag", vec![], TypeTag::Str, |_, _| {
            Ok(Value::from("B"))
        }))
        .register(&registry);

    let binder = Binder::new(registry.clone());
    let cell = VariableCell::new(TypeTag::Object, Value::Object(ObjectHandle::new(a))).unwrap();
    let target = Target::for_variable(cell.clone(), &registry);

    let mut args = [];
    assert_eq!(
        binder.invoke(&target, "Tag", &[], &mut args, None).unwrap(),
        Value::from("A")
    );

    cell.set(Value::Object(ObjectHandle::new(b))).unwrap();
    let mut args = [];
    assert_eq!(
        binder.invoke(&target, "Tag", &[], &mut args, None).unwrap(),
        Value::from("B")
    );
}

#[test]
fn property_bag_routes_member_operations() {
    let registry = TypeRegistry::new();
    let ty = TypeDescription::builder("BagHolder").register(&registry);
    let bag = Arc::new(MemoryPropertyBag::new());
    let obj = ObjectHandle::with_capabilities(
        ty,
        Capabilities {
            bag: Some(bag),
            ..Default::default()
        },
    );

    let binder = Binder::new(registry);
    let target = binder
        .wrap(Value::Object(obj), None, TargetFlags::default())
        .unwrap();

    binder
        .set_member(&target, "greeting", Value::from("hello"))
        .unwrap();
    assert_eq!(
        binder.get_member(&target, "greeting").unwrap(),
        Value::from("hello")
    );

    let names = binder.enumerate_members(&target);
    assert!(names.properties.iter().any(|n| &**n == "greeting"));

    assert!(binder.delete_member(&target, "greeting").unwrap());
    assert!(!binder.delete_member(&target, "greeting").unwrap());
    let names = binder.enumerate_members(&target);
    assert!(!names.properties.iter().any(|n| &**n == "greeting"));
}

#[test]
fn native_dispatch_is_exclusive_and_can_be_disabled() {
    let registry = TypeRegistry::new();
    let ty = TypeDescription::builder("Remote").opaque().register(&registry);
    let provider = Arc::new(MemoryDispatch::with_members([
        ("Status", Value::from("online")),
    ]));
    let obj = ObjectHandle::with_capabilities(
        ty,
        Capabilities {
            dispatch: Some(provider),
            ..Default::default()
        },
    );

    let binder = Binder::new(registry.clone());
    let target = binder
        .wrap(Value::Object(obj.clone()), None, TargetFlags::default())
        .unwrap();
    assert_eq!(
        binder.get_member(&target, "Status").unwrap(),
        Value::from("online")
    );
    // The dispatch provider owns the namespace; reflection members of the
    // root type do not leak through.
    assert!(matches!(
        binder.get_member(&target, "ToString"),
        Err(BindError::MemberNotFound { .. })
    ));

    let disabled = Binder::new(registry).with_options(BinderOptions {
        disable_native_binding: true,
        ..Default::default()
    });
    let target = disabled
        .wrap(
            Value::Object(obj),
            None,
            TargetFlags::default().with(TargetFlags::SUPPRESS_DYNAMIC),
        )
        .unwrap();
    assert!(matches!(
        disabled.get_member(&target, "Status"),
        Err(BindError::MemberNotFound { .. })
    ));
}

#[test]
fn list_targets_expose_indices_count_and_enumerator() {
    let registry = TypeRegistry::new();
    let binder = Binder::new(registry);
    let list = ListHandle::new(vec![Value::Int32(7), Value::Int32(8)]);
    let target = binder
        .wrap(Value::List(list), None, TargetFlags::default())
        .unwrap();

    assert_eq!(binder.get_member(&target, "Count").unwrap(), Value::Int32(2));
    assert_eq!(binder.enumerate_indices(&target), vec![0, 1]);
    // Indices belong to enumerate_indices only, never to the member names.
    let names = binder.enumerate_members(&target);
    assert!(!names.all().iter().any(|n| n.parse::<usize>().is_ok()));

    let mut index = [Value::Int32(1)];
    assert_eq!(binder.get_index(&target, &mut index).unwrap(), Value::Int32(8));
    binder
        .set_index(&target, &[Value::Int32(0)], Value::Int32(70))
        .unwrap();
    let mut index = [Value::Int32(0)];
    assert_eq!(binder.get_index(&target, &mut index).unwrap(), Value::Int32(70));

    let enumerator = match binder.get_member(&target, "GetEnumerator").unwrap() {
        Value::Callable(c) => c,
        other => panic!("expected callable, got {:?}", other),
    };
    assert_eq!(enumerator.invoke(&mut []).unwrap(), Value::Int32(70));
}

#[test]
fn construction_goes_through_type_object_targets() {
    let registry = TypeRegistry::new();
    let ty = point_type(&registry);
    let binder = Binder::new(registry);
    let target = binder
        .wrap(Value::Type(ty), None, TargetFlags::default())
        .unwrap();

    let mut args = [Value::Int32(4), Value::Int32(5)];
    let instance = binder.construct(&target, &mut args).unwrap();
    let obj = match instance {
        Value::Object(o) => o,
        other => panic!("expected object, got {:?}", other),
    };
    assert_eq!(obj.get_field("X"), Some(Value::Int32(4)));
    assert_eq!(obj.get_field("Y"), Some(Value::Int32(5)));
}

#[test]
fn setting_a_method_name_is_an_invalid_mode() {
    let registry = TypeRegistry::new();
    let ty = point_type(&registry);
    let binder = Binder::new(registry);
    let target = binder
        .wrap(
            Value::Object(ObjectHandle::new(ty)),
            None,
            TargetFlags::default(),
        )
        .unwrap();
    assert!(matches!(
        binder.set_member(&target, "Translate", Value::Int32(1)),
        Err(BindError::InvalidInvocationMode {
            mode: InvokeMode::Set,
            ..
        })
    ));
}

#[test]
fn ambiguous_overloads_are_reported_not_guessed() {
    let registry = TypeRegistry::new();
    let ty = TypeDescription::builder("Twins")
        .method(MethodDescription::new(
            "Pick",
            vec![ParamDescription::by_value(TypeTag::Int64)],
            TypeTag::Str,
            |_, _| Ok(Value::from("long")),
        ))
        .method(MethodDescription::new(
            "Pick",
            vec![ParamDescription::by_value(TypeTag::Float64)],
            TypeTag::Str,
            |_, _| Ok(Value::from("double")),
        ))
        .register(&registry);
    let binder = Binder::new(registry);
    let target = binder
        .wrap(
            Value::Object(ObjectHandle::new(ty)),
            None,
            TargetFlags::default(),
        )
        .unwrap();

    // An i32 widens to both overloads at different costs; i64 is closer.
    let mut args = [Value::Int32(1)];
    assert_eq!(
        binder.invoke(&target, "Pick", &[], &mut args, None).unwrap(),
        Value::from("long")
    );

    // A string fits neither by score; the manual scan then sees two
    // same-arity candidates and refuses to guess.
    let mut args = [Value::from("?")];
    assert!(matches!(
        binder.invoke(&target, "Pick", &[], &mut args, None),
        Err(BindError::AmbiguousMember { candidates: 2, .. })
    ));
}

#[test]
fn method_group_get_produces_a_bound_callable() {
    let registry = TypeRegistry::new();
    let ty = point_type(&registry);
    let binder = Binder::new(registry);
    let obj = ObjectHandle::new(ty);
    obj.set_field("X", Value::Int32(10));
    let target = binder
        .wrap(Value::Object(obj.clone()), None, TargetFlags::default())
        .unwrap();

    let callable = match binder.get_member(&target, "Translate").unwrap() {
        Value::Callable(c) => c,
        other => panic!("expected callable, got {:?}", other),
    };
    let mut args = [Value::Int32(5), Value::Int32(0)];
    callable.invoke(&mut args).unwrap();
    assert_eq!(obj.get_field("X"), Some(Value::Int32(15)));
}

#[test]
fn bound_method_targets_invoke_with_an_empty_name() {
    let registry = TypeRegistry::new();
    let ty = point_type(&registry);
    let binder = Binder::new(registry);
    let obj = ObjectHandle::new(ty.clone());
    let target = Target::bound_method(Value::Object(obj.clone()), "Translate", ty);

    let mut args = [Value::Int32(2), Value::Int32(3)];
    binder.invoke(&target, "", &[], &mut args, None).unwrap();
    assert_eq!(obj.get_field("X"), Some(Value::Int32(2)));
    assert_eq!(obj.get_field("Y"), Some(Value::Int32(3)));
}

#[test]
fn indexed_property_targets_route_index_access() {
    let registry = TypeRegistry::new();
    let ty = TypeDescription::builder("Grid")
        .property(
            PropertyDescription::new("Item", TypeTag::Int32)
                .with_index_params(1)
                .with_getter(|_, indices| {
                    Ok(Value::Int32(indices[0].as_i32().unwrap_or(0) * 10))
                }),
        )
        .register(&registry);
    let binder = Binder::new(registry);
    let obj = ObjectHandle::new(ty.clone());
    let target = Target::indexed_property(Value::Object(obj), "Item", ty);

    let mut indices = [Value::Int32(3)];
    assert_eq!(
        binder.get_index(&target, &mut indices).unwrap(),
        Value::Int32(30)
    );
    // No setter declared.
    assert!(matches!(
        binder.set_index(&target, &[Value::Int32(3)], Value::Int32(1)),
        Err(BindError::AccessDenied { .. })
    ));
}

#[test]
fn shim_write_back_survives_script_failure() {
    let shim = DelegateShim::new(
        ShimDescriptor::new(&[true]).unwrap(),
        ScriptCallable::new(|args| {
            if let Value::ByRef(slot) = &args[0] {
                slot.write(Value::Int32(99));
            }
            Err(BindError::HostFault("deliberate".to_string()))
        }),
    );
    let mut args = [Value::Int32(0)];
    assert!(shim.invoke(&mut args).is_err());
    assert_eq!(args[0], Value::Int32(99));
}
