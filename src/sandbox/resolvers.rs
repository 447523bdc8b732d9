// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pluggable property, method, constructor and type resolvers
//!
//! Every reflective operation an expression performs goes through one of
//! these traits. Three sets are built per engine:
//!
//! - **open**: unsandboxed evaluation; all visibilities, unrestricted types
//! - **visibility**: sandboxed path backend; allow-listed types and the
//!   policy's visibility flags
//! - **policy**: sandboxed compiled backend; additionally consults the
//!   per-kind member rules before each operation

use std::sync::Arc;

use super::access_gate::MemberAccessGate;
use super::policy::Sandbox;
use super::type_resolver::TypeAllowList;
use crate::error::{EvalError, EvalResult};
use crate::error::InvokeError;
use crate::model::{HostType, Member, TypeRegistry, Value, ValueMap};

/// Resolves property reads
pub trait PropertyResolver: Send + Sync {
    /// Read `property` from `target`
    fn read(&self, target: &Value, property: &str) -> EvalResult<Value>;
}

/// Resolves method calls
pub trait MethodResolver: Send + Sync {
    /// Call `method` on `target`
    fn invoke(&self, target: &Value, method: &str, args: &[Value]) -> EvalResult<Value>;
}

/// Resolves constructor invocations
pub trait ConstructorResolver: Send + Sync {
    /// Construct an instance of `type_name`
    fn construct(&self, type_name: &str, args: &[Value]) -> EvalResult<Value>;
}

/// Resolves type names
pub trait TypeResolver: Send + Sync {
    /// Look up a type by name
    fn resolve(&self, type_name: &str) -> EvalResult<Arc<HostType>>;
}

/// Type resolver over the whole registry
pub struct OpenTypeResolver {
    registry: Arc<TypeRegistry>,
}

impl OpenTypeResolver {
    /// Create a resolver over `registry`
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }
}

impl TypeResolver for OpenTypeResolver {
    fn resolve(&self, type_name: &str) -> EvalResult<Arc<HostType>> {
        self.registry
            .get_qualified(type_name)
            .ok_or_else(|| EvalError::UnknownType {
                name: type_name.to_string(),
            })
    }
}

impl TypeResolver for TypeAllowList {
    fn resolve(&self, type_name: &str) -> EvalResult<Arc<HostType>> {
        TypeAllowList::resolve(self, type_name).ok_or_else(|| EvalError::denied_type(type_name))
    }
}

/// State shared by the member resolvers of one set
struct MemberAccess {
    registry: Arc<TypeRegistry>,
    gate: MemberAccessGate,
    /// Present when member rules are enforced
    rules: Option<Arc<Sandbox>>,
}

impl MemberAccess {
    fn check_rules(&self, member: &Member) -> EvalResult<()> {
        let Some(sandbox) = &self.rules else {
            return Ok(());
        };
        let qualified = member.qualified_name();
        if sandbox.snapshot().rules_for(member.kind()).permits(&qualified) {
            Ok(())
        } else {
            log::debug!("Sandbox policy denied {} {qualified}", member.kind());
            Err(EvalError::denied_member(member.kind(), qualified))
        }
    }

    /// Run a member operation under the gate
    fn run<F>(&self, member: &Member, call: F) -> EvalResult<Value>
    where
        F: FnOnce(&Member) -> Result<Value, InvokeError>,
    {
        self.check_rules(member)?;
        let Some(guard) = self.gate.enter(member) else {
            log::debug!(
                "{:?} {} {} is not accessible",
                member.visibility(),
                member.kind(),
                member.qualified_name()
            );
            return Err(EvalError::denied_member(
                member.kind(),
                member.qualified_name(),
            ));
        };
        call(guard.member()).map_err(|source| EvalError::Invocation {
            member: member.qualified_name(),
            source,
        })
    }
}

/// Property resolver gated by visibility and, optionally, member rules
pub struct GuardedPropertyResolver {
    access: Arc<MemberAccess>,
}

impl PropertyResolver for GuardedPropertyResolver {
    fn read(&self, target: &Value, property: &str) -> EvalResult<Value> {
        match target {
            Value::Null => Err(EvalError::NullIntermediate {
                property: property.to_string(),
            }),
            Value::Map(map) => Ok(map.get(property).cloned().unwrap_or_default()),
            Value::Object(_) => {
                let member = self
                    .access
                    .registry
                    .type_of(target)
                    .and_then(|ty| ty.property(property).cloned())
                    .ok_or_else(|| EvalError::UnknownProperty {
                        property: property.to_string(),
                        type_name: target.type_name().to_string(),
                    })?;
                self.access.run(&member, |m| m.get(target))
            }
            other => Err(EvalError::UnknownProperty {
                property: property.to_string(),
                type_name: other.type_name().to_string(),
            }),
        }
    }
}

/// Method resolver gated by visibility and, optionally, member rules
pub struct GuardedMethodResolver {
    access: Arc<MemberAccess>,
}

impl MethodResolver for GuardedMethodResolver {
    fn invoke(&self, target: &Value, method: &str, args: &[Value]) -> EvalResult<Value> {
        if target.is_null() {
            return Err(EvalError::NullIntermediate {
                property: method.to_string(),
            });
        }
        let member = self
            .access
            .registry
            .type_of(target)
            .and_then(|ty| ty.method(method).cloned())
            .ok_or_else(|| EvalError::UnknownMethod {
                method: method.to_string(),
                type_name: target.type_name().to_string(),
            })?;
        self.access.run(&member, |m| m.call(target, args))
    }
}

/// Constructor resolver gated by type resolution, visibility and rules
pub struct GuardedConstructorResolver {
    access: Arc<MemberAccess>,
    types: Arc<dyn TypeResolver>,
}

impl ConstructorResolver for GuardedConstructorResolver {
    fn construct(&self, type_name: &str, args: &[Value]) -> EvalResult<Value> {
        let ty = self.types.resolve(type_name)?;
        let member = ty.constructor().cloned().ok_or_else(|| EvalError::UnknownMethod {
            method: "new".to_string(),
            type_name: ty.name().to_string(),
        })?;
        self.access.run(&member, |m| m.construct(args))
    }
}

/// The four resolvers used by one evaluation mode
#[derive(Clone)]
pub struct ResolverSet {
    /// Property reads
    pub properties: Arc<dyn PropertyResolver>,
    /// Method calls
    pub methods: Arc<dyn MethodResolver>,
    /// Constructor invocations
    pub constructors: Arc<dyn ConstructorResolver>,
    /// Type lookups for `new` and `is`
    pub types: Arc<dyn TypeResolver>,
    registry: Arc<TypeRegistry>,
}

impl ResolverSet {
    /// Unsandboxed resolvers
    pub fn open(registry: Arc<TypeRegistry>) -> Self {
        let types: Arc<dyn TypeResolver> = Arc::new(OpenTypeResolver::new(Arc::clone(&registry)));
        Self::assemble(registry, MemberAccessGate::open(), None, types)
    }

    /// Sandboxed resolvers enforcing the allow-list and visibility flags
    pub fn visibility(
        sandbox: Arc<Sandbox>,
        registry: Arc<TypeRegistry>,
        allow_list: Arc<TypeAllowList>,
    ) -> Self {
        Self::assemble(
            registry,
            MemberAccessGate::sandboxed(sandbox),
            None,
            allow_list,
        )
    }

    /// Sandboxed resolvers that also enforce per-kind member rules
    pub fn policy(
        sandbox: Arc<Sandbox>,
        registry: Arc<TypeRegistry>,
        allow_list: Arc<TypeAllowList>,
    ) -> Self {
        Self::assemble(
            registry,
            MemberAccessGate::sandboxed(Arc::clone(&sandbox)),
            Some(sandbox),
            allow_list,
        )
    }

    fn assemble(
        registry: Arc<TypeRegistry>,
        gate: MemberAccessGate,
        rules: Option<Arc<Sandbox>>,
        types: Arc<dyn TypeResolver>,
    ) -> Self {
        let access = Arc::new(MemberAccess {
            registry: Arc::clone(&registry),
            gate,
            rules,
        });
        Self {
            properties: Arc::new(GuardedPropertyResolver {
                access: Arc::clone(&access),
            }),
            methods: Arc::new(GuardedMethodResolver {
                access: Arc::clone(&access),
            }),
            constructors: Arc::new(GuardedConstructorResolver {
                access,
                types: Arc::clone(&types),
            }),
            types,
            registry,
        }
    }

    /// Registry the resolvers read member descriptions from
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Project a host object onto a map of its readable properties
    ///
    /// Properties the active mode refuses are left out.
    pub fn project(&self, object: &Value) -> Option<ValueMap> {
        let ty = self.registry.type_of(object)?;
        let map = ty
            .properties()
            .filter_map(|member| {
                self.properties
                    .read(object, member.name())
                    .ok()
                    .map(|value| (member.name().to_string(), value))
            })
            .collect();
        Some(map)
    }

    /// Evaluate `value is type_name`
    pub fn is_instance(&self, value: &Value, type_name: &str) -> EvalResult<bool> {
        let ty = self.types.resolve(type_name)?;
        Ok(!value.is_null() && value.type_name() == ty.name())
    }
}

impl std::fmt::Debug for ResolverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverSet")
            .field("types", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeniedKind;
    use crate::model::{HostObject, MemberKind, Visibility};
    use crate::sandbox::{AccessFlags, MemberPolicy};
    use std::any::Any;

    #[derive(Debug)]
    struct Order {
        total: i64,
    }

    impl HostObject for Order {
        fn type_name(&self) -> &str {
            "shop.Order"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn fixture() -> (Arc<Sandbox>, Arc<TypeRegistry>, Arc<TypeAllowList>) {
        let registry = Arc::new(TypeRegistry::with_builtins());
        registry.register(
            HostType::builder("shop.Order")
                .property("total", Visibility::Public, |o: &Order| o.total.into())
                .property("margin", Visibility::Private, |o: &Order| (o.total / 4).into())
                .method("discount", Visibility::Public, |o: &Order, args| {
                    let pct = args.first().and_then(Value::as_i64).unwrap_or(0);
                    Ok(Value::Integer(o.total - o.total * pct / 100))
                })
                .constructor(Visibility::Public, |args| {
                    let total = args.first().and_then(Value::as_i64).unwrap_or(0);
                    Ok(Value::object(Order { total }))
                })
                .build(),
        );
        let sandbox = Arc::new(Sandbox::default());
        let allow_list = Arc::new(TypeAllowList::new(
            Arc::clone(&sandbox),
            Arc::clone(&registry),
            16,
        ));
        (sandbox, registry, allow_list)
    }

    #[test]
    fn test_open_set_reads_everything() {
        let (_, registry, _) = fixture();
        let set = ResolverSet::open(registry);
        let order = set.constructors.construct("shop.Order", &[Value::from(100)]).unwrap();
        assert_eq!(set.properties.read(&order, "margin").unwrap(), Value::Integer(25));
        assert_eq!(
            set.methods.invoke(&order, "discount", &[Value::from(10)]).unwrap(),
            Value::Integer(90)
        );
    }

    #[test]
    fn test_policy_set_enforces_method_rules() {
        let (sandbox, registry, allow_list) = fixture();
        let set = ResolverSet::policy(Arc::clone(&sandbox), registry, allow_list);
        let order = Value::object(Order { total: 100 });

        let err = set.methods.invoke(&order, "discount", &[Value::from(10)]).unwrap_err();
        assert_eq!(
            err,
            EvalError::Denied {
                kind: DeniedKind::Member(MemberKind::Method),
                target: "shop.Order#discount".into(),
            }
        );

        sandbox.set_method_policy(MemberPolicy::deny_all().allow("shop.*#*").unwrap());
        assert_eq!(
            set.methods.invoke(&order, "discount", &[Value::from(10)]).unwrap(),
            Value::Integer(90)
        );
        assert_eq!(
            set.methods.invoke(&Value::from("a"), "length", &[]).unwrap_err(),
            EvalError::denied_member(MemberKind::Method, "lang.String#length")
        );
    }

    #[test]
    fn test_visibility_set_ignores_member_rules() {
        let (sandbox, registry, allow_list) = fixture();
        let set = ResolverSet::visibility(Arc::clone(&sandbox), registry, allow_list);
        let order = Value::object(Order { total: 100 });

        assert!(set.methods.invoke(&order, "discount", &[Value::from(10)]).is_ok());
        assert!(matches!(
            set.properties.read(&order, "margin"),
            Err(EvalError::Denied { .. })
        ));

        sandbox.set_access_flags(AccessFlags::all());
        assert_eq!(set.properties.read(&order, "margin").unwrap(), Value::Integer(25));
    }

    #[test]
    fn test_sandboxed_constructor_needs_allow_list() {
        let (sandbox, registry, allow_list) = fixture();
        let set = ResolverSet::visibility(Arc::clone(&sandbox), registry, allow_list);
        assert_eq!(
            set.constructors.construct("shop.Order", &[]).unwrap_err(),
            EvalError::denied_type("shop.Order")
        );
        sandbox.allow_type("shop.Order");
        assert!(set.constructors.construct("shop.Order", &[]).is_ok());
    }

    #[test]
    fn test_null_and_map_targets() {
        let (_, registry, _) = fixture();
        let set = ResolverSet::open(registry);
        assert!(matches!(
            set.properties.read(&Value::Null, "x"),
            Err(EvalError::NullIntermediate { .. })
        ));
        let map = Value::map([("x", Value::from(1))]);
        assert_eq!(set.properties.read(&map, "x").unwrap(), Value::Integer(1));
        assert_eq!(set.properties.read(&map, "y").unwrap(), Value::Null);
    }

    #[test]
    fn test_project_skips_denied_properties() {
        let (sandbox, registry, allow_list) = fixture();
        let set = ResolverSet::visibility(sandbox, registry, allow_list);
        let projected = set.project(&Value::object(Order { total: 8 })).unwrap();
        assert_eq!(projected.len(), 1);
        assert_eq!(projected["total"], Value::Integer(8));
    }
}
