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

//! Host reflection model
//!
//! Host applications expose their own types to expressions by describing
//! them as a [`HostType`]: a named set of properties, methods and an optional
//! constructor. Every member carries a [`Visibility`]. Non-public members
//! refuse invocation until the member access gate elevates them for the
//! duration of a single call.

use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::value::Value;
use crate::error::InvokeError;

/// Namespace of the builtin value types
pub const BUILTIN_NAMESPACE: &str = "lang";

/// Object owned by the host application and visible to expressions
pub trait HostObject: Any + Send + Sync + fmt::Debug {
    /// Qualified name under which the object's [`HostType`] is registered
    fn type_name(&self) -> &str;

    /// Access to the concrete type for member closures
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a host object
pub type HostRef = Arc<dyn HostObject>;

/// Declared visibility of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Always accessible
    Public,
    /// Accessible when protected access is enabled
    Protected,
    /// Accessible when package access is enabled
    Package,
    /// Accessible when private access is enabled
    Private,
}

/// Kind of reflective member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    /// Property read
    Property,
    /// Method call
    Method,
    /// Constructor invocation
    Constructor,
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberKind::Property => write!(f, "property"),
            MemberKind::Method => write!(f, "method"),
            MemberKind::Constructor => write!(f, "constructor"),
        }
    }
}

type GetterFn = dyn Fn(&Value) -> Result<Value, InvokeError> + Send + Sync;
type MethodFn = dyn Fn(&Value, &[Value]) -> Result<Value, InvokeError> + Send + Sync;
type ConstructorFn = dyn Fn(&[Value]) -> Result<Value, InvokeError> + Send + Sync;

enum Invoker {
    Getter(Box<GetterFn>),
    Method(Box<MethodFn>),
    Constructor(Box<ConstructorFn>),
}

/// A property, method or constructor of a [`HostType`]
pub struct Member {
    owner: String,
    name: String,
    kind: MemberKind,
    visibility: Visibility,
    /// Number of in-flight elevated calls
    elevation: AtomicUsize,
    invoker: Invoker,
}

impl Member {
    /// Member name (`new` for constructors)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Qualified name of the declaring type
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Member kind
    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    /// Declared visibility
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    /// `Owner#name`, the form matched by member policies
    pub fn qualified_name(&self) -> String {
        format!("{}#{}", self.owner, self.name)
    }

    /// Whether the member can be invoked right now
    pub fn is_open(&self) -> bool {
        self.visibility == Visibility::Public || self.elevation.load(Ordering::Acquire) > 0
    }

    pub(crate) fn elevate(&self) {
        self.elevation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn restore(&self) {
        self.elevation.fetch_sub(1, Ordering::AcqRel);
    }

    /// Read a property from `receiver`
    pub fn get(&self, receiver: &Value) -> Result<Value, InvokeError> {
        self.ensure_open()?;
        match &self.invoker {
            Invoker::Getter(getter) => getter(receiver),
            _ => Err(self.wrong_kind()),
        }
    }

    /// Call a method on `receiver`
    pub fn call(&self, receiver: &Value, args: &[Value]) -> Result<Value, InvokeError> {
        self.ensure_open()?;
        match &self.invoker {
            Invoker::Method(method) => method(receiver, args),
            _ => Err(self.wrong_kind()),
        }
    }

    /// Invoke a constructor
    pub fn construct(&self, args: &[Value]) -> Result<Value, InvokeError> {
        self.ensure_open()?;
        match &self.invoker {
            Invoker::Constructor(constructor) => constructor(args),
            _ => Err(self.wrong_kind()),
        }
    }

    fn ensure_open(&self) -> Result<(), InvokeError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(InvokeError::Inaccessible)
        }
    }

    fn wrong_kind(&self) -> InvokeError {
        InvokeError::Failed(format!("{} is a {}", self.qualified_name(), self.kind))
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("name", &self.qualified_name())
            .field("kind", &self.kind)
            .field("visibility", &self.visibility)
            .finish()
    }
}

/// Reflective description of a type visible to expressions
#[derive(Debug)]
pub struct HostType {
    name: String,
    properties: IndexMap<String, Arc<Member>>,
    methods: IndexMap<String, Arc<Member>>,
    constructor: Option<Arc<Member>>,
}

impl HostType {
    /// Start describing a type with the given qualified name
    pub fn builder(name: impl Into<String>) -> HostTypeBuilder {
        HostTypeBuilder {
            ty: HostType {
                name: name.into(),
                properties: IndexMap::new(),
                methods: IndexMap::new(),
                constructor: None,
            },
        }
    }

    /// Qualified type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without its namespace
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    /// Look up a property
    pub fn property(&self, name: &str) -> Option<&Arc<Member>> {
        self.properties.get(name)
    }

    /// Look up a method
    pub fn method(&self, name: &str) -> Option<&Arc<Member>> {
        self.methods.get(name)
    }

    /// The constructor, if the type declares one
    pub fn constructor(&self) -> Option<&Arc<Member>> {
        self.constructor.as_ref()
    }

    /// All properties in declaration order
    pub fn properties(&self) -> impl Iterator<Item = &Arc<Member>> {
        self.properties.values()
    }

    /// All methods in declaration order
    pub fn methods(&self) -> impl Iterator<Item = &Arc<Member>> {
        self.methods.values()
    }
}

/// Fluent builder for [`HostType`]
pub struct HostTypeBuilder {
    ty: HostType,
}

impl HostTypeBuilder {
    /// Declare a property of a concrete host object type
    pub fn property<T, F>(self, name: &str, visibility: Visibility, getter: F) -> Self
    where
        T: HostObject,
        F: Fn(&T) -> Value + Send + Sync + 'static,
    {
        let owner = self.ty.name.clone();
        self.value_property(name, visibility, move |receiver| {
            downcast::<T>(&owner, receiver).map(|object| getter(object))
        })
    }

    /// Declare a method of a concrete host object type
    pub fn method<T, F>(self, name: &str, visibility: Visibility, method: F) -> Self
    where
        T: HostObject,
        F: Fn(&T, &[Value]) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        let owner = self.ty.name.clone();
        self.value_method(name, visibility, move |receiver, args| {
            method(downcast::<T>(&owner, receiver)?, args)
        })
    }

    /// Declare a property over an arbitrary receiver value
    pub fn value_property<F>(mut self, name: &str, visibility: Visibility, getter: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        let member = self.member(name, MemberKind::Property, visibility, Invoker::Getter(Box::new(getter)));
        self.ty.properties.insert(name.to_string(), member);
        self
    }

    /// Declare a method over an arbitrary receiver value
    pub fn value_method<F>(mut self, name: &str, visibility: Visibility, method: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        let member = self.member(name, MemberKind::Method, visibility, Invoker::Method(Box::new(method)));
        self.ty.methods.insert(name.to_string(), member);
        self
    }

    /// Declare the constructor
    pub fn constructor<F>(mut self, visibility: Visibility, constructor: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        let member = self.member(
            "new",
            MemberKind::Constructor,
            visibility,
            Invoker::Constructor(Box::new(constructor)),
        );
        self.ty.constructor = Some(member);
        self
    }

    /// Finish the description
    pub fn build(self) -> HostType {
        self.ty
    }

    fn member(&self, name: &str, kind: MemberKind, visibility: Visibility, invoker: Invoker) -> Arc<Member> {
        Arc::new(Member {
            owner: self.ty.name.clone(),
            name: name.to_string(),
            kind,
            visibility,
            elevation: AtomicUsize::new(0),
            invoker,
        })
    }
}

fn downcast<'v, T: HostObject>(owner: &str, receiver: &'v Value) -> Result<&'v T, InvokeError> {
    receiver
        .downcast_ref::<T>()
        .ok_or_else(|| InvokeError::WrongReceiver {
            expected: owner.to_string(),
        })
}

/// Registry of every type expressions may refer to
///
/// Registration does not grant access: sandboxed lookups additionally go
/// through the type allow-list.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: DashMap<String, Arc<HostType>>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the builtin `lang` types
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for ty in super::builtins::builtin_types() {
            registry.types.insert(ty.name().to_string(), Arc::clone(ty));
        }
        registry
    }

    /// Register a type, replacing any previous type with the same name
    pub fn register(&self, ty: HostType) -> Arc<HostType> {
        let ty = Arc::new(ty);
        log::debug!("Registering host type {}", ty.name());
        self.types.insert(ty.name().to_string(), Arc::clone(&ty));
        ty
    }

    /// Look up a type by qualified name
    pub fn get(&self, name: &str) -> Option<Arc<HostType>> {
        self.types.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a type, retrying unqualified names in the builtin namespace
    pub fn get_qualified(&self, name: &str) -> Option<Arc<HostType>> {
        self.get(name).or_else(|| {
            if name.contains('.') {
                None
            } else {
                self.get(&format!("{BUILTIN_NAMESPACE}.{name}"))
            }
        })
    }

    /// Type describing a value's members
    pub fn type_of(&self, value: &Value) -> Option<Arc<HostType>> {
        match value {
            Value::Null => None,
            other => self.get(other.type_name()),
        }
    }

    /// Whether a type is registered
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no type is registered
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Account {
        owner: String,
        pin: i64,
    }

    impl HostObject for Account {
        fn type_name(&self) -> &str {
            "bank.Account"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn account_type() -> HostType {
        HostType::builder("bank.Account")
            .property("owner", Visibility::Public, |a: &Account| a.owner.clone().into())
            .property("pin", Visibility::Private, |a: &Account| a.pin.into())
            .build()
    }

    #[test]
    fn test_public_property_reads() {
        let ty = account_type();
        let account = Value::object(Account {
            owner: "ada".into(),
            pin: 1234,
        });
        let owner = ty.property("owner").unwrap();
        assert_eq!(owner.get(&account).unwrap(), Value::from("ada"));
        assert_eq!(owner.qualified_name(), "bank.Account#owner");
        assert_eq!(ty.simple_name(), "Account");
    }

    #[test]
    fn test_private_member_requires_elevation() {
        let ty = account_type();
        let account = Value::object(Account {
            owner: "ada".into(),
            pin: 1234,
        });
        let pin = ty.property("pin").unwrap();
        assert_eq!(pin.get(&account), Err(InvokeError::Inaccessible));

        pin.elevate();
        assert_eq!(pin.get(&account).unwrap(), Value::Integer(1234));
        pin.restore();
        assert!(!pin.is_open());
    }

    #[test]
    fn test_wrong_receiver() {
        let ty = account_type();
        let err = ty.property("owner").unwrap().get(&Value::from(1)).unwrap_err();
        assert_eq!(
            err,
            InvokeError::WrongReceiver {
                expected: "bank.Account".into()
            }
        );
    }

    #[test]
    fn test_registry_builtin_namespace_retry() {
        let registry = TypeRegistry::with_builtins();
        assert!(registry.get("String").is_none());
        assert_eq!(registry.get_qualified("String").unwrap().name(), "lang.String");
        assert!(registry.get_qualified("acme.String").is_none());
    }
}
