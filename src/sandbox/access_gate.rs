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

//! Member access gate
//!
//! Decides whether a member's visibility may be accessed under the active
//! policy and performs the scoped elevation that lets a non-public member
//! run. Elevation is tied to an [`AccessGuard`]; dropping the guard restores
//! the member on every exit path, unwinding included.

use std::sync::Arc;

use super::policy::{AccessFlags, Sandbox};
use crate::model::{Member, Visibility};

#[derive(Debug, Clone)]
enum GateMode {
    /// All visibilities permitted
    Open,
    /// Visibility flags read live from the sandbox policy
    Sandboxed(Arc<Sandbox>),
}

/// Visibility gate consulted before every reflective member access
#[derive(Debug, Clone)]
pub struct MemberAccessGate {
    mode: GateMode,
}

impl MemberAccessGate {
    /// Gate that permits every visibility
    pub fn open() -> Self {
        Self {
            mode: GateMode::Open,
        }
    }

    /// Gate that follows the sandbox's visibility flags
    pub fn sandboxed(sandbox: Arc<Sandbox>) -> Self {
        Self {
            mode: GateMode::Sandboxed(sandbox),
        }
    }

    fn flags(&self) -> AccessFlags {
        match &self.mode {
            GateMode::Open => AccessFlags::all(),
            GateMode::Sandboxed(sandbox) => sandbox.snapshot().access,
        }
    }

    /// Whether the member's visibility is currently permitted
    pub fn is_accessible(&self, member: &Member) -> bool {
        member.visibility() == Visibility::Public || self.flags().permits(member.visibility())
    }

    /// Elevate the member for one call if it is accessible
    ///
    /// Returns `None` when the visibility is not permitted. Public members
    /// need no elevation and get a guard that restores nothing.
    pub fn enter<'m>(&self, member: &'m Member) -> Option<AccessGuard<'m>> {
        if !self.is_accessible(member) {
            return None;
        }
        let elevated = member.visibility() != Visibility::Public;
        if elevated {
            member.elevate();
        }
        Some(AccessGuard { member, elevated })
    }

    /// Restore a member elevated by [`enter`](Self::enter)
    pub fn exit(&self, guard: AccessGuard<'_>) {
        drop(guard);
    }
}

/// Restore token for a scoped elevation
#[must_use = "the member is restored as soon as the guard is dropped"]
pub struct AccessGuard<'m> {
    member: &'m Member,
    elevated: bool,
}

impl AccessGuard<'_> {
    /// The guarded member
    pub fn member(&self) -> &Member {
        self.member
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        if self.elevated {
            self.member.restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvokeError;
    use crate::model::{HostType, Value};
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn secret_type() -> HostType {
        HostType::builder("test.Vault")
            .value_property("secret", Visibility::Private, |_| Ok(Value::from("s3cr3t")))
            .value_property("label", Visibility::Public, |_| Ok(Value::from("vault")))
            .value_property("audit", Visibility::Protected, |_| Ok(Value::from(1)))
            .build()
    }

    #[test]
    fn test_private_requires_flag() {
        let ty = secret_type();
        let secret = ty.property("secret").unwrap();
        let sandbox = Arc::new(Sandbox::default());
        let gate = MemberAccessGate::sandboxed(Arc::clone(&sandbox));

        assert!(!gate.is_accessible(secret));
        assert!(gate.enter(secret).is_none());

        sandbox.set_access_flags(AccessFlags {
            allow_private: true,
            ..AccessFlags::default()
        });
        let guard = gate.enter(secret).unwrap();
        assert_eq!(secret.get(&Value::Null).unwrap(), Value::from("s3cr3t"));
        gate.exit(guard);
        assert!(!secret.is_open());

        sandbox.set_access_flags(AccessFlags::default());
        assert!(gate.enter(secret).is_none());
        assert_eq!(secret.get(&Value::Null), Err(InvokeError::Inaccessible));
    }

    #[test]
    fn test_flags_are_independent() {
        let ty = secret_type();
        let sandbox = Arc::new(Sandbox::default());
        sandbox.set_access_flags(AccessFlags {
            allow_protected: true,
            ..AccessFlags::default()
        });
        let gate = MemberAccessGate::sandboxed(sandbox);
        assert!(gate.is_accessible(ty.property("audit").unwrap()));
        assert!(!gate.is_accessible(ty.property("secret").unwrap()));
        assert!(gate.is_accessible(ty.property("label").unwrap()));
    }

    #[test]
    fn test_restore_on_panic() {
        let ty = secret_type();
        let secret = ty.property("secret").unwrap();
        let gate = MemberAccessGate::open();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = gate.enter(secret).unwrap();
            assert!(secret.is_open());
            panic!("member call failed");
        }));
        assert!(result.is_err());
        assert!(!secret.is_open());
    }

    #[test]
    fn test_nested_elevation() {
        let ty = secret_type();
        let secret = ty.property("secret").unwrap();
        let gate = MemberAccessGate::open();
        let outer = gate.enter(secret).unwrap();
        let inner = gate.enter(secret).unwrap();
        drop(inner);
        assert!(secret.is_open());
        drop(outer);
        assert!(!secret.is_open());
    }
}
