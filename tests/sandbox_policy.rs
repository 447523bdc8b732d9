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

//! Sandbox policy enforcement through the public engine API

use expr_sandbox::error::DeniedKind;
use expr_sandbox::model::MemberKind;
use expr_sandbox::registry::MapConfigResolver;
use expr_sandbox::{
    AccessFlags, Backend, CompileOptions, ExpressionEngine, ExpressionError, ExpressionSource,
    MemberPolicy, Value,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

mod utils;
use utils::{engine, order_root};

#[test]
fn allow_list_negative_memo_is_dropped_when_the_list_changes() {
    let engine = engine();
    let types = engine.type_allow_list();

    assert!(types.resolve("shop.Order").is_none());
    assert!(types.resolve("shop.Order").is_none());

    engine.allow_type("shop.Order");
    assert_eq!(
        types.resolve("shop.Order").map(|ty| ty.name().to_string()),
        Some("shop.Order".to_string())
    );

    engine.set_allowed_types(["lang.String"]);
    assert!(types.resolve("shop.Order").is_none());
    assert!(types.resolve("String").is_some());
    assert!(types.resolve("Integer").is_none());
}

#[test]
fn sandboxed_constructor_needs_allowed_type() {
    let engine = engine();
    let source = ExpressionSource::text("new shop.Order(40).total", Backend::Path);

    let err = engine
        .evaluate_with_exception(source.clone(), Value::Null, true)
        .unwrap_err();
    assert!(matches!(
        err,
        ExpressionError::CapabilityDenied {
            backend: Backend::Path,
            kind: DeniedKind::Type,
            ..
        }
    ));

    engine.allow_type("shop.Order");
    assert_eq!(
        engine.evaluate_with_exception(source.clone(), Value::Null, true),
        Ok(Value::Integer(40))
    );
    assert_eq!(
        engine.evaluate_with_exception(source, Value::Null, false),
        Ok(Value::Integer(40))
    );
}

#[test]
fn private_member_follows_the_access_flag() {
    let engine = engine();
    let root = order_root(100);
    let margin = || ExpressionSource::text("order.margin", Backend::Path);

    assert!(matches!(
        engine.evaluate_with_exception(margin(), root.clone(), true),
        Err(ExpressionError::CapabilityDenied { .. })
    ));

    engine.set_access_flags(AccessFlags {
        allow_private: true,
        ..AccessFlags::default()
    });
    let before = engine.evaluate_with_exception(margin(), root.clone(), true);
    assert_eq!(before, Ok(Value::Integer(25)));

    engine.set_access_flags(AccessFlags::public_only());
    assert!(matches!(
        engine.evaluate_with_exception(margin(), root.clone(), true),
        Err(ExpressionError::CapabilityDenied { .. })
    ));
    assert_eq!(before, Ok(Value::Integer(25)));

    // Unsandboxed evaluation is not gated
    assert_eq!(
        engine.evaluate_with_exception(margin(), root, false),
        Ok(Value::Integer(25))
    );
}

#[test]
fn compiled_backend_enforces_member_rules() {
    let engine = engine();
    let root = order_root(200);
    let compiled = engine
        .compile(
            "order.discount(50)",
            Backend::Compiled,
            true,
            CompileOptions::default(),
        )
        .unwrap();

    assert_eq!(
        engine.evaluate_with_exception(&compiled, root.clone(), false),
        Err(ExpressionError::CapabilityDenied {
            backend: Backend::Compiled,
            kind: DeniedKind::Member(MemberKind::Method),
            target: "shop.Order#discount".to_string(),
        })
    );

    engine.set_method_policy(MemberPolicy::deny_all().allow("shop.Order#*").unwrap());
    assert_eq!(
        engine.evaluate_with_exception(&compiled, root.clone(), false),
        Ok(Value::Integer(100))
    );

    // The path backend does not apply member rules
    engine.set_method_policy(MemberPolicy::deny_all());
    assert_eq!(
        engine.evaluate_with_exception(
            ExpressionSource::text("order.discount(50)", Backend::Path),
            root,
            true
        ),
        Ok(Value::Integer(100))
    );
}

#[test]
fn property_rules_hide_members_from_the_compiled_backend() {
    let engine = engine();
    engine.set_property_policy(MemberPolicy::allow_all().deny("shop.Order#total").unwrap());

    let denied = engine.evaluate_with_exception(
        ExpressionSource::text("order.total", Backend::Compiled),
        order_root(10),
        true,
    );
    assert!(matches!(
        denied,
        Err(ExpressionError::CapabilityDenied {
            kind: DeniedKind::Member(MemberKind::Property),
            ..
        })
    ));
    assert_eq!(
        engine.evaluate_with_exception(
            ExpressionSource::text("order.id", Backend::Compiled),
            order_root(10),
            true,
        ),
        Ok(Value::from("o-10"))
    );
}

#[test]
fn script_backends_see_projected_objects() {
    let engine = engine();
    let root = order_root(80);

    assert_eq!(
        engine.evaluate_with_exception(
            ExpressionSource::text("order.total + 1", Backend::ScriptExpression),
            root.clone(),
            true,
        ),
        Ok(Value::Integer(81))
    );

    // Private members are left out of the sandboxed projection
    assert_eq!(
        engine.evaluate_with_exception(
            ExpressionSource::text("order.margin", Backend::ScriptExpression),
            root.clone(),
            true,
        ),
        Ok(Value::Null)
    );

    assert_eq!(
        engine.evaluate_with_exception(
            ExpressionSource::text("order.margin", Backend::ScriptExpression),
            root,
            false,
        ),
        Ok(Value::Integer(20))
    );
}

#[rstest::rstest]
#[case(Backend::Path)]
#[case(Backend::Compiled)]
fn resolve_config_does_not_read_the_environment_by_default(#[case] backend: Backend) {
    let engine = engine();
    let source = ExpressionSource::text("resolveConfig('${path}')", backend);
    assert_eq!(
        engine.evaluate_with_exception(source, Value::Null, true),
        Ok(Value::from("${path}"))
    );
}

#[test]
fn resolve_config_uses_the_configured_resolver() {
    let resolver = MapConfigResolver::new().with("db.host", "10.0.0.5");
    let engine = ExpressionEngine::builder()
        .config_resolver(Arc::new(resolver))
        .build();
    let source = ExpressionSource::text("resolveConfig('${db.host}:5432')", Backend::Compiled);
    assert_eq!(
        engine.evaluate_with_exception(source, Value::Null, true),
        Ok(Value::from("10.0.0.5:5432"))
    );
}
