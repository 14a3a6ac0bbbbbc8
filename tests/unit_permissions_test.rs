use olivinedb::core::OlivineError;
use olivinedb::core::permissions::{
    ADMIN_ROLE, FieldRule, Permission, PermissionAction, PermissionPolicy, PermissionRule,
    Principal,
};
use serde_json::json;

fn principal(roles: &[&str]) -> Principal {
    Principal::normalized(
        "alice".into(),
        None,
        roles.iter().map(|r| r.to_string()).collect(),
        serde_json::Map::new(),
    )
}

#[tokio::test]
async fn test_missing_roles_normalize_to_user() {
    let p = principal(&[]);
    assert_eq!(p.role_signature(), "USER");
    assert_eq!(p.user_id, "alice");
}

#[tokio::test]
async fn test_role_signature_is_sorted() {
    let p = principal(&["writer", "auditor"]);
    assert_eq!(p.role_signature(), "auditor,writer");
}

#[tokio::test]
async fn test_allowlist_rejects_other_maps() {
    let policy = PermissionPolicy::new(
        Vec::new(),
        Vec::new(),
        Some(vec!["tasks".into()]),
        true,
        true,
    );
    let p = principal(&[]);
    assert!(policy.check(Some(&p), "tasks", Permission::READ).is_ok());
    assert!(matches!(
        policy.check(Some(&p), "users", Permission::READ),
        Err(OlivineError::MapNotAllowed(_))
    ));
}

#[tokio::test]
async fn test_mutations_disabled_blocks_writes_only() {
    let policy = PermissionPolicy::new(Vec::new(), Vec::new(), None, false, true);
    let p = principal(&[]);
    assert!(policy.check(Some(&p), "tasks", Permission::READ).is_ok());
    assert!(matches!(
        policy.check(Some(&p), "tasks", Permission::PUT),
        Err(OlivineError::MutationsDisabled)
    ));
}

#[tokio::test]
async fn test_rules_gate_non_admin_roles() {
    let policy = PermissionPolicy::new(
        vec![PermissionRule {
            role: "reader".into(),
            maps: "tasks*".into(),
            actions: vec![PermissionAction::Read],
        }],
        Vec::new(),
        None,
        true,
        true,
    );
    let reader = principal(&["reader"]);
    assert!(policy.check(Some(&reader), "tasks", Permission::READ).is_ok());
    assert!(matches!(
        policy.check(Some(&reader), "tasks", Permission::PUT),
        Err(OlivineError::AccessDenied)
    ));
    let admin = principal(&[ADMIN_ROLE]);
    assert!(policy.check(Some(&admin), "tasks", Permission::PUT).is_ok());
}

#[tokio::test]
async fn test_field_filter_strips_denied_fields() {
    let policy = PermissionPolicy::new(
        Vec::new(),
        vec![FieldRule {
            role: "USER".into(),
            maps: "*".into(),
            denied_fields: vec!["salary".into()],
        }],
        None,
        true,
        true,
    );
    let p = principal(&[]);
    let filtered = policy.filter_value(Some(&p), "people", &json!({"name": "a", "salary": 100}));
    assert_eq!(filtered, json!({"name": "a"}));
}
