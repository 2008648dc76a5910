//! Authorization decisions between call metadata and registration filters

use modhost::module::bus::{authorize, AccessScope, ScopeSet};
use proptest::prelude::*;

fn s(scopes: &[&str]) -> Option<ScopeSet> {
    Some(scopes.iter().copied().collect())
}

fn meta(scopes: Option<ScopeSet>, user: Option<&str>) -> AccessScope {
    AccessScope {
        scopes,
        user: user.map(str::to_string),
    }
}

#[test]
fn test_decision_matrix() {
    let cases: &[(AccessScope, AccessScope, bool)] = &[
        // open registration
        (meta(None, None), meta(None, None), true),
        (meta(s(&["a"]), None), meta(None, None), true),
        (meta(s(&[]), None), meta(None, None), true),
        (meta(None, Some("alice")), meta(None, None), false),
        (meta(s(&["a"]), Some("alice")), meta(None, None), false),
        // user-owned registration
        (meta(None, Some("alice")), meta(None, Some("alice")), true),
        (meta(None, Some("bob")), meta(None, Some("alice")), false),
        (meta(None, None), meta(None, Some("alice")), true),
        (meta(s(&["x"]), Some("alice")), meta(s(&["y"]), Some("alice")), true),
        (meta(s(&["y"]), Some("bob")), meta(s(&["y"]), Some("alice")), false),
        // scoped registration
        (meta(None, None), meta(s(&["a"]), None), false),
        (meta(None, None), meta(s(&[]), None), false),
        (meta(s(&[]), None), meta(s(&[]), None), true),
        (meta(s(&["a"]), None), meta(s(&["a"]), None), true),
        (meta(s(&["a", "b"]), None), meta(s(&["a"]), None), true),
        (meta(s(&["b"]), None), meta(s(&["a"]), None), false),
        (meta(s(&["a"]), None), meta(s(&["a", "b"]), None), false),
        (meta(s(&["a"]), Some("alice")), meta(s(&["a"]), None), true),
    ];

    for (call, registration, expected) in cases {
        assert_eq!(
            authorize(call, registration),
            *expected,
            "call {:?} against registration {:?}",
            call,
            registration
        );
    }
}

fn scope_set() -> impl Strategy<Value = ScopeSet> {
    prop::collection::btree_set("[a-e]", 0..4).prop_map(|s| s.into_iter().collect())
}

fn user() -> impl Strategy<Value = String> {
    "[a-c]".prop_map(|s| format!("user-{}", s))
}

proptest! {
    #[test]
    fn prop_matching_users_decide_alone(
        call_scopes in prop::option::of(scope_set()),
        reg_scopes in prop::option::of(scope_set()),
        caller in user(),
        owner in user(),
    ) {
        let call = AccessScope { scopes: call_scopes, user: Some(caller.clone()) };
        let registration = AccessScope { scopes: reg_scopes, user: Some(owner.clone()) };
        prop_assert_eq!(authorize(&call, &registration), caller == owner);
    }

    #[test]
    fn prop_scopes_decide_by_subset(held in scope_set(), required in scope_set()) {
        let call = AccessScope { scopes: Some(held.clone()), user: None };
        let registration = AccessScope { scopes: Some(required.clone()), user: None };
        prop_assert_eq!(authorize(&call, &registration), held.has_all(&required));
    }

    #[test]
    fn prop_more_scopes_never_lose_access(
        held in scope_set(),
        extra in scope_set(),
        required in scope_set(),
    ) {
        let registration = AccessScope { scopes: Some(required), user: None };
        let call = AccessScope { scopes: Some(held.clone()), user: None };
        let wider: ScopeSet = held.iter().chain(extra.iter()).map(str::to_string).collect();
        let wider = AccessScope { scopes: Some(wider), user: None };
        if authorize(&call, &registration) {
            prop_assert!(authorize(&wider, &registration));
        }
    }

    #[test]
    fn prop_unscoped_callers_never_reach_scoped_registrations(
        required in scope_set(),
        owner in prop::option::of(user()),
    ) {
        let registration = AccessScope { scopes: Some(required), user: owner };
        prop_assert!(!authorize(&AccessScope::unrestricted(), &registration));
    }
}
