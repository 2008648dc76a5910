//! Scope-based authorization for bus calls
//!
//! Every call carries `{scopes, user}` metadata and every registration carries
//! the same pair as its filter. [`authorize`] decides whether the call may
//! reach the registration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::module::bus::error::BusError;

/// Scope held by the host itself; required to reach lifecycle topics
pub const SYSTEM_SCOPE: &str = "modhost:system";

/// Set of capability tokens
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet {
    scopes: BTreeSet<String>,
}

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, scope: impl Into<String>) {
        self.scopes.insert(scope.into());
    }

    pub fn has(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Check if every scope in `required` is held
    pub fn has_all(&self, required: &ScopeSet) -> bool {
        required.scopes.is_subset(&self.scopes)
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            scopes: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// `{scopes, user}` pair carried by calls and attached to registrations
///
/// `scopes: None` means "unrestricted" on a call and "open" on a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessScope {
    #[serde(default)]
    pub scopes: Option<ScopeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl AccessScope {
    /// No scopes and no user
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn scoped<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: Some(scopes.into_iter().collect()),
            user: None,
        }
    }

    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            scopes: None,
            user: Some(user.into()),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Metadata the host uses for its own lifecycle traffic
    pub fn system() -> Self {
        Self::scoped([SYSTEM_SCOPE])
    }

    /// Cap metadata claimed by a worker at the scopes its link was granted
    ///
    /// The system scope never survives; only the host holds it.
    pub fn confine(mut self, granted: &ScopeSet) -> Self {
        if let Some(claimed) = self.scopes.take() {
            let held: ScopeSet = claimed
                .iter()
                .filter(|scope| *scope != SYSTEM_SCOPE && granted.has(scope))
                .collect();
            if held.len() != claimed.len() {
                debug!("Dropped scopes not granted to the caller");
            }
            self.scopes = Some(held);
        }
        self
    }

    pub(crate) fn validate(&self) -> Result<(), BusError> {
        if let Some(scopes) = &self.scopes {
            if scopes.iter().any(|s| s.trim().is_empty()) {
                return Err(BusError::validation("scope tokens must not be empty"));
            }
        }
        if matches!(&self.user, Some(user) if user.trim().is_empty()) {
            return Err(BusError::validation("user must not be empty"));
        }
        Ok(())
    }
}

/// Decides whether a call may reach a registration
///
/// 1. Both sides name a user: match iff the users are equal.
/// 2. Open registration: match unless the call names a user and the
///    registration does not.
/// 3. Unscoped caller against a scoped registration: never.
/// 4. Otherwise the caller must hold every scope the registration requires.
pub fn authorize(call: &AccessScope, registration: &AccessScope) -> bool {
    if let (Some(caller), Some(owner)) = (&call.user, &registration.user) {
        return caller == owner;
    }

    let Some(required) = &registration.scopes else {
        return !(call.user.is_some() && registration.user.is_none());
    };

    let Some(held) = &call.scopes else {
        return false;
    };

    held.has_all(required)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_registration() {
        let open = AccessScope::unrestricted();
        assert!(authorize(&AccessScope::unrestricted(), &open));
        assert!(authorize(&AccessScope::scoped(["a"]), &open));
        assert!(!authorize(&AccessScope::for_user("alice"), &open));
    }

    #[test]
    fn test_scoped_registration() {
        let reg = AccessScope::scoped(["read", "write"]);
        assert!(!authorize(&AccessScope::unrestricted(), &reg));
        assert!(authorize(&AccessScope::scoped(["read", "write", "admin"]), &reg));
        assert!(!authorize(&AccessScope::scoped(["read"]), &reg));
    }

    #[test]
    fn test_empty_required_scopes_need_a_scoped_caller() {
        let reg = AccessScope::scoped(Vec::<String>::new());
        assert!(authorize(&AccessScope::scoped(Vec::<String>::new()), &reg));
        assert!(!authorize(&AccessScope::unrestricted(), &reg));
    }

    #[test]
    fn test_user_identity_bypasses_scopes() {
        let reg = AccessScope::scoped(["admin"]).with_user("alice");
        assert!(authorize(&AccessScope::for_user("alice"), &reg));
        assert!(!authorize(&AccessScope::scoped(["admin"]).with_user("bob"), &reg));
        // No caller user: falls through to the scope check
        assert!(authorize(&AccessScope::scoped(["admin"]), &reg));
        assert!(!authorize(&AccessScope::unrestricted(), &reg));
    }

    #[test]
    fn test_confine_drops_ungranted_and_system_scopes() {
        let granted: ScopeSet = ["read", SYSTEM_SCOPE].into_iter().collect();
        let claimed = AccessScope::scoped(["read", "write", SYSTEM_SCOPE]).with_user("alice");
        let confined = claimed.confine(&granted);
        assert_eq!(confined.scopes, Some(["read"].into_iter().collect()));
        assert_eq!(confined.user.as_deref(), Some("alice"));

        // An unscoped call stays unscoped
        assert_eq!(
            AccessScope::unrestricted().confine(&granted),
            AccessScope::unrestricted()
        );
        assert!(!authorize(
            &AccessScope::system().confine(&granted),
            &AccessScope::system()
        ));
    }

    #[test]
    fn test_validation() {
        assert!(AccessScope::scoped([""]).validate().is_err());
        assert!(AccessScope::for_user(" ").validate().is_err());
        assert!(AccessScope::system().validate().is_ok());
    }
}
