//! User identity supplied by the external auth service

use serde::{Deserialize, Serialize};

/// Role attached to a bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Moderator,
    Admin,
}

impl Role {
    /// Whether this role may attach to sessions owned by other users.
    pub fn can_impersonate(&self) -> bool {
        matches!(self, Role::Admin | Role::Moderator)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Moderator => write!(f, "moderator"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

/// Authenticated principal for a connection or request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub role: Role,
}

impl AuthUser {
    /// Ownership check used by the broker and the HTTP handlers.
    pub fn can_access_session(&self, owner_id: i64) -> bool {
        self.user_id == owner_id || self.role.can_impersonate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_access_rules() {
        let plain = AuthUser {
            user_id: 1,
            role: Role::User,
        };
        assert!(plain.can_access_session(1));
        assert!(!plain.can_access_session(2));

        let admin = AuthUser {
            user_id: 1,
            role: Role::Admin,
        };
        assert!(admin.can_access_session(2));

        let moderator = AuthUser {
            user_id: 1,
            role: Role::Moderator,
        };
        assert!(moderator.can_access_session(2));
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [Role::User, Role::Moderator, Role::Admin] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert!("root".parse::<Role>().is_err());
    }
}
