use axum::http::StatusCode;
use uuid::Uuid;

use crate::models::{api_error, ApiError, Participant, Role};
use crate::services::auth_service::{AuthError, Identity};

const ADMIN_PRPL: &str = "r/Tmi-Admin";

pub fn is_admin(prpls: &[String]) -> bool {
    prpls.iter().any(|p| p == ADMIN_PRPL)
}

/// Highest role granted on a threat model, admins are owners everywhere
pub fn role_for_threat_model(prpls: &[String], threat_model_id: Uuid) -> Option<Role> {
    if is_admin(prpls) {
        return Some(Role::Owner);
    }

    let prefix = format!("tm/{}/", threat_model_id);
    prpls
        .iter()
        .filter_map(|p| p.strip_prefix(&prefix))
        .filter_map(Role::parse)
        .max()
}

pub fn ensure_threat_model_role(prpls: &[String], threat_model_id: Uuid) -> Result<Role, ApiError> {
    role_for_threat_model(prpls, threat_model_id).ok_or_else(|| {
        api_error(
            StatusCode::FORBIDDEN,
            format!("You don't have sufficient permissions to collaborate on threat model '{}'", threat_model_id),
        )
    })
}

pub fn ensure_admin(prpls: &[String]) -> Result<String, ApiError> {
    if is_admin(prpls) {
        return Ok(ADMIN_PRPL.to_string());
    }
    Err(api_error(StatusCode::FORBIDDEN, "Admin access required"))
}

/// Decide the role of a socket that wants to attach to a session.
///
/// The caller must already sit in the REST roster; the roster role is
/// authoritative for the lifetime of the connection.
pub fn authorize_connection(identity: &Identity, roster: &[Participant]) -> Result<Role, AuthError> {
    roster
        .iter()
        .find(|p| p.user.user_id == identity.user.user_id)
        .map(|p| p.role)
        .ok_or_else(|| AuthError::NotInRoster(identity.user.user_id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserRef;
    use chrono::Utc;

    fn prpls(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn highest_grant_wins() {
        let tm = Uuid::new_v4();
        let granted = prpls(&["u/bob", &format!("tm/{}/reader", tm), &format!("tm/{}/writer", tm)]);
        assert_eq!(role_for_threat_model(&granted, tm), Some(Role::Writer));
        assert_eq!(role_for_threat_model(&granted, Uuid::new_v4()), None);
    }

    #[test]
    fn admin_owns_every_threat_model() {
        assert_eq!(role_for_threat_model(&prpls(&["r/Tmi-Admin"]), Uuid::new_v4()), Some(Role::Owner));
        assert!(ensure_admin(&prpls(&["r/Tmi-Admin"])).is_ok());
        assert_eq!(ensure_admin(&prpls(&["u/bob"])).unwrap_err().0, StatusCode::FORBIDDEN);
    }

    #[test]
    fn unknown_role_suffix_is_ignored() {
        let tm = Uuid::new_v4();
        let granted = prpls(&[&format!("tm/{}/superuser", tm)]);
        assert!(ensure_threat_model_role(&granted, tm).is_err());
    }

    #[test]
    fn socket_requires_roster_entry() {
        let now = Utc::now();
        let roster = vec![Participant {
            user: UserRef::new("alice"),
            role: Role::Writer,
            joined_at: now,
            last_activity: now,
        }];
        let alice = Identity { user: UserRef::new("alice"), prpls: vec![] };
        let mallory = Identity { user: UserRef::new("mallory"), prpls: vec![] };

        assert_eq!(authorize_connection(&alice, &roster), Ok(Role::Writer));
        assert_eq!(
            authorize_connection(&mallory, &roster),
            Err(AuthError::NotInRoster("mallory".to_string()))
        );
    }
}
