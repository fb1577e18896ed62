use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::error::GatewayError;
use crate::types::entities::Role;
use crate::types::permissions::Permissions;

/// Effective permissions for a user on a server: the bitwise OR of every
/// role bound to them there.
pub async fn compute_permissions(
    pool: &PgPool,
    server_id: Uuid,
    user_id: Uuid,
) -> Result<Permissions, sqlx::Error> {
    let roles = queries::get_user_roles(pool, server_id, user_id).await?;
    Ok(effective_mask(&roles))
}

/// Check a single flag, honoring the ADMIN short-circuit.
pub async fn has_permission(
    pool: &PgPool,
    server_id: Uuid,
    user_id: Uuid,
    flag: Permissions,
) -> Result<bool, sqlx::Error> {
    let mask = compute_permissions(pool, server_id, user_id).await?;
    Ok(mask.has(flag))
}

/// Check and reject with PermissionDenied in one step (the common handler
/// prologue).
pub async fn require_permission(
    pool: &PgPool,
    server_id: Uuid,
    user_id: Uuid,
    flag: Permissions,
) -> Result<(), GatewayError> {
    if has_permission(pool, server_id, user_id, flag).await? {
        Ok(())
    } else {
        Err(GatewayError::PermissionDenied)
    }
}

fn effective_mask(roles: &[Role]) -> Permissions {
    roles
        .iter()
        .fold(Permissions::empty(), |mask, role| mask | role.permissions())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_role(permissions: u64) -> Role {
        Role {
            id: Uuid::now_v7(),
            server_id: Uuid::now_v7(),
            name: "test".into(),
            permissions: permissions as i64,
            power_level: 0,
            color: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_mask_is_or_of_role_permissions() {
        let roles = vec![
            make_role(Permissions::CONNECT.bits()),
            make_role((Permissions::SPEAK | Permissions::SEND_MESSAGES).bits()),
        ];
        let mask = effective_mask(&roles);
        assert!(mask.has(Permissions::CONNECT));
        assert!(mask.has(Permissions::SPEAK));
        assert!(mask.has(Permissions::SEND_MESSAGES));
        assert!(!mask.has(Permissions::MANAGE_CHANNELS));
    }

    #[test]
    fn test_no_roles_means_no_permissions() {
        let mask = effective_mask(&[]);
        assert!(!mask.has(Permissions::CONNECT));
    }

    #[test]
    fn test_admin_role_passes_everything() {
        let roles = vec![make_role(Permissions::ADMIN.bits())];
        let mask = effective_mask(&roles);
        assert!(mask.has(Permissions::MANAGE_ROLES));
        assert!(mask.has(Permissions::BAN_USER));
        assert!(mask.has(Permissions::KICK_USER));
    }
}
