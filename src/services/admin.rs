use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries::{self, RoleBindingRow};
use crate::error::GatewayError;
use crate::types::entities::{RoleInfo, UserWithRoles};
use crate::types::events::RoleAction;

/// Every user holding at least one role on the server, with their roles,
/// ordered by nickname.
pub async fn list_users(pool: &PgPool, server_id: Uuid) -> Result<Vec<UserWithRoles>, GatewayError> {
    let bindings = queries::get_role_bindings(pool, server_id).await?;
    Ok(fold_bindings(bindings))
}

/// Roles on the server, ordered by descending power level.
pub async fn list_roles(pool: &PgPool, server_id: Uuid) -> Result<Vec<RoleInfo>, GatewayError> {
    let roles = queries::get_server_roles(pool, server_id).await?;
    Ok(roles.into_iter().map(RoleInfo::from).collect())
}

/// Add or remove a role binding. Both directions are idempotent; the server
/// does not stop a client from removing its own admin role.
pub async fn assign_role(
    pool: &PgPool,
    server_id: Uuid,
    user_id: Uuid,
    role_id: Uuid,
    action: RoleAction,
) -> Result<(), GatewayError> {
    let role = queries::get_role_by_id(pool, role_id)
        .await?
        .ok_or(GatewayError::NotFound("Role"))?;
    if role.server_id != server_id {
        return Err(GatewayError::NotFound("Role"));
    }

    queries::get_user_by_id(pool, user_id)
        .await?
        .ok_or(GatewayError::NotFound("User"))?;

    match action {
        RoleAction::Add => queries::assign_role(pool, user_id, role_id).await?,
        RoleAction::Remove => queries::remove_role(pool, user_id, role_id).await?,
    }

    Ok(())
}

/// Collapse the flat (user, role) rows into one entry per user. Relies on
/// the query keeping each user's rows contiguous (nickname, then user id);
/// row order is preserved, so users stay sorted by nickname and each user's
/// roles by power level.
fn fold_bindings(bindings: Vec<RoleBindingRow>) -> Vec<UserWithRoles> {
    let mut users: Vec<UserWithRoles> = Vec::new();
    for binding in bindings {
        let role = RoleInfo::from(binding.role);
        match users.last_mut() {
            Some(user) if user.id == binding.user_id => user.roles.push(role),
            _ => users.push(UserWithRoles {
                id: binding.user_id,
                username: binding.username,
                nickname: binding.nickname,
                created_at: binding.user_created_at,
                roles: vec![role],
            }),
        }
    }
    users
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::entities::Role;
    use chrono::Utc;

    fn make_binding(user: u8, nickname: &str, role_name: &str) -> RoleBindingRow {
        RoleBindingRow {
            user_id: Uuid::from_bytes([user; 16]),
            username: nickname.to_string(),
            nickname: nickname.to_string(),
            user_created_at: Utc::now(),
            role: Role {
                id: Uuid::now_v7(),
                server_id: Uuid::from_bytes([0xff; 16]),
                name: role_name.to_string(),
                permissions: 1,
                power_level: 0,
                color: None,
                created_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_consecutive_rows_fold_into_one_user() {
        let rows = vec![
            make_binding(1, "ada", "Admin"),
            make_binding(1, "ada", "Member"),
            make_binding(2, "brian", "Member"),
        ];

        let users = fold_bindings(rows);
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].nickname, "ada");
        assert_eq!(users[0].roles.len(), 2);
        assert_eq!(users[1].roles.len(), 1);
    }

    #[test]
    fn test_shared_nickname_users_stay_separate_and_whole() {
        // Two different users named "alex"; the query orders by user id
        // within the nickname, so each user's rows arrive contiguously
        let rows = vec![
            make_binding(1, "alex", "Admin"),
            make_binding(1, "alex", "Member"),
            make_binding(2, "alex", "Mod"),
        ];

        let users = fold_bindings(rows);
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id, Uuid::from_bytes([1; 16]));
        assert_eq!(users[0].roles.len(), 2);
        assert_eq!(users[1].id, Uuid::from_bytes([2; 16]));
        assert_eq!(users[1].roles.len(), 1);
    }

    #[test]
    fn test_role_permissions_serialize_as_decimal_strings() {
        let users = fold_bindings(vec![make_binding(1, "ada", "Member")]);
        assert_eq!(users[0].roles[0].permissions, "1");
    }
}
