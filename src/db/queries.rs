use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::entities::{
    Channel, ChannelType, Message, MessageWithAuthor, Role, Server, User,
};

// ── Servers ────────────────────────────────────────────

/// The installation's single server row (oldest wins if several exist).
pub async fn get_default_server(pool: &PgPool) -> Result<Option<Server>, sqlx::Error> {
    sqlx::query_as::<_, Server>(
        r#"
        SELECT id, name, address, max_clients, created_at
        FROM servers ORDER BY created_at ASC LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await
}

pub async fn create_server(
    pool: &PgPool,
    id: Uuid,
    name: &str,
    address: &str,
    max_clients: i32,
) -> Result<Server, sqlx::Error> {
    sqlx::query_as::<_, Server>(
        r#"
        INSERT INTO servers (id, name, address, max_clients)
        VALUES ($1, $2, $3, $4)
        RETURNING id, name, address, max_clients, created_at
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(address)
    .bind(max_clients)
    .fetch_one(pool)
    .await
}

// ── Users ──────────────────────────────────────────────

/// First join creates the row; later joins refresh the nickname.
pub async fn upsert_user(pool: &PgPool, id: Uuid, nickname: &str) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, username, nickname)
        VALUES ($1, $2, $2)
        ON CONFLICT (id) DO UPDATE SET nickname = $2
        RETURNING id, username, nickname, credential, created_at
        "#,
    )
    .bind(id)
    .bind(nickname)
    .fetch_one(pool)
    .await
}

pub async fn get_user_by_id(pool: &PgPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        SELECT id, username, nickname, credential, created_at
        FROM users WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

// ── Channels ───────────────────────────────────────────

pub async fn get_server_channels(
    pool: &PgPool,
    server_id: Uuid,
) -> Result<Vec<Channel>, sqlx::Error> {
    sqlx::query_as::<_, Channel>(
        r#"
        SELECT id, server_id, name, channel_type, parent_id, position, max_users, created_at
        FROM channels WHERE server_id = $1
        ORDER BY position ASC, id ASC
        "#,
    )
    .bind(server_id)
    .fetch_all(pool)
    .await
}

pub async fn get_channel_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Channel>, sqlx::Error> {
    sqlx::query_as::<_, Channel>(
        r#"
        SELECT id, server_id, name, channel_type, parent_id, position, max_users, created_at
        FROM channels WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Next free position among the siblings of `parent_id` (-1 base, so an
/// empty sibling set yields 0).
pub async fn next_channel_position(
    pool: &PgPool,
    server_id: Uuid,
    parent_id: Option<Uuid>,
) -> Result<i32, sqlx::Error> {
    let row: (i32,) = sqlx::query_as(
        r#"
        SELECT COALESCE(MAX(position), -1) + 1
        FROM channels
        WHERE server_id = $1 AND parent_id IS NOT DISTINCT FROM $2
        "#,
    )
    .bind(server_id)
    .bind(parent_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

pub async fn create_channel(
    pool: &PgPool,
    id: Uuid,
    server_id: Uuid,
    name: &str,
    channel_type: ChannelType,
    parent_id: Option<Uuid>,
    position: i32,
    max_users: Option<i32>,
) -> Result<Channel, sqlx::Error> {
    sqlx::query_as::<_, Channel>(
        r#"
        INSERT INTO channels (id, server_id, name, channel_type, parent_id, position, max_users)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, server_id, name, channel_type, parent_id, position, max_users, created_at
        "#,
    )
    .bind(id)
    .bind(server_id)
    .bind(name)
    .bind(channel_type)
    .bind(parent_id)
    .bind(position)
    .bind(max_users)
    .fetch_one(pool)
    .await
}

pub async fn update_channel(
    pool: &PgPool,
    id: Uuid,
    name: Option<&str>,
    max_users: Option<i32>,
) -> Result<Channel, sqlx::Error> {
    sqlx::query_as::<_, Channel>(
        r#"
        UPDATE channels
        SET name = COALESCE($2, name),
            max_users = COALESCE($3, max_users)
        WHERE id = $1
        RETURNING id, server_id, name, channel_type, parent_id, position, max_users, created_at
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(max_users)
    .fetch_one(pool)
    .await
}

pub async fn move_channel(
    pool: &PgPool,
    id: Uuid,
    parent_id: Option<Uuid>,
    position: i32,
) -> Result<Channel, sqlx::Error> {
    sqlx::query_as::<_, Channel>(
        r#"
        UPDATE channels
        SET parent_id = $2, position = $3
        WHERE id = $1
        RETURNING id, server_id, name, channel_type, parent_id, position, max_users, created_at
        "#,
    )
    .bind(id)
    .bind(parent_id)
    .bind(position)
    .fetch_one(pool)
    .await
}

/// Messages cascade away; children are promoted to roots by the
/// ON DELETE SET NULL constraint on `parent_id`.
pub async fn delete_channel(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM channels WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ── Messages ───────────────────────────────────────────

pub async fn create_message(
    pool: &PgPool,
    id: Uuid,
    channel_id: Uuid,
    user_id: Uuid,
    content: &str,
) -> Result<Message, sqlx::Error> {
    sqlx::query_as::<_, Message>(
        r#"
        INSERT INTO messages (id, channel_id, user_id, content)
        VALUES ($1, $2, $3, $4)
        RETURNING id, channel_id, user_id, content, created_at
        "#,
    )
    .bind(id)
    .bind(channel_id)
    .bind(user_id)
    .bind(content)
    .fetch_one(pool)
    .await
}

/// Newest-first page of messages older than `before` (or the newest page
/// when no cursor is given). Callers reverse into chronological order.
pub async fn get_messages_before(
    pool: &PgPool,
    channel_id: Uuid,
    before: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<MessageWithAuthor>, sqlx::Error> {
    match before {
        Some(cursor) => {
            sqlx::query_as::<_, MessageWithAuthor>(
                r#"
                SELECT m.id, m.channel_id, m.user_id, m.content, m.created_at, u.nickname
                FROM messages m
                JOIN users u ON u.id = m.user_id
                WHERE m.channel_id = $1 AND m.created_at < $2
                ORDER BY m.created_at DESC
                LIMIT $3
                "#,
            )
            .bind(channel_id)
            .bind(cursor)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, MessageWithAuthor>(
                r#"
                SELECT m.id, m.channel_id, m.user_id, m.content, m.created_at, u.nickname
                FROM messages m
                JOIN users u ON u.id = m.user_id
                WHERE m.channel_id = $1
                ORDER BY m.created_at DESC
                LIMIT $2
                "#,
            )
            .bind(channel_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}

// ── Roles ──────────────────────────────────────────────

pub async fn get_server_roles(pool: &PgPool, server_id: Uuid) -> Result<Vec<Role>, sqlx::Error> {
    sqlx::query_as::<_, Role>(
        r#"
        SELECT id, server_id, name, permissions, power_level, color, created_at
        FROM roles WHERE server_id = $1
        ORDER BY power_level DESC, created_at ASC
        "#,
    )
    .bind(server_id)
    .fetch_all(pool)
    .await
}

/// The role every joining user is bound to: lowest power level wins.
pub async fn get_default_role(pool: &PgPool, server_id: Uuid) -> Result<Option<Role>, sqlx::Error> {
    sqlx::query_as::<_, Role>(
        r#"
        SELECT id, server_id, name, permissions, power_level, color, created_at
        FROM roles WHERE server_id = $1
        ORDER BY power_level ASC, created_at ASC
        LIMIT 1
        "#,
    )
    .bind(server_id)
    .fetch_optional(pool)
    .await
}

/// Highest-powered role carrying any of the given bits (used to auto-bind
/// the configured admin installation).
pub async fn get_role_with_bits(
    pool: &PgPool,
    server_id: Uuid,
    bits: i64,
) -> Result<Option<Role>, sqlx::Error> {
    sqlx::query_as::<_, Role>(
        r#"
        SELECT id, server_id, name, permissions, power_level, color, created_at
        FROM roles WHERE server_id = $1 AND (permissions & $2) <> 0
        ORDER BY power_level DESC, created_at ASC
        LIMIT 1
        "#,
    )
    .bind(server_id)
    .bind(bits)
    .fetch_optional(pool)
    .await
}

pub async fn get_user_roles(
    pool: &PgPool,
    server_id: Uuid,
    user_id: Uuid,
) -> Result<Vec<Role>, sqlx::Error> {
    sqlx::query_as::<_, Role>(
        r#"
        SELECT r.id, r.server_id, r.name, r.permissions, r.power_level, r.color, r.created_at
        FROM roles r
        JOIN role_assignments ra ON ra.role_id = r.id
        WHERE ra.user_id = $1 AND r.server_id = $2
        ORDER BY r.power_level DESC
        "#,
    )
    .bind(user_id)
    .bind(server_id)
    .fetch_all(pool)
    .await
}

pub async fn create_role(
    pool: &PgPool,
    id: Uuid,
    server_id: Uuid,
    name: &str,
    permissions: i64,
    power_level: i32,
    color: Option<&str>,
) -> Result<Role, sqlx::Error> {
    sqlx::query_as::<_, Role>(
        r#"
        INSERT INTO roles (id, server_id, name, permissions, power_level, color)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, server_id, name, permissions, power_level, color, created_at
        "#,
    )
    .bind(id)
    .bind(server_id)
    .bind(name)
    .bind(permissions)
    .bind(power_level)
    .bind(color)
    .fetch_one(pool)
    .await
}

pub async fn get_role_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Role>, sqlx::Error> {
    sqlx::query_as::<_, Role>(
        r#"
        SELECT id, server_id, name, permissions, power_level, color, created_at
        FROM roles WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

// ── Role assignments ───────────────────────────────────

pub async fn assign_role(pool: &PgPool, user_id: Uuid, role_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO role_assignments (user_id, role_id)
        VALUES ($1, $2)
        ON CONFLICT (user_id, role_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(role_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn remove_role(pool: &PgPool, user_id: Uuid, role_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM role_assignments WHERE user_id = $1 AND role_id = $2")
        .bind(user_id)
        .bind(role_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Every (user, role) binding on a server, ordered so each user's rows are
/// contiguous (nicknames are not unique, so the user id breaks ties). The
/// admin service folds these into per-user role lists.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoleBindingRow {
    pub user_id: Uuid,
    pub username: String,
    pub nickname: String,
    pub user_created_at: DateTime<Utc>,
    #[sqlx(flatten)]
    pub role: Role,
}

pub async fn get_role_bindings(
    pool: &PgPool,
    server_id: Uuid,
) -> Result<Vec<RoleBindingRow>, sqlx::Error> {
    sqlx::query_as::<_, RoleBindingRow>(
        r#"
        SELECT u.id AS user_id, u.username, u.nickname, u.created_at AS user_created_at,
               r.id, r.server_id, r.name, r.permissions, r.power_level, r.color, r.created_at
        FROM role_assignments ra
        JOIN users u ON u.id = ra.user_id
        JOIN roles r ON r.id = ra.role_id
        WHERE r.server_id = $1
        ORDER BY u.nickname ASC, u.id ASC, r.power_level DESC
        "#,
    )
    .bind(server_id)
    .fetch_all(pool)
    .await
}
