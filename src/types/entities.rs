use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::permissions::Permissions;

// ── Servers ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub max_clients: i32,
    pub created_at: DateTime<Utc>,
}

// ── Channels ───────────────────────────────────────────

/// Any channel may hold child channels regardless of type; voice channels
/// double as grouping nodes in the tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "channel_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Text,
    Voice,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Channel {
    pub id: Uuid,
    pub server_id: Uuid,
    pub name: String,
    pub channel_type: ChannelType,
    pub parent_id: Option<Uuid>,
    pub position: i32,
    pub max_users: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// One node of the materialized channel forest sent to clients.
/// `occupants` is filled from presence at emission time, not by the builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelNode {
    pub id: Uuid,
    pub name: String,
    pub channel_type: ChannelType,
    pub parent_id: Option<Uuid>,
    pub position: i32,
    pub max_users: Option<i32>,
    pub children: Vec<ChannelNode>,
    pub occupants: Vec<ChannelOccupant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelOccupant {
    pub user_id: Uuid,
    pub nickname: String,
}

// ── Users ──────────────────────────────────────────────

/// `id` is the client's persistent installation identifier, not a
/// server-allocated key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub nickname: String,
    #[serde(skip_serializing)]
    pub credential: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Roles ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: Uuid,
    pub server_id: Uuid,
    pub name: String,
    pub permissions: i64,
    pub power_level: i32,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Role {
    pub fn permissions(&self) -> Permissions {
        Permissions::from_bits_truncate(self.permissions as u64)
    }
}

/// Wire view of a role. `permissions` is a decimal string so wide masks
/// survive JSON numeric precision limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleInfo {
    pub id: Uuid,
    pub server_id: Uuid,
    pub name: String,
    pub permissions: String,
    pub power_level: i32,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Role> for RoleInfo {
    fn from(r: Role) -> Self {
        let permissions = r.permissions().as_decimal();
        Self {
            id: r.id,
            server_id: r.server_id,
            name: r.name,
            permissions,
            power_level: r.power_level,
            color: r.color,
            created_at: r.created_at,
        }
    }
}

/// A user together with every role they hold on a server (admin listing).
#[derive(Debug, Clone, Serialize)]
pub struct UserWithRoles {
    pub id: Uuid,
    pub username: String,
    pub nickname: String,
    pub created_at: DateTime<Utc>,
    pub roles: Vec<RoleInfo>,
}

// ── Messages ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Message joined with the author's nickname for display.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MessageWithAuthor {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub nickname: String,
}

// ── Presence ───────────────────────────────────────────

/// Volatile record of one online user: which server they are on, which
/// channel they occupy (if any), and the nickname to display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub channel_id: Option<Uuid>,
    pub nickname: String,
}
