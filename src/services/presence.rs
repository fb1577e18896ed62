use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::RedisResult;
use uuid::Uuid;

use crate::types::entities::PresenceEntry;

/// Presence records expire after an hour unless refreshed by channel
/// activity; a dead server restart therefore clears itself.
const PRESENCE_TTL_SECS: i64 = 3600;

/// Volatile membership tracking in Redis: one set per server, one set per
/// channel, one metadata hash per user. Multi-key updates go through
/// MULTI/EXEC pipelines so readers never observe a half-applied move.
#[derive(Clone)]
pub struct PresenceStore {
    conn: ConnectionManager,
}

fn server_key(server_id: Uuid) -> String {
    format!("presence:server:{server_id}")
}

fn channel_key(channel_id: Uuid) -> String {
    format!("presence:channel:{channel_id}")
}

fn user_key(user_id: Uuid) -> String {
    format!("presence:user:{user_id}")
}

impl PresenceStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Register a user as online on a server (not yet in any channel).
    pub async fn join_server(
        &self,
        user_id: Uuid,
        server_id: Uuid,
        nickname: &str,
    ) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(server_key(server_id))
            .arg(user_id.to_string())
            .ignore()
            .cmd("HSET")
            .arg(user_key(user_id))
            .arg("server_id")
            .arg(server_id.to_string())
            .arg("channel_id")
            .arg("")
            .arg("nickname")
            .arg(nickname)
            .ignore()
            .cmd("EXPIRE")
            .arg(user_key(user_id))
            .arg(PRESENCE_TTL_SECS)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
    }

    /// Move a user into a channel, leaving whatever channel they were in.
    /// Returns the channel that was left, if any.
    pub async fn join_channel(&self, user_id: Uuid, channel_id: Uuid) -> RedisResult<Option<Uuid>> {
        let mut conn = self.conn.clone();
        let previous = self.current_channel(user_id).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(prev) = previous {
            pipe.cmd("SREM")
                .arg(channel_key(prev))
                .arg(user_id.to_string())
                .ignore();
        }
        pipe.cmd("SADD")
            .arg(channel_key(channel_id))
            .arg(user_id.to_string())
            .ignore()
            .cmd("HSET")
            .arg(user_key(user_id))
            .arg("channel_id")
            .arg(channel_id.to_string())
            .ignore()
            .cmd("EXPIRE")
            .arg(user_key(user_id))
            .arg(PRESENCE_TTL_SECS)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(previous)
    }

    /// Drop the user's channel membership but keep them on the server.
    pub async fn leave_channel(&self, user_id: Uuid) -> RedisResult<Option<Uuid>> {
        let mut conn = self.conn.clone();
        let previous = self.current_channel(user_id).await?;

        let Some(prev) = previous else {
            return Ok(None);
        };

        redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(channel_key(prev))
            .arg(user_id.to_string())
            .ignore()
            .cmd("HSET")
            .arg(user_key(user_id))
            .arg("channel_id")
            .arg("")
            .ignore()
            .cmd("EXPIRE")
            .arg(user_key(user_id))
            .arg(PRESENCE_TTL_SECS)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(Some(prev))
    }

    /// Remove the user from the server, their channel, and delete the
    /// metadata hash in one atomic step.
    pub async fn leave_server(&self, user_id: Uuid, server_id: Uuid) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        let previous = self.current_channel(user_id).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(prev) = previous {
            pipe.cmd("SREM")
                .arg(channel_key(prev))
                .arg(user_id.to_string())
                .ignore();
        }
        pipe.cmd("SREM")
            .arg(server_key(server_id))
            .arg(user_id.to_string())
            .ignore()
            .cmd("DEL")
            .arg(user_key(user_id))
            .ignore()
            .query_async::<()>(&mut conn)
            .await
    }

    pub async fn current_channel(&self, user_id: Uuid) -> RedisResult<Option<Uuid>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(user_key(user_id))
            .arg("channel_id")
            .query_async(&mut conn)
            .await?;

        Ok(raw.filter(|s| !s.is_empty()).and_then(|s| s.parse().ok()))
    }

    pub async fn server_user_count(&self, server_id: Uuid) -> RedisResult<i64> {
        let mut conn = self.conn.clone();
        redis::cmd("SCARD")
            .arg(server_key(server_id))
            .query_async(&mut conn)
            .await
    }

    pub async fn channel_user_count(&self, channel_id: Uuid) -> RedisResult<i64> {
        let mut conn = self.conn.clone();
        redis::cmd("SCARD")
            .arg(channel_key(channel_id))
            .query_async(&mut conn)
            .await
    }

    pub async fn channel_users(&self, channel_id: Uuid) -> RedisResult<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("SMEMBERS")
            .arg(channel_key(channel_id))
            .query_async(&mut conn)
            .await?;

        Ok(raw.iter().filter_map(|s| s.parse().ok()).collect())
    }

    /// Everyone online on the server, with their channel and nickname.
    /// Users whose metadata hash has expired are skipped.
    pub async fn snapshot(&self, server_id: Uuid) -> RedisResult<Vec<PresenceEntry>> {
        let mut conn = self.conn.clone();
        let raw_ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(server_key(server_id))
            .query_async(&mut conn)
            .await?;
        let user_ids: Vec<Uuid> = raw_ids.iter().filter_map(|s| s.parse().ok()).collect();

        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for user_id in &user_ids {
            pipe.cmd("HGETALL").arg(user_key(*user_id));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut entries = Vec::with_capacity(hashes.len());
        for (user_id, hash) in user_ids.into_iter().zip(hashes) {
            let Some(nickname) = hash.get("nickname") else {
                continue;
            };
            let channel_id = hash
                .get("channel_id")
                .filter(|s| !s.is_empty())
                .and_then(|s| s.parse().ok());
            entries.push(PresenceEntry {
                user_id,
                channel_id,
                nickname: nickname.clone(),
            });
        }

        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(entries)
    }

    /// Wipe a channel's occupancy (used when the channel is deleted).
    /// Returns the users that were in it.
    pub async fn clear_channel(&self, channel_id: Uuid) -> RedisResult<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let users = self.channel_users(channel_id).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for user_id in &users {
            pipe.cmd("HSET")
                .arg(user_key(*user_id))
                .arg("channel_id")
                .arg("")
                .ignore();
        }
        pipe.cmd("DEL").arg(channel_key(channel_id)).ignore();
        pipe.query_async::<()>(&mut conn).await?;

        Ok(users)
    }
}
