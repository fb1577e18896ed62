use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::queries;
use crate::error::GatewayError;
use crate::gateway::server_room;
use crate::services::channels;
use crate::state::AppState;
use crate::types::entities::{ChannelType, MessageWithAuthor};
use crate::types::events::{MessageReceivedEvent, OutboundFrame};

const MAX_CONTENT_LEN: usize = 4000;
const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 100;

/// Persist-then-broadcast. The broadcast goes to the whole server room, not
/// just the channel: clients render channels they are not currently in.
pub async fn send(
    state: &AppState,
    server_id: Uuid,
    user_id: Uuid,
    nickname: &str,
    channel_id: Uuid,
    content: &str,
) -> Result<MessageWithAuthor, GatewayError> {
    let content = normalize_content(content)?;

    let channel = channels::get_server_channel(state, server_id, channel_id).await?;
    if channel.channel_type != ChannelType::Text {
        return Err(GatewayError::InvalidInput(
            "Messages can only be sent to text channels".into(),
        ));
    }

    let message =
        queries::create_message(&state.db, Uuid::now_v7(), channel_id, user_id, &content).await?;

    let message = MessageWithAuthor {
        id: message.id,
        channel_id: message.channel_id,
        user_id: message.user_id,
        content: message.content,
        created_at: message.created_at,
        nickname: nickname.to_string(),
    };

    state.gateway.emit_to_room(
        &server_room(channel.server_id),
        &OutboundFrame::event(
            "MESSAGE_RECEIVED",
            MessageReceivedEvent {
                message: message.clone(),
            },
        ),
    );

    Ok(message)
}

/// Page of history older than `before`, returned in chronological order
/// even though the query walks newest-first.
pub async fn fetch(
    state: &AppState,
    server_id: Uuid,
    channel_id: Uuid,
    limit: Option<i64>,
    before: Option<DateTime<Utc>>,
) -> Result<Vec<MessageWithAuthor>, GatewayError> {
    channels::get_server_channel(state, server_id, channel_id).await?;

    let limit = clamp_limit(limit);
    let mut messages = queries::get_messages_before(&state.db, channel_id, before, limit).await?;
    messages.reverse();
    Ok(messages)
}

fn normalize_content(raw: &str) -> Result<String, GatewayError> {
    let content = raw.trim();
    if content.is_empty() {
        return Err(GatewayError::InvalidInput("Message content is empty".into()));
    }
    if content.len() > MAX_CONTENT_LEN {
        return Err(GatewayError::InvalidInput(
            "Message must be 4000 characters or fewer".into(),
        ));
    }
    Ok(content.to_string())
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_is_trimmed() {
        assert_eq!(normalize_content("  hello  ").unwrap(), "hello");
    }

    #[test]
    fn test_whitespace_only_content_is_rejected() {
        assert!(normalize_content("   \n\t ").is_err());
        assert!(normalize_content("").is_err());
    }

    #[test]
    fn test_oversized_content_is_rejected() {
        assert!(normalize_content(&"x".repeat(4001)).is_err());
        assert!(normalize_content(&"x".repeat(4000)).is_ok());
    }

    #[test]
    fn test_limit_clamping() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(20)), 20);
        assert_eq!(clamp_limit(Some(500)), 100);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-3)), 1);
    }
}
