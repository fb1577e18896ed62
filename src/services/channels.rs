use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::db::queries;
use crate::error::GatewayError;
use crate::gateway::server_room;
use crate::services::tree;
use crate::state::AppState;
use crate::types::entities::{Channel, ChannelNode, ChannelType};
use crate::types::events::{ChannelTreeUpdateEvent, OutboundFrame};

const MAX_NAME_LEN: usize = 100;

pub async fn create(
    state: &AppState,
    server_id: Uuid,
    name: &str,
    channel_type: ChannelType,
    parent_id: Option<Uuid>,
    max_users: Option<i32>,
) -> Result<Channel, GatewayError> {
    let name = validate_name(name)?;

    if let Some(parent) = parent_id {
        let parent_channel = queries::get_channel_by_id(&state.db, parent)
            .await?
            .ok_or(GatewayError::NotFound("Parent channel"))?;
        if parent_channel.server_id != server_id {
            return Err(GatewayError::NotFound("Parent channel"));
        }
    }

    let position = queries::next_channel_position(&state.db, server_id, parent_id).await?;
    let channel = queries::create_channel(
        &state.db,
        Uuid::now_v7(),
        server_id,
        name,
        channel_type,
        parent_id,
        position,
        max_users,
    )
    .await?;

    Ok(channel)
}

pub async fn update(
    state: &AppState,
    server_id: Uuid,
    channel_id: Uuid,
    name: Option<&str>,
    max_users: Option<i32>,
) -> Result<Channel, GatewayError> {
    get_server_channel(state, server_id, channel_id).await?;

    let name = name.map(validate_name).transpose()?;
    let channel = queries::update_channel(&state.db, channel_id, name, max_users).await?;
    Ok(channel)
}

/// Resolve a channel and verify it belongs to the caller's server.
pub async fn get_server_channel(
    state: &AppState,
    server_id: Uuid,
    channel_id: Uuid,
) -> Result<Channel, GatewayError> {
    let channel = queries::get_channel_by_id(&state.db, channel_id)
        .await?
        .ok_or(GatewayError::NotFound("Channel"))?;
    if channel.server_id != server_id {
        return Err(GatewayError::NotFound("Channel"));
    }
    Ok(channel)
}

/// Re-parent and/or reposition a channel, rejecting moves that would make
/// the parent graph cyclic.
pub async fn move_channel(
    state: &AppState,
    server_id: Uuid,
    channel_id: Uuid,
    parent_id: Option<Uuid>,
    position: Option<i32>,
) -> Result<Channel, GatewayError> {
    let channel = get_server_channel(state, server_id, channel_id).await?;

    if let Some(parent) = parent_id {
        let parent_channel = queries::get_channel_by_id(&state.db, parent)
            .await?
            .ok_or(GatewayError::NotFound("Parent channel"))?;
        if parent_channel.server_id != channel.server_id {
            return Err(GatewayError::NotFound("Parent channel"));
        }

        let siblings = queries::get_server_channels(&state.db, channel.server_id).await?;
        if would_create_cycle(&siblings, channel_id, parent) {
            return Err(GatewayError::InvalidInput(
                "Moving the channel here would create a cycle".into(),
            ));
        }
    }

    let position = match position {
        Some(p) => p,
        None => queries::next_channel_position(&state.db, channel.server_id, parent_id).await?,
    };

    let channel = queries::move_channel(&state.db, channel_id, parent_id, position).await?;
    Ok(channel)
}

pub async fn delete(
    state: &AppState,
    server_id: Uuid,
    channel_id: Uuid,
) -> Result<Channel, GatewayError> {
    let channel = get_server_channel(state, server_id, channel_id).await?;

    queries::delete_channel(&state.db, channel_id).await?;
    Ok(channel)
}

/// Build the channel forest with occupants filled in from presence.
pub async fn tree_with_occupants(
    state: &AppState,
    server_id: Uuid,
) -> Result<Vec<ChannelNode>, GatewayError> {
    let channels = queries::get_server_channels(&state.db, server_id).await?;
    let mut nodes = tree::build_channel_tree(&channels);
    let entries = state.presence.snapshot(server_id).await?;
    tree::populate_occupants(&mut nodes, &entries);
    Ok(nodes)
}

/// Recompute the tree and push it to everyone on the server.
pub async fn broadcast_tree(state: &AppState, server_id: Uuid) -> Result<(), GatewayError> {
    let channels = tree_with_occupants(state, server_id).await?;
    state.gateway.emit_to_room(
        &server_room(server_id),
        &OutboundFrame::event(
            "CHANNEL_TREE_UPDATE",
            ChannelTreeUpdateEvent { server_id, channels },
        ),
    );
    Ok(())
}

fn validate_name(name: &str) -> Result<&str, GatewayError> {
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(GatewayError::InvalidInput(
            "Channel name must be 1-100 characters".into(),
        ));
    }
    Ok(name)
}

/// Walking up from `new_parent` must never reach `channel_id`. The visited
/// guard terminates the walk even over corrupt rows.
fn would_create_cycle(channels: &[Channel], channel_id: Uuid, new_parent: Uuid) -> bool {
    if channel_id == new_parent {
        return true;
    }

    let parents: HashMap<Uuid, Option<Uuid>> =
        channels.iter().map(|c| (c.id, c.parent_id)).collect();

    let mut visited = HashSet::new();
    let mut current = Some(new_parent);
    while let Some(id) = current {
        if id == channel_id {
            return true;
        }
        if !visited.insert(id) {
            return false;
        }
        current = parents.get(&id).copied().flatten();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn uuid_from(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn make_channel(id: Uuid, parent_id: Option<Uuid>) -> Channel {
        Channel {
            id,
            server_id: uuid_from(0xff),
            name: "chan".into(),
            channel_type: ChannelType::Text,
            parent_id,
            position: 0,
            max_users: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_self_parent_is_a_cycle() {
        let a = uuid_from(1);
        let rows = vec![make_channel(a, None)];
        assert!(would_create_cycle(&rows, a, a));
    }

    #[test]
    fn test_reparenting_under_own_descendant_is_a_cycle() {
        let a = uuid_from(1);
        let b = uuid_from(2);
        let c = uuid_from(3);
        let rows = vec![
            make_channel(a, None),
            make_channel(b, Some(a)),
            make_channel(c, Some(b)),
        ];
        // a under c would close the loop a -> b -> c -> a
        assert!(would_create_cycle(&rows, a, c));
    }

    #[test]
    fn test_moving_to_a_sibling_is_fine() {
        let a = uuid_from(1);
        let b = uuid_from(2);
        let rows = vec![make_channel(a, None), make_channel(b, None)];
        assert!(!would_create_cycle(&rows, a, b));
    }

    #[test]
    fn test_walk_terminates_on_corrupt_rows() {
        let a = uuid_from(1);
        let b = uuid_from(2);
        let c = uuid_from(3);
        // b and c already reference each other; moving a under b must not hang
        let rows = vec![
            make_channel(a, None),
            make_channel(b, Some(c)),
            make_channel(c, Some(b)),
        ];
        assert!(!would_create_cycle(&rows, a, b));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("  general  ").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(101)).is_err());
    }
}
