use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::queries;
use crate::error::GatewayError;
use crate::gateway::{channel_room, server_room, voice};
use crate::services::{admin, channels, messages, permissions};
use crate::state::AppState;
use crate::types::entities::ChannelType;
use crate::types::events::{
    AssignRolePayload, ChannelMovedPayload, ChannelTreeUpdateEvent, ClientEvent,
    CreateChannelPayload, DeleteChannelPayload, ExistingProducer, ExistingProducersEvent,
    FetchMessagesPayload, JoinChannelPayload, JoinServerPayload, OutboundFrame,
    PresenceUpdateEvent, ProducerClosedEvent, SendMessagePayload, UpdateChannelPayload,
    UserJoinedEvent, UserLeftEvent,
};
use crate::types::permissions::Permissions;

/// Connection-scoped state, owned by the socket loop. Identity fields are
/// set by USER_JOIN_SERVER and cleared on leave.
#[derive(Debug)]
pub struct Session {
    pub connection_id: Uuid,
    pub user_id: Option<Uuid>,
    pub nickname: Option<String>,
    pub server_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
}

impl Session {
    pub fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            user_id: None,
            nickname: None,
            server_id: None,
            channel_id: None,
        }
    }

    /// The (user, server, nickname) triple every post-join handler needs.
    pub fn identity(&self) -> Result<(Uuid, Uuid, &str), GatewayError> {
        match (self.user_id, self.server_id, self.nickname.as_deref()) {
            (Some(user_id), Some(server_id), Some(nickname)) => Ok((user_id, server_id, nickname)),
            _ => Err(GatewayError::NotAuthenticated),
        }
    }
}

/// Route one inbound event to its handler. The returned object becomes the
/// positive acknowledgement body.
pub async fn dispatch(
    state: &AppState,
    session: &mut Session,
    event: ClientEvent,
) -> Result<Value, GatewayError> {
    match event {
        ClientEvent::UserJoinServer(payload) => join_server(state, session, payload).await,
        ClientEvent::UserLeaveServer {} => leave_server(state, session).await,
        ClientEvent::UserJoinChannel(payload) => join_channel(state, session, payload).await,
        ClientEvent::UserLeaveChannel {} => leave_channel(state, session).await,
        ClientEvent::CreateChannel(payload) => create_channel(state, session, payload).await,
        ClientEvent::UpdateChannel(payload) => update_channel(state, session, payload).await,
        ClientEvent::ChannelMoved(payload) => channel_moved(state, session, payload).await,
        ClientEvent::DeleteChannel(payload) => delete_channel(state, session, payload).await,
        ClientEvent::SendMessage(payload) => send_message(state, session, payload).await,
        ClientEvent::FetchMessages(payload) => fetch_messages(state, session, payload).await,
        ClientEvent::GetAllUsers {} => get_all_users(state, session).await,
        ClientEvent::GetRoles {} => get_roles(state, session).await,
        ClientEvent::AssignRole(payload) => assign_role(state, session, payload).await,
        ClientEvent::GetRouterCapabilities(payload) => {
            voice::router_capabilities(state, session, payload).await
        }
        ClientEvent::CreateWebrtcTransport(payload) => {
            voice::create_transport(state, session, payload).await
        }
        ClientEvent::ConnectTransport(payload) => {
            voice::connect_transport(state, session, payload).await
        }
        ClientEvent::Produce(payload) => voice::produce(state, session, payload).await,
        ClientEvent::Consume(payload) => voice::consume(state, session, payload).await,
        ClientEvent::ResumeConsumer(payload) => {
            voice::resume_consumer(state, session, payload).await
        }
        ClientEvent::CloseProducer(payload) => {
            voice::close_producer(state, session, payload).await
        }
    }
}

// ── Server membership ─────────────────────────────────

async fn join_server(
    state: &AppState,
    session: &mut Session,
    payload: JoinServerPayload,
) -> Result<Value, GatewayError> {
    if session.user_id.is_some() {
        return Err(GatewayError::Precondition("Already joined".into()));
    }

    let nickname = payload.nickname.trim();
    if nickname.is_empty() || nickname.len() > 64 {
        return Err(GatewayError::InvalidInput(
            "Nickname must be 1-64 characters".into(),
        ));
    }

    let server = queries::get_default_server(&state.db)
        .await?
        .ok_or(GatewayError::NotFound("Server"))?;

    let online = state.presence.server_user_count(server.id).await?;
    if online >= server.max_clients as i64 {
        return Err(GatewayError::Precondition("Server is full".into()));
    }

    let user = queries::upsert_user(&state.db, payload.user_id, nickname).await?;

    if let Some(role) = queries::get_default_role(&state.db, server.id).await? {
        queries::assign_role(&state.db, user.id, role.id).await?;
    }

    // The configured admin installation gets the admin role bound on join
    if state.config.instance.admin_user_id == Some(user.id) {
        let admin_bits = Permissions::ADMIN.bits() as i64;
        if let Some(role) = queries::get_role_with_bits(&state.db, server.id, admin_bits).await? {
            queries::assign_role(&state.db, user.id, role.id).await?;
        }
    }

    state
        .presence
        .join_server(user.id, server.id, &user.nickname)
        .await?;
    state
        .gateway
        .join_room(&server_room(server.id), session.connection_id);

    session.user_id = Some(user.id);
    session.nickname = Some(user.nickname.clone());
    session.server_id = Some(server.id);

    // Initial tree straight to the caller, join notification to the rest
    let tree = channels::tree_with_occupants(state, server.id).await?;
    state.gateway.send_to_session(
        session.connection_id,
        &OutboundFrame::event(
            "CHANNEL_TREE_UPDATE",
            ChannelTreeUpdateEvent {
                server_id: server.id,
                channels: tree,
            },
        ),
    );

    state.gateway.emit_to_room_except(
        &server_room(server.id),
        session.connection_id,
        &OutboundFrame::event(
            "USER_JOINED",
            UserJoinedEvent {
                user_id: user.id,
                nickname: user.nickname.clone(),
            },
        ),
    );

    tracing::info!(user_id = %user.id, server_id = %server.id, nickname = %user.nickname, "User joined server");

    Ok(json!({ "server_id": server.id }))
}

async fn leave_server(state: &AppState, session: &mut Session) -> Result<Value, GatewayError> {
    let (user_id, server_id, _) = session.identity()?;

    leave_channel_inner(state, session).await?;

    state.presence.leave_server(user_id, server_id).await?;
    state
        .gateway
        .leave_room(&server_room(server_id), session.connection_id);
    state.gateway.emit_to_room_except(
        &server_room(server_id),
        session.connection_id,
        &OutboundFrame::event("USER_LEFT", UserLeftEvent { user_id }),
    );

    session.user_id = None;
    session.nickname = None;
    session.server_id = None;

    tracing::info!(user_id = %user_id, server_id = %server_id, "User left server");

    Ok(json!({}))
}

// ── Channel membership ────────────────────────────────

async fn join_channel(
    state: &AppState,
    session: &mut Session,
    payload: JoinChannelPayload,
) -> Result<Value, GatewayError> {
    let (user_id, server_id, nickname) = session.identity()?;
    let nickname = nickname.to_string();

    let channel = channels::get_server_channel(state, server_id, payload.channel_id).await?;

    permissions::require_permission(&state.db, server_id, user_id, Permissions::CONNECT).await?;

    if let Some(max_users) = channel.max_users {
        let occupancy = state.presence.channel_user_count(channel.id).await?;
        if occupancy >= max_users as i64 {
            return Err(GatewayError::Precondition("Channel is full".into()));
        }
    }

    leave_channel_inner(state, session).await?;

    state.presence.join_channel(user_id, channel.id).await?;
    state
        .gateway
        .join_room(&channel_room(channel.id), session.connection_id);
    session.channel_id = Some(channel.id);

    broadcast_presence(state, server_id).await?;

    if channel.channel_type == ChannelType::Voice {
        let producers = state
            .sfu
            .existing_producers(channel.id, user_id)
            .into_iter()
            .map(|(user_id, nickname, producer_id)| ExistingProducer {
                user_id,
                nickname,
                producer_id,
            })
            .collect();
        state.gateway.send_to_session(
            session.connection_id,
            &OutboundFrame::event("EXISTING_PRODUCERS", ExistingProducersEvent { producers }),
        );
    }

    tracing::debug!(user_id = %user_id, channel_id = %channel.id, nickname = %nickname, "User joined channel");

    Ok(json!({ "channel_id": channel.id }))
}

async fn leave_channel(state: &AppState, session: &mut Session) -> Result<Value, GatewayError> {
    session.identity()?;
    if session.channel_id.is_none() {
        return Err(GatewayError::Precondition("Not in a channel".into()));
    }

    leave_channel_inner(state, session).await?;
    Ok(json!({}))
}

/// Shared channel teardown: SFU session (PRODUCER_CLOSED if one was live),
/// room unsubscription, presence, presence broadcast.
async fn leave_channel_inner(
    state: &AppState,
    session: &mut Session,
) -> Result<(), GatewayError> {
    let Some(channel_id) = session.channel_id.take() else {
        return Ok(());
    };
    let (user_id, server_id, _) = session.identity()?;

    if let Some(producer_id) = state.sfu.cleanup_session(channel_id, user_id) {
        state.gateway.emit_to_room_except(
            &channel_room(channel_id),
            session.connection_id,
            &OutboundFrame::event("PRODUCER_CLOSED", ProducerClosedEvent { user_id, producer_id }),
        );
    }

    state
        .gateway
        .leave_room(&channel_room(channel_id), session.connection_id);
    state.presence.leave_channel(user_id).await?;
    broadcast_presence(state, server_id).await?;

    tracing::debug!(user_id = %user_id, channel_id = %channel_id, "User left channel");
    Ok(())
}

/// Push the full presence snapshot to everyone on the server.
pub async fn broadcast_presence(state: &AppState, server_id: Uuid) -> Result<(), GatewayError> {
    let entries = state.presence.snapshot(server_id).await?;
    state.gateway.emit_to_room(
        &server_room(server_id),
        &OutboundFrame::event("PRESENCE_UPDATE", PresenceUpdateEvent { server_id, entries }),
    );
    Ok(())
}

// ── Channel administration ────────────────────────────

async fn create_channel(
    state: &AppState,
    session: &mut Session,
    payload: CreateChannelPayload,
) -> Result<Value, GatewayError> {
    let (user_id, server_id, _) = session.identity()?;
    permissions::require_permission(&state.db, server_id, user_id, Permissions::CREATE_CHANNEL)
        .await?;

    let channel = channels::create(
        state,
        server_id,
        &payload.name,
        payload.channel_type,
        payload.parent_id,
        payload.max_users,
    )
    .await?;

    state.gateway.emit_to_room(
        &server_room(server_id),
        &OutboundFrame::event("CHANNEL_CREATED", &channel),
    );
    channels::broadcast_tree(state, server_id).await?;

    tracing::info!(user_id = %user_id, channel_id = %channel.id, name = %channel.name, "Channel created");

    Ok(json!({ "channel": channel }))
}

async fn update_channel(
    state: &AppState,
    session: &mut Session,
    payload: UpdateChannelPayload,
) -> Result<Value, GatewayError> {
    let (user_id, server_id, _) = session.identity()?;
    permissions::require_permission(&state.db, server_id, user_id, Permissions::MANAGE_CHANNELS)
        .await?;

    let channel = channels::update(
        state,
        server_id,
        payload.channel_id,
        payload.name.as_deref(),
        payload.max_users,
    )
    .await?;
    channels::broadcast_tree(state, server_id).await?;

    Ok(json!({ "channel": channel }))
}

async fn channel_moved(
    state: &AppState,
    session: &mut Session,
    payload: ChannelMovedPayload,
) -> Result<Value, GatewayError> {
    let (user_id, server_id, _) = session.identity()?;
    permissions::require_permission(&state.db, server_id, user_id, Permissions::MANAGE_CHANNELS)
        .await?;

    let channel = channels::move_channel(
        state,
        server_id,
        payload.channel_id,
        payload.parent_id,
        payload.position,
    )
    .await?;
    channels::broadcast_tree(state, server_id).await?;

    Ok(json!({ "channel": channel }))
}

async fn delete_channel(
    state: &AppState,
    session: &mut Session,
    payload: DeleteChannelPayload,
) -> Result<Value, GatewayError> {
    let (user_id, server_id, _) = session.identity()?;
    permissions::require_permission(&state.db, server_id, user_id, Permissions::MANAGE_CHANNELS)
        .await?;

    let channel = channels::delete(state, server_id, payload.channel_id).await?;

    // Voice state and occupancy go with the channel
    state.sfu.close_room(channel.id);
    let displaced = state.presence.clear_channel(channel.id).await?;

    channels::broadcast_tree(state, server_id).await?;
    state.gateway.emit_to_room(
        &server_room(server_id),
        &OutboundFrame::event("CHANNEL_DELETED", json!({ "channel_id": channel.id })),
    );
    if !displaced.is_empty() {
        broadcast_presence(state, server_id).await?;
    }

    tracing::info!(user_id = %user_id, channel_id = %channel.id, "Channel deleted");

    Ok(json!({}))
}

// ── Messaging ─────────────────────────────────────────

async fn send_message(
    state: &AppState,
    session: &mut Session,
    payload: SendMessagePayload,
) -> Result<Value, GatewayError> {
    let (user_id, server_id, nickname) = session.identity()?;
    permissions::require_permission(&state.db, server_id, user_id, Permissions::SEND_MESSAGES)
        .await?;

    let message = messages::send(
        state,
        server_id,
        user_id,
        nickname,
        payload.channel_id,
        &payload.content,
    )
    .await?;

    Ok(json!({ "message": message }))
}

async fn fetch_messages(
    state: &AppState,
    session: &mut Session,
    payload: FetchMessagesPayload,
) -> Result<Value, GatewayError> {
    let (_, server_id, _) = session.identity()?;

    let messages = messages::fetch(
        state,
        server_id,
        payload.channel_id,
        payload.limit,
        payload.before,
    )
    .await?;

    Ok(json!({ "messages": messages }))
}

// ── Role administration ───────────────────────────────

async fn get_all_users(state: &AppState, session: &mut Session) -> Result<Value, GatewayError> {
    let (user_id, server_id, _) = session.identity()?;
    permissions::require_permission(&state.db, server_id, user_id, Permissions::MANAGE_ROLES)
        .await?;

    let users = admin::list_users(&state.db, server_id).await?;
    Ok(json!({ "users": users }))
}

async fn get_roles(state: &AppState, session: &mut Session) -> Result<Value, GatewayError> {
    let (user_id, server_id, _) = session.identity()?;
    permissions::require_permission(&state.db, server_id, user_id, Permissions::MANAGE_ROLES)
        .await?;

    let roles = admin::list_roles(&state.db, server_id).await?;
    Ok(json!({ "roles": roles }))
}

async fn assign_role(
    state: &AppState,
    session: &mut Session,
    payload: AssignRolePayload,
) -> Result<Value, GatewayError> {
    let (user_id, server_id, _) = session.identity()?;
    permissions::require_permission(&state.db, server_id, user_id, Permissions::MANAGE_ROLES)
        .await?;

    admin::assign_role(
        &state.db,
        server_id,
        payload.user_id,
        payload.role_id,
        payload.action,
    )
    .await?;

    tracing::info!(actor = %user_id, target = %payload.user_id, role_id = %payload.role_id, action = ?payload.action, "Role assignment changed");

    Ok(json!({}))
}

// ── Disconnect ────────────────────────────────────────

/// Teardown for a dropped connection, in a fixed order: SFU session (with
/// its PRODUCER_CLOSED), channel presence, server presence, USER_LEFT.
/// A failing step is logged and never stops the later steps.
pub async fn cleanup_on_disconnect(state: &AppState, session: &mut Session) {
    let (Some(user_id), Some(server_id)) = (session.user_id, session.server_id) else {
        return;
    };

    if let Some(channel_id) = session.channel_id.take() {
        if let Some(producer_id) = state.sfu.cleanup_session(channel_id, user_id) {
            state.gateway.emit_to_room_except(
                &channel_room(channel_id),
                session.connection_id,
                &OutboundFrame::event(
                    "PRODUCER_CLOSED",
                    ProducerClosedEvent { user_id, producer_id },
                ),
            );
        }
        state
            .gateway
            .leave_room(&channel_room(channel_id), session.connection_id);

        if let Err(e) = state.presence.leave_channel(user_id).await {
            tracing::error!(user_id = %user_id, error = %e, "Disconnect: failed to clear channel presence");
        }
        if let Err(e) = broadcast_presence(state, server_id).await {
            tracing::error!(user_id = %user_id, error = %e, "Disconnect: failed to broadcast presence");
        }
    }

    if let Err(e) = state.presence.leave_server(user_id, server_id).await {
        tracing::error!(user_id = %user_id, error = %e, "Disconnect: failed to clear server presence");
    }

    state.gateway.emit_to_room_except(
        &server_room(server_id),
        session.connection_id,
        &OutboundFrame::event("USER_LEFT", UserLeftEvent { user_id }),
    );

    tracing::info!(user_id = %user_id, connection_id = %session.connection_id, "Session cleaned up");
}
