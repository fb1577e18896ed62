use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::gateway::channel_room;
use crate::gateway::handlers::Session;
use crate::services::{channels, permissions};
use crate::state::AppState;
use crate::types::entities::ChannelType;
use crate::types::events::{
    ConnectTransportPayload, ConsumePayload, ConsumerCreatedAck, CloseProducerPayload,
    CreateTransportPayload, NewProducerEvent, OutboundFrame, ProducePayload, ProducerClosedEvent,
    ResumeConsumerPayload, RouterCapabilitiesPayload, TransportCreatedAck, TurnCredentials,
};
use crate::types::permissions::Permissions;

// The handshake runs strictly in session order because the socket loop
// awaits each event before reading the next; handlers only have to check
// that earlier steps actually happened.

/// Prologue shared by every voice event: the session must be joined, in a
/// voice channel, and hold CONNECT.
async fn require_voice(
    state: &AppState,
    session: &Session,
    channel_id: Option<Uuid>,
) -> Result<(Uuid, Uuid, Uuid), GatewayError> {
    let (user_id, server_id, _) = session.identity()?;

    let current = session
        .channel_id
        .ok_or_else(|| GatewayError::Precondition("Join a voice channel first".into()))?;

    if let Some(requested) = channel_id {
        if requested != current {
            return Err(GatewayError::Precondition(
                "Voice events must target the joined channel".into(),
            ));
        }
    }

    let channel = channels::get_server_channel(state, server_id, current).await?;
    if channel.channel_type != ChannelType::Voice {
        return Err(GatewayError::Precondition(
            "Not in a voice channel".into(),
        ));
    }

    permissions::require_permission(&state.db, server_id, user_id, Permissions::CONNECT).await?;

    Ok((user_id, server_id, current))
}

// ── Handshake step 1 ──────────────────────────────────

pub async fn router_capabilities(
    state: &AppState,
    session: &mut Session,
    payload: RouterCapabilitiesPayload,
) -> Result<Value, GatewayError> {
    let (_, _, channel_id) = require_voice(state, session, Some(payload.channel_id)).await?;

    let rtp_capabilities = state.sfu.router_capabilities(channel_id).await?;
    Ok(json!({ "rtp_capabilities": rtp_capabilities }))
}

// ── Handshake step 2 ──────────────────────────────────

pub async fn create_transport(
    state: &AppState,
    session: &mut Session,
    payload: CreateTransportPayload,
) -> Result<Value, GatewayError> {
    let (user_id, _, channel_id) = require_voice(state, session, Some(payload.channel_id)).await?;
    let nickname = session.nickname.clone().unwrap_or_default();

    let info = state
        .sfu
        .create_transport(channel_id, user_id, &nickname, payload.direction)
        .await?;

    let ack = TransportCreatedAck {
        id: info.id,
        ice_parameters: info.ice_parameters,
        ice_candidates: info.ice_candidates,
        dtls_parameters: info.dtls_parameters,
        turn: state.config.turn.as_ref().map(|turn| TurnCredentials {
            url: turn.url.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
        }),
    };

    Ok(serde_json::to_value(ack).unwrap())
}

// ── Handshake step 3 ──────────────────────────────────

pub async fn connect_transport(
    state: &AppState,
    session: &mut Session,
    payload: ConnectTransportPayload,
) -> Result<Value, GatewayError> {
    let (user_id, _, channel_id) = require_voice(state, session, None).await?;

    state
        .sfu
        .connect_transport(channel_id, user_id, payload.transport_id, payload.dtls_parameters)
        .await?;

    Ok(json!({}))
}

// ── Handshake step 4 ──────────────────────────────────

pub async fn produce(
    state: &AppState,
    session: &mut Session,
    payload: ProducePayload,
) -> Result<Value, GatewayError> {
    let (user_id, server_id, channel_id) = require_voice(state, session, None).await?;
    permissions::require_permission(&state.db, server_id, user_id, Permissions::SPEAK).await?;
    let nickname = session.nickname.clone().unwrap_or_default();

    let producer_id = state
        .sfu
        .produce(
            channel_id,
            user_id,
            payload.transport_id,
            payload.kind,
            payload.rtp_parameters,
        )
        .await?;

    state.gateway.emit_to_room_except(
        &channel_room(channel_id),
        session.connection_id,
        &OutboundFrame::event(
            "NEW_PRODUCER",
            NewProducerEvent {
                user_id,
                nickname,
                producer_id,
            },
        ),
    );

    tracing::info!(user_id = %user_id, channel_id = %channel_id, %producer_id, "Producer started");

    Ok(json!({ "producer_id": producer_id }))
}

// ── Handshake step 5 ──────────────────────────────────

pub async fn consume(
    state: &AppState,
    session: &mut Session,
    payload: ConsumePayload,
) -> Result<Value, GatewayError> {
    let (user_id, _, channel_id) = require_voice(state, session, None).await?;

    let owner = state
        .sfu
        .producer_owner(payload.producer_id)
        .ok_or(GatewayError::NotFound("Producer"))?;

    // When the source producer dies, tell this session which user's stream
    // ended; the coordinator has already dropped the consumer by then.
    let gateway = Arc::clone(&state.gateway);
    let connection_id = session.connection_id;
    let producer_id = payload.producer_id;
    let on_producer_close = move || {
        gateway.send_to_session(
            connection_id,
            &OutboundFrame::event(
                "PRODUCER_CLOSED",
                ProducerClosedEvent {
                    user_id: owner,
                    producer_id,
                },
            ),
        );
    };

    let info = state
        .sfu
        .consume(
            channel_id,
            user_id,
            payload.producer_id,
            payload.rtp_capabilities,
            on_producer_close,
        )
        .await?;

    let ack = ConsumerCreatedAck {
        consumer_id: info.id,
        producer_id: info.producer_id,
        kind: info.kind,
        rtp_parameters: info.rtp_parameters,
    };

    Ok(serde_json::to_value(ack).unwrap())
}

// ── Handshake step 6 ──────────────────────────────────

pub async fn resume_consumer(
    state: &AppState,
    session: &mut Session,
    payload: ResumeConsumerPayload,
) -> Result<Value, GatewayError> {
    let (user_id, _, channel_id) = require_voice(state, session, None).await?;

    state
        .sfu
        .resume_consumer(channel_id, user_id, payload.consumer_id)
        .await?;

    Ok(json!({}))
}

// ── Explicit producer close ───────────────────────────

pub async fn close_producer(
    state: &AppState,
    session: &mut Session,
    payload: CloseProducerPayload,
) -> Result<Value, GatewayError> {
    let (user_id, _, channel_id) = require_voice(state, session, None).await?;

    state
        .sfu
        .close_producer(channel_id, user_id, payload.producer_id)?;

    state.gateway.emit_to_room_except(
        &channel_room(channel_id),
        session.connection_id,
        &OutboundFrame::event(
            "PRODUCER_CLOSED",
            ProducerClosedEvent {
                user_id,
                producer_id: payload.producer_id,
            },
        ),
    );

    tracing::info!(user_id = %user_id, channel_id = %channel_id, producer_id = %payload.producer_id, "Producer closed");

    Ok(json!({}))
}
