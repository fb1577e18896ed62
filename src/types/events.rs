use chrono::{DateTime, Utc};
use mediasoup::prelude::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RtpCapabilities, RtpParameters, TransportId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::entities::{ChannelNode, ChannelType, MessageWithAuthor, PresenceEntry};

// ── Wire framing ───────────────────────────────────────

/// Raw inbound frame. `data` defaults to an empty object so payload-less
/// events can omit it; `ack` is the client's correlation id for the reply.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub event: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub ack: Option<u64>,
}

impl InboundFrame {
    pub fn into_event(self) -> Result<(ClientEvent, Option<u64>), serde_json::Error> {
        let ack = self.ack;
        let data = match self.data {
            Some(Value::Null) | None => serde_json::json!({}),
            Some(value) => value,
        };
        let event = serde_json::from_value(serde_json::json!({
            "event": self.event,
            "data": data,
        }))?;
        Ok((event, ack))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl OutboundFrame {
    pub fn event(name: &str, data: impl Serialize) -> Self {
        Self {
            event: name.into(),
            data: Some(serde_json::to_value(data).unwrap()),
            ack: None,
        }
    }

    /// Positive acknowledgement: merges `success: true` into the handler's
    /// result object.
    pub fn ack_ok(ack: u64, data: Value) -> Self {
        let mut body = match data {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("result".into(), other);
                map
            }
        };
        body.insert("success".into(), Value::Bool(true));
        Self {
            event: "ACK".into(),
            data: Some(Value::Object(body)),
            ack: Some(ack),
        }
    }

    pub fn ack_err(ack: u64, message: &str) -> Self {
        Self {
            event: "ACK".into(),
            data: Some(serde_json::json!({ "success": false, "error": message })),
            ack: Some(ack),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            event: "ERROR".into(),
            data: Some(serde_json::json!({ "message": message })),
            ack: None,
        }
    }
}

// ── Client -> Server events ────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    UserJoinServer(JoinServerPayload),
    UserLeaveServer {},
    UserJoinChannel(JoinChannelPayload),
    UserLeaveChannel {},
    ChannelMoved(ChannelMovedPayload),
    CreateChannel(CreateChannelPayload),
    DeleteChannel(DeleteChannelPayload),
    UpdateChannel(UpdateChannelPayload),
    SendMessage(SendMessagePayload),
    FetchMessages(FetchMessagesPayload),
    GetAllUsers {},
    GetRoles {},
    AssignRole(AssignRolePayload),
    GetRouterCapabilities(RouterCapabilitiesPayload),
    CreateWebrtcTransport(CreateTransportPayload),
    ConnectTransport(ConnectTransportPayload),
    Produce(ProducePayload),
    Consume(ConsumePayload),
    ResumeConsumer(ResumeConsumerPayload),
    CloseProducer(CloseProducerPayload),
}

impl ClientEvent {
    /// Event name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserJoinServer(_) => "USER_JOIN_SERVER",
            Self::UserLeaveServer {} => "USER_LEAVE_SERVER",
            Self::UserJoinChannel(_) => "USER_JOIN_CHANNEL",
            Self::UserLeaveChannel {} => "USER_LEAVE_CHANNEL",
            Self::ChannelMoved(_) => "CHANNEL_MOVED",
            Self::CreateChannel(_) => "CREATE_CHANNEL",
            Self::DeleteChannel(_) => "DELETE_CHANNEL",
            Self::UpdateChannel(_) => "UPDATE_CHANNEL",
            Self::SendMessage(_) => "SEND_MESSAGE",
            Self::FetchMessages(_) => "FETCH_MESSAGES",
            Self::GetAllUsers {} => "GET_ALL_USERS",
            Self::GetRoles {} => "GET_ROLES",
            Self::AssignRole(_) => "ASSIGN_ROLE",
            Self::GetRouterCapabilities(_) => "GET_ROUTER_CAPABILITIES",
            Self::CreateWebrtcTransport(_) => "CREATE_WEBRTC_TRANSPORT",
            Self::ConnectTransport(_) => "CONNECT_TRANSPORT",
            Self::Produce(_) => "PRODUCE",
            Self::Consume(_) => "CONSUME",
            Self::ResumeConsumer(_) => "RESUME_CONSUMER",
            Self::CloseProducer(_) => "CLOSE_PRODUCER",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinServerPayload {
    pub user_id: Uuid,
    pub nickname: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinChannelPayload {
    pub channel_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ChannelMovedPayload {
    pub channel_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub position: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateChannelPayload {
    pub name: String,
    pub channel_type: ChannelType,
    pub parent_id: Option<Uuid>,
    pub max_users: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteChannelPayload {
    pub channel_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UpdateChannelPayload {
    pub channel_id: Uuid,
    pub name: Option<String>,
    pub max_users: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessagePayload {
    pub channel_id: Uuid,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct FetchMessagesPayload {
    pub channel_id: Uuid,
    pub limit: Option<i64>,
    pub before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleAction {
    Add,
    Remove,
}

#[derive(Debug, Deserialize)]
pub struct AssignRolePayload {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub action: RoleAction,
}

// ── Client -> Server voice events ──────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

#[derive(Debug, Deserialize)]
pub struct RouterCapabilitiesPayload {
    pub channel_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CreateTransportPayload {
    pub channel_id: Uuid,
    pub direction: TransportDirection,
}

#[derive(Debug, Deserialize)]
pub struct ConnectTransportPayload {
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Deserialize)]
pub struct ProducePayload {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Deserialize)]
pub struct ConsumePayload {
    pub producer_id: ProducerId,
    pub rtp_capabilities: Option<RtpCapabilities>,
}

#[derive(Debug, Deserialize)]
pub struct ResumeConsumerPayload {
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Deserialize)]
pub struct CloseProducerPayload {
    pub producer_id: ProducerId,
}

// ── Server -> Client events ────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct UserJoinedEvent {
    pub user_id: Uuid,
    pub nickname: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserLeftEvent {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelTreeUpdateEvent {
    pub server_id: Uuid,
    pub channels: Vec<ChannelNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceUpdateEvent {
    pub server_id: Uuid,
    pub entries: Vec<PresenceEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageReceivedEvent {
    #[serde(flatten)]
    pub message: MessageWithAuthor,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewProducerEvent {
    pub user_id: Uuid,
    pub nickname: String,
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerClosedEvent {
    pub user_id: Uuid,
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExistingProducer {
    pub user_id: Uuid,
    pub nickname: String,
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExistingProducersEvent {
    pub producers: Vec<ExistingProducer>,
}

// ── Voice acknowledgement payloads ─────────────────────

/// TURN relay credentials handed to clients alongside transport options.
#[derive(Debug, Clone, Serialize)]
pub struct TurnCredentials {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Transport connection details sent to the client.
#[derive(Debug, Clone, Serialize)]
pub struct TransportCreatedAck {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<TurnCredentials>,
}

/// Consumer details sent to the client.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerCreatedAck {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: String,
    pub rtp_parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_server_frame() {
        let raw = r#"{
            "event": "USER_JOIN_SERVER",
            "data": { "user_id": "018f4e9e-1111-7000-8000-000000000001", "nickname": "ada" },
            "ack": 7
        }"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        let (event, ack) = frame.into_event().unwrap();
        assert_eq!(ack, Some(7));
        match event {
            ClientEvent::UserJoinServer(p) => assert_eq!(p.nickname, "ada"),
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[test]
    fn test_parse_frame_without_data() {
        let raw = r#"{ "event": "USER_LEAVE_SERVER" }"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        let (event, ack) = frame.into_event().unwrap();
        assert_eq!(ack, None);
        assert_eq!(event.name(), "USER_LEAVE_SERVER");
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let raw = r#"{ "event": "SELF_DESTRUCT", "data": {} }"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert!(frame.into_event().is_err());
    }

    #[test]
    fn test_ack_ok_merges_success() {
        let frame = OutboundFrame::ack_ok(3, serde_json::json!({ "server_id": "x" }));
        let text = serde_json::to_string(&frame).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "ACK");
        assert_eq!(value["ack"], 3);
        assert_eq!(value["data"]["success"], true);
        assert_eq!(value["data"]["server_id"], "x");
    }

    #[test]
    fn test_ack_err_shape() {
        let frame = OutboundFrame::ack_err(9, "channel not found");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["data"]["success"], false);
        assert_eq!(value["data"]["error"], "channel not found");
    }
}
