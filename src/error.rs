/// Error surface of the gateway. Every handler failure becomes either a
/// negative acknowledgement or an ERROR event on the originating session;
/// nothing propagates into the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Not joined to a server")]
    NotAuthenticated,

    #[error("Insufficient permissions")]
    PermissionDenied,

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Presence(#[from] redis::RedisError),

    #[error(transparent)]
    Sfu(#[from] anyhow::Error),
}

impl GatewayError {
    /// Short message safe to hand to the client; backend causes are
    /// collapsed (the dispatch loop logs the real error).
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Database(_) | GatewayError::Presence(_) => "Internal server error".into(),
            GatewayError::Sfu(_) => "Voice backend error".into(),
            other => other.to_string(),
        }
    }

    /// Backend failures get error-level logs; rejections of client input do
    /// not need a stack-side alarm.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            GatewayError::Database(_) | GatewayError::Presence(_) | GatewayError::Sfu(_)
        )
    }
}
