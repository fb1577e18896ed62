use std::sync::Arc;
use std::time::Instant;

use sqlx::PgPool;

use crate::config::AppConfig;
use crate::gateway::GatewayState;
use crate::services::presence::PresenceStore;
use crate::sfu::SfuCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub presence: PresenceStore,
    pub config: Arc<AppConfig>,
    pub gateway: Arc<GatewayState>,
    pub sfu: Arc<SfuCoordinator>,
    pub started_at: Instant,
}
