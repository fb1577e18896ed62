use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub instance: InstanceConfig,
    pub sfu: SfuConfig,
    pub turn: Option<TurnConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    /// Address advertised to clients in the server entity.
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: i32,
    /// Installation id that gets the admin role bound on join.
    pub admin_user_id: Option<uuid::Uuid>,
    /// Opt-in: seed the default server, roles and channel template on startup.
    #[serde(default)]
    pub seed_template: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SfuConfig {
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    /// Public IP advertised in ICE candidates; unset for LAN deployments.
    #[serde(default)]
    pub announced_ip: String,
    #[serde(default = "default_rtc_min_port")]
    pub rtc_min_port: u16,
    #[serde(default = "default_rtc_max_port")]
    pub rtc_max_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnConfig {
    pub url: String,
    pub username: String,
    pub credential: String,
}

fn default_max_connections() -> u32 {
    10
}

fn default_max_clients() -> i32 {
    64
}

fn default_listen_ip() -> String {
    "0.0.0.0".into()
}

fn default_rtc_min_port() -> u16 {
    40000
}

fn default_rtc_max_port() -> u16 {
    49999
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("RESON8")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
