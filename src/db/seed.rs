use sqlx::PgPool;
use uuid::Uuid;

use crate::config::InstanceConfig;
use crate::db::queries;
use crate::types::entities::{ChannelType, Server};
use crate::types::permissions::Permissions;

/// Ensure the server row exists; with the seed flag set, also lay down the
/// default roles and channel template. Every step is idempotent.
pub async fn run(pool: &PgPool, instance: &InstanceConfig) -> Result<Server, sqlx::Error> {
    let server = match queries::get_default_server(pool).await? {
        Some(server) => server,
        None => {
            let server = queries::create_server(
                pool,
                Uuid::now_v7(),
                &instance.name,
                &instance.address,
                instance.max_clients,
            )
            .await?;
            tracing::info!(server_id = %server.id, name = %server.name, "Server record created");
            server
        }
    };

    if instance.seed_template {
        seed_roles(pool, server.id).await?;
        seed_channels(pool, server.id).await?;
    }

    Ok(server)
}

async fn seed_roles(pool: &PgPool, server_id: Uuid) -> Result<(), sqlx::Error> {
    if !queries::get_server_roles(pool, server_id).await?.is_empty() {
        return Ok(());
    }

    queries::create_role(
        pool,
        Uuid::now_v7(),
        server_id,
        "Admin",
        Permissions::ADMIN.bits() as i64,
        100,
        Some("#e5484d"),
    )
    .await?;

    queries::create_role(
        pool,
        Uuid::now_v7(),
        server_id,
        "Member",
        Permissions::default().bits() as i64,
        0,
        None,
    )
    .await?;

    tracing::info!(server_id = %server_id, "Default roles seeded");
    Ok(())
}

async fn seed_channels(pool: &PgPool, server_id: Uuid) -> Result<(), sqlx::Error> {
    if !queries::get_server_channels(pool, server_id).await?.is_empty() {
        return Ok(());
    }

    queries::create_channel(
        pool,
        Uuid::now_v7(),
        server_id,
        "General",
        ChannelType::Text,
        None,
        0,
        None,
    )
    .await?;

    queries::create_channel(
        pool,
        Uuid::now_v7(),
        server_id,
        "Lounge",
        ChannelType::Voice,
        None,
        1,
        None,
    )
    .await?;

    tracing::info!(server_id = %server_id, "Default channels seeded");
    Ok(())
}
