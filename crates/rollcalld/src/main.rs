use anyhow::Result;
use rollcalld::config::Config;
use rollcalld::dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use rollcalld::engine;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    let engine = engine::spawn_engine(&config)?;

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(engine.clone()))?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, system = config.system_bus, db = %config.db_path.display(), "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    engine.shutdown().await;

    Ok(())
}
