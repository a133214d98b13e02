use std::env;
use std::sync::Arc;

use dotenv::dotenv;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relay_fleet::agent::{HttpAgentClient, StaticConfigBuilder};
use relay_fleet::config::Config;
use relay_fleet::db::services::{PgNodeRepository, PgUsageRepository, PgUserRepository};
use relay_fleet::orchestrator::Orchestrator;

fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn load_config_template() -> serde_json::Value {
    let path = env::var("FLEET_CONFIG_TEMPLATE")
        .unwrap_or_else(|_| "config_template.json".to_string());
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                error!(path, "config template is not valid JSON: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!(path, "cannot read config template: {e}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();
    dotenv().ok();

    let config = Config::from_env();
    let template = load_config_template();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let mut opt = ConnectOptions::new(database_url);
    opt.max_connections(10);
    let db: DatabaseConnection = Database::connect(opt).await?;
    info!("database connection established");

    let agent = Arc::new(HttpAgentClient::new(config.agent_timeout)?);
    let builder = Arc::new(StaticConfigBuilder::new(template));

    let (mut orchestrator, mut notifications) = Orchestrator::new(
        Arc::new(PgNodeRepository::new(db.clone())),
        Arc::new(PgUserRepository::new(db.clone())),
        Arc::new(PgUsageRepository::new(db)),
        agent,
        builder,
        config,
    );
    orchestrator.start();

    // Delivery to operators lives outside this process; until it is wired
    // up, events are logged and dropped.
    let notification_task = tokio::spawn(async move {
        while let Some(event) = notifications.recv().await {
            info!(event = event.kind(), "domain event");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    orchestrator.shutdown();
    notification_task.abort();
    Ok(())
}
