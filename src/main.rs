use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use checkin_portal::records_api::HttpRecordsApi;
use checkin_portal::store::Store;
use checkin_portal::{logging, server, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = logging::init_logging() {
        logging::init_console_logging();
        error!("File logging unavailable, using console only: {}", e);
    }

    let config = Config::from_environment().context("failed to load configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    let db_path = config.database_path()?;
    let store = Arc::new(
        Store::open(&db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );
    info!(path = %db_path.display(), patients = store.patient_count()?, "Database ready");

    let api = Arc::new(HttpRecordsApi::new(&config)?);
    let state = AppState::new(&config, api, store)?;

    server::serve(&config, state).await
}
