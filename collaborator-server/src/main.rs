use std::sync::Arc;

use log::{error, info};

use collaborator::{
    CollaboratorConfig, MeasureContext, RocksBlobStore, StorageConfiguration, StorageExtension,
    SyncServer, TokenIssuer, TransactorConnector,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = CollaboratorConfig::load()?;
    info!(
        "Starting collaborator {} (transactor {})",
        config.service_id, config.transactor_url
    );

    let blobs = RocksBlobStore::open(config.store_config())?;
    info!("Blob store opened at {}", blobs.path().display());

    let issuer = Arc::new(TokenIssuer::new(&config.secret, config.credential_ttl()));
    let extension = StorageExtension::new(StorageConfiguration {
        measure: MeasureContext::new("collaborator"),
        blobs: Arc::new(blobs),
        platform: Arc::new(TransactorConnector::new(config.service_id.clone())),
        issuer: issuer.clone(),
        transactor_url: config.transactor_url.clone(),
    });

    let server = SyncServer::new(config.server_config(), Arc::new(extension), issuer);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Server stopped: {e}");
            }
            server.flush_all().await;
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, flushing open documents");
            server.flush_all().await;
            Ok(())
        }
    }
}
