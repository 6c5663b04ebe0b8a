use crate::account::AccountHandler;
use crate::amendment::AccountAmendmentHandler;
use crate::chunkinfo::ChunkInfoHandler;
use crate::chunkstore::DiskChunkStore;
use crate::config::VaultConfig;
use crate::expectation::RequestExpectationHandler;
use crate::identity::SelfCertifiedKey;
use crate::overlay::StaticOverlay;
use crate::service::{spawn_expiry_sweep, VaultService};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long a `StorePrep` contract stays valid before `StoreChunk` must
/// arrive; not part of §6.3's operator-tunable set so it's fixed here.
const STORE_PREP_TTL: Duration = Duration::from_secs(300);

/// Load the config, open the chunk store, and serve RPCs until shutdown.
///
/// Real RPC transport and peer discovery are out of scope (§1): this vault
/// runs as a single-member overlay of itself and is marked started
/// immediately rather than waiting on a neighbour's `GetSyncData`.
pub async fn execute(config_path: String) -> Result<(), Box<dyn std::error::Error>> {
    let config = VaultConfig::load(std::path::Path::new(&config_path))?;

    let pkcs8 = std::fs::read(&config.identity_path)
        .map_err(|e| format!("failed to read identity '{}': {}", config.identity_path.display(), e))?;
    let identity = Arc::new(SelfCertifiedKey::from_pkcs8(pkcs8)?);
    info!(pmid = %identity.pmid.to_hex(), "loaded identity");

    let chunkstore = DiskChunkStore::open(&config.chunkstore_path, config.limits.available_space).await?;
    let accounts = Arc::new(AccountHandler::new());
    let chunk_info = Arc::new(ChunkInfoHandler::new(config.replication.k));
    let amendment_timeout = config
        .replication
        .amendment_timeout()
        .map_err(|e| format!("invalid account_amendment_timeout: {e}"))?;
    let result_timeout = config
        .replication
        .amendment_result_timeout()
        .map_err(|e| format!("invalid account_amendment_result_timeout: {e}"))?;
    let expectations = Arc::new(RequestExpectationHandler::new(result_timeout));
    let overlay = Arc::new(StaticOverlay::new(identity.pmid, vec![identity.pmid]));
    let amendments = Arc::new(AccountAmendmentHandler::new(
        accounts.clone(),
        overlay.clone(),
        config.replication.k,
        config.replication.kad_upper_threshold,
        config.replication.max_account_amendments,
        config.replication.max_repeated_account_amendments,
        amendment_timeout,
        result_timeout,
    ));

    let service = Arc::new(VaultService::new(
        identity,
        chunkstore,
        accounts,
        chunk_info,
        expectations,
        amendments,
        overlay,
        config.replication.k,
        STORE_PREP_TTL,
    ));
    service.mark_started();

    warn!(
        addr = %config.listen_addr,
        "RPC transport is out of scope for this build; no socket is actually bound"
    );
    let sweep = spawn_expiry_sweep(service.clone(), Duration::from_secs(30));

    info!("vault running, waiting for shutdown signal (ctrl-c)");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    sweep.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fails_with_missing_config() {
        let result = execute("/nonexistent/vault.toml".to_string()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fails_when_identity_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("vault.toml");
        let config = VaultConfig::new(
            dir.path().join("identity.pkcs8"),
            dir.path().join("chunks"),
        );
        config.save(&config_path).unwrap();

        let result = execute(config_path.display().to_string()).await;
        assert!(result.is_err());
    }
}
