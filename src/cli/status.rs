use crate::account::AccountHandler;
use crate::amendment::AccountAmendmentHandler;
use crate::chunkinfo::ChunkInfoHandler;
use crate::chunkstore::DiskChunkStore;
use crate::config::VaultConfig;
use crate::expectation::RequestExpectationHandler;
use crate::identity::SelfCertifiedKey;
use crate::overlay::StaticOverlay;
use crate::service::VaultService;
use std::sync::Arc;
use std::time::Duration;

/// Report this vault's own account balance and chunk-store usage.
///
/// Account/chunk-info state lives in memory only (§9): a one-shot CLI
/// invocation sees a freshly-constructed, empty ledger rather than a
/// running daemon's live state. Chunk-store usage is read straight off
/// disk and so reflects reality regardless.
pub async fn execute(config_path: String) -> Result<(), Box<dyn std::error::Error>> {
    let config = VaultConfig::load(std::path::Path::new(&config_path))?;

    let pkcs8 = std::fs::read(&config.identity_path)
        .map_err(|e| format!("failed to read identity '{}': {}", config.identity_path.display(), e))?;
    let identity = Arc::new(SelfCertifiedKey::from_pkcs8(pkcs8)?);

    let chunkstore = DiskChunkStore::open(&config.chunkstore_path, config.limits.available_space).await?;
    let accounts = Arc::new(AccountHandler::new());
    let chunk_info = Arc::new(ChunkInfoHandler::new(config.replication.k));
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
        config
            .replication
            .amendment_timeout()
            .map_err(|e| format!("invalid account_amendment_timeout: {e}"))?,
        result_timeout,
    ));

    let local_pmid = identity.pmid;
    let service = VaultService::new(
        identity,
        chunkstore,
        accounts,
        chunk_info,
        expectations,
        amendments,
        overlay,
        config.replication.k,
        Duration::from_secs(300),
    );
    service.mark_started();

    let account = service.account_status(&local_pmid)?;
    let vault = service.vault_status().await;

    println!("Vault status");
    println!("  PMID:               {}", local_pmid.to_hex());
    println!("  Space offered:      {}", account.offered);
    println!("  Space given:        {}", account.given);
    println!("  Space taken:        {}", account.taken);
    println!("  Chunkstore used:    {}", vault.chunkstore_used);
    println!("  Chunkstore avail.:  {}", vault.chunkstore_available);
    println!("  In-flight amendments: {}", vault.in_flight_amendments);

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
    async fn reports_fresh_account_for_newly_initialised_vault() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("vault.toml");
        crate::cli::init::execute(config_path.display().to_string(), None, None).unwrap();

        let result = execute(config_path.display().to_string()).await;
        assert!(result.is_ok());
    }
}
