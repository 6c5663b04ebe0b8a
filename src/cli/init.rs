use crate::config::VaultConfig;
use crate::identity::SelfCertifiedKey;
use std::path::PathBuf;

/// Generate a fresh Ed25519 identity and a starter `vault.toml` next to it.
pub fn execute(
    config_path: String,
    identity_path: Option<String>,
    chunkstore_path: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = PathBuf::from(config_path);
    let identity_path = identity_path
        .map(PathBuf::from)
        .unwrap_or_else(|| config_path.with_file_name("identity.pkcs8"));
    let chunkstore_path = chunkstore_path
        .map(PathBuf::from)
        .unwrap_or_else(|| config_path.with_file_name("chunks"));

    if config_path.exists() {
        return Err(format!("config already exists: {}", config_path.display()).into());
    }

    let key = SelfCertifiedKey::generate()?;
    if let Some(parent) = identity_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&identity_path, key.pkcs8_bytes())?;

    let config = VaultConfig::new(identity_path.clone(), chunkstore_path);
    config.save(&config_path)?;

    println!("Generated identity: {}", identity_path.display());
    println!("PMID: {}", key.pmid.to_hex());
    println!("Wrote config: {}", config_path.display());
    Ok(())
}
