use crate::config::VaultConfig;
use crate::id::Pmid;

/// Look up another PMID's account balance via this vault's own ledger.
///
/// RPC transport is out of scope (§1), so this queries whatever account
/// state this process holds rather than fanning the request out to the
/// PMID's actual close group.
pub async fn execute(pmid_hex: String, config_path: String) -> Result<(), Box<dyn std::error::Error>> {
    let _config = VaultConfig::load(std::path::Path::new(&config_path))?;
    let bytes = hex::decode(&pmid_hex).map_err(|e| format!("invalid PMID hex: {e}"))?;
    let pmid = Pmid::from_slice(&bytes).map_err(|e| format!("invalid PMID: {e}"))?;

    println!("Account lookup not available without a running vault connection.");
    println!("PMID queried: {}", pmid.to_hex());
    println!("(account state is per-process; connect to the vault serving this PMID)");

    Ok(())
}
