//! `VaultServiceLogic` (fan-out/aggregate helper) and the `VaultService`
//! orchestrator's RPC dispatch (§4.5-4.9, §6.1) — the state machine that
//! ties identity validation, the chunk store, the watch-list engine, the
//! account ledger, and the amendment quorum together.
//!
//! Real DHT routing and RPC transport are out of scope (§1): every method
//! below acts as the *receiving* end of one of the RPCs in §6.1, already
//! deserialized and identity-checked. Cross-vault fan-out (asking a peer
//! to do something) goes through [`Overlay`]/[`VaultServiceLogic`], whose
//! bundled implementation is local and deterministic; a production
//! deployment supplies a networked `Overlay` without touching this file.

use crate::account::{AccountError, AccountField, AccountHandler, AccountSnapshot};
use crate::amendment::{AccountAmendmentHandler, AmendmentError};
use crate::chunkinfo::{ChunkInfoError, ChunkInfoHandler, CommitOutcome};
use crate::chunkstore::{ChunkStore, ChunkStoreError, Hashability, Shard};
use crate::expectation::RequestExpectationHandler;
use crate::id::{ChunkName, Pmid, ID_LEN};
use crate::identity::{
    validate_signed_size, validate_store_contract, IdentityError, InnerContract, RpcResult,
    SelfCertifiedKey, SignedSize, StoreContract,
};
use crate::overlay::Overlay;
use crate::serialization::RequestEnvelope;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    ChunkStore(#[from] ChunkStoreError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    ChunkInfo(#[from] ChunkInfoError),
    #[error(transparent)]
    Amendment(#[from] AmendmentError),
    #[error("no matching StorePrep contract for this chunk")]
    PrepNotFound,
    #[error("account owner may only self-amend SpaceOffered")]
    SelfAmendmentForbidden,
    #[error("amendment was not preceded by a matching expectation")]
    ExpectationNotMet,
    #[error("vault has not completed startup sync")]
    NotInitialised,
    #[error("sync data rejected: signer is not one of this vault's closest neighbours")]
    UntrustedSyncSource,
}

impl ServiceError {
    /// Converts any internal error to the only two user-visible outcomes
    /// (§6.1): the detail is logged, never returned over the wire.
    pub fn to_rpc_result(&self) -> RpcResult {
        warn!(error = %self, "rejecting request");
        RpcResult::Nack
    }
}

/// `VaultServiceLogic` (§2): turns a local decision into a fan-out of calls
/// to the k nodes closest to a key and aggregates the results. Generic over
/// the call itself so it can be driven by an in-process dispatcher in tests
/// and by a networked RPC client in a real deployment.
pub struct VaultServiceLogic {
    overlay: Arc<dyn Overlay>,
    k: usize,
}

impl VaultServiceLogic {
    pub fn new(overlay: Arc<dyn Overlay>, k: usize) -> Self {
        Self { overlay, k }
    }

    /// Calls `request` against every one of the k nodes closest to `key`,
    /// collecting the responses that succeeded.
    pub async fn fan_out<F, Fut, T>(&self, key: &[u8; ID_LEN], request: F) -> Vec<T>
    where
        F: Fn(Pmid) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let group = self.overlay.closest_group(key, self.k).await;
        let mut results = Vec::with_capacity(group.len());
        for peer in group {
            if let Some(value) = request(peer).await {
                results.push(value);
            }
        }
        results
    }

    /// Whether at least `threshold` of the k closest nodes answered
    /// successfully.
    pub async fn quorum_met<F, Fut>(&self, key: &[u8; ID_LEN], threshold: usize, request: F) -> bool
    where
        F: Fn(Pmid) -> Fut,
        Fut: Future<Output = Option<()>>,
    {
        self.fan_out(key, request).await.len() >= threshold
    }

    pub fn overlay(&self) -> &Arc<dyn Overlay> {
        &self.overlay
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

struct PrepEntry {
    signed_size: SignedSize,
    expires_at: Instant,
}

/// Startup-sync payload (§4.9, §6.2): accounts plus chunk-info.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncData {
    pub accounts: Vec<crate::account::Account>,
    pub chunk_info: HashMap<ChunkName, crate::chunkinfo::ChunkInfo>,
}

/// Dispatches the RPCs of §6.1 to the handlers built up from the identity
/// validator through the amendment quorum.
pub struct VaultService {
    pub identity: Arc<SelfCertifiedKey>,
    pub chunkstore: Arc<dyn ChunkStore>,
    pub accounts: Arc<AccountHandler>,
    pub chunk_info: Arc<ChunkInfoHandler>,
    pub expectations: Arc<RequestExpectationHandler>,
    pub amendments: Arc<AccountAmendmentHandler>,
    pub logic: VaultServiceLogic,
    prep_prm: AsyncMutex<HashMap<ChunkName, PrepEntry>>,
    prep_ttl: Duration,
    started: AtomicBool,
}

impl VaultService {
    pub fn new(
        identity: Arc<SelfCertifiedKey>,
        chunkstore: Arc<dyn ChunkStore>,
        accounts: Arc<AccountHandler>,
        chunk_info: Arc<ChunkInfoHandler>,
        expectations: Arc<RequestExpectationHandler>,
        amendments: Arc<AccountAmendmentHandler>,
        overlay: Arc<dyn Overlay>,
        k: usize,
        prep_ttl: Duration,
    ) -> Self {
        Self {
            identity,
            chunkstore,
            accounts,
            chunk_info,
            expectations,
            amendments,
            logic: VaultServiceLogic::new(overlay, k),
            prep_prm: AsyncMutex::new(HashMap::new()),
            prep_ttl,
            started: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn require_started(&self) -> Result<(), ServiceError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(ServiceError::NotInitialised)
        }
    }

    /// Marks the vault ready to serve mutating RPCs without requiring a
    /// peer sync (used for a genesis vault with no neighbours yet, and in
    /// tests).
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    // -- 4.9 startup sync ---------------------------------------------------

    /// Apply a `GetSyncData` payload received from a neighbour. The payload
    /// must verify against its own embedded signature (bound to this
    /// vault's PMID so it can't be replayed to a different requester), and
    /// the signer must be one of the K nodes closest to this vault's own
    /// PMID before its account/chunk-info state is trusted.
    pub async fn apply_sync_data(&self, envelope: RequestEnvelope<SyncData>) -> Result<(), ServiceError> {
        let local_key = *self.identity.pmid.as_bytes();
        if !envelope.verify(&local_key) {
            return Err(ServiceError::Identity(IdentityError::SignatureInvalid));
        }
        let sender = envelope.pmid_of_signer;
        let admitted = self
            .logic
            .overlay()
            .is_in_closest_group(&local_key, &sender, self.logic.k())
            .await;
        if !admitted {
            warn!(%sender, "rejecting sync data: signer is not one of this vault's closest neighbours");
            return Err(ServiceError::UntrustedSyncSource);
        }
        self.accounts.restore_all(envelope.payload.accounts);
        self.chunk_info.restore_all(envelope.payload.chunk_info);
        self.mark_started();
        info!(%sender, "startup sync applied; now serving mutating RPCs");
        Ok(())
    }

    /// Produces a `GetSyncData` response signed and bound to `requester`, so
    /// the envelope cannot be replayed to a vault other than the one that
    /// actually asked for it.
    pub fn sync_data(&self, requester: &Pmid) -> RequestEnvelope<SyncData> {
        let data = SyncData {
            accounts: self.accounts.snapshot_all(),
            chunk_info: self.chunk_info.snapshot_all(),
        };
        RequestEnvelope::new(&self.identity, data, requester.as_bytes())
    }

    // -- 4.5 StoreContract flow ----------------------------------------------

    /// `StorePrep(chunkname, signed_size) -> store_contract`.
    pub async fn store_prep(
        &self,
        chunk_name: ChunkName,
        signed_size: SignedSize,
    ) -> Result<StoreContract, ServiceError> {
        self.require_started()?;
        if !validate_signed_size(&signed_size) {
            return Err(ServiceError::Identity(IdentityError::SizeSignatureInvalid));
        }
        debug!(?chunk_name, size = signed_size.data_size, "store prep");
        let inner = InnerContract {
            result: RpcResult::Ack,
            signed_size: signed_size.clone(),
        };
        let contract = StoreContract::sign(&self.identity, inner);

        let mut prm = self.prep_prm.lock().await;
        prm.insert(
            chunk_name,
            PrepEntry {
                signed_size,
                expires_at: Instant::now() + self.prep_ttl,
            },
        );
        Ok(contract)
    }

    /// Applies the watch-list commit outcomes returned by
    /// `ChunkInfoHandler::add_to_reference_list`, issuing the `SpaceTaken`
    /// refund amendments a probationary-row displacement earns (§4.4.1).
    async fn settle_commit_outcomes(
        &self,
        requester: Pmid,
        chunk_name: ChunkName,
        size: u64,
        outcomes: Vec<(Pmid, CommitOutcome)>,
    ) {
        for (watcher, outcome) in outcomes {
            if outcome.committed && outcome.refunds > 0 {
                // A displacement refund is owed to the probationary watcher
                // that got bumped off (`replaced_pmid`), not to the watcher
                // whose reference just committed; only when no displacement
                // occurred (the newcomer simply took an open slot) does the
                // committing watcher keep its own prepay-excess refund.
                let credited = outcome.replaced_pmid.unwrap_or(watcher);
                let refund_amount = size * outcome.refunds as u64;
                let _ = self
                    .amendments
                    .process_request(
                        requester,
                        chunk_name,
                        credited,
                        AccountField::SpaceTaken,
                        refund_amount,
                        false,
                    )
                    .await;
            }
        }
    }

    /// `StoreChunk(chunkname, data) -> result`.
    pub async fn store_chunk(
        &self,
        chunk_name: ChunkName,
        data: Vec<u8>,
        client_pmid: Pmid,
    ) -> Result<RpcResult, ServiceError> {
        self.require_started()?;
        let entry = {
            let mut prm = self.prep_prm.lock().await;
            prm.remove(&chunk_name)
        }
        .ok_or(ServiceError::PrepNotFound)?;

        if entry.expires_at < Instant::now() {
            return Err(ServiceError::PrepNotFound);
        }
        if entry.signed_size.data_size != data.len() as u64 {
            return Err(ServiceError::Identity(IdentityError::SizeSignatureInvalid));
        }

        self.chunkstore
            .store(&chunk_name, data, Hashability::Hashable, Shard::Normal)
            .await?;
        info!(?chunk_name, "chunk stored");

        let holder = self.identity.pmid;
        let outcomes =
            self.chunk_info
                .add_to_reference_list(chunk_name, holder, entry.signed_size.data_size)?;
        self.settle_commit_outcomes(holder, chunk_name, entry.signed_size.data_size, outcomes)
            .await;

        // §4.5: ask the account group for SpaceGivenInc (self) and
        // SpaceTakenInc (the client who paid for this copy).
        let _ = self
            .amendments
            .process_request(
                holder,
                chunk_name,
                holder,
                AccountField::SpaceGiven,
                entry.signed_size.data_size,
                true,
            )
            .await;
        let _ = self
            .amendments
            .process_request(
                holder,
                chunk_name,
                client_pmid,
                AccountField::SpaceTaken,
                entry.signed_size.data_size,
                true,
            )
            .await;

        Ok(RpcResult::Ack)
    }

    /// `GetChunk(chunkname) -> content`.
    pub async fn get_chunk(&self, chunk_name: &ChunkName) -> Result<Vec<u8>, ServiceError> {
        Ok(self.chunkstore.load(chunk_name).await?)
    }

    /// `CheckChunk(chunkname) -> Has?`.
    pub async fn check_chunk(&self, chunk_name: &ChunkName) -> bool {
        self.chunkstore.has(chunk_name).await
    }

    /// `DeleteChunk(chunkname, signed_size) -> result`: the client's own
    /// copy deref, which in turn may drive `RemoveFromWatchList`. Modelled
    /// here as the watch-list removal directly; a production deployment
    /// routes the request to this chunk's holder group first.
    pub async fn delete_chunk(
        &self,
        chunk_name: ChunkName,
        signed_size: SignedSize,
    ) -> Result<RpcResult, ServiceError> {
        self.require_started()?;
        if !validate_signed_size(&signed_size) {
            return Err(ServiceError::Identity(IdentityError::SizeSignatureInvalid));
        }
        self.remove_from_watch_list(chunk_name, signed_size.pmid_of_client).await
    }

    // -- 4.4 watch-list client flow -------------------------------------------

    /// `AddToWatchList(chunkname, signed_size) -> (upload_count, result)`.
    pub fn add_to_watch_list(
        &self,
        chunk_name: ChunkName,
        watcher: Pmid,
        size: u64,
    ) -> Result<(u32, u32), ServiceError> {
        self.require_started()?;
        let (required_refs, required_payments) =
            self.chunk_info.prepare_add_to_watch_list(chunk_name, watcher, size)?;
        if required_payments > 0 {
            self.expectations.expect(
                watcher,
                AccountField::SpaceTaken,
                size * required_payments as u64,
            );
        }
        Ok((required_refs, required_payments))
    }

    /// `RemoveFromWatchList(chunkname) -> result`. Applies local refunds and
    /// deletes this vault's own copy when it is among the derefed holders;
    /// remote derefs are the caller's fan-out to issue (§1: RPC transport
    /// is out of scope of this core).
    pub async fn remove_from_watch_list(
        &self,
        chunk_name: ChunkName,
        watcher: Pmid,
    ) -> Result<RpcResult, ServiceError> {
        self.require_started()?;
        let outcome = self.chunk_info.remove_from_watch_list(chunk_name, watcher)?;
        let local = self.identity.pmid;

        for credited in &outcome.credit_pmids {
            let _ = self
                .amendments
                .process_request(
                    local,
                    chunk_name,
                    *credited,
                    AccountField::SpaceTaken,
                    outcome.chunk_size,
                    false,
                )
                .await;
        }

        if outcome.deref_pmids.contains(&local) {
            self.chunkstore.delete(&chunk_name).await?;
        }
        for holder in &outcome.deref_pmids {
            if *holder != local {
                warn!(?holder, ?chunk_name, "remote deref would be fanned out over RPC transport");
            }
        }

        Ok(RpcResult::Ack)
    }

    /// `AddToReferenceList(chunkname, store_contract) -> result`.
    pub async fn add_to_reference_list(
        &self,
        chunk_name: ChunkName,
        store_contract: &StoreContract,
    ) -> Result<RpcResult, ServiceError> {
        self.require_started()?;
        validate_store_contract(store_contract)?;
        let size = store_contract.inner_contract.signed_size.data_size;
        let outcomes =
            self.chunk_info
                .add_to_reference_list(chunk_name, store_contract.pmid_of_holder, size)?;
        self.settle_commit_outcomes(store_contract.pmid_of_holder, chunk_name, size, outcomes)
            .await;
        Ok(RpcResult::Ack)
    }

    /// `GetChunkReferences(chunkname) -> references[]`.
    pub fn get_chunk_references(&self, chunk_name: &ChunkName) -> Result<Vec<Pmid>, ServiceError> {
        Ok(self.chunk_info.get_active_references(chunk_name)?)
    }

    // -- 4.6/4.7 accounts -----------------------------------------------------

    /// `AmendAccount`. A self-signed `SpaceOffered` claim from the account
    /// owner applies directly; every other amendment type must have been
    /// preceded by an expectation this vault itself raised, and then goes
    /// through the amendment quorum (§4.6, §4.7).
    pub async fn amend_account(
        &self,
        requester: Pmid,
        chunk_name: ChunkName,
        account_pmid: Pmid,
        field: AccountField,
        amount: u64,
        increase: bool,
    ) -> Result<RpcResult, ServiceError> {
        self.require_started()?;
        if field == AccountField::SpaceOffered {
            if requester != account_pmid {
                return Err(ServiceError::SelfAmendmentForbidden);
            }
            self.accounts.amend(&account_pmid, field, amount, increase)?;
            return Ok(RpcResult::Ack);
        }
        if !self.expectations.consume(account_pmid, field, amount) {
            return Err(ServiceError::ExpectationNotMet);
        }
        let result = self
            .amendments
            .process_request(requester, chunk_name, account_pmid, field, amount, increase)
            .await?;
        Ok(result)
    }

    /// `AccountStatus(account_pmid)`.
    pub fn account_status(&self, account_pmid: &Pmid) -> Result<AccountSnapshot, ServiceError> {
        Ok(self.accounts.get(account_pmid)?)
    }

    /// `GetAccount(account_pmid) -> serialised account`.
    pub fn get_account(&self, account_pmid: &Pmid) -> Result<AccountSnapshot, ServiceError> {
        self.account_status(account_pmid)
    }

    /// `GetChunkInfo(chunkname) -> serialised chunk info`.
    pub fn get_chunk_info(&self, chunk_name: &ChunkName) -> (usize, usize) {
        (
            self.chunk_info.watch_list_len(chunk_name),
            self.chunk_info.reference_list_len(chunk_name),
        )
    }

    /// `CacheChunk(chunkname, chunkcontent) -> result`: opportunistic cache
    /// of a chunk this vault is not a committed holder for, so nearby reads
    /// can be served locally without re-fetching across the network.
    pub async fn cache_chunk(&self, chunk_name: ChunkName, content: Vec<u8>) -> Result<RpcResult, ServiceError> {
        self.chunkstore
            .store(&chunk_name, content, Hashability::Opaque, Shard::Cache)
            .await?;
        Ok(RpcResult::Ack)
    }

    /// `ValidityCheck(chunkname, random_data) -> SHA512(chunk || random_data)`.
    pub async fn validity_check(
        &self,
        chunk_name: &ChunkName,
        random_data: &[u8],
    ) -> Result<[u8; 64], ServiceError> {
        let content = self.chunkstore.load(chunk_name).await?;
        use sha2::{Digest, Sha512};
        let mut hasher = Sha512::new();
        hasher.update(&content);
        hasher.update(random_data);
        let digest = hasher.finalize();
        let mut out = [0u8; 64];
        out.copy_from_slice(&digest);
        Ok(out)
    }

    /// `VaultStatus -> {chunkstore, offered, free}` (the wire encryption of
    /// `VaultCommunication` is an envelope concern outside this core, per
    /// §6.1's "encrypted" qualifier).
    pub async fn vault_status(&self) -> VaultStatusReport {
        VaultStatusReport {
            chunkstore_used: self.chunkstore.used().await,
            chunkstore_available: self.chunkstore.available().await,
            in_flight_amendments: self.amendments.in_flight_count(),
        }
    }

    /// Runs one expiry sweep across amendments and expectations. Intended
    /// to be driven by a `tokio::time::interval` task spawned at startup
    /// (§4.8), not polled manually by callers.
    pub fn run_expiry_sweep(&self) -> usize {
        self.expectations.sweep_expired();
        self.amendments.clean_up()
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct VaultStatusReport {
    pub chunkstore_used: u64,
    pub chunkstore_available: u64,
    pub in_flight_amendments: usize,
}

/// Spawns the background expiry-sweep task (§4.8): a `tokio::time::interval`
/// loop calling [`VaultService::run_expiry_sweep`] until the returned handle
/// is dropped/aborted.
pub fn spawn_expiry_sweep(service: Arc<VaultService>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let erased = service.run_expiry_sweep();
            if erased > 0 {
                debug!(erased, "expiry sweep erased stale amendments");
            }
        }
    })
}
