//! Reorg fan-out across subaccounts.
//!
//! An [`Account`] owns the subchains of one subaccount; [`Accounts`] owns every
//! account of the wallet. A reorg is a two-phase barrier: every subchain of
//! every account is frozen before any of them rewinds, and none resumes before
//! all of them have rewound.
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Context;
use bitcoin::{PublicKey, Transaction};
use futures::future::{join_all, try_join_all};
use parking_lot::RwLock;

use crate::{
    config::SyncConfig,
    error::SyncError,
    hooks::WalletHooks,
    node::Node,
    store::WalletDatabase,
    subchain::{AckCounter, SubchainStateData},
    types::{ElementIndex, Position, StateSequence, SubaccountId, Subchain, SubchainId},
};

/// Lifecycle of an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccountState {
    /// Scanning.
    Normal,
    /// Freezing children.
    PreReorg,
    /// All children frozen.
    Reorg,
    /// Unfreezing children.
    PostReorg,
    /// Stopped.
    Shutdown,
}

impl AccountState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::PreReorg => "pre_reorg",
            Self::Reorg => "reorg",
            Self::PostReorg => "post_reorg",
            Self::Shutdown => "shutdown",
        }
    }
}

struct Control {
    state: AccountState,
    reorgs: HashSet<StateSequence>,
}

/// The subchains of one subaccount.
pub struct Account {
    subaccount: SubaccountId,
    subchains: BTreeMap<Subchain, Arc<SubchainStateData>>,
    control: tokio::sync::Mutex<Control>,
}

impl Account {
    /// Start a [`SubchainStateData`] for each of `subchains`.
    pub async fn start(
        subaccount: SubaccountId,
        subchains: &[Subchain],
        config: Arc<SyncConfig>,
        node: Node,
        db: Arc<dyn WalletDatabase>,
        hooks: Arc<dyn WalletHooks>,
    ) -> anyhow::Result<Self> {
        let started = try_join_all(subchains.iter().map(|&subchain| {
            let id = SubchainId::new(subaccount, subchain, config.filter_type);
            let (config, node, db, hooks) = (config.clone(), node.clone(), db.clone(), hooks.clone());
            async move {
                let data = SubchainStateData::start(id, config, node, db, hooks).await?;
                anyhow::Ok((subchain, Arc::new(data)))
            }
        }))
        .await?;
        tracing::info!(%subaccount, subchains = started.len(), "account started");
        Ok(Self {
            subaccount,
            subchains: started.into_iter().collect(),
            control: tokio::sync::Mutex::new(Control {
                state: AccountState::Normal,
                reorgs: HashSet::new(),
            }),
        })
    }

    /// Identifier of the subaccount.
    pub fn subaccount(&self) -> SubaccountId {
        self.subaccount
    }

    /// The subchain for `subchain`, if tracked.
    pub fn subchain(&self, subchain: Subchain) -> Option<Arc<SubchainStateData>> {
        self.subchains.get(&subchain).cloned()
    }

    /// Every tracked subchain, in [`Subchain`] order.
    pub fn subchains(&self) -> impl Iterator<Item = &Arc<SubchainStateData>> {
        self.subchains.values()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> AccountState {
        self.control.lock().await.state
    }

    /// Freeze every subchain for reorg `id`; only returns once all have
    /// acknowledged. An id already seen is acknowledged without doing anything.
    pub async fn prepare_reorg(&self, id: StateSequence) -> anyhow::Result<()> {
        let mut control = self.control.lock().await;
        if control.reorgs.contains(&id) {
            return Ok(());
        }
        if control.state != AccountState::Normal {
            return Err(SyncError::InvalidState {
                operation: "prepare_reorg",
                state: control.state.as_str(),
            }
            .into());
        }
        control.reorgs.insert(id);
        control.state = AccountState::PreReorg;

        let results = join_all(self.subchains.values().map(|s| s.prepare_reorg(id))).await;
        let mut acks = AckCounter::new(self.subchains.len());
        let mut failed = Vec::new();
        for (subchain, result) in self.subchains.keys().zip(results) {
            match result {
                Ok(()) => acks.ack(),
                Err(e) => failed.push(format!("{subchain}: {e:#}")),
            }
        }
        // partially frozen accounts still need finish_reorg to release them
        control.state = AccountState::Reorg;
        if !acks.is_complete() {
            anyhow::bail!(
                "subaccount {} failed to freeze for reorg {id}: {}",
                self.subaccount,
                failed.join("; ")
            );
        }
        tracing::debug!(subaccount = %self.subaccount, reorg = %id, "account frozen");
        Ok(())
    }

    /// Rewind every subchain to `ancestor`. Failures are added to `errors`.
    pub async fn process_reorg(&self, errors: &mut usize, ancestor: Position) {
        let control = self.control.lock().await;
        if control.state != AccountState::Reorg {
            tracing::error!(subaccount = %self.subaccount, state = control.state.as_str(), "process_reorg outside a reorg");
            *errors += 1;
            return;
        }
        let counts = join_all(self.subchains.values().map(|s| async move {
            let mut local = 0;
            s.process_reorg(&mut local, ancestor).await;
            local
        }))
        .await;
        *errors += counts.into_iter().sum::<usize>();
        drop(control);
    }

    /// Unfreeze every subchain after reorg `id`.
    pub async fn finish_reorg(&self, id: StateSequence) -> anyhow::Result<()> {
        let mut control = self.control.lock().await;
        match control.state {
            AccountState::Reorg => {}
            AccountState::Normal if control.reorgs.contains(&id) => return Ok(()),
            state => {
                return Err(SyncError::InvalidState {
                    operation: "finish_reorg",
                    state: state.as_str(),
                }
                .into())
            }
        }
        control.state = AccountState::PostReorg;
        let results = join_all(self.subchains.values().map(|s| s.finish_reorg(id))).await;
        let mut acks = AckCounter::new(self.subchains.len());
        let mut failed = Vec::new();
        for (subchain, result) in self.subchains.keys().zip(results) {
            match result {
                Ok(()) => acks.ack(),
                Err(e) => failed.push(format!("{subchain}: {e:#}")),
            }
        }
        control.state = AccountState::Normal;
        if !acks.is_complete() {
            anyhow::bail!(
                "subaccount {} failed to resume after reorg {id}: {}",
                self.subaccount,
                failed.join("; ")
            );
        }
        tracing::debug!(subaccount = %self.subaccount, reorg = %id, "account resumed");
        Ok(())
    }

    /// Stop every subchain. Returns the number of errors.
    pub async fn shutdown(&self) -> usize {
        let mut control = self.control.lock().await;
        if control.state == AccountState::Shutdown {
            return 0;
        }
        let errors = join_all(self.subchains.values().map(|s| s.shutdown()))
            .await
            .into_iter()
            .sum();
        control.state = AccountState::Shutdown;
        errors
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("subaccount", &self.subaccount)
            .field("subchains", &self.subchains.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Every account of a wallet, sharing one node, database and hook set.
pub struct Accounts {
    config: Arc<SyncConfig>,
    node: Node,
    db: Arc<dyn WalletDatabase>,
    hooks: Arc<dyn WalletHooks>,
    accounts: RwLock<BTreeMap<SubaccountId, Arc<Account>>>,
    reorg: tokio::sync::Mutex<Option<StateSequence>>,
    sequence: AtomicU64,
}

impl Accounts {
    /// Create an empty set of accounts.
    pub fn new(
        config: SyncConfig,
        node: Node,
        db: Arc<dyn WalletDatabase>,
        hooks: Arc<dyn WalletHooks>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            node,
            db,
            hooks,
            accounts: RwLock::new(BTreeMap::new()),
            reorg: tokio::sync::Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    /// Configuration shared by every subchain.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Start tracking `subaccount` on `subchains`.
    pub async fn add_subaccount(
        &self,
        subaccount: SubaccountId,
        subchains: &[Subchain],
    ) -> anyhow::Result<Arc<Account>> {
        // holding the reorg lock keeps a new account from missing a freeze
        let reorg = self.reorg.lock().await;
        if reorg.is_some() {
            return Err(SyncError::InvalidState {
                operation: "add_subaccount",
                state: "reorg",
            }
            .into());
        }
        if self.accounts.read().contains_key(&subaccount) {
            return Err(SyncError::DuplicateSubaccount(subaccount).into());
        }
        let account = Arc::new(
            Account::start(
                subaccount,
                subchains,
                self.config.clone(),
                self.node.clone(),
                self.db.clone(),
                self.hooks.clone(),
            )
            .await
            .with_context(|| format!("start subaccount {subaccount}"))?,
        );
        self.accounts.write().insert(subaccount, account.clone());
        drop(reorg);
        Ok(account)
    }

    /// The account of `subaccount`.
    pub fn account(&self, subaccount: &SubaccountId) -> Option<Arc<Account>> {
        self.accounts.read().get(subaccount).cloned()
    }

    /// The subchain `subchain` of `subaccount`.
    pub fn subchain(&self, subaccount: &SubaccountId, subchain: Subchain) -> Option<Arc<SubchainStateData>> {
        self.account(subaccount)?.subchain(subchain)
    }

    fn require(&self, subaccount: &SubaccountId, subchain: Subchain) -> Result<Arc<SubchainStateData>, SyncError> {
        let account = self
            .account(subaccount)
            .ok_or(SyncError::UnknownSubaccount(*subaccount))?;
        account.subchain(subchain).ok_or_else(|| {
            SyncError::UnknownSubchain(SubchainId::new(*subaccount, subchain, self.config.filter_type))
        })
    }

    fn all(&self) -> Vec<Arc<Account>> {
        self.accounts.read().values().cloned().collect()
    }

    /// Index new keys on one subchain.
    pub fn add_keys(
        &self,
        subaccount: &SubaccountId,
        subchain: Subchain,
        keys: Vec<(ElementIndex, PublicKey)>,
    ) -> Result<(), SyncError> {
        self.require(subaccount, subchain)?.add_keys(keys)
    }

    /// Index raw patterns on one subchain.
    pub fn add_patterns(
        &self,
        subaccount: &SubaccountId,
        subchain: Subchain,
        patterns: Vec<(ElementIndex, Vec<u8>)>,
    ) -> Result<(), SyncError> {
        self.require(subaccount, subchain)?.add_patterns(patterns)
    }

    /// Re-test one subchain from `from`.
    pub fn rescan(&self, subaccount: &SubaccountId, subchain: Subchain, from: Position) -> Result<(), SyncError> {
        self.require(subaccount, subchain)?.rescan(from)
    }

    /// Hand an unconfirmed transaction to every subchain.
    pub fn mempool_transaction(&self, tx: &Transaction) {
        for account in self.all() {
            for subchain in account.subchains() {
                if let Err(e) = subchain.process_transaction(tx.clone()) {
                    tracing::debug!(subchain = %subchain.id(), "mempool transaction dropped: {e}");
                }
            }
        }
    }

    /// A fresh reorg id.
    pub fn next_reorg_id(&self) -> StateSequence {
        StateSequence(self.sequence.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Freeze every account for reorg `id`.
    pub async fn prepare_reorg(&self, id: StateSequence) -> anyhow::Result<()> {
        let mut reorg = self.reorg.lock().await;
        match *reorg {
            Some(current) if current == id => return Ok(()),
            Some(current) => {
                anyhow::bail!("reorg {id} requested while reorg {current} is in progress")
            }
            None => {}
        }
        *reorg = Some(id);
        let accounts = self.all();
        let results = join_all(accounts.iter().map(|a| a.prepare_reorg(id))).await;
        let mut acks = AckCounter::new(accounts.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(()) => acks.ack(),
                Err(e) => {
                    tracing::error!(reorg = %id, "{e:#}");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        debug_assert!(acks.is_complete());
        tracing::info!(reorg = %id, accounts = accounts.len(), "all accounts frozen");
        Ok(())
    }

    /// Rewind every account to `ancestor`; returns the number of errors.
    pub async fn process_reorg(&self, ancestor: Position) -> usize {
        let accounts = self.all();
        let counts = join_all(accounts.iter().map(|a| async move {
            let mut local = 0;
            a.process_reorg(&mut local, ancestor).await;
            local
        }))
        .await;
        counts.into_iter().sum()
    }

    /// Unfreeze every account after reorg `id`.
    pub async fn finish_reorg(&self, id: StateSequence) -> anyhow::Result<()> {
        let mut reorg = self.reorg.lock().await;
        if *reorg != Some(id) {
            anyhow::bail!("finish_reorg {id} does not match the reorg in progress ({reorg:?})");
        }
        let accounts = self.all();
        let results = join_all(accounts.iter().map(|a| a.finish_reorg(id))).await;
        *reorg = None;
        let mut acks = AckCounter::new(accounts.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(()) => acks.ack(),
                Err(e) => {
                    tracing::error!(reorg = %id, "{e:#}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                debug_assert!(acks.is_complete());
                Ok(())
            }
        }
    }

    /// Run a whole reorg to `ancestor`: freeze, rewind, resume. Returns the
    /// number of rewind errors.
    pub async fn reorg(&self, ancestor: Position) -> anyhow::Result<usize> {
        let id = self.next_reorg_id();
        tracing::info!(reorg = %id, %ancestor, "reorg");
        if let Err(e) = self.prepare_reorg(id).await {
            // release whatever did freeze
            if let Err(release) = self.finish_reorg(id).await {
                tracing::warn!(reorg = %id, "release after failed freeze: {release:#}");
            }
            return Err(e);
        }
        let errors = self.process_reorg(ancestor).await;
        self.finish_reorg(id).await?;
        if errors > 0 {
            tracing::error!(reorg = %id, errors, "reorg incomplete");
        }
        Ok(errors)
    }

    /// Stop every account. Returns the number of errors.
    pub async fn shutdown(&self) -> usize {
        let accounts = self.all();
        let errors = join_all(accounts.iter().map(|a| a.shutdown()))
            .await
            .into_iter()
            .sum();
        *self.reorg.lock().await = None;
        errors
    }
}

impl std::fmt::Debug for Accounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accounts")
            .field("accounts", &self.accounts.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
