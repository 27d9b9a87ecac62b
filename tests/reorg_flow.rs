mod common;

use std::sync::Arc;

use common::*;
use niebla_sync::{prelude::*, AccountState, StateSequence, SubchainState, SyncError};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reorg_rewinds_caches_and_queues_then_catches_up() {
    let chain = MockChain::new(89);
    let key = wallet_key(10);
    let funding = spend(chain.coinbase_outpoint(1), vec![p2wpkh(&key)]);
    let old_hit = chain.mine(vec![funding]);
    let old_tip = chain.mine_empty(10);
    assert_eq!(old_tip.height, 100);
    chain.set_downloads(false);

    let db = Arc::new(MemDb::default());
    let hooks = Arc::new(RecordingHooks::default());
    let accounts = Accounts::new(test_config(), chain.node(), db.clone(), hooks.clone());
    let sub = subaccount(10);
    let account = accounts.add_subaccount(sub, &[Subchain::External]).await.unwrap();
    accounts.add_keys(&sub, Subchain::External, vec![(0, key)]).unwrap();
    let subchain = accounts.subchain(&sub, Subchain::External).unwrap();

    wait_for("scan to height 100", || subchain.last_scanned() == Some(old_tip)).await;
    wait_for("hit queued for download", || subchain.pending_blocks().contains(&old_hit)).await;
    assert!(subchain.highest_cached().is_some_and(|p| p.height > 80));

    // competing branch from 80 that pays a second key at 95
    chain.rewind(80);
    let ancestor = chain.position(80).unwrap();
    let key2 = wallet_key(11);
    let funding2 = spend(chain.coinbase_outpoint(2), vec![p2wpkh(&key2)]);
    chain.mine_empty(14);
    let new_hit = chain.mine(vec![funding2]);
    let new_tip = chain.mine_empty(10);

    let id = accounts.next_reorg_id();
    accounts.prepare_reorg(id).await.unwrap();
    assert_eq!(account.state().await, AccountState::Reorg);
    assert_eq!(subchain.state().await, SubchainState::Reorg);

    // queued while frozen, replayed once the reorg ends
    accounts.add_keys(&sub, Subchain::External, vec![(1, key2)]).unwrap();

    let errors = accounts.process_reorg(ancestor).await;
    assert_eq!(errors, 0);
    assert_eq!(subchain.last_scanned(), Some(ancestor));
    assert!(subchain.highest_cached().map_or(true, |p| p.height <= 80));
    assert!(subchain.pending_blocks().iter().all(|p| p.height <= 80));
    assert!(subchain.dirty_positions().iter().all(|p| p.height <= 80));
    assert!(subchain.progress().is_some_and(|p| p.height <= 80));
    assert!(subchain.rescan_position().map_or(true, |p| p.height <= 80));
    assert_eq!(subchain.element_count(), 4, "second key must wait for the reorg to end");
    assert!(db.reorgs().contains(&(subchain.id(), ancestor)));

    accounts.finish_reorg(id).await.unwrap();
    assert_eq!(subchain.state().await, SubchainState::Normal);
    chain.set_downloads(true);

    wait_for("second key indexed", || subchain.element_count() >= 8).await;
    wait_for("scan to the new tip", || subchain.last_scanned() == Some(new_tip)).await;
    wait_for("match on the new branch", || {
        hooks.block_matches().iter().any(|(_, p, _)| *p == new_hit)
    })
    .await;
    wait_for("progress to the new tip", || subchain.progress() == Some(new_tip)).await;

    assert!(
        hooks.block_matches().iter().all(|(_, p, _)| *p != old_hit),
        "the orphaned block must never be reported"
    );
    assert_eq!(db.last_scanned(&subchain.id()), Some(new_tip));
    assert_eq!(accounts.shutdown().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn whole_reorg_in_one_call() {
    let chain = MockChain::new(20);
    let db = Arc::new(MemDb::default());
    let hooks = Arc::new(RecordingHooks::default());
    let accounts = Accounts::new(test_config(), chain.node(), db.clone(), hooks);
    let sub = subaccount(11);
    accounts
        .add_subaccount(sub, &[Subchain::External, Subchain::Internal])
        .await
        .unwrap();
    accounts
        .add_keys(&sub, Subchain::Internal, vec![(0, wallet_key(12))])
        .unwrap();
    let internal = accounts.subchain(&sub, Subchain::Internal).unwrap();
    wait_for("scan to tip", || internal.last_scanned() == Some(chain.tip())).await;

    chain.rewind(15);
    let ancestor = chain.position(15).unwrap();
    let tip = chain.mine_empty(8);

    assert_eq!(accounts.reorg(ancestor).await.unwrap(), 0);
    let reorgs = db.reorgs();
    assert_eq!(reorgs.len(), 2, "every subchain rewinds its database");
    assert!(reorgs.iter().all(|(_, p)| *p == ancestor));

    wait_for("scan to the new tip", || internal.last_scanned() == Some(tip)).await;
    accounts.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_reorg_ids_are_acknowledged_without_effect() {
    let chain = MockChain::new(10);
    let accounts = Accounts::new(
        test_config(),
        chain.node(),
        Arc::new(MemDb::default()),
        Arc::new(RecordingHooks::default()),
    );
    let sub = subaccount(12);
    let account = accounts.add_subaccount(sub, &[Subchain::External]).await.unwrap();
    let subchain = accounts.subchain(&sub, Subchain::External).unwrap();

    let id = accounts.next_reorg_id();
    accounts.prepare_reorg(id).await.unwrap();
    accounts.prepare_reorg(id).await.unwrap();
    account.prepare_reorg(id).await.unwrap();
    subchain.prepare_reorg(id).await.unwrap();
    assert_eq!(subchain.state().await, SubchainState::Reorg);

    let other = accounts.next_reorg_id();
    assert_ne!(id, other);
    assert!(accounts.prepare_reorg(other).await.is_err());
    assert!(!subchain.change_state(SubchainState::Normal, Some(other)).await);

    let block = bitcoin::Block {
        header: bitcoin::block::Header {
            version: bitcoin::block::Version::ONE,
            prev_blockhash: chain.position(9).unwrap().hash,
            merkle_root: bitcoin::hashes::Hash::all_zeros(),
            time: 0,
            bits: bitcoin::CompactTarget::from_consensus(0x207f_ffff),
            nonce: 0,
        },
        txdata: Vec::new(),
    };
    let err = subchain
        .process_block(chain.tip(), &block)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::InvalidState { operation: "process_block", .. })
    ));

    accounts.finish_reorg(id).await.unwrap();
    assert_eq!(subchain.state().await, SubchainState::Normal);

    // replays of the finished reorg change nothing
    subchain.finish_reorg(id).await.unwrap();
    subchain.prepare_reorg(id).await.unwrap();
    account.prepare_reorg(id).await.unwrap();
    assert_eq!(subchain.state().await, SubchainState::Normal);
    assert_eq!(account.state().await, AccountState::Normal);

    // a fresh id goes through the state machine
    assert!(subchain.change_state(SubchainState::Reorg, Some(StateSequence(100))).await);
    assert_eq!(subchain.state().await, SubchainState::Reorg);
    assert!(subchain.change_state(SubchainState::Normal, Some(StateSequence(100))).await);
    assert_eq!(subchain.state().await, SubchainState::Normal);
    accounts.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_reorg_aborts_it() {
    let chain = MockChain::new(5);
    let accounts = Accounts::new(
        test_config(),
        chain.node(),
        Arc::new(MemDb::default()),
        Arc::new(RecordingHooks::default()),
    );
    let sub = subaccount(13);
    accounts
        .add_subaccount(sub, &[Subchain::External, Subchain::Internal])
        .await
        .unwrap();
    let subchain = accounts.subchain(&sub, Subchain::External).unwrap();

    let id = accounts.next_reorg_id();
    accounts.prepare_reorg(id).await.unwrap();
    accounts
        .add_keys(&sub, Subchain::External, vec![(0, wallet_key(13))])
        .unwrap();

    assert_eq!(accounts.shutdown().await, 2, "one aborted reorg per subchain");
    assert_eq!(subchain.state().await, SubchainState::Shutdown);
    assert_eq!(subchain.element_count(), 0, "deferred work is dropped");
    assert!(matches!(
        accounts.add_keys(&sub, Subchain::External, vec![(1, wallet_key(14))]),
        Err(SyncError::Shutdown(_))
    ));
    assert_eq!(subchain.shutdown().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_rewinds_a_stale_watermark() {
    let chain = MockChain::new(30);
    let stale = chain.position(25).unwrap();
    chain.rewind(20);
    let ancestor = chain.position(20).unwrap();
    chain.mine_empty(15);

    let config = test_config();
    let sub = subaccount(14);
    let id = SubchainId::new(sub, Subchain::External, config.filter_type);
    let db = Arc::new(MemDb::default());
    db.set_subchain_last_scanned(&id, stale).await.unwrap();

    let accounts = Accounts::new(config, chain.node(), db.clone(), Arc::new(RecordingHooks::default()));
    accounts.add_subaccount(sub, &[Subchain::External]).await.unwrap();
    let subchain = accounts.subchain(&sub, Subchain::External).unwrap();

    assert_eq!(subchain.last_scanned(), Some(ancestor));
    assert_eq!(subchain.progress(), Some(ancestor));
    assert_eq!(db.reorgs(), vec![(id, ancestor)]);
    assert_eq!(db.last_scanned(&id), Some(ancestor));
    accounts.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_freeze_releases_the_frozen_subchains() {
    let chain = MockChain::new(10);
    let accounts = Accounts::new(
        test_config(),
        chain.node(),
        Arc::new(MemDb::default()),
        Arc::new(RecordingHooks::default()),
    );
    let sub = subaccount(15);
    let account = accounts
        .add_subaccount(sub, &[Subchain::External, Subchain::Internal])
        .await
        .unwrap();
    accounts
        .add_keys(&sub, Subchain::External, vec![(0, wallet_key(15))])
        .unwrap();
    let external = accounts.subchain(&sub, Subchain::External).unwrap();
    let internal = accounts.subchain(&sub, Subchain::Internal).unwrap();
    internal.shutdown().await;

    let err = accounts.reorg(chain.position(5).unwrap()).await.unwrap_err();
    assert!(format!("{err:#}").contains("failed to freeze"), "{err:#}");
    assert_eq!(external.state().await, SubchainState::Normal);
    assert_eq!(account.state().await, AccountState::Normal);

    // the reorg slot is free again
    let err = accounts.reorg(chain.position(5).unwrap()).await.unwrap_err();
    assert!(!format!("{err:#}").contains("in progress"), "{err:#}");

    let tip = chain.mine_empty(3);
    wait_for("scan to resume", || external.last_scanned() == Some(tip)).await;
    accounts.shutdown().await;
}
