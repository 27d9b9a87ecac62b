mod common;

use std::{sync::Arc, time::Duration};

use common::*;
use niebla_sync::{prelude::*, SubchainState, SyncError};

#[test]
fn subaccount_ids_parse_from_hex() {
    let id: SubaccountId = "ab".repeat(32).parse().unwrap();
    assert_eq!(id, SubaccountId([0xab; 32]));
    assert_eq!(id.to_string(), "ab".repeat(32));
    assert!("abcd".parse::<SubaccountId>().is_err());
    assert!("zz".repeat(32).parse::<SubaccountId>().is_err());
}

#[test]
fn config_builders_override_defaults() {
    let config = SyncConfig::new(bitcoin::Network::Regtest)
        .with_birth_height(100)
        .with_maximum_scan(50)
        .with_scan_threshold(10)
        .with_intervals(Duration::from_millis(1), Duration::from_millis(2))
        .with_watchdog(Duration::from_secs(1), Duration::from_secs(3))
        .with_max_threads(3)
        .with_filter_type(FilterType::Es);
    assert_eq!(config.birth_height, 100);
    assert_eq!(config.maximum_scan, 50);
    assert_eq!(config.scan_threshold, 10);
    assert_eq!(config.tick_interval, Duration::from_millis(1));
    assert_eq!(config.poll_interval, Duration::from_millis(2));
    assert_eq!(config.watchdog_timeout, Duration::from_secs(3));
    assert_eq!(config.hardware_concurrency(), 3);
    assert_eq!(config.filter_type, FilterType::Es);
    assert_eq!(config.download_limit(), 2 * config.chain.block_download_batch);
}

#[tokio::test]
async fn accounts_reject_unknown_and_duplicate_subaccounts() -> anyhow::Result<()> {
    let chain = MockChain::new(3);
    let accounts = Accounts::new(
        test_config(),
        chain.node(),
        Arc::new(MemDb::default()),
        Arc::new(RecordingHooks::default()),
    );
    let sub = subaccount(20);

    assert!(matches!(
        accounts.add_keys(&sub, Subchain::External, vec![(0, wallet_key(20))]),
        Err(SyncError::UnknownSubaccount(id)) if id == sub
    ));

    accounts.add_subaccount(sub, &[Subchain::External]).await?;
    let err = accounts
        .add_subaccount(sub, &[Subchain::Internal])
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::DuplicateSubaccount(_))
    ));
    assert!(matches!(
        accounts.add_patterns(&sub, Subchain::Incoming, vec![(0, vec![0u8; 20])]),
        Err(SyncError::UnknownSubchain(_))
    ));
    assert!(accounts.subchain(&sub, Subchain::Internal).is_none());

    let subchain = accounts.subchain(&sub, Subchain::External).expect("started");
    assert_eq!(subchain.state().await, SubchainState::Normal);
    assert_eq!(accounts.shutdown().await, 0);
    assert_eq!(subchain.state().await, SubchainState::Shutdown);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_wallet_idles_at_its_birth() -> anyhow::Result<()> {
    let chain = MockChain::new(12);
    let hooks = Arc::new(RecordingHooks::default());
    let accounts = Accounts::new(
        test_config().with_birth_height(5),
        chain.node(),
        Arc::new(MemDb::default()),
        hooks.clone(),
    );
    let sub = subaccount(21);
    accounts.add_subaccount(sub, &[Subchain::External]).await?;
    let subchain = accounts.subchain(&sub, Subchain::External).expect("started");

    let birth = chain.position(4);
    assert_eq!(subchain.last_scanned(), birth);
    wait_for("filter tip", || subchain.filter_tip() == Some(chain.tip())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subchain.last_scanned(), birth, "nothing to scan for");
    assert!(hooks.block_matches().is_empty());

    // raw 20-byte pattern, no key needed
    accounts.add_patterns(&sub, Subchain::External, vec![(0, vec![7u8; 20])])?;
    wait_for("scan to tip", || subchain.last_scanned() == Some(chain.tip())).await;
    assert!(hooks.block_matches().is_empty());

    accounts.shutdown().await;
    Ok(())
}
