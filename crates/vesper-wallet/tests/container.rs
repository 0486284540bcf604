//! Container backend: file format, persistence, and detection scenarios.

use std::fs;

use tempfile::TempDir;

use vesper_crypto::{derive_public_key, generate_key_derivation, random_keypair, SECRET_KEY_ZERO};
use vesper_wallet::{
    wallet_file_size, AccountAddress, Network, OutputKey, Wallet, WalletContainer, WalletError,
};

fn wallet_path(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

#[test]
fn test_create_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");

    let wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    assert_eq!(wallet.records().len(), 1);
    assert!(!wallet.is_view_only());
    assert!(wallet.can_view_outgoing_addresses());
    let first_address = wallet.get_first_address();
    assert!(wallet.is_our_address(&first_address));
    let cache_name = wallet.get_cache_name();
    assert_eq!(cache_name.len(), 64);
    drop(wallet);

    let reopened = WalletContainer::open(Network::Main, &path, "pw").unwrap();
    assert_eq!(reopened.get_first_address(), first_address);
    assert_eq!(reopened.get_cache_name(), cache_name);
    assert_eq!(
        fs::metadata(&path).unwrap().len(),
        wallet_file_size(1) as u64
    );
}

#[test]
fn test_bad_password() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();

    let err = WalletContainer::open(Network::Main, &path, "px").unwrap_err();
    assert!(matches!(err, WalletError::Decrypt(_)));
    assert_eq!(err.code(), 207);
}

#[test]
fn test_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    assert!(WalletContainer::create(Network::Main, &path, "pw", "", 0).is_err());
}

#[test]
fn test_unknown_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    let mut data = fs::read(&path).unwrap();
    data[0] = 7;
    fs::write(&path, &data).unwrap();

    let err = WalletContainer::open(Network::Main, &path, "pw").unwrap_err();
    assert_eq!(err.code(), 206);
}

#[test]
fn test_import_keys_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    let keys = wallet.export_keys().unwrap();
    assert_eq!(keys.len(), 256);
    let first_address = wallet.get_first_address();

    let path2 = wallet_path(&dir, "w2");
    let imported = WalletContainer::create(Network::Main, &path2, "other-pw", &keys, 0).unwrap();
    assert_eq!(imported.get_first_address(), first_address);
    assert!(!imported.is_view_only());
    assert_eq!(imported.get_oldest_timestamp(), 0);
}

#[test]
fn test_import_tracking_wallet() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    let keys = wallet.export_keys().unwrap();

    // Zero out the spend secret: a tracking wallet can watch but not spend.
    let tracking_keys = format!("{}{}{}", &keys[..128], "0".repeat(64), &keys[192..]);
    let path2 = wallet_path(&dir, "w2");
    let mut tracking =
        WalletContainer::create(Network::Main, &path2, "pw", &tracking_keys, 0).unwrap();
    assert!(tracking.is_view_only());
    assert!(!tracking.can_view_outgoing_addresses());
    assert_eq!(tracking.get_first_address(), wallet.get_first_address());
    assert!(tracking.get_cache_name().ends_with("-view-only"));

    let mut rescan = false;
    let err = tracking
        .generate_new_addresses(&[SECRET_KEY_ZERO], 0, 0, &mut rescan)
        .unwrap_err();
    assert_eq!(err.code(), 101);
}

#[test]
fn test_import_rejects_bad_hex() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let err = WalletContainer::create(Network::Main, &path, "pw", "zz", 0).unwrap_err();
    assert_eq!(err.code(), 207);
}

#[test]
fn test_generate_batch() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let mut wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    assert_eq!(wallet.records().len(), 1);

    let mut rescan = false;
    let new_records = wallet
        .generate_new_addresses(&[SECRET_KEY_ZERO; 3], 1000, 2000, &mut rescan)
        .unwrap();
    assert!(!rescan);
    assert_eq!(new_records.len(), 3);
    for record in &new_records {
        assert_eq!(record.creation_timestamp, 2000);
        assert_ne!(record.spend_secret_key, SECRET_KEY_ZERO);
    }
    assert_eq!(
        fs::metadata(&path).unwrap().len(),
        wallet_file_size(4) as u64
    );
    drop(wallet);

    let reopened = WalletContainer::open(Network::Main, &path, "pw").unwrap();
    assert_eq!(reopened.records().len(), 4);
    for (i, record) in reopened.records().iter().enumerate() {
        assert_eq!(reopened.record_index(&record.spend_public_key), Some(i));
    }
}

#[test]
fn test_generate_import_lowers_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let mut wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();

    let mut rescan = false;
    let pair = random_keypair();
    let added = wallet
        .generate_new_addresses(&[pair.secret_key], 5000, 6000, &mut rescan)
        .unwrap();
    assert!(!rescan);
    assert_eq!(added[0].spend_public_key, pair.public_key);
    assert_eq!(added[0].creation_timestamp, 5000);

    // Importing the same key again with a lower timestamp rewrites the file.
    let again = wallet
        .generate_new_addresses(&[pair.secret_key], 1000, 6000, &mut rescan)
        .unwrap();
    assert!(rescan);
    assert_eq!(again[0].creation_timestamp, 1000);
    drop(wallet);

    let reopened = WalletContainer::open(Network::Main, &path, "pw").unwrap();
    let index = reopened.record_index(&pair.public_key).unwrap();
    assert_eq!(reopened.records()[index].creation_timestamp, 1000);
}

#[test]
fn test_set_password() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let mut wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    let first_address = wallet.get_first_address();
    wallet.set_password("new-pw").unwrap();
    drop(wallet);

    assert!(WalletContainer::open(Network::Main, &path, "pw").is_err());
    let reopened = WalletContainer::open(Network::Main, &path, "new-pw").unwrap();
    assert_eq!(reopened.get_first_address(), first_address);
    // The temp file must not linger after a successful save.
    assert!(!std::path::Path::new(&format!("{path}.tmp")).exists());
}

#[test]
fn test_stale_tmp_does_not_break_wallet() {
    // A crash between writing <path>.tmp and the rename leaves the original
    // readable; a later open must not be confused by the leftover.
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    let first_address = wallet.get_first_address();
    drop(wallet);

    fs::write(format!("{path}.tmp"), b"half-written garbage").unwrap();
    let reopened = WalletContainer::open(Network::Main, &path, "pw").unwrap();
    assert_eq!(reopened.get_first_address(), first_address);
}

#[test]
fn test_truncates_overlong_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();

    let mut data = fs::read(&path).unwrap();
    data.extend_from_slice(&[0u8; 333]); // legacy cache overhang
    fs::write(&path, &data).unwrap();

    let wallet = WalletContainer::open(Network::Main, &path, "pw").unwrap();
    assert_eq!(wallet.records().len(), 1);
    drop(wallet);
    assert_eq!(
        fs::metadata(&path).unwrap().len(),
        wallet_file_size(1) as u64
    );
}

#[test]
fn test_export_view_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();

    let export_path = wallet_path(&dir, "view");
    wallet.export_wallet(&export_path, "view-pw", true, false).unwrap();

    let view = WalletContainer::open(Network::Main, &export_path, "view-pw").unwrap();
    assert!(view.is_view_only());
    assert_eq!(view.get_view_public_key(), wallet.get_view_public_key());
    assert_eq!(view.get_first_address(), wallet.get_first_address());
}

#[test]
fn test_set_label_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let mut wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    let err = wallet.set_label("addr".into(), "label".into()).unwrap_err();
    assert_eq!(err.code(), 101);
    assert_eq!(wallet.get_label("addr"), "");
}

#[test]
fn test_history_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let mut wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();

    let tid = [7u8; 32];
    let mut used = vesper_wallet::History::new();
    used.insert(wallet.get_first_address());
    used.insert(AccountAddress::Simple {
        spend_public_key: random_keypair().public_key,
        view_public_key: random_keypair().public_key,
    });
    assert!(wallet.save_history(&tid, &used).unwrap());
    assert_eq!(wallet.load_history(&tid), used);

    // Unknown tid loads as empty.
    assert!(wallet.load_history(&[8u8; 32]).is_empty());
}

#[test]
fn test_payment_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let mut wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();

    assert!(wallet.payment_queue_get().unwrap().is_empty());
    wallet.payment_queue_add(&[1u8; 32], b"tx-one").unwrap();
    wallet.payment_queue_add(&[2u8; 32], b"tx-two").unwrap();
    let mut blobs = wallet.payment_queue_get().unwrap();
    blobs.sort();
    assert_eq!(blobs, vec![b"tx-one".to_vec(), b"tx-two".to_vec()]);

    wallet.payment_queue_remove(&[1u8; 32]).unwrap();
    assert_eq!(wallet.payment_queue_get().unwrap(), vec![b"tx-two".to_vec()]);
    wallet.payment_queue_remove(&[2u8; 32]).unwrap();
    assert!(wallet.payment_queue_get().unwrap().is_empty());
}

#[test]
fn test_net_suffix_on_folders() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let mut wallet = WalletContainer::create(Network::Test, &path, "pw", "", 0).unwrap();
    wallet.payment_queue_add(&[1u8; 32], b"tx").unwrap();
    assert!(std::path::Path::new(&format!("{path}.payments_testnet")).exists());
}

#[test]
fn test_on_first_output_found() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    let keys = wallet.export_keys().unwrap();

    // An imported wallet with ct=0 has an unknown oldest timestamp.
    let path2 = wallet_path(&dir, "w2");
    let mut imported = WalletContainer::create(Network::Main, &path2, "pw", &keys, 0).unwrap();
    assert_eq!(imported.get_oldest_timestamp(), 0);
    imported.on_first_output_found(123_456).unwrap();
    assert_eq!(imported.get_oldest_timestamp(), 123_456);
    drop(imported);

    let reopened = WalletContainer::open(Network::Main, &path2, "pw").unwrap();
    assert_eq!(reopened.get_oldest_timestamp(), 123_456);
    assert_eq!(reopened.records()[0].creation_timestamp, 123_456);
}

#[test]
fn test_detect_our_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let mut wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    let spend_public = wallet.records()[0].spend_public_key;
    let view_public = *wallet.get_view_public_key();

    // Sender derives the one-time output key for our address.
    let tx_key = random_keypair();
    let kd_sender = generate_key_derivation(&view_public, &tx_key.secret_key).unwrap();
    let out_index = 2usize;
    let output = OutputKey {
        amount: 9_000_000,
        public_key: derive_public_key(&kd_sender, out_index, &spend_public).unwrap(),
        ..Default::default()
    };

    let handler = wallet.get_output_handler();
    let mut kd_cache = None;
    let tx_inputs_hash = [0u8; 32];
    let (candidate, secret_scalar) =
        handler(&tx_key.public_key, &mut kd_cache, &tx_inputs_hash, out_index, &output);
    assert_eq!(candidate, spend_public);

    let found = wallet
        .detect_our_output(
            &[0u8; 32],
            &tx_inputs_hash,
            &kd_cache,
            out_index,
            &candidate,
            &secret_scalar,
            &output,
        )
        .unwrap()
        .expect("output must be detected");
    assert_eq!(found.amount, 9_000_000);
    assert_eq!(found.address, wallet.get_first_address());
    assert_eq!(found.output_keypair.public_key, output.public_key);
    assert!(vesper_crypto::keys_match(
        &found.output_keypair.secret_key,
        &output.public_key
    ));
}

#[test]
fn test_detect_foreign_output_misses() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let mut wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();

    // An output derived for somebody else's keys.
    let other_view = random_keypair();
    let other_spend = random_keypair();
    let tx_key = random_keypair();
    let kd = generate_key_derivation(&other_view.public_key, &tx_key.secret_key).unwrap();
    let output = OutputKey {
        amount: 1,
        public_key: derive_public_key(&kd, 0, &other_spend.public_key).unwrap(),
        ..Default::default()
    };

    let handler = wallet.get_output_handler();
    let mut kd_cache = None;
    let (candidate, secret_scalar) =
        handler(&tx_key.public_key, &mut kd_cache, &[0u8; 32], 0, &output);
    let found = wallet
        .detect_our_output(
            &[0u8; 32],
            &[0u8; 32],
            &kd_cache,
            0,
            &candidate,
            &secret_scalar,
            &output,
        )
        .unwrap();
    assert!(found.is_none());
}

#[test]
fn test_backup() {
    let dir = tempfile::tempdir().unwrap();
    let path = wallet_path(&dir, "w");
    let mut wallet = WalletContainer::create(Network::Main, &path, "pw", "", 0).unwrap();
    wallet.payment_queue_add(&[3u8; 32], b"queued-tx").unwrap();

    let dst = wallet_path(&dir, "backup");
    wallet.backup(&dst, "backup-pw").unwrap();

    let restored = WalletContainer::open(Network::Main, &dst, "backup-pw").unwrap();
    assert_eq!(restored.get_first_address(), wallet.get_first_address());
    assert!(std::path::Path::new(&format!("{dst}.payments")).exists());
}
