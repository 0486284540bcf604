//! Hierarchical-deterministic backend over an encrypted SQLite database.
//!
//! Four tables: `unencrypted` (the KDF salt only), `parameters`, `labels`
//! and `payment_queue`. Every encrypted column uses the same iv-keyed
//! ChaCha20 scheme with power-of-two length padding; hashed primary keys are
//! deterministic lookup tokens that never expose the logical key. The
//! connection runs one long-lived transaction, committed and re-begun at
//! every logical save boundary.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use zeroize::Zeroize;

use vesper_crypto::unlinkable::{
    generate_address_s_v, generate_hd_spendkeys, unlinkable_derive_secret_key,
    unlinkable_underive_public_key,
};
use vesper_crypto::{
    chacha20, cn_fast_hash, hash_to_scalar, key_isvalid, random_bytes, secret_key_to_public_key,
    slow_hash, ChachaKey, Hash, KeyDerivation, KeyPair, PublicKey, SecretKey, SECRET_KEY_ZERO,
};

use crate::error::{Result, WalletError};
use crate::types::{
    AccountAddress, BinaryBlob, History, Network, OurOutput, OutputKey, Tid, Timestamp,
    WalletRecord, ADDRESS_TYPE_UNLINKABLE, ADDRESS_TYPE_UNLINKABLE_AUDITABLE, COIN_NAME,
    TIMESTAMP_MAX, WALLET_VERSION,
};
use crate::wallet::{derive_from_key, derive_from_seed, OutputHandler, Wallet};

/// Records kept materialized beyond `used_address_count` so the scanner can
/// recognize receipts to addresses the user has not yet handed out.
pub const GENERATE_AHEAD: usize = 20000;

/// Below this many missing records single-threaded generation is faster than
/// spinning up workers.
const GENERATE_AHEAD_THREAD_MIN: usize = 1000;

const ADDRESS_COUNT_PREFIX: &str = "total_address_count";
const CREATION_TIMESTAMP_PREFIX: &str = "creation_timestamp";

const SCHEMA_DDL: &str = "
CREATE TABLE unencrypted(key BLOB PRIMARY KEY COLLATE BINARY NOT NULL, value BLOB NOT NULL) WITHOUT ROWID;
CREATE TABLE parameters(key_hash BLOB PRIMARY KEY COLLATE BINARY NOT NULL, key BLOB NOT NULL, value BLOB NOT NULL) WITHOUT ROWID;
CREATE TABLE labels(address_hash BLOB PRIMARY KEY NOT NULL, address BLOB NOT NULL, label BLOB NOT NULL) WITHOUT ROWID;
CREATE TABLE payment_queue(tid_hash BLOB COLLATE BINARY NOT NULL, net_hash BLOB COLLATE BINARY NOT NULL, tid BLOB NOT NULL, net BLOB NOT NULL, binary_transaction BLOB NOT NULL, PRIMARY KEY (tid_hash, net_hash)) WITHOUT ROWID;
";

/// Normalize a BIP-39 English mnemonic, rejecting checksum/wordlist failures.
pub fn check_bip39_mnemonic(mnemonic: &str) -> Result<String> {
    let parsed = bip39::Mnemonic::parse_in(bip39::Language::English, mnemonic)
        .map_err(|e| WalletError::MnemonicCrc(e.to_string()))?;
    Ok(parsed.to_string())
}

// ─── Encrypted value format ─────────────────────────────────────────────────

/// iv(32) || chacha20(len(4 LE) || plaintext || zero padding), where the
/// padded length rounds the whole value up to the next power of two >= 256.
/// The per-row key mixes the iv into the wallet key, so the fixed zero nonce
/// never repeats a keystream; the padding hides value sizes.
fn encrypt_data(wallet_key: &ChachaKey, data: &[u8]) -> Vec<u8> {
    const MIN_SIZE: usize = 256;
    const EXTRA_SIZE: usize = 32 + 4; // iv, actual size in le
    let mut actual_size = 1usize;
    while actual_size < data.len() + EXTRA_SIZE || actual_size < MIN_SIZE {
        actual_size *= 2;
    }
    let mut large_data = vec![0u8; actual_size - 32];
    large_data[..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
    large_data[4..4 + data.len()].copy_from_slice(data);

    let iv: Hash = random_bytes();
    let mut key_data = Vec::with_capacity(64);
    key_data.extend_from_slice(wallet_key.as_bytes());
    key_data.extend_from_slice(&iv);
    let key = cn_fast_hash(&key_data);
    chacha20(&key, &[0u8; 8], &mut large_data);

    let mut enc_data = Vec::with_capacity(32 + large_data.len());
    enc_data.extend_from_slice(&iv);
    enc_data.extend_from_slice(&large_data);
    enc_data
}

fn decrypt_data(wallet_key: &ChachaKey, value: &[u8]) -> Result<Vec<u8>> {
    if value.len() < 32 + 4 {
        return Err(WalletError::Decrypt("encrypted value is too short".into()));
    }
    let iv = &value[..32];
    let mut result = value[32..].to_vec();
    let mut key_data = Vec::with_capacity(64);
    key_data.extend_from_slice(wallet_key.as_bytes());
    key_data.extend_from_slice(iv);
    let key = cn_fast_hash(&key_data);
    chacha20(&key, &[0u8; 8], &mut result);
    let real_size = u32::from_le_bytes(result[..4].try_into().unwrap()) as usize;
    if real_size > result.len() - 4 {
        return Err(WalletError::Decrypt("corrupt encrypted value padding".into()));
    }
    Ok(result[4..4 + real_size].to_vec())
}

fn parse_u64(value: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| WalletError::Decrypt("corrupt integer parameter".into()))?;
    Ok(u64::from_le_bytes(bytes))
}

fn generate_records(base: &KeyPair, view_seed: &Hash, counter: usize, result: &mut [WalletRecord]) {
    let mut key_result = vec![KeyPair::default(); result.len()];
    generate_hd_spendkeys(base, view_seed, counter, &mut key_result);
    for (record, pair) in result.iter_mut().zip(&key_result) {
        record.spend_public_key = pair.public_key;
        record.spend_secret_key = pair.secret_key;
        // Look-ahead addresses must never trigger a rescan.
        record.creation_timestamp = TIMESTAMP_MAX;
    }
    for pair in &mut key_result {
        pair.secret_key.zeroize();
    }
}

pub struct WalletHd {
    network: Network,
    conn: Connection,
    wallet_key: ChachaKey,
    view_public_key: PublicKey,
    view_secret_key: SecretKey,
    wallet_records: Vec<WalletRecord>,
    records_map: HashMap<PublicKey, usize>,
    oldest_timestamp: Timestamp,
    used_address_count: usize,
    address_type: u8,
    spend_key_base: KeyPair,
    seed: Hash,
    tx_derivation_seed: Hash,
    labels: HashMap<String, String>,
}

impl std::fmt::Debug for WalletHd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletHd")
            .field("network", &self.network)
            .field("used_address_count", &self.used_address_count)
            .field("address_type", &self.address_type)
            .field("records_count", &self.wallet_records.len())
            .finish_non_exhaustive()
    }
}

impl WalletHd {
    /// True when the file carries the SQLite magic; used to dispatch between
    /// the container and HD backends when opening an unknown wallet file.
    pub fn is_sqlite(path: &str) -> bool {
        let mut magic = [0u8; 16];
        match File::open(path) {
            Ok(mut file) => file.read_exact(&mut magic).is_ok() && &magic == b"SQLite format 3\0",
            Err(_) => false,
        }
    }

    fn bare(network: Network, conn: Connection, wallet_key: ChachaKey) -> Self {
        Self {
            network,
            conn,
            wallet_key,
            view_public_key: [0u8; 32],
            view_secret_key: [0u8; 32],
            wallet_records: Vec::new(),
            records_map: HashMap::new(),
            oldest_timestamp: 0,
            used_address_count: 0,
            address_type: 0,
            spend_key_base: KeyPair::default(),
            seed: [0u8; 32],
            tx_derivation_seed: [0u8; 32],
            labels: HashMap::new(),
        }
    }

    /// Open an existing HD wallet database.
    pub fn open(network: Network, path: &str, password: &str, readonly: bool) -> Result<Self> {
        let flags = if readonly {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        let conn = Connection::open_with_flags(path, flags)?;
        let loaded = (|| -> Result<Self> {
            let salt = Self::get_salt(&conn)?;
            let wallet_key = slow_hash(&salt, password.as_bytes());
            conn.execute_batch("BEGIN")?;
            let mut wallet = Self::bare(network, conn, wallet_key);
            wallet.load()?;
            Ok(wallet)
        })();
        match loaded {
            Ok(wallet) => Ok(wallet),
            Err(e @ WalletError::MnemonicCrc(_)) => Err(e),
            Err(_) => Err(WalletError::Decrypt(
                "wallet file invalid or wrong password".into(),
            )),
        }
    }

    /// Create a new HD wallet database.
    ///
    /// An empty `mnemonic` produces a bare parameter store, the target of
    /// `export_wallet` and nothing else.
    pub fn create(
        network: Network,
        path: &str,
        password: &str,
        mnemonic: &str,
        address_type: u8,
        creation_timestamp: Timestamp,
        mnemonic_password: &str,
    ) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            return Err(WalletError::Write(format!(
                "will not overwrite existing wallet {path}"
            )));
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_DDL)?;
        conn.execute_batch("BEGIN")?;
        let salt = random_bytes::<32>().to_vec();
        Self::put_salt(&conn, &salt)?;
        let wallet_key = slow_hash(&salt, password.as_bytes());
        let mut wallet = Self::bare(network, conn, wallet_key);

        if mnemonic.is_empty() {
            return Ok(wallet);
        }
        wallet.put_string("version", WALLET_VERSION, true)?;
        wallet.put_string("coinname", COIN_NAME, true)?;
        wallet.put("address-type", &[address_type], true)?;
        wallet.put_string("mnemonic", &check_bip39_mnemonic(mnemonic)?, true)?;
        // Written even when empty to keep the row count the same.
        wallet.put_string("mnemonic-password", mnemonic_password, true)?;
        wallet.put(ADDRESS_COUNT_PREFIX, &0u64.to_le_bytes(), true)?;

        wallet.on_first_output_found(creation_timestamp)?;

        match wallet.load() {
            Ok(()) => {}
            Err(e @ WalletError::MnemonicCrc(_)) => return Err(e),
            Err(_) => {
                return Err(WalletError::Decrypt(
                    "wallet file invalid or wrong password".into(),
                ))
            }
        }
        wallet.commit()?;
        Ok(wallet)
    }

    fn load(&mut self) -> Result<()> {
        let version = self
            .get_string("version")?
            .unwrap_or_default();
        if version != WALLET_VERSION {
            return Err(WalletError::Decrypt(format!(
                "wallet version unknown - {version}"
            )));
        }
        let coinname = self.get_string("coinname")?.unwrap_or_default();
        if coinname != COIN_NAME {
            return Err(WalletError::Decrypt(format!(
                "wallet is for different coin - {coinname}"
            )));
        }
        let address_type = self
            .get("address-type")?
            .filter(|v| v.len() == 1)
            .ok_or_else(|| WalletError::Decrypt("wallet corrupted, no address type".into()))?;
        self.address_type = address_type[0];
        if self.address_type != ADDRESS_TYPE_UNLINKABLE
            && self.address_type != ADDRESS_TYPE_UNLINKABLE_AUDITABLE
        {
            return Err(WalletError::Decrypt("wallet address type unknown".into()));
        }

        if let Some(mnemonic) = self.get_string("mnemonic")? {
            let mnemonic_password = self.get_string("mnemonic-password")?.ok_or_else(|| {
                WalletError::Decrypt("wallet corrupted, no mnemonic password".into())
            })?;
            let parsed = bip39::Mnemonic::parse_in(bip39::Language::English, &mnemonic)
                .map_err(|e| WalletError::MnemonicCrc(e.to_string()))?;
            let seed64 = parsed.to_seed(&mnemonic_password);
            // Master/child derivation failures signal a wrong mnemonic, the
            // same as a checksum failure.
            let mut key = bip32::XPrv::new(seed64)
                .map_err(|e| WalletError::MnemonicCrc(format!("bip32 master key: {e}")))?;
            // Hardened chain m/44'/768'/address_type'/0/0.
            let chain = [
                (44, true),
                (768, true),
                (self.address_type as u32, true),
                (0, false),
                (0, false),
            ];
            for (index, hardened) in chain {
                let child = bip32::ChildNumber::new(index, hardened)
                    .map_err(|e| WalletError::MnemonicCrc(format!("bip32 derivation: {e}")))?;
                key = key
                    .derive_child(child)
                    .map_err(|e| WalletError::MnemonicCrc(format!("bip32 derivation: {e}")))?;
            }
            let mut priv_bytes: [u8; 32] = key.private_key().to_bytes().into();
            self.seed = cn_fast_hash(&priv_bytes);
            priv_bytes.zeroize();
            self.tx_derivation_seed = derive_from_seed(&self.seed, "tx_derivation");
            let mut sk_data = Vec::with_capacity(32 + 14);
            sk_data.extend_from_slice(&self.seed);
            sk_data.extend_from_slice(b"spend_key_base");
            self.spend_key_base.secret_key = hash_to_scalar(&sk_data);
            sk_data.zeroize();
            self.spend_key_base.public_key =
                secret_key_to_public_key(&self.spend_key_base.secret_key).ok_or_else(|| {
                    WalletError::Decrypt("derived spend key base is invalid".into())
                })?;
        } else {
            // View only.
            let ba = self.get("spend_key_base_public_key")?.ok_or_else(|| {
                WalletError::Decrypt("wallet corrupted, no spend key base".into())
            })?;
            if ba.len() != 32 {
                return Err(WalletError::Decrypt(
                    "wallet corrupted, bad spend key base".into(),
                ));
            }
            self.spend_key_base.public_key.copy_from_slice(&ba);
            if !key_isvalid(&self.spend_key_base.public_key) {
                return Err(WalletError::Decrypt(
                    "wallet corrupted - spend key base is invalid".into(),
                ));
            }
            // Only with the tx derivation seed can a view-only wallet see
            // outgoing addresses.
            if let Some(ba) = self.get("tx_derivation_seed")? {
                if ba.len() == 32 {
                    self.tx_derivation_seed.copy_from_slice(&ba);
                }
            }
        }

        let mut vk_data = Vec::with_capacity(32 + 8);
        vk_data.extend_from_slice(&self.spend_key_base.public_key);
        vk_data.extend_from_slice(b"view_key");
        self.view_secret_key = hash_to_scalar(&vk_data);
        self.view_public_key = secret_key_to_public_key(&self.view_secret_key)
            .ok_or_else(|| WalletError::Decrypt("derived view key is invalid".into()))?;

        if let Some(ba) = self.get(ADDRESS_COUNT_PREFIX)? {
            self.used_address_count = parse_u64(&ba)? as usize;
        }
        let ts_key = format!("{CREATION_TIMESTAMP_PREFIX}{}", self.network.suffix());
        self.oldest_timestamp = match self.get(&ts_key)? {
            Some(ba) => parse_u64(&ba)?,
            None => 0,
        };
        self.generate_ahead();

        let mut stmt = self.conn.prepare("SELECT address, label FROM labels")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (enc_address, enc_label) = row?;
            let address = decrypt_data(&self.wallet_key, &enc_address)?;
            let label = decrypt_data(&self.wallet_key, &enc_label)?;
            let address = String::from_utf8(address)
                .map_err(|_| WalletError::Decrypt("corrupt label address".into()))?;
            let label = String::from_utf8(label)
                .map_err(|_| WalletError::Decrypt("corrupt label".into()))?;
            self.labels.insert(address, label);
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT; BEGIN;")?;
        Ok(())
    }

    // ── Salt and parameters ─────────────────────────────────────────────

    fn put_salt(conn: &Connection, salt: &[u8]) -> Result<()> {
        conn.execute(
            "REPLACE INTO unencrypted (key, value) VALUES ('salt', ?1)",
            params![salt],
        )?;
        Ok(())
    }

    fn get_salt(conn: &Connection) -> Result<Vec<u8>> {
        conn.query_row(
            "SELECT value FROM unencrypted WHERE key = 'salt'",
            [],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| WalletError::Decrypt("wallet database has no salt".into()))
    }

    fn parameter_token(&self, key: &str) -> Hash {
        let mut token = b"db_parameters".to_vec();
        token.extend_from_slice(key.as_bytes());
        derive_from_key(&self.wallet_key, &token)
    }

    fn put(&self, key: &str, value: &[u8], nooverwrite: bool) -> Result<()> {
        let key_hash = self.parameter_token(key);
        let enc_key = encrypt_data(&self.wallet_key, key.as_bytes());
        let enc_value = encrypt_data(&self.wallet_key, value);
        let sql = if nooverwrite {
            "INSERT INTO parameters (key_hash, key, value) VALUES (?1, ?2, ?3)"
        } else {
            "REPLACE INTO parameters (key_hash, key, value) VALUES (?1, ?2, ?3)"
        };
        self.conn
            .execute(sql, params![key_hash.to_vec(), enc_key, enc_value])?;
        Ok(())
    }

    fn put_string(&self, key: &str, value: &str, nooverwrite: bool) -> Result<()> {
        self.put(key, value.as_bytes(), nooverwrite)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key_hash = self.parameter_token(key);
        let value: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT value FROM parameters WHERE key_hash = ?1",
                params![key_hash.to_vec()],
                |r| r.get(0),
            )
            .optional()?;
        match value {
            Some(value) => Ok(Some(decrypt_data(&self.wallet_key, &value)?)),
            None => Ok(None),
        }
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        match self.get(key)? {
            Some(value) => Ok(Some(String::from_utf8(value).map_err(|_| {
                WalletError::Decrypt("corrupt string parameter".into())
            })?)),
            None => Ok(None),
        }
    }

    fn parameters_get(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM parameters")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (enc_key, enc_value) = row?;
            let key = decrypt_data(&self.wallet_key, &enc_key)?;
            let key = String::from_utf8(key)
                .map_err(|_| WalletError::Decrypt("corrupt parameter key".into()))?;
            let value = decrypt_data(&self.wallet_key, &enc_value)?;
            result.push((key, value));
        }
        Ok(result)
    }

    // ── Address window ──────────────────────────────────────────────────

    fn generate_ahead(&mut self) {
        if self.wallet_records.len() >= self.used_address_count + GENERATE_AHEAD {
            return;
        }
        let delta = self.used_address_count + GENERATE_AHEAD - self.wallet_records.len();
        let start_index = self.wallet_records.len();
        let base = self.spend_key_base;
        let view_seed: Hash = base.public_key;

        let mut results: Vec<Vec<WalletRecord>>;
        if delta < GENERATE_AHEAD_THREAD_MIN {
            let mut records = vec![WalletRecord::default(); delta];
            generate_records(&base, &view_seed, start_index, &mut records);
            results = vec![records];
        } else {
            let thc = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            results = (0..thc)
                .map(|i| vec![WalletRecord::default(); delta * (i + 1) / thc - delta * i / thc])
                .collect();
            // Each worker fills its own disjoint slice; no shared state.
            std::thread::scope(|scope| {
                for (i, chunk) in results.iter_mut().enumerate() {
                    let start = delta * i / thc;
                    let base = &base;
                    let view_seed = &view_seed;
                    scope.spawn(move || {
                        generate_records(base, view_seed, start_index + start, chunk)
                    });
                }
            });
        }
        self.wallet_records
            .reserve(self.used_address_count + GENERATE_AHEAD);
        for result in results {
            for record in result {
                self.records_map
                    .insert(record.spend_public_key, self.wallet_records.len());
                self.wallet_records.push(record);
            }
        }
    }

    // ── Payment queue internals ─────────────────────────────────────────

    fn tid_token(&self, tid: &Tid) -> Hash {
        let mut token = b"db_payment_queue_tid".to_vec();
        token.extend_from_slice(tid);
        derive_from_key(&self.wallet_key, &token)
    }

    fn net_token(&self, net: &str) -> Hash {
        let mut token = b"db_payment_queue_net".to_vec();
        token.extend_from_slice(net.as_bytes());
        derive_from_key(&self.wallet_key, &token)
    }

    fn payment_queue_add2(&self, tid: &Tid, net: &str, binary_transaction: &[u8]) -> Result<()> {
        let tid_hash = self.tid_token(tid);
        let net_hash = self.net_token(net);
        let enc_tid = encrypt_data(&self.wallet_key, tid);
        let enc_net = encrypt_data(&self.wallet_key, net.as_bytes());
        let enc_value = encrypt_data(&self.wallet_key, binary_transaction);
        self.conn.execute(
            "REPLACE INTO payment_queue (tid_hash, net_hash, tid, net, binary_transaction) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tid_hash.to_vec(),
                net_hash.to_vec(),
                enc_tid,
                enc_net,
                enc_value
            ],
        )?;
        Ok(())
    }

    fn payment_queue_get2(&self) -> Result<Vec<(Tid, String, BinaryBlob)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tid, net, binary_transaction FROM payment_queue")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, Vec<u8>>(0)?,
                r.get::<_, Vec<u8>>(1)?,
                r.get::<_, Vec<u8>>(2)?,
            ))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (enc_tid, enc_net, enc_value) = row?;
            let tid_bytes = decrypt_data(&self.wallet_key, &enc_tid)?;
            let tid: Tid = tid_bytes
                .try_into()
                .map_err(|_| WalletError::Decrypt("corrupt payment queue tid".into()))?;
            let net = decrypt_data(&self.wallet_key, &enc_net)?;
            let net = String::from_utf8(net)
                .map_err(|_| WalletError::Decrypt("corrupt payment queue net".into()))?;
            let value = decrypt_data(&self.wallet_key, &enc_value)?;
            result.push((tid, net, value));
        }
        Ok(result)
    }
}

impl Wallet for WalletHd {
    fn records(&self) -> &[WalletRecord] {
        &self.wallet_records
    }

    fn record_index(&self, spend_public_key: &PublicKey) -> Option<usize> {
        self.records_map.get(spend_public_key).copied()
    }

    fn get_view_public_key(&self) -> &PublicKey {
        &self.view_public_key
    }

    fn get_view_secret_key(&self) -> &SecretKey {
        &self.view_secret_key
    }

    fn get_oldest_timestamp(&self) -> Timestamp {
        self.oldest_timestamp
    }

    fn get_actual_records_count(&self) -> usize {
        // The look-ahead tail is not yet "actual".
        self.used_address_count
    }

    fn can_view_outgoing_addresses(&self) -> bool {
        self.tx_derivation_seed != [0u8; 32]
    }

    fn is_auditable(&self) -> bool {
        self.address_type == ADDRESS_TYPE_UNLINKABLE_AUDITABLE
    }

    fn record_to_address(&self, record: &WalletRecord) -> AccountAddress {
        let s_v = generate_address_s_v(&record.spend_public_key, &self.view_secret_key)
            .expect("wallet record spend public key is a valid point");
        AccountAddress::Unlinkable {
            s: record.spend_public_key,
            s_v,
            is_auditable: self.is_auditable(),
        }
    }

    fn get_record(&self, address: &AccountAddress) -> Option<WalletRecord> {
        let AccountAddress::Unlinkable { s, is_auditable, .. } = address else {
            return None;
        };
        if *is_auditable != self.is_auditable() {
            return None;
        }
        let index = *self.records_map.get(s)?;
        if index >= self.get_actual_records_count() {
            return None;
        }
        let record = self.wallet_records[index];
        if self.record_to_address(&record) != *address {
            return None;
        }
        Some(record)
    }

    fn create_look_ahead_records(&mut self, count: usize) -> Result<()> {
        if count <= self.used_address_count {
            return Ok(());
        }
        self.used_address_count = count;
        self.generate_ahead();
        self.put(ADDRESS_COUNT_PREFIX, &(count as u64).to_le_bytes(), false)?;
        self.commit()
    }

    fn generate_new_addresses(
        &mut self,
        secret_keys: &[SecretKey],
        _ct: Timestamp,
        _now: Timestamp,
        rescan_from_ct: &mut bool,
    ) -> Result<Vec<WalletRecord>> {
        // Real creation timestamps are stored per net; look-ahead records
        // carry TIMESTAMP_MAX, so consuming them never triggers a rescan.
        *rescan_from_ct = false;
        for sk in secret_keys {
            if *sk != SECRET_KEY_ZERO {
                return Err(WalletError::NotSupported(
                    "generating non-deterministic addresses not supported by HD wallet".into(),
                ));
            }
        }
        if secret_keys.is_empty() {
            return Ok(Vec::new());
        }
        let was_used_address_count = self.used_address_count;
        self.used_address_count += secret_keys.len();
        self.generate_ahead();
        let result =
            self.wallet_records[was_used_address_count..self.used_address_count].to_vec();
        self.put(
            ADDRESS_COUNT_PREFIX,
            &(self.used_address_count as u64).to_le_bytes(),
            false,
        )?;
        self.commit()?;
        Ok(result)
    }

    fn set_password(&mut self, password: &str) -> Result<()> {
        let parameters = self.parameters_get()?;
        let payment_queue = self.payment_queue_get2()?;

        self.conn.execute_batch(
            "DELETE FROM payment_queue; DELETE FROM parameters; DELETE FROM labels;",
        )?;

        let salt = random_bytes::<32>().to_vec();
        Self::put_salt(&self.conn, &salt)?;
        self.wallet_key = slow_hash(&salt, password.as_bytes());

        for (key, value) in &parameters {
            self.put(key, value, true)?;
        }
        let labels: Vec<(String, String)> = self
            .labels
            .iter()
            .map(|(a, l)| (a.clone(), l.clone()))
            .collect();
        for (address, label) in labels {
            self.set_label(address, label)?;
        }
        for (tid, net, blob) in &payment_queue {
            self.payment_queue_add2(tid, net, blob)?;
        }
        self.commit()
    }

    fn export_wallet(
        &self,
        export_path: &str,
        new_password: &str,
        view_only: bool,
        view_outgoing_addresses: bool,
    ) -> Result<()> {
        let mut other = WalletHd::create(self.network, export_path, new_password, "", 0, 0, "")?;
        if !self.is_view_only() && view_only {
            other.put("spend_key_base_public_key", &self.spend_key_base.public_key, true)?;
            if view_outgoing_addresses {
                other.put("tx_derivation_seed", &self.tx_derivation_seed, true)?;
            }
            for (key, value) in self.parameters_get()? {
                if key != "mnemonic" && key != "mnemonic-password" {
                    other.put(&key, &value, true)?;
                }
            }
            for (address, label) in &self.labels {
                other.set_label(address.clone(), label.clone())?;
            }
        } else {
            for (key, value) in self.parameters_get()? {
                other.put(&key, &value, true)?;
            }
            for (address, label) in &self.labels {
                other.set_label(address.clone(), label.clone())?;
            }
            for (tid, net, blob) in self.payment_queue_get2()? {
                other.payment_queue_add2(&tid, &net, &blob)?;
            }
        }
        other.commit()
    }

    fn export_keys(&self) -> Result<String> {
        self.get_string("mnemonic")?.ok_or_else(|| {
            WalletError::NotSupported(
                "exporting keys (mnemonic) not supported by view-only HD wallet".into(),
            )
        })
    }

    fn backup(&self, dst: &str, password: &str) -> Result<()> {
        self.export_wallet(dst, password, false, false)
    }

    fn set_label(&mut self, address: String, label: String) -> Result<()> {
        let mut token = b"db_labels".to_vec();
        token.extend_from_slice(address.as_bytes());
        let address_hash = derive_from_key(&self.wallet_key, &token);

        if label.is_empty() {
            self.labels.remove(&address);
            self.conn.execute(
                "DELETE FROM labels WHERE address_hash = ?1",
                params![address_hash.to_vec()],
            )?;
        } else {
            let enc_address = encrypt_data(&self.wallet_key, address.as_bytes());
            let enc_label = encrypt_data(&self.wallet_key, label.as_bytes());
            self.labels.insert(address, label);
            self.conn.execute(
                "REPLACE INTO labels (address_hash, address, label) VALUES (?1, ?2, ?3)",
                params![address_hash.to_vec(), enc_address, enc_label],
            )?;
        }
        self.commit()
    }

    fn get_label(&self, address: &str) -> String {
        self.labels.get(address).cloned().unwrap_or_default()
    }

    fn save_history(&mut self, _tid: &Tid, _used_addresses: &History) -> Result<bool> {
        Ok(true)
    }

    fn load_history(&self, _tid: &Tid) -> History {
        History::new()
    }

    fn payment_queue_get(&self) -> Result<Vec<BinaryBlob>> {
        let result = self
            .payment_queue_get2()?
            .into_iter()
            .filter(|(_, net, _)| net == self.network.name())
            .map(|(_, _, blob)| blob)
            .collect();
        Ok(result)
    }

    fn payment_queue_add(&mut self, tid: &Tid, binary_transaction: &[u8]) -> Result<()> {
        self.payment_queue_add2(tid, self.network.name(), binary_transaction)
    }

    fn payment_queue_remove(&mut self, tid: &Tid) -> Result<()> {
        let tid_hash = self.tid_token(tid);
        let net_hash = self.net_token(self.network.name());
        self.conn.execute(
            "DELETE FROM payment_queue WHERE net_hash = ?1 AND tid_hash = ?2",
            params![net_hash.to_vec(), tid_hash.to_vec()],
        )?;
        if tid[0] == b'x' {
            // Committing here is not critical; bulk removals batch up until
            // the next committing operation.
            self.commit()?;
        }
        Ok(())
    }

    fn on_first_output_found(&mut self, ts: Timestamp) -> Result<()> {
        if self.oldest_timestamp != 0 || ts == 0 {
            return Ok(());
        }
        let key = format!("{CREATION_TIMESTAMP_PREFIX}{}", self.network.suffix());
        self.put(&key, &ts.to_le_bytes(), false)?;
        self.oldest_timestamp = ts;
        self.commit()
    }

    fn get_output_handler(&self) -> OutputHandler {
        let vsk_copy = self.view_secret_key;
        Box::new(
            move |_tx_public_key: &PublicKey,
                  _kd: &mut Option<KeyDerivation>,
                  tx_inputs_hash: &Hash,
                  output_index: usize,
                  key_output: &OutputKey| {
                let mut secret_scalar = SECRET_KEY_ZERO;
                let spend_public_key = unlinkable_underive_public_key(
                    &vsk_copy,
                    tx_inputs_hash,
                    output_index,
                    &key_output.public_key,
                    &key_output.encrypted_secret,
                    &mut secret_scalar,
                );
                (spend_public_key, secret_scalar)
            },
        )
    }

    fn detect_our_output(
        &mut self,
        _tid: &Tid,
        _tx_inputs_hash: &Hash,
        _kd: &Option<KeyDerivation>,
        _out_index: usize,
        spend_public_key: &PublicKey,
        secret_scalar: &SecretKey,
        key_output: &OutputKey,
    ) -> Result<Option<OurOutput>> {
        let record = match self.get_look_ahead_record(spend_public_key)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let address = self.record_to_address(&record);
        let AccountAddress::Unlinkable { is_auditable, .. } = address else {
            unreachable!("HD addresses are always unlinkable")
        };
        if is_auditable != key_output.is_auditable {
            return Ok(None);
        }
        let mut output_keypair = KeyPair::default();
        if record.spend_secret_key != SECRET_KEY_ZERO {
            output_keypair.secret_key =
                unlinkable_derive_secret_key(&record.spend_secret_key, secret_scalar);
            match secret_key_to_public_key(&output_keypair.secret_key) {
                Some(pk) if pk == key_output.public_key => output_keypair.public_key = pk,
                _ => return Ok(None),
            }
        }
        Ok(Some(OurOutput {
            amount: key_output.amount,
            output_keypair,
            address,
        }))
    }
}

impl Drop for WalletHd {
    fn drop(&mut self) {
        // Anything not yet committed at a save boundary rolls back with the
        // connection; secrets leave memory here.
        self.view_secret_key.zeroize();
        self.seed.zeroize();
        self.tx_derivation_seed.zeroize();
        self.spend_key_base.secret_key.zeroize();
        for record in &mut self.wallet_records {
            record.spend_secret_key.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypted_value_roundtrip() {
        let key = ChachaKey([0x42u8; 32]);
        for len in [0usize, 1, 4, 200, 219, 220, 221, 500, 5000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let enc = encrypt_data(&key, &data);
            assert_eq!(decrypt_data(&key, &enc).unwrap(), data);
        }
    }

    #[test]
    fn test_encrypted_value_length_hides_size() {
        let key = ChachaKey([0x42u8; 32]);
        // Total length is a power of two, at least 256.
        for len in [0usize, 1, 100, 219] {
            let enc = encrypt_data(&key, &vec![0u8; len]);
            assert_eq!(enc.len(), 256);
        }
        let enc = encrypt_data(&key, &vec![0u8; 221]);
        assert_eq!(enc.len(), 512);
        let enc = encrypt_data(&key, &vec![0u8; 900]);
        assert_eq!(enc.len(), 1024);
        for len in [300usize, 500, 2000, 10000] {
            let enc = encrypt_data(&key, &vec![0u8; len]);
            assert!(enc.len().is_power_of_two());
            assert!(enc.len() >= 256);
        }
    }

    #[test]
    fn test_encrypted_value_fresh_iv() {
        let key = ChachaKey([0x13u8; 32]);
        let a = encrypt_data(&key, b"same plaintext");
        let b = encrypt_data(&key, b"same plaintext");
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_key_fails_or_garbles() {
        let key = ChachaKey([0x01u8; 32]);
        let wrong = ChachaKey([0x02u8; 32]);
        let enc = encrypt_data(&key, b"payload");
        match decrypt_data(&wrong, &enc) {
            Ok(garbled) => assert_ne!(garbled, b"payload"),
            Err(_) => {}
        }
    }

    #[test]
    fn test_check_bip39_mnemonic() {
        let phrase = "abandon abandon abandon abandon abandon abandon abandon abandon \
                      abandon abandon abandon abandon abandon abandon abandon abandon \
                      abandon abandon abandon abandon abandon abandon abandon art";
        let normalized = check_bip39_mnemonic(phrase).unwrap();
        assert_eq!(normalized.split_whitespace().count(), 24);
        assert!(check_bip39_mnemonic("not a valid mnemonic at all").is_err());
    }
}
