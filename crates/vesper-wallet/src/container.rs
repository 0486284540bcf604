//! Flat encrypted container backend ("V2").
//!
//! A single length-prefixed file of independently encrypted key records,
//! with sibling `.history` and `.payments` folders. Every full rewrite goes
//! through `save_and_check`: write a temp file, reopen it with the same key,
//! compare the restored state, then atomically replace the original.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use tracing::{info, warn};
use zeroize::Zeroize;

use vesper_crypto::{
    chacha8, cn_fast_hash, derive_public_key, derive_secret_key, generate_key_derivation,
    key_isvalid, keys_match, random_bytes, random_keypair, secret_key_to_public_key, slow_hash,
    underive_public_key, ChachaIv, ChachaKey, Hash, KeyDerivation, KeyPair, PublicKey, SecretKey,
    SECRET_KEY_ZERO,
};

use crate::error::{Result, WalletError};
use crate::types::{
    AccountAddress, BinaryBlob, History, Network, OurOutput, OutputKey, Tid, Timestamp,
    WalletRecord, TIMESTAMP_MAX,
};
use crate::wallet::{derive_from_seed_legacy, OutputHandler, Wallet};

const SERIALIZATION_VERSION_V2: u8 = 6;

/// >8 KB verified at each end of the file; checking every record would make
/// opening huge wallets too slow.
const CHECK_KEYS_COUNT: usize = 128;

const RECORD_DATA_SIZE: usize = 32 + 32 + 8;
const ENCRYPTED_RECORD_SIZE: usize = 8 + RECORD_DATA_SIZE;
const PREFIX_SIZE: usize = 8 + ENCRYPTED_RECORD_SIZE;

/// Fixed KDF salt for the container backend; the file format has no salt
/// field, so the password is stretched under a domain constant.
const CONTAINER_KDF_SALT: &[u8] = b"vesper wallet container v2";

pub fn wallet_file_size(records: usize) -> usize {
    1 + PREFIX_SIZE + 2 * 8 + ENCRYPTED_RECORD_SIZE * records
}

fn now_unix() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn encrypt_key_pair(
    public_key: &PublicKey,
    secret_key: &SecretKey,
    ct: Timestamp,
    key: &ChachaKey,
) -> [u8; ENCRYPTED_RECORD_SIZE] {
    let mut rec = [0u8; RECORD_DATA_SIZE];
    rec[..32].copy_from_slice(public_key);
    rec[32..64].copy_from_slice(secret_key);
    rec[64..].copy_from_slice(&ct.to_le_bytes());
    let iv: ChachaIv = random_bytes();
    chacha8(key.as_bytes(), &iv, &mut rec);
    let mut out = [0u8; ENCRYPTED_RECORD_SIZE];
    out[..8].copy_from_slice(&iv);
    out[8..].copy_from_slice(&rec);
    rec.zeroize();
    out
}

fn decrypt_key_pair(enc: &[u8], key: &ChachaKey) -> (PublicKey, SecretKey, Timestamp) {
    let mut iv = [0u8; 8];
    iv.copy_from_slice(&enc[..8]);
    let mut rec = [0u8; RECORD_DATA_SIZE];
    rec.copy_from_slice(&enc[8..ENCRYPTED_RECORD_SIZE]);
    chacha8(key.as_bytes(), &iv, &mut rec);
    let mut public_key = [0u8; 32];
    let mut secret_key = [0u8; 32];
    public_key.copy_from_slice(&rec[..32]);
    secret_key.copy_from_slice(&rec[32..64]);
    let ct = Timestamp::from_le_bytes(rec[64..].try_into().unwrap());
    rec.zeroize();
    (public_key, secret_key, ct)
}

pub struct WalletContainer {
    network: Network,
    path: String,
    wallet_key: ChachaKey,
    /// `None` between dropping the old handle and adopting the renamed one.
    file: Option<File>,
    view_public_key: PublicKey,
    view_secret_key: SecretKey,
    wallet_records: Vec<WalletRecord>,
    records_map: HashMap<PublicKey, usize>,
    oldest_timestamp: Timestamp,
    seed: Hash,
    tx_derivation_seed: Hash,
    history_filename_seed: Hash,
    history_key: [u8; 32],
}

impl std::fmt::Debug for WalletContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletContainer")
            .field("network", &self.network)
            .field("path", &self.path)
            .field("records_count", &self.wallet_records.len())
            .finish_non_exhaustive()
    }
}

impl WalletContainer {
    fn empty(network: Network, path: &str, wallet_key: ChachaKey) -> Self {
        Self {
            network,
            path: path.to_string(),
            wallet_key,
            file: None,
            view_public_key: [0u8; 32],
            view_secret_key: [0u8; 32],
            wallet_records: Vec::new(),
            records_map: HashMap::new(),
            oldest_timestamp: TIMESTAMP_MAX,
            seed: [0u8; 32],
            tx_derivation_seed: [0u8; 32],
            history_filename_seed: [0u8; 32],
            history_key: [0u8; 32],
        }
    }

    /// Open an existing container file.
    pub fn open(network: Network, path: &str, password: &str) -> Result<Self> {
        let wallet_key = slow_hash(CONTAINER_KDF_SALT, password.as_bytes());
        let mut wallet = Self::empty(network, path, wallet_key);
        wallet.load()?;
        Ok(wallet)
    }

    /// Open with an already-derived wallet key; used by `save_and_check` to
    /// verify the freshly written temp file.
    fn open_with_key(network: Network, path: &str, wallet_key: ChachaKey) -> Result<Self> {
        let mut wallet = Self::empty(network, path, wallet_key);
        wallet.load()?;
        Ok(wallet)
    }

    /// Create a new container at `path`.
    ///
    /// An empty `import_keys` generates a random view keypair and first spend
    /// record; otherwise it must be the 256-hex
    /// `spend_pub || view_pub || spend_sec || view_sec` string.
    pub fn create(
        network: Network,
        path: &str,
        password: &str,
        import_keys: &str,
        creation_timestamp: Timestamp,
    ) -> Result<Self> {
        let wallet_key = slow_hash(CONTAINER_KDF_SALT, password.as_bytes());
        // Refuse to overwrite an existing wallet.
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| WalletError::Write(format!("cannot create wallet file {path}: {e}")))?;
        let mut wallet = Self::empty(network, path, wallet_key);

        if import_keys.is_empty() {
            wallet.oldest_timestamp = now_unix();
            let view = random_keypair();
            wallet.view_public_key = view.public_key;
            wallet.view_secret_key = view.secret_key;
            let spend = random_keypair();
            wallet.wallet_records.push(WalletRecord {
                spend_public_key: spend.public_key,
                spend_secret_key: spend.secret_key,
                creation_timestamp: wallet.oldest_timestamp,
            });
        } else {
            if import_keys.len() != 256 {
                return Err(WalletError::Decrypt(
                    "imported keys should be exactly 128 hex bytes".into(),
                ));
            }
            let parse = |range: std::ops::Range<usize>| -> Result<[u8; 32]> {
                let bytes = hex::decode(&import_keys[range]).map_err(|_| {
                    WalletError::Decrypt("imported keys should contain only hex bytes".into())
                })?;
                Ok(bytes.try_into().unwrap())
            };
            let mut record = WalletRecord {
                spend_public_key: parse(0..64)?,
                spend_secret_key: parse(128..192)?,
                creation_timestamp,
            };
            wallet.view_public_key = parse(64..128)?;
            wallet.view_secret_key = parse(192..256)?;
            if !keys_match(&wallet.view_secret_key, &wallet.view_public_key) {
                return Err(WalletError::Decrypt(
                    "imported secret view key does not match corresponding public key".into(),
                ));
            }
            if record.spend_secret_key != SECRET_KEY_ZERO
                && !keys_match(&record.spend_secret_key, &record.spend_public_key)
            {
                return Err(WalletError::Decrypt(
                    "imported secret spend key does not match corresponding public key".into(),
                ));
            }
            wallet.oldest_timestamp = 0; // will scan the entire blockchain
            wallet.wallet_records.push(record);
        }
        wallet
            .records_map
            .insert(wallet.wallet_records[0].spend_public_key, 0);
        wallet.save_and_check()?;
        wallet.load()?;
        Ok(wallet)
    }

    fn load(&mut self) -> Result<()> {
        let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(f) => f,
            // Read-only media?
            Err(_) => OpenOptions::new()
                .read(true)
                .open(&self.path)
                .map_err(|e| WalletError::FileRead(format!("cannot open {}: {e}", self.path)))?,
        };
        self.file = Some(file);
        let mut version = [0u8; 1];
        self.file.as_mut().unwrap().read_exact(&mut version)?;
        if version[0] > SERIALIZATION_VERSION_V2 {
            return Err(WalletError::UnknownVersion);
        }
        if version[0] < SERIALIZATION_VERSION_V2 {
            // The V1 serializer lives in the legacy conversion tool.
            return Err(WalletError::Decrypt(
                "legacy pre-V2 wallet file, convert it with the legacy tool first".into(),
            ));
        }
        self.file.as_mut().unwrap().seek(SeekFrom::Start(0))?;
        self.load_container_storage()?;
        if self.wallet_records.is_empty() {
            return Err(WalletError::Decrypt("error reading wallet file".into()));
        }
        if !self.is_view_only() {
            let mut seed_data = Vec::with_capacity(64);
            seed_data.extend_from_slice(&self.view_secret_key);
            seed_data.extend_from_slice(&self.wallet_records[0].spend_secret_key);
            self.seed = cn_fast_hash(&seed_data);
            seed_data.zeroize();
            self.tx_derivation_seed = derive_from_seed_legacy(&self.seed, "tx_derivation");
            self.history_filename_seed = derive_from_seed_legacy(&self.seed, "history_filename");
            self.history_key = derive_from_seed_legacy(&self.seed, "history");
        }
        Ok(())
    }

    fn load_container_storage(&mut self) -> Result<()> {
        self.wallet_records.clear();
        self.records_map.clear();
        self.oldest_timestamp = TIMESTAMP_MAX;

        let file = self.file.as_mut().unwrap();
        let mut version = [0u8; 1];
        let mut prefix = [0u8; PREFIX_SIZE];
        let mut count_capacity = [0u8; 16];
        file.read_exact(&mut version)?;
        file.read_exact(&mut prefix)?;
        file.read_exact(&mut count_capacity)?;
        let f_item_capacity = u64::from_le_bytes(count_capacity[..8].try_into().unwrap());
        let f_item_count = u64::from_le_bytes(count_capacity[8..].try_into().unwrap());

        // prefix = next_iv (reserved) + encrypted view-key record
        let (vpk, vsk, _view_ct) = decrypt_key_pair(&prefix[8..], &self.wallet_key);
        self.view_public_key = vpk;
        self.view_secret_key = vsk;
        if !keys_match(&self.view_secret_key, &self.view_public_key) {
            return Err(WalletError::Decrypt(
                "restored view public key doesn't correspond to secret key".into(),
            ));
        }

        // Protection against write shredding: a torn write may have extended
        // capacity without finishing the count update.
        let item_count = f_item_count.min(f_item_capacity) as usize;
        if item_count > usize::MAX / ENCRYPTED_RECORD_SIZE {
            return Err(WalletError::Decrypt(format!(
                "restored item count is too big {item_count}"
            )));
        }

        let mut tracking_mode = false;
        let mut encrypted = [0u8; ENCRYPTED_RECORD_SIZE];
        self.wallet_records.reserve(item_count);
        for i in 0..item_count {
            let file = self.file.as_mut().unwrap();
            file.read_exact(&mut encrypted)?;
            let (spend_public_key, spend_secret_key, creation_timestamp) =
                decrypt_key_pair(&encrypted, &self.wallet_key);
            let record = WalletRecord {
                spend_public_key,
                spend_secret_key,
                creation_timestamp,
            };
            if i == 0 {
                tracking_mode = record.spend_secret_key == SECRET_KEY_ZERO;
            } else if tracking_mode != (record.spend_secret_key == SECRET_KEY_ZERO) {
                return Err(WalletError::Decrypt(
                    "all addresses must be either tracking or not".into(),
                ));
            }
            // Verify only the first and last records; catches truncation and
            // partial-encryption damage without decelerating huge wallets.
            if i < CHECK_KEYS_COUNT || i + CHECK_KEYS_COUNT >= item_count {
                if record.spend_secret_key != SECRET_KEY_ZERO {
                    if !keys_match(&record.spend_secret_key, &record.spend_public_key) {
                        return Err(WalletError::Decrypt(
                            "restored spend public key doesn't correspond to secret key".into(),
                        ));
                    }
                } else if !key_isvalid(&record.spend_public_key) {
                    return Err(WalletError::Decrypt("public spend key is incorrect".into()));
                }
            }
            self.oldest_timestamp = self.oldest_timestamp.min(record.creation_timestamp);
            self.records_map
                .insert(record.spend_public_key, self.wallet_records.len());
            self.wallet_records.push(record);
        }

        let file = self.file.as_mut().unwrap();
        let file_size = file.seek(SeekFrom::End(0))?;
        let should_be = wallet_file_size(item_count) as u64;
        if file_size > should_be {
            // Legacy wallet cache overhang; the media may be read-only.
            if file.set_len(should_be).is_ok() {
                warn!(size = should_be, "truncated legacy overhang in wallet file");
            }
        }
        Ok(())
    }

    /// Write the complete V2 layout to `export_path` under `wallet_key`.
    fn save(
        &self,
        export_path: &str,
        wallet_key: &ChachaKey,
        view_only: bool,
        create_new: bool,
    ) -> Result<()> {
        let mut options = OpenOptions::new();
        options.write(true);
        if create_new {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }
        let mut file = options
            .open(export_path)
            .map_err(|e| WalletError::Write(format!("cannot create {export_path}: {e}")))?;

        let mut data = Vec::with_capacity(wallet_file_size(self.wallet_records.len()));
        data.push(SERIALIZATION_VERSION_V2);
        let next_iv: ChachaIv = random_bytes(); // reserved, never consumed by the reader
        data.extend_from_slice(&next_iv);
        data.extend_from_slice(&encrypt_key_pair(
            &self.view_public_key,
            &self.view_secret_key,
            self.oldest_timestamp,
            wallet_key,
        ));
        let count = (self.wallet_records.len() as u64).to_le_bytes();
        data.extend_from_slice(&count); // capacity is set to item count
        data.extend_from_slice(&count);
        for record in &self.wallet_records {
            let secret = if view_only {
                SECRET_KEY_ZERO
            } else {
                record.spend_secret_key
            };
            data.extend_from_slice(&encrypt_key_pair(
                &record.spend_public_key,
                &secret,
                record.creation_timestamp,
                wallet_key,
            ));
        }
        file.write_all(&data)
            .and_then(|_| file.sync_all())
            .map_err(|e| WalletError::Write(format!("error writing {export_path}: {e}")))?;
        Ok(())
    }

    /// Write temp, verify by reopening, atomic-replace. The read-back compare
    /// is the correctness oracle; it catches disk, driver, and encoding bugs
    /// a one-way write would hide.
    fn save_and_check(&mut self) -> Result<()> {
        let tmp_path = format!("{}.tmp", self.path);
        self.save(&tmp_path, &self.wallet_key, false, false)?;

        let mut other = Self::open_with_key(self.network, &tmp_path, self.wallet_key.clone())?;
        if self.view_public_key != other.view_public_key
            || self.view_secret_key != other.view_secret_key
            || self.oldest_timestamp != other.oldest_timestamp
            || self.wallet_records != other.wallet_records
        {
            return Err(WalletError::Write(
                "error writing wallet file - records do not match".into(),
            ));
        }
        self.file = None;
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| WalletError::Write(format!("error replacing wallet file: {e}")))?;
        // The renamed inode stays open; adopt the verify wallet's handle.
        self.file = other.file.take();
        Ok(())
    }

    fn history_folder(&self) -> String {
        format!("{}.history{}", self.path, self.network.suffix())
    }

    fn payment_queue_folder(&self) -> String {
        format!("{}.payments{}", self.path, self.network.suffix())
    }

    fn history_file_name(&self, tid: &Tid) -> String {
        let mut filename_data = Vec::with_capacity(64);
        filename_data.extend_from_slice(tid);
        filename_data.extend_from_slice(&self.history_filename_seed);
        format!("{}.txh", hex::encode(cn_fast_hash(&filename_data)))
    }
}

fn atomic_save_file(path: &str, data: &[u8], tmp_path: &str) -> bool {
    let write = || -> std::io::Result<()> {
        let mut file = File::create(tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(tmp_path, path)
    };
    write().is_ok()
}

impl Wallet for WalletContainer {
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

    fn can_view_outgoing_addresses(&self) -> bool {
        self.tx_derivation_seed != [0u8; 32]
    }

    fn record_to_address(&self, record: &WalletRecord) -> AccountAddress {
        AccountAddress::Simple {
            spend_public_key: record.spend_public_key,
            view_public_key: self.view_public_key,
        }
    }

    fn get_record(&self, address: &AccountAddress) -> Option<WalletRecord> {
        let AccountAddress::Simple {
            spend_public_key,
            view_public_key,
        } = address
        else {
            return None;
        };
        if self.view_public_key != *view_public_key {
            return None;
        }
        let index = *self.records_map.get(spend_public_key)?;
        if index >= self.get_actual_records_count() {
            return None;
        }
        debug_assert_eq!(self.wallet_records[index].spend_public_key, *spend_public_key);
        Some(self.wallet_records[index])
    }

    fn generate_new_addresses(
        &mut self,
        secret_keys: &[SecretKey],
        ct: Timestamp,
        now: Timestamp,
        rescan_from_ct: &mut bool,
    ) -> Result<Vec<WalletRecord>> {
        if self.is_view_only() {
            return Err(WalletError::NotSupported(
                "generate new addresses impossible for view-only wallet".into(),
            ));
        }
        *rescan_from_ct = false;
        let mut result = Vec::with_capacity(secret_keys.len());

        let append_pos = wallet_file_size(self.wallet_records.len()) as u64;
        let mut file = self
            .file
            .take()
            .ok_or_else(|| WalletError::Write("wallet file is not writable".into()))?;
        let appended = (|| -> Result<()> {
            file.seek(SeekFrom::Start(append_pos))?;
            for sk in secret_keys {
                let mut record = WalletRecord::default();
                if *sk == SECRET_KEY_ZERO {
                    record.creation_timestamp = now;
                    loop {
                        let pair = random_keypair();
                        record.spend_public_key = pair.public_key;
                        record.spend_secret_key = pair.secret_key;
                        if !self.records_map.contains_key(&record.spend_public_key) {
                            break;
                        }
                    }
                    self.oldest_timestamp = self.oldest_timestamp.min(record.creation_timestamp);
                } else {
                    record.creation_timestamp = ct;
                    record.spend_secret_key = *sk;
                    record.spend_public_key =
                        secret_key_to_public_key(sk).ok_or_else(|| {
                            WalletError::InvalidArgument(format!(
                                "imported keypair is invalid - sk={}",
                                hex::encode(sk)
                            ))
                        })?;
                    if !keys_match(sk, &record.spend_public_key) {
                        return Err(WalletError::InvalidArgument(
                            "imported keypair is invalid".into(),
                        ));
                    }
                }
                if let Some(&index) = self.records_map.get(&record.spend_public_key) {
                    if self.wallet_records[index].creation_timestamp > record.creation_timestamp {
                        self.wallet_records[index].creation_timestamp = record.creation_timestamp;
                        self.oldest_timestamp =
                            self.oldest_timestamp.min(record.creation_timestamp);
                        *rescan_from_ct = true;
                    }
                    result.push(self.wallet_records[index]);
                    continue;
                }
                self.records_map
                    .insert(record.spend_public_key, self.wallet_records.len());
                self.wallet_records.push(record);
                let enc_record = encrypt_key_pair(
                    &record.spend_public_key,
                    &record.spend_secret_key,
                    record.creation_timestamp,
                    &self.wallet_key,
                );
                file.write_all(&enc_record)?;
                result.push(record);
            }
            file.sync_all()?;

            // Rewrite the two count/capacity words in place.
            file.seek(SeekFrom::Start((1 + PREFIX_SIZE) as u64))?;
            let count = (self.wallet_records.len() as u64).to_le_bytes();
            file.write_all(&count)?;
            file.write_all(&count)?;
            file.sync_all()?;
            Ok(())
        })();
        self.file = Some(file);
        appended?;

        if *rescan_from_ct {
            // Existing record timestamps cannot be rewritten in place safely.
            warn!(
                ct,
                "updating creation timestamps of existing addresses in the wallet file \
                 (might take minutes for large wallets)"
            );
            self.save_and_check()?;
        }
        Ok(result)
    }

    fn set_password(&mut self, password: &str) -> Result<()> {
        self.wallet_key = slow_hash(CONTAINER_KDF_SALT, password.as_bytes());
        self.save_and_check()
    }

    fn export_wallet(
        &self,
        export_path: &str,
        new_password: &str,
        view_only: bool,
        _view_outgoing_addresses: bool,
    ) -> Result<()> {
        for record in &self.wallet_records {
            if record.spend_secret_key != SECRET_KEY_ZERO {
                if !keys_match(&record.spend_secret_key, &record.spend_public_key) {
                    return Err(WalletError::Decrypt(
                        "spend public key doesn't correspond to secret key (corrupted wallet?)"
                            .into(),
                    ));
                }
            } else if !key_isvalid(&record.spend_public_key) {
                return Err(WalletError::Decrypt(
                    "public spend key is incorrect (corrupted wallet?)".into(),
                ));
            }
        }
        let new_wallet_key = slow_hash(CONTAINER_KDF_SALT, new_password.as_bytes());
        self.save(export_path, &new_wallet_key, view_only, true)
    }

    fn export_keys(&self) -> Result<String> {
        let mut result = Vec::with_capacity(128);
        result.extend_from_slice(&self.wallet_records[0].spend_public_key);
        result.extend_from_slice(&self.view_public_key);
        result.extend_from_slice(&self.wallet_records[0].spend_secret_key);
        result.extend_from_slice(&self.view_secret_key);
        Ok(hex::encode(result))
    }

    fn backup(&self, dst: &str, password: &str) -> Result<()> {
        let dst_history = format!("{dst}.history");
        let dst_payments = format!("{dst}.payments");
        fs::create_dir_all(&dst_payments)
            .map_err(|e| WalletError::Write(format!("could not create folder for backup: {e}")))?;
        fs::create_dir_all(&dst_history)
            .map_err(|e| WalletError::Write(format!("could not create folder for backup: {e}")))?;
        self.export_wallet(dst, password, false, false)?;
        for (src_folder, dst_folder) in [
            (self.payment_queue_folder(), dst_payments),
            (self.history_folder(), dst_history),
        ] {
            let entries = match fs::read_dir(&src_folder) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                fs::copy(entry.path(), format!("{}/{}", dst_folder, name.to_string_lossy()))?;
            }
        }
        Ok(())
    }

    fn set_label(&mut self, _address: String, _label: String) -> Result<()> {
        Err(WalletError::NotSupported(
            "linkable wallet file cannot store labels".into(),
        ))
    }

    fn get_label(&self, _address: &str) -> String {
        String::new()
    }

    fn save_history(&mut self, tid: &Tid, used_addresses: &History) -> Result<bool> {
        let history_folder = self.history_folder();
        if fs::create_dir_all(&history_folder).is_err() {
            return Ok(false);
        }
        if used_addresses.is_empty() {
            return Ok(true); // saved empty history
        }
        let mut data = Vec::with_capacity(used_addresses.len() * 64);
        for address in used_addresses {
            if let AccountAddress::Simple {
                spend_public_key,
                view_public_key,
            } = address
            {
                data.extend_from_slice(view_public_key);
                data.extend_from_slice(spend_public_key);
            }
        }
        let iv: ChachaIv = random_bytes();
        chacha8(&self.history_key, &iv, &mut data);
        let mut encrypted = Vec::with_capacity(8 + data.len());
        encrypted.extend_from_slice(&iv);
        encrypted.extend_from_slice(&data);

        let path = format!("{}/{}", history_folder, self.history_file_name(tid));
        let tmp_path = format!("{history_folder}/_tmp.txh");
        Ok(atomic_save_file(&path, &encrypted, &tmp_path))
    }

    fn load_history(&self, tid: &Tid) -> History {
        let mut used_addresses = History::new();
        let path = format!("{}/{}", self.history_folder(), self.history_file_name(tid));
        let hist = match fs::read(&path) {
            Ok(hist) => hist,
            Err(_) => return used_addresses,
        };
        if hist.len() < 8 || (hist.len() - 8) % 64 != 0 {
            return used_addresses;
        }
        let mut iv = [0u8; 8];
        iv.copy_from_slice(&hist[..8]);
        let mut data = hist[8..].to_vec();
        chacha8(&self.history_key, &iv, &mut data);
        for pair in data.chunks_exact(64) {
            let mut view_public_key = [0u8; 32];
            let mut spend_public_key = [0u8; 32];
            view_public_key.copy_from_slice(&pair[..32]);
            spend_public_key.copy_from_slice(&pair[32..]);
            used_addresses.insert(AccountAddress::Simple {
                spend_public_key,
                view_public_key,
            });
        }
        used_addresses
    }

    fn payment_queue_get(&self) -> Result<Vec<BinaryBlob>> {
        let folder = self.payment_queue_folder();
        let _ = fs::remove_file(format!("{folder}/tmp.tx"));
        let mut result = Vec::new();
        let entries = match fs::read_dir(&folder) {
            Ok(entries) => entries,
            Err(_) => return Ok(result),
        };
        for entry in entries.flatten() {
            if let Ok(body) = fs::read(entry.path()) {
                result.push(body);
            }
        }
        Ok(result)
    }

    fn payment_queue_add(&mut self, tid: &Tid, binary_transaction: &[u8]) -> Result<()> {
        let folder = self.payment_queue_folder();
        let file = format!("{}/{}.tx", folder, hex::encode(tid));
        let _ = fs::create_dir_all(&folder);
        if !atomic_save_file(&file, binary_transaction, &format!("{folder}/tmp.tx")) {
            warn!(tid = %hex::encode(tid), file, "failed to save transaction to file");
        } else {
            info!(tid = %hex::encode(tid), file, "saved transaction to file");
        }
        Ok(())
    }

    fn payment_queue_remove(&mut self, tid: &Tid) -> Result<()> {
        let folder = self.payment_queue_folder();
        let file = format!("{}/{}.tx", folder, hex::encode(tid));
        if fs::remove_file(&file).is_err() {
            warn!(tid = %hex::encode(tid), file, "failed to remove queued transaction file");
        } else {
            info!(tid = %hex::encode(tid), file, "removed queued transaction file");
        }
        let _ = fs::remove_dir(&folder); // when it becomes empty
        Ok(())
    }

    fn on_first_output_found(&mut self, ts: Timestamp) -> Result<()> {
        if self.network != Network::Main {
            return Ok(()); // legacy format has no place for other nets
        }
        if ts == 0 || self.oldest_timestamp != 0 {
            return Ok(());
        }
        self.oldest_timestamp = ts;
        for record in &mut self.wallet_records {
            if record.creation_timestamp == 0 {
                record.creation_timestamp = ts;
            }
        }
        warn!(
            ts,
            "updating creation timestamp in the wallet file (might take minutes for large wallets)"
        );
        self.save_and_check()
    }

    fn get_output_handler(&self) -> OutputHandler {
        let vsk_copy = self.view_secret_key;
        Box::new(
            move |tx_public_key: &PublicKey,
                  kd_cache: &mut Option<KeyDerivation>,
                  _tx_inputs_hash: &Hash,
                  output_index: usize,
                  key_output: &OutputKey| {
                if kd_cache.is_none() {
                    // tx_public_key is not checked by the daemon, so it can be
                    // an invalid point; a zero derivation is never ours.
                    *kd_cache = Some(
                        generate_key_derivation(tx_public_key, &vsk_copy).unwrap_or([0u8; 32]),
                    );
                }
                let kd = kd_cache.unwrap();
                let spend_public_key =
                    underive_public_key(&kd, output_index, &key_output.public_key);
                (spend_public_key, SECRET_KEY_ZERO)
            },
        )
    }

    fn detect_our_output(
        &mut self,
        _tid: &Tid,
        _tx_inputs_hash: &Hash,
        kd: &Option<KeyDerivation>,
        out_index: usize,
        spend_public_key: &PublicKey,
        _secret_scalar: &SecretKey,
        key_output: &OutputKey,
    ) -> Result<Option<OurOutput>> {
        let record = match self.get_look_ahead_record(spend_public_key)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let address = AccountAddress::Simple {
            spend_public_key: *spend_public_key,
            view_public_key: self.view_public_key,
        };
        let mut output_keypair = KeyPair::default();
        if record.spend_secret_key != SECRET_KEY_ZERO {
            let kd = match kd {
                Some(kd) => kd,
                None => return Ok(None), // tx_public_key was invalid
            };
            // Some of this is recomputed, but only for our outputs, which are
            // a tiny share of everything scanned.
            output_keypair.public_key =
                match derive_public_key(kd, out_index, spend_public_key) {
                    Some(pk) => pk,
                    None => return Ok(None),
                };
            output_keypair.secret_key = derive_secret_key(kd, out_index, &record.spend_secret_key);
            if output_keypair.public_key != key_output.public_key {
                return Ok(None);
            }
        }
        Ok(Some(OurOutput {
            amount: key_output.amount,
            output_keypair,
            address,
        }))
    }
}

impl Drop for WalletContainer {
    fn drop(&mut self) {
        self.view_secret_key.zeroize();
        self.seed.zeroize();
        self.tx_derivation_seed.zeroize();
        self.history_filename_seed.zeroize();
        self.history_key.zeroize();
        for record in &mut self.wallet_records {
            record.spend_secret_key.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_file_size() {
        // version + prefix + two u64 counters, then one 80-byte record each.
        assert_eq!(wallet_file_size(0), 105);
        assert_eq!(wallet_file_size(1), 185);
        assert_eq!(wallet_file_size(4), 105 + 4 * 80);
    }

    #[test]
    fn test_record_encryption_roundtrip() {
        let key = ChachaKey([0x11u8; 32]);
        let pair = random_keypair();
        let enc = encrypt_key_pair(&pair.public_key, &pair.secret_key, 12345, &key);
        let (pk, sk, ct) = decrypt_key_pair(&enc, &key);
        assert_eq!(pk, pair.public_key);
        assert_eq!(sk, pair.secret_key);
        assert_eq!(ct, 12345);
    }

    #[test]
    fn test_record_encryption_uses_fresh_ivs() {
        let key = ChachaKey([0x22u8; 32]);
        let pair = random_keypair();
        let a = encrypt_key_pair(&pair.public_key, &pair.secret_key, 1, &key);
        let b = encrypt_key_pair(&pair.public_key, &pair.secret_key, 1, &key);
        assert_ne!(a, b);
    }
}
