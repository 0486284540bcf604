//! The wallet contract shared by both storage backends.
//!
//! Backends hold their records in a vector plus a `spend_public_key -> index`
//! map; the trait's default methods implement everything that only needs
//! those two views of the state.

use vesper_crypto::{cn_fast_hash, ChachaKey, Hash, KeyDerivation, PublicKey, SecretKey, SECRET_KEY_ZERO};

use crate::error::Result;
use crate::types::{
    AccountAddress, BinaryBlob, History, OurOutput, OutputKey, Tid, Timestamp, WalletRecord,
};

/// Per-output hook computing the candidate spend public key (and, for HD
/// wallets, the secret spend scalar).
///
/// Holds a copy of the view secret only, never a wallet reference, so the
/// scanner may call it from any thread. The `KeyDerivation` cache is kept by
/// the caller across outputs of one transaction.
pub type OutputHandler = Box<
    dyn Fn(&PublicKey, &mut Option<KeyDerivation>, &Hash, usize, &OutputKey) -> (PublicKey, SecretKey)
        + Send
        + Sync,
>;

/// seed-then-label variant used by the HD backend.
pub(crate) fn derive_from_seed(seed: &Hash, label: &str) -> Hash {
    let mut data = Vec::with_capacity(32 + label.len());
    data.extend_from_slice(seed);
    data.extend_from_slice(label.as_bytes());
    cn_fast_hash(&data)
}

/// label-then-seed variant used by the container backend. Not interchangeable
/// with [`derive_from_seed`].
pub(crate) fn derive_from_seed_legacy(seed: &Hash, label: &str) -> Hash {
    let mut data = Vec::with_capacity(label.len() + 32);
    data.extend_from_slice(label.as_bytes());
    data.extend_from_slice(seed);
    cn_fast_hash(&data)
}

/// Deterministic lookup token for a hashed database column: the logical key
/// never reaches the database file in clear.
pub(crate) fn derive_from_key(wallet_key: &ChachaKey, data: &[u8]) -> Hash {
    let mut buf = Vec::with_capacity(32 + data.len());
    buf.extend_from_slice(wallet_key.as_bytes());
    buf.extend_from_slice(data);
    cn_fast_hash(&buf)
}

pub trait Wallet {
    fn records(&self) -> &[WalletRecord];
    fn record_index(&self, spend_public_key: &PublicKey) -> Option<usize>;
    fn get_view_public_key(&self) -> &PublicKey;
    fn get_view_secret_key(&self) -> &SecretKey;
    fn get_oldest_timestamp(&self) -> Timestamp;

    /// Container: all records. HD: the used prefix; the look-ahead tail is
    /// not yet "actual".
    fn get_actual_records_count(&self) -> usize {
        self.records().len()
    }

    fn get_first_address(&self) -> AccountAddress {
        self.record_to_address(&self.records()[0])
    }

    fn is_our_address(&self, address: &AccountAddress) -> bool {
        self.get_record(address).is_some()
    }

    fn is_view_only(&self) -> bool {
        self.records()[0].spend_secret_key == SECRET_KEY_ZERO
    }

    fn can_view_outgoing_addresses(&self) -> bool;

    fn is_auditable(&self) -> bool {
        false
    }

    /// Deterministic cache key for the wallet-state database.
    fn get_cache_name(&self) -> String {
        let mut name = hex::encode(cn_fast_hash(self.get_view_public_key()));
        if self.is_view_only() {
            if self.can_view_outgoing_addresses() {
                name.push_str("-view-only-voa");
            } else {
                name.push_str("-view-only");
            }
        }
        name
    }

    fn record_to_address(&self, record: &WalletRecord) -> AccountAddress;

    fn get_record(&self, address: &AccountAddress) -> Option<WalletRecord>;

    /// Map lookup that also grows the HD look-ahead window past the touched
    /// index. Mutates wallet state; callers serialize access.
    fn get_look_ahead_record(
        &mut self,
        spend_public_key: &PublicKey,
    ) -> Result<Option<WalletRecord>> {
        let index = match self.record_index(spend_public_key) {
            Some(index) => index,
            None => return Ok(None),
        };
        let record = self.records()[index];
        debug_assert_eq!(record.spend_public_key, *spend_public_key);
        self.create_look_ahead_records(index + 1)?;
        Ok(Some(record))
    }

    /// HD only; no-op for the container backend.
    fn create_look_ahead_records(&mut self, _count: usize) -> Result<()> {
        Ok(())
    }

    /// Container: random generation (zero inputs) or key import. HD: consumes
    /// look-ahead records; any nonzero input is rejected.
    fn generate_new_addresses(
        &mut self,
        secret_keys: &[SecretKey],
        ct: Timestamp,
        now: Timestamp,
        rescan_from_ct: &mut bool,
    ) -> Result<Vec<WalletRecord>>;

    fn set_password(&mut self, password: &str) -> Result<()>;

    fn export_wallet(
        &self,
        export_path: &str,
        new_password: &str,
        view_only: bool,
        view_outgoing_addresses: bool,
    ) -> Result<()>;

    fn export_keys(&self) -> Result<String>;

    fn backup(&self, dst: &str, password: &str) -> Result<()>;

    fn set_label(&mut self, address: String, label: String) -> Result<()>;
    fn get_label(&self, address: &str) -> String;

    fn save_history(&mut self, tid: &Tid, used_addresses: &History) -> Result<bool>;
    fn load_history(&self, tid: &Tid) -> History;

    fn payment_queue_get(&self) -> Result<Vec<BinaryBlob>>;
    fn payment_queue_add(&mut self, tid: &Tid, binary_transaction: &[u8]) -> Result<()>;
    fn payment_queue_remove(&mut self, tid: &Tid) -> Result<()>;

    /// First-time timestamp pinning, called when the scanner finds the
    /// wallet's first output.
    fn on_first_output_found(&mut self, ts: Timestamp) -> Result<()>;

    fn get_output_handler(&self) -> OutputHandler;

    /// Resolve a candidate spend key produced by the output handler.
    ///
    /// May grow the look-ahead window, so it is not re-entrant; callers must
    /// not parallelize this across one wallet.
    #[allow(clippy::too_many_arguments)]
    fn detect_our_output(
        &mut self,
        tid: &Tid,
        tx_inputs_hash: &Hash,
        kd: &Option<KeyDerivation>,
        out_index: usize,
        spend_public_key: &PublicKey,
        secret_scalar: &SecretKey,
        key_output: &OutputKey,
    ) -> Result<Option<OurOutput>>;
}
