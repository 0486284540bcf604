//! Core wallet value types: records, addresses, networks, coin constants.

use serde::{Deserialize, Serialize};
use vesper_crypto::{Hash, KeyPair, PublicKey, SecretKey};

/// Coin name persisted in HD wallet files.
pub const COIN_NAME: &str = "vesper";

/// HD wallet version string.
pub const WALLET_VERSION: &str = "CryptoNoteWallet1";

/// Unix timestamp in seconds. 0 means "unknown", `MAX` means "never rescan".
pub type Timestamp = u64;

pub const TIMESTAMP_MAX: Timestamp = u64::MAX;

pub type Amount = u64;

/// Address type byte stored in HD wallets.
pub const ADDRESS_TYPE_UNLINKABLE: u8 = 1;
pub const ADDRESS_TYPE_UNLINKABLE_AUDITABLE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Main,
    Test,
    Stage,
}

impl Network {
    pub fn name(self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Stage => "stage",
        }
    }

    /// Path and parameter-key suffix: empty for main, "_<net>net" otherwise.
    pub fn suffix(self) -> String {
        match self {
            Network::Main => String::new(),
            other => format!("_{}net", other.name()),
        }
    }
}

/// One addressable sub-account.
///
/// An all-zero spend secret marks a tracking-only record; either every record
/// in a wallet is tracking or none is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletRecord {
    pub spend_public_key: PublicKey,
    pub spend_secret_key: SecretKey,
    pub creation_timestamp: Timestamp,
}

/// A wallet address, tagged by flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccountAddress {
    Simple {
        spend_public_key: PublicKey,
        view_public_key: PublicKey,
    },
    Unlinkable {
        s: PublicKey,
        s_v: PublicKey,
        is_auditable: bool,
    },
}

/// A transaction output as seen by the scanner.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputKey {
    pub amount: Amount,
    pub public_key: PublicKey,
    /// Unlinkable outputs only.
    pub encrypted_secret: PublicKey,
    pub is_auditable: bool,
}

/// A detected output of ours: what `detect_our_output` hands the scanner.
#[derive(Debug, Clone, Copy)]
pub struct OurOutput {
    pub amount: Amount,
    /// Zero secret for view-only wallets.
    pub output_keypair: KeyPair,
    pub address: AccountAddress,
}

/// Addresses a transaction was sent to, restored from history storage.
pub type History = std::collections::BTreeSet<AccountAddress>;

/// Raw binary transaction blob held in the payment queue.
pub type BinaryBlob = Vec<u8>;

/// Transaction id.
pub type Tid = Hash;
