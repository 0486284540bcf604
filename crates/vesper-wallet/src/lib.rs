//! Vesper wallet storage core.
//!
//! Holds spend/view key material encrypted at rest, derives deterministic
//! sub-address windows from a seed, and detects which transaction outputs
//! belong to the wallet. Two backends implement the same [`Wallet`]
//! contract: the flat encrypted container file ([`WalletContainer`]) kept
//! for backward compatibility, and the SQLite-backed hierarchical-
//! deterministic wallet ([`WalletHd`]).

pub mod container;
pub mod error;
pub mod hd;
pub mod mnemonic;
pub mod types;
pub mod wallet;

pub use container::{wallet_file_size, WalletContainer};
pub use error::{Result, WalletError};
pub use hd::{check_bip39_mnemonic, WalletHd, GENERATE_AHEAD};
pub use mnemonic::{generate_mnemonic, phrase_crc32};
pub use types::{
    AccountAddress, Amount, BinaryBlob, History, Network, OurOutput, OutputKey, Tid, Timestamp,
    WalletRecord, ADDRESS_TYPE_UNLINKABLE, ADDRESS_TYPE_UNLINKABLE_AUDITABLE, COIN_NAME,
    TIMESTAMP_MAX,
};
pub use wallet::{OutputHandler, Wallet};
