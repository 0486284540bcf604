//! Wallet error types.
//!
//! Every error carries the numeric tag the RPC layer reports upward.

use thiserror::Error;

pub const WALLET_FILE_READ_ERROR: i32 = 205;
pub const WALLET_FILE_UNKNOWN_VERSION: i32 = 206;
pub const WALLET_FILE_DECRYPT_ERROR: i32 = 207;
pub const WALLET_FILE_WRITE_ERROR: i32 = 208;
pub const WALLETD_MNEMONIC_CRC: i32 = 209;
pub const NOT_SUPPORTED: i32 = 101;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet file read error: {0}")]
    FileRead(String),

    #[error("unknown wallet file version")]
    UnknownVersion,

    #[error("wallet file decrypt error: {0}")]
    Decrypt(String),

    #[error("wallet file write error: {0}")]
    Write(String),

    #[error("wrong mnemonic: {0}")]
    MnemonicCrc(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl WalletError {
    /// Numeric tag consumed by the outer RPC layer.
    pub fn code(&self) -> i32 {
        match self {
            WalletError::FileRead(_) | WalletError::Io(_) | WalletError::Database(_) => {
                WALLET_FILE_READ_ERROR
            }
            WalletError::UnknownVersion => WALLET_FILE_UNKNOWN_VERSION,
            WalletError::Decrypt(_) => WALLET_FILE_DECRYPT_ERROR,
            WalletError::Write(_) => WALLET_FILE_WRITE_ERROR,
            WalletError::MnemonicCrc(_) => WALLETD_MNEMONIC_CRC,
            WalletError::NotSupported(_) | WalletError::InvalidArgument(_) => NOT_SUPPORTED,
        }
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(WalletError::UnknownVersion.code(), 206);
        assert_eq!(WalletError::Decrypt("bad".into()).code(), 207);
        assert_eq!(WalletError::Write("disk".into()).code(), 208);
        assert_eq!(WalletError::MnemonicCrc("crc".into()).code(), 209);
        assert_eq!(WalletError::NotSupported("labels".into()).code(), 101);
    }
}
