use crate::types::{AccountId, Coins, LotId, LotSource};
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid amount {amount}: must be greater than zero")]
    InvalidAmount { amount: Coins },

    #[error("Insufficient balance on account '{account_id}': requested {requested}, available {available}")]
    InsufficientBalance {
        account_id: AccountId,
        requested: Coins,
        available: Coins,
    },

    #[error("Idempotency key '{key}' already used on account '{account_id}'")]
    DuplicateIdempotencyKey { account_id: AccountId, key: String },

    #[error("Purchase key '{key}' was already credited to account '{account_id}'")]
    ReceiptClaimed { account_id: AccountId, key: String },

    #[error("Lots sourced from {lot_source} require an idempotency key")]
    MissingIdempotencyKey { lot_source: LotSource },

    #[error("Account '{account_id}' not found")]
    AccountNotFound { account_id: AccountId },

    #[error("Lot {lot_id} not found")]
    LotNotFound { lot_id: LotId },

    #[error("Balance of account '{account_id}' out of range: {balance} {delta:+}")]
    BalanceOutOfRange {
        account_id: AccountId,
        balance: Coins,
        delta: Coins,
    },

    #[error("Concurrent modification of {entity} '{id}'")]
    ConcurrencyConflict { entity: &'static str, id: String },

    #[error("Unknown coin package '{package_id}'")]
    UnknownPackage { package_id: String },

    #[error("Unknown reward '{reward_id}'")]
    UnknownReward { reward_id: String },

    #[error("Invalid {kind} value '{value}'")]
    InvalidValue { kind: &'static str, value: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LedgerError {
    /// Errors worth retrying: optimistic conflicts and SQLite lock contention.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConcurrencyConflict { .. } => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Record-level failures a batch job logs and steps over.
    pub fn is_record_fault(&self) -> bool {
        matches!(
            self,
            Self::AccountNotFound { .. }
                | Self::LotNotFound { .. }
                | Self::InvalidValue { .. }
                | Self::BalanceOutOfRange { .. }
        )
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_conflict_are_transient() {
        let busy = LedgerError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());

        let conflict = LedgerError::ConcurrencyConflict {
            entity: "lot",
            id: "7".into(),
        };
        assert!(conflict.is_transient());

        let insufficient = LedgerError::InsufficientBalance {
            account_id: "u1".into(),
            requested: 10,
            available: 5,
        };
        assert!(!insufficient.is_transient());
        assert!(!insufficient.is_record_fault());
        assert!(LedgerError::LotNotFound { lot_id: 3 }.is_record_fault());

        let overflow = LedgerError::BalanceOutOfRange {
            account_id: "u1".into(),
            balance: i64::MAX,
            delta: 1,
        };
        assert!(overflow.is_record_fault());
        assert!(!overflow.is_transient());
        assert_eq!(
            overflow.to_string(),
            format!("Balance of account 'u1' out of range: {} +1", i64::MAX)
        );
    }
}
