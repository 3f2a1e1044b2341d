//! Shared primitive types used across the entire ledger.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Whole coins. Signed so transaction rows can carry debits.
pub type Coins = i64;

/// The user-facing account identifier (owned by the identity collaborator).
pub type AccountId = String;

/// Lot ids are assigned by the store in strictly increasing order.
pub type LotId = i64;

pub type TransactionId = i64;

#[derive(Debug, Error)]
#[error("unrecognised {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// How a lot was acquired.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LotSource {
    Grant,
    Purchase,
    Reward,
}

impl LotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Purchase => "purchase",
            Self::Reward => "reward",
        }
    }

    /// Grants and purchases must carry a caller-derived idempotency key.
    pub fn requires_idempotency_key(&self) -> bool {
        matches!(self, Self::Grant | Self::Purchase)
    }

    /// The credit transaction kind written when a lot of this source is created.
    pub fn credit_kind(&self) -> TransactionKind {
        match self {
            Self::Grant => TransactionKind::Grant,
            Self::Purchase => TransactionKind::Purchase,
            Self::Reward => TransactionKind::Reward,
        }
    }
}

impl FromStr for LotSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(Self::Grant),
            "purchase" => Ok(Self::Purchase),
            "reward" => Ok(Self::Reward),
            other => Err(ParseEnumError {
                kind: "lot source",
                value: other.to_string(),
            }),
        }
    }
}

/// Lot lifecycle. `Exhausted` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LotStatus {
    Active,
    Exhausted,
    Expired,
}

impl LotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Exhausted => "exhausted",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl FromStr for LotStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "exhausted" => Ok(Self::Exhausted),
            "expired" => Ok(Self::Expired),
            other => Err(ParseEnumError {
                kind: "lot status",
                value: other.to_string(),
            }),
        }
    }
}

/// Audit-log entry kinds. Credits are positive, `Spend` and `Expire` negative.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Grant,
    Purchase,
    Reward,
    Spend,
    Expire,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Purchase => "purchase",
            Self::Reward => "reward",
            Self::Spend => "spend",
            Self::Expire => "expire",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(Self::Grant),
            "purchase" => Ok(Self::Purchase),
            "reward" => Ok(Self::Reward),
            "spend" => Ok(Self::Spend),
            "expire" => Ok(Self::Expire),
            other => Err(ParseEnumError {
                kind: "transaction kind",
                value: other.to_string(),
            }),
        }
    }
}

macro_rules! text_column {
    ($ty:ty) => {
        impl ::std::fmt::Display for $ty {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl ::rusqlite::types::ToSql for $ty {
            fn to_sql(&self) -> ::rusqlite::Result<::rusqlite::types::ToSqlOutput<'_>> {
                Ok(::rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl ::rusqlite::types::FromSql for $ty {
            fn column_result(
                value: ::rusqlite::types::ValueRef<'_>,
            ) -> ::rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| ::rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

pub(crate) use text_column;

text_column!(LotSource);
text_column!(LotStatus);
text_column!(TransactionKind);
