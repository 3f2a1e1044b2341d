//! Events the ledger emits to the notification collaborator.
//!
//! RULE: Events are never sent directly. They are queued in the outbox in the
//! same atomic unit as the state change that caused them, and delivered later
//! by the outbox dispatcher.

use crate::types::{AccountId, Coins, LotId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Variants are appended, never reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// A lot will expire within the warning window.
    ExpiryWarning {
        account_id: AccountId,
        lot_id: LotId,
        amount_remaining: Coins,
        expires_at: DateTime<Utc>,
    },
    /// The sweeper expired a lot's remaining coins.
    CoinsExpired {
        account_id: AccountId,
        lot_id: LotId,
        amount_expired: Coins,
        expired_at: DateTime<Utc>,
    },
}

impl LedgerEvent {
    /// Stable name for the `event_type` column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ExpiryWarning { .. } => "expiry_warning",
            Self::CoinsExpired { .. } => "coins_expired",
        }
    }

    pub fn account_id(&self) -> &str {
        match self {
            Self::ExpiryWarning { account_id, .. } | Self::CoinsExpired { account_id, .. } => {
                account_id
            }
        }
    }

    pub fn lot_id(&self) -> LotId {
        match self {
            Self::ExpiryWarning { lot_id, .. } | Self::CoinsExpired { lot_id, .. } => *lot_id,
        }
    }
}

/// An outbox row as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub outbox_id: i64,
    /// UUID consumers can deduplicate on; delivery is at-least-once.
    pub event_id: String,
    pub event_type: String,
    pub payload: String, // JSON-serialized LedgerEvent
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn event(&self) -> serde_json::Result<LedgerEvent> {
        serde_json::from_str(&self.payload)
    }
}
