use serde::{Deserialize, Serialize};
use crate::{
    store::{CreateLotOutcome, LotDebit},
    types::{AccountId, Coins, LotId},
};

/// On-demand ledger operations, submittable as JSON.
/// Variants are appended, never removed or reordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum LedgerCommand {
    Purchase {
        account_id:           AccountId,
        package_id:           String,
        store_transaction_id: String,
    },
    ClaimReward {
        account_id: AccountId,
        reward_id:  String,
        claim_key:  String,
    },
    Spend {
        account_id: AccountId,
        amount:     Coins,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memo:       Option<String>,
    },
}

impl LedgerCommand {
    pub fn account_id(&self) -> &str {
        match self {
            Self::Purchase { account_id, .. }
            | Self::ClaimReward { account_id, .. }
            | Self::Spend { account_id, .. } => account_id,
        }
    }
}

/// Result of applying a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Credited {
        lot_id:    LotId,
        amount:    Coins,
        /// False when the idempotency key had already been used.
        new:       bool,
        balance:   Coins,
    },
    Spent {
        debits:    Vec<LotDebit>,
        balance:   Coins,
    },
}

impl CommandOutcome {
    pub fn credited(outcome: &CreateLotOutcome, balance: Coins) -> Self {
        let lot = outcome.lot();
        Self::Credited {
            lot_id: lot.lot_id,
            amount: lot.amount_original,
            new: outcome.is_new(),
            balance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_tagged_json() {
        let cmd: LedgerCommand =
            serde_json::from_str(r#"{"cmd":"spend","account_id":"u1","amount":40}"#).unwrap();
        assert_eq!(
            cmd,
            LedgerCommand::Spend {
                account_id: "u1".into(),
                amount: 40,
                memo: None,
            }
        );
        let cmd: LedgerCommand = serde_json::from_str(
            r#"{"cmd":"purchase","account_id":"u2","package_id":"starter","store_transaction_id":"gp-1"}"#,
        )
        .unwrap();
        assert_eq!(cmd.account_id(), "u2");
    }
}
