//! Subscription tiers, the monthly grant table, and the billing-period cursor.
//!
//! Tier state itself belongs to the billing collaborator. The ledger only
//! consumes a lookup through [`SubscriptionDirectory`].

use crate::{
    error::{LedgerError, LedgerResult},
    types::{text_column, AccountId, Coins, ParseEnumError},
};
use chrono::{DateTime, Datelike, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Basic,
    Silver,
    Gold,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Silver => "silver",
            Self::Gold => "gold",
        }
    }
}

impl FromStr for SubscriptionTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Self::Basic),
            "silver" => Ok(Self::Silver),
            "gold" => Ok(Self::Gold),
            other => Err(ParseEnumError {
                kind: "subscription tier",
                value: other.to_string(),
            }),
        }
    }
}

text_column!(SubscriptionTier);

/// Monthly allowance per tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrantSchedule {
    pub basic: Coins,
    pub silver: Coins,
    pub gold: Coins,
}

impl GrantSchedule {
    pub fn monthly_amount(&self, tier: SubscriptionTier) -> Coins {
        match tier {
            SubscriptionTier::Basic => self.basic,
            SubscriptionTier::Silver => self.silver,
            SubscriptionTier::Gold => self.gold,
        }
    }
}

impl Default for GrantSchedule {
    fn default() -> Self {
        Self {
            basic: 0,
            silver: 100,
            gold: 250,
        }
    }
}

/// A calendar month in UTC, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GrantPeriod {
    year: i32,
    month: u32,
}

impl GrantPeriod {
    pub fn new(year: i32, month: u32) -> LedgerResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(LedgerError::InvalidValue {
                kind: "grant period",
                value: format!("{year:04}-{month:02}"),
            });
        }
        Ok(Self { year, month })
    }

    /// The period containing `at`.
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Period-scoped grant key: reruns within the same month collide on it.
    pub fn grant_key(&self, account_id: &str) -> String {
        format!("grant:{account_id}:{self}")
    }
}

impl fmt::Display for GrantPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for GrantPeriod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LedgerError::InvalidValue {
            kind: "grant period",
            value: s.to_string(),
        };
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }
}

impl TryFrom<String> for GrantPeriod {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GrantPeriod> for String {
    fn from(period: GrantPeriod) -> Self {
        period.to_string()
    }
}

impl ToSql for GrantPeriod {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for GrantPeriod {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: LedgerError| FromSqlError::Other(Box::new(e)))
    }
}

/// An account holding a subscription in the period being granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub account_id: AccountId,
    pub tier: SubscriptionTier,
}

/// Tier lookup supplied by the subscription/billing collaborator.
pub trait SubscriptionDirectory: Send {
    /// Every account holding a subscription during `period`.
    fn subscribers(&self, period: GrantPeriod) -> LedgerResult<Vec<Subscriber>>;
}

/// In-process directory. Clones share the same table, so a caller can keep a
/// handle and change tiers after handing a clone to the engine.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    tiers: Arc<RwLock<BTreeMap<AccountId, SubscriptionTier>>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tier(&self, account_id: &str, tier: SubscriptionTier) {
        if let Ok(mut tiers) = self.tiers.write() {
            tiers.insert(account_id.to_string(), tier);
        }
    }

    pub fn remove(&self, account_id: &str) {
        if let Ok(mut tiers) = self.tiers.write() {
            tiers.remove(account_id);
        }
    }
}

impl SubscriptionDirectory for StaticDirectory {
    fn subscribers(&self, _period: GrantPeriod) -> LedgerResult<Vec<Subscriber>> {
        let tiers = self
            .tiers
            .read()
            .map_err(|_| anyhow::anyhow!("subscription directory lock poisoned"))?;
        Ok(tiers
            .iter()
            .map(|(account_id, tier)| Subscriber {
                account_id: account_id.clone(),
                tier: *tier,
            })
            .collect())
    }
}
