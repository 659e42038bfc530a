use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use duky_contracts::errors::GenerationError;
use duky_contracts::models::ModelVersion;
use duky_contracts::runs::ledger::CreditLedger;
use serde_json::{Map, Value};

const DEFAULT_CREDIT_TABLE_JSON: &str = include_str!("../resources/default_credits.json");

/// Per-image prices keyed by model tier (`image-v2`, `image-v3`).
#[derive(Debug, Clone)]
pub struct CreditTable {
    rows: BTreeMap<String, Map<String, Value>>,
}

impl CreditTable {
    /// Embedded table merged with `~/.duky/credit_overrides.json` when present.
    pub fn load() -> Self {
        let mut table = Self::from_json(DEFAULT_CREDIT_TABLE_JSON);
        if let Some(path) = credit_override_path() {
            if let Ok(raw) = std::fs::read_to_string(path) {
                table.merge_json(&raw);
            }
        }
        table
    }

    pub fn embedded() -> Self {
        Self::from_json(DEFAULT_CREDIT_TABLE_JSON)
    }

    pub fn from_json(raw: &str) -> Self {
        let mut table = Self {
            rows: BTreeMap::new(),
        };
        table.merge_json(raw);
        table
    }

    /// Field-level merge: an override row only replaces the fields it names.
    pub fn merge_json(&mut self, raw: &str) {
        let Ok(payload) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        let Some(table) = payload.as_object() else {
            return;
        };
        for (key, row_value) in table {
            let Some(row) = row_value.as_object() else {
                continue;
            };
            let entry = self.rows.entry(key.to_string()).or_default();
            for (field, field_value) in row {
                entry.insert(field.to_string(), field_value.clone());
            }
        }
    }

    pub fn per_image_cost(&self, version: ModelVersion) -> u64 {
        self.rows
            .get(version.credit_key())
            .and_then(|row| row.get("credits_per_image"))
            .and_then(Value::as_u64)
            .unwrap_or_else(|| fallback_cost(version))
    }

    pub fn batch_cost(&self, version: ModelVersion, count: usize) -> u64 {
        self.per_image_cost(version).saturating_mul(count as u64)
    }
}

fn fallback_cost(version: ModelVersion) -> u64 {
    match version {
        ModelVersion::V2 => 1,
        ModelVersion::V3 => 2,
    }
}

fn credit_override_path() -> Option<PathBuf> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".duky").join("credit_overrides.json"))
}

/// Balance collaborator consulted before a batch and charged per success.
pub trait CreditBalance: Send + Sync {
    fn available(&self) -> Result<u64>;

    /// Advisory pre-flight check. A mid-batch balance change is not
    /// re-validated here; `charge` is the authoritative deduction.
    fn check(&self, cost: u64) -> Result<bool> {
        Ok(self.available()? >= cost)
    }

    /// Deducts `cost` and returns the remaining balance.
    fn charge(&self, cost: u64) -> Result<u64, GenerationError>;
}

/// File-backed account on top of [`CreditLedger`]. The mutex serializes the
/// read-modify-write cycle across worker threads.
pub struct LocalCreditAccount {
    ledger: Mutex<CreditLedger>,
}

impl LocalCreditAccount {
    pub fn open(path: impl Into<PathBuf>, account: &str, starting: u64) -> Result<Self> {
        Ok(Self {
            ledger: Mutex::new(CreditLedger::open_with_balance(path, account, starting)?),
        })
    }

    pub fn deposit(&self, amount: u64) -> Result<u64> {
        let ledger = self
            .ledger
            .lock()
            .map_err(|_| anyhow::anyhow!("credit ledger lock poisoned"))?;
        ledger.deposit(amount)
    }

    pub fn spent(&self) -> Result<u64> {
        let ledger = self
            .ledger
            .lock()
            .map_err(|_| anyhow::anyhow!("credit ledger lock poisoned"))?;
        Ok(ledger.spent())
    }
}

impl CreditBalance for LocalCreditAccount {
    fn available(&self) -> Result<u64> {
        let ledger = self
            .ledger
            .lock()
            .map_err(|_| anyhow::anyhow!("credit ledger lock poisoned"))?;
        Ok(ledger.balance())
    }

    fn charge(&self, cost: u64) -> Result<u64, GenerationError> {
        let ledger = self
            .ledger
            .lock()
            .map_err(|_| GenerationError::Internal("credit ledger lock poisoned".to_string()))?;
        match ledger.try_charge(cost) {
            Ok(Some(remaining)) => Ok(remaining),
            Ok(None) => Err(GenerationError::insufficient_credits(format!(
                "balance {} is below {cost}",
                ledger.balance()
            ))),
            Err(err) => Err(GenerationError::Internal(format!(
                "credit ledger write failed: {err:#}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use duky_contracts::models::ModelVersion;

    use super::{CreditBalance, CreditTable, LocalCreditAccount};

    #[test]
    fn embedded_table_is_a_step_function_of_version() {
        let table = CreditTable::embedded();
        assert_eq!(table.per_image_cost(ModelVersion::V2), 1);
        assert_eq!(table.per_image_cost(ModelVersion::V3), 2);
        assert_eq!(table.batch_cost(ModelVersion::V3, 4), 8);
        assert_eq!(table.batch_cost(ModelVersion::V2, 0), 0);
    }

    #[test]
    fn override_replaces_only_named_fields() {
        let mut table = CreditTable::embedded();
        table.merge_json(r#"{"image-v3": {"credits_per_image": 5}, "broken": 3}"#);
        assert_eq!(table.per_image_cost(ModelVersion::V3), 5);
        assert_eq!(table.per_image_cost(ModelVersion::V2), 1);

        table.merge_json("not json");
        assert_eq!(table.per_image_cost(ModelVersion::V3), 5);
    }

    #[test]
    fn local_account_checks_and_charges() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let account = LocalCreditAccount::open(temp.path().join("credits.json"), "guest", 3)?;
        assert!(account.check(3)?);
        assert!(!account.check(4)?);

        assert_eq!(account.charge(2), Ok(1));
        let refused = account.charge(2);
        assert!(matches!(refused, Err(ref err) if err.is_insufficient_credits()));
        assert_eq!(account.available()?, 1);
        assert_eq!(account.spent()?, 2);
        Ok(())
    }
}
