use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

/// Local stand-in for the remote credit service, persisted as `credits.json`.
///
/// Each account is one top-level key. Every operation re-reads the file and
/// writes back only its own key, so two ledgers on the same file do not
/// clobber each other's accounts.
#[derive(Debug, Clone)]
pub struct CreditLedger {
    path: PathBuf,
    account: String,
}

impl CreditLedger {
    pub fn new(path: impl Into<PathBuf>, account: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            account: account.into(),
        }
    }

    /// Opens the ledger, seeding the account with `starting` credits when it
    /// has no row yet.
    pub fn open_with_balance(
        path: impl Into<PathBuf>,
        account: impl Into<String>,
        starting: u64,
    ) -> anyhow::Result<Self> {
        let ledger = Self::new(path, account);
        if ledger.row().is_none() {
            ledger.write_row(starting, 0)?;
        }
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn balance(&self) -> u64 {
        self.row()
            .and_then(|row| row.get("balance").and_then(Value::as_u64))
            .unwrap_or(0)
    }

    pub fn spent(&self) -> u64 {
        self.row()
            .and_then(|row| row.get("spent").and_then(Value::as_u64))
            .unwrap_or(0)
    }

    pub fn deposit(&self, amount: u64) -> anyhow::Result<u64> {
        let balance = self.balance().saturating_add(amount);
        self.write_row(balance, self.spent())?;
        Ok(balance)
    }

    /// Deducts `amount` when the balance covers it. Returns the new balance,
    /// or `None` without touching the file when it does not.
    pub fn try_charge(&self, amount: u64) -> anyhow::Result<Option<u64>> {
        let balance = self.balance();
        if balance < amount {
            return Ok(None);
        }
        let remaining = balance - amount;
        self.write_row(remaining, self.spent().saturating_add(amount))?;
        Ok(Some(remaining))
    }

    fn row(&self) -> Option<Map<String, Value>> {
        read_json_object(&self.path)?
            .get(&self.account)
            .and_then(Value::as_object)
            .cloned()
    }

    fn write_row(&self, balance: u64, spent: u64) -> anyhow::Result<()> {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        on_disk.insert(
            self.account.clone(),
            json!({
                "balance": balance,
                "spent": spent,
                "updated_at": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            }),
        );
        write_json_object(&self.path, &on_disk)
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::CreditLedger;

    #[test]
    fn seeded_balance_is_charged_and_refused() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let ledger = CreditLedger::open_with_balance(temp.path().join("credits.json"), "guest", 5)?;
        assert_eq!(ledger.balance(), 5);
        assert_eq!(ledger.try_charge(2)?, Some(3));
        assert_eq!(ledger.try_charge(4)?, None);
        assert_eq!(ledger.balance(), 3);
        assert_eq!(ledger.spent(), 2);
        Ok(())
    }

    #[test]
    fn seeding_does_not_reset_existing_account() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("credits.json");
        let ledger = CreditLedger::open_with_balance(&path, "guest", 10)?;
        ledger.try_charge(4)?;

        let reopened = CreditLedger::open_with_balance(&path, "guest", 10)?;
        assert_eq!(reopened.balance(), 6);
        Ok(())
    }

    #[test]
    fn accounts_on_one_file_stay_independent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("credits.json");
        let alice = CreditLedger::open_with_balance(&path, "alice", 3)?;
        let bob = CreditLedger::open_with_balance(&path, "bob", 8)?;

        alice.try_charge(1)?;
        bob.deposit(2)?;
        alice.try_charge(1)?;

        assert_eq!(CreditLedger::new(&path, "alice").balance(), 1);
        assert_eq!(CreditLedger::new(&path, "bob").balance(), 10);
        Ok(())
    }
}
