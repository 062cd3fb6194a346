use crate::utils::now_ms;
use alloy::primitives::{Address, U256};
use anyhow::Context;
use rusqlite::{params, Connection};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

const ACTION_DISCOVER: &str = "discover";
const ACTION_CLAIM: &str = "claim";
const ACTION_EXECUTE: &str = "execute";

/// Append-only bookkeeping of what each controlled account discovered,
/// claimed and executed, with the costs and bounties involved. Read-side
/// aggregates back the node-level reports.
pub struct StatsStore {
    conn: Mutex<Connection>,
}

impl StatsStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("open stats database")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory stats database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS stats_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account TEXT NOT NULL,
                tx_address TEXT NOT NULL,
                action TEXT NOT NULL,
                success INTEGER NOT NULL,
                cost TEXT NOT NULL,
                bounty TEXT NOT NULL,
                ts_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stats_account_action
                ON stats_entries (account, action, success);",
        )
        .context("create stats schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn insert(
        &self,
        account: Address,
        tx_address: Address,
        action: &str,
        success: bool,
        cost: U256,
        bounty: U256,
    ) -> anyhow::Result<()> {
        self.lock()
            .execute(
                "INSERT INTO stats_entries
                    (account, tx_address, action, success, cost, bounty, ts_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    account.to_string(),
                    tx_address.to_string(),
                    action,
                    success as i64,
                    cost.to_string(),
                    bounty.to_string(),
                    now_ms() as i64,
                ],
            )
            .context("insert stats entry")?;
        Ok(())
    }

    /// Record a discovery once per (account, candidate) pair.
    pub fn discovered(&self, account: Address, tx_address: Address) -> anyhow::Result<()> {
        let exists: bool = self
            .lock()
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM stats_entries
                    WHERE account = ?1 AND tx_address = ?2 AND action = ?3
                )",
                params![account.to_string(), tx_address.to_string(), ACTION_DISCOVER],
                |row| row.get(0),
            )
            .context("check discovery entry")?;
        if exists {
            return Ok(());
        }
        self.insert(
            account,
            tx_address,
            ACTION_DISCOVER,
            true,
            U256::ZERO,
            U256::ZERO,
        )
    }

    pub fn update_claimed(
        &self,
        account: Address,
        tx_address: Address,
        cost: U256,
    ) -> anyhow::Result<()> {
        self.insert(account, tx_address, ACTION_CLAIM, true, cost, U256::ZERO)
    }

    pub fn add_failed_claim(&self, account: Address, tx_address: Address) -> anyhow::Result<()> {
        self.insert(
            account,
            tx_address,
            ACTION_CLAIM,
            false,
            U256::ZERO,
            U256::ZERO,
        )
    }

    pub fn update_executed(
        &self,
        account: Address,
        tx_address: Address,
        bounty: U256,
        cost: U256,
        success: bool,
    ) -> anyhow::Result<()> {
        self.insert(account, tx_address, ACTION_EXECUTE, success, cost, bounty)
    }

    pub fn failed_claims(&self, account: Address) -> anyhow::Result<Vec<Address>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT tx_address FROM stats_entries
                 WHERE account = ?1 AND action = ?2 AND success = 0
                 ORDER BY id",
            )
            .context("prepare failed-claims query")?;
        let rows = stmt
            .query_map(params![account.to_string(), ACTION_CLAIM], |row| {
                row.get::<_, String>(0)
            })
            .context("query failed claims")?;
        let mut out = Vec::new();
        for row in rows {
            let raw = row.context("read failed-claim row")?;
            if let Ok(address) = Address::from_str(&raw) {
                out.push(address);
            }
        }
        Ok(out)
    }

    pub fn discovered_count(&self, account: Address) -> anyhow::Result<u64> {
        let count: i64 = self
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM stats_entries
                 WHERE account = ?1 AND action = ?2",
                params![account.to_string(), ACTION_DISCOVER],
                |row| row.get(0),
            )
            .context("count discoveries")?;
        Ok(count as u64)
    }

    fn sum_column(
        &self,
        account: Address,
        column: &str,
        action_filter: Option<(&str, bool)>,
    ) -> anyhow::Result<U256> {
        let conn = self.lock();
        let mut sum = U256::ZERO;
        let (sql, params_vec): (String, Vec<String>) = match action_filter {
            Some((action, success)) => (
                format!(
                    "SELECT {column} FROM stats_entries
                     WHERE account = ?1 AND action = ?2 AND success = ?3"
                ),
                vec![
                    account.to_string(),
                    action.to_string(),
                    (success as i64).to_string(),
                ],
            ),
            None => (
                format!("SELECT {column} FROM stats_entries WHERE account = ?1"),
                vec![account.to_string()],
            ),
        };
        let mut stmt = conn.prepare(&sql).context("prepare aggregate query")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
                row.get::<_, String>(0)
            })
            .context("query aggregate")?;
        for row in rows {
            let raw = row.context("read aggregate row")?;
            if let Ok(value) = U256::from_str_radix(&raw, 10) {
                sum = sum.saturating_add(value);
            }
        }
        Ok(sum)
    }

    /// Total gas spend attributed to an account, across claims and executions.
    pub fn total_cost(&self, account: Address) -> anyhow::Result<U256> {
        self.sum_column(account, "cost", None)
    }

    /// Total bounty earned by an account through successful executions.
    pub fn total_bounty(&self, account: Address) -> anyhow::Result<U256> {
        self.sum_column(account, "bounty", Some((ACTION_EXECUTE, true)))
    }

    pub fn clear(&self, account: Address) -> anyhow::Result<()> {
        self.lock()
            .execute(
                "DELETE FROM stats_entries WHERE account = ?1",
                params![account.to_string()],
            )
            .context("clear account entries")?;
        Ok(())
    }

    pub fn clear_all(&self) -> anyhow::Result<()> {
        self.lock()
            .execute("DELETE FROM stats_entries", [])
            .context("clear stats entries")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_discovered_is_idempotent_per_pair() {
        let stats = StatsStore::open_in_memory().expect("db");
        let account = address!("48e258a63f5acd3630d9e2a4e2c6a9f8f6aed4e8");
        let tx = address!("72059fee98e3a3fa80618cb1446b550af0f5e1ec");

        stats.discovered(account, tx).expect("insert");
        stats.discovered(account, tx).expect("insert");
        assert_eq!(stats.discovered_count(account).expect("count"), 1);

        let other = address!("a4b197b83b06f97c1be081e95f872458f7f9a978");
        stats.discovered(account, other).expect("insert");
        assert_eq!(stats.discovered_count(account).expect("count"), 2);
    }

    #[test]
    fn test_failed_claims_lists_only_failures() {
        let stats = StatsStore::open_in_memory().expect("db");
        let account = address!("48e258a63f5acd3630d9e2a4e2c6a9f8f6aed4e8");
        let ok_tx = address!("72059fee98e3a3fa80618cb1446b550af0f5e1ec");
        let bad_tx = address!("a4b197b83b06f97c1be081e95f872458f7f9a978");

        stats
            .update_claimed(account, ok_tx, U256::from(1_000))
            .expect("insert");
        stats.add_failed_claim(account, bad_tx).expect("insert");

        assert_eq!(stats.failed_claims(account).expect("query"), vec![bad_tx]);
    }

    #[test]
    fn test_totals_aggregate_cost_and_bounty() {
        let stats = StatsStore::open_in_memory().expect("db");
        let account = address!("48e258a63f5acd3630d9e2a4e2c6a9f8f6aed4e8");
        let tx = address!("72059fee98e3a3fa80618cb1446b550af0f5e1ec");

        stats
            .update_claimed(account, tx, U256::from(1_000))
            .expect("insert");
        stats
            .update_executed(account, tx, U256::from(1_500_000u64), U256::from(300), true)
            .expect("insert");
        stats
            .update_executed(account, tx, U256::ZERO, U256::from(200), false)
            .expect("insert");

        assert_eq!(
            stats.total_cost(account).expect("sum"),
            U256::from(1_500)
        );
        // Failed executions contribute no bounty.
        assert_eq!(
            stats.total_bounty(account).expect("sum"),
            U256::from(1_500_000u64)
        );
    }

    #[test]
    fn test_clear_scopes_to_account() {
        let stats = StatsStore::open_in_memory().expect("db");
        let a = address!("48e258a63f5acd3630d9e2a4e2c6a9f8f6aed4e8");
        let b = address!("a4b197b83b06f97c1be081e95f872458f7f9a978");
        let tx = address!("72059fee98e3a3fa80618cb1446b550af0f5e1ec");

        stats.discovered(a, tx).expect("insert");
        stats.discovered(b, tx).expect("insert");
        stats.clear(a).expect("clear");

        assert_eq!(stats.discovered_count(a).expect("count"), 0);
        assert_eq!(stats.discovered_count(b).expect("count"), 1);
    }
}
