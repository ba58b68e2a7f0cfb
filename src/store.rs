//! Transaction persistence: the query contract and its SQLite and in-memory backends

use crate::config::StoreLocation;
use crate::data::{CustomerTotals, Transaction};
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transactions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_id TEXT    NOT NULL,
    occurred_at INTEGER NOT NULL,
    amount      REAL    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_customer ON transactions (customer_id);
CREATE INDEX IF NOT EXISTS idx_transactions_occurred ON transactions (occurred_at);
";

/// Filters pushed down to the source for grouped aggregation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TotalsQuery {
    pub customer_id: Option<String>,
    /// Inclusive lower bound on `occurred_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `occurred_at`
    pub before: Option<DateTime<Utc>>,
}

impl TotalsQuery {
    /// Transactions strictly before `reference`
    pub fn before(reference: DateTime<Utc>) -> Self {
        Self {
            before: Some(reference),
            ..Self::default()
        }
    }

    /// Transactions at or after `from`
    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            ..Self::default()
        }
    }

    pub fn for_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn matches(&self, transaction: &Transaction) -> bool {
        self.customer_id
            .as_deref()
            .map_or(true, |id| transaction.customer_id == id)
            && self.from.map_or(true, |from| transaction.occurred_at >= from)
            && self
                .before
                .map_or(true, |before| transaction.occurred_at < before)
    }
}

/// Read/append access to the transaction log
///
/// Implementations must read only committed transactions and return grouped
/// totals ordered by customer id.
pub trait TransactionSource {
    /// Append one transaction. Nothing is recorded if this fails.
    fn insert(&self, transaction: &Transaction) -> Result<()>;

    /// Number of transactions, optionally only those at or after `since`
    fn count(&self, since: Option<DateTime<Utc>>) -> Result<u64>;

    /// Number of distinct customers with at least one transaction
    fn distinct_customers(&self) -> Result<u64>;

    /// Per-customer `MAX(occurred_at)`, `COUNT(*)` and `SUM(amount)` under `query`
    fn totals(&self, query: &TotalsQuery) -> Result<Vec<CustomerTotals>>;
}

/// SQLite-backed transaction store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open the store named by a connection string location, creating the table if needed
    pub fn open(location: &StoreLocation) -> Result<Self> {
        let conn = match location {
            StoreLocation::Memory => Connection::open_in_memory()?,
            StoreLocation::File(path) => {
                info!("Opening transaction store at: {}", path.display());
                Connection::open(path)?
            }
        };
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PipelineError::LockPoisoned)
    }
}

impl TransactionSource for SqliteStore {
    fn insert(&self, transaction: &Transaction) -> Result<()> {
        transaction.validate()?;
        debug!(
            "Recording transaction for customer {} ({:.2})",
            transaction.customer_id, transaction.amount
        );

        self.conn()?.execute(
            "INSERT INTO transactions (customer_id, occurred_at, amount) VALUES (?1, ?2, ?3)",
            params![
                transaction.customer_id,
                transaction.occurred_at.timestamp_micros(),
                transaction.amount
            ],
        )?;
        Ok(())
    }

    fn count(&self, since: Option<DateTime<Utc>>) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = match since {
            Some(since) => conn.query_row(
                "SELECT COUNT(*) FROM transactions WHERE occurred_at >= ?1",
                params![since.timestamp_micros()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    fn distinct_customers(&self) -> Result<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(DISTINCT customer_id) FROM transactions",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn totals(&self, query: &TotalsQuery) -> Result<Vec<CustomerTotals>> {
        let mut sql = String::from(
            "SELECT customer_id, MAX(occurred_at), COUNT(*), SUM(amount) FROM transactions",
        );
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if let Some(customer_id) = &query.customer_id {
            clauses.push("customer_id = ?");
            values.push(Value::Text(customer_id.clone()));
        }
        if let Some(from) = query.from {
            clauses.push("occurred_at >= ?");
            values.push(Value::Integer(from.timestamp_micros()));
        }
        if let Some(before) = query.before {
            clauses.push("occurred_at < ?");
            values.push(Value::Integer(before.timestamp_micros()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" GROUP BY customer_id ORDER BY customer_id");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        let mut totals = Vec::new();
        for row in rows {
            let (customer_id, last_micros, count, amount_sum) = row?;
            let last_at = DateTime::from_timestamp_micros(last_micros)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, last_micros))?;
            totals.push(CustomerTotals {
                customer_id,
                last_at,
                count: count as u64,
                amount_sum,
            });
        }

        debug!("Totals query returned {} customers", totals.len());
        Ok(totals)
    }
}

/// In-process transaction log, used where no database is wanted
#[derive(Debug, Default)]
pub struct MemoryStore {
    transactions: RwLock<Vec<Transaction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transactions(transactions: Vec<Transaction>) -> Result<Self> {
        for transaction in &transactions {
            transaction.validate()?;
        }
        Ok(Self {
            transactions: RwLock::new(transactions),
        })
    }
}

impl TransactionSource for MemoryStore {
    fn insert(&self, transaction: &Transaction) -> Result<()> {
        transaction.validate()?;
        self.transactions
            .write()
            .map_err(|_| PipelineError::LockPoisoned)?
            .push(transaction.clone());
        Ok(())
    }

    fn count(&self, since: Option<DateTime<Utc>>) -> Result<u64> {
        let transactions = self
            .transactions
            .read()
            .map_err(|_| PipelineError::LockPoisoned)?;
        let count = transactions
            .iter()
            .filter(|t| since.map_or(true, |since| t.occurred_at >= since))
            .count();
        Ok(count as u64)
    }

    fn distinct_customers(&self) -> Result<u64> {
        let transactions = self
            .transactions
            .read()
            .map_err(|_| PipelineError::LockPoisoned)?;
        let customers: BTreeSet<&str> = transactions
            .iter()
            .map(|t| t.customer_id.as_str())
            .collect();
        Ok(customers.len() as u64)
    }

    fn totals(&self, query: &TotalsQuery) -> Result<Vec<CustomerTotals>> {
        let transactions = self
            .transactions
            .read()
            .map_err(|_| PipelineError::LockPoisoned)?;

        let mut grouped: BTreeMap<&str, CustomerTotals> = BTreeMap::new();
        for transaction in transactions.iter().filter(|t| query.matches(t)) {
            grouped
                .entry(transaction.customer_id.as_str())
                .and_modify(|totals| {
                    totals.last_at = totals.last_at.max(transaction.occurred_at);
                    totals.count += 1;
                    totals.amount_sum += transaction.amount;
                })
                .or_insert_with(|| CustomerTotals {
                    customer_id: transaction.customer_id.clone(),
                    last_at: transaction.occurred_at,
                    count: 1,
                    amount_sum: transaction.amount,
                });
        }

        Ok(grouped.into_values().collect())
    }
}
