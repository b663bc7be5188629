use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::models::{Category, LogRecord, NewRecord};
use crate::projections::{month_start, next_month_start, trailing_year_start, SparseCounts};

/// Name seeded into an empty category table.
pub const DEFAULT_CATEGORY: &str = "Default";

/// Minimum Jaro-Winkler similarity for a category name suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.8;

/// Read contract the selection controller depends on.
///
/// All bucket queries return sparse rows keyed by zero-padded labels
/// (`"00"`..`"23"`, `"01"`..`"31"`, `"01"`..`"12"`) in local time.
pub trait RecordStore: Send + Sync + 'static {
    fn count(&self, category_id: i64) -> Result<u64, StoreError>;

    /// Newest first; ties on timestamp fall back to id so page boundaries
    /// stay put between queries.
    fn page(&self, category_id: i64, offset: u64, limit: u64) -> Result<Vec<LogRecord>, StoreError>;

    fn hour_buckets(&self, category_id: i64) -> Result<SparseCounts, StoreError>;

    /// Restricted to the calendar month containing `today`.
    fn day_buckets(&self, category_id: i64, today: NaiveDate) -> Result<SparseCounts, StoreError>;

    /// Restricted to the twelve months ending with `today`'s month.
    fn month_buckets(&self, category_id: i64, today: NaiveDate) -> Result<SparseCounts, StoreError>;

    /// Name ascending.
    fn categories(&self) -> Result<Vec<Category>, StoreError>;
}

/// SQLite-backed record store. Opened once at startup and closed at
/// shutdown; queries serialize on the single connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "\
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "\
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS categories (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS records (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp INTEGER NOT NULL,
              label TEXT NOT NULL,
              notes TEXT,
              category_id INTEGER,
              FOREIGN KEY(category_id) REFERENCES categories(id)
                ON UPDATE CASCADE ON DELETE SET NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_category_ts
              ON records(category_id, timestamp DESC);",
        )?;
        conn.execute(
            "INSERT INTO categories (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            params![DEFAULT_CATEGORY],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Closes the connection, reporting any error SQLite raises on close.
    pub fn close(self) -> Result<(), StoreError> {
        let conn = self.conn.into_inner().map_err(|_| StoreError::Poisoned)?;
        conn.close().map_err(|(_, err)| StoreError::Sqlite(err))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn insert(&self, record: &NewRecord) -> Result<LogRecord, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO records (timestamp, label, notes, category_id) VALUES (?1, ?2, ?3, ?4)",
            params![record.timestamp, record.label, record.notes, record.category_id],
        )
        .map_err(|err| match (err.sqlite_error_code(), record.category_id) {
            (Some(rusqlite::ErrorCode::ConstraintViolation), Some(id)) => {
                StoreError::unknown_category(&id.to_string(), None)
            }
            _ => StoreError::Sqlite(err),
        })?;

        Ok(LogRecord {
            id: conn.last_insert_rowid(),
            timestamp: record.timestamp,
            label: record.label.clone(),
            notes: record.notes.clone(),
            category_id: record.category_id,
        })
    }

    /// Deletes a record and returns it, so the caller knows which filter
    /// the deletion affected.
    pub fn delete(&self, id: i64) -> Result<Option<LogRecord>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let record = tx
            .query_row(
                "SELECT id, timestamp, label, notes, category_id FROM records WHERE id = ?1",
                params![id],
                read_record,
            )
            .optional()?;
        if record.is_some() {
            tx.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(record)
    }

    /// Removes every record in every category. Categories stay.
    pub fn delete_all_records(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM records", [])?)
    }

    pub fn create_category(&self, name: &str) -> Result<Category, StoreError> {
        let name = name.trim();
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO categories (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateCategory(name.to_string()));
        }

        Ok(Category {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
        })
    }

    /// Records owned by the category keep existing with no category.
    pub fn delete_category(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM categories WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Case-insensitive lookup. Unknown names carry the closest existing
    /// name as a suggestion when one is similar enough.
    pub fn category_by_name(&self, name: &str) -> Result<Category, StoreError> {
        let wanted = name.trim().to_lowercase();
        let categories = self.categories()?;

        if let Some(found) = categories.iter().find(|c| c.name.to_lowercase() == wanted) {
            return Ok(found.clone());
        }

        let suggestion = categories
            .iter()
            .map(|c| (strsim::jaro_winkler(&wanted, &c.name.to_lowercase()), c))
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, c)| c.name.as_str());

        Err(StoreError::unknown_category(name.trim(), suggestion))
    }

    fn bucket_query(&self, sql: &str, args: impl rusqlite::Params) -> Result<SparseCounts, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            let label: Option<String> = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((label.unwrap_or_default(), count.max(0) as u64))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl RecordStore for SqliteStore {
    fn count(&self, category_id: i64) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE category_id = ?1",
            params![category_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn page(&self, category_id: i64, offset: u64, limit: u64) -> Result<Vec<LogRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "\
            SELECT id, timestamp, label, notes, category_id
            FROM records
            WHERE category_id = ?1
            ORDER BY timestamp DESC, id DESC
            LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            params![category_id, clamp_i64(limit), clamp_i64(offset)],
            read_record,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn hour_buckets(&self, category_id: i64) -> Result<SparseCounts, StoreError> {
        self.bucket_query(
            "\
            SELECT strftime('%H', timestamp / 1000, 'unixepoch', 'localtime') AS hour, COUNT(*)
            FROM records
            WHERE category_id = ?1
            GROUP BY hour
            ORDER BY hour ASC",
            params![category_id],
        )
    }

    fn day_buckets(&self, category_id: i64, today: NaiveDate) -> Result<SparseCounts, StoreError> {
        self.bucket_query(
            "\
            SELECT strftime('%d', timestamp / 1000, 'unixepoch', 'localtime') AS day, COUNT(*)
            FROM records
            WHERE category_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
            GROUP BY day
            ORDER BY day ASC",
            params![
                category_id,
                local_midnight_millis(month_start(today)),
                local_midnight_millis(next_month_start(today)),
            ],
        )
    }

    fn month_buckets(&self, category_id: i64, today: NaiveDate) -> Result<SparseCounts, StoreError> {
        self.bucket_query(
            "\
            SELECT strftime('%m', timestamp / 1000, 'unixepoch', 'localtime') AS month, COUNT(*)
            FROM records
            WHERE category_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
            GROUP BY month
            ORDER BY month ASC",
            params![
                category_id,
                local_midnight_millis(trailing_year_start(today)),
                local_midnight_millis(next_month_start(today)),
            ],
        )
    }

    fn categories(&self) -> Result<Vec<Category>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name FROM categories ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Category {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRecord> {
    Ok(LogRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        label: row.get(2)?,
        notes: row.get(3)?,
        category_id: row.get(4)?,
    })
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Epoch millis of local midnight starting `date`. Falls back to UTC
/// midnight when local midnight does not exist (DST gap).
pub fn local_midnight_millis(date: NaiveDate) -> i64 {
    let midnight = date.and_time(NaiveTime::default());
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map_or_else(
            || Utc.from_utc_datetime(&midnight).timestamp_millis(),
            |dt| dt.timestamp_millis(),
        )
}
