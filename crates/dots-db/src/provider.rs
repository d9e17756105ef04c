//! Read-side providers: forward-only range scans over a dots table.
//!
//! A provider walks through `Uninitialized -> Ready -> Scanning -> Ready`:
//!
//! ```text
//! init(source) --> Ready --begin(range)--> Scanning --finalize()--> Ready
//!                             |                ^
//!                             +- has_more() ---+
//!                             +- produce(..) --+
//! ```
//!
//! While scanning, a background task streams rows from the store into a
//! bounded channel of `fetch_buffer` rows, so at most one page is held in
//! memory. [`DotProvider::has_more`] fills a one-row lookahead and never
//! skips a row; [`DotProvider::produce`] consumes it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dots_types::{Dot, DotId};
use futures::StreamExt;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{DbError, to_key};
use crate::sql::{self, Column};
use crate::store::{StoreConfig, StoreHandle};

/// Default number of rows buffered ahead of the reader.
const DEFAULT_FETCH_BUFFER: usize = 64;

/// Largest key the store's signed BIGINT column can hold.
const MAX_KEY: u64 = i64::MAX.unsigned_abs();

// =========================================================================
// Configuration
// =========================================================================

/// Half-open key range `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub lower: u64,
    /// Exclusive upper bound.
    pub upper: u64,
}

impl KeyRange {
    /// Every key the store can hold.
    pub const ALL: Self = Self {
        lower: 0,
        upper: MAX_KEY,
    };

    /// Create a range `[lower, upper)`.
    pub const fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    /// The range covering exactly one dot.
    pub const fn single(id: DotId) -> Self {
        Self {
            lower: id.0,
            upper: id.0.saturating_add(1),
        }
    }

    fn keys(self) -> Result<(i64, i64), DbError> {
        Ok((to_key(self.lower)?, to_key(self.upper.min(MAX_KEY))?))
    }
}

impl From<std::ops::Range<u64>> for KeyRange {
    fn from(range: std::ops::Range<u64>) -> Self {
        Self::new(range.start, range.end)
    }
}

/// Table, columns and bounds a provider works against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Name of the table to use.
    pub table: String,
    /// Columns to query and write, in slot order.
    pub columns: Vec<Column>,
    /// Column the key range applies to.
    pub key_column: String,
    /// Bounds used by [`DotProvider::update_row`].
    pub bounds: KeyRange,
    /// Rows buffered ahead of the reader during a scan.
    pub fetch_buffer: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::dots()
    }
}

impl ProviderConfig {
    /// The `dots (Id, ParentId, Name, Value)` layout keyed by `Id`.
    pub fn dots() -> Self {
        Self {
            table: "dots".to_owned(),
            columns: sql::dots_columns(),
            key_column: "Id".to_owned(),
            bounds: KeyRange::ALL,
            fetch_buffer: DEFAULT_FETCH_BUFFER,
        }
    }

    /// Use another table name.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Use another column list.
    #[must_use]
    pub fn with_columns(mut self, columns: Vec<Column>, key_column: impl Into<String>) -> Self {
        self.columns = columns;
        self.key_column = key_column.into();
        self
    }

    /// Set the bounds used by updates.
    #[must_use]
    pub const fn with_bounds(mut self, bounds: KeyRange) -> Self {
        self.bounds = bounds;
        self
    }

    /// Set the number of rows buffered ahead of the reader.
    #[must_use]
    pub const fn with_fetch_buffer(mut self, rows: usize) -> Self {
        self.fetch_buffer = rows;
        self
    }
}

/// Predicate consulted before a provider writes. Returning `Ok(false)`
/// refuses the write with [`DbError::Rejected`].
pub type PreCommit = Arc<dyn Fn() -> Result<bool, DbError> + Send + Sync>;

// =========================================================================
// Values and slots
// =========================================================================

/// A value bound into an insert or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// SQL `NULL`.
    Null,
    /// A 64-bit integer.
    Int(i64),
    /// A string.
    Text(String),
}

impl FieldValue {
    /// Bind a dot id, which must fit the signed key column.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::OutOfRange`] for ids above `i64::MAX`.
    pub fn id(id: DotId) -> Result<Self, DbError> {
        to_key(id.0).map(Self::Int)
    }

    /// The four values of a dot in `dots` column order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::OutOfRange`] if either id does not fit.
    pub fn from_dot(dot: &Dot) -> Result<[Self; 4], DbError> {
        Ok([
            Self::id(dot.id)?,
            Self::id(dot.parent_id)?,
            Self::Text(dot.name.clone()),
            Self::Text(dot.value.clone()),
        ])
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Output slot for one column of the current row.
#[derive(Debug)]
pub enum Slot<'a> {
    /// Signed integer column.
    Int(&'a mut i64),
    /// Integer column that must be non-negative.
    UInt(&'a mut u64),
    /// Non-null text column.
    Text(&'a mut String),
    /// Nullable text column.
    OptText(&'a mut Option<String>),
}

enum Decoded {
    Int(i64),
    UInt(u64),
    Text(String),
    OptText(Option<String>),
}

impl Slot<'_> {
    fn decode(&self, row: &AnyRow, column: usize) -> Result<Decoded, DbError> {
        let scan = |e: sqlx::Error| DbError::Scan {
            column,
            reason: e.to_string(),
        };
        Ok(match self {
            Self::Int(_) => Decoded::Int(row.try_get::<i64, _>(column).map_err(scan)?),
            Self::UInt(_) => {
                let v = row.try_get::<i64, _>(column).map_err(scan)?;
                Decoded::UInt(u64::try_from(v).map_err(|_negative| DbError::Scan {
                    column,
                    reason: format!("negative value {v} for an unsigned slot"),
                })?)
            }
            Self::Text(_) => Decoded::Text(row.try_get::<String, _>(column).map_err(scan)?),
            Self::OptText(_) => {
                Decoded::OptText(row.try_get::<Option<String>, _>(column).map_err(scan)?)
            }
        })
    }

    fn assign(&mut self, value: Decoded) {
        match (self, value) {
            (Self::Int(out), Decoded::Int(v)) => **out = v,
            (Self::UInt(out), Decoded::UInt(v)) => **out = v,
            (Self::Text(out), Decoded::Text(v)) => **out = v,
            (Self::OptText(out), Decoded::OptText(v)) => **out = v,
            _ => {}
        }
    }
}

/// Decode the whole row before touching any slot, so a failure leaves
/// every slot as it was.
fn fill_slots(row: &AnyRow, slots: &mut [Slot<'_>]) -> Result<(), DbError> {
    let decoded = slots
        .iter()
        .enumerate()
        .map(|(column, slot)| slot.decode(row, column))
        .collect::<Result<Vec<_>, _>>()?;
    for (slot, value) in slots.iter_mut().zip(decoded) {
        slot.assign(value);
    }
    Ok(())
}

pub(crate) fn bind_values<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    values: &'q [FieldValue],
) -> Query<'q, Any, AnyArguments<'q>> {
    for value in values {
        query = match value {
            FieldValue::Null => query.bind(None::<String>),
            FieldValue::Int(v) => query.bind(*v),
            FieldValue::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

// =========================================================================
// Cursor
// =========================================================================

type RowMessage = Result<AnyRow, sqlx::Error>;

/// Forward-only cursor fed by a background reader task.
struct Cursor {
    rows: mpsc::Receiver<RowMessage>,
    reader: JoinHandle<()>,
    current: Option<AnyRow>,
    exhausted: bool,
}

impl Cursor {
    /// Start the reader and prime the lookahead, so a rejected statement
    /// fails here rather than on the first `has_more`.
    async fn open(
        pool: AnyPool,
        statement: String,
        (lower, upper): (i64, i64),
        buffer: usize,
    ) -> Result<Self, DbError> {
        let (tx, rx) = mpsc::channel::<RowMessage>(buffer.max(1));
        let reader = tokio::spawn(async move {
            let mut rows = sqlx::query(&statement)
                .bind(lower)
                .bind(upper)
                .fetch(&pool);
            while let Some(row) = rows.next().await {
                let failed = row.is_err();
                if tx.send(row).await.is_err() || failed {
                    break;
                }
            }
        });

        let mut cursor = Self {
            rows: rx,
            reader,
            current: None,
            exhausted: false,
        };
        cursor.advance().await?;
        Ok(cursor)
    }

    /// Make sure the lookahead holds the next unread row, if any.
    async fn advance(&mut self) -> Result<bool, DbError> {
        if self.current.is_some() {
            return Ok(true);
        }
        if self.exhausted {
            return Ok(false);
        }
        match self.rows.recv().await {
            Some(Ok(row)) => {
                self.current = Some(row);
                Ok(true)
            }
            Some(Err(e)) => {
                self.exhausted = true;
                Err(e.into())
            }
            None => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }

    async fn close(&mut self) -> Result<(), DbError> {
        self.rows.close();
        self.reader.abort();
        match (&mut self.reader).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(DbError::Cleanup(e.to_string())),
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// =========================================================================
// Provider trait
// =========================================================================

/// Lifecycle phase of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderPhase {
    /// No store attached yet.
    Uninitialized,
    /// Attached to a store, no scan open.
    Ready,
    /// A range scan is open.
    Scanning,
}

/// Read-side capability set over a store-backed table.
#[async_trait]
pub trait DotProvider: Send + Sync {
    /// Attach the provider to the store for `data_source`.
    async fn init(&mut self, data_source: &str) -> Result<(), DbError>;

    /// The data source the provider was initialized with.
    fn source(&self) -> Option<&str>;

    /// Replace the table, column and bound configuration.
    fn configure(&mut self, config: ProviderConfig) -> Result<(), DbError>;

    /// Create the configured table.
    async fn construct_schema(&self) -> Result<(), DbError>;

    /// Insert one row. Returns the number of rows affected.
    async fn create_row(&self, values: &[FieldValue]) -> Result<u64, DbError>;

    /// Update every row within the configured bounds. Returns the number of
    /// rows affected.
    async fn update_row(&self, values: &[FieldValue]) -> Result<u64, DbError>;

    /// Drop the configured table.
    async fn destroy_schema(&self) -> Result<(), DbError>;

    /// Open a forward cursor over keys in `range`, ascending.
    async fn begin(&mut self, range: KeyRange) -> Result<(), DbError>;

    /// Whether at least one more unread row is available.
    async fn has_more(&mut self) -> Result<bool, DbError>;

    /// Read the current row into `slots` and move past it.
    async fn produce(&mut self, slots: &mut [Slot<'_>]) -> Result<(), DbError>;

    /// Close the cursor.
    async fn finalize(&mut self) -> Result<(), DbError>;

    /// Read the current row as a [`Dot`]. Requires the four-column
    /// `dots` layout.
    async fn produce_dot(&mut self) -> Result<Dot, DbError> {
        let (mut id, mut parent_id) = (0_u64, 0_u64);
        let (mut name, mut value) = (String::new(), String::new());
        self.produce(&mut [
            Slot::UInt(&mut id),
            Slot::UInt(&mut parent_id),
            Slot::Text(&mut name),
            Slot::Text(&mut value),
        ])
        .await?;
        Ok(Dot::new(id, parent_id, name, value))
    }

    /// Insert a [`Dot`]. Requires the four-column `dots` layout.
    async fn create_dot(&self, dot: &Dot) -> Result<u64, DbError> {
        let values = FieldValue::from_dot(dot)?;
        self.create_row(&values).await
    }
}

// =========================================================================
// Store-backed provider
// =========================================================================

enum ScanState {
    Idle,
    Scanning(Cursor),
}

/// Provider backed by a [`StoreHandle`].
pub struct DbDotProvider {
    store: StoreHandle,
    config: ProviderConfig,
    pre_commit: Option<PreCommit>,
    scan: ScanState,
}

impl fmt::Debug for DbDotProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbDotProvider")
            .field("source", &self.store.source())
            .field("table", &self.config.table)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Default for DbDotProvider {
    fn default() -> Self {
        Self::with_store(StoreHandle::default(), ProviderConfig::dots())
    }
}

impl DbDotProvider {
    /// Create an uninitialized provider with its own store handle.
    pub fn new(config: ProviderConfig, store: StoreConfig) -> Self {
        Self::with_store(StoreHandle::new(store), config)
    }

    /// Create a provider sharing an existing store handle.
    pub const fn with_store(store: StoreHandle, config: ProviderConfig) -> Self {
        Self {
            store,
            config,
            pre_commit: None,
            scan: ScanState::Idle,
        }
    }

    /// Install or clear the pre-commit predicate.
    pub fn set_pre_commit(&mut self, pre_commit: Option<PreCommit>) {
        self.pre_commit = pre_commit;
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ProviderPhase {
        match self.scan {
            ScanState::Scanning(_) => ProviderPhase::Scanning,
            ScanState::Idle if self.store.is_initialized() => ProviderPhase::Ready,
            ScanState::Idle => ProviderPhase::Uninitialized,
        }
    }

    /// The active configuration.
    pub const fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// The shared store handle.
    pub const fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Drop an open cursor without waiting for the reader. Returns whether
    /// a scan was open.
    pub(crate) fn discard_scan(&mut self) -> bool {
        matches!(
            std::mem::replace(&mut self.scan, ScanState::Idle),
            ScanState::Scanning(_)
        )
    }

    fn check_pre_commit(&self) -> Result<(), DbError> {
        match &self.pre_commit {
            Some(check) if !check()? => Err(DbError::Rejected),
            _ => Ok(()),
        }
    }

    fn check_arity(&self, actual: usize) -> Result<(), DbError> {
        let expected = self.config.columns.len();
        if actual == expected {
            Ok(())
        } else {
            Err(DbError::ArityMismatch { expected, actual })
        }
    }

    fn cursor(&mut self) -> Result<&mut Cursor, DbError> {
        match &mut self.scan {
            ScanState::Scanning(cursor) => Ok(cursor),
            ScanState::Idle => Err(DbError::InvalidState("no scan is open; call begin first")),
        }
    }

    async fn execute(&self, statement: &str, values: &[FieldValue]) -> Result<u64, DbError> {
        let pool = self.store.pool()?;
        let result = bind_values(sqlx::query(statement), values)
            .execute(pool)
            .await
            .map_err(|e| {
                tracing::error!(table = self.config.table.as_str(), error = %e, "Statement failed");
                DbError::from(e)
            })?;
        tracing::debug!(
            table = self.config.table.as_str(),
            rows = result.rows_affected(),
            statement,
            "Statement executed"
        );
        Ok(result.rows_affected())
    }

    /// Update the rows whose key lies in `range`.
    ///
    /// # Errors
    ///
    /// Same as [`DotProvider::update_row`].
    pub async fn update_range(
        &self,
        values: &[FieldValue],
        range: KeyRange,
    ) -> Result<u64, DbError> {
        self.check_arity(values.len())?;
        self.check_pre_commit()?;
        let (lower, upper) = range.keys()?;
        let statement = sql::update_range(
            self.store.dialect()?,
            &self.config.table,
            &self.config.columns,
            &self.config.key_column,
        );
        let mut bound = values.to_vec();
        bound.extend([FieldValue::Int(lower), FieldValue::Int(upper)]);
        self.execute(&statement, &bound).await
    }

    /// Rewrite the row holding `dot.id` with the dot's fields.
    ///
    /// # Errors
    ///
    /// Same as [`DotProvider::update_row`].
    pub async fn update_dot(&self, dot: &Dot) -> Result<u64, DbError> {
        let values = FieldValue::from_dot(dot)?;
        self.update_range(&values, KeyRange::single(dot.id)).await
    }
}

#[async_trait]
impl DotProvider for DbDotProvider {
    async fn init(&mut self, data_source: &str) -> Result<(), DbError> {
        self.store.init(data_source).await
    }

    fn source(&self) -> Option<&str> {
        self.store.source()
    }

    fn configure(&mut self, config: ProviderConfig) -> Result<(), DbError> {
        if matches!(self.scan, ScanState::Scanning(_)) {
            return Err(DbError::InvalidState("cannot reconfigure during a scan"));
        }
        self.config = config;
        Ok(())
    }

    async fn construct_schema(&self) -> Result<(), DbError> {
        let statement = sql::create_table(&self.config.table, &self.config.columns);
        self.execute(&statement, &[]).await.map(|_| ())
    }

    async fn create_row(&self, values: &[FieldValue]) -> Result<u64, DbError> {
        self.check_arity(values.len())?;
        self.check_pre_commit()?;
        let statement = sql::insert(
            self.store.dialect()?,
            &self.config.table,
            &self.config.columns,
        );
        self.execute(&statement, values).await
    }

    async fn update_row(&self, values: &[FieldValue]) -> Result<u64, DbError> {
        self.update_range(values, self.config.bounds).await
    }

    async fn destroy_schema(&self) -> Result<(), DbError> {
        let statement = sql::drop_table(&self.config.table);
        self.execute(&statement, &[]).await.map(|_| ())
    }

    async fn begin(&mut self, range: KeyRange) -> Result<(), DbError> {
        if matches!(self.scan, ScanState::Scanning(_)) {
            return Err(DbError::InvalidState("a scan is already open; finalize it first"));
        }
        let pool = self.store.pool()?.clone();
        let statement = sql::select_range(
            self.store.dialect()?,
            &self.config.table,
            &self.config.columns,
            &self.config.key_column,
        );
        tracing::debug!(
            table = self.config.table.as_str(),
            lower = range.lower,
            upper = range.upper,
            "Opening range scan"
        );

        let cursor = Cursor::open(pool, statement, range.keys()?, self.config.fetch_buffer)
            .await
            .map_err(|e| {
                tracing::error!(table = self.config.table.as_str(), error = %e, "Range scan failed");
                e
            })?;
        self.scan = ScanState::Scanning(cursor);
        Ok(())
    }

    async fn has_more(&mut self) -> Result<bool, DbError> {
        self.cursor()?.advance().await
    }

    async fn produce(&mut self, slots: &mut [Slot<'_>]) -> Result<(), DbError> {
        self.cursor()?;
        self.check_arity(slots.len())?;
        let cursor = self.cursor()?;
        if !cursor.advance().await? {
            return Err(DbError::InvalidState("cursor is exhausted"));
        }
        let Some(row) = cursor.current.as_ref() else {
            return Err(DbError::InvalidState("cursor is exhausted"));
        };
        fill_slots(row, slots).map_err(|e| {
            tracing::error!(error = %e, "Row read failure");
            e
        })?;
        cursor.current = None;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), DbError> {
        let ScanState::Scanning(mut cursor) = std::mem::replace(&mut self.scan, ScanState::Idle)
        else {
            return Err(DbError::InvalidState("no scan is open"));
        };
        cursor.close().await.map_err(|e| {
            tracing::error!(table = self.config.table.as_str(), error = %e, "Cleanup failure");
            e
        })
    }
}
