#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use uccs_matrix_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ChangeEvent, ChangeKind, ChangeSource, Decision,
    DecisionError, DecisionGateway, DecisionId, DecisionKey, DecisionLevel, DecisionPayload,
    Offense, OffenseCatalog, Subscription,
};
use ulid::Ulid;

const DECISION_MIGRATION_VERSION: i64 = 1;

const SCHEMA_DECISIONS_V1: &str = r"
CREATE TABLE IF NOT EXISTS uccs_offenses (
  uccs_code INTEGER PRIMARY KEY,
  uccs_desc TEXT NOT NULL CHECK (length(trim(uccs_desc)) > 0)
);

CREATE TABLE IF NOT EXISTS decisions (
  id TEXT PRIMARY KEY,
  matrix_id TEXT NOT NULL CHECK (length(trim(matrix_id)) > 0),
  collaborator_email TEXT NOT NULL CHECK (length(trim(collaborator_email)) > 0),
  uccs_code INTEGER NOT NULL REFERENCES uccs_offenses(uccs_code),
  decision_level TEXT NOT NULL CHECK (decision_level IN ('green', 'yellow', 'red')),
  look_back_period INTEGER CHECK (look_back_period IS NULL OR look_back_period >= 0),
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_key
  ON decisions(matrix_id, collaborator_email, uccs_code);
CREATE INDEX IF NOT EXISTS idx_decisions_matrix
  ON decisions(matrix_id);

CREATE TABLE IF NOT EXISTS decision_changes (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  change_kind TEXT NOT NULL CHECK (change_kind IN ('insert', 'update', 'delete')),
  id TEXT NOT NULL,
  matrix_id TEXT NOT NULL,
  collaborator_email TEXT NOT NULL,
  uccs_code INTEGER NOT NULL,
  decision_level TEXT NOT NULL,
  look_back_period INTEGER,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decision_changes_matrix
  ON decision_changes(matrix_id, seq);
";

const DECISION_COLUMNS: &str =
    "id, matrix_id, collaborator_email, uccs_code, decision_level, look_back_period, updated_at";

/// SQLite-backed decision store.
///
/// Every insert and update appends a row to `decision_changes` in the same
/// transaction. Subscriptions read that log through their own connection, so
/// a live view sees writes committed by any process sharing the database.
pub struct SqliteDecisionStore {
    conn: Connection,
    location: PathBuf,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: IntegrityIssueSeverity,
    pub message: String,
}

/// A decision key that holds more than one record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DuplicateKey {
    pub matrix_id: String,
    pub collaborator_email: String,
    pub uccs_code: i64,
    pub record_count: usize,
    pub decision_ids: Vec<DecisionId>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrityCheck {
    pub contract_version: String,
    pub matrix_id: Option<String>,
    pub healthy: bool,
    pub offense_count: usize,
    pub decision_count: usize,
    pub issues: Vec<IntegrityIssue>,
    pub duplicate_keys: Vec<DuplicateKey>,
}

impl SqliteDecisionStore {
    /// Opens the database at `path`. `:memory:` opens a private shared-cache
    /// database so change subscriptions can attach a second connection to it.
    pub fn open(path: &Path) -> Result<Self> {
        let location = if path == Path::new(":memory:") {
            PathBuf::from(format!(
                "file:uccs-memory-{}?mode=memory&cache=shared",
                Ulid::new()
            ))
        } else {
            path.to_path_buf()
        };

        let conn = open_connection(&location)?;
        Ok(Self { conn, location })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_DECISIONS_V1)
            .context("failed to apply decision schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![DECISION_MIGRATION_VERSION, now],
            )
            .context("failed to register decision schema migration")?;

        tracing::info!(version = DECISION_MIGRATION_VERSION, "decision schema ready");
        Ok(())
    }

    /// Opens a change subscription for one matrix. Only changes committed
    /// after this call are delivered.
    pub fn subscribe(&self, matrix_id: &str) -> Result<Subscription> {
        let conn = open_connection(&self.location)?;
        let last_seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM decision_changes",
                [],
                |row| row.get(0),
            )
            .context("failed to read change log position")?;

        tracing::debug!(matrix_id, last_seq, "change log cursor positioned");
        Ok(Subscription::polled(
            matrix_id,
            Box::new(ChangeLogCursor {
                conn,
                matrix_id: matrix_id.to_string(),
                last_seq,
            }),
        ))
    }

    pub fn upsert_offense(&self, offense: &Offense) -> Result<()> {
        if offense.uccs_desc.trim().is_empty() {
            return Err(anyhow!(
                "uccs_desc MUST be provided for uccs_code {}",
                offense.uccs_code
            ));
        }

        self.conn
            .execute(
                "INSERT INTO uccs_offenses(uccs_code, uccs_desc)
                 VALUES (?1, ?2)
                 ON CONFLICT(uccs_code) DO UPDATE SET
                   uccs_desc = excluded.uccs_desc",
                params![offense.uccs_code, offense.uccs_desc],
            )
            .with_context(|| format!("failed to upsert offense {}", offense.uccs_code))?;

        Ok(())
    }

    /// Loads a whole catalog in one transaction; nothing is written if any
    /// entry is rejected.
    pub fn import_offenses(&mut self, offenses: &[Offense]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start catalog transaction")?;

        for offense in offenses {
            if offense.uccs_desc.trim().is_empty() {
                return Err(anyhow!(
                    "uccs_desc MUST be provided for uccs_code {}",
                    offense.uccs_code
                ));
            }
            tx.execute(
                "INSERT INTO uccs_offenses(uccs_code, uccs_desc)
                 VALUES (?1, ?2)
                 ON CONFLICT(uccs_code) DO UPDATE SET
                   uccs_desc = excluded.uccs_desc",
                params![offense.uccs_code, offense.uccs_desc],
            )
            .with_context(|| format!("failed to import offense {}", offense.uccs_code))?;
        }

        tx.commit().context("failed to commit catalog transaction")?;
        tracing::info!(count = offenses.len(), "offense catalog imported");
        Ok(offenses.len())
    }

    pub fn list_offenses(&self) -> Result<Vec<Offense>> {
        let mut stmt = self
            .conn
            .prepare("SELECT uccs_code, uccs_desc FROM uccs_offenses ORDER BY uccs_code ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Offense {
                uccs_code: row.get(0)?,
                uccs_desc: row.get(1)?,
            })
        })?;

        collect_rows(rows)
    }

    /// Oldest record for the key. Several may exist if two writers raced.
    pub fn find_decision(&self, key: &DecisionKey) -> Result<Option<Decision>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {DECISION_COLUMNS}
                     FROM decisions
                     WHERE matrix_id = ?1 AND collaborator_email = ?2 AND uccs_code = ?3
                     ORDER BY rowid ASC
                     LIMIT 1"
                ),
                params![key.matrix_id, key.collaborator_email, key.uccs_code],
                parse_decision_row,
            )
            .optional()
            .with_context(|| format!("failed to look up decision {key}"))
    }

    pub fn get_decision(&self, id: DecisionId) -> Result<Option<Decision>> {
        self.conn
            .query_row(
                &format!("SELECT {DECISION_COLUMNS} FROM decisions WHERE id = ?1"),
                params![id.to_string()],
                parse_decision_row,
            )
            .optional()
            .with_context(|| format!("failed to load decision {id}"))
    }

    pub fn insert_decision(
        &mut self,
        key: &DecisionKey,
        payload: &DecisionPayload,
    ) -> Result<Decision> {
        let record = Decision {
            id: DecisionId(Ulid::new()),
            matrix_id: key.matrix_id.clone(),
            collaborator_email: key.collaborator_email.clone(),
            uccs_code: key.uccs_code,
            decision_level: payload.decision_level,
            look_back_period: payload.look_back_period,
            updated_at: now_utc(),
        };

        let tx = self
            .conn
            .transaction()
            .context("failed to start decision transaction")?;

        tx.execute(
            &format!(
                "INSERT INTO decisions({DECISION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                record.id.to_string(),
                record.matrix_id,
                record.collaborator_email,
                record.uccs_code,
                record.decision_level.as_str(),
                record.look_back_period.map(i64::from),
                format_rfc3339(record.updated_at).map_err(|err| anyhow!(err.to_string()))?,
            ],
        )
        .with_context(|| format!("failed to insert decision {key}"))?;
        append_change(&tx, ChangeKind::Insert, &record)?;

        tx.commit().context("failed to commit decision transaction")?;

        tracing::debug!(decision_id = %record.id, key = %key, "decision row inserted");
        Ok(record)
    }

    /// Overwrites the payload of an existing decision. `updated_at` never
    /// moves backwards for a record, even if the wall clock does.
    pub fn update_decision(
        &mut self,
        id: DecisionId,
        payload: &DecisionPayload,
    ) -> Result<Decision> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start decision transaction")?;

        let previous = tx
            .query_row(
                &format!("SELECT {DECISION_COLUMNS} FROM decisions WHERE id = ?1"),
                params![id.to_string()],
                parse_decision_row,
            )
            .optional()
            .with_context(|| format!("failed to load decision {id}"))?;
        let Some(previous) = previous else {
            return Err(anyhow!("decision not found: {id}"));
        };

        let record = Decision {
            decision_level: payload.decision_level,
            look_back_period: payload.look_back_period,
            updated_at: monotonic_updated_at(previous.updated_at, now_utc()),
            ..previous
        };
        tx.execute(
            "UPDATE decisions
             SET decision_level = ?2, look_back_period = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                id.to_string(),
                record.decision_level.as_str(),
                record.look_back_period.map(i64::from),
                format_rfc3339(record.updated_at).map_err(|err| anyhow!(err.to_string()))?,
            ],
        )
        .with_context(|| format!("failed to update decision {id}"))?;
        append_change(&tx, ChangeKind::Update, &record)?;

        tx.commit().context("failed to commit decision transaction")?;

        tracing::debug!(decision_id = %record.id, "decision row updated");
        Ok(record)
    }

    /// Every decision of one matrix in insertion order.
    pub fn list_decisions(&self, matrix_id: &str) -> Result<Vec<Decision>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DECISION_COLUMNS}
             FROM decisions
             WHERE matrix_id = ?1
             ORDER BY rowid ASC"
        ))?;

        let rows = stmt.query_map(params![matrix_id], parse_decision_row)?;
        collect_rows(rows)
    }

    /// Reports keys holding more than one record. Nothing is repaired.
    pub fn integrity_check(&self, matrix_id: Option<&str>) -> Result<IntegrityCheck> {
        let offense_count = self.count_offenses()?;
        let decision_count = self.count_decisions(matrix_id)?;
        let duplicate_keys = self.duplicate_keys(matrix_id)?;
        let mut issues = Vec::new();

        if !duplicate_keys.is_empty() {
            let extra_records: usize = duplicate_keys
                .iter()
                .map(|item| item.record_count.saturating_sub(1))
                .sum();
            issues.push(IntegrityIssue {
                code: "duplicate_decision_keys".to_string(),
                severity: IntegrityIssueSeverity::Error,
                message: format!(
                    "duplicate decision keys detected: {} keys with {} extra records",
                    duplicate_keys.len(),
                    extra_records
                ),
            });
        }

        if offense_count == 0 {
            issues.push(IntegrityIssue {
                code: "empty_offense_catalog".to_string(),
                severity: IntegrityIssueSeverity::Warning,
                message: "offense catalog is empty; decisions cannot be submitted".to_string(),
            });
        }

        let healthy = !issues
            .iter()
            .any(|item| item.severity == IntegrityIssueSeverity::Error);

        Ok(IntegrityCheck {
            contract_version: "integrity_check.v1".to_string(),
            matrix_id: matrix_id.map(str::to_string),
            healthy,
            offense_count,
            decision_count,
            issues,
            duplicate_keys,
        })
    }

    fn duplicate_keys(&self, matrix_id: Option<&str>) -> Result<Vec<DuplicateKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT matrix_id, collaborator_email, uccs_code
             FROM decisions
             WHERE ?1 IS NULL OR matrix_id = ?1
             GROUP BY matrix_id, collaborator_email, uccs_code
             HAVING COUNT(*) > 1
             ORDER BY matrix_id ASC, collaborator_email ASC, uccs_code ASC",
        )?;
        let rows = stmt.query_map(params![matrix_id], |row| {
            Ok(DecisionKey {
                matrix_id: row.get(0)?,
                collaborator_email: row.get(1)?,
                uccs_code: row.get(2)?,
            })
        })?;
        let keys = collect_rows(rows)?;

        let mut duplicates = Vec::with_capacity(keys.len());
        for key in keys {
            let decision_ids = self.decision_ids_for_key(&key)?;
            duplicates.push(DuplicateKey {
                record_count: decision_ids.len(),
                matrix_id: key.matrix_id,
                collaborator_email: key.collaborator_email,
                uccs_code: key.uccs_code,
                decision_ids,
            });
        }

        Ok(duplicates)
    }

    fn decision_ids_for_key(&self, key: &DecisionKey) -> Result<Vec<DecisionId>> {
        let mut stmt = self.conn.prepare(
            "SELECT id
             FROM decisions
             WHERE matrix_id = ?1 AND collaborator_email = ?2 AND uccs_code = ?3
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(
            params![key.matrix_id, key.collaborator_email, key.uccs_code],
            |row| {
                let raw: String = row.get(0)?;
                parse_decision_id(&raw, 0)
            },
        )?;

        collect_rows(rows)
    }

    fn count_offenses(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM uccs_offenses", [], |row| row.get(0))
            .context("failed to count offenses")?;
        usize::try_from(count).context("offense count out of range")
    }

    fn count_decisions(&self, matrix_id: Option<&str>) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM decisions WHERE ?1 IS NULL OR matrix_id = ?1",
                params![matrix_id],
                |row| row.get(0),
            )
            .context("failed to count decisions")?;
        usize::try_from(count).context("decision count out of range")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl OffenseCatalog for SqliteDecisionStore {
    fn list_offenses(&self) -> Result<Vec<Offense>, DecisionError> {
        SqliteDecisionStore::list_offenses(self).map_err(backend_error)
    }
}

impl DecisionGateway for SqliteDecisionStore {
    fn find_decision(&self, key: &DecisionKey) -> Result<Option<Decision>, DecisionError> {
        SqliteDecisionStore::find_decision(self, key).map_err(backend_error)
    }

    fn insert_decision(
        &mut self,
        key: &DecisionKey,
        payload: &DecisionPayload,
    ) -> Result<Decision, DecisionError> {
        SqliteDecisionStore::insert_decision(self, key, payload).map_err(backend_error)
    }

    fn update_decision(
        &mut self,
        id: DecisionId,
        payload: &DecisionPayload,
    ) -> Result<Decision, DecisionError> {
        SqliteDecisionStore::update_decision(self, id, payload).map_err(backend_error)
    }

    fn list_decisions(&self, matrix_id: &str) -> Result<Vec<Decision>, DecisionError> {
        SqliteDecisionStore::list_decisions(self, matrix_id).map_err(backend_error)
    }

    fn subscribe_decision_changes(&self, matrix_id: &str) -> Result<Subscription, DecisionError> {
        self.subscribe(matrix_id).map_err(backend_error)
    }
}

/// Reads `decision_changes` past the last sequence number it delivered.
struct ChangeLogCursor {
    conn: Connection,
    matrix_id: String,
    last_seq: i64,
}

impl ChangeLogCursor {
    fn read_pending(&mut self) -> Result<Vec<ChangeEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DECISION_COLUMNS}, seq, change_kind
             FROM decision_changes
             WHERE matrix_id = ?1 AND seq > ?2
             ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![self.matrix_id, self.last_seq], |row| {
            let record = parse_decision_row(row)?;
            let seq: i64 = row.get(7)?;
            let kind_raw: String = row.get(8)?;
            let kind = ChangeKind::parse(&kind_raw).ok_or_else(|| {
                conversion_error(
                    8,
                    rusqlite::types::Type::Text,
                    format!("invalid change_kind: {kind_raw}"),
                )
            })?;
            Ok((seq, ChangeEvent { kind, record }))
        })?;
        let changes = collect_rows(rows)
            .with_context(|| format!("failed to read changes for matrix {}", self.matrix_id))?;

        if let Some((seq, _)) = changes.last() {
            self.last_seq = *seq;
        }
        Ok(changes.into_iter().map(|(_, event)| event).collect())
    }
}

impl ChangeSource for ChangeLogCursor {
    fn poll_changes(&mut self) -> Result<Vec<ChangeEvent>, DecisionError> {
        self.read_pending().map_err(backend_error)
    }
}

fn open_connection(location: &Path) -> Result<Connection> {
    let conn = Connection::open(location)
        .with_context(|| format!("failed to open sqlite database at {}", location.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn append_change(conn: &Connection, kind: ChangeKind, record: &Decision) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO decision_changes(change_kind, {DECISION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            kind.as_str(),
            record.id.to_string(),
            record.matrix_id,
            record.collaborator_email,
            record.uccs_code,
            record.decision_level.as_str(),
            record.look_back_period.map(i64::from),
            format_rfc3339(record.updated_at).map_err(|err| anyhow!(err.to_string()))?,
        ],
    )
    .with_context(|| format!("failed to record {} of decision {}", kind.as_str(), record.id))?;

    Ok(())
}

#[allow(clippy::needless_pass_by_value)]
fn backend_error(err: anyhow::Error) -> DecisionError {
    DecisionError::Backend(format!("{err:#}"))
}

fn monotonic_updated_at(previous: OffsetDateTime, now: OffsetDateTime) -> OffsetDateTime {
    now.max(previous)
}

fn parse_decision_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Decision> {
    let id_raw: String = row.get(0)?;
    let level_raw: String = row.get(4)?;
    let look_back_raw: Option<i64> = row.get(5)?;
    let updated_at_raw: String = row.get(6)?;

    let decision_level = DecisionLevel::parse(&level_raw).ok_or_else(|| {
        conversion_error(
            4,
            rusqlite::types::Type::Text,
            format!("invalid decision_level: {level_raw}"),
        )
    })?;

    let look_back_period = look_back_raw
        .map(u32::try_from)
        .transpose()
        .map_err(|_| {
            conversion_error(
                5,
                rusqlite::types::Type::Integer,
                format!("invalid look_back_period: {look_back_raw:?}"),
            )
        })?;

    let updated_at = parse_rfc3339_utc(&updated_at_raw)
        .map_err(|err| conversion_error(6, rusqlite::types::Type::Text, err.to_string()))?;

    Ok(Decision {
        id: parse_decision_id(&id_raw, 0)?,
        matrix_id: row.get(1)?,
        collaborator_email: row.get(2)?,
        uccs_code: row.get(3)?,
        decision_level,
        look_back_period,
        updated_at,
    })
}

fn parse_decision_id(raw: &str, column: usize) -> rusqlite::Result<DecisionId> {
    let parsed = Ulid::from_string(raw).map_err(|_| {
        conversion_error(
            column,
            rusqlite::types::Type::Text,
            format!("invalid ULID: {raw}"),
        )
    })?;

    Ok(DecisionId(parsed))
}

fn conversion_error(
    column: usize,
    kind: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
