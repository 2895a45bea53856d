//! Duplicate resolver: repair `(metadata_id, start)` collisions left behind
//! by racing writers.
//!
//! For every duplicated bucket the row with the largest surrogate id wins;
//! the rest are deleted in bounded batches, repeating the scan until a pass
//! finds nothing. Discarded rows that differ from their canonical row in
//! anything but id and creation time are exported to a JSON backup file
//! before deletion, since the delete is irreversible. Repair reports, it
//! never fails the caller over found duplicates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::path::{Path, PathBuf};

use crate::model::BucketTable;

/// Upper bound on rows deleted per statement, to bound transaction size.
const MAX_ROWS_TO_PURGE: usize = 1000;
/// Upper bound on rows examined per scan pass.
const FIND_LIMIT: i64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DuplicateRow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub metadata_id: i64,
    pub start: DateTime<Utc>,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last_reset: Option<DateTime<Utc>>,
    pub state: Option<f64>,
    pub sum: Option<f64>,
}

/// A discarded row paired with the canonical row it duplicated.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateRecord {
    pub duplicate: DuplicateRow,
    pub original: DuplicateRow,
}

#[derive(Debug, Default, Serialize, utoipa::ToSchema)]
pub struct DedupReport {
    pub deleted_rows: u64,
    pub deleted_short_term_rows: u64,
    pub non_identical_rows: usize,
    #[schema(value_type = Vec<String>)]
    pub backup_paths: Vec<PathBuf>,
}

/// Content equality ignoring the surrogate id and creation timestamp.
fn rows_equivalent(a: &DuplicateRow, b: &DuplicateRow) -> bool {
    a.metadata_id == b.metadata_id
        && a.start == b.start
        && a.mean == b.mean
        && a.min == b.min
        && a.max == b.max
        && a.last_reset == b.last_reset
        && a.state == b.state
        && a.sum == b.sum
}

/// Split one scan's rows, sorted by `(metadata_id, start, id DESC)`, into the
/// ids to discard and the records of non-identical discards. The first row of
/// each group carries the largest id and is kept as canonical.
fn partition_duplicates(rows: Vec<DuplicateRow>) -> (Vec<i64>, Vec<DuplicateRecord>) {
    let mut duplicate_ids: Vec<i64> = Vec::new();
    let mut non_identical: Vec<DuplicateRecord> = Vec::new();
    let mut original: Option<DuplicateRow> = None;

    for row in rows {
        match &original {
            Some(canonical)
                if canonical.metadata_id == row.metadata_id && canonical.start == row.start =>
            {
                duplicate_ids.push(row.id);
                if !rows_equivalent(canonical, &row) {
                    non_identical.push(DuplicateRecord {
                        duplicate: row,
                        original: canonical.clone(),
                    });
                }
            }
            _ => original = Some(row),
        }
    }

    (duplicate_ids, non_identical)
}

async fn find_duplicates(
    db: &PgPool,
    table: BucketTable,
) -> Result<(Vec<i64>, Vec<DuplicateRecord>)> {
    let rows: Vec<DuplicateRow> = sqlx::query_as(&format!(
        r#"
        SELECT t.id, t.created_at, t.metadata_id, t.start,
               t.mean, t.min, t.max, t.last_reset, t.state, t.sum
        FROM {table} t
        JOIN (
            SELECT metadata_id, start
            FROM {table}
            GROUP BY metadata_id, start
            HAVING COUNT(*) > 1
        ) dup ON dup.metadata_id = t.metadata_id AND dup.start = t.start
        ORDER BY t.metadata_id, t.start, t.id DESC
        LIMIT $1
        "#,
        table = table.name()
    ))
    .bind(FIND_LIMIT)
    .fetch_all(db)
    .await
    .context("failed to scan for duplicated statistics rows")?;

    Ok(partition_duplicates(rows))
}

fn export_non_identical(
    data_root: &Path,
    table: BucketTable,
    records: &[DuplicateRecord],
) -> Result<PathBuf> {
    std::fs::create_dir_all(data_root)
        .with_context(|| format!("failed to create backup dir {}", data_root.display()))?;
    let isotime = Utc::now().format("%Y-%m-%dT%H-%M-%S%.6f");
    let path = data_root.join(format!("deleted_statistics.{}.{isotime}.json", table.name()));
    let payload =
        serde_json::to_string_pretty(records).context("failed to serialize duplicate backup")?;
    std::fs::write(&path, payload)
        .with_context(|| format!("failed to write duplicate backup {}", path.display()))?;
    Ok(path)
}

async fn delete_duplicates_from_table(
    db: &PgPool,
    table: BucketTable,
    data_root: &Path,
    report: &mut DedupReport,
) -> Result<u64> {
    let mut total_deleted: u64 = 0;
    loop {
        let (duplicate_ids, non_identical) = find_duplicates(db, table).await?;
        if duplicate_ids.is_empty() {
            break;
        }

        // The deletes below are irreversible; non-identical rows go to disk
        // first so they stay recoverable.
        if !non_identical.is_empty() {
            let path = export_non_identical(data_root, table, &non_identical)?;
            tracing::warn!(
                table = table.name(),
                rows = non_identical.len(),
                backup = %path.display(),
                "deleting non identical duplicated rows, backup written"
            );
            report.non_identical_rows += non_identical.len();
            report.backup_paths.push(path);
        }

        for chunk in duplicate_ids.chunks(MAX_ROWS_TO_PURGE) {
            let result = sqlx::query(&format!(
                "DELETE FROM {table} WHERE id = ANY($1)",
                table = table.name()
            ))
            .bind(chunk)
            .execute(db)
            .await
            .context("failed to delete duplicated statistics rows")?;
            total_deleted += result.rows_affected();
        }
    }
    Ok(total_deleted)
}

/// Scan-and-repair both bucket tables until no duplicate groups remain.
pub async fn delete_duplicates(db: &PgPool, data_root: &Path) -> Result<DedupReport> {
    let mut report = DedupReport::default();

    report.deleted_rows =
        delete_duplicates_from_table(db, BucketTable::LongTerm, data_root, &mut report).await?;
    if report.deleted_rows > 0 {
        tracing::info!(
            deleted = report.deleted_rows,
            "deleted duplicated statistics rows"
        );
    }

    report.deleted_short_term_rows =
        delete_duplicates_from_table(db, BucketTable::ShortTerm, data_root, &mut report).await?;
    if report.deleted_short_term_rows > 0 {
        tracing::warn!(
            deleted = report.deleted_short_term_rows,
            "deleted duplicated short-term statistics rows"
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dup_row(id: i64, metadata_id: i64, minute: u32, sum: f64) -> DuplicateRow {
        DuplicateRow {
            id,
            created_at: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, id as u32).unwrap(),
            metadata_id,
            start: Utc.with_ymd_and_hms(2026, 5, 1, 10, minute, 0).unwrap(),
            mean: Some(1.0),
            min: Some(0.0),
            max: Some(2.0),
            last_reset: None,
            state: None,
            sum: Some(sum),
        }
    }

    #[test]
    fn equivalence_ignores_id_and_created_at() {
        let a = dup_row(1, 7, 0, 5.0);
        let b = dup_row(2, 7, 0, 5.0);
        assert!(rows_equivalent(&a, &b));

        let c = dup_row(3, 7, 0, 6.0);
        assert!(!rows_equivalent(&a, &c));
    }

    #[test]
    fn keeps_largest_id_and_discards_the_rest() {
        // Sorted as the scan query returns: (metadata_id, start, id DESC).
        let rows = vec![dup_row(9, 7, 0, 5.0), dup_row(4, 7, 0, 5.0), dup_row(2, 7, 0, 5.0)];
        let (ids, non_identical) = partition_duplicates(rows);
        assert_eq!(ids, vec![4, 2]);
        assert!(non_identical.is_empty());
    }

    #[test]
    fn non_identical_discards_are_recorded() {
        let rows = vec![dup_row(9, 7, 0, 5.0), dup_row(4, 7, 0, 6.0)];
        let (ids, non_identical) = partition_duplicates(rows);
        assert_eq!(ids, vec![4]);
        assert_eq!(non_identical.len(), 1);
        assert_eq!(non_identical[0].duplicate.id, 4);
        assert_eq!(non_identical[0].original.id, 9);
    }

    #[test]
    fn groups_are_partitioned_independently() {
        let rows = vec![
            dup_row(9, 7, 0, 5.0),
            dup_row(4, 7, 0, 5.0),
            dup_row(12, 7, 5, 1.0),
            dup_row(11, 7, 5, 2.0),
            dup_row(20, 8, 0, 3.0),
        ];
        let (ids, non_identical) = partition_duplicates(rows);
        assert_eq!(ids, vec![4, 11]);
        assert_eq!(non_identical.len(), 1);
        assert_eq!(non_identical[0].duplicate.id, 11);
    }

    #[test]
    fn singleton_rows_produce_no_discards() {
        let rows = vec![dup_row(1, 7, 0, 5.0), dup_row(2, 8, 0, 5.0)];
        let (ids, non_identical) = partition_duplicates(rows);
        assert!(ids.is_empty());
        assert!(non_identical.is_empty());
    }

    #[test]
    fn backup_file_contains_the_discarded_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = vec![DuplicateRecord {
            duplicate: dup_row(4, 7, 0, 6.0),
            original: dup_row(9, 7, 0, 5.0),
        }];

        let path = export_non_identical(dir.path(), BucketTable::LongTerm, &records).expect("export");
        assert!(path.exists());
        let contents = std::fs::read_to_string(&path).expect("read backup");
        let parsed: serde_json::Value = serde_json::from_str(&contents).expect("valid json");
        assert_eq!(parsed.as_array().map(Vec::len), Some(1));
        assert_eq!(parsed[0]["duplicate"]["id"], 4);
        assert_eq!(parsed[0]["original"]["sum"], 5.0);
    }
}
