use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{anyhow, Context, Result};
use datahub_core::{normalize_record, parse_jsonl_line, DatasetRule, RawRow};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::audit::{insert_audit, AuditStatus};
use crate::{new_run_id, require_tables, timestamp_now, SqliteDataHub};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub run_id: String,
    pub files_ingested: usize,
    pub rows_ingested: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub rows_discarded: usize,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Fingerprint {
    size: i64,
    mtime: i64,
}

#[derive(Debug, Default)]
struct ParsedFile {
    rows: Vec<RawRow>,
    discarded: usize,
}

impl SqliteDataHub {
    /// Loads every new or changed source file under `import_dir` into
    /// bronze. Each file commits in its own transaction together with its
    /// registry fingerprint, so a failing file leaves no partial rows.
    pub fn ingest(&mut self, import_dir: &Path) -> Result<IngestReport> {
        require_tables(&self.conn, "ingest", &["bronze_events", "ingest_registry"])?;

        let files = discover_files(import_dir, &self.config.ingest.extensions)?;
        let run_id = new_run_id();
        let mut report = IngestReport {
            run_id: run_id.clone(),
            ..IngestReport::default()
        };
        let mut failed_files = Vec::new();

        for path in files {
            let source_file = path.display().to_string();
            let fingerprint = match file_fingerprint(&path) {
                Ok(value) => value,
                Err(err) => {
                    warn!(source_file = %source_file, error = %err, "unable to stat source file");
                    report.files_failed += 1;
                    failed_files.push(json!({"source_file": source_file, "error": format!("{err:#}")}));
                    continue;
                }
            };

            if registry_fingerprint(&self.conn, &source_file)? == Some(fingerprint) {
                debug!(source_file = %source_file, "unchanged since last ingest, skipping");
                report.files_skipped += 1;
                continue;
            }

            match self.ingest_file(&path, &source_file, fingerprint, &run_id) {
                Ok((rows, discarded)) => {
                    debug!(source_file = %source_file, rows, discarded, "file ingested");
                    report.files_ingested += 1;
                    report.rows_ingested += rows;
                    report.rows_discarded += discarded;
                }
                Err(err) => {
                    warn!(source_file = %source_file, error = %format!("{err:#}"), "file rolled back");
                    report.files_failed += 1;
                    failed_files.push(json!({"source_file": source_file, "error": format!("{err:#}")}));
                }
            }
        }

        if report.rows_discarded > 0 {
            warn!(rows_discarded = report.rows_discarded, "unparsable rows were dropped");
        }

        insert_audit(
            &self.conn,
            &run_id,
            "ingest",
            AuditStatus::Success,
            &json!({
                "import_dir": import_dir.display().to_string(),
                "files_ingested": report.files_ingested,
                "rows_ingested": report.rows_ingested,
                "files_skipped": report.files_skipped,
                "files_failed": report.files_failed,
                "rows_discarded": report.rows_discarded,
                "failed_files": failed_files,
            }),
        )?;

        info!(
            run_id = %report.run_id,
            files_ingested = report.files_ingested,
            rows_ingested = report.rows_ingested,
            files_skipped = report.files_skipped,
            files_failed = report.files_failed,
            "ingest complete"
        );

        Ok(report)
    }

    fn ingest_file(
        &mut self,
        path: &Path,
        source_file: &str,
        fingerprint: Fingerprint,
        run_id: &str,
    ) -> Result<(usize, usize)> {
        let source_type = source_type(path);
        let parsed = match source_type {
            "csv" => parse_csv_file(path, source_file, &self.config.datasets)?,
            _ => parse_jsonl_file(path, source_file, &self.config.datasets)?,
        };

        let batch_size = self.config.ingest.batch_size;
        let ingested_at = timestamp_now()?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start ingest transaction")?;

        for batch in parsed.rows.chunks(batch_size) {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO bronze_events(
                        run_id, dataset_id, source_file, source_type,
                        raw_event_time, raw_entity_id, raw_metric, raw_value,
                        raw_payload_json, ingested_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .context("failed to prepare bronze insert")?;

            for row in batch {
                let payload =
                    serde_json::to_string(&row.payload).context("failed to serialize payload")?;
                stmt.execute(params![
                    run_id,
                    row.dataset_id,
                    source_file,
                    source_type,
                    row.event_time,
                    row.entity_id,
                    row.metric,
                    row.value,
                    payload,
                    ingested_at,
                ])
                .with_context(|| format!("failed to insert bronze row from {source_file}"))?;
            }
            debug!(source_file, batch_rows = batch.len(), "bronze batch written");
        }

        tx.execute(
            "INSERT INTO ingest_registry(source_file, file_size, mtime, last_run_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_file) DO UPDATE SET
               file_size = excluded.file_size,
               mtime = excluded.mtime,
               last_run_id = excluded.last_run_id,
               updated_at = excluded.updated_at",
            params![
                source_file,
                fingerprint.size,
                fingerprint.mtime,
                run_id,
                ingested_at
            ],
        )
        .context("failed to update ingest registry")?;

        tx.commit().context("failed to commit ingest transaction")?;

        Ok((parsed.rows.len(), parsed.discarded))
    }
}

fn discover_files(import_dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !import_dir.is_dir() {
        return Err(anyhow!(
            "import directory does not exist: {}",
            import_dir.display()
        ));
    }

    let wanted: Vec<String> = extensions
        .iter()
        .map(|item| item.trim_start_matches('.').to_ascii_lowercase())
        .collect();

    let mut files = Vec::new();
    for entry in std::fs::read_dir(import_dir)
        .with_context(|| format!("failed to list {}", import_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", import_dir.display()))?
            .path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| wanted.iter().any(|item| item.eq_ignore_ascii_case(ext)));
        if matches {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

fn source_type(path: &Path) -> &'static str {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        "csv"
    } else {
        "jsonl"
    }
}

fn file_fingerprint(path: &Path) -> Result<Fingerprint> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to read metadata for {}", path.display()))?;
    let size = i64::try_from(metadata.len()).context("file size exceeds i64")?;
    let modified = metadata
        .modified()
        .with_context(|| format!("mtime unavailable for {}", path.display()))?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    let mtime = i64::try_from(nanos).context("mtime exceeds i64 nanoseconds")?;
    Ok(Fingerprint { size, mtime })
}

fn registry_fingerprint(conn: &Connection, source_file: &str) -> Result<Option<Fingerprint>> {
    conn.query_row(
        "SELECT file_size, mtime FROM ingest_registry WHERE source_file = ?1",
        params![source_file],
        |row| {
            Ok(Fingerprint {
                size: row.get(0)?,
                mtime: row.get(1)?,
            })
        },
    )
    .optional()
    .context("failed to query ingest registry")
}

fn parse_csv_file(path: &Path, source_file: &str, rules: &[DatasetRule]) -> Result<ParsedFile> {
    let file =
        File::open(path).with_context(|| format!("open csv failed: {}", path.display()))?;

    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers: Vec<String> = rdr
        .headers()
        .context("csv must have a header row")?
        .iter()
        .map(str::to_ascii_lowercase)
        .collect();

    let mut parsed = ParsedFile::default();
    for rec in rdr.records() {
        let Ok(rec) = rec else {
            parsed.discarded += 1;
            continue;
        };

        let mut record = Map::new();
        for (header, cell) in headers.iter().zip(rec.iter()) {
            if !cell.is_empty() {
                record.insert(header.clone(), Value::String(cell.to_string()));
            }
        }

        match normalize_record(&record, source_file, rules) {
            Ok(row) => parsed.rows.push(row),
            Err(_) => parsed.discarded += 1,
        }
    }

    Ok(parsed)
}

fn parse_jsonl_file(path: &Path, source_file: &str, rules: &[DatasetRule]) -> Result<ParsedFile> {
    let file =
        File::open(path).with_context(|| format!("open jsonl failed: {}", path.display()))?;

    let mut parsed = ParsedFile::default();
    for (index, raw) in BufReader::new(file).split(b'\n').enumerate() {
        let mut raw = raw.with_context(|| {
            format!("failed to read line {} of {}", index + 1, path.display())
        })?;
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        let Ok(line) = String::from_utf8(raw) else {
            parsed.discarded += 1;
            continue;
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_jsonl_line(&line, source_file, rules) {
            Ok(row) => parsed.rows.push(row),
            Err(_) => parsed.discarded += 1,
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::{count, fixture_hub, must};

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        if let Err(err) = fs::write(&path, body) {
            panic!("failed to write fixture {name}: {err}");
        }
        path
    }

    fn scratch_dir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("failed to create temp dir: {err}"),
        }
    }

    #[test]
    fn unchanged_file_is_skipped_on_second_run() {
        let dir = scratch_dir();
        write(
            dir.path(),
            "table1_jan.csv",
            "event_time,entity_id,metric,value\n2026-01-03T10:00:00Z,m1,txn_amount,10\n",
        );
        let mut hub = fixture_hub();

        let first = must(hub.ingest(dir.path()));
        assert_eq!(first.files_ingested, 1);
        assert_eq!(first.rows_ingested, 1);

        let second = must(hub.ingest(dir.path()));
        assert_eq!(second.files_ingested, 0);
        assert_eq!(second.files_skipped, 1);
        assert_eq!(count(&hub, "SELECT COUNT(*) FROM bronze_events"), 1);
        assert_eq!(count(&hub, "SELECT COUNT(*) FROM pipeline_audit WHERE stage = 'ingest'"), 2);
    }

    #[test]
    fn changed_file_is_reingested() {
        let dir = scratch_dir();
        let path = write(
            dir.path(),
            "table1.jsonl",
            "{\"event_time\":\"2026-01-01\",\"metric\":\"txn_count\",\"value\":1}\n",
        );
        let mut hub = fixture_hub();
        must(hub.ingest(dir.path()));

        fs::write(
            &path,
            "{\"event_time\":\"2026-01-01\",\"metric\":\"txn_count\",\"value\":1}\n{\"event_time\":\"2026-01-02\",\"metric\":\"txn_count\",\"value\":2}\n",
        )
        .unwrap_or_else(|err| panic!("rewrite failed: {err}"));

        let report = must(hub.ingest(dir.path()));
        assert_eq!(report.files_ingested, 1);
        assert_eq!(report.rows_ingested, 2);
        assert_eq!(count(&hub, "SELECT COUNT(*) FROM bronze_events"), 3);
    }

    #[test]
    fn malformed_csv_payload_is_kept_as_raw() {
        let dir = scratch_dir();
        write(
            dir.path(),
            "table1_feb.csv",
            "Event_Time,Entity_ID,Metric,Value,Payload\n\
             2026-02-01T00:00:00Z,m1,txn_amount,10,\"{\"\"province\"\":\"\"gd\"\"}\"\n\
             2026-02-01T00:00:00Z,m2,txn_amount,20,{broken\n\
             2026-02-02T00:00:00Z,m1,txn_count,3,\n",
        );
        let mut hub = fixture_hub();
        let report = must(hub.ingest(dir.path()));
        assert_eq!(report.rows_ingested, 3);
        assert_eq!(report.rows_discarded, 0);

        let raw: String = match hub.connection().query_row(
            "SELECT raw_payload_json FROM bronze_events WHERE raw_entity_id = 'm2'",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("payload query failed: {err}"),
        };
        assert_eq!(raw, r#"{"_raw":"{broken"}"#);
        assert_eq!(
            count(&hub, "SELECT COUNT(*) FROM bronze_events WHERE dataset_id = 'table1'"),
            3
        );
    }

    #[test]
    fn bad_lines_are_dropped_and_counted() {
        let dir = scratch_dir();
        write(
            dir.path(),
            "misc.jsonl",
            "{\"metric\":\"fee_income\",\"value\":5,\"dataset_id\":\"table2\"}\n\
             not json\n\
             \n\
             {\"note\":\"no core fields\"}\n",
        );
        let mut hub = fixture_hub();
        let report = must(hub.ingest(dir.path()));
        assert_eq!(report.rows_ingested, 1);
        assert_eq!(report.rows_discarded, 2);

        let audit = must(hub.audit_trail(Some("ingest"), 1));
        assert_eq!(audit[0].details["rows_discarded"], 2);
    }

    #[test]
    fn unreadable_file_rolls_back_and_others_continue() {
        let dir = scratch_dir();
        write(
            dir.path(),
            "a_table1.jsonl",
            "{\"metric\":\"txn_count\",\"value\":1}\n",
        );
        let bad = dir.path().join("b_table1.csv");
        if let Err(err) = fs::write(&bad, b"metric,\xff\xfe\ntxn_amount,4\n") {
            panic!("failed to write binary fixture: {err}");
        }
        write(
            dir.path(),
            "c_table1.csv",
            "metric,value\ntxn_amount,4\n",
        );
        write(dir.path(), "ignored.txt", "metric,value\n");

        let mut hub = fixture_hub();
        let report = must(hub.ingest(dir.path()));
        assert_eq!(report.files_ingested, 2);
        assert_eq!(report.files_failed, 1);
        assert_eq!(report.rows_ingested, 2);
        assert_eq!(count(&hub, "SELECT COUNT(*) FROM ingest_registry"), 2);

        let audit = must(hub.audit_trail(Some("ingest"), 1));
        let failed = audit[0].details["failed_files"].as_array().map_or(0, Vec::len);
        assert_eq!(failed, 1);
    }

    #[test]
    fn non_utf8_jsonl_line_is_discarded_without_losing_the_file() {
        let dir = scratch_dir();
        let mut body = b"{\"metric\":\"txn_count\",\"value\":1}\n".to_vec();
        body.extend_from_slice(&[0x7b, 0xff, 0x0a]);
        body.extend_from_slice(b"{\"metric\":\"txn_count\",\"value\":2}\r\n");
        if let Err(err) = fs::write(dir.path().join("table1.jsonl"), body) {
            panic!("failed to write mixed fixture: {err}");
        }

        let mut hub = fixture_hub();
        let report = must(hub.ingest(dir.path()));
        assert_eq!(report.files_ingested, 1);
        assert_eq!(report.files_failed, 0);
        assert_eq!(report.rows_ingested, 2);
        assert_eq!(report.rows_discarded, 1);
        assert_eq!(count(&hub, "SELECT COUNT(*) FROM bronze_events"), 2);
    }

    #[test]
    fn small_batches_write_every_row() {
        let dir = scratch_dir();
        let mut body = String::from("metric,value\n");
        for index in 0..7 {
            body.push_str(&format!("txn_count,{index}\n"));
        }
        write(dir.path(), "table1.csv", &body);

        let mut config = datahub_core::PipelineConfig::default();
        config.ingest.batch_size = 3;
        let mut hub = must(SqliteDataHub::open(Path::new(":memory:"), config));
        must(hub.initialize());

        let report = must(hub.ingest(dir.path()));
        assert_eq!(report.rows_ingested, 7);
        assert_eq!(count(&hub, "SELECT COUNT(*) FROM bronze_events"), 7);
    }

    #[test]
    fn missing_import_dir_is_an_error() {
        let mut hub = fixture_hub();
        assert!(hub.ingest(Path::new("/definitely/not/here")).is_err());
    }
}
