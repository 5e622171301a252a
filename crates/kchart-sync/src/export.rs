//! Parquet snapshots of aggregate charts.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use kchart_core::{kst, EntityId};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

const AGGREGATE_FILE: &str = "aggregate_chart.parquet";

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub position: u32,
    pub song_id: EntityId,
    pub song_name: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub hour: DateTime<Utc>,
    pub rows: usize,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// `reports/<YYYYMMDDHH>/` for one aggregate hour, stamped in Seoul time.
#[derive(Debug, Clone)]
pub struct AggregateExport {
    report_dir: PathBuf,
    hour: DateTime<Utc>,
}

impl AggregateExport {
    pub fn new(reports_root: impl Into<PathBuf>, hour: DateTime<Utc>) -> Self {
        let stamp = hour.with_timezone(&kst()).format("%Y%m%d%H").to_string();
        Self {
            report_dir: reports_root.into().join(stamp),
            hour,
        }
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    /// Write the parquet file and its manifest; returns the manifest path.
    pub async fn write(&self, rows: &[AggregateRow]) -> Result<PathBuf> {
        fs::create_dir_all(&self.report_dir)
            .await
            .with_context(|| format!("creating {}", self.report_dir.display()))?;

        let parquet_path = self.report_dir.join(AGGREGATE_FILE);
        write_aggregate_parquet(&parquet_path, self.hour, rows)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            hour: self.hour,
            rows: rows.len(),
            files: vec![manifest_entry("aggregate_chart", &self.report_dir, &parquet_path)?],
        };
        let manifest_path = self.report_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        info!(hour = %self.hour, rows = rows.len(), path = %manifest_path.display(), "exported aggregate chart");
        Ok(manifest_path)
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_aggregate_parquet(path: &Path, hour: DateTime<Utc>, rows: &[AggregateRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("hour", DataType::Utf8, false),
        ArrowField::new("position", DataType::UInt32, false),
        ArrowField::new("song_id", DataType::Int64, false),
        ArrowField::new("song_name", DataType::Utf8, true),
        ArrowField::new("score", DataType::Float64, false),
    ]));

    let hour = hour.to_rfc3339();
    let hours = StringArray::from(rows.iter().map(|_| Some(hour.as_str())).collect::<Vec<_>>());
    let positions = UInt32Array::from(rows.iter().map(|r| r.position).collect::<Vec<_>>());
    let song_ids = Int64Array::from(rows.iter().map(|r| r.song_id).collect::<Vec<_>>());
    let song_names = StringArray::from(rows.iter().map(|r| r.song_name.as_deref()).collect::<Vec<_>>());
    let scores = Float64Array::from(rows.iter().map(|r| r.score).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(hours),
            Arc::new(positions),
            Arc::new(song_ids),
            Arc::new(song_names),
            Arc::new(scores),
        ],
    )
    .context("building aggregate_chart record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, report_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(report_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn empty_chart_still_produces_a_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let hour = Utc.with_ymd_and_hms(2022, 4, 14, 15, 0, 0).unwrap();
        let export = AggregateExport::new(dir.path().join("reports"), hour);
        // 15:00 UTC rolls over to the next day in Seoul.
        assert!(export.report_dir().ends_with("2022041500"));

        let manifest_path = export.write(&[]).await.unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(&std::fs::read(manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["rows"], 0);
        assert_eq!(manifest["schema_version"], 1);
    }

    #[tokio::test]
    async fn manifest_hash_matches_file() {
        let dir = tempfile::tempdir().unwrap();
        let hour = Utc.with_ymd_and_hms(2022, 4, 14, 4, 0, 0).unwrap();
        let export = AggregateExport::new(dir.path(), hour);
        let rows = vec![
            AggregateRow { position: 1, song_id: 7, song_name: Some("LOVE DIVE".into()), score: 0.9867 },
            AggregateRow { position: 2, song_id: 9, song_name: None, score: 0.5 },
        ];
        export.write(&rows).await.unwrap();

        let parquet = std::fs::read(export.report_dir().join(AGGREGATE_FILE)).unwrap();
        let entry = manifest_entry("aggregate_chart", export.report_dir(), &export.report_dir().join(AGGREGATE_FILE)).unwrap();
        assert_eq!(entry.bytes, parquet.len() as u64);
        assert_eq!(entry.path, AGGREGATE_FILE);
        assert!(parquet.starts_with(b"PAR1"));
    }
}
