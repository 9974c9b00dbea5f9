//! Snapshot exports of the price table: a JSON dump plus a parquet file and
//! its manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;
use vegwatch_core::{format_day, PriceObservation};
use vegwatch_storage::PriceStore;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub generated_at: String,
    pub rows: usize,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub dir: PathBuf,
    pub rows: usize,
    pub manifest_path: PathBuf,
}

/// Newest day first; rows of one day keep insertion order.
pub fn order_for_dump(mut rows: Vec<PriceObservation>) -> Vec<PriceObservation> {
    rows.sort_by(|a, b| b.date.cmp(&a.date));
    rows
}

/// Writes `prices.json`, `prices.parquet` and `manifest.json` into a fresh
/// timestamped directory under `root`.
pub async fn export_prices(prices: &PriceStore, root: &Path) -> Result<ExportSummary> {
    let rows = order_for_dump(prices.list_all().await.context("reading prices for export")?);
    let stamp = Utc::now();
    let dir = root.join(stamp.format("%Y%m%dT%H%M%S%.3fZ").to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json_path = dir.join("prices.json");
    let json = serde_json::to_vec_pretty(&rows).context("serializing price dump")?;
    fs::write(&json_path, json)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;

    let parquet_path = dir.join("prices.parquet");
    write_prices_parquet(&parquet_path, &rows)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        generated_at: stamp.to_rfc3339(),
        rows: rows.len(),
        files: vec![
            manifest_entry("prices_json", &dir, &json_path)?,
            manifest_entry("prices_parquet", &dir, &parquet_path)?,
        ],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(dir = %dir.display(), rows = rows.len(), "price export written");
    Ok(ExportSummary {
        dir,
        rows: rows.len(),
        manifest_path,
    })
}

fn write_prices_parquet(path: &Path, rows: &[PriceObservation]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, false),
        ArrowField::new("vegetable", DataType::Utf8, false),
        ArrowField::new("wholesale_price", DataType::Int64, true),
        ArrowField::new("retail_min_price", DataType::Utf8, true),
        ArrowField::new("retail_max_price", DataType::Utf8, true),
        ArrowField::new("shopmall_min_price", DataType::Utf8, true),
        ArrowField::new("shopmall_max_price", DataType::Utf8, true),
        ArrowField::new("unit", DataType::Utf8, true),
        ArrowField::new("image", DataType::Utf8, true),
        ArrowField::new("created_at", DataType::Utf8, false),
    ]));

    let text = |f: fn(&PriceObservation) -> Option<&str>| StringArray::from(rows.iter().map(f).collect::<Vec<_>>());

    let ids = Int64Array::from(rows.iter().map(|r| r.id).collect::<Vec<_>>());
    let dates = StringArray::from(rows.iter().map(|r| format_day(r.date)).collect::<Vec<_>>());
    let cities = text(|r| Some(r.city.as_str()));
    let vegetables = text(|r| Some(r.vegetable.as_str()));
    let wholesale = Int64Array::from(rows.iter().map(|r| r.wholesale_price).collect::<Vec<_>>());
    let retail_min = text(|r| r.retail_min_price.as_deref());
    let retail_max = text(|r| r.retail_max_price.as_deref());
    let shopmall_min = text(|r| r.shopmall_min_price.as_deref());
    let shopmall_max = text(|r| r.shopmall_max_price.as_deref());
    let units = text(|r| r.unit.as_deref());
    let images = text(|r| r.image.as_deref());
    let created = StringArray::from(rows.iter().map(|r| r.created_at.to_rfc3339()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(dates),
            Arc::new(cities),
            Arc::new(vegetables),
            Arc::new(wholesale),
            Arc::new(retail_min),
            Arc::new(retail_max),
            Arc::new(shopmall_min),
            Arc::new(shopmall_max),
            Arc::new(units),
            Arc::new(images),
            Arc::new(created),
        ],
    )
    .context("building prices record batch")?;

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

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(Sha256::digest(&bytes)),
        bytes: bytes.len() as u64,
    })
}
