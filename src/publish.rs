//! Uploads collected artifacts to S3.

use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Table file name under the output root.
pub const PERCENTILE_TABLE_FILE: &str = "route_hour_p80_p90_p95.csv";

#[derive(Debug, Serialize)]
struct Manifest {
    generated_at: DateTime<Utc>,
    objects: Vec<String>,
}

/// Serializes a value to JSON and uploads it with `application/json` content type.
pub async fn write_json_to_s3(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    value: &impl Serialize,
) -> Result<()> {
    let body = serde_json::to_vec(value)?;

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body.into())
        .content_type("application/json")
        .send()
        .await?;

    Ok(())
}

/// Per-day archives, then the percentile table if present.
pub fn publishable_files(output_root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    let daily = output_root.join("daily");
    if daily.is_dir() {
        for entry in fs::read_dir(&daily).with_context(|| format!("listing '{}'", daily.display()))? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if path.is_file() && name.starts_with("delays_") && name.ends_with(".csv.gz") {
                files.push(path);
            }
        }
        files.sort();
    }

    let table = output_root.join(PERCENTILE_TABLE_FILE);
    if table.is_file() {
        files.push(table);
    }

    Ok(files)
}

/// Object key for `path`: its location relative to `output_root`, with `/`
/// separators, under an optional prefix.
pub fn object_key(output_root: &Path, path: &Path, prefix: &str) -> Result<String> {
    let relative = path
        .strip_prefix(output_root)
        .with_context(|| format!("'{}' is outside '{}'", path.display(), output_root.display()))?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let key = parts.join("/");

    let prefix = prefix.trim_matches('/');
    Ok(if prefix.is_empty() {
        key
    } else {
        format!("{prefix}/{key}")
    })
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("gz") => "application/gzip",
        Some("csv") => "text/csv",
        _ => "application/octet-stream",
    }
}

/// Uploads every publishable file, then a `manifest.json` listing them.
/// Returns the uploaded object keys.
#[tracing::instrument(skip(client), fields(output_root = %output_root.display()))]
pub async fn publish(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    output_root: &Path,
    prefix: &str,
) -> Result<Vec<String>> {
    let files = publishable_files(output_root)?;
    let mut objects = Vec::with_capacity(files.len());

    for path in &files {
        let key = object_key(output_root, path, prefix)?;
        let body = fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;

        client
            .put_object()
            .bucket(bucket)
            .key(&key)
            .content_type(content_type(path))
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("uploading s3://{bucket}/{key}"))?;

        info!(key = %key, "Uploaded");
        objects.push(key);
    }

    let manifest_key = object_key(output_root, &output_root.join("manifest.json"), prefix)?;
    let manifest = Manifest {
        generated_at: Utc::now(),
        objects: objects.clone(),
    };
    write_json_to_s3(client, bucket, &manifest_key, &manifest).await?;

    info!(upload_count = objects.len(), bucket, "S3 upload complete");
    Ok(objects)
}
