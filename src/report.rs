use anyhow::{anyhow, Context};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::scoring;

const MANIFEST_ENTRY: &str = "manifest.json";
pub const ARCHIVE_FORMAT_V1: &str = "examdesk-results-v1";

#[derive(Debug, Clone)]
pub struct CsvExportSummary {
    pub row_count: usize,
}

#[derive(Debug, Clone)]
pub struct ArchiveExportSummary {
    pub bundle_format: String,
    pub exam_count: usize,
    pub entry_count: usize,
}

fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn results_csv(conn: &Connection, exam_id: &str) -> anyhow::Result<(String, usize)> {
    let outcomes = scoring::exam_outcomes(conn, exam_id)
        .map_err(|e| anyhow!("failed to load exam outcomes: {}", e.message))?;

    let mut out = String::from("student,email,score,totalMarks,percent,passed,gradedAt\n");
    for o in &outcomes {
        out.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            csv_field(&o.display_name),
            csv_field(&o.email),
            o.score,
            o.total_marks,
            o.percent,
            if o.passed { "yes" } else { "no" },
            csv_field(&o.graded_at),
        ));
    }
    Ok((out, outcomes.len()))
}

pub fn export_results_csv(
    conn: &Connection,
    exam_id: &str,
    out_path: &Path,
) -> anyhow::Result<CsvExportSummary> {
    let (csv, row_count) = results_csv(conn, exam_id)?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let mut f = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    f.write_all(csv.as_bytes()).context("failed to write csv")?;

    Ok(CsvExportSummary { row_count })
}

fn entry_name(title: &str, exam_id: &str) -> String {
    let slug = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>();
    let slug = slug.trim_matches('-');
    let short_id: String = exam_id.chars().take(8).collect();
    if slug.is_empty() {
        format!("results/{}.csv", short_id)
    } else {
        format!("results/{}-{}.csv", slug, short_id)
    }
}

/// One zip bundle per class: a manifest with per-entry SHA-256 checksums,
/// then one CSV of graded results per exam.
pub fn export_results_archive(
    conn: &Connection,
    class_id: &str,
    out_path: &Path,
) -> anyhow::Result<ArchiveExportSummary> {
    let class_name: Option<String> = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .context("failed to look up class")?;
    let Some(class_name) = class_name else {
        return Err(anyhow!("class not found: {}", class_id));
    };

    let mut stmt = conn
        .prepare("SELECT id, title FROM exams WHERE class_id = ? ORDER BY created_at, title")
        .context("failed to prepare exam listing")?;
    let exams = stmt
        .query_map([class_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .context("failed to list exams")?;

    let mut entries = Vec::new();
    for (exam_id, title) in &exams {
        let (csv, row_count) = results_csv(conn, exam_id)?;
        let digest = Sha256::digest(csv.as_bytes());
        entries.push((
            entry_name(title, exam_id),
            exam_id.clone(),
            title.clone(),
            row_count,
            format!("{:x}", digest),
            csv,
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let manifest = json!({
        "format": ARCHIVE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": exported_at,
        "class": { "id": class_id, "name": class_name },
        "entries": entries
            .iter()
            .map(|(name, exam_id, title, rows, sha, _)| json!({
                "name": name,
                "examId": exam_id,
                "examTitle": title,
                "rows": rows,
                "sha256": sha,
            }))
            .collect::<Vec<_>>(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    for (name, _, _, _, _, csv) in &entries {
        zip.start_file(name.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", name))?;
        zip.write_all(csv.as_bytes())
            .with_context(|| format!("failed to write entry {}", name))?;
    }

    zip.finish().context("failed to finalize zip archive")?;

    Ok(ArchiveExportSummary {
        bundle_format: ARCHIVE_FORMAT_V1.to_string(),
        exam_count: exams.len(),
        entry_count: entries.len() + 1,
    })
}
