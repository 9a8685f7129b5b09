//! Batch result export in JSON, CSV, and XLSX.

use std::str::FromStr;

use rust_xlsxwriter::Workbook;

use crate::batch::job::{BatchSnapshot, QueryOutcome};
use crate::error::DistributionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }
}

impl FromStr for ExportFormat {
    type Err = DistributionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "xlsx" => Ok(ExportFormat::Xlsx),
            other => Err(DistributionError::UnsupportedExportFormat(other.to_string())),
        }
    }
}

/// Render a batch snapshot as bytes in the requested format.
pub fn export_snapshot(
    snapshot: &BatchSnapshot,
    format: ExportFormat,
) -> Result<Vec<u8>, DistributionError> {
    match format {
        ExportFormat::Json => serde_json::to_vec_pretty(snapshot)
            .map_err(|e| DistributionError::ExportFailed(e.to_string())),
        ExportFormat::Csv => Ok(to_csv(snapshot).into_bytes()),
        ExportFormat::Xlsx => to_xlsx(snapshot),
    }
}

const COLUMNS: [&str; 6] = ["query_id", "query_type", "domain", "priority", "status", "detail"];

fn row_values(result: &crate::batch::job::QueryResult) -> [String; 6] {
    let (status, detail) = match &result.outcome {
        Some(QueryOutcome::Success { result }) => ("success".to_string(), result.to_string()),
        Some(QueryOutcome::Error { error }) => ("error".to_string(), error.to_string()),
        None => ("pending".to_string(), String::new()),
    };
    [
        result.query_id.to_string(),
        result.query_type.to_string(),
        result.domain.clone().unwrap_or_default(),
        result.priority.to_string(),
        status,
        detail,
    ]
}

fn to_csv(snapshot: &BatchSnapshot) -> String {
    let mut out = String::new();
    out.push_str(&COLUMNS.join(","));
    out.push('\n');
    for result in &snapshot.results {
        let row: Vec<String> = row_values(result).iter().map(|v| csv_escape(v)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn to_xlsx(snapshot: &BatchSnapshot) -> Result<Vec<u8>, DistributionError> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet
        .set_name("results")
        .map_err(|e| DistributionError::ExportFailed(e.to_string()))?;

    for (col, header) in COLUMNS.iter().enumerate() {
        worksheet
            .write_string(0, col as u16, *header)
            .map_err(|e| DistributionError::ExportFailed(e.to_string()))?;
    }
    for (row, result) in snapshot.results.iter().enumerate() {
        for (col, value) in row_values(result).iter().enumerate() {
            worksheet
                .write_string(row as u32 + 1, col as u16, value)
                .map_err(|e| DistributionError::ExportFailed(e.to_string()))?;
        }
    }

    workbook
        .save_to_buffer()
        .map_err(|e| DistributionError::ExportFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::job::{BatchStatus, QueryResult};
    use crate::batch::query::{Query, QuerySpec};
    use crate::resolver::QueryError;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_snapshot() -> BatchSnapshot {
        let query = Query::new(
            QuerySpec::DomainAnalysis {
                domain: "market".to_string(),
                metrics: vec![],
            },
            1,
        );
        let mut ok = QueryResult::pending(&query);
        ok.outcome = Some(QueryOutcome::Success {
            result: serde_json::json!({ "growth": 0.1 }),
        });

        let failed_query = Query::new(
            QuerySpec::Historical {
                domain: "with,comma".to_string(),
                window_days: 7,
            },
            0,
        );
        let mut failed = QueryResult::pending(&failed_query);
        failed.outcome = Some(QueryOutcome::Error {
            error: QueryError::Timeout { timeout_ms: 100 },
        });

        BatchSnapshot {
            batch_id: Uuid::new_v4(),
            status: BatchStatus::Complete,
            submitted_at: Utc::now(),
            finished_at: Some(Utc::now()),
            max_parallel: 2,
            callback_url: None,
            total_queries: 2,
            completed_queries: 2,
            succeeded_queries: 1,
            results: vec![ok, failed],
        }
    }

    #[test]
    fn format_parsing() {
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("xlsx".parse::<ExportFormat>().unwrap(), ExportFormat::Xlsx);
        assert!(matches!(
            "pdf".parse::<ExportFormat>(),
            Err(DistributionError::UnsupportedExportFormat(_))
        ));
    }

    #[test]
    fn json_export_round_trips() {
        let bytes = export_snapshot(&sample_snapshot(), ExportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "complete");
        assert_eq!(value["results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn csv_export_has_header_and_one_row_per_query() {
        let bytes = export_snapshot(&sample_snapshot(), ExportFormat::Csv).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("query_id,query_type,domain"));
        assert!(lines[1].contains("success"));
        assert!(lines[2].contains("error"));
    }

    #[test]
    fn csv_escapes_embedded_commas() {
        let bytes = export_snapshot(&sample_snapshot(), ExportFormat::Csv).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"with,comma\""));
    }

    #[test]
    fn xlsx_export_produces_a_zip_container() {
        let bytes = export_snapshot(&sample_snapshot(), ExportFormat::Xlsx).unwrap();
        // XLSX is a zip archive; check the magic bytes.
        assert_eq!(&bytes[..2], b"PK");
    }
}
