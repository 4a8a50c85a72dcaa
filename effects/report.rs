//! Text and TSV renderings of estimate tables.

use crate::estimates::{EstimateRow, Estimates};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write TSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Union of key names across rows, in order of first appearance.
pub(crate) fn key_columns(rows: &[EstimateRow]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for row in rows {
        for name in row.key.names() {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

fn key_cell(row: &EstimateRow, name: &str) -> String {
    row.key.get(name).map(|v| v.to_string()).unwrap_or_default()
}

fn number_cell(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) if v.is_nan() => "NaN".to_string(),
        Some(v) => format!("{v:.precision$}"),
        None => String::new(),
    }
}

fn raw_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn percent_label(p: f64) -> String {
    let text = format!("{:.1}", p * 100.0);
    format!("{} %", text.trim_end_matches(".0"))
}

impl fmt::Display for Estimates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let conf_level = self
            .inference()
            .map(|inf| inf.backend.conf_level)
            .unwrap_or(self.call().conf_level);
        let alpha = (1.0 - conf_level) / 2.0;

        let mut header: Vec<String> = key_columns(self.rows());
        let key_count = header.len();
        header.extend(
            ["Estimate", "Std. Error", "z", "Pr(>|z|)"]
                .iter()
                .map(|s| s.to_string()),
        );
        header.push(percent_label(alpha));
        header.push(percent_label(1.0 - alpha));

        let body: Vec<Vec<String>> = self
            .rows()
            .iter()
            .map(|row| {
                let mut cells: Vec<String> =
                    header[..key_count].iter().map(|n| key_cell(row, n)).collect();
                cells.push(number_cell(Some(row.estimate), 4));
                cells.push(number_cell(row.std_error, 4));
                cells.push(number_cell(row.statistic, 2));
                cells.push(number_cell(row.p_value, 3));
                cells.push(number_cell(row.conf_low, 4));
                cells.push(number_cell(row.conf_high, 4));
                cells
            })
            .collect();

        let widths: Vec<usize> = (0..header.len())
            .map(|c| {
                body.iter()
                    .map(|cells| cells[c].len())
                    .chain(std::iter::once(header[c].len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let line = |cells: &[String]| {
            cells
                .iter()
                .zip(&widths)
                .map(|(cell, &w)| format!("{cell:>w$}"))
                .collect::<Vec<_>>()
                .join("  ")
        };
        writeln!(f, "{}", line(&header))?;
        for cells in &body {
            writeln!(f, "{}", line(cells))?;
        }

        writeln!(f)?;
        write!(f, "Type: {}, call: {}", self.kind(), self.call().function_name())?;
        if let Some(inf) = self.inference() {
            write!(
                f,
                "\nUncertainty: {} with {} of {} replicates ({} interval)",
                inf.backend.method,
                inf.backend.replicates_used,
                inf.backend.replicates_requested,
                inf.backend.interval
            )?;
        }
        Ok(())
    }
}

/// Writes the table as tab-separated text with a header row.
pub fn write_tsv_to<W: Write>(estimates: &Estimates, writer: W) -> Result<(), ReportError> {
    let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    let keys = key_columns(estimates.rows());

    let mut header = keys.clone();
    header.extend(
        ["estimate", "std_error", "statistic", "p_value", "conf_low", "conf_high"]
            .iter()
            .map(|s| s.to_string()),
    );
    out.write_record(&header)?;

    for row in estimates.rows() {
        let mut record: Vec<String> = keys.iter().map(|n| key_cell(row, n)).collect();
        record.push(row.estimate.to_string());
        record.push(raw_cell(row.std_error));
        record.push(raw_cell(row.statistic));
        record.push(raw_cell(row.p_value));
        record.push(raw_cell(row.conf_low));
        record.push(raw_cell(row.conf_high));
        out.write_record(&record)?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_tsv(estimates: &Estimates, path: impl AsRef<Path>) -> Result<(), ReportError> {
    let file = File::create(path.as_ref())?;
    write_tsv_to(estimates, file)?;
    log::info!("Wrote {} rows to '{}'", estimates.len(), path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use crate::estimates::{avg_comparisons, predictions};
    use crate::registry::ModelRegistry;
    use ndarray::array;
    use std::sync::Arc;

    fn model() -> Arc<crate::model::FittedModel> {
        let data = Arc::new(
            Dataset::new(vec![
                ("y", array![1.0, 2.5, 2.9, 4.2, 5.1]),
                ("x", array![0.0, 1.0, 2.0, 3.0, 4.0]),
            ])
            .unwrap(),
        );
        Arc::new(ModelRegistry::default().fit("lm", "y ~ x", data, None).unwrap())
    }

    #[test]
    fn display_has_header_and_footer() {
        let est = avg_comparisons(&model(), "x").unwrap();
        let text = est.to_string();
        let first = text.lines().next().unwrap();
        assert!(first.contains("term"));
        assert!(first.contains("2.5 %"));
        assert!(first.contains("97.5 %"));
        assert!(text.contains("call: avg_comparisons"));
    }

    #[test]
    fn tsv_has_one_line_per_row() {
        let est = predictions(&model()).unwrap();
        let mut buffer = Vec::new();
        write_tsv_to(&est, &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(
            lines[0],
            "rowid\testimate\tstd_error\tstatistic\tp_value\tconf_low\tconf_high"
        );
        assert!(lines[1].starts_with("1\t"));
    }

    #[test]
    fn tsv_file_round_trips_through_disk() {
        let est = predictions(&model()).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        write_tsv(&est, file.path()).unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(text.lines().count(), 6);
    }
}
