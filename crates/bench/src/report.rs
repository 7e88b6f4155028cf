use std::{fmt, fs, path::Path};

use serde::Serialize;

use crate::config::BenchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Bytes,
    Seconds,
    Ratio,
    Count,
    TokensPerSecond,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Bytes => "bytes",
            Unit::Seconds => "seconds",
            Unit::Ratio => "ratio",
            Unit::Count => "count",
            Unit::TokensPerSecond => "tokens/s",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub label: String,
    pub value: f64,
    pub unit: Unit,
}

impl Measurement {
    pub fn new(label: impl Into<String>, value: f64, unit: Unit) -> Self {
        Self {
            label: label.into(),
            value,
            unit,
        }
    }

    pub fn formatted_value(&self) -> String {
        match self.unit {
            Unit::Bytes | Unit::Count => format!("{}", self.value as i64),
            Unit::Seconds => format!("{:.6}", self.value),
            Unit::Ratio => format!("{:.6}", self.value),
            Unit::TokensPerSecond => format_tokens_per_sec(self.value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ProbeStatus {
    Passed,
    Failed(String),
    /// Descriptive probes that record numbers without asserting anything.
    Observed,
}

impl ProbeStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, ProbeStatus::Failed(_))
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStatus::Passed => f.write_str("passed"),
            ProbeStatus::Failed(reason) => write!(f, "failed: {reason}"),
            ProbeStatus::Observed => f.write_str("observed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub probe: String,
    pub status: ProbeStatus,
    pub measurements: Vec<Measurement>,
    pub notes: Vec<String>,
}

impl ProbeReport {
    pub fn new(probe: impl Into<String>, status: ProbeStatus) -> Self {
        Self {
            probe: probe.into(),
            status,
            measurements: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn observed(probe: impl Into<String>) -> Self {
        Self::new(probe, ProbeStatus::Observed)
    }

    pub fn passed(probe: impl Into<String>) -> Self {
        Self::new(probe, ProbeStatus::Passed)
    }

    pub fn failed(probe: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(probe, ProbeStatus::Failed(reason.into()))
    }

    pub fn push(&mut self, label: impl Into<String>, value: f64, unit: Unit) {
        self.measurements.push(Measurement::new(label, value, unit));
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn measurement(&self, label: &str) -> Option<&Measurement> {
        self.measurements.iter().find(|m| m.label == label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub device: String,
    pub kernel: String,
    pub seed: Option<u64>,
    pub reports: Vec<ProbeReport>,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        !self.reports.iter().any(|report| report.status.is_failed())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProbeReport> {
        self.reports.iter().filter(|report| report.status.is_failed())
    }

    pub fn report(&self, probe: &str) -> Option<&ProbeReport> {
        self.reports.iter().find(|report| report.probe == probe)
    }

    pub fn to_json(&self) -> Result<String, BenchError> {
        serde_json::to_string_pretty(self)
            .map_err(|err| BenchError::runtime(format!("failed to encode report: {err}")))
    }

    pub fn write_json(&self, path: &Path) -> Result<(), BenchError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// One row per measurement; probes without measurements still get a row.
    pub fn to_markdown(&self) -> String {
        let mut rows = Vec::new();
        for report in &self.reports {
            if report.measurements.is_empty() {
                rows.push(vec![
                    report.probe.clone(),
                    report.status.to_string(),
                    "-".to_string(),
                    "-".to_string(),
                    "-".to_string(),
                ]);
            }
            for measurement in &report.measurements {
                rows.push(vec![
                    report.probe.clone(),
                    report.status.to_string(),
                    measurement.label.clone(),
                    measurement.formatted_value(),
                    measurement.unit.as_str().to_string(),
                ]);
            }
        }

        let mut body = format!(
            "device: `{}`, kernel: `{}`, seed: `{}`\n\n",
            self.device,
            self.kernel,
            self.seed.map_or_else(|| "none".to_string(), |seed| seed.to_string())
        );
        body.push_str(&format_markdown_table(
            &["Probe", "Status", "Measurement", "Value", "Unit"],
            &rows,
        ));
        body
    }
}

pub fn format_markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut table = String::new();
    table.push_str("| ");
    table.push_str(&headers.join(" | "));
    table.push_str(" |\n| ");
    table.push_str(&headers.iter().map(|_| "---").collect::<Vec<_>>().join(" | "));
    table.push_str(" |\n");
    for row in rows {
        table.push_str("| ");
        table.push_str(&row.join(" | "));
        table.push_str(" |\n");
    }
    table
}

/// Replaces the block between `<!-- SECTION_START -->` and
/// `<!-- SECTION_END -->` in `path`, appending it when absent. A missing
/// file is created with a title line.
pub fn update_results(path: &Path, section: &str, content: &str) -> Result<(), BenchError> {
    let section_upper = section.to_uppercase();
    let start_marker = format!("<!-- {}_START -->", section_upper);
    let end_marker = format!("<!-- {}_END -->", section_upper);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut body = if path.exists() {
        fs::read_to_string(path)?
    } else {
        "# Attention Probe Results\n\n".to_string()
    };

    let section_block = format!("{start_marker}\n{content}\n{end_marker}\n");
    match (body.find(&start_marker), body.find(&end_marker)) {
        (Some(start_idx), Some(end_idx)) if end_idx > start_idx => {
            let mut end_bound = end_idx + end_marker.len();
            if body[end_bound..].starts_with('\n') {
                end_bound += 1;
            }
            body.replace_range(start_idx..end_bound, &section_block);
        }
        _ => {
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&section_block);
        }
    }

    fs::write(path, body)?;
    Ok(())
}

pub fn format_tokens_per_sec(tokens_sec: f64) -> String {
    if tokens_sec >= 1e6 {
        format!("{:.2} M", tokens_sec / 1e6)
    } else if tokens_sec >= 1e3 {
        format!("{:.2} K", tokens_sec / 1e3)
    } else {
        format!("{:.2}", tokens_sec)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn sample_suite() -> SuiteReport {
        let mut speed = ProbeReport::observed("speed");
        speed.push("mean", 0.25, Unit::Seconds);
        SuiteReport {
            device: "cpu".into(),
            kernel: "tiled".into(),
            seed: Some(1),
            reports: vec![speed, ProbeReport::failed("forward", "Unexpected output shape: [1, 2]")],
        }
    }

    #[test]
    fn table_has_header_separator_and_rows() {
        let table = format_markdown_table(&["a", "b"], &[vec!["1".into(), "2".into()]]);
        assert_eq!(table, "| a | b |\n| --- | --- |\n| 1 | 2 |\n");
    }

    #[test]
    fn update_results_creates_then_replaces_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/RESULTS.md");

        update_results(&path, "probes", "first").unwrap();
        update_results(&path, "other", "keep me").unwrap();
        update_results(&path, "probes", "second").unwrap();

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Attention Probe Results"));
        assert!(body.contains("<!-- PROBES_START -->\nsecond\n<!-- PROBES_END -->\n"));
        assert!(!body.contains("first"));
        assert!(body.contains("keep me"));
        assert_eq!(body.matches("<!-- PROBES_START -->").count(), 1);
    }

    #[test]
    fn update_results_preserves_surrounding_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("RESULTS.md");
        fs::write(&path, "intro\n<!-- PROBES_START -->\nold\n<!-- PROBES_END -->\noutro\n").unwrap();

        update_results(&path, "probes", "new").unwrap();

        let body = fs::read_to_string(&path).unwrap();
        assert_eq!(body, "intro\n<!-- PROBES_START -->\nnew\n<!-- PROBES_END -->\noutro\n");
    }

    #[test]
    fn suite_passes_only_without_failures() {
        let mut suite = sample_suite();
        assert!(!suite.passed());
        assert_eq!(suite.failures().count(), 1);
        suite.reports.pop();
        assert!(suite.passed());
    }

    #[test]
    fn json_encodes_status_and_units() {
        let json = sample_suite().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["reports"][0]["status"]["state"], "observed");
        assert_eq!(value["reports"][0]["measurements"][0]["unit"], "seconds");
        assert_eq!(value["reports"][1]["status"]["state"], "failed");
        assert_eq!(
            value["reports"][1]["status"]["reason"],
            "Unexpected output shape: [1, 2]"
        );
    }

    #[test]
    fn markdown_lists_every_probe() {
        let markdown = sample_suite().to_markdown();
        assert!(markdown.contains("| speed | observed | mean | 0.250000 | seconds |"));
        assert!(markdown.contains("| forward | failed: Unexpected output shape: [1, 2] | - | - | - |"));
    }

    #[test]
    fn tokens_per_sec_uses_suffixes() {
        assert_eq!(format_tokens_per_sec(2_500_000.0), "2.50 M");
        assert_eq!(format_tokens_per_sec(1_500.0), "1.50 K");
        assert_eq!(format_tokens_per_sec(12.0), "12.00");
    }
}
