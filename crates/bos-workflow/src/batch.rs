//! Sequential batch execution with per-host failure isolation.

use crate::cancel::CancelFlag;
use bos_error::{ToolboxError, ToolboxResult};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostOutcome {
    Success,
    Failed {
        /// `upgrade`, `restore` or `platform` for domain stops.
        phase: Option<String>,
        exit_code: i32,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostResult {
    pub host: String,
    #[serde(flatten)]
    pub outcome: HostOutcome,
}

impl HostResult {
    pub fn success(host: &str) -> Self {
        Self {
            host: host.to_string(),
            outcome: HostOutcome::Success,
        }
    }

    pub fn failed(host: &str, err: &ToolboxError) -> Self {
        Self {
            host: host.to_string(),
            outcome: HostOutcome::Failed {
                phase: err.phase().map(|p| p.to_string()),
                exit_code: err.exit_code(),
                message: err.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == HostOutcome::Success
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub results: Vec<HostResult>,
}

impl BatchReport {
    pub fn error_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }

    /// Hosts in the order they were attempted.
    pub fn attempted(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.host.as_str()).collect()
    }

    /// Write the report as JSON, replacing `path` atomically.
    pub fn write_json(&self, path: &Path) -> ToolboxResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(self)
            .map_err(|e| ToolboxError::Other(format!("Failed to serialize report: {}", e)))?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut file = File::create(&tmp)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// A batch stopped early. Carries what was attempted up to and including the failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct BatchAbort {
    pub report: BatchReport,
    #[source]
    pub error: ToolboxError,
}

pub struct BatchRunner<'c> {
    ignore_errors: bool,
    cancel: &'c CancelFlag,
}

impl<'c> BatchRunner<'c> {
    pub fn new(ignore_errors: bool, cancel: &'c CancelFlag) -> Self {
        Self {
            ignore_errors,
            cancel,
        }
    }

    /// Run `per_host` for every host in order.
    ///
    /// Without `ignore_errors` the first failure aborts the batch. A user interrupt
    /// always aborts.
    pub fn run<F>(&self, hosts: &[String], mut per_host: F) -> Result<BatchReport, BatchAbort>
    where
        F: FnMut(&str) -> ToolboxResult<()>,
    {
        let mut report = BatchReport::default();
        for host in hosts {
            if let Err(error) = self.cancel.check() {
                return Err(BatchAbort { report, error });
            }
            match per_host(host) {
                Ok(()) => report.results.push(HostResult::success(host)),
                Err(err) => {
                    // A remote command killed by Ctrl+C surfaces as a transport error.
                    let err = if self.cancel.is_cancelled() {
                        ToolboxError::Interrupted
                    } else {
                        err
                    };
                    log::error!("{}: {}", host, err);
                    report.results.push(HostResult::failed(host, &err));
                    if err.is_interrupt() || !self.ignore_errors {
                        return Err(BatchAbort { report, error: err });
                    }
                }
            }
        }
        Ok(report)
    }
}

/// Parse a batch host list: first column of each CSV record, optional `host` header.
pub fn parse_host_list<R: Read>(input: R) -> ToolboxResult<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    let mut hosts = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| ToolboxError::Other(format!("Invalid input file: {}", e)))?;
        match record.get(0) {
            Some(host) if !host.is_empty() => hosts.push(host.to_string()),
            _ => {}
        }
    }
    if hosts.first().map(String::as_str) == Some("host") {
        hosts.remove(0);
    }
    Ok(hosts)
}

pub fn read_host_list(path: &Path) -> ToolboxResult<Vec<String>> {
    let file = File::open(path).map_err(|e| {
        ToolboxError::Other(format!("Invalid input file: {} ({})", path.display(), e))
    })?;
    parse_host_list(file).map_err(|e| ToolboxError::Other(format!("{} ({})", e, path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bos_error::StopKind;
    use tempfile::tempdir;

    fn hosts(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("10.0.0.{}", i)).collect()
    }

    fn fail_at(k: usize) -> impl FnMut(&str) -> ToolboxResult<()> {
        move |host: &str| {
            if host == format!("10.0.0.{}", k) {
                Err(ToolboxError::upgrade(StopKind::StageFailure, "stage1 failed"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn header_row_is_skipped() {
        assert_eq!(
            parse_host_list("host\n10.0.0.5\n\n10.0.0.6,rack 2\n".as_bytes()).unwrap(),
            vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()]
        );
        assert_eq!(
            parse_host_list("10.0.0.5\nhost\n".as_bytes()).unwrap(),
            vec!["10.0.0.5", "host"]
        );
    }

    #[test]
    fn quoted_fields_stay_in_their_record() {
        let hosts =
            parse_host_list("host,note\n10.0.0.5,\"rack 3\nshelf 2\"\n\"10.0.0.6\",x\n".as_bytes())
                .unwrap();
        assert_eq!(hosts, vec!["10.0.0.5", "10.0.0.6"]);
    }

    #[test]
    fn unreadable_records_are_invalid_input() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts.csv");
        fs::write(&path, b"10.0.0.5\n\"\xff\xfe\"\n").unwrap();
        let err = read_host_list(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid input file"));
    }

    #[test]
    fn first_failure_aborts_without_ignore() {
        let cancel = CancelFlag::new();
        for k in 1..=5 {
            let abort = BatchRunner::new(false, &cancel)
                .run(&hosts(5), fail_at(k))
                .unwrap_err();
            assert_eq!(abort.report.attempted(), hosts(k));
            assert_eq!(abort.error.exit_code(), 2);
            assert_eq!(abort.report.error_count(), 1);
        }
    }

    #[test]
    fn ignore_attempts_every_host_and_counts_failures() {
        let cancel = CancelFlag::new();
        let report = BatchRunner::new(true, &cancel)
            .run(&hosts(4), |host: &str| {
                if host.ends_with(".2") || host.ends_with(".4") {
                    Err(ToolboxError::Other("boom".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(report.attempted(), hosts(4));
        assert_eq!(report.error_count(), 2);
    }

    #[test]
    fn interrupt_aborts_even_when_ignoring() {
        let cancel = CancelFlag::new();
        let abort = BatchRunner::new(true, &cancel)
            .run(&hosts(3), |host: &str| {
                if host == "10.0.0.2" {
                    cancel.cancel();
                    Err(ToolboxError::Other("ssh killed".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(abort.error.is_interrupt());
        assert_eq!(abort.report.attempted(), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn report_serializes_outcomes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/report.json");
        let report = BatchReport {
            results: vec![
                HostResult::success("10.0.0.5"),
                HostResult::failed(
                    "10.0.0.6",
                    &ToolboxError::platform(StopKind::Conflict, "File exists"),
                ),
            ],
        };
        report.write_json(&path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["results"][0]["status"], "success");
        assert_eq!(value["results"][1]["status"], "failed");
        assert_eq!(value["results"][1]["phase"], "platform");
        assert_eq!(value["results"][1]["exit_code"], 4);
    }
}
