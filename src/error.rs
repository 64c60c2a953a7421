use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures raised by the benchmark core.
///
/// Check failures are recovered inside the scheduler; every other variant
/// aborts the current record or replay phase.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("check for site '{site}' timed out after {timeout:?}")]
    CheckTimeout { site: String, timeout: Duration },

    #[error("check for site '{site}' failed: {message}")]
    CheckFailed { site: String, message: String },

    #[error("failed to spawn {name}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{name} is not running after start (stdout: {}, stderr: {})",
        .stdout_log.display(),
        .stderr_log.display()
    )]
    ProcessStart {
        name: String,
        stdout_log: PathBuf,
        stderr_log: PathBuf,
    },

    #[error("{name} exited with code {}", describe_code(.code))]
    ProcessExit { name: String, code: Option<i32> },

    #[error("{name} did not exit within {timeout:?}")]
    ProcessWaitTimeout { name: String, timeout: Duration },

    #[error("{name}: cannot {action} while {state}")]
    ProcessState {
        name: String,
        action: &'static str,
        state: String,
    },

    #[error("no {count} free ports on {host} within {begin}..{end}")]
    PortAllocation {
        host: String,
        begin: u16,
        end: u16,
        count: usize,
    },

    #[error("no archive pairs, no archives to compare")]
    NoArchivePairs,

    #[error("malformed archive file name: {}", .0.display())]
    MalformedArchiveName(PathBuf),

    #[error("archive pairing needs exactly 2 sites, got {0}")]
    UnsupportedSiteCount(usize),

    #[error("sample for site {site} has {got} readings, expected {expected}")]
    SampleShape {
        site: usize,
        got: usize,
        expected: usize,
    },
}

fn describe_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "<signal>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_exit_names_process_and_code() {
        let err = BenchError::ProcessExit {
            name: "wpr replay site-a".into(),
            code: Some(1),
        };
        assert_eq!(err.to_string(), "wpr replay site-a exited with code 1");

        let err = BenchError::ProcessExit {
            name: "wpr".into(),
            code: None,
        };
        assert!(err.to_string().contains("<signal>"));
    }

    #[test]
    fn start_failure_mentions_log_paths() {
        let err = BenchError::ProcessStart {
            name: "wpr record".into(),
            stdout_log: PathBuf::from("/tmp/a.stdout.log"),
            stderr_log: PathBuf::from("/tmp/a.stderr.log"),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("/tmp/a.stdout.log"));
        assert!(rendered.contains("/tmp/a.stderr.log"));
    }
}
