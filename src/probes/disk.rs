use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub const DF_PROGRAM: &str = "df";
pub const DF_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DiskUsage {
    pub used_bytes: f64,
    pub avail_bytes: f64,
    pub percent: u32,
    pub used_label: String,
    pub avail_label: String,
    pub usage_label: String,
}

#[derive(Debug, Error)]
pub enum DiskProbeError {
    #[error("invalid path '{0}'")]
    InvalidPath(String),
    #[error("failed to spawn df: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("df exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },
    #[error("df did not finish within {0:?}")]
    Timeout(Duration),
    #[error("no df line for '{0}'")]
    UnparseableOutput(String),
    #[error("malformed usage percentage '{0}'")]
    MalformedPercent(String),
    #[error("malformed size '{0}'")]
    MalformedSize(String),
}

impl DiskProbeError {
    pub fn is_parse_failure(&self) -> bool {
        matches!(
            self,
            Self::UnparseableOutput(_) | Self::MalformedPercent(_) | Self::MalformedSize(_)
        )
    }
}

pub async fn probe_disk(
    program: &str,
    path: &str,
    timeout: Duration,
) -> Result<DiskUsage, DiskProbeError> {
    let clean = clean_path(path)?;
    let output = run_df(program, &clean, timeout).await?;
    parse_df_output(&output, &clean)
}

pub fn clean_path(raw: &str) -> Result<String, DiskProbeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DiskProbeError::InvalidPath(raw.to_string()));
    }

    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }

    let cleaned = out.to_string_lossy().to_string();
    if cleaned.is_empty() || cleaned == "." {
        return Err(DiskProbeError::InvalidPath(raw.to_string()));
    }
    Ok(cleaned)
}

async fn run_df(program: &str, path: &str, timeout: Duration) -> Result<String, DiskProbeError> {
    debug!(command = %program, path = %path, "running df");
    let start = Instant::now();
    let child = Command::new(program)
        .arg("-h")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(DiskProbeError::Spawn)?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(DiskProbeError::Spawn)?,
        Err(_elapsed) => return Err(DiskProbeError::Timeout(timeout)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(
            path = %path,
            status = %output.status,
            stderr = %stderr,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "df failed"
        );
        return Err(DiskProbeError::CommandFailed {
            status: output.status.to_string(),
            stderr,
        });
    }

    debug!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        output_size = stdout.len(),
        "df finished"
    );
    Ok(stdout)
}

// Columns are counted from the end so a device name wrapped onto its own line still parses.
pub fn parse_df_output(output: &str, path: &str) -> Result<DiskUsage, DiskProbeError> {
    for line in output.lines() {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        let n = fields.len();
        if n < 5 || fields[n - 1] != path {
            continue;
        }

        let used = fields[n - 4];
        let avail = fields[n - 3];
        let usage = fields[n - 2];

        let percent = parse_percent(usage)?;
        let used_bytes = parse_size(used)?;
        let avail_bytes = parse_size(avail)?;

        return Ok(DiskUsage {
            used_bytes,
            avail_bytes,
            percent,
            used_label: used.to_string(),
            avail_label: avail.to_string(),
            usage_label: usage.to_string(),
        });
    }

    warn!(path = %path, df_output = %output.trim(), "could not find df line for path");
    Err(DiskProbeError::UnparseableOutput(path.to_string()))
}

pub fn parse_percent(token: &str) -> Result<u32, DiskProbeError> {
    token
        .strip_suffix('%')
        .and_then(|digits| digits.parse::<u32>().ok())
        .ok_or_else(|| DiskProbeError::MalformedPercent(token.to_string()))
}

pub fn parse_size(token: &str) -> Result<f64, DiskProbeError> {
    let token = token.trim();
    let malformed = || DiskProbeError::MalformedSize(token.to_string());
    let last = token.chars().last().ok_or_else(malformed)?;

    let multiplier = match last.to_ascii_uppercase() {
        'K' => 1024_f64,
        'M' => 1024_f64.powi(2),
        'G' => 1024_f64.powi(3),
        'T' => 1024_f64.powi(4),
        _ => 1.0,
    };
    let number = if multiplier > 1.0 {
        &token[..token.len() - last.len_utf8()]
    } else {
        token
    };

    let value = number
        .replace(',', ".")
        .parse::<f64>()
        .map_err(|_| malformed())?;
    if !value.is_finite() || value < 0.0 {
        return Err(malformed());
    }
    Ok(value * multiplier)
}

pub fn format_disk_usage(label: &str, usage: &DiskUsage, status: &str) -> String {
    format!(
        "💾 {label} disk usage\n\n\
         📊 Used:    {}\n\
         📦 Avail:   {}\n\
         📈 Usage:   {}\n\
         ✅ Status:  {status}",
        usage.used_label, usage.avail_label, usage.usage_label
    )
}
