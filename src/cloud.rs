//! Cloud log retrieval and per-component health digestion.
//!
//! The oracle service runs as a handful of serverless components whose only
//! observable output is their cloud logs. Both supported backends are read
//! through their vendor CLIs and normalized into [`LogRecord`]s; the two
//! dialects differ in how an invocation report line looks and how timeouts
//! are phrased.

use chrono::NaiveDateTime;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::deploy::CommandRunner;

/// Substrings whose presence in any log line marks a component as failed.
const FAILURE_MARKERS: &[&str] = &["Exception", "Failed", "ERROR", "Runtime exited with error"];

/// Marker counted in the fulfillment component's logs, once per request the
/// oracle submitted a fulfillment transaction for.
const SUBMITTED_MARKER: &str = "submitted for Request";

/// Name fragment identifying the component that submits fulfillments.
const FULFILLMENT_COMPONENT: &str = "processProviderRequests";

/// One raw log line with its millisecond timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Milliseconds since the epoch; zero when the backend gave none.
    pub timestamp: i64,
    /// The raw log line.
    pub message: String,
}

/// A backend that can enumerate the oracle's deployed components and read
/// their recent logs. Tests substitute fakes at this seam.
#[allow(async_fn_in_trait)]
pub trait LogSource {
    /// Component names whose logs belong to the deployment under test.
    async fn list_components(&self, stage_prefix: &str) -> Result<Vec<String>>;

    /// Recent log events for one component.
    async fn read_logs(&self, component: &str) -> Result<Vec<LogEvent>>;
}

/// Which cloud's log phrasing to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDialect {
    /// Lambda-style reports: `Billed Duration` / `Max Memory Used` lines.
    Aws,
    /// Cloud-functions-style reports: `Function execution took` lines.
    Gcp,
}

impl LogDialect {
    /// Whether this backend's reports include memory readings. The success
    /// predicate only checks memory where the backend reports it.
    pub fn reports_memory(&self) -> bool {
        matches!(self, Self::Aws)
    }

    fn timeout_marker(&self) -> &'static str {
        match self {
            Self::Aws => "Task timed out after",
            Self::Gcp => "finished with status: 'timeout'",
        }
    }

    /// Parses one invocation-report line into `(duration_ms, memory_mb)`.
    /// Returns `None` for lines that are not reports.
    fn invocation(&self, message: &str) -> Option<(u64, u64)> {
        match self {
            Self::Aws => {
                if !message.contains("Billed Duration") {
                    return None;
                }
                let duration = integer_after(message, "Billed Duration:")?;
                let memory = integer_after(message, "Max Memory Used:").unwrap_or(0);
                Some((duration, memory))
            }
            Self::Gcp => {
                if !message.contains("Function execution took") {
                    return None;
                }
                // "Function execution took 240 ms, finished with ..."
                let duration = message.split_whitespace().nth(3).and_then(leading_integer)?;
                Some((duration, 0))
            }
        }
    }
}

/// Digested health of one component for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Component name as the backend reports it.
    pub name: String,
    /// Worst (largest) invocation duration observed, in milliseconds.
    pub duration_ms: u64,
    /// Worst memory usage observed, in MB. Zero on backends without
    /// memory reporting.
    pub memory_usage: u64,
    /// Whether any invocation hit the platform timeout.
    pub timed_out: bool,
    /// Whether any log line matched a failure marker.
    pub failed: bool,
    /// Fulfillment submissions counted in the logs; only present for the
    /// component that submits fulfillments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfilled_request_count: Option<usize>,
    /// The raw log lines, newest first.
    pub logs: Vec<String>,
}

/// Digests one component's log events into a [`LogRecord`].
///
/// A component may run many times in the assessed window (the API-calling
/// component always does), so the record carries the worst invocation's
/// duration and memory rather than any single run's.
pub fn digest_component(dialect: LogDialect, name: &str, mut events: Vec<LogEvent>) -> LogRecord {
    events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut duration_ms = 0;
    let mut memory_usage = 0;
    for (duration, memory) in events.iter().filter_map(|e| dialect.invocation(&e.message)) {
        duration_ms = duration_ms.max(duration);
        memory_usage = memory_usage.max(memory);
    }

    let occurred =
        |marker: &str| events.iter().any(|e| e.message.contains(marker));
    let timed_out = occurred(dialect.timeout_marker());
    let failed = FAILURE_MARKERS.iter().any(|marker| occurred(marker));

    let fulfilled_request_count = name.contains(FULFILLMENT_COMPONENT).then(|| {
        events.iter().filter(|e| e.message.contains(SUBMITTED_MARKER)).count()
    });

    LogRecord {
        name: name.to_string(),
        duration_ms,
        memory_usage,
        timed_out,
        failed,
        fulfilled_request_count,
        logs: events.into_iter().map(|e| e.message).collect(),
    }
}

/// First integer following `marker` in `message`.
fn integer_after(message: &str, marker: &str) -> Option<u64> {
    let rest = &message[message.find(marker)? + marker.len()..];
    leading_integer(rest.trim_start())
}

/// Parses the digits prefixing `token`, if any.
fn leading_integer(token: &str) -> Option<u64> {
    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[derive(Deserialize)]
struct AwsLogGroups {
    #[serde(rename = "logGroups", default)]
    log_groups: Vec<AwsLogGroup>,
}

#[derive(Deserialize)]
struct AwsLogGroup {
    #[serde(rename = "logGroupName")]
    log_group_name: String,
}

#[derive(Deserialize)]
struct AwsLogEvents {
    #[serde(default)]
    events: Vec<AwsLogEvent>,
}

#[derive(Deserialize)]
struct AwsLogEvent {
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    message: String,
}

/// CloudWatch-backed [`LogSource`] driven through the `aws` CLI.
#[derive(Debug)]
pub struct AwsLogSource<R> {
    runner: R,
}

impl<R: CommandRunner> AwsLogSource<R> {
    /// Creates a source issuing `aws logs` commands via `runner`.
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> LogSource for AwsLogSource<R> {
    async fn list_components(&self, stage_prefix: &str) -> Result<Vec<String>> {
        let output = self
            .runner
            .run("list log groups", "aws logs describe-log-groups --output json")
            .await?;
        eyre::ensure!(output.status_ok, "log group listing failed: {}", output.stderr);

        let groups: AwsLogGroups = serde_json::from_str(&output.stdout)
            .wrap_err("log group listing returned malformed json")?;
        Ok(groups
            .log_groups
            .into_iter()
            .map(|g| g.log_group_name)
            .filter(|name| name.contains(stage_prefix))
            .collect())
    }

    async fn read_logs(&self, component: &str) -> Result<Vec<LogEvent>> {
        let command =
            format!("aws logs filter-log-events --log-group-name '{component}' --output json");
        let output = self.runner.run("read component logs", &command).await?;
        eyre::ensure!(output.status_ok, "log read for {component} failed: {}", output.stderr);

        let events: AwsLogEvents = serde_json::from_str(&output.stdout)
            .wrap_err_with(|| format!("logs for {component} returned malformed json"))?;
        debug!(component, events = events.events.len(), "fetched component logs");
        Ok(events
            .events
            .into_iter()
            .map(|e| LogEvent { timestamp: e.timestamp, message: e.message })
            .collect())
    }
}

#[derive(Deserialize)]
struct GcpFunction {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct GcpLogEntry {
    #[serde(default)]
    time_utc: String,
    #[serde(default)]
    log: String,
}

/// Cloud-functions-backed [`LogSource`] driven through the `gcloud` CLI.
///
/// The vendor SDK is deliberately avoided; the CLI is the stable surface.
#[derive(Debug)]
pub struct GcpLogSource<R> {
    runner: R,
    region: String,
}

impl<R: CommandRunner> GcpLogSource<R> {
    /// Creates a source issuing `gcloud` commands via `runner` against
    /// `region`.
    pub fn new(runner: R, region: impl Into<String>) -> Self {
        Self { runner, region: region.into() }
    }
}

impl<R: CommandRunner> LogSource for GcpLogSource<R> {
    async fn list_components(&self, stage_prefix: &str) -> Result<Vec<String>> {
        let output = self
            .runner
            .run("list cloud functions", "gcloud functions list --format=json")
            .await?;
        eyre::ensure!(output.status_ok, "function listing failed: {}", output.stderr);

        let functions: Vec<GcpFunction> = serde_json::from_str(&output.stdout)
            .wrap_err("function listing returned malformed json")?;
        Ok(functions
            .into_iter()
            // Fully-qualified resource names; the short name is the last
            // path segment.
            .filter_map(|f| f.name.rsplit('/').next().map(str::to_string))
            .filter(|name| name.contains(stage_prefix))
            .collect())
    }

    async fn read_logs(&self, component: &str) -> Result<Vec<LogEvent>> {
        // Logs outlive removed functions, so retrieval stays bounded.
        let command = format!(
            "gcloud functions logs read '{component}' --region={} --limit=1000 --format=json",
            self.region
        );
        let output = self.runner.run("read function logs", &command).await?;
        eyre::ensure!(output.status_ok, "log read for {component} failed: {}", output.stderr);

        let entries: Vec<GcpLogEntry> = serde_json::from_str(&output.stdout)
            .wrap_err_with(|| format!("logs for {component} returned malformed json"))?;
        debug!(component, events = entries.len(), "fetched function logs");
        Ok(entries
            .into_iter()
            .map(|e| LogEvent { timestamp: parse_gcp_timestamp(&e.time_utc), message: e.log })
            .collect())
    }
}

/// Parses the CLI's `time_utc` field ("2021-11-04 09:06:31.941") into
/// epoch milliseconds, falling back to zero on anything unexpected.
fn parse_gcp_timestamp(raw: &str) -> i64 {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}

/// Runtime-selected log backend.
#[derive(Debug)]
pub enum CloudLogSource<R> {
    /// CloudWatch via the `aws` CLI.
    Aws(AwsLogSource<R>),
    /// Cloud functions via the `gcloud` CLI.
    Gcp(GcpLogSource<R>),
}

impl<R: CommandRunner> CloudLogSource<R> {
    /// The dialect matching this backend's log phrasing.
    pub fn dialect(&self) -> LogDialect {
        match self {
            Self::Aws(_) => LogDialect::Aws,
            Self::Gcp(_) => LogDialect::Gcp,
        }
    }
}

impl<R: CommandRunner> LogSource for CloudLogSource<R> {
    async fn list_components(&self, stage_prefix: &str) -> Result<Vec<String>> {
        match self {
            Self::Aws(source) => source.list_components(stage_prefix).await,
            Self::Gcp(source) => source.list_components(stage_prefix).await,
        }
    }

    async fn read_logs(&self, component: &str) -> Result<Vec<LogEvent>> {
        match self {
            Self::Aws(source) => source.read_logs(component).await,
            Self::Gcp(source) => source.read_logs(component).await,
        }
    }
}
