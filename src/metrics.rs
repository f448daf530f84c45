//! Bounded-retry metrics polling and on-chain reconciliation.

use std::time::Duration;

use alloy_primitives::Address;
use alloy_sol_types::SolEvent;
use chrono::{DateTime, Utc};
use eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chain::Chain;
use crate::cloud::{digest_component, LogDialect, LogRecord, LogSource};
use crate::protocol::Rrp;

/// Default number of polling attempts before giving up.
pub const DEFAULT_POLL_ATTEMPTS: u32 = 16;
/// Default sleep between polling attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Default settle delay before on-chain reconciliation; fulfillment
/// transactions may still be in flight when the logs look complete.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(40);
/// How far back the on-chain reconciliation scans.
const RECONCILE_BLOCK_WINDOW: u64 = 1000;

/// On-chain view of a run: what was requested and what got fulfilled,
/// replayed from recent protocol-contract events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OnChainMetrics {
    /// `FulfilledRequest` events observed.
    pub successful_fulfillments: u64,
    /// `FailedRequest` events observed.
    pub failed_fulfillments: u64,
    /// Request events observed.
    pub made_requests: u64,
    /// Requests with no matching fulfillment or failure event.
    pub outstanding_requests: u64,
}

impl OnChainMetrics {
    fn add(&mut self, other: OnChainMetrics) {
        self.successful_fulfillments += other.successful_fulfillments;
        self.failed_fulfillments += other.failed_fulfillments;
        self.made_requests += other.made_requests;
        self.outstanding_requests += other.outstanding_requests;
    }
}

/// Terminal record for one run attempt.
#[derive(Debug, Clone, Serialize)]
pub struct OutputMetrics {
    /// Session identifier shared by every run in one invocation.
    pub test_key: String,
    /// Whether the completion predicate was satisfied.
    pub success: bool,
    /// Requests configured for the run.
    pub request_count: usize,
    /// Wallets funded per chain.
    pub wallet_count: usize,
    /// Chains provisioned.
    pub chain_count: usize,
    /// When the run attempt started.
    pub run_start: DateTime<Utc>,
    /// When the run attempt finished.
    pub run_end: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub run_delta_ms: i64,
    /// Per-component log digests.
    pub metrics: Vec<LogRecord>,
    /// On-chain reconciliation of the run's requests.
    pub on_chain_metrics: OnChainMetrics,
}

/// Transient verdict used to decide whether a run shape is retried.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    /// Whether this attempt succeeded.
    pub success: bool,
    /// Attempts left for this run shape after this one.
    pub tries_remaining: u32,
}

/// What one polling session produced.
#[derive(Debug, Clone)]
pub struct CollectedMetrics {
    /// Per-component digests from the final polling attempt.
    pub records: Vec<LogRecord>,
    /// Whether the completion predicate was satisfied.
    pub success: bool,
    /// On-chain reconciliation, best effort.
    pub on_chain: OnChainMetrics,
}

/// Polls a cloud log backend until the deployment looks complete, then
/// reconciles against on-chain events.
///
/// The completion predicate requires exactly the expected number of
/// components reporting, each with a plausible duration (and memory, where
/// the backend reports it). Both under- and over-reporting count as
/// failure: a partial deployment and a doubled one are equally wrong.
#[derive(Debug)]
pub struct MetricsPoller<L> {
    source: L,
    dialect: LogDialect,
    stage_prefix: String,
    expected_components: usize,
    max_attempts: u32,
    interval: Duration,
    settle: Duration,
}

impl<L: LogSource> MetricsPoller<L> {
    /// Creates a poller with the default attempt budget and pacing.
    pub fn new(source: L, dialect: LogDialect, stage_prefix: impl Into<String>) -> Self {
        Self {
            source,
            dialect,
            stage_prefix: stage_prefix.into(),
            expected_components: 4,
            max_attempts: DEFAULT_POLL_ATTEMPTS,
            interval: DEFAULT_POLL_INTERVAL,
            settle: DEFAULT_SETTLE_DELAY,
        }
    }

    /// Overrides the expected component count.
    pub fn with_expected_components(mut self, count: usize) -> Self {
        self.expected_components = count;
        self
    }

    /// Overrides the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Overrides the inter-attempt sleep and the pre-reconciliation settle
    /// delay.
    pub fn with_pacing(mut self, interval: Duration, settle: Duration) -> Self {
        self.interval = interval;
        self.settle = settle;
        self
    }

    /// Polls until the predicate holds or attempts run out, then settles
    /// and reconciles. Exhaustion is not an error: the result carries
    /// `success: false` with whatever was observed.
    pub async fn collect<C: Chain>(
        &self,
        chain: &C,
        rrp_addresses: &[Address],
    ) -> CollectedMetrics {
        let mut last_records = Vec::new();
        for attempt in (0..self.max_attempts).rev() {
            tokio::time::sleep(self.interval).await;

            match self.fetch_records().await {
                Ok(records) => {
                    let success = self.is_complete(&records);
                    last_records = records;
                    if success || attempt == 0 {
                        info!(attempt, success, "log polling finished");
                        tokio::time::sleep(self.settle).await;
                        let on_chain = reconcile_on_chain(chain, rrp_addresses).await;
                        return CollectedMetrics { records: last_records, success, on_chain };
                    }
                }
                Err(error) => warn!(attempt, %error, "log polling attempt failed"),
            }
        }

        // Every attempt errored out; settle and reconcile what the chain
        // knows anyway.
        tokio::time::sleep(self.settle).await;
        let on_chain = reconcile_on_chain(chain, rrp_addresses).await;
        CollectedMetrics { records: last_records, success: false, on_chain }
    }

    async fn fetch_records(&self) -> Result<Vec<LogRecord>> {
        let components = self.source.list_components(&self.stage_prefix).await?;
        let mut records = Vec::with_capacity(components.len());
        for component in components {
            let events = self.source.read_logs(&component).await?;
            records.push(digest_component(self.dialect, &component, events));
        }
        Ok(records)
    }

    /// The completion predicate. Equality, not at-least: the expected
    /// component count must be hit exactly.
    fn is_complete(&self, records: &[LogRecord]) -> bool {
        let expected = self.expected_components;
        let named = records.iter().filter(|r| r.name.len() > 1).count();
        let timed = records.iter().filter(|r| r.duration_ms > 10).count();
        let memory_ok = !self.dialect.reports_memory()
            || records.iter().filter(|r| r.memory_usage > 10).count() == expected;
        named == expected && timed == expected && memory_ok
    }
}

/// Replays recent protocol-contract events into an [`OnChainMetrics`]
/// aggregate. Chains whose logs cannot be fetched are skipped with a
/// warning rather than failing the collection.
pub async fn reconcile_on_chain<C: Chain>(
    chain: &C,
    rrp_addresses: &[Address],
) -> OnChainMetrics {
    let mut total = OnChainMetrics::default();
    for &address in rrp_addresses {
        match reconcile_contract(chain, address).await {
            Some(metrics) => total.add(metrics),
            None => warn!(%address, "on-chain reconciliation unavailable"),
        }
    }
    total
}

async fn reconcile_contract<C: Chain>(chain: &C, address: Address) -> Option<OnChainMetrics> {
    let current_block = chain.block_number().await?;
    let from_block = current_block.saturating_sub(RECONCILE_BLOCK_WINDOW);
    let logs = chain.logs_in_window(address, from_block, current_block).await?;

    // (request id, blocks since it was made), newest last.
    let mut requests = Vec::new();
    let mut fulfilled = Vec::new();
    let mut failed = Vec::new();
    for log in &logs {
        let topics = log.inner.topics();
        let (Some(&signature), Some(&request_id)) = (topics.first(), topics.get(2)) else {
            continue;
        };
        if signature == Rrp::MadeTemplateRequest::SIGNATURE_HASH
            || signature == Rrp::MadeFullRequest::SIGNATURE_HASH
        {
            let delta = log.block_number.map_or(0, |n| current_block.saturating_sub(n));
            requests.push((request_id, delta));
        } else if signature == Rrp::FulfilledRequest::SIGNATURE_HASH {
            fulfilled.push(request_id);
        } else if signature == Rrp::FailedRequest::SIGNATURE_HASH {
            failed.push(request_id);
        }
    }

    let mut outstanding: Vec<&(alloy_primitives::B256, u64)> = requests
        .iter()
        .filter(|entry| !fulfilled.contains(&entry.0) && !failed.contains(&entry.0))
        .collect();
    // Most recently made first, so the stalest stragglers sort last.
    outstanding.sort_by_key(|entry| entry.1);

    Some(OnChainMetrics {
        successful_fulfillments: fulfilled.len() as u64,
        failed_fulfillments: failed.len() as u64,
        made_requests: requests.len() as u64,
        outstanding_requests: outstanding.len() as u64,
    })
}
