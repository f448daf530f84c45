//! Run coordination: one run attempt, the retry ladder, and the full
//! run-set sweep.

use std::time::Duration;

use chrono::Utc;
use eyre::{Result, WrapErr};
use tracing::{info, warn};

use crate::chain::{Chain, ChainSetupPipeline};
use crate::cloud::LogSource;
use crate::config::{RequestSet, StressConfig};
use crate::deploy::{CommandRunner, OracleDeployer, ServiceManager};
use crate::limiter::ConcurrencyLimiter;
use crate::metrics::{MetricsPoller, OutputMetrics, RunOutcome};
use crate::persist::MetricsSinks;
use crate::protocol::ContractArtifacts;
use crate::wallet::OracleKeys;

/// How many times one run shape is attempted before it is declared failed.
pub const RUN_TRIES: u32 = 3;

/// Fixed waits between run phases.
#[derive(Debug, Clone)]
pub struct RunPacing {
    /// Wait after a service-stack restart before touching the chain.
    pub post_restart: Duration,
    /// Wait after request submission for transactions to settle.
    pub post_submit: Duration,
}

impl Default for RunPacing {
    fn default() -> Self {
        Self { post_restart: Duration::from_secs(20), post_submit: Duration::from_secs(10) }
    }
}

impl RunPacing {
    /// Near-zero pacing for tests.
    pub fn immediate() -> Self {
        Self { post_restart: Duration::from_millis(1), post_submit: Duration::from_millis(1) }
    }
}

/// Drives a full stress-run session: for each configured run shape, set up
/// chains, deploy the oracle, poll for completion, persist the verdict.
pub struct RunCoordinator<C, L, R> {
    config: StressConfig,
    chain: C,
    poller: MetricsPoller<L>,
    deployer: OracleDeployer<R>,
    services: Option<ServiceManager<R>>,
    sinks: MetricsSinks,
    oracle: OracleKeys,
    artifacts: ContractArtifacts,
    test_key: String,
    pacing: RunPacing,
}

impl<C: Chain, L: LogSource, R: CommandRunner> RunCoordinator<C, L, R> {
    /// Assembles a coordinator. The session gets a fresh test key that tags
    /// every persisted record from this invocation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StressConfig,
        chain: C,
        poller: MetricsPoller<L>,
        deployer: OracleDeployer<R>,
        services: Option<ServiceManager<R>>,
        sinks: MetricsSinks,
        oracle: OracleKeys,
        artifacts: ContractArtifacts,
    ) -> Self {
        Self {
            config,
            chain,
            poller,
            deployer,
            services,
            sinks,
            oracle,
            artifacts,
            test_key: uuid::Uuid::new_v4().to_string(),
            pacing: RunPacing::default(),
        }
    }

    /// Overrides the inter-phase waits.
    pub fn with_pacing(mut self, pacing: RunPacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// The session's test key.
    pub fn test_key(&self) -> &str {
        &self.test_key
    }

    /// Executes every configured run shape, re-attempts the ones that never
    /// succeeded once, then removes the oracle deployment.
    ///
    /// Only a doubly-failed oracle deployment escapes as an error; every
    /// other failure is absorbed into a `success: false` record.
    pub async fn execute(&self) -> Result<()> {
        let succeeded = self.run_set(&self.config.test_runs).await?;

        let missing: Vec<RequestSet> = self
            .config
            .test_runs
            .iter()
            .filter(|set| !succeeded.contains(set))
            .copied()
            .collect();
        if !missing.is_empty() {
            info!(count = missing.len(), "re-attempting run shapes that never succeeded");
            self.run_set(&missing).await?;
        }

        info!("cleaning up oracle deployment");
        if let Err(error) = self.deployer.remove().await {
            warn!(%error, "final oracle removal failed");
        }
        Ok(())
    }

    /// Runs each shape up to [`RUN_TRIES`] times per configured repeat,
    /// returning the shapes that succeeded at least once.
    async fn run_set(&self, sets: &[RequestSet]) -> Result<Vec<RequestSet>> {
        let mut succeeded = Vec::new();
        for set in sets {
            for repeat in 0..self.config.run_repeats {
                for tries in (1..=RUN_TRIES).rev() {
                    let outcome = self.run_once(*set, tries).await?;
                    if outcome.success {
                        if !succeeded.contains(set) {
                            succeeded.push(*set);
                        }
                        break;
                    }
                    warn!(
                        repeat,
                        tries_remaining = outcome.tries_remaining,
                        request_count = set.request_count,
                        "run attempt failed"
                    );
                }
            }
        }
        Ok(succeeded)
    }

    /// One run attempt: clean slate, chain setup, oracle deployment,
    /// metrics collection, persistence.
    async fn run_once(&self, set: RequestSet, tries: u32) -> Result<RunOutcome> {
        let run_start = Utc::now();
        info!(
            request_count = set.request_count,
            wallet_count = set.wallet_count,
            chain_count = set.chain_count,
            tries,
            "starting run attempt"
        );

        // Leftover deployments poison the component count, so removal is
        // attempted even when nothing should be deployed.
        if let Err(error) = self.deployer.remove().await {
            warn!(%error, "pre-run oracle removal failed");
        }

        if self.config.test_mode.restart_services() {
            if let Some(services) = &self.services {
                if let Err(error) = services.restart_services().await {
                    warn!(%error, "service restart failed, continuing anyway");
                }
                tokio::time::sleep(self.pacing.post_restart).await;
            }
        }

        // A failed send in an earlier attempt may have burned master nonces;
        // re-priming from chain state keeps this attempt off the gap.
        if let Err(error) = self.chain.sync_master_nonce().await {
            warn!(%error, "master nonce sync failed");
        }

        if let Err(error) = self.chain.prepare_mining().await {
            warn!(%error, "switching to on-demand mining failed");
        }

        let wallet_limiter = ConcurrencyLimiter::new(self.config.max_batch_size);
        let pipeline = ChainSetupPipeline::new(
            &self.chain,
            &wallet_limiter,
            &self.oracle,
            &self.artifacts,
            self.config.salt_length,
        );

        // Chains come up strictly one at a time; only the wallet work within
        // a chain fans out.
        let mut rrp_addresses = Vec::with_capacity(set.chain_count);
        for chain_index in 0..set.chain_count {
            match pipeline.run(chain_index, set.wallet_count).await {
                Ok((deployment, receipts)) => {
                    info!(
                        chain_index,
                        rrp = %deployment.rrp_address,
                        receipts = receipts.len(),
                        "chain ready"
                    );
                    rrp_addresses.push(deployment.rrp_address);
                }
                Err(error) => warn!(chain_index, %error, "chain setup failed"),
            }
        }

        if let Err(error) = self.chain.restore_mining().await {
            warn!(%error, "restoring steady mining failed");
        }
        tokio::time::sleep(self.pacing.post_submit).await;

        if rrp_addresses.is_empty() {
            warn!("no chain came up, skipping deployment and metrics");
            let outcome = RunOutcome { success: false, tries_remaining: tries - 1 };
            let metrics =
                self.output_metrics(set, run_start, Vec::new(), Default::default(), false);
            self.persist(&metrics).await;
            return Ok(outcome);
        }

        // A doubly-failed deployment is the one fatal path in a run.
        self.deployer.deploy().await.wrap_err("oracle deployment failed permanently")?;

        let collected = self.poller.collect(&self.chain, &rrp_addresses).await;
        let metrics = self.output_metrics(
            set,
            run_start,
            collected.records,
            collected.on_chain,
            collected.success,
        );
        self.persist(&metrics).await;

        info!(success = collected.success, run_delta_ms = metrics.run_delta_ms, "run finished");
        Ok(RunOutcome { success: collected.success, tries_remaining: tries - 1 })
    }

    fn output_metrics(
        &self,
        set: RequestSet,
        run_start: chrono::DateTime<Utc>,
        records: Vec<crate::cloud::LogRecord>,
        on_chain: crate::metrics::OnChainMetrics,
        success: bool,
    ) -> OutputMetrics {
        let run_end = Utc::now();
        OutputMetrics {
            test_key: self.test_key.clone(),
            success,
            request_count: set.request_count,
            wallet_count: set.wallet_count,
            chain_count: set.chain_count,
            run_start,
            run_end,
            run_delta_ms: (run_end - run_start).num_milliseconds(),
            metrics: records,
            on_chain_metrics: on_chain,
        }
    }

    async fn persist(&self, metrics: &OutputMetrics) {
        self.sinks
            .record(metrics, self.config.test_mode, self.config.comment.as_deref())
            .await;
    }
}
