//! End-to-end run-flow scenarios against in-memory chain, log, and
//! subprocess fakes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_signer_local::PrivateKeySigner;
use eyre::Result;

use rrp_stress::chain::Chain;
use rrp_stress::cloud::{LogDialect, LogEvent, LogSource};
use rrp_stress::config::{
    CloudConfig, JsonOutputConfig, RequestSet, SshConfig, StressConfig, TestMode,
};
use rrp_stress::deploy::{CommandOutput, CommandRunner, OracleDeployer};
use rrp_stress::metrics::MetricsPoller;
use rrp_stress::persist::MetricsSinks;
use rrp_stress::protocol::ContractArtifacts;
use rrp_stress::run::{RunCoordinator, RunPacing};
use rrp_stress::wallet::OracleKeys;

const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";
const REPORT: &str = "REPORT Billed Duration: 150 ms Max Memory Used: 80 MB";

/// In-memory chain that records every mutation it is asked to perform.
#[derive(Default)]
struct FakeChain {
    deploys: AtomicU32,
    transfers: AtomicU32,
    /// (signer, nonce, target) per contract call, in submission order.
    calls: Mutex<Vec<(Address, u64, Address)>>,
    next_address: AtomicU64,
}

impl FakeChain {
    fn deployed_contracts(&self) -> u32 {
        self.deploys.load(Ordering::SeqCst)
    }
}

impl Chain for &FakeChain {
    async fn balance(&self, _address: Address) -> Option<U256> {
        Some(U256::ZERO)
    }

    async fn deploy_contract(&self, _code: Bytes) -> Result<Address> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        let id = self.next_address.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Address::from_word(B256::with_last_byte(id as u8)))
    }

    async fn transfer_from_master(&self, _to: Address, _value: U256) -> Result<B256> {
        let id = self.transfers.fetch_add(1, Ordering::SeqCst);
        Ok(B256::with_last_byte(id as u8))
    }

    async fn send_call(
        &self,
        signer: &PrivateKeySigner,
        nonce: u64,
        to: Address,
        _data: Bytes,
    ) -> Result<B256> {
        self.calls.lock().unwrap().push((signer.address(), nonce, to));
        Ok(B256::with_last_byte(nonce as u8))
    }

    async fn read_contract(&self, _to: Address, _data: Bytes) -> Result<Bytes> {
        // A single zeroed word decodes as `false` for the health check.
        Ok(Bytes::from(vec![0u8; 32]))
    }

    async fn wait_mined(&self, _tx_hash: B256) -> Result<()> {
        Ok(())
    }

    async fn block_number(&self) -> Option<u64> {
        Some(1500)
    }

    async fn logs_in_window(
        &self,
        _address: Address,
        _from: u64,
        _to: u64,
    ) -> Option<Vec<alloy_rpc_types::Log>> {
        Some(Vec::new())
    }
}

/// Log backend whose component set can change between fetches.
struct FakeLogs {
    /// Component counts served per fetch; the last entry repeats.
    component_counts: Vec<usize>,
    fetches: AtomicU32,
}

impl FakeLogs {
    fn new(component_counts: Vec<usize>) -> Self {
        Self { component_counts, fetches: AtomicU32::new(0) }
    }

    fn healthy() -> Self {
        Self::new(vec![4])
    }

    fn components(count: usize) -> BTreeMap<String, Vec<String>> {
        let names =
            ["startCoordinator", "initializeProvider", "callApi", "processProviderRequests", "extra"];
        names
            .iter()
            .take(count)
            .map(|name| (format!("airnode-x-dev-{name}"), vec![REPORT.to_string()]))
            .collect()
    }
}

impl LogSource for &FakeLogs {
    async fn list_components(&self, _stage_prefix: &str) -> Result<Vec<String>> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) as usize;
        let index = fetch.min(self.component_counts.len() - 1);
        Ok(FakeLogs::components(self.component_counts[index]).into_keys().collect())
    }

    async fn read_logs(&self, _component: &str) -> Result<Vec<LogEvent>> {
        Ok(vec![LogEvent { timestamp: 1, message: REPORT.to_string() }])
    }
}

/// Records every command; pops scripted outputs, or reports success once
/// the script is exhausted.
struct RecordingRunner {
    commands: Mutex<Vec<String>>,
    scripted: Mutex<Vec<CommandOutput>>,
}

impl RecordingRunner {
    fn always_ok() -> Self {
        Self { commands: Mutex::new(Vec::new()), scripted: Mutex::new(Vec::new()) }
    }

    fn scripted(mut outputs: Vec<CommandOutput>) -> Self {
        outputs.reverse();
        Self { commands: Mutex::new(Vec::new()), scripted: Mutex::new(outputs) }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl CommandRunner for &RecordingRunner {
    async fn run(&self, _label: &str, command: &str) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(self.scripted.lock().unwrap().pop().unwrap_or(CommandOutput {
            status_ok: true,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }
}

fn ok_output() -> CommandOutput {
    CommandOutput { status_ok: true, stdout: String::new(), stderr: String::new() }
}

fn failed_output() -> CommandOutput {
    CommandOutput { status_ok: false, stdout: String::new(), stderr: "provisioning".to_string() }
}

fn test_config(set: RequestSet, metrics_file: Option<PathBuf>) -> StressConfig {
    StressConfig {
        test_runs: vec![set],
        run_repeats: 1,
        max_batch_size: 5,
        test_mode: TestMode::Mocked,
        rpc_url: "http://127.0.0.1:8545".parse().unwrap(),
        master_mnemonic: TEST_MNEMONIC.to_string(),
        oracle_mnemonic: TEST_MNEMONIC.to_string(),
        artifacts_dir: PathBuf::from("artifacts"),
        salt_length: 5,
        deployer_image: "example/deployer:latest".to_string(),
        config_dir: PathBuf::from("/tmp/config"),
        env_file: PathBuf::from("/tmp/aws.env"),
        skip_version_check: false,
        cloud: CloudConfig {
            provider: LogDialect::Aws,
            region: "us-east-1".to_string(),
            stage_prefix: "airnode-".to_string(),
            expected_components: 4,
        },
        postgres: None,
        json_output: JsonOutputConfig { enabled: metrics_file.is_some(), file_path: metrics_file },
        ssh: SshConfig {
            remote_host: "local".to_string(),
            user: String::new(),
            port: 22,
            key_path: PathBuf::new(),
            yaml_path: PathBuf::from("docker-compose.yml"),
        },
        comment: None,
    }
}

fn artifacts() -> ContractArtifacts {
    ContractArtifacts { rrp: Bytes::from(vec![0x60, 0x80]), requester: Bytes::from(vec![0x60, 0x40]) }
}

fn coordinator<'a>(
    config: StressConfig,
    chain: &'a FakeChain,
    logs: &'a FakeLogs,
    runner: &'a RecordingRunner,
    poll_attempts: u32,
) -> RunCoordinator<&'a FakeChain, &'a FakeLogs, &'a RecordingRunner> {
    let poller = MetricsPoller::new(logs, LogDialect::Aws, "airnode-")
        .with_max_attempts(poll_attempts)
        .with_pacing(Duration::from_millis(1), Duration::from_millis(1));
    let deployer = OracleDeployer::new(
        runner,
        config.deployer_image.clone(),
        config.config_dir.clone(),
        config.env_file.clone(),
        false,
    );
    let oracle = OracleKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
    RunCoordinator::new(
        config,
        chain,
        poller,
        deployer,
        None,
        MetricsSinks::default(),
        oracle,
        artifacts(),
    )
    .with_pacing(RunPacing::immediate())
}

fn metrics_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("rrp-stress-run-flow");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}-{}.json", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

fn read_records(path: &PathBuf) -> Vec<serde_json::Value> {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn single_run_provisions_one_chain_and_two_wallets() {
    let set = RequestSet { request_count: 10, wallet_count: 2, chain_count: 1 };
    let path = metrics_path("single-run");
    let config = test_config(set, Some(path.clone()));

    let chain = FakeChain::default();
    let logs = FakeLogs::healthy();
    let runner = RecordingRunner::always_ok();

    let poller = MetricsPoller::new(&logs, LogDialect::Aws, "airnode-")
        .with_max_attempts(4)
        .with_pacing(Duration::from_millis(1), Duration::from_millis(1));
    let deployer = OracleDeployer::new(
        &runner,
        config.deployer_image.clone(),
        config.config_dir.clone(),
        config.env_file.clone(),
        false,
    );
    let sinks =
        MetricsSinks::from_config(None, &config.json_output).await.unwrap();
    let oracle = OracleKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
    let coordinator = RunCoordinator::new(
        config,
        &chain,
        poller,
        deployer,
        None,
        sinks,
        oracle,
        artifacts(),
    )
    .with_pacing(RunPacing::immediate());

    coordinator.execute().await.unwrap();

    // One deployment cycle: protocol contract plus requester, nothing more.
    assert_eq!(chain.deployed_contracts(), 2);
    // Each wallet funds its sponsor wallet and itself.
    assert_eq!(chain.transfers.load(Ordering::SeqCst), 4);

    // Each wallet authorizes with nonce 0 and requests with nonce 1,
    // strictly in that order per signer.
    let calls = chain.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 4);
    let mut per_signer: BTreeMap<Address, Vec<u64>> = BTreeMap::new();
    for (signer, nonce, _target) in calls {
        per_signer.entry(signer).or_default().push(nonce);
    }
    assert_eq!(per_signer.len(), 2);
    for nonces in per_signer.values() {
        assert_eq!(nonces, &vec![0, 1]);
    }

    // The healthy log set completed polling on the first attempt.
    assert_eq!(logs.fetches.load(Ordering::SeqCst), 1);

    let records = read_records(&path);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["success"], true);
    assert_eq!(records[0]["wallet_count"], 2);
    assert_eq!(records[0]["chain_count"], 1);
    assert_eq!(records[0]["request_count"], 10);

    // Clean slate before the run, cleanup after it.
    let commands = runner.commands();
    assert!(commands.first().unwrap().contains(" remove"));
    assert!(commands.last().unwrap().contains(" remove"));
    assert!(commands.iter().any(|c| c.contains(" deploy")));

    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn run_succeeding_on_third_try_is_not_rerun() {
    let set = RequestSet { request_count: 5, wallet_count: 1, chain_count: 1 };
    let path = metrics_path("third-try");
    let config = test_config(set, Some(path.clone()));

    let chain = FakeChain::default();
    // One poll per run attempt: incomplete, incomplete, complete.
    let logs = FakeLogs::new(vec![3, 3, 4]);
    let runner = RecordingRunner::always_ok();

    let sinks = MetricsSinks::from_config(None, &config.json_output).await.unwrap();
    let poller = MetricsPoller::new(&logs, LogDialect::Aws, "airnode-")
        .with_max_attempts(1)
        .with_pacing(Duration::from_millis(1), Duration::from_millis(1));
    let deployer = OracleDeployer::new(
        &runner,
        config.deployer_image.clone(),
        config.config_dir.clone(),
        config.env_file.clone(),
        false,
    );
    let oracle = OracleKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
    let coordinator = RunCoordinator::new(
        config,
        &chain,
        poller,
        deployer,
        None,
        sinks,
        oracle,
        artifacts(),
    )
    .with_pacing(RunPacing::immediate());

    coordinator.execute().await.unwrap();

    // Three run attempts, no missing-results re-run afterwards.
    assert_eq!(logs.fetches.load(Ordering::SeqCst), 3);
    let records = read_records(&path);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["success"], false);
    assert_eq!(records[1]["success"], false);
    assert_eq!(records[2]["success"], true);

    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn doubly_failed_deployment_aborts_the_session() {
    let set = RequestSet { request_count: 5, wallet_count: 1, chain_count: 1 };
    let config = test_config(set, None);

    let chain = FakeChain::default();
    let logs = FakeLogs::healthy();
    // Pre-run remove succeeds, then deploy / remove / deploy all resolve,
    // with both deploys failing.
    let runner = RecordingRunner::scripted(vec![
        ok_output(),
        failed_output(),
        ok_output(),
        failed_output(),
    ]);

    let coordinator = coordinator(config, &chain, &logs, &runner, 2);
    let result = coordinator.execute().await;
    assert!(result.is_err());

    let commands = runner.commands();
    assert_eq!(commands.len(), 4);
    assert!(commands[0].contains(" remove"));
    assert!(commands[1].contains(" deploy"));
    assert!(commands[2].contains(" remove"));
    assert!(commands[3].contains(" deploy"));
    // Polling never starts when deployment is dead.
    assert_eq!(logs.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn manual_mining_wraps_setup_and_precedes_deployment() {
    use std::sync::Arc;

    /// Chain that journals its mining-control and deployment calls into a
    /// log shared with the command runner.
    struct JournalingChain {
        inner: FakeChain,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl JournalingChain {
        fn log(&self, event: &str) {
            self.events.lock().unwrap().push(event.to_string());
        }
    }

    impl Chain for &JournalingChain {
        async fn balance(&self, address: Address) -> Option<U256> {
            (&self.inner).balance(address).await
        }
        async fn deploy_contract(&self, code: Bytes) -> Result<Address> {
            self.log("deploy-contract");
            (&self.inner).deploy_contract(code).await
        }
        async fn transfer_from_master(&self, to: Address, value: U256) -> Result<B256> {
            (&self.inner).transfer_from_master(to, value).await
        }
        async fn send_call(
            &self,
            signer: &PrivateKeySigner,
            nonce: u64,
            to: Address,
            data: Bytes,
        ) -> Result<B256> {
            (&self.inner).send_call(signer, nonce, to, data).await
        }
        async fn read_contract(&self, to: Address, data: Bytes) -> Result<Bytes> {
            (&self.inner).read_contract(to, data).await
        }
        async fn wait_mined(&self, tx_hash: B256) -> Result<()> {
            (&self.inner).wait_mined(tx_hash).await
        }
        async fn block_number(&self) -> Option<u64> {
            (&self.inner).block_number().await
        }
        async fn logs_in_window(
            &self,
            address: Address,
            from: u64,
            to: u64,
        ) -> Option<Vec<alloy_rpc_types::Log>> {
            (&self.inner).logs_in_window(address, from, to).await
        }
        async fn sync_master_nonce(&self) -> Result<()> {
            self.log("sync-nonce");
            Ok(())
        }
        async fn mine_block(&self) {
            self.log("mine");
        }
        async fn prepare_mining(&self) -> Result<()> {
            self.log("prepare-mining");
            Ok(())
        }
        async fn restore_mining(&self) -> Result<()> {
            self.log("restore-mining");
            Ok(())
        }
    }

    struct JournalingRunner {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl CommandRunner for &JournalingRunner {
        async fn run(&self, _label: &str, command: &str) -> Result<CommandOutput> {
            let action = if command.contains(" remove") { "remove" } else { "deploy" };
            self.events.lock().unwrap().push(format!("cmd:{action}"));
            Ok(ok_output())
        }
    }

    let set = RequestSet { request_count: 5, wallet_count: 1, chain_count: 1 };
    let mut config = test_config(set, None);
    config.test_mode = TestMode::Hardhat;

    let events = Arc::new(Mutex::new(Vec::new()));
    let chain = JournalingChain { inner: FakeChain::default(), events: Arc::clone(&events) };
    let runner = JournalingRunner { events: Arc::clone(&events) };
    let logs = FakeLogs::healthy();

    let poller = MetricsPoller::new(&logs, LogDialect::Aws, "airnode-")
        .with_max_attempts(1)
        .with_pacing(Duration::from_millis(1), Duration::from_millis(1));
    let deployer = OracleDeployer::new(
        &runner,
        config.deployer_image.clone(),
        config.config_dir.clone(),
        config.env_file.clone(),
        false,
    );
    let oracle = OracleKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
    let coordinator = RunCoordinator::new(
        config,
        &chain,
        poller,
        deployer,
        None,
        MetricsSinks::default(),
        oracle,
        artifacts(),
    )
    .with_pacing(RunPacing::immediate());

    coordinator.execute().await.unwrap();

    // The nonce is re-primed and on-demand mining switched on before any
    // contract lands; the steady interval comes back before the oracle
    // deploys.
    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "cmd:remove",
            "sync-nonce",
            "prepare-mining",
            "mine",
            "deploy-contract",
            "deploy-contract",
            "mine",
            "restore-mining",
            "cmd:deploy",
            "cmd:remove",
        ]
    );
}

#[tokio::test]
async fn wallet_failure_does_not_abort_siblings() {
    // Chain that drops the very first top-up transfer it sees, killing
    // exactly one wallet branch.
    struct FlakyChain {
        inner: FakeChain,
        attempts: AtomicU32,
    }

    impl Chain for &FlakyChain {
        async fn balance(&self, address: Address) -> Option<U256> {
            (&self.inner).balance(address).await
        }
        async fn deploy_contract(&self, code: Bytes) -> Result<Address> {
            (&self.inner).deploy_contract(code).await
        }
        async fn transfer_from_master(&self, to: Address, value: U256) -> Result<B256> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                eyre::bail!("node dropped the transfer");
            }
            (&self.inner).transfer_from_master(to, value).await
        }
        async fn send_call(
            &self,
            signer: &PrivateKeySigner,
            nonce: u64,
            to: Address,
            data: Bytes,
        ) -> Result<B256> {
            (&self.inner).send_call(signer, nonce, to, data).await
        }
        async fn read_contract(&self, to: Address, data: Bytes) -> Result<Bytes> {
            (&self.inner).read_contract(to, data).await
        }
        async fn wait_mined(&self, tx_hash: B256) -> Result<()> {
            (&self.inner).wait_mined(tx_hash).await
        }
        async fn block_number(&self) -> Option<u64> {
            (&self.inner).block_number().await
        }
        async fn logs_in_window(
            &self,
            address: Address,
            from: u64,
            to: u64,
        ) -> Option<Vec<alloy_rpc_types::Log>> {
            (&self.inner).logs_in_window(address, from, to).await
        }
    }

    let set = RequestSet { request_count: 4, wallet_count: 4, chain_count: 1 };
    let config = test_config(set, None);
    let chain = FlakyChain { inner: FakeChain::default(), attempts: AtomicU32::new(0) };
    let logs = FakeLogs::healthy();
    let runner = RecordingRunner::always_ok();

    let poller = MetricsPoller::new(&logs, LogDialect::Aws, "airnode-")
        .with_max_attempts(1)
        .with_pacing(Duration::from_millis(1), Duration::from_millis(1));
    let deployer = OracleDeployer::new(
        &runner,
        config.deployer_image.clone(),
        config.config_dir.clone(),
        config.env_file.clone(),
        false,
    );
    let oracle = OracleKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
    let coordinator = RunCoordinator::new(
        config,
        &chain,
        poller,
        deployer,
        None,
        MetricsSinks::default(),
        oracle,
        artifacts(),
    )
    .with_pacing(RunPacing::immediate());

    coordinator.execute().await.unwrap();

    // Every wallet whose first transfer survived still completed both of
    // its contract calls; the failed branch submitted none.
    let calls = chain.inner.calls.lock().unwrap().clone();
    let mut per_signer: BTreeMap<Address, Vec<u64>> = BTreeMap::new();
    for (signer, nonce, _target) in calls {
        per_signer.entry(signer).or_default().push(nonce);
    }
    assert_eq!(per_signer.len(), 3);
    for nonces in per_signer.values() {
        assert_eq!(nonces, &vec![0, 1]);
    }
}
