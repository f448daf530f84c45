//! Stress-run driver for an RRP oracle network.
//!
//! One run provisions protocol contracts and sponsor wallets on a target
//! chain, submits a controlled burst of oracle requests, deploys the oracle
//! service to a cloud environment, polls the cloud logs until a completion
//! signal is observed, and records aggregate timing/success metrics.
//!
//! # Overview
//!
//! The crate is organised around a small resilient execution pipeline:
//!
//! - **RPC**: every JSON-RPC call goes through [`rpc::RetryingRpcClient`],
//!   which retries a bounded number of times and reports "unknown outcome"
//!   instead of raising on exhaustion.
//! - **Scheduling**: [`limiter::ConcurrencyLimiter`] bounds in-flight
//!   operations; chain deployments are serialized, wallet funding fans out
//!   up to a configured width.
//! - **Chain setup**: [`chain::ChainSetupPipeline`] deploys the protocol
//!   and requester contracts once per chain and runs the per-wallet
//!   [`funding::WalletFunding`] state machine across sponsor wallets.
//! - **Metrics**: [`metrics::MetricsPoller`] polls a cloud log backend on a
//!   fixed interval, applies the completion predicate, and reconciles
//!   off-chain logs with recent on-chain request events.
//! - **Coordination**: [`run::RunCoordinator`] ties the pieces together for
//!   a full run-set with outer retry and persists the results.

#![warn(missing_docs)]

pub mod chain;
pub mod cloud;
pub mod config;
pub mod deploy;
pub mod funding;
pub mod limiter;
pub mod metrics;
pub mod persist;
pub mod protocol;
pub mod rpc;
pub mod run;
pub mod wallet;

pub use chain::{Chain, ChainDeployment, ChainSetupPipeline, EvmChain};
pub use config::{RequestSet, StressConfig};
pub use limiter::ConcurrencyLimiter;
pub use metrics::{MetricsPoller, OutputMetrics, RunOutcome};
pub use rpc::RetryingRpcClient;
pub use run::RunCoordinator;
