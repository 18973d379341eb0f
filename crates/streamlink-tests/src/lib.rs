//! streamlink end-to-end test infrastructure
//!
//! In-process deployments of complete servers joined by simulated bridges, used to check
//! observer demotion and re-election across bridge outages, merged membership
//! bookkeeping and cross-domain replication.

pub mod harness;

#[cfg(test)]
mod outage_tests;

pub use harness::{
    extended, fast_replication, fast_timing, init_tracing, wait_for, Bridge, Bridges,
    Deployment, DeploymentSpec, Extended, TestNet,
};
