// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Delegation orchestrator.
//!
//! A complex prompt is split into *briefs* forming a DAG; each brief becomes
//! a job run by an injected executor (in production: a scoped router call).
//! The orchestrator validates the DAG up front, schedules ready jobs under a
//! concurrency cap, retries failures, cancels the transitive descendants of
//! a terminally failed job, and trips a circuit breaker after consecutive
//! failed runs.

mod brief;
mod orchestrator;

pub use brief::{validate_dag, BriefConstraints, DagError, DelegationBrief, DelegationRequest};
pub use orchestrator::{
    DelegationError, DelegationOrchestrator, DelegationOutcome, JobContext, JobExecutor,
    JobReport, JobState,
};
