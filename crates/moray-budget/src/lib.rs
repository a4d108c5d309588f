// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime budget governor.
//!
//! Aggregates the append-only usage log into a per-request *routing
//! directive*: which profile to route with, how severe the budget situation
//! is, how long to pace, and which providers/models are blocked.  The router
//! consults the governor before every provider selection; the governor never
//! calls the router.

mod governor;
mod types;

pub use governor::BudgetGovernor;
pub use types::*;
