// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// moray — a personal AI gateway daemon.
///
/// Routes inbound chat messages through a multi-provider model router with
/// tool use, delegation and a persistent outbound delivery queue, governed
/// by a runtime budget and watched by an incident manager.
#[derive(Parser, Debug)]
#[command(name = "moray", version, about)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG still wins when set).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway: delivery worker, incident timer and the signed
    /// HTTP control plane.  Runs until Ctrl+C.
    Serve,

    /// Process one message through the conversation gateway and print the
    /// reply.  Useful for smoke tests without a channel adapter.
    Send {
        /// Channel name used for the session key.
        #[arg(long, default_value = "cli")]
        platform: String,
        /// Sender id used for the session key.
        #[arg(long, default_value = "local")]
        sender: String,
        /// The message text.
        text: Vec<String>,
    },

    /// Run the startup checks (config, store, provider keys) and exit
    /// non-zero when any fails.
    Doctor,

    /// Print the effective configuration and exit.  The config schema holds
    /// env-var names, never secret values, so the dump is safe.
    Config,
}
