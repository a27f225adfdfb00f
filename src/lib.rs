//! # Hydra coordinator
//!
//! The coordinator of a federated genome-wide quality control. Every client holds the genotypes
//! of its own cohort and only ever shares per-locus genotype counts. The coordinator sums up the
//! counts of all the clients, derives the summary statistics of every locus once all the clients
//! reported, and broadcasts them back.
//!
//! The crate is organized as follows:
//! - [`registry`]: the participating clients and their task states, which double as the barrier
//!   of a task.
//! - [`storage`]: the accumulation of the counts on top of a durable array store.
//! - [`stats`]: allele frequencies, missing rates, variances, Hardy-Weinberg equilibrium tests and
//!   the quality control filters.
//! - [`messages`] and [`channel`]: what the clients send and what the coordinator broadcasts.
//! - [`orchestrator`]: the lifecycle of a task.
//! - [`rest`] and [`settings`]: the HTTP surface and the configuration of the binary.

pub mod channel;
pub mod messages;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod rest;
pub mod settings;
pub mod stats;
pub mod storage;
pub(crate) mod utils;
