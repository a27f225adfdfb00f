//! Messages exchanged between the coordinator and the clients.
//!
//! Inbound messages are bincode encoded [`ClientMessage`]s. They are decoded and checked once at
//! the boundary, so that the orchestrator only ever sees well-typed messages.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::{
    registry::TaskKind,
    stats::{ChromosomeStats, QcThresholds},
    storage::MalformedPartial,
};

/// A message sent by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// The positions of the loci of a chromosome.
    Positions {
        task: TaskKind,
        chrom: String,
        positions: Vec<u32>,
    },
    /// A chunk of genotype counts of a chromosome.
    Counts {
        task: TaskKind,
        /// The step of the task the counts belong to, if the task has several.
        subtask: Option<String>,
        chrom: String,
        /// The number of individuals covered by the chunk.
        n: u64,
        /// A `(loci × 3)` matrix of heterozygous, homozygous-alternate and missing counts.
        counts: Array2<i64>,
        /// The first chunk of the client for the task.
        start: bool,
        /// The last chunk of the client for the task.
        end: bool,
    },
    /// The client completed its part of a task without sending counts.
    Finished { task: TaskKind },
}

impl ClientMessage {
    /// Decodes a message.
    ///
    /// # Errors
    /// Fails with [`MalformedPartial::Undecodable`] if the bytes are not a valid message.
    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedPartial> {
        bincode::deserialize(bytes).map_err(|err| MalformedPartial::Undecodable(err.to_string()))
    }

    /// Encodes the message.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// The task the message belongs to.
    pub fn task(&self) -> TaskKind {
        match self {
            Self::Positions { task, .. } | Self::Counts { task, .. } | Self::Finished { task } => {
                *task
            }
        }
    }
}

/// The statistics of a chromosome, broadcast on the `init/stats` topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatsBroadcast {
    pub task: TaskKind,
    pub subtask: String,
    pub chrom: String,
    pub stats: ChromosomeStats,
}

/// The loci of a chromosome retained by the quality control, broadcast on the `qc` topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QcBroadcast {
    pub chrom: String,
    pub thresholds: QcThresholds,
    pub retained: Array1<bool>,
}

/// A request to start a task, as sent by the operator.
///
/// ```json
/// {"task": "qc", "maf": 0.05, "hwe": 1e-6}
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "lowercase")]
pub enum TaskRequest {
    Init,
    Qc(QcThresholds),
}

impl TaskRequest {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Init => TaskKind::Init,
            Self::Qc(_) => TaskKind::Qc,
        }
    }
}
