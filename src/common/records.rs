//! Run records of an actor.
//!
//! A [`RunRecorder`] is created once per actor and collects performance metrics and the messages
//! sent to neighbors over the whole run. Nothing is written until [`RunRecorder::flush()`] is called
//! at shutdown.

use std::{
    collections::BTreeMap,
    fs::File,
    io::BufWriter,
    path::PathBuf,
    time::Duration,
};

use derive_more::Display;
use serde::Serialize;
use thiserror::Error;

use crate::{common::identity::ActorAddress, model::UpdateKind};

#[derive(Debug, Error)]
/// Errors while writing run records.
pub enum RecordsError {
    #[error("failed to write records: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write performance records: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to write communication records: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// The step of a round a record belongs to.
pub enum Phase {
    #[display(fmt = "fit")]
    Fit,
    #[display(fmt = "aggregate")]
    Aggregate,
    #[display(fmt = "evaluate")]
    Evaluate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// A metric observed in a round.
pub struct PerformanceRecord {
    pub round: u32,
    pub phase: Phase,
    pub metric: String,
    pub value: f64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// A message sent to a neighbor.
pub struct MessageRecord {
    pub round: u32,
    pub kind: UpdateKind,
    pub bytes: usize,
}

#[derive(Debug, Clone, Default)]
/// Where run records are written to.
pub struct RecordPaths {
    pub performance: Option<PathBuf>,
    pub communication: Option<PathBuf>,
}

#[derive(Debug)]
/// The performance and communication records of one actor.
pub struct RunRecorder {
    actor: ActorAddress,
    paths: RecordPaths,
    performance: Vec<PerformanceRecord>,
    communication: BTreeMap<ActorAddress, Vec<MessageRecord>>,
}

impl RunRecorder {
    pub fn new(actor: ActorAddress, paths: RecordPaths) -> Self {
        Self {
            actor,
            paths,
            performance: Vec::new(),
            communication: BTreeMap::new(),
        }
    }

    /// Records every metric of a phase.
    pub fn metrics<'a>(
        &mut self,
        round: u32,
        phase: Phase,
        metrics: impl IntoIterator<Item = (&'a String, &'a f64)>,
        elapsed: Duration,
    ) {
        for (metric, value) in metrics {
            self.performance.push(PerformanceRecord {
                round,
                phase,
                metric: metric.clone(),
                value: *value,
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
    }

    /// Records a message sent to a neighbor.
    pub fn message(&mut self, round: u32, to: ActorAddress, kind: UpdateKind, bytes: usize) {
        self.communication
            .entry(to)
            .or_default()
            .push(MessageRecord { round, kind, bytes });
    }

    pub fn performance(&self) -> &[PerformanceRecord] {
        &self.performance
    }

    /// Gets the messages sent to a neighbor.
    pub fn messages_to(&self, to: &ActorAddress) -> &[MessageRecord] {
        self.communication
            .get(to)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Gets the number of bytes sent to all neighbors.
    pub fn bytes_sent(&self) -> usize {
        self.communication
            .values()
            .flat_map(|messages| messages.iter().map(|message| message.bytes))
            .sum()
    }

    /// Writes the performance records as CSV and the communication records as JSON, mapping the
    /// sender to the receivers to the messages.
    ///
    /// # Errors
    /// Fails if a file can't be written.
    pub fn flush(&self) -> Result<(), RecordsError> {
        if let Some(path) = &self.paths.performance {
            let mut writer = csv::Writer::from_path(path)?;
            for record in &self.performance {
                writer.serialize(record)?;
            }
            writer.flush()?;
            debug!("wrote {} performance records to {:?}", self.performance.len(), path);
        }
        if let Some(path) = &self.paths.communication {
            let mut log = BTreeMap::new();
            log.insert(&self.actor, &self.communication);
            serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &log)?;
            debug!("wrote communication records to {:?}", path);
        }
        Ok(())
    }
}
