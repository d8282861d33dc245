//! Pipeline orchestration: fetch → normalize → persist for one invocation.
//!
//! Stages run strictly in order:
//! `Start → Fetched → Normalized → Persisted → Done`, with `Failed` reachable
//! from the fetch step (error or no data) and the persist step (sink error).
//! There are no retries at this level; the client owns the only retry loop.

use crate::data::normalize::{normalize, AlignPolicy, DataQualityWarning, NormalizeError, Normalized};
use crate::data::provider::{FetchError, FetchRequest, MarketDataSource};
use crate::data::schema::NormalizedRecord;
use crate::sink::{PersistenceError, Sink, WriteReceipt};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Pipeline stage, used in logs and to say where a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    Fetched,
    Normalized,
    Persisted,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Start => "start",
            Stage::Fetched => "fetched",
            Stage::Normalized => "normalized",
            Stage::Persisted => "persisted",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("normalization failed: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("no data to persist: {0}")]
    NoData(DataQualityWarning),

    #[error("write to {destination} failed: {source}")]
    Persist {
        destination: String,
        #[source]
        source: PersistenceError,
    },

    #[error("no sinks configured")]
    NoSinks,
}

impl PipelineError {
    /// The last stage the run reached before failing.
    pub fn reached(&self) -> Stage {
        match self {
            PipelineError::NoSinks => Stage::Start,
            PipelineError::Fetch(_) => Stage::Start,
            PipelineError::Normalize(_) | PipelineError::NoData(_) => Stage::Fetched,
            PipelineError::Persist { .. } => Stage::Normalized,
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub request: FetchRequest,
    pub records: usize,
    pub receipts: Vec<WriteReceipt>,
    pub warnings: Vec<DataQualityWarning>,
}

/// One source, one or more sinks, one alignment policy.
pub struct Pipeline<'a> {
    source: &'a dyn MarketDataSource,
    sinks: Vec<Box<dyn Sink + 'a>>,
    align: AlignPolicy,
}

impl<'a> Pipeline<'a> {
    pub fn new(source: &'a dyn MarketDataSource) -> Self {
        Self {
            source,
            sinks: Vec::new(),
            align: AlignPolicy::default(),
        }
    }

    pub fn with_sink(mut self, sink: impl Sink + 'a) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn with_align_policy(mut self, align: AlignPolicy) -> Self {
        self.align = align;
        self
    }

    /// Run one invocation end to end.
    pub fn run(&self, request: &FetchRequest) -> Result<PipelineReport, PipelineError> {
        self.run_stages(request).inspect_err(|e| {
            debug!(stage = %Stage::Failed, reached = %e.reached(), error = %e, "pipeline stopped");
        })
    }

    fn run_stages(&self, request: &FetchRequest) -> Result<PipelineReport, PipelineError> {
        if self.sinks.is_empty() {
            return Err(PipelineError::NoSinks);
        }
        info!(stage = %Stage::Start, source = self.source.name(), %request, "pipeline starting");

        let payload = self.source.fetch(request)?;
        info!(stage = %Stage::Fetched, "API data received");

        let (records, warnings) = match normalize(&payload, request, self.align)? {
            Normalized::Populated { records, warnings } => (records, warnings),
            Normalized::Empty(warning) => return Err(PipelineError::NoData(warning)),
        };
        for warning in &warnings {
            debug!(%warning, "data quality");
        }
        info!(stage = %Stage::Normalized, records = records.len(), "data transformed");

        let receipts = self.persist_all(&records)?;
        for receipt in &receipts {
            info!(
                stage = %Stage::Persisted,
                destination = %receipt.destination,
                rows = receipt.rows_written,
                "records persisted"
            );
        }

        info!(stage = %Stage::Done, records = records.len(), "pipeline finished");
        Ok(PipelineReport {
            request: request.clone(),
            records: records.len(),
            receipts,
            warnings,
        })
    }

    /// Stage every sink, then commit them in turn. A failed commit reverts the
    /// ones already committed, so either every sink holds the batch or none
    /// does. Irreversible sinks commit last; only a failure between two of them
    /// can leave a partial result.
    fn persist_all(&self, records: &[NormalizedRecord]) -> Result<Vec<WriteReceipt>, PipelineError> {
        let mut staged = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let write = sink.stage(records).map_err(|source| PipelineError::Persist {
                destination: sink.describe(),
                source,
            })?;
            staged.push((sink, write));
        }
        staged.sort_by_key(|(_, write)| !write.reversible());

        let mut receipts = Vec::with_capacity(staged.len());
        for i in 0..staged.len() {
            let (done, rest) = staged.split_at_mut(i);
            let (sink, write) = &mut rest[0];
            match write.commit() {
                Ok(receipt) => receipts.push(receipt),
                Err(source) => {
                    for (earlier, undo) in done.iter_mut().rev() {
                        if let Err(e) = undo.revert() {
                            warn!(destination = %earlier.describe(), error = %e, "could not revert write");
                        }
                    }
                    return Err(PipelineError::Persist {
                        destination: sink.describe(),
                        source,
                    });
                }
            }
        }
        Ok(receipts)
    }
}
