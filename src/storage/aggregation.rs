//! The accumulator of the genotype counts streamed by the clients.
//!
//! Every chromosome owns a `(loci × 4)` matrix of genotype counts with the columns
//! homozygous-reference, heterozygous, homozygous-alternate and missing. Clients only transmit the
//! last three columns: the homozygous-reference count of a chunk is derived as the number of
//! individuals in the chunk minus the transmitted counts of the locus. Chunks are folded into the
//! matrix by addition, so the final matrix does not depend on the arrival order or on how the
//! clients split their individuals into chunks.
//!
//! Each chromosome and the start/end markers of each client sit behind their own locks. Chunks
//! for the same chromosome are serialized, chunks of different clients for different chromosomes
//! never contend. Locks are taken in the order chromosome, client, global number of individuals.
//!
//! A chunk is applied in full or not at all: the new matrix and the new number of individuals are
//! persisted before they become visible, and a failed write leaves the store as it was.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    convert::TryFrom,
    sync::{Arc, Mutex, RwLock},
};

use anyhow::anyhow;
use ndarray::{s, Array1, Array2, ArrayView2};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    registry::TaskKind,
    stats::ChromosomeStats,
    storage::{ArrayStore, Dataset, DatasetExists, StorageError},
    utils::{lock, read, write},
};

/// The attribute holding the number of individuals contributed by all the clients.
pub const N_ATTR: &str = "N";

/// A chunk of counts which can not be applied. A rejected chunk leaves the store untouched.
#[derive(Debug, Error, PartialEq)]
pub enum MalformedPartial {
    #[error("the message could not be decoded: {0}")]
    Undecodable(String),
    #[error("invalid chromosome identifier {0:?}")]
    InvalidChromosome(String),
    #[error("the chunk has no loci")]
    Empty,
    #[error("expected 3 count columns (het, hom-alt, missing) but got {0}")]
    Columns(usize),
    #[error("chromosome {chrom} has {expected} loci but the chunk has {got}")]
    RowMismatch {
        chrom: String,
        expected: usize,
        got: usize,
    },
    #[error("negative count at locus {0}")]
    NegativeCount(usize),
    #[error("locus {locus} counts {count} genotypes for a chunk of {n} individuals")]
    CountsExceedChunk { locus: usize, count: i64, n: i64 },
    #[error("a chunk of {0} individuals is out of range")]
    ChunkTooLarge(u64),
    #[error(
        "a chunk of {n} individuals exceeds the declared cohort of {cohort} \
         ({received} already received for chromosome {chrom})"
    )]
    ChunkSizeConflict {
        chrom: String,
        n: u64,
        cohort: u64,
        received: u64,
    },
    #[error("a chunk of {n} individuals overflows the {total} individuals counted so far")]
    TooManyIndividuals { n: u64, total: u64 },
    #[error("the counts of chromosome {0} overflow")]
    CountOverflow(String),
}

/// Errors of the [`AggregationStore`].
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("malformed partial: {0}")]
    Malformed(#[from] MalformedPartial),
    #[error("the statistics of chromosome {0} are already finalized")]
    AlreadyFinalized(String),
    #[error("unknown chromosome {0}")]
    UnknownChromosome(String),
    #[error("storage request failed: {0}")]
    Storage(#[from] StorageError),
}

/// A chunk of counts sent by a client for one chromosome.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    /// The chromosome the counts belong to.
    pub chrom: &'a str,
    /// The number of individuals covered by the chunk.
    pub n: u64,
    /// A `(loci × 3)` matrix of heterozygous, homozygous-alternate and missing counts.
    pub counts: ArrayView2<'a, i64>,
    /// This is the client's first chunk for the task.
    pub start: bool,
    /// This is the client's last chunk for the task.
    pub end: bool,
}

/// What happened to an accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// The chunk carried a start marker which was already seen for this client and task. Its
    /// individuals were not counted again.
    pub duplicate_start: bool,
    /// The client finished sending its chunks for the task.
    pub end: bool,
}

#[derive(Debug, Default)]
struct ChromosomeAccumulator {
    positions: Option<Array1<u32>>,
    counts: Option<Array2<i64>>,
    stats: Option<ChromosomeStats>,
}

impl ChromosomeAccumulator {
    /// The number of loci of the chromosome, as far as it is known.
    fn loci(&self) -> Option<usize> {
        self.counts
            .as_ref()
            .map(Array2::nrows)
            .or_else(|| self.positions.as_ref().map(Array1::len))
    }
}

/// The start/end guards of one client for one task.
#[derive(Debug, Default)]
struct ClientProgress {
    /// The number of individuals the client declared with its start marker.
    cohort: Option<u64>,
    /// The number of individuals received so far, per chromosome.
    received: HashMap<String, u64>,
    ended: bool,
}

type Shared<T> = Arc<Mutex<T>>;

/// The accumulator of the counts of all the chromosomes.
pub struct AggregationStore<S> {
    store: S,
    chromosomes: RwLock<BTreeMap<String, Shared<ChromosomeAccumulator>>>,
    progress: RwLock<HashMap<(String, TaskKind), Shared<ClientProgress>>>,
    n: Mutex<u64>,
}

impl<S> AggregationStore<S>
where
    S: ArrayStore,
{
    /// Creates an aggregation store on top of the given array store.
    ///
    /// The accumulated counts, positions and statistics of every chromosome as well as the global
    /// number of individuals are restored from the array store.
    pub fn new(store: S) -> Result<Self, AggregationError> {
        let n = store.attr(N_ATTR)?.unwrap_or(0);
        let chromosomes = restore(&store)?;
        if !chromosomes.is_empty() {
            info!(
                "restored {} chromosomes of {} individuals",
                chromosomes.len(),
                n
            );
        }
        Ok(Self {
            store,
            chromosomes: RwLock::new(chromosomes),
            progress: RwLock::new(HashMap::new()),
            n: Mutex::new(n),
        })
    }

    /// The underlying array store.
    pub fn array_store(&self) -> &S {
        &self.store
    }

    /// Records the locus positions of a chromosome. The last writer wins.
    pub fn record_positions(
        &self,
        client: &str,
        chrom: &str,
        positions: Array1<u32>,
    ) -> Result<(), AggregationError> {
        check_chromosome(chrom)?;
        let accumulator = self.accumulator(chrom);
        let mut accumulator = lock(&accumulator);
        if let Some(loci) = accumulator.counts.as_ref().map(Array2::nrows) {
            if loci != positions.len() {
                return Err(MalformedPartial::RowMismatch {
                    chrom: chrom.to_string(),
                    expected: loci,
                    got: positions.len(),
                }
                .into());
            }
        }
        info!(
            "{} has {} loci in chromosome {}.",
            client,
            positions.len(),
            chrom
        );
        self.store
            .write_or_replace(&key(chrom, "positions"), Dataset::U32(positions.clone()))?;
        accumulator.positions = Some(positions);
        Ok(())
    }

    /// Folds a chunk of counts into the accumulated matrix of its chromosome.
    ///
    /// The first start marker of a client for a task adds the chunk's individuals to the global
    /// number of individuals. A repeated start marker is logged and does not count again.
    ///
    /// # Errors
    /// A rejected chunk, whether malformed or not persisted, leaves the store untouched and may be
    /// sent again.
    pub fn record_counts(
        &self,
        client: &str,
        task: TaskKind,
        chunk: Chunk<'_>,
    ) -> Result<ChunkOutcome, AggregationError> {
        let Chunk {
            chrom,
            n,
            counts,
            start,
            end,
        } = chunk;
        check_chromosome(chrom)?;
        let delta = with_hom_ref(n, counts)?;

        let accumulator = self.accumulator(chrom);
        let mut accumulator = lock(&accumulator);
        if accumulator.stats.is_some() {
            return Err(AggregationError::AlreadyFinalized(chrom.to_string()));
        }
        if let Some(loci) = accumulator.loci() {
            if loci != delta.nrows() {
                return Err(MalformedPartial::RowMismatch {
                    chrom: chrom.to_string(),
                    expected: loci,
                    got: delta.nrows(),
                }
                .into());
            }
        }
        let matrix = match &accumulator.counts {
            Some(total) => checked_sum(chrom, total, &delta)?,
            None => delta,
        };

        let progress = self.client_progress(client, task);
        let mut progress = lock(&progress);
        let duplicate_start = start && progress.cohort.is_some();
        let cohort = progress.cohort.or(if start { Some(n) } else { None });
        let received = progress.received.get(chrom).copied().unwrap_or(0);
        let received_after = received
            .checked_add(n)
            .ok_or(MalformedPartial::TooManyIndividuals { n, total: received })?;
        if let Some(cohort) = cohort {
            if received_after > cohort {
                return Err(MalformedPartial::ChunkSizeConflict {
                    chrom: chrom.to_string(),
                    n,
                    cohort,
                    received,
                }
                .into());
            }
        }

        let declares = start && !duplicate_start;
        if declares {
            self.add_individuals(client, n)?;
        }
        if let Err(err) = self
            .store
            .write_or_replace(&key(chrom, "counts"), Dataset::I64(matrix.clone()))
        {
            if declares {
                self.remove_individuals(n);
            }
            return Err(err.into());
        }

        if duplicate_start {
            warn!(
                "duplicate start from {} for task {}: ignoring its {} individuals",
                client, task, n
            );
        } else if start {
            progress.cohort = Some(n);
        }
        progress.received.insert(chrom.to_string(), received_after);
        if end {
            if progress.ended {
                debug!("{} sent a repeated end marker for task {}", client, task);
            }
            progress.ended = true;
        }
        debug!(
            "added {} loci of {} individuals from {} to chromosome {}",
            matrix.nrows(),
            n,
            client,
            chrom
        );
        accumulator.counts = Some(matrix);

        Ok(ChunkOutcome {
            duplicate_start,
            end,
        })
    }

    /// Stores the derived statistics of a chromosome.
    ///
    /// Datasets left behind by an earlier attempt that failed halfway are replaced.
    ///
    /// # Errors
    /// Fails if the statistics of the chromosome were finalized before: a second finalization
    /// means the phase completion ran twice.
    pub fn finalize_chromosome(
        &self,
        chrom: &str,
        stats: ChromosomeStats,
    ) -> Result<(), AggregationError> {
        let accumulator = read(&self.chromosomes)
            .get(chrom)
            .cloned()
            .ok_or_else(|| AggregationError::UnknownChromosome(chrom.to_string()))?;
        let mut accumulator = lock(&accumulator);
        if accumulator.stats.is_some() {
            return Err(AggregationError::AlreadyFinalized(chrom.to_string()));
        }

        let datasets = [
            ("missing_rates", &stats.missing_rates),
            ("allele_freq", &stats.allele_freq),
            ("var", &stats.var),
            ("hwe", &stats.hwe),
        ];
        for (name, data) in datasets.iter() {
            let key = key(chrom, name);
            let data = Dataset::F64((*data).clone());
            match self.store.create_once(&key, data.clone()) {
                Ok(()) => {}
                Err(err) if err.is::<DatasetExists>() => {
                    debug!("replacing {} left by an earlier attempt", key);
                    self.store.write_or_replace(&key, data)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        accumulator.stats = Some(stats);
        Ok(())
    }

    /// Stores the mask of the loci of a chromosome retained by the quality control.
    pub fn record_retained(
        &self,
        chrom: &str,
        retained: Array1<bool>,
    ) -> Result<(), AggregationError> {
        if !read(&self.chromosomes).contains_key(chrom) {
            return Err(AggregationError::UnknownChromosome(chrom.to_string()));
        }
        self.store
            .write_or_replace(&key(chrom, "retained"), Dataset::Bool(retained))?;
        Ok(())
    }

    /// The chromosomes known to the store, in lexicographic order.
    pub fn chromosomes(&self) -> Vec<String> {
        read(&self.chromosomes).keys().cloned().collect()
    }

    /// A copy of the accumulated counts matrix of a chromosome.
    pub fn counts(&self, chrom: &str) -> Option<Array2<i64>> {
        let accumulator = read(&self.chromosomes).get(chrom).cloned()?;
        let accumulator = lock(&accumulator);
        accumulator.counts.clone()
    }

    /// The positions of the loci of a chromosome.
    pub fn positions(&self, chrom: &str) -> Option<Array1<u32>> {
        let accumulator = read(&self.chromosomes).get(chrom).cloned()?;
        let accumulator = lock(&accumulator);
        accumulator.positions.clone()
    }

    /// The finalized statistics of a chromosome.
    pub fn stats(&self, chrom: &str) -> Option<ChromosomeStats> {
        let accumulator = read(&self.chromosomes).get(chrom).cloned()?;
        let accumulator = lock(&accumulator);
        accumulator.stats.clone()
    }

    /// The number of individuals contributed by all the clients.
    pub fn total_individuals(&self) -> u64 {
        *lock(&self.n)
    }

    /// Forgets the start and end markers seen for a task, so that the task can run again.
    pub fn begin_task(&self, task: TaskKind) {
        write(&self.progress).retain(|(_, kind), _| *kind != task);
    }

    /// Deletes everything, including the persisted datasets. Used between independent studies.
    pub fn reset(&self) -> Result<(), AggregationError> {
        let mut chromosomes = write(&self.chromosomes);
        let mut progress = write(&self.progress);
        let mut n = lock(&self.n);
        self.store.clear()?;
        chromosomes.clear();
        progress.clear();
        *n = 0;
        info!("aggregation store reset");
        Ok(())
    }

    fn accumulator(&self, chrom: &str) -> Shared<ChromosomeAccumulator> {
        if let Some(accumulator) = read(&self.chromosomes).get(chrom) {
            return accumulator.clone();
        }
        write(&self.chromosomes)
            .entry(chrom.to_string())
            .or_default()
            .clone()
    }

    fn client_progress(&self, client: &str, task: TaskKind) -> Shared<ClientProgress> {
        let id = (client.to_string(), task);
        if let Some(progress) = read(&self.progress).get(&id) {
            return progress.clone();
        }
        write(&self.progress).entry(id).or_default().clone()
    }

    /// Adds the cohort of a client to the global number of individuals and persists it.
    fn add_individuals(&self, client: &str, n: u64) -> Result<(), AggregationError> {
        let mut total = lock(&self.n);
        let updated = total
            .checked_add(n)
            .ok_or(MalformedPartial::TooManyIndividuals { n, total: *total })?;
        self.store.set_attr(N_ATTR, updated)?;
        *total = updated;
        debug!("{} declared {} individuals, N = {}", client, n, updated);
        Ok(())
    }

    /// Takes back individuals added by a chunk whose counts could not be persisted.
    fn remove_individuals(&self, n: u64) {
        let mut total = lock(&self.n);
        *total = total.saturating_sub(n);
        if let Err(err) = self.store.set_attr(N_ATTR, *total) {
            error!("failed to restore N = {}: {}", *total, err);
        }
    }
}

/// Loads the accumulators of all the chromosomes found in the store.
fn restore<S: ArrayStore>(
    store: &S,
) -> Result<BTreeMap<String, Shared<ChromosomeAccumulator>>, AggregationError> {
    let chromosomes: BTreeSet<String> = store
        .keys()?
        .iter()
        .filter_map(|key| key.find('/').map(|slash| key[..slash].to_string()))
        .collect();

    let mut restored = BTreeMap::new();
    for chrom in chromosomes {
        let positions = restore_dataset(store, &key(&chrom, "positions"), |data| match data {
            Dataset::U32(positions) => Some(positions),
            _ => None,
        })?;
        let counts = restore_dataset(store, &key(&chrom, "counts"), |data| match data {
            Dataset::I64(counts) => Some(counts),
            _ => None,
        })?;
        let derived = |name| restore_dataset(store, &key(&chrom, name), as_f64);
        let stats = match (
            derived("missing_rates")?,
            derived("allele_freq")?,
            derived("var")?,
            derived("hwe")?,
        ) {
            (Some(missing_rates), Some(allele_freq), Some(var), Some(hwe)) => {
                Some(ChromosomeStats {
                    missing_rates,
                    allele_freq,
                    var,
                    hwe,
                })
            }
            _ => None,
        };
        debug!("restored chromosome {}", chrom);
        let accumulator = ChromosomeAccumulator {
            positions,
            counts,
            stats,
        };
        restored.insert(chrom, Arc::new(Mutex::new(accumulator)));
    }
    Ok(restored)
}

fn as_f64(data: Dataset) -> Option<Array1<f64>> {
    match data {
        Dataset::F64(values) => Some(values),
        _ => None,
    }
}

fn restore_dataset<S, T, F>(
    store: &S,
    key: &str,
    extract: F,
) -> Result<Option<T>, AggregationError>
where
    S: ArrayStore,
    F: FnOnce(Dataset) -> Option<T>,
{
    match store.read(key)? {
        None => Ok(None),
        Some(data) => extract(data)
            .map(Some)
            .ok_or_else(|| anyhow!("dataset {} has an unexpected type", key).into()),
    }
}

fn key(chrom: &str, name: &str) -> String {
    format!("{}/{}", chrom, name)
}

fn check_chromosome(chrom: &str) -> Result<(), MalformedPartial> {
    if chrom.is_empty() || chrom.contains('/') || chrom == "." || chrom == ".." {
        return Err(MalformedPartial::InvalidChromosome(chrom.to_string()));
    }
    Ok(())
}

/// Builds the full `(loci × 4)` counts of a chunk, deriving the homozygous-reference column.
fn with_hom_ref(n: u64, counts: ArrayView2<'_, i64>) -> Result<Array2<i64>, MalformedPartial> {
    if counts.ncols() != 3 {
        return Err(MalformedPartial::Columns(counts.ncols()));
    }
    if counts.nrows() == 0 {
        return Err(MalformedPartial::Empty);
    }
    let n = i64::try_from(n).map_err(|_| MalformedPartial::ChunkTooLarge(n))?;

    let mut full = Array2::zeros((counts.nrows(), 4));
    for (locus, (mut row, called)) in full
        .outer_iter_mut()
        .zip(counts.outer_iter())
        .enumerate()
    {
        if called.iter().any(|&count| count < 0) {
            return Err(MalformedPartial::NegativeCount(locus));
        }
        let count = called
            .iter()
            .try_fold(0i64, |sum, &count| sum.checked_add(count))
            .filter(|&count| count <= n)
            .ok_or_else(|| MalformedPartial::CountsExceedChunk {
                locus,
                count: called
                    .iter()
                    .fold(0i64, |sum, &count| sum.saturating_add(count)),
                n,
            })?;
        row[0] = n - count;
        row.slice_mut(s![1..]).assign(&called);
    }
    Ok(full)
}

/// Adds two counts matrices of the same shape, failing instead of overflowing.
fn checked_sum(
    chrom: &str,
    total: &Array2<i64>,
    delta: &Array2<i64>,
) -> Result<Array2<i64>, MalformedPartial> {
    let mut sum = total.clone();
    for (cell, &add) in sum.iter_mut().zip(delta.iter()) {
        *cell = cell
            .checked_add(add)
            .ok_or_else(|| MalformedPartial::CountOverflow(chrom.to_string()))?;
    }
    Ok(sum)
}
