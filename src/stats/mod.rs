//! Summary statistics derived from the accumulated genotype counts.
//!
//! The input of a chromosome is its `(loci × 4)` counts matrix with the columns
//! homozygous-reference, heterozygous, homozygous-alternate and missing, together with the
//! number of individuals `N` of all clients. The statistics are computed once per chromosome,
//! after the barrier of the init task.

pub mod hwe;
pub mod qc;

use std::fmt;

use ndarray::{s, Array1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

pub use self::{
    hwe::{ExactHwe, HweTest},
    qc::QcThresholds,
};

/// The statistics of a chromosome. Every array holds one value per locus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChromosomeStats {
    /// The fraction of individuals whose genotype is missing.
    pub missing_rates: Array1<f64>,
    /// The frequency of the alternate allele among the called genotypes. `NaN` if no genotype
    /// was called.
    pub allele_freq: Array1<f64>,
    /// The genotype variance `2·af·(1 − af)`.
    pub var: Array1<f64>,
    /// The p-value of the Hardy-Weinberg equilibrium test.
    pub hwe: Array1<f64>,
}

/// Derives the [`ChromosomeStats`] from the accumulated counts.
pub struct StatsComputer {
    hwe: Box<dyn HweTest + Send + Sync>,
}

impl fmt::Debug for StatsComputer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsComputer").finish()
    }
}

impl Default for StatsComputer {
    fn default() -> Self {
        Self::new(ExactHwe::default())
    }
}

impl StatsComputer {
    /// Creates a stats computer with the given HWE test.
    pub fn new<H>(hwe: H) -> Self
    where
        H: HweTest + Send + Sync + 'static,
    {
        Self { hwe: Box::new(hwe) }
    }

    /// Computes the statistics of a chromosome.
    ///
    /// `n` is the number of individuals of all the clients. Divisions by zero are not guarded:
    /// a locus without called genotypes gets a `NaN` allele frequency, and `n = 0` yields `NaN`
    /// missing rates.
    pub fn compute(&self, counts: ArrayView2<'_, i64>, n: u64) -> ChromosomeStats {
        let n = n as f64;
        let missing_rates = counts.column(3).mapv(|missing| missing as f64 / n);

        let allele_freq: Array1<f64> = counts
            .axis_iter(Axis(0))
            .map(|row| {
                let alt_alleles = (2 * row[2] + row[1]) as f64;
                let called_alleles = (2 * (row[0] + row[1] + row[2])) as f64;
                alt_alleles / called_alleles
            })
            .collect();

        let var = allele_freq.mapv(|af| 2.0 * af * (1.0 - af));

        let called = counts
            .slice(s![.., ..3])
            .mapv(|count| count.clamp(0, i32::MAX as i64) as i32);
        let hwe = self.hwe.p_values(called.view());

        ChromosomeStats {
            missing_rates,
            allele_freq,
            var,
            hwe,
        }
    }
}
