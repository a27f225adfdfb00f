//! Quality control of the loci.

use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::stats::ChromosomeStats;

/// The filters of the quality control. A filter that is not set keeps every locus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct QcThresholds {
    /// Minimum minor allele frequency.
    #[validate(range(min = 0.0, max = 0.5))]
    #[serde(default)]
    pub maf: Option<f64>,
    /// Minimum p-value of the Hardy-Weinberg equilibrium test.
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default)]
    pub hwe: Option<f64>,
    /// Maximum missing rate.
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default)]
    pub missing: Option<f64>,
}

impl QcThresholds {
    /// Returns the mask of the loci which pass all the filters.
    ///
    /// Loci with an undefined allele frequency fail the allele frequency filter.
    pub fn retained(&self, stats: &ChromosomeStats) -> Array1<bool> {
        let mut retained = Array1::from_elem(stats.allele_freq.len(), true);
        Zip::from(&mut retained)
            .and(&stats.allele_freq)
            .and(&stats.hwe)
            .and(&stats.missing_rates)
            .for_each(|keep, &af, &hwe, &missing| {
                if let Some(min_maf) = self.maf {
                    *keep &= af.min(1.0 - af) >= min_maf;
                }
                if let Some(min_hwe) = self.hwe {
                    *keep &= hwe >= min_hwe;
                }
                if let Some(max_missing) = self.missing {
                    *keep &= missing <= max_missing;
                }
            });
        retained
    }
}
