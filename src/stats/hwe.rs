//! Hardy-Weinberg equilibrium tests.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

/// A per-locus Hardy-Weinberg equilibrium test.
///
/// The input is a `(loci × 3)` matrix of homozygous-reference, heterozygous and
/// homozygous-alternate counts. The output holds one p-value in `[0, 1]` per locus.
pub trait HweTest {
    fn p_values(&self, counts: ArrayView2<'_, i32>) -> Array1<f64>;
}

/// The exact SNP test of Hardy-Weinberg equilibrium of Wigginton, Cutler and Abecasis (2005).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactHwe {
    /// Apply the mid-p correction: only half of the probability of the observed heterozygote
    /// count enters the p-value.
    pub midp: bool,
}

impl ExactHwe {
    pub fn new(midp: bool) -> Self {
        Self { midp }
    }

    /// The p-value of a single locus.
    pub fn p_value(&self, hom_ref: i64, het: i64, hom_alt: i64) -> f64 {
        if hom_ref < 0 || het < 0 || hom_alt < 0 {
            return f64::NAN;
        }
        let hom_rare = hom_ref.min(hom_alt);
        let hom_common = hom_ref.max(hom_alt);
        let genotypes = hom_rare + het + hom_common;
        if genotypes == 0 {
            return 1.0;
        }
        let rare_copies = 2 * hom_rare + het;

        // the heterozygote counts compatible with the allele counts have the parity of
        // `rare_copies`; start at the most likely one
        let mut mid = rare_copies * (2 * genotypes - rare_copies) / (2 * genotypes);
        if (rare_copies & 1) != (mid & 1) {
            mid += 1;
        }

        let mut probs = vec![0.0f64; rare_copies as usize + 1];
        probs[mid as usize] = 1.0;
        let mut sum = 1.0;

        let mut hets = mid;
        let mut homr = (rare_copies - mid) / 2;
        let mut homc = genotypes - hets - homr;
        while hets > 1 {
            let next = probs[hets as usize] * (hets * (hets - 1)) as f64
                / (4 * (homr + 1) * (homc + 1)) as f64;
            probs[hets as usize - 2] = next;
            sum += next;
            hets -= 2;
            homr += 1;
            homc += 1;
        }

        let mut hets = mid;
        let mut homr = (rare_copies - mid) / 2;
        let mut homc = genotypes - hets - homr;
        while hets + 2 <= rare_copies {
            let next = probs[hets as usize] * (4 * homr * homc) as f64
                / ((hets + 2) * (hets + 1)) as f64;
            probs[hets as usize + 2] = next;
            sum += next;
            hets += 2;
            homr -= 1;
            homc -= 1;
        }

        let observed = probs[het as usize] / sum;
        let mut p: f64 = probs
            .iter()
            .map(|prob| prob / sum)
            .filter(|prob| *prob <= observed)
            .sum();
        if self.midp {
            p -= observed / 2.0;
        }
        p.max(0.0).min(1.0)
    }

    fn p_value_of_row(&self, row: ArrayView1<'_, i32>) -> f64 {
        self.p_value(row[0].into(), row[1].into(), row[2].into())
    }
}

impl HweTest for ExactHwe {
    fn p_values(&self, counts: ArrayView2<'_, i32>) -> Array1<f64> {
        counts
            .axis_iter(Axis(0))
            .map(|row| self.p_value_of_row(row))
            .collect()
    }
}
