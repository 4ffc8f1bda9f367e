//! Binned axis with under/overflow cells and an optional user range.
//!
//! Bin numbering: `0` is the underflow, `1..=n` the regular bins and
//! `n + 1` the overflow.

use ms_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// One binned dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AxisRepr", into = "AxisRepr")]
pub struct Axis {
    edges: Vec<f64>,
    range: Option<(usize, usize)>,
}

/// On-disk form: explicit edges or a uniform shorthand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum AxisRepr {
    Edges {
        edges: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<[usize; 2]>,
    },
    Uniform {
        bins: usize,
        min: f64,
        max: f64,
    },
}

impl TryFrom<AxisRepr> for Axis {
    type Error = Error;

    fn try_from(repr: AxisRepr) -> Result<Self> {
        match repr {
            AxisRepr::Edges { edges, range } => {
                let mut axis = Axis::variable(edges)?;
                if let Some([first, last]) = range {
                    axis.set_range(first, last);
                }
                Ok(axis)
            }
            AxisRepr::Uniform { bins, min, max } => Axis::uniform(bins, min, max),
        }
    }
}

impl From<Axis> for AxisRepr {
    fn from(axis: Axis) -> Self {
        AxisRepr::Edges { edges: axis.edges, range: axis.range.map(|(a, b)| [a, b]) }
    }
}

impl Axis {
    /// `n` equal-width bins over `[min, max)`.
    pub fn uniform(n: usize, min: f64, max: f64) -> Result<Self> {
        if n == 0 {
            return Err(Error::Validation("axis needs at least one bin".to_string()));
        }
        if !(min.is_finite() && max.is_finite()) || min >= max {
            return Err(Error::Validation(format!("invalid axis limits [{min}, {max}]")));
        }
        let width = (max - min) / n as f64;
        let mut edges: Vec<f64> = (0..n).map(|i| min + width * i as f64).collect();
        edges.push(max);
        Ok(Self { edges, range: None })
    }

    /// Bins delimited by `edges` (strictly increasing, at least two).
    pub fn variable(edges: Vec<f64>) -> Result<Self> {
        if edges.len() < 2 {
            return Err(Error::Validation("axis needs at least two edges".to_string()));
        }
        if edges.iter().any(|e| !e.is_finite()) || edges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Validation("axis edges must be finite and increasing".to_string()));
        }
        Ok(Self { edges, range: None })
    }

    /// Number of regular bins.
    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// Number of cells including under/overflow.
    pub fn n_cells(&self) -> usize {
        self.edges.len() + 1
    }

    /// Bin edges.
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Lower edge of the first regular bin.
    pub fn min(&self) -> f64 {
        self.edges[0]
    }

    /// Upper edge of the last regular bin.
    pub fn max(&self) -> f64 {
        self.edges[self.edges.len() - 1]
    }

    /// Lower edge of regular bin `bin` (1-based).
    pub fn bin_low_edge(&self, bin: usize) -> f64 {
        self.edges[bin.clamp(1, self.n_bins()) - 1]
    }

    /// Upper edge of regular bin `bin` (1-based).
    pub fn bin_up_edge(&self, bin: usize) -> f64 {
        self.edges[bin.clamp(1, self.n_bins())]
    }

    /// Center of regular bin `bin` (1-based).
    pub fn bin_center(&self, bin: usize) -> f64 {
        0.5 * (self.bin_low_edge(bin) + self.bin_up_edge(bin))
    }

    /// Bin containing `x`; `0` below the axis, `n + 1` at or above it.
    pub fn find_bin(&self, x: f64) -> usize {
        if x.is_nan() || x < self.min() {
            return 0;
        }
        if x >= self.max() {
            return self.n_bins() + 1;
        }
        // Number of edges <= x, which is the 1-based bin index.
        self.edges.partition_point(|&e| e <= x)
    }

    /// Restrict the axis to regular bins `first..=last`, clamped to the axis.
    pub fn set_range(&mut self, first: usize, last: usize) {
        let n = self.n_bins();
        let first = first.clamp(1, n);
        let last = last.clamp(1, n);
        self.range = if first <= last { Some((first, last)) } else { Some((last, first)) };
    }

    /// Restrict the axis to the bins covering `[min, max]`.
    ///
    /// A `max` that falls exactly on a bin edge excludes the bin starting there.
    pub fn set_range_user(&mut self, min: f64, max: f64) {
        let first = self.find_bin(min);
        let mut last = self.find_bin(max);
        if last >= 1 && last <= self.n_bins() && self.bin_low_edge(last) == max && last > first {
            last -= 1;
        }
        self.set_range(first, last);
    }

    /// Drop the user range.
    pub fn reset_range(&mut self) {
        self.range = None;
    }

    /// Take over the user range of `other`.
    pub fn copy_range_from(&mut self, other: &Axis) {
        self.range = other.range;
    }

    /// Whether a user range is active.
    pub fn has_range(&self) -> bool {
        self.range.is_some()
    }

    /// Active range as `(first, last)`; all regular bins when unset.
    pub fn range(&self) -> (usize, usize) {
        self.range.unwrap_or((1, self.n_bins()))
    }

    /// Cell indices visited by iteration: the user range when one is set
    /// and `respect_range` is true, otherwise every cell including flows.
    pub fn cells(&self, respect_range: bool) -> std::ops::RangeInclusive<usize> {
        match self.range {
            Some((first, last)) if respect_range => first..=last,
            _ => 0..=self.n_bins() + 1,
        }
    }

    /// Merge groups of `ngroup` adjacent bins.
    pub fn rebinned(&self, ngroup: usize) -> Result<Self> {
        let n = self.n_bins();
        if ngroup == 0 || n % ngroup != 0 {
            return Err(Error::Validation(format!(
                "cannot rebin {n} bins in groups of {ngroup}"
            )));
        }
        let edges: Vec<f64> = self.edges.iter().step_by(ngroup).copied().collect();
        let range = self.range.map(|(first, last)| (Self::group_of(first, ngroup), Self::group_of(last, ngroup)));
        Ok(Self { edges, range })
    }

    /// Target cell of source cell `cell` after rebinning by `ngroup`.
    pub(crate) fn rebinned_cell(&self, cell: usize, ngroup: usize) -> usize {
        if cell == 0 {
            0
        } else if cell > self.n_bins() {
            self.n_bins() / ngroup + 1
        } else {
            Self::group_of(cell, ngroup)
        }
    }

    fn group_of(bin: usize, ngroup: usize) -> usize {
        (bin - 1) / ngroup + 1
    }

    /// Whether both axes have identical edges.
    pub fn same_binning(&self, other: &Axis) -> bool {
        self.edges == other.edges
    }
}
