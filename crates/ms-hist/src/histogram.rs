//! N-dimensional histogram with under/overflow storage.
//!
//! Contents are stored row-major over `Π (n_i + 2)` cells (last axis
//! fastest), flows included.

use crate::axis::Axis;
use ms_core::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// N-dimensional binned density or count map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "HistogramRepr", into = "HistogramRepr")]
pub struct Histogram {
    name: String,
    axes: Vec<Axis>,
    contents: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistogramRepr {
    #[serde(default)]
    name: String,
    axes: Vec<Axis>,
    #[serde(default)]
    contents: Option<Vec<f64>>,
}

impl TryFrom<HistogramRepr> for Histogram {
    type Error = Error;

    fn try_from(repr: HistogramRepr) -> Result<Self> {
        let mut h = Histogram::new(repr.name, repr.axes)?;
        if let Some(contents) = repr.contents {
            if contents.len() != h.contents.len() {
                return Err(Error::ShapeMismatch(format!(
                    "histogram '{}' expects {} cells, got {}",
                    h.name,
                    h.contents.len(),
                    contents.len()
                )));
            }
            h.contents = contents;
        }
        Ok(h)
    }
}

impl From<Histogram> for HistogramRepr {
    fn from(h: Histogram) -> Self {
        HistogramRepr { name: h.name, axes: h.axes, contents: Some(h.contents) }
    }
}

impl Histogram {
    /// Empty histogram over `axes`.
    pub fn new(name: impl Into<String>, axes: Vec<Axis>) -> Result<Self> {
        if axes.is_empty() {
            return Err(Error::Validation("histogram needs at least one axis".to_string()));
        }
        let n: usize = axes.iter().map(Axis::n_cells).product();
        Ok(Self { name: name.into(), axes, contents: vec![0.0; n] })
    }

    /// Empty histogram with the same binning and user ranges as `self`.
    pub fn zeros_like(&self, name: impl Into<String>) -> Self {
        Self { name: name.into(), axes: self.axes.clone(), contents: vec![0.0; self.contents.len()] }
    }

    /// Histogram name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Axes.
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// Axis `dim`.
    pub fn axis(&self, dim: usize) -> Result<&Axis> {
        self.axes.get(dim).ok_or_else(|| self.bad_dim(dim))
    }

    /// Number of dimensions.
    pub fn n_dims(&self) -> usize {
        self.axes.len()
    }

    /// Number of storage cells, flows included.
    pub fn n_cells(&self) -> usize {
        self.contents.len()
    }

    /// Raw storage in row-major order.
    pub fn contents(&self) -> &[f64] {
        &self.contents
    }

    /// Content of storage cell `cell`.
    pub fn get(&self, cell: usize) -> Result<f64> {
        self.contents.get(cell).copied().ok_or_else(|| {
            Error::Validation(format!(
                "cell {} out of bounds for histogram '{}' ({} cells)",
                cell,
                self.name,
                self.contents.len()
            ))
        })
    }

    /// Storage cell of per-axis bin indices `bins`.
    pub fn linear_index(&self, bins: &[usize]) -> Result<usize> {
        if bins.len() != self.axes.len() {
            return Err(Error::Validation(format!(
                "histogram '{}' has {} dimensions, got {} bin indices",
                self.name,
                self.axes.len(),
                bins.len()
            )));
        }
        let mut idx = 0;
        for (axis, &b) in self.axes.iter().zip(bins) {
            if b >= axis.n_cells() {
                return Err(Error::Validation(format!(
                    "bin {} out of bounds for axis with {} cells in histogram '{}'",
                    b,
                    axis.n_cells(),
                    self.name
                )));
            }
            idx = idx * axis.n_cells() + b;
        }
        Ok(idx)
    }

    /// Per-axis bin indices of storage cell `cell`.
    pub fn bin_indices(&self, mut cell: usize) -> Vec<usize> {
        let mut bins = vec![0; self.axes.len()];
        for (d, axis) in self.axes.iter().enumerate().rev() {
            bins[d] = cell % axis.n_cells();
            cell /= axis.n_cells();
        }
        bins
    }

    /// Content of the bin at per-axis indices `bins`.
    pub fn bin_content(&self, bins: &[usize]) -> Result<f64> {
        Ok(self.contents[self.linear_index(bins)?])
    }

    /// Overwrite the bin at per-axis indices `bins`.
    pub fn set_bin_content(&mut self, bins: &[usize], value: f64) -> Result<()> {
        let idx = self.linear_index(bins)?;
        self.contents[idx] = value;
        Ok(())
    }

    /// Add `weight` to the bin containing `point`.
    pub fn fill(&mut self, point: &[f64], weight: f64) -> Result<()> {
        if point.len() != self.axes.len() {
            return Err(Error::Validation(format!(
                "histogram '{}' has {} dimensions, got a {}-dimensional point",
                self.name,
                self.axes.len(),
                point.len()
            )));
        }
        let bins: Vec<usize> = self.axes.iter().zip(point).map(|(a, &x)| a.find_bin(x)).collect();
        let idx = self.linear_index(&bins)?;
        self.contents[idx] += weight;
        Ok(())
    }

    /// Whether both histograms have the same dimensions and edges.
    pub fn same_binning(&self, other: &Histogram) -> bool {
        self.axes.len() == other.axes.len()
            && self.axes.iter().zip(&other.axes).all(|(a, b)| a.same_binning(b))
    }

    /// [`Histogram::same_binning`] as a `Result`.
    pub fn check_same_binning(&self, other: &Histogram) -> Result<()> {
        if self.same_binning(other) {
            Ok(())
        } else {
            Err(Error::ShapeMismatch(format!(
                "histograms '{}' and '{}' have different binning",
                self.name, other.name
            )))
        }
    }

    /// `self += c * other`, cell by cell.
    pub fn add_scaled(&mut self, other: &Histogram, c: f64) -> Result<()> {
        self.check_same_binning(other)?;
        for (a, b) in self.contents.iter_mut().zip(&other.contents) {
            *a += c * b;
        }
        Ok(())
    }

    /// Multiply every cell by `c`.
    pub fn scale(&mut self, c: f64) {
        self.contents.iter_mut().for_each(|v| *v *= c);
    }

    /// Zero every cell, keeping the binning.
    pub fn reset(&mut self) {
        self.contents.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Storage cells visited by iteration.
    ///
    /// Axes with a user range contribute only that range when
    /// `respect_range` is true; every other axis contributes all its cells,
    /// flows included.
    pub fn cell_indices(&self, respect_range: bool) -> Vec<usize> {
        let mut cells = vec![0usize];
        for axis in &self.axes {
            let stride = axis.n_cells();
            let bins: Vec<usize> = axis.cells(respect_range).collect();
            let mut next = Vec::with_capacity(cells.len() * bins.len());
            for &base in &cells {
                for &b in &bins {
                    next.push(base * stride + b);
                }
            }
            cells = next;
        }
        cells
    }

    /// Sum over [`Histogram::cell_indices`].
    pub fn integral(&self, respect_range: bool) -> f64 {
        if !respect_range || !self.axes.iter().any(Axis::has_range) {
            return self.contents.iter().sum();
        }
        self.cell_indices(true).into_iter().map(|i| self.contents[i]).sum()
    }

    /// Scale to unit [`Histogram::integral`].
    pub fn normalize(&mut self, respect_range: bool) -> Result<()> {
        let integral = self.integral(respect_range);
        if !integral.is_finite() || integral == 0.0 {
            return Err(Error::Computation(format!(
                "cannot normalize histogram '{}' with integral {}",
                self.name, integral
            )));
        }
        self.scale(1.0 / integral);
        Ok(())
    }

    /// Restrict axis `dim` to the bins covering `[min, max]`.
    pub fn set_range_user(&mut self, dim: usize, min: f64, max: f64) -> Result<()> {
        let err = self.bad_dim(dim);
        self.axes.get_mut(dim).ok_or(err)?.set_range_user(min, max);
        Ok(())
    }

    /// Take over the user ranges of `other`, which must share the binning.
    pub fn copy_ranges_from(&mut self, other: &Histogram) -> Result<()> {
        self.check_same_binning(other)?;
        for (a, b) in self.axes.iter_mut().zip(&other.axes) {
            a.copy_range_from(b);
        }
        Ok(())
    }

    /// Drop every user range.
    pub fn reset_ranges(&mut self) {
        self.axes.iter_mut().for_each(Axis::reset_range);
    }

    /// Marginalize onto the ordered subset of axes `dims`.
    ///
    /// Every cell of the dropped axes, flows included, is summed.
    pub fn projection(&self, dims: &[usize], name: impl Into<String>) -> Result<Histogram> {
        if dims.is_empty() {
            return Err(Error::Validation("projection needs at least one axis".to_string()));
        }
        for (i, &d) in dims.iter().enumerate() {
            if d >= self.axes.len() {
                return Err(self.bad_dim(d));
            }
            if dims[..i].contains(&d) {
                return Err(Error::Validation(format!("axis {d} listed twice in projection")));
            }
        }
        let axes = dims.iter().map(|&d| self.axes[d].clone()).collect();
        let mut out = Histogram::new(name, axes)?;
        let mut target = vec![0usize; dims.len()];
        for (cell, &v) in self.contents.iter().enumerate() {
            if v == 0.0 {
                continue;
            }
            let bins = self.bin_indices(cell);
            for (t, &d) in target.iter_mut().zip(dims) {
                *t = bins[d];
            }
            let idx = out.linear_index(&target)?;
            out.contents[idx] += v;
        }
        Ok(out)
    }

    /// Merge groups of `ngroup[d]` adjacent bins along every axis `d`.
    pub fn rebinned(&self, ngroup: &[usize]) -> Result<Histogram> {
        if ngroup.len() != self.axes.len() {
            return Err(Error::Validation(format!(
                "histogram '{}' has {} dimensions, got {} rebin factors",
                self.name,
                self.axes.len(),
                ngroup.len()
            )));
        }
        let axes = self.axes.iter().zip(ngroup).map(|(a, &g)| a.rebinned(g)).collect::<Result<Vec<_>>>()?;
        let mut out = Histogram::new(self.name.clone(), axes)?;
        let mut target = vec![0usize; ngroup.len()];
        for (cell, &v) in self.contents.iter().enumerate() {
            let bins = self.bin_indices(cell);
            for (d, t) in target.iter_mut().enumerate() {
                *t = self.axes[d].rebinned_cell(bins[d], ngroup[d]);
            }
            let idx = out.linear_index(&target)?;
            out.contents[idx] += v;
        }
        Ok(out)
    }

    /// Sampler over the regular bins, ignoring user ranges and flows.
    ///
    /// Returns `None` when no regular bin has positive content.
    pub fn sampler(&self) -> Option<CellSampler<'_>> {
        let full: Vec<Axis> = self
            .axes
            .iter()
            .map(|a| {
                let mut a = a.clone();
                a.set_range(1, a.n_bins());
                a
            })
            .collect();
        let unfilled = Histogram { name: String::new(), axes: full, contents: Vec::new() };
        let cells = unfilled.cell_indices(true);

        let mut cumulative = Vec::with_capacity(cells.len());
        let mut total = 0.0;
        for &c in &cells {
            total += self.contents[c].max(0.0);
            cumulative.push(total);
        }
        if !(total > 0.0 && total.is_finite()) {
            return None;
        }
        Some(CellSampler { hist: self, cells, cumulative, total })
    }

    fn bad_dim(&self, dim: usize) -> Error {
        Error::Validation(format!(
            "axis {} out of bounds for histogram '{}' with {} dimensions",
            dim,
            self.name,
            self.axes.len()
        ))
    }
}

/// Draws points distributed like a histogram's regular-bin contents.
pub struct CellSampler<'a> {
    hist: &'a Histogram,
    cells: Vec<usize>,
    cumulative: Vec<f64>,
    total: f64,
}

impl CellSampler<'_> {
    /// Draw one point: a cell chosen proportionally to its content, then a
    /// uniform position inside it.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let u = rng.r#gen::<f64>() * self.total;
        let k = self.cumulative.partition_point(|&c| c <= u).min(self.cells.len() - 1);
        let bins = self.hist.bin_indices(self.cells[k]);
        self.hist
            .axes
            .iter()
            .zip(bins)
            .map(|(a, b)| {
                let lo = a.bin_low_edge(b);
                let hi = a.bin_up_edge(b);
                lo + (hi - lo) * rng.r#gen::<f64>()
            })
            .collect()
    }

    /// Sum of the sampled contents.
    pub fn total(&self) -> f64 {
        self.total
    }
}
