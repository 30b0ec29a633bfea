//! Binned one-dimensional statistics
//!
//! A fixed-range, fixed-bin-count accumulator of weighted samples that
//! reports mean and standard deviation (in-range and overall) plus a mode
//! and median read off the bin counts. Mode and median are histogram
//! approximations reported at bin midpoints, not exact order statistics.
//!
//! Misuse (bad bin count, unknown handle, too few samples) never panics:
//! the offending call logs a warning and yields a `0.0` sentinel.

/// Upper limit on simultaneously defined histograms in a table
pub const MAX_HISTOGRAMS: usize = 20;
/// Upper limit on the total number of bins held by a table
pub const MAX_TOTAL_BINS: usize = 2000;

/// Weighted histogram with running moments
#[derive(Clone, Debug)]
pub struct Histogram {
    name: String,
    min_val: f64,
    max_val: f64,
    bin_size: f64,
    bins: Vec<f64>,
    n_under: usize,
    n_in: usize,
    n_over: usize,
    w_under: f64,
    w_in: f64,
    w_over: f64,
    sum_in: f64,
    sum2_in: f64,
    sum_all: f64,
    sum2_all: f64,
    avg_in: f64,
    std_in: f64,
    avg_all: f64,
    std_all: f64,
    median: f64,
    mode: f64,
    calc_err: bool,
}

impl Histogram {
    /// Define a histogram over `[min_val, max_val]` with `num_bins` bins
    ///
    /// Returns `None` (and logs) for a zero bin count or an empty range.
    pub fn new(name: &str, num_bins: usize, min_val: f64, max_val: f64) -> Option<Self> {
        if num_bins == 0 {
            log::warn!("histogram '{}': illegal number of bins", name);
            return None;
        }
        if !(max_val > min_val) || !min_val.is_finite() || !max_val.is_finite() {
            log::warn!("histogram '{}': illegal range [{}, {}]", name, min_val, max_val);
            return None;
        }
        Some(Self {
            name: name.to_string(),
            min_val,
            max_val,
            bin_size: (max_val - min_val) / num_bins as f64,
            bins: vec![0.0; num_bins],
            n_under: 0,
            n_in: 0,
            n_over: 0,
            w_under: 0.0,
            w_in: 0.0,
            w_over: 0.0,
            sum_in: 0.0,
            sum2_in: 0.0,
            sum_all: 0.0,
            sum2_all: 0.0,
            avg_in: 0.0,
            std_in: 0.0,
            avg_all: 0.0,
            std_all: 0.0,
            median: 0.0,
            mode: 0.0,
            calc_err: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    /// Weighted bin counts
    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    /// Sample counts (under, in, over)
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.n_under, self.n_in, self.n_over)
    }

    /// Add one weighted sample
    pub fn add(&mut self, value: f64, weight: f64) {
        if !value.is_finite() {
            log::debug!("histogram '{}': ignoring non-finite sample", self.name);
            return;
        }
        // Second moments accumulate (value*weight)^2
        let vw2 = value * value * weight * weight;
        self.sum_all += value * weight;
        self.sum2_all += vw2;

        if value < self.min_val {
            self.n_under += 1;
            self.w_under += weight;
            return;
        }
        if value > self.max_val {
            self.n_over += 1;
            self.w_over += weight;
            return;
        }

        self.n_in += 1;
        self.w_in += weight;
        self.sum_in += value * weight;
        self.sum2_in += vw2;

        let bin = (((value - self.min_val) / self.bin_size) as usize).min(self.bins.len() - 1);
        self.bins[bin] += weight;
    }

    /// Compute moments, median and mode without printing
    ///
    /// Returns `false` when fewer than two (weighted) samples are available;
    /// the getters then report `0.0`.
    pub fn calculate(&mut self) -> bool {
        self.calc_err = false;

        let n = self.w_in;
        if n <= 1.0 {
            self.calc_err = true;
            return false;
        }
        self.avg_in = self.sum_in / n;
        let num = (self.sum2_in - self.sum_in * self.sum_in / n).max(0.0);
        self.std_in = (num / (n - 1.0)).sqrt();

        let n = self.w_in + self.w_over + self.w_under;
        self.avg_all = self.sum_all / n;
        let num = (self.sum2_all - self.sum_all * self.sum_all / n).max(0.0);
        self.std_all = (num / (n - 1.0)).sqrt();

        // Largest bin (first on ties) and first half-weight crossing
        let mut imax = 0;
        let mut maxval = self.bins[0];
        let mut imid = None;
        let mut cumulative = 0.0;
        for (i, &count) in self.bins.iter().enumerate() {
            if count > maxval {
                maxval = count;
                imax = i;
            }
            cumulative += count;
            if imid.is_none() && cumulative > self.w_in / 2.0 {
                imid = Some(i);
            }
        }
        let imid = imid.unwrap_or(0);

        self.median = self.min_val + self.bin_size * (imid as f64 + 0.5);
        self.mode = self.min_val + self.bin_size * (imax as f64 + 0.5);
        true
    }

    fn checked(&self, what: &str, value: f64) -> f64 {
        if self.calc_err {
            log::warn!("histogram '{}': {} requested after a calculation error", self.name, what);
            0.0
        } else {
            value
        }
    }

    pub fn avg_in(&self) -> f64 {
        self.checked("avg_in", self.avg_in)
    }

    pub fn std_in(&self) -> f64 {
        self.checked("std_in", self.std_in)
    }

    pub fn avg_all(&self) -> f64 {
        self.checked("avg_all", self.avg_all)
    }

    pub fn std_all(&self) -> f64 {
        self.checked("std_all", self.std_all)
    }

    pub fn median(&self) -> f64 {
        self.checked("median", self.median)
    }

    pub fn mode(&self) -> f64 {
        self.checked("mode", self.mode)
    }

    /// Erase all samples, keeping range and bin count
    pub fn clear(&mut self) {
        self.bins.iter_mut().for_each(|b| *b = 0.0);
        self.n_under = 0;
        self.n_in = 0;
        self.n_over = 0;
        self.w_under = 0.0;
        self.w_in = 0.0;
        self.w_over = 0.0;
        self.sum_in = 0.0;
        self.sum2_in = 0.0;
        self.sum_all = 0.0;
        self.sum2_all = 0.0;
        self.avg_in = 0.0;
        self.std_in = 0.0;
        self.avg_all = 0.0;
        self.std_all = 0.0;
        self.median = 0.0;
        self.mode = 0.0;
        self.calc_err = false;
    }
}

/// Handle to a histogram stored in a [`HistogramTable`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HistId(usize);

/// Bounded collection of histograms addressed by handle
///
/// Owned by a run (or a worker) rather than living in global state. `reset`
/// drops every histogram so the table can be reused for the next voxel.
#[derive(Clone, Debug, Default)]
pub struct HistogramTable {
    hists: Vec<Histogram>,
    total_bins: usize,
}

impl HistogramTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a new histogram and return its handle
    pub fn define(&mut self, name: &str, num_bins: usize, min_val: f64, max_val: f64) -> Option<HistId> {
        if self.hists.len() >= MAX_HISTOGRAMS {
            log::warn!("histogram '{}': too many histograms", name);
            return None;
        }
        if self.total_bins + num_bins > MAX_TOTAL_BINS {
            log::warn!("histogram '{}': not enough memory for new histogram", name);
            return None;
        }
        let hist = Histogram::new(name, num_bins, min_val, max_val)?;
        self.total_bins += num_bins;
        self.hists.push(hist);
        Some(HistId(self.hists.len() - 1))
    }

    pub fn len(&self) -> usize {
        self.hists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hists.is_empty()
    }

    pub fn get(&self, id: HistId) -> Option<&Histogram> {
        let hist = self.hists.get(id.0);
        if hist.is_none() {
            log::warn!("histogram {}: no such histogram", id.0);
        }
        hist
    }

    pub fn get_mut(&mut self, id: HistId) -> Option<&mut Histogram> {
        let hist = self.hists.get_mut(id.0);
        if hist.is_none() {
            log::warn!("histogram {}: no such histogram", id.0);
        }
        hist
    }

    pub fn add(&mut self, id: HistId, value: f64, weight: f64) {
        if let Some(h) = self.get_mut(id) {
            h.add(value, weight);
        }
    }

    pub fn calculate(&mut self, id: HistId) -> bool {
        self.get_mut(id).map_or(false, Histogram::calculate)
    }

    pub fn std_in(&self, id: HistId) -> f64 {
        self.get(id).map_or(0.0, Histogram::std_in)
    }

    pub fn avg_in(&self, id: HistId) -> f64 {
        self.get(id).map_or(0.0, Histogram::avg_in)
    }

    pub fn median(&self, id: HistId) -> f64 {
        self.get(id).map_or(0.0, Histogram::median)
    }

    pub fn mode(&self, id: HistId) -> f64 {
        self.get(id).map_or(0.0, Histogram::mode)
    }

    pub fn clear(&mut self, id: HistId) {
        if let Some(h) = self.get_mut(id) {
            h.clear();
        }
    }

    /// Drop all histograms
    pub fn reset(&mut self) {
        self.hists.clear();
        self.total_bins = 0;
    }

    /// Drop the most recently defined histogram
    fn release_last(&mut self, id: HistId) {
        if id.0 + 1 == self.hists.len() {
            if let Some(h) = self.hists.pop() {
                self.total_bins -= h.num_bins();
            }
        }
    }

    /// Histogram mode and in-range standard deviation of a sample set
    ///
    /// Bin count follows the sample size (10 / 50 / 100 bins for at most
    /// 100 / 1000 / more samples) over `[min - 1, max + 1]`. The scratch
    /// histogram is dropped afterwards; histograms already in the table are
    /// left untouched.
    pub fn mode_with_std(&mut self, values: &[f64]) -> (f64, f64) {
        let finite = values.iter().copied().filter(|v| v.is_finite());
        let (smin, smax) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
        if !(smin <= smax) {
            return (0.0, 0.0);
        }

        let n_bins = bins_for_count(values.len());
        let Some(id) = self.define("mode", n_bins, smin - 1.0, smax + 1.0) else {
            return (0.0, 0.0);
        };
        for &v in values {
            self.add(id, v, 1.0);
        }
        self.calculate(id);
        let result = match self.get(id) {
            Some(h) if !h.calc_err => (h.mode, h.std_in),
            _ => (0.0, 0.0),
        };
        self.release_last(id);
        result
    }
}

/// Bin count used for a mode estimate over `n` samples
#[inline]
pub fn bins_for_count(n: usize) -> usize {
    if n <= 100 {
        10
    } else if n <= 1000 {
        50
    } else {
        100
    }
}

/// Histogram mode and standard deviation using a throwaway table
pub fn mode_with_std(values: &[f64]) -> (f64, f64) {
    HistogramTable::new().mode_with_std(values)
}
