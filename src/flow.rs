//! Per-instrument flow state: CVD window, open-interest readings and a
//! bounded mid-price history.
//!
//! The CVD cumulative value is always recomputed from the retained window, so
//! pruning old samples can never leave a drifting running sum. The CVD delta
//! itself comes from kline direction (close vs open), an approximation of the
//! true signed trade tape; see the known-limitation test at the bottom.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
struct CvdSample {
    ts_ms: u64,
    delta: f64,
}

/// Rolling window of signed volume deltas.
#[derive(Debug, Clone)]
pub struct CvdWindow {
    window_ms: u64,
    samples: VecDeque<CvdSample>,
    cumulative: f64,
}

impl CvdWindow {
    pub fn new(window_ms: u64) -> Self {
        Self { window_ms, samples: VecDeque::new(), cumulative: 0.0 }
    }

    pub fn push(&mut self, ts_ms: u64, delta: f64) {
        self.samples.push_back(CvdSample { ts_ms, delta });
        self.prune(ts_ms);
    }

    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while let Some(front) = self.samples.front() {
            if front.ts_ms < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        // Recompute rather than adjust incrementally
        self.cumulative = self.samples.iter().map(|s| s.delta).sum();
    }

    pub fn cumulative(&self) -> f64 {
        self.cumulative
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Running cumulative series over the retained samples, oldest first.
    /// This is what the temporal trap check trends over.
    pub fn cumulative_series(&self) -> Vec<f64> {
        let mut sum = 0.0;
        self.samples
            .iter()
            .map(|s| {
                sum += s.delta;
                sum
            })
            .collect()
    }
}

/// Flow state owned by one instrument's monitoring task.
#[derive(Debug, Clone)]
pub struct FlowState {
    pub cvd: CvdWindow,
    open_interest: Option<f64>,
    prev_open_interest: Option<f64>,
    oi_series: VecDeque<f64>,
    oi_series_cap: usize,
    price_history: VecDeque<(u64, f64)>,
    price_history_cap: usize,
}

impl FlowState {
    pub fn new(cvd_window_ms: u64, price_history_cap: usize, oi_series_cap: usize) -> Self {
        Self {
            cvd: CvdWindow::new(cvd_window_ms),
            open_interest: None,
            prev_open_interest: None,
            oi_series: VecDeque::with_capacity(oi_series_cap),
            oi_series_cap,
            price_history: VecDeque::with_capacity(price_history_cap),
            price_history_cap,
        }
    }

    pub fn record_cvd_delta(&mut self, ts_ms: u64, delta: f64) {
        self.cvd.push(ts_ms, delta);
    }

    pub fn record_oi(&mut self, value: f64) {
        self.prev_open_interest = self.open_interest;
        self.open_interest = Some(value);
        if self.oi_series.len() >= self.oi_series_cap {
            self.oi_series.pop_front();
        }
        self.oi_series.push_back(value);
    }

    pub fn record_price(&mut self, ts_ms: u64, price: f64) {
        if self.price_history.len() >= self.price_history_cap {
            self.price_history.pop_front();
        }
        self.price_history.push_back((ts_ms, price));
    }

    pub fn open_interest(&self) -> Option<f64> {
        self.open_interest
    }

    pub fn prev_open_interest(&self) -> Option<f64> {
        self.prev_open_interest
    }

    /// Absolute OI change across the last two readings.
    pub fn oi_change(&self) -> f64 {
        match (self.open_interest, self.prev_open_interest) {
            (Some(curr), Some(prev)) => curr - prev,
            _ => 0.0,
        }
    }

    pub fn oi_series(&self) -> Vec<f64> {
        self.oi_series.iter().copied().collect()
    }

    pub fn price_series(&self) -> Vec<f64> {
        self.price_history.iter().map(|(_, p)| *p).collect()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.price_history.back().map(|(_, p)| *p)
    }

    /// Relative price change across the retained history.
    pub fn price_change(&self) -> f64 {
        match (self.price_history.front(), self.price_history.back()) {
            (Some((_, first)), Some((_, last))) if *first > 0.0 => (last - first) / first,
            _ => 0.0,
        }
    }
}
