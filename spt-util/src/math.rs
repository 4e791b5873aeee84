#[derive(Debug, Default, Clone, Copy)]
pub struct RunningAverage {
    count: u64,
    mean: f64,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, value: f64) {
        self.count += 1;
        let n = self.count as f64;

        self.mean += (value - self.mean) / n;
    }

    pub fn get_average(&self) -> f64 {
        self.mean
    }

    pub fn get_count(&self) -> u64 {
        self.count
    }
}

pub fn safe_div(a: f64, b: f64) -> f64 {
    if b > 0.0 { a / b } else { 0.0 }
}

/// Sample-retaining histogram. Cheap for the batch-sized windows we collect
/// (one sample per batch execution or per request inside a metrics lock).
#[derive(Debug, Default, Clone)]
pub struct Histogram {
    samples: Vec<f64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, value: f64) {
        self.samples.push(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summary(&self) -> HistogramSummary {
        if self.samples.is_empty() {
            return HistogramSummary::default();
        }

        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("histogram sample was NaN"));

        let count = sorted.len();
        let percentile = |p: f64| {
            let idx = ((count as f64 - 1.0) * p).round() as usize;
            sorted[idx.min(count - 1)]
        };

        HistogramSummary {
            count: count as u64,
            min: sorted[0],
            max: sorted[count - 1],
            mean: sorted.iter().sum::<f64>() / count as f64,
            p50: percentile(0.5),
            p95: percentile(0.95),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_average_converges() {
        let mut avg = RunningAverage::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            avg.add_sample(v);
        }
        assert!((avg.get_average() - 2.5).abs() < 1e-9);
        assert_eq!(avg.get_count(), 4);
    }

    #[test]
    fn safe_div_handles_zero() {
        assert_eq!(safe_div(10.0, 0.0), 0.0);
        assert_eq!(safe_div(10.0, 2.0), 5.0);
    }

    #[test]
    fn histogram_summary() {
        let mut h = Histogram::new();
        for v in 1..=100 {
            h.record(v as f64);
        }
        let s = h.summary();
        assert_eq!(s.count, 100);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 100.0);
        assert!((s.mean - 50.5).abs() < 1e-9);
        assert!((s.p50 - 50.0).abs() <= 1.0);
        assert!((s.p95 - 95.0).abs() <= 1.0);
    }

    #[test]
    fn empty_histogram_summary_is_zero() {
        let h = Histogram::new();
        assert_eq!(h.summary(), HistogramSummary::default());
    }
}
