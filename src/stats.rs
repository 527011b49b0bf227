use std::fmt;

/// Order statistics of a batch of latency samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantiles {
    pub n: usize,
    pub min: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub max: u64,
}

impl Quantiles {
    /// CSV header matching the [`fmt::Display`] row.
    pub const CSV_HEADER: &'static str = "name,n,min,0.5,0.9,0.99,0.999,max";

    /// Sorts `samples` and summarizes them. Returns `None` if empty.
    pub fn from_samples(mut samples: Vec<u64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let at = |p: f64| samples[((samples.len() - 1) as f64 * p).round() as usize];
        Some(Self {
            n: samples.len(),
            min: samples[0],
            p50: at(0.5),
            p90: at(0.9),
            p99: at(0.99),
            p999: at(0.999),
            max: samples[samples.len() - 1],
        })
    }
}

impl fmt::Display for Quantiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{}",
            self.n, self.min, self.p50, self.p90, self.p99, self.p999, self.max
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_has_no_quantiles() {
        assert_eq!(Quantiles::from_samples(Vec::new()), None);
    }

    #[test]
    fn quantiles_index_sorted_samples() {
        // n = 5, indices are round((n-1) * p)
        let q = Quantiles::from_samples(vec![9, 1, 5, 7, 3]).unwrap();
        assert_eq!(q.n, 5);
        assert_eq!(q.min, 1);
        assert_eq!(q.p50, 5);
        assert_eq!(q.p90, 9);
        assert_eq!(q.max, 9);
        assert_eq!(q.to_string(), "5,1,5,9,9,9,9");
    }
}
