//! Rolling window of per-second buckets.
//!
//! Buckets are addressed by `second % len`. A bucket whose stamp is older
//! than the window is treated as empty and reset on the next write, so the
//! window slides without ever being cleared wholesale.

/// Number of latency histogram buckets.
pub const LATENCY_BUCKETS: usize = 96;

/// Upper bound of the first latency bucket, in microseconds.
const BASE_US: f64 = 100.0;

/// Ratio between consecutive bucket bounds (2^(1/4)).
const GROWTH: f64 = 1.189_207_115;

/// Upper bound (microseconds) of latency bucket `i`.
pub fn bucket_upper_us(i: usize) -> f64 {
    BASE_US * GROWTH.powi(i as i32)
}

fn bucket_index(latency_us: u64) -> usize {
    if (latency_us as f64) <= BASE_US {
        return 0;
    }
    let idx = ((latency_us as f64) / BASE_US).log(GROWTH).ceil() as usize;
    idx.min(LATENCY_BUCKETS - 1)
}

#[derive(Clone)]
pub struct Bucket {
    /// Second (since window start) this bucket holds data for.
    second: u64,
    pub completions: u64,
    pub cache_hits: u64,
    pub errors: u64,
    pub batches: u64,
    pub busy_us: u64,
    /// Sum of batch sizes seen by executed (non-cached) completions.
    pub batch_size_sum: u64,
    pub latency: [u64; LATENCY_BUCKETS],
}

impl Bucket {
    fn empty(second: u64) -> Self {
        Self {
            second,
            completions: 0,
            cache_hits: 0,
            errors: 0,
            batches: 0,
            busy_us: 0,
            batch_size_sum: 0,
            latency: [0; LATENCY_BUCKETS],
        }
    }

    fn merge(&mut self, other: &Bucket) {
        self.completions += other.completions;
        self.cache_hits += other.cache_hits;
        self.errors += other.errors;
        self.batches += other.batches;
        self.busy_us += other.busy_us;
        self.batch_size_sum += other.batch_size_sum;
        for (a, b) in self.latency.iter_mut().zip(other.latency.iter()) {
            *a += b;
        }
    }

    pub fn record_latency(&mut self, latency_us: u64) {
        self.latency[bucket_index(latency_us)] += 1;
    }

    /// Estimate the `q` quantile (0.0–1.0) in milliseconds.
    ///
    /// Returns the upper bound of the histogram bucket holding the
    /// quantile, so the estimate is monotone in `q`.
    pub fn quantile_ms(&self, q: f64) -> f64 {
        let total: u64 = self.latency.iter().sum();
        if total == 0 {
            return 0.0;
        }
        let rank = ((q.clamp(0.0, 1.0) * total as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (i, count) in self.latency.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return bucket_upper_us(i) / 1000.0;
            }
        }
        bucket_upper_us(LATENCY_BUCKETS - 1) / 1000.0
    }
}

/// Fixed-length ring of one-second buckets.
pub struct Window {
    buckets: Vec<Bucket>,
}

impl Window {
    pub fn new(len_secs: u64) -> Self {
        let len = len_secs.max(1) as usize;
        Self {
            buckets: (0..len).map(|_| Bucket::empty(u64::MAX)).collect(),
        }
    }

    pub fn len_secs(&self) -> u64 {
        self.buckets.len() as u64
    }

    /// Bucket for `second`, reset first if it holds an older second.
    pub fn bucket_mut(&mut self, second: u64) -> &mut Bucket {
        let len = self.buckets.len() as u64;
        let bucket = &mut self.buckets[(second % len) as usize];
        if bucket.second != second {
            *bucket = Bucket::empty(second);
        }
        bucket
    }

    /// Merge every bucket inside the window ending at `now_second`.
    pub fn merged(&self, now_second: u64) -> Bucket {
        let len = self.buckets.len() as u64;
        let mut total = Bucket::empty(now_second);
        for bucket in &self.buckets {
            if bucket.second <= now_second && now_second - bucket.second < len {
                total.merge(bucket);
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_bounds_grow() {
        assert_eq!(bucket_upper_us(0), 100.0);
        assert!(bucket_upper_us(4) > 199.0 && bucket_upper_us(4) < 201.0);
        // Last bucket covers well beyond a minute.
        assert!(bucket_upper_us(LATENCY_BUCKETS - 1) > 60_000_000.0);
    }

    #[test]
    fn latency_lands_in_covering_bucket() {
        for us in [1, 100, 101, 1_000, 12_345, 2_000_000] {
            let i = bucket_index(us);
            assert!(bucket_upper_us(i) >= us as f64 * 0.999, "{us}us in bucket {i}");
            if i > 0 {
                assert!(bucket_upper_us(i - 1) < us as f64 * 1.001);
            }
        }
    }

    #[test]
    fn quantiles_are_monotone_and_close() {
        let mut b = Bucket::empty(0);
        // 1ms..=100ms
        for ms in 1..=100u64 {
            b.record_latency(ms * 1000);
        }
        let p50 = b.quantile_ms(0.50);
        let p95 = b.quantile_ms(0.95);
        let p99 = b.quantile_ms(0.99);
        assert!(p50 <= p95 && p95 <= p99);
        // Within one bucket (~19%) of the exact value.
        assert!((50.0..=60.0).contains(&p50), "p50 was {p50}");
        assert!((95.0..=114.0).contains(&p95), "p95 was {p95}");
    }

    #[test]
    fn empty_quantile_is_zero() {
        assert_eq!(Bucket::empty(0).quantile_ms(0.95), 0.0);
    }

    #[test]
    fn window_slides() {
        let mut w = Window::new(5);
        w.bucket_mut(0).completions += 3;
        w.bucket_mut(2).completions += 4;

        assert_eq!(w.merged(2).completions, 7);
        assert_eq!(w.merged(4).completions, 7);
        // Second 0 falls out at second 5.
        assert_eq!(w.merged(5).completions, 4);
        assert_eq!(w.merged(7).completions, 0);
    }

    #[test]
    fn reused_slot_is_reset() {
        let mut w = Window::new(3);
        w.bucket_mut(1).errors += 2;
        // Second 4 maps onto the same slot as second 1.
        w.bucket_mut(4).errors += 1;
        assert_eq!(w.merged(4).errors, 1);
    }
}
