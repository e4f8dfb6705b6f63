#![allow(dead_code)]

use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Exp, Normal, Pareto};

pub const SEED: u64 = 0xC0FFEE;

/// The values fed into a sketch, kept around to compute exact empirical statistics.
pub struct Dataset {
    values: Vec<f64>,
    sorted: bool,
}

impl Dataset {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            sorted: false,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.values.push(value);
        self.sorted = false;
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    /// The empirical quantile at the rank rounded down.
    pub fn lower_quantile(&mut self, q: f64) -> f64 {
        self.sort();
        let rank = q * (self.values.len() - 1) as f64;
        self.values[rank.floor() as usize]
    }

    /// The empirical quantile at the rank rounded up.
    pub fn upper_quantile(&mut self, q: f64) -> f64 {
        self.sort();
        let rank = q * (self.values.len() - 1) as f64;
        self.values[rank.ceil() as usize]
    }

    /// The number of values strictly smaller than `v`.
    pub fn min_rank(&mut self, v: f64) -> i64 {
        self.sort();
        self.values.iter().filter(|&&x| x < v).count() as i64
    }

    /// The number of values smaller than or equal to `v`.
    pub fn max_rank(&mut self, v: f64) -> i64 {
        self.sort();
        self.values.iter().filter(|&&x| x <= v).count() as i64
    }

    pub fn min(&mut self) -> f64 {
        self.sort();
        self.values[0]
    }

    pub fn max(&mut self) -> f64 {
        self.sort();
        self.values[self.values.len() - 1]
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    fn sort(&mut self) {
        if !self.sorted {
            self.values.sort_unstable_by(|a, b| a.partial_cmp(b).expect("dataset values are finite"));
            self.sorted = true;
        }
    }
}

pub fn normal_points(size: usize, mean: f64, std_dev: f64, seed: u64) -> Vec<f64> {
    let distribution = Normal::new(mean, std_dev).expect("normal distribution should be valid");
    let mut rng = SmallRng::seed_from_u64(seed);
    distribution.sample_iter(&mut rng).take(size).collect()
}

pub fn exponential_points(size: usize, rate: f64, seed: u64) -> Vec<f64> {
    let distribution = Exp::new(rate).expect("exponential distribution should be valid");
    let mut rng = SmallRng::seed_from_u64(seed);
    distribution.sample_iter(&mut rng).take(size).collect()
}

/// Samples that roughly correspond to the latency of a typical web service, in microseconds:
/// big hump at the beginning with a long tail, bounded to 15 milliseconds through 10 seconds.
pub fn latency_points(size: usize, seed: u64) -> Vec<f64> {
    let distribution = Pareto::new(1.0, 1.0).expect("pareto distribution should be valid");
    let mut rng = SmallRng::seed_from_u64(seed);
    distribution
        .sample_iter(&mut rng)
        .map(|n| n * 10_000.0)
        .filter(|n| *n > 15_000.0 && *n < 10_000_000.0)
        .take(size)
        .collect()
}
