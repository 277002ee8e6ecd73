use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of simulated measurement values.
pub trait ValueSource: Send + 'static {
    fn generate(&mut self, min: f64, max: f64) -> f64;
}

/// Uniform generator over `[min, max)`, owned by a single device loop.
///
/// Seeded once at construction, so concurrent loops never share state.
#[derive(Debug)]
pub struct RandomValueGenerator {
    rng: StdRng,
}

impl RandomValueGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Random starting point for a loop's correlation counter.
    pub fn serial_seed(&mut self, span: u64) -> u64 {
        self.rng.gen_range(0..span.max(1))
    }
}

impl Default for RandomValueGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueSource for RandomValueGenerator {
    fn generate(&mut self, min: f64, max: f64) -> f64 {
        // Empty, inverted or unbounded ranges collapse to `min`
        if max <= min || !(max - min).is_finite() {
            return min;
        }
        self.rng.gen_range(min..max)
    }
}

/// Always yields the same value, ignoring the range.
#[derive(Debug, Clone, Copy)]
pub struct FixedValue(pub f64);

impl ValueSource for FixedValue {
    fn generate(&mut self, _min: f64, _max: f64) -> f64 {
        self.0
    }
}
