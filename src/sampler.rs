//! Percentage-based sampling gate

use rand::Rng;

/// Decides whether a query is tracked at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampler {
    percent: u8,
}

impl Sampler {
    /// `percent` is clamped to 0..=100
    pub fn new(percent: u8) -> Self {
        Self {
            percent: percent.min(100),
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn should_sample(&self) -> bool {
        self.should_sample_with(&mut rand::thread_rng())
    }

    pub fn should_sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        match self.percent {
            100 => true,
            0 => false,
            p => rng.gen_range(1..=100u8) <= p,
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(100)
    }
}
