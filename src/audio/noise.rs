//! # Background Noise Generation
//!
//! Carriers drop calls when the outbound stream goes silent, so whenever the
//! orchestration service has nothing to say the gateway fills the gap with
//! low-level comfort noise. Each chunk lasts exactly one keepalive interval.
//!
//! ## How the noise is shaped:
//! 1. Draw uniform white noise in `[-amplitude, amplitude]`
//! 2. Run it through a one-pole low-pass so it sounds like line hiss
//! 3. Encode every sample as mu-law

use crate::audio::g711;
use crate::config::AudioConfig;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Smoothing factor of the low-pass filter (0 = frozen, 1 = raw white noise).
const SMOOTHING: f32 = 0.35;

/// Produces fixed-duration mu-law noise chunks.
///
/// One generator belongs to one call and is only touched by the audio
/// downlink task, so it carries its own RNG and filter state without locking.
pub struct BackgroundNoiseGenerator {
    rng: SmallRng,
    chunk_len: usize,
    amplitude: i16,
    filter_state: f32,
}

impl BackgroundNoiseGenerator {
    pub fn new(config: &AudioConfig) -> Self {
        Self::with_rng(config, SmallRng::from_entropy())
    }

    /// Deterministic generator for tests.
    pub fn seeded(config: &AudioConfig, seed: u64) -> Self {
        Self::with_rng(config, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(config: &AudioConfig, rng: SmallRng) -> Self {
        Self {
            rng,
            chunk_len: config.chunk_len().max(1),
            amplitude: config.noise_amplitude.max(0),
            filter_state: 0.0,
        }
    }

    /// Length in bytes of every chunk this generator produces.
    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Generate the next noise chunk.
    ///
    /// Filter state carries over between chunks so consecutive chunks join
    /// without an audible click.
    pub fn next_chunk(&mut self) -> Vec<u8> {
        if self.amplitude == 0 {
            return vec![g711::SILENCE; self.chunk_len];
        }

        let amplitude = self.amplitude as f32;
        let mut chunk = Vec::with_capacity(self.chunk_len);
        for _ in 0..self.chunk_len {
            let white: f32 = self.rng.gen_range(-amplitude..=amplitude);
            self.filter_state += SMOOTHING * (white - self.filter_state);
            chunk.push(g711::encode_sample(self.filter_state.round() as i16));
        }
        chunk
    }
}
