//! # Audio
//!
//! Everything the gateway does with audio samples, as opposed to moving them:
//!
//! - **g711**: mu-law sample conversion (the carrier's wire encoding)
//! - **noise**: keepalive comfort noise chunks
//! - **archive**: WAV conversion and recording storage at call end
//!
//! ## Audio Format:
//! - **Encoding**: G.711 mu-law, one byte per sample
//! - **Sample Rate**: 8kHz by default (`audio.sample_rate`)
//! - **Channels**: Mono

pub mod archive;
pub mod g711;
pub mod noise;
