//! # G.711 mu-law
//!
//! Sample conversion between 16-bit linear PCM and 8-bit mu-law, the encoding
//! the carrier uses on the wire. Used to synthesize keepalive noise and to turn
//! recordings into PCM WAV files for archival.

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Encoded mu-law value of digital silence.
pub const SILENCE: u8 = 0xFF;

/// Encode one linear sample as mu-law.
pub fn encode_sample(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };

    let pcm = pcm.min(CLIP) + BIAS;

    // Position of the highest set bit above bit 7 picks the segment.
    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decode one mu-law byte back to linear PCM.
pub fn decode_sample(encoded: u8) -> i16 {
    let value = !encoded;
    let sign = value & 0x80;
    let exponent = ((value >> 4) & 0x07) as i32;
    let mantissa = (value & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

pub fn decode(encoded: &[u8]) -> Vec<i16> {
    encoded.iter().map(|&b| decode_sample(b)).collect()
}
