use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("register block too short, expected {expected} words but got {got}")]
    ShortBlock { expected: usize, got: usize },
}

/// Decode an IEEE754 float32 stored high word first in two registers
pub fn decode_f32(words: &[u16]) -> Result<f64, DecodeError> {
    if words.len() < 2 {
        return Err(DecodeError::ShortBlock { expected: 2, got: words.len() });
    }

    let bits = u32::from(words[0]) << 16 | u32::from(words[1]);
    return Ok(f32::from_bits(bits) as f64);
}

/// Inverse of [`decode_f32`], mostly useful to fake meters
pub fn encode_f32(value: f64) -> [u16; 2] {
    let bits = (value as f32).to_bits();
    return [(bits >> 16) as u16, (bits & 0xFFFF) as u16];
}
