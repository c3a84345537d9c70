//! Complex baseband samples.

/// One complex (I/Q) baseband sample, as delivered by the radio front end.
///
/// Matches the GNU Radio `complex64` layout: two little-endian `f32`s,
/// in-phase first.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IqSample {
    pub re: f32,
    pub im: f32,
}

impl IqSample {
    pub const SIZE: usize = 8;

    pub const fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    /// Squared magnitude `|s|^2`, computed in `f64`.
    #[inline]
    pub fn norm_sqr(&self) -> f64 {
        let re = self.re as f64;
        let im = self.im as f64;
        re * re + im * im
    }

    /// Decodes one sample from 8 bytes of interleaved little-endian `f32`.
    pub fn from_le_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let re = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let im = f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self { re, im }
    }

    pub fn to_le_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.re.to_le_bytes());
        out[4..].copy_from_slice(&self.im.to_le_bytes());
        out
    }
}
