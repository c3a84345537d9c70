//! Sample sources feeding the estimator.

use std::f64::consts::PI;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use linkrate_core::IqSample;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Produces buffers of complex baseband samples.
pub trait SampleSource {
    /// Fills `buf` from the front and returns how many samples were written.
    /// `Ok(0)` means the source is exhausted.
    fn fill(&mut self, buf: &mut [IqSample]) -> io::Result<usize>;
}

/// Triangle sweep of the noise amplitude between two levels.
#[derive(Debug, Clone, Copy)]
pub struct Sweep {
    pub to: f64,
    pub period_samples: u64,
}

/// Unit-power carrier plus complex white Gaussian noise.
///
/// Each noise component has standard deviation `amplitude / sqrt(2)`, so the
/// mean received power is `1 + amplitude²`.
pub struct SimulatedChannel {
    rng: StdRng,
    noise: f64,
    sweep: Option<Sweep>,
    /// Carrier phase increment per sample, radians.
    step: f64,
    phase: f64,
    emitted: u64,
}

impl SimulatedChannel {
    pub fn new(noise: f64, carrier_hz: f64, sample_rate: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            rng,
            noise: noise.abs(),
            sweep: None,
            step: 2.0 * PI * carrier_hz / sample_rate,
            phase: 0.0,
            emitted: 0,
        }
    }

    pub fn with_sweep(mut self, sweep: Sweep) -> Self {
        if sweep.period_samples > 0 {
            self.sweep = Some(sweep);
        }
        self
    }

    /// Noise amplitude at the current sample position.
    pub fn noise_amplitude(&self) -> f64 {
        let Some(sweep) = self.sweep else {
            return self.noise;
        };
        let pos = (self.emitted % sweep.period_samples) as f64 / sweep.period_samples as f64;
        let tri = if pos < 0.5 { pos * 2.0 } else { 2.0 - pos * 2.0 };
        self.noise + (sweep.to.abs() - self.noise) * tri
    }

    /// Expected mean power at the current sample position.
    pub fn expected_power(&self) -> f64 {
        let a = self.noise_amplitude();
        1.0 + a * a
    }
}

/// Box-Muller standard normal.
fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

impl SampleSource for SimulatedChannel {
    fn fill(&mut self, buf: &mut [IqSample]) -> io::Result<usize> {
        let sigma = self.noise_amplitude() / 2f64.sqrt();
        for slot in buf.iter_mut() {
            let re = self.phase.cos() + sigma * standard_normal(&mut self.rng);
            let im = self.phase.sin() + sigma * standard_normal(&mut self.rng);
            *slot = IqSample::new(re as f32, im as f32);
            self.phase = (self.phase + self.step) % (2.0 * PI);
        }
        self.emitted += buf.len() as u64;
        Ok(buf.len())
    }
}

/// Interleaved little-endian `f32` I/Q pairs, as written by GNU Radio's
/// `complex64` file sink.
pub struct FileSource {
    reader: BufReader<Box<dyn Read + Send>>,
}

impl FileSource {
    /// Opens `path`, or standard input for `-`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let inner: Box<dyn Read + Send> = if path.as_os_str() == "-" {
            Box::new(io::stdin())
        } else {
            Box::new(File::open(path)?)
        };
        Ok(Self::from_reader(inner))
    }

    pub fn from_reader(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, reader),
        }
    }
}

impl SampleSource for FileSource {
    fn fill(&mut self, buf: &mut [IqSample]) -> io::Result<usize> {
        let mut raw = [0u8; IqSample::SIZE];
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.reader.read_exact(&mut raw) {
                Ok(()) => *slot = IqSample::from_le_bytes(raw),
                // A trailing partial sample is dropped.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(i),
                Err(e) => return Err(e),
            }
        }
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkrate_core::estimator::instantaneous_power;

    #[test]
    fn simulated_power_matches_noise_level() {
        let mut ch = SimulatedChannel::new(0.5, 1000.0, 32_000.0, Some(7));
        let mut buf = vec![IqSample::default(); 200_000];
        assert_eq!(ch.fill(&mut buf).unwrap(), buf.len());
        let p = instantaneous_power(&buf).unwrap();
        assert!((p - 1.25).abs() < 0.02, "power {p}");
    }

    #[test]
    fn noiseless_channel_is_unit_power() {
        let mut ch = SimulatedChannel::new(0.0, 1000.0, 32_000.0, Some(1));
        let mut buf = vec![IqSample::default(); 1024];
        ch.fill(&mut buf).unwrap();
        let p = instantaneous_power(&buf).unwrap();
        assert!((p - 1.0).abs() < 1e-5);
    }

    #[test]
    fn sweep_is_triangular() {
        let mut ch = SimulatedChannel::new(0.0, 1000.0, 32_000.0, Some(1)).with_sweep(Sweep {
            to: 1.0,
            period_samples: 1000,
        });
        assert_eq!(ch.noise_amplitude(), 0.0);
        let mut buf = vec![IqSample::default(); 500];
        ch.fill(&mut buf).unwrap();
        assert!((ch.noise_amplitude() - 1.0).abs() < 1e-9);
        assert!((ch.expected_power() - 2.0).abs() < 1e-9);
        ch.fill(&mut buf).unwrap();
        assert_eq!(ch.noise_amplitude(), 0.0);
    }

    #[test]
    fn seeded_channels_are_reproducible() {
        let mut a = SimulatedChannel::new(0.3, 1000.0, 32_000.0, Some(42));
        let mut b = SimulatedChannel::new(0.3, 1000.0, 32_000.0, Some(42));
        let mut ba = vec![IqSample::default(); 64];
        let mut bb = vec![IqSample::default(); 64];
        a.fill(&mut ba).unwrap();
        b.fill(&mut bb).unwrap();
        assert_eq!(ba, bb);
    }

    #[test]
    fn file_source_reads_complex64_and_drops_partial_tail() {
        let mut bytes = Vec::new();
        for s in [IqSample::new(1.0, -1.0), IqSample::new(0.5, 0.25)] {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes.extend_from_slice(&[0xAB; 5]);
        let mut src = FileSource::from_reader(Box::new(io::Cursor::new(bytes)));

        let mut buf = vec![IqSample::default(); 4];
        assert_eq!(src.fill(&mut buf).unwrap(), 2);
        assert_eq!(buf[0], IqSample::new(1.0, -1.0));
        assert_eq!(buf[1], IqSample::new(0.5, 0.25));
        assert_eq!(src.fill(&mut buf).unwrap(), 0);
    }

    #[test]
    fn missing_file_is_error() {
        assert!(FileSource::open(Path::new("/nonexistent/iq.cf32")).is_err());
    }
}
