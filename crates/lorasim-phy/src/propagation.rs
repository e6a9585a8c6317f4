//! Log-distance path loss, shadowing, thermal noise and fading.

use lorasim_common::ConfigError;
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::{Deserialize, Serialize};

/// Boltzmann constant in J/K.
const BOLTZMANN: f64 = 1.380_649e-23;

/// Log-distance propagation environment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Environment {
    /// Path loss exponent `n`.
    pub path_loss_exponent: f64,
    /// Log-normal shadowing standard deviation in dB.
    pub shadowing_std_db: f64,
    /// Path loss at the reference distance in dB.
    pub reference_loss_db: f64,
    /// Reference distance `d0` in meters.
    pub reference_distance_m: f64,
}

impl Environment {
    pub const URBAN: Environment = Environment::preset(2.08, 3.57, 127.41, 40.0);
    pub const SUBURBAN: Environment = Environment::preset(2.32, 7.08, 128.95, 1000.0);
    pub const RURAL: Environment = Environment::preset(2.0, 2.0, 113.0, 1.0);
    pub const INDOOR: Environment = Environment::preset(3.5, 7.0, 127.41, 40.0);
    /// FLoRa reference profile.
    pub const FLORA: Environment = Environment::preset(2.7, 3.57, 127.41, 40.0);
    pub const URBAN_DENSE: Environment = Environment::preset(3.0, 8.0, 127.41, 40.0);

    const fn preset(n: f64, sigma: f64, pl_d0: f64, d0: f64) -> Self {
        Environment {
            path_loss_exponent: n,
            shadowing_std_db: sigma,
            reference_loss_db: pl_d0,
            reference_distance_m: d0,
        }
    }

    /// Look up a preset by name.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "urban" => Ok(Self::URBAN),
            "suburban" => Ok(Self::SUBURBAN),
            "rural" => Ok(Self::RURAL),
            "indoor" => Ok(Self::INDOOR),
            "flora" => Ok(Self::FLORA),
            "urban_dense" => Ok(Self::URBAN_DENSE),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }

    /// Reject non-physical parameter combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.reference_distance_m > 0.0) {
            return Err(ConfigError::invalid("reference_distance_m", "must be positive"));
        }
        if !(self.shadowing_std_db >= 0.0) {
            return Err(ConfigError::invalid("shadowing_std_db", "must not be negative"));
        }
        if !self.path_loss_exponent.is_finite() || !self.reference_loss_db.is_finite() {
            return Err(ConfigError::invalid("environment", "parameters must be finite"));
        }
        Ok(())
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::URBAN
    }
}

/// Mean path loss in dB (no shadowing).
///
/// Distances below one meter are clamped to one meter.
pub fn path_loss(distance_m: f64, environment: &Environment) -> Result<f64, ConfigError> {
    if distance_m < 0.0 || distance_m.is_nan() {
        return Err(ConfigError::NegativeDistance(distance_m));
    }
    let d = distance_m.max(1.0);
    Ok(environment.reference_loss_db
        + 10.0 * environment.path_loss_exponent * (d / environment.reference_distance_m).log10())
}

/// Log-normal shadowing term in dB.
pub fn shadowing_sample<R: Rng>(rng: &mut R, environment: &Environment) -> f64 {
    if environment.shadowing_std_db <= 0.0 {
        return 0.0;
    }
    Normal::new(0.0, environment.shadowing_std_db)
        .map(|n| n.sample(rng))
        .unwrap_or(0.0)
}

/// Thermal noise floor in dBm.
pub fn noise_floor(bandwidth_hz: u32, temperature_k: f64, noise_figure_db: f64) -> f64 {
    10.0 * (BOLTZMANN * temperature_k * 1000.0).log10() + 10.0 * (bandwidth_hz as f64).log10() + noise_figure_db
}

/// Rayleigh multipath gain in dB from `taps` equal-power paths.
///
/// Returns 0 dB for a single path.
pub fn fading_sample<R: Rng>(rng: &mut R, taps: u32) -> f64 {
    if taps <= 1 {
        return 0.0;
    }
    let mut i = 0.0;
    let mut q = 0.0;
    for _ in 0..taps {
        let a: f64 = StandardNormal.sample(rng);
        let b: f64 = StandardNormal.sample(rng);
        i += a;
        q += b;
    }
    let amplitude = (i * i + q * q).sqrt() / (taps as f64).sqrt();
    20.0 * amplitude.max(1e-12).log10()
}

/// First-order autoregressive fading process for one directed link.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedFading {
    value: f64,
    correlation: f64,
    mean_db: f64,
    std_db: f64,
}

impl CorrelatedFading {
    /// `correlation` must lie in 0..=1.
    pub fn new(correlation: f64, mean_db: f64, std_db: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&correlation) {
            return Err(ConfigError::invalid("fading.correlation", format!("{} not in 0..=1", correlation)));
        }
        if !(std_db >= 0.0) {
            return Err(ConfigError::invalid("fading.std_db", "must not be negative"));
        }
        Ok(CorrelatedFading {
            value: mean_db,
            correlation,
            mean_db,
            std_db,
        })
    }

    /// Advance the process and return the new attenuation in dB.
    pub fn next<R: Rng>(&mut self, rng: &mut R) -> f64 {
        let noise = if self.std_db > 0.0 {
            Normal::new(0.0, self.std_db).map(|n| n.sample(rng)).unwrap_or(0.0)
        } else {
            0.0
        };
        self.value = self.correlation * self.value + (1.0 - self.correlation) * self.mean_db + noise;
        self.value
    }

    /// Current value without advancing.
    pub fn value(&self) -> f64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_path_loss_reference_point() {
        let pl = path_loss(40.0, &Environment::URBAN).unwrap();
        assert!((pl - 127.41).abs() < 1e-9);
        let pl_400 = path_loss(400.0, &Environment::URBAN).unwrap();
        assert!((pl_400 - (127.41 + 20.8)).abs() < 1e-9);
    }

    #[test]
    fn test_path_loss_clamps_short_distance() {
        let env = Environment::RURAL;
        assert_eq!(path_loss(0.0, &env).unwrap(), path_loss(1.0, &env).unwrap());
        assert_eq!(path_loss(-1.0, &env), Err(ConfigError::NegativeDistance(-1.0)));
    }

    #[test]
    fn test_environment_presets() {
        assert_eq!(Environment::from_name("suburban").unwrap().reference_distance_m, 1000.0);
        assert_eq!(Environment::from_name("flora").unwrap().path_loss_exponent, 2.7);
        assert!(matches!(
            Environment::from_name("moon"),
            Err(ConfigError::UnknownEnvironment(name)) if name == "moon"
        ));
    }

    #[test]
    fn test_noise_floor_at_290k() {
        let nf = noise_floor(1, 290.0, 0.0);
        assert!((nf + 174.0).abs() < 0.05, "{}", nf);
        let nf125 = noise_floor(125_000, 290.0, 6.0);
        assert!((nf125 - (-117.0)).abs() < 0.1, "{}", nf125);
    }

    #[test]
    fn test_fading_single_tap_is_zero() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(fading_sample(&mut rng, 1), 0.0);
        assert_eq!(fading_sample(&mut rng, 0), 0.0);
        let v = fading_sample(&mut rng, 4);
        assert!(v.is_finite());
    }

    #[test]
    fn test_shadowing_statistics() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let env = Environment::SUBURBAN;
        let n = 20_000;
        let samples: Vec<f64> = (0..n).map(|_| shadowing_sample(&mut rng, &env)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.2, "mean {}", mean);
        assert!((var.sqrt() - 7.08).abs() < 0.2, "std {}", var.sqrt());
    }

    #[test]
    fn test_correlated_fading_without_noise_converges_to_mean() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut f = CorrelatedFading::new(0.5, 4.0, 0.0).unwrap();
        for _ in 0..50 {
            f.next(&mut rng);
        }
        assert!((f.value() - 4.0).abs() < 1e-9);
        assert!(CorrelatedFading::new(1.5, 0.0, 1.0).is_err());
    }
}
