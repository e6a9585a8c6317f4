//! Position sources: where a radio is at a given simulation time.
//!
//! Static radios use [`Fixed`]; the other sources replay externally supplied
//! movement. Trajectory generation is out of scope.

use crate::{ConfigError, Position, SimTime};
use serde::{Deserialize, Serialize};

/// Yields the position of a radio at a point in time.
pub trait PositionSource: Send + std::fmt::Debug {
    /// Position at `time`.
    fn position_at(&self, time: SimTime) -> Position;

    /// True if the position never changes.
    fn is_static(&self) -> bool {
        false
    }
}

// ============================================================================
// Sources
// ============================================================================

/// A radio that never moves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fixed(pub Position);

impl PositionSource for Fixed {
    fn position_at(&self, _time: SimTime) -> Position {
        self.0
    }

    fn is_static(&self) -> bool {
        true
    }
}

/// Timed waypoints with linear interpolation, clamped at both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct Waypoints {
    points: Vec<(SimTime, Position)>,
}

impl Waypoints {
    /// Waypoints must be non-empty and strictly increasing in time.
    pub fn new(points: Vec<(SimTime, Position)>) -> Result<Self, ConfigError> {
        if points.is_empty() {
            return Err(ConfigError::invalid("waypoints", "at least one waypoint required"));
        }
        if points.windows(2).any(|w| w[1].0 <= w[0].0) {
            return Err(ConfigError::invalid("waypoints", "times must be strictly increasing"));
        }
        Ok(Waypoints { points })
    }
}

impl PositionSource for Waypoints {
    fn position_at(&self, time: SimTime) -> Position {
        let idx = self.points.partition_point(|(t, _)| *t <= time);
        if idx == 0 {
            return self.points[0].1;
        }
        if idx == self.points.len() {
            return self.points[idx - 1].1;
        }
        let (t0, p0) = self.points[idx - 1];
        let (t1, p1) = self.points[idx];
        let span = (t1 - t0).as_micros() as f64;
        let frac = (time - t0).as_micros() as f64 / span;
        p0.lerp(&p1, frac)
    }

    fn is_static(&self) -> bool {
        self.points.len() == 1
    }
}

/// Polyline walked at constant speed from time zero; stops at the last vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    vertices: Vec<Position>,
    // cumulative length at each vertex
    cumulative_m: Vec<f64>,
    speed_mps: f64,
}

impl Path {
    /// Create a path. Speed must be positive and finite.
    pub fn new(vertices: Vec<Position>, speed_mps: f64) -> Result<Self, ConfigError> {
        if vertices.is_empty() {
            return Err(ConfigError::invalid("path", "at least one vertex required"));
        }
        if !(speed_mps.is_finite() && speed_mps > 0.0) {
            return Err(ConfigError::invalid("speed_mps", format!("must be positive, got {}", speed_mps)));
        }
        let mut cumulative_m = Vec::with_capacity(vertices.len());
        let mut acc = 0.0;
        cumulative_m.push(0.0);
        for w in vertices.windows(2) {
            acc += w[0].distance_to(&w[1]);
            cumulative_m.push(acc);
        }
        Ok(Path {
            vertices,
            cumulative_m,
            speed_mps,
        })
    }

    /// Total path length in meters.
    pub fn length_m(&self) -> f64 {
        self.cumulative_m.last().copied().unwrap_or(0.0)
    }
}

impl PositionSource for Path {
    fn position_at(&self, time: SimTime) -> Position {
        let travelled = time.as_secs_f64() * self.speed_mps;
        if travelled >= self.length_m() {
            return self.vertices[self.vertices.len() - 1];
        }
        let idx = self.cumulative_m.partition_point(|d| *d <= travelled);
        let (d0, d1) = (self.cumulative_m[idx - 1], self.cumulative_m[idx]);
        let seg = d1 - d0;
        if seg <= 0.0 {
            return self.vertices[idx];
        }
        self.vertices[idx - 1].lerp(&self.vertices[idx], (travelled - d0) / seg)
    }

    fn is_static(&self) -> bool {
        self.length_m() == 0.0
    }
}

/// Recorded samples, held until the next sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    samples: Vec<(SimTime, Position)>,
}

impl Trace {
    /// Samples must be non-empty; they are sorted by time.
    pub fn new(mut samples: Vec<(SimTime, Position)>) -> Result<Self, ConfigError> {
        if samples.is_empty() {
            return Err(ConfigError::invalid("trace", "at least one sample required"));
        }
        samples.sort_by_key(|(t, _)| *t);
        Ok(Trace { samples })
    }
}

impl PositionSource for Trace {
    fn position_at(&self, time: SimTime) -> Position {
        let idx = self.samples.partition_point(|(t, _)| *t <= time);
        // before the first sample, hold the first one
        self.samples[idx.saturating_sub(1)].1
    }

    fn is_static(&self) -> bool {
        self.samples.len() == 1
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// A timed point in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimedPoint {
    /// Seconds since simulation start.
    pub t: f64,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: Option<f64>,
}

impl TimedPoint {
    fn split(&self) -> Result<(SimTime, Position), ConfigError> {
        let time = SimTime::try_from_secs(self.t)
            .map_err(|_| ConfigError::invalid("t", format!("negative or non-finite time {}", self.t)))?;
        Ok((
            time,
            Position {
                x: self.x,
                y: self.y,
                z: self.z,
            },
        ))
    }
}

/// Configured mobility of a radio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum MobilityConfig {
    /// Timed waypoints.
    Waypoints {
        points: Vec<TimedPoint>,
    },
    /// Polyline at constant speed.
    Path {
        vertices: Vec<Position>,
        speed_mps: f64,
    },
    /// Sample-and-hold trace.
    Trace {
        samples: Vec<TimedPoint>,
    },
}

impl MobilityConfig {
    /// Build the position source described by this configuration.
    pub fn build(&self) -> Result<Box<dyn PositionSource>, ConfigError> {
        Ok(match self {
            MobilityConfig::Waypoints { points } => {
                let points = points.iter().map(TimedPoint::split).collect::<Result<Vec<_>, _>>()?;
                Box::new(Waypoints::new(points)?)
            }
            MobilityConfig::Path { vertices, speed_mps } => Box::new(Path::new(vertices.clone(), *speed_mps)?),
            MobilityConfig::Trace { samples } => {
                let samples = samples.iter().map(TimedPoint::split).collect::<Result<Vec<_>, _>>()?;
                Box::new(Trace::new(samples)?)
            }
        })
    }
}

/// Resolve a radio's position source: mobility if configured, fixed otherwise.
pub fn position_source(fixed: Position, mobility: Option<&MobilityConfig>) -> Result<Box<dyn PositionSource>, ConfigError> {
    match mobility {
        Some(cfg) => cfg.build(),
        None => Ok(Box::new(Fixed(fixed))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> SimTime {
        SimTime::from_secs(s)
    }

    #[test]
    fn test_fixed_is_static() {
        let src = Fixed(Position::new(1.0, 2.0));
        assert!(src.is_static());
        assert_eq!(src.position_at(secs(100.0)), Position::new(1.0, 2.0));
    }

    #[test]
    fn test_waypoints_interpolate_and_clamp() {
        let wp = Waypoints::new(vec![
            (secs(10.0), Position::new(0.0, 0.0)),
            (secs(20.0), Position::new(100.0, 0.0)),
        ])
        .unwrap();
        assert_eq!(wp.position_at(secs(0.0)), Position::new(0.0, 0.0));
        assert!((wp.position_at(secs(15.0)).x - 50.0).abs() < 1e-9);
        assert_eq!(wp.position_at(secs(30.0)), Position::new(100.0, 0.0));
    }

    #[test]
    fn test_waypoints_reject_unsorted() {
        let err = Waypoints::new(vec![
            (secs(2.0), Position::new(0.0, 0.0)),
            (secs(1.0), Position::new(1.0, 0.0)),
        ]);
        assert!(err.is_err());
        assert!(Waypoints::new(vec![]).is_err());
    }

    #[test]
    fn test_path_constant_speed_stops_at_end() {
        let path = Path::new(
            vec![Position::new(0.0, 0.0), Position::new(10.0, 0.0), Position::new(10.0, 10.0)],
            2.0,
        )
        .unwrap();
        assert!((path.length_m() - 20.0).abs() < 1e-9);
        let p = path.position_at(secs(7.5));
        assert!((p.x - 10.0).abs() < 1e-9 && (p.y - 5.0).abs() < 1e-9);
        assert_eq!(path.position_at(secs(60.0)), Position::new(10.0, 10.0));
        assert!(Path::new(vec![Position::new(0.0, 0.0)], 0.0).is_err());
    }

    #[test]
    fn test_trace_sample_and_hold() {
        let trace = Trace::new(vec![
            (secs(5.0), Position::new(5.0, 5.0)),
            (secs(1.0), Position::new(1.0, 1.0)),
        ])
        .unwrap();
        assert_eq!(trace.position_at(secs(0.0)), Position::new(1.0, 1.0));
        assert_eq!(trace.position_at(secs(4.9)), Position::new(1.0, 1.0));
        assert_eq!(trace.position_at(secs(5.0)), Position::new(5.0, 5.0));
    }

    #[test]
    fn test_mobility_config_from_yaml_like_json() {
        let cfg = MobilityConfig::Path {
            vertices: vec![Position::new(0.0, 0.0), Position::new(3.0, 4.0)],
            speed_mps: 1.0,
        };
        let src = position_source(Position::new(9.0, 9.0), Some(&cfg)).unwrap();
        assert!((src.position_at(secs(5.0)).x - 3.0).abs() < 1e-9);
        let fixed = position_source(Position::new(9.0, 9.0), None).unwrap();
        assert!(fixed.is_static());
    }
}
