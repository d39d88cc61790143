use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Method used to interpolate covariate values between observations
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum Interpolation {
    /// Linear interpolation between two points with slope and intercept
    Linear { slope: f64, intercept: f64 },
    /// Constant value carried forward
    CarryForward { value: f64 },
}

/// A segment of a piecewise interpolation function for a covariate
#[derive(Serialize, Deserialize, Clone, Debug)]
struct CovariateSegment {
    from: f64,
    to: f64,
    method: Interpolation,
}

impl CovariateSegment {
    #[inline]
    fn in_interval(&self, time: f64) -> bool {
        self.from <= time && time < self.to
    }

    #[inline]
    fn interpolate(&self, time: f64) -> Option<f64> {
        if !self.in_interval(time) {
            return None;
        }
        match self.method {
            Interpolation::Linear { slope, intercept } => Some(slope * time + intercept),
            Interpolation::CarryForward { value } => Some(value),
        }
    }
}

/// A time-varying covariate built from raw (time, value) observations.
///
/// Between observations the value is linearly interpolated unless the
/// covariate is marked `fixed`, in which case it is carried forward. Outside
/// the observed range the nearest observation is carried in both directions,
/// so interpolation is total once at least one observation exists.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Covariate {
    name: String,
    observations: Vec<(f64, f64)>,
    segments: Vec<CovariateSegment>,
    fixed: bool,
}

impl Covariate {
    /// Create a new covariate with the given name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the covariate
    /// * `fixed` - Whether to always use carry-forward interpolation
    pub fn new(name: impl Into<String>, fixed: bool) -> Self {
        Covariate {
            name: name.into(),
            observations: Vec::new(),
            segments: Vec::new(),
            fixed,
        }
    }

    /// Add or overwrite an observation at a specific time
    pub fn add_observation(&mut self, time: f64, value: f64) {
        if let Some(obs) = self.observations.iter_mut().find(|obs| obs.0 == time) {
            obs.1 = value;
        } else {
            self.observations.push((time, value));
        }
        self.build_segments();
    }

    /// Get all raw observations
    pub fn observations(&self) -> &[(f64, f64)] {
        &self.observations
    }

    fn build_segments(&mut self) {
        self.segments.clear();
        if self.observations.is_empty() {
            return;
        }
        self.observations
            .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        for (i, &(time, value)) in self.observations.iter().enumerate() {
            match self.observations.get(i + 1) {
                Some(&(next_time, next_value)) => {
                    let method = if self.fixed || next_time == time {
                        Interpolation::CarryForward { value }
                    } else {
                        let slope = (next_value - value) / (next_time - time);
                        Interpolation::Linear {
                            slope,
                            intercept: value - slope * time,
                        }
                    };
                    self.segments.push(CovariateSegment {
                        from: time,
                        to: next_time,
                        method,
                    });
                }
                None => {
                    self.segments.push(CovariateSegment {
                        from: time,
                        to: f64::INFINITY,
                        method: Interpolation::CarryForward { value },
                    });
                }
            }
        }
    }

    /// Interpolate the covariate value at a specific time.
    ///
    /// Times before the first observation carry the first value backwards.
    /// Returns `None` only if the covariate has no observations.
    #[inline]
    pub fn interpolate(&self, time: f64) -> Option<f64> {
        if let Some(value) = self
            .segments
            .iter()
            .find(|segment| segment.in_interval(time))
            .and_then(|segment| segment.interpolate(time))
        {
            return Some(value);
        }
        self.observations.first().map(|&(_, value)| value)
    }

    /// Get the name of the covariate
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this covariate uses carry-forward interpolation throughout
    pub fn fixed(&self) -> bool {
        self.fixed
    }
}

/// A collection of [Covariate]s for one subject
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Covariates {
    covariates: BTreeMap<String, Covariate>,
}

impl Covariates {
    /// Create a new empty collection of covariates
    pub fn new() -> Self {
        Covariates {
            covariates: BTreeMap::new(),
        }
    }

    /// Add a covariate to the collection
    pub fn add_covariate(&mut self, name: impl Into<String>, covariate: Covariate) {
        self.covariates.insert(name.into(), covariate);
    }

    /// Get access to a specific covariate by name
    pub fn get_covariate(&self, name: &str) -> Option<&Covariate> {
        self.covariates.get(name)
    }

    /// Add an observation to a covariate, creating the covariate if needed
    pub fn add_observation(&mut self, name: &str, time: f64, value: f64) {
        self.covariates
            .entry(name.to_string())
            .or_insert_with(|| Covariate::new(name, false))
            .add_observation(time, value);
    }

    /// Mark a covariate as fixed (carry-forward interpolation)
    pub fn set_covariate_fixed(&mut self, name: &str, fixed: bool) -> bool {
        if let Some(covariate) = self.covariates.get_mut(name) {
            let observations = covariate.observations.clone();
            let mut rebuilt = Covariate::new(name, fixed);
            for (time, value) in observations {
                rebuilt.add_observation(time, value);
            }
            *covariate = rebuilt;
            true
        } else {
            false
        }
    }

    /// Whether the collection has no covariates
    pub fn is_empty(&self) -> bool {
        self.covariates.is_empty()
    }
}

impl fmt::Display for Covariates {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Covariates:")?;
        for covariate in self.covariates.values() {
            writeln!(f, "  {} ({} observations)", covariate.name, covariate.observations.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_interpolation() {
        let mut covariate = Covariate::new("weight", false);
        covariate.add_observation(0.0, 70.0);
        covariate.add_observation(12.0, 72.0);
        covariate.add_observation(24.0, 75.0);

        assert_eq!(covariate.interpolate(0.0), Some(70.0));
        assert_eq!(covariate.interpolate(6.0), Some(71.0));
        assert_eq!(covariate.interpolate(12.0), Some(72.0));
        assert_eq!(covariate.interpolate(18.0), Some(73.5));
        // carried forward after the last observation
        assert_eq!(covariate.interpolate(30.0), Some(75.0));
        // carried backwards before the first
        assert_eq!(covariate.interpolate(-1.0), Some(70.0));
    }

    #[test]
    fn test_fixed_covariate_carries_forward() {
        let mut covariate = Covariate::new("age", true);
        covariate.add_observation(0.0, 35.0);
        covariate.add_observation(12.0, 36.0);

        assert_eq!(covariate.interpolate(6.0), Some(35.0));
        assert_eq!(covariate.interpolate(12.0), Some(36.0));
        assert_eq!(covariate.interpolate(100.0), Some(36.0));
    }

    #[test]
    fn test_empty_covariate() {
        let covariate = Covariate::new("missing", false);
        assert_eq!(covariate.interpolate(1.0), None);
    }

    #[test]
    fn test_collection_creates_on_demand() {
        let mut covariates = Covariates::new();
        covariates.add_observation("bmi", 0.0, 25.0);
        covariates.add_observation("bmi", 12.0, 26.0);

        let bmi = covariates.get_covariate("bmi").unwrap();
        assert_eq!(bmi.interpolate(6.0), Some(25.5));

        // overwriting an existing time rebuilds the segments
        covariates.add_observation("bmi", 12.0, 27.0);
        let bmi = covariates.get_covariate("bmi").unwrap();
        assert_eq!(bmi.interpolate(6.0), Some(26.0));
    }

    #[test]
    fn test_set_fixed_rebuilds() {
        let mut covariates = Covariates::new();
        covariates.add_observation("crcl", 0.0, 90.0);
        covariates.add_observation("crcl", 10.0, 50.0);
        assert_eq!(
            covariates.get_covariate("crcl").unwrap().interpolate(5.0),
            Some(70.0)
        );

        assert!(covariates.set_covariate_fixed("crcl", true));
        assert_eq!(
            covariates.get_covariate("crcl").unwrap().interpolate(5.0),
            Some(90.0)
        );
    }
}
