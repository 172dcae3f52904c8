//! Particle filter localization against a known landmark map.
//!
//! Each particle is a 2-D pose hypothesis $(x, y, \theta)$ in the map frame. A tick consists of
//! a prediction with commanded velocity and yaw rate, a weight update against the landmark
//! observations, and a resampling wheel pass that draws a new population proportionally to weight.
//!
//! Observations arrive in the vehicle frame. Every particle transforms them into the map frame
//! with its own pose,
//!
//! $$
//! \begin{bmatrix} x_m \\\\ y_m \end{bmatrix} =
//! \begin{bmatrix} \cos\theta & -\sin\theta \\\\ \sin\theta & \cos\theta \end{bmatrix}
//! \begin{bmatrix} x_c \\\\ y_c \end{bmatrix} +
//! \begin{bmatrix} x_p \\\\ y_p \end{bmatrix}
//! $$
//!
//! associates each transformed observation with the nearest landmark inside sensor range, and
//! takes the product of the bivariate Gaussian densities of the residuals as its new weight.
use crate::{BayesianFilter, FilterError, FilterState, wrap_to_pi};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::{self, Debug, Display};

/// Landmark id given to an observation that has no landmark within sensor range.
pub const NO_ASSOCIATION: i32 = -1;
/// Yaw rates below this magnitude use the straight-line motion model.
const YAW_RATE_THRESHOLD: f64 = 1e-5;

/// A single weighted pose hypothesis.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Particle {
    pub id: i32,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub weight: f64,
    /// Landmark ids matched on the last weight update (output only).
    pub associations: Vec<i32>,
    /// Map-frame x coordinates of the associated observations (output only).
    pub sense_x: Vec<f64>,
    /// Map-frame y coordinates of the associated observations (output only).
    pub sense_y: Vec<f64>,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("id", &self.id)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("theta", &self.theta)
            .field("weight", &self.weight)
            .finish()
    }
}

/// A landmark observation, or an in-range landmark prediction.
///
/// Observations are in the vehicle frame when delivered by the caller and in the map frame once a
/// particle has transformed them. Predictions are always in the map frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandmarkObs {
    pub id: i32,
    pub x: f64,
    pub y: f64,
}

/// A map landmark.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub id: i32,
    pub x: f64,
    pub y: f64,
}

/// Known landmark map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Map {
    pub landmark_list: Vec<Landmark>,
}
impl Map {
    pub fn new(landmark_list: Vec<Landmark>) -> Self {
        Map { landmark_list }
    }
}

/// How the population is collapsed into a single pose estimate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ParticleAveragingStrategy {
    #[default]
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}

/// Particle filter configuration parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleFilterConfig {
    pub num_particles: usize,
    /// Seed for the filter's random generator.
    pub seed: u64,
    pub averaging_strategy: ParticleAveragingStrategy,
}
impl Default for ParticleFilterConfig {
    fn default() -> Self {
        Self {
            num_particles: 200,
            seed: 42,
            averaging_strategy: ParticleAveragingStrategy::WeightedAverage,
        }
    }
}

/// Landmark particle filter.
///
/// The population size is fixed at construction. All randomness (initial spread, process noise,
/// resampling) comes from the filter's own seeded generator, so two filters built from the same
/// configuration and fed the same inputs produce identical populations.
#[derive(Clone)]
pub struct ParticleFilter {
    num_particles: usize,
    particles: Vec<Particle>,
    averaging_strategy: ParticleAveragingStrategy,
    state: FilterState,
    rng: StdRng,
}
impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        let mut debug = f.debug_struct("ParticleFilter");
        debug
            .field("num_particles", &self.num_particles)
            .field("state", &self.state)
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            );
        if self.is_initialized() {
            let mean = self.get_estimate();
            debug.field(
                "mean_pose",
                &format_args!("({:.3}, {:.3}, {:.3} rad)", mean[0], mean[1], mean[2]),
            );
        }
        debug.finish()
    }
}
impl Default for ParticleFilter {
    fn default() -> Self {
        ParticleFilter::new(ParticleFilterConfig::default())
    }
}
impl ParticleFilter {
    pub fn new(config: ParticleFilterConfig) -> Self {
        ParticleFilter {
            num_particles: config.num_particles,
            particles: Vec::with_capacity(config.num_particles),
            averaging_strategy: config.averaging_strategy,
            state: FilterState::Uninitialized,
            rng: StdRng::seed_from_u64(config.seed),
        }
    }
    pub fn num_particles(&self) -> usize {
        self.num_particles
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    /// Seed the population around an initial pose estimate.
    ///
    /// # Arguments
    /// * `x`, `y`, `theta` - initial pose estimate (e.g. from GPS)
    /// * `std` - standard deviations of the pose estimate `[σx, σy, σθ]`
    pub fn init(&mut self, x: f64, y: f64, theta: f64, std: &[f64; 3]) -> Result<(), FilterError> {
        if self.is_initialized() {
            return Err(FilterError::AlreadyInitialized);
        }
        if self.num_particles == 0 {
            return Err(FilterError::InvalidInput(
                "particle filter needs at least one particle".to_string(),
            ));
        }
        let x_noise = zero_mean_normal(std[0])?;
        let y_noise = zero_mean_normal(std[1])?;
        let theta_noise = zero_mean_normal(std[2])?;
        let mut particles = Vec::with_capacity(self.num_particles);
        for i in 0..self.num_particles {
            particles.push(Particle {
                id: i as i32,
                x: x + x_noise.sample(&mut self.rng),
                y: y + y_noise.sample(&mut self.rng),
                theta: theta + theta_noise.sample(&mut self.rng),
                weight: 1.0,
                ..Particle::default()
            });
        }
        self.particles = particles;
        self.state = FilterState::Ready;
        debug!(
            "Initialized {} particles around ({:.3}, {:.3}, {:.3})",
            self.num_particles, x, y, theta
        );
        Ok(())
    }
    /// Move every particle with the commanded velocity and yaw rate, then add process noise.
    ///
    /// # Arguments
    /// * `delta_t` - elapsed time in seconds
    /// * `std_pos` - process noise standard deviations `[σx, σy, σθ]`
    /// * `velocity` - commanded velocity (m/s)
    /// * `yaw_rate` - commanded yaw rate (rad/s)
    pub fn prediction(
        &mut self,
        delta_t: f64,
        std_pos: &[f64; 3],
        velocity: f64,
        yaw_rate: f64,
    ) -> Result<(), FilterError> {
        self.ensure_ready()?;
        let x_noise = zero_mean_normal(std_pos[0])?;
        let y_noise = zero_mean_normal(std_pos[1])?;
        let theta_noise = zero_mean_normal(std_pos[2])?;
        for particle in &mut self.particles {
            move_particle(particle, delta_t, velocity, yaw_rate);
            particle.x += x_noise.sample(&mut self.rng);
            particle.y += y_noise.sample(&mut self.rng);
            particle.theta += theta_noise.sample(&mut self.rng);
        }
        Ok(())
    }
    /// Assign each observation the id of the nearest predicted landmark.
    ///
    /// Ties keep the first minimum encountered. Observations left without a candidate keep
    /// [NO_ASSOCIATION]. Returns the index into `predicted` of each observation's match, since
    /// landmark ids need not be unique.
    fn data_association(
        predicted: &[LandmarkObs],
        observations: &mut [LandmarkObs],
    ) -> Vec<Option<usize>> {
        let mut matches = Vec::with_capacity(observations.len());
        for observation in observations.iter_mut() {
            let mut min_distance = f64::INFINITY;
            let mut nearest = None;
            for (j, prediction) in predicted.iter().enumerate() {
                let distance = dist(observation.x, observation.y, prediction.x, prediction.y);
                if distance < min_distance {
                    min_distance = distance;
                    nearest = Some(j);
                }
            }
            observation.id = nearest.map_or(NO_ASSOCIATION, |j| predicted[j].id);
            matches.push(nearest);
        }
        matches
    }
    /// Re-weight every particle against the vehicle-frame landmark observations.
    ///
    /// # Arguments
    /// * `sensor_range` - maximum landmark distance considered for association (m)
    /// * `std_landmark` - landmark measurement standard deviations `[σx, σy]`
    /// * `observations` - observations in the vehicle frame
    /// * `map` - known landmark map
    pub fn update_weights(
        &mut self,
        sensor_range: f64,
        std_landmark: &[f64; 2],
        observations: &[LandmarkObs],
        map: &Map,
    ) -> Result<(), FilterError> {
        self.ensure_ready()?;
        for &std in std_landmark {
            if !std.is_finite() || std <= 0.0 {
                return Err(FilterError::InvalidNoise(std));
            }
        }
        let mut unmatched = 0usize;
        for i in 0..self.particles.len() {
            let (p_x, p_y, p_theta) = {
                let p = &self.particles[i];
                (p.x, p.y, p.theta)
            };
            let predictions: Vec<LandmarkObs> = map
                .landmark_list
                .iter()
                .filter(|l| dist(p_x, p_y, l.x, l.y) <= sensor_range)
                .map(|l| LandmarkObs {
                    id: l.id,
                    x: l.x,
                    y: l.y,
                })
                .collect();
            let (sin_theta, cos_theta) = p_theta.sin_cos();
            let mut transformed: Vec<LandmarkObs> = observations
                .iter()
                .map(|o| LandmarkObs {
                    id: o.id,
                    x: cos_theta * o.x - sin_theta * o.y + p_x,
                    y: sin_theta * o.x + cos_theta * o.y + p_y,
                })
                .collect();
            let matches = Self::data_association(&predictions, &mut transformed);

            let mut weight = 1.0;
            let mut associations = Vec::with_capacity(transformed.len());
            let mut sense_x = Vec::with_capacity(transformed.len());
            let mut sense_y = Vec::with_capacity(transformed.len());
            for (obs, nearest) in transformed.iter().zip(&matches) {
                let Some(landmark) = nearest.map(|j| &predictions[j]) else {
                    unmatched += 1;
                    continue;
                };
                weight *= bivariate_gaussian(
                    obs.x - landmark.x,
                    obs.y - landmark.y,
                    std_landmark[0],
                    std_landmark[1],
                );
                associations.push(landmark.id);
                sense_x.push(obs.x);
                sense_y.push(obs.y);
            }
            let particle = std::mem::take(&mut self.particles[i]);
            let mut particle = Self::set_associations(particle, associations, sense_x, sense_y);
            particle.weight = weight;
            self.particles[i] = particle;
        }
        if unmatched > 0 {
            debug!(
                "{} observation(s) across {} particles had no landmark within {} m",
                unmatched,
                self.particles.len(),
                sensor_range
            );
        }
        if self.particles.iter().all(|p| p.weight == 0.0) {
            warn!("All particle weights are zero after the weight update");
        }
        Ok(())
    }
    /// Draw a new population with replacement, proportionally to weight (resampling wheel).
    ///
    /// If every weight is zero the wheel never advances and the whole population becomes copies of
    /// the randomly chosen starting particle.
    pub fn resample(&mut self) -> Result<(), FilterError> {
        self.ensure_ready()?;
        let n = self.particles.len();
        let weights: Vec<f64> = self.particles.iter().map(|p| p.weight).collect();
        let max_weight = weights.iter().cloned().fold(0.0, f64::max);
        if max_weight == 0.0 {
            warn!("Resampling with all-zero weights; population collapses onto one particle");
        }
        let mut index = self.rng.random_range(0..n);
        let mut beta = 0.0;
        let mut new_particles = Vec::with_capacity(n);
        for _ in 0..n {
            beta += self.rng.random::<f64>() * 2.0 * max_weight;
            while beta > weights[index] {
                beta -= weights[index];
                index = (index + 1) % n;
            }
            new_particles.push(self.particles[index].clone());
        }
        self.particles = new_particles;
        Ok(())
    }
    /// Overwrite the particle weights (e.g. from an external likelihood).
    pub fn set_weights(&mut self, weights: &[f64]) -> Result<(), FilterError> {
        if weights.len() != self.particles.len() {
            return Err(FilterError::MeasurementDimension {
                expected: self.particles.len(),
                found: weights.len(),
            });
        }
        if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(FilterError::InvalidInput(format!("invalid weight {bad}")));
        }
        for (particle, &w) in self.particles.iter_mut().zip(weights.iter()) {
            particle.weight = w;
        }
        Ok(())
    }
    /// Effective number of particles, `1 / Σ ŵ²` over the normalized weights.
    pub fn effective_sample_size(&self) -> f64 {
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        if sum <= 0.0 || !sum.is_finite() {
            return 0.0;
        }
        let sum_of_squares: f64 = self
            .particles
            .iter()
            .map(|p| (p.weight / sum) * (p.weight / sum))
            .sum();
        1.0 / sum_of_squares
    }
    /// Particle with the highest weight (first one on ties).
    pub fn best_particle(&self) -> Option<&Particle> {
        self.particles
            .iter()
            .reduce(|best, p| if p.weight > best.weight { p } else { best })
    }
    /// Attach a finished association to a particle.
    ///
    /// # Arguments
    /// * `particle` - the particle to annotate
    /// * `associations` - landmark id of each association
    /// * `sense_x`, `sense_y` - map-frame coordinates of each associated observation
    pub fn set_associations(
        mut particle: Particle,
        associations: Vec<i32>,
        sense_x: Vec<f64>,
        sense_y: Vec<f64>,
    ) -> Particle {
        particle.associations = associations;
        particle.sense_x = sense_x;
        particle.sense_y = sense_y;
        particle
    }
    /// Space separated landmark ids of the particle's associations.
    pub fn get_associations(best: &Particle) -> String {
        join_values(&best.associations)
    }
    pub fn get_sense_x(best: &Particle) -> String {
        join_values(&best.sense_x)
    }
    pub fn get_sense_y(best: &Particle) -> String {
        join_values(&best.sense_y)
    }
    fn ensure_ready(&self) -> Result<(), FilterError> {
        match self.state {
            FilterState::Ready => Ok(()),
            FilterState::Uninitialized => Err(FilterError::NotInitialized),
        }
    }
}
impl BayesianFilter for ParticleFilter {
    fn is_initialized(&self) -> bool {
        self.state == FilterState::Ready
    }
    fn get_estimate(&self) -> DVector<f64> {
        match self.averaging_strategy {
            ParticleAveragingStrategy::WeightedAverage => {
                let (mean, _cov) = ParticleAveragingStrategy::weighted_average_state(self);
                mean
            }
            ParticleAveragingStrategy::UnweightedAverage => {
                let (mean, _cov) = ParticleAveragingStrategy::unweighted_average_state(self);
                mean
            }
            ParticleAveragingStrategy::HighestWeight => {
                let (mean, _cov) = ParticleAveragingStrategy::highest_weight_state(self);
                mean
            }
        }
    }
    fn get_certainty(&self) -> DMatrix<f64> {
        match self.averaging_strategy {
            ParticleAveragingStrategy::WeightedAverage => {
                let (_mean, cov) = ParticleAveragingStrategy::weighted_average_state(self);
                cov
            }
            ParticleAveragingStrategy::UnweightedAverage => {
                let (_mean, cov) = ParticleAveragingStrategy::unweighted_average_state(self);
                cov
            }
            ParticleAveragingStrategy::HighestWeight => {
                let (_mean, cov) = ParticleAveragingStrategy::highest_weight_state(self);
                cov
            }
        }
    }
}

// Helper averaging implementations for the pose estimate
impl ParticleAveragingStrategy {
    fn weighted_average_state(pf: &ParticleFilter) -> (DVector<f64>, DMatrix<f64>) {
        let total: f64 = pf.particles.iter().map(|p| p.weight).sum();
        if total <= 0.0 || !total.is_finite() {
            return Self::unweighted_average_state(pf);
        }
        let weights: Vec<f64> = pf.particles.iter().map(|p| p.weight / total).collect();
        pose_moments(&pf.particles, &weights)
    }
    fn unweighted_average_state(pf: &ParticleFilter) -> (DVector<f64>, DMatrix<f64>) {
        let n = pf.particles.len().max(1) as f64;
        let weights = vec![1.0 / n; pf.particles.len()];
        pose_moments(&pf.particles, &weights)
    }
    fn highest_weight_state(pf: &ParticleFilter) -> (DVector<f64>, DMatrix<f64>) {
        let mean = match pf.best_particle() {
            Some(best) => DVector::from_vec(vec![best.x, best.y, best.theta]),
            None => DVector::zeros(3),
        };
        (mean, DMatrix::zeros(3, 3))
    }
}

/// Weighted mean and scatter of the particle poses. Heading is averaged on the circle.
fn pose_moments(particles: &[Particle], weights: &[f64]) -> (DVector<f64>, DMatrix<f64>) {
    let mut mean = DVector::<f64>::zeros(3);
    let (mut sin_sum, mut cos_sum) = (0.0, 0.0);
    for (p, w) in particles.iter().zip(weights) {
        mean[0] += w * p.x;
        mean[1] += w * p.y;
        sin_sum += w * p.theta.sin();
        cos_sum += w * p.theta.cos();
    }
    mean[2] = sin_sum.atan2(cos_sum);
    let mut cov = DMatrix::<f64>::zeros(3, 3);
    for (p, w) in particles.iter().zip(weights) {
        let diff = DVector::from_vec(vec![
            p.x - mean[0],
            p.y - mean[1],
            wrap_to_pi(p.theta - mean[2]),
        ]);
        cov += *w * &diff * diff.transpose();
    }
    (mean, cov)
}

/// Constant turn rate motion of a single particle, without noise.
fn move_particle(particle: &mut Particle, delta_t: f64, velocity: f64, yaw_rate: f64) {
    if yaw_rate.abs() < YAW_RATE_THRESHOLD {
        particle.x += velocity * delta_t * particle.theta.cos();
    } else {
        let theta_new = particle.theta + yaw_rate * delta_t;
        particle.x += velocity / yaw_rate * (theta_new.sin() - particle.theta.sin());
        particle.y += velocity / yaw_rate * (particle.theta.cos() - theta_new.cos());
        particle.theta = theta_new;
    }
}

fn zero_mean_normal(std: f64) -> Result<Normal<f64>, FilterError> {
    if !std.is_finite() || std < 0.0 {
        return Err(FilterError::InvalidNoise(std));
    }
    Normal::new(0.0, std).map_err(|_| FilterError::InvalidNoise(std))
}

#[inline]
fn dist(x1: f64, y1: f64, x2: f64, y2: f64) -> f64 {
    ((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt()
}

/// Axis-independent bivariate Gaussian density of a residual.
fn bivariate_gaussian(dx: f64, dy: f64, std_x: f64, std_y: f64) -> f64 {
    let normalizer = 1.0 / (2.0 * PI * std_x * std_y);
    let exponent = dx * dx / (2.0 * std_x * std_x) + dy * dy / (2.0 * std_y * std_y);
    normalizer * (-exponent).exp()
}

fn join_values<T: Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn filter_with(num_particles: usize, seed: u64) -> ParticleFilter {
        ParticleFilter::new(ParticleFilterConfig {
            num_particles,
            seed,
            ..ParticleFilterConfig::default()
        })
    }

    fn obs(id: i32, x: f64, y: f64) -> LandmarkObs {
        LandmarkObs { id, x, y }
    }

    #[test]
    fn init_creates_fixed_population() {
        let mut pf = ParticleFilter::default();
        assert!(!pf.is_initialized());
        pf.init(4.0, 5.0, 0.5, &[0.3, 0.3, 0.01]).unwrap();
        assert!(pf.is_initialized());
        assert_eq!(pf.particles().len(), 200);
        for (i, p) in pf.particles().iter().enumerate() {
            assert_eq!(p.id, i as i32);
            assert_eq!(p.weight, 1.0);
            assert!((p.x - 4.0).abs() < 3.0);
            assert!((p.theta - 0.5).abs() < 0.1);
        }
    }

    #[test]
    fn init_with_zero_noise_places_particles_on_pose() {
        let mut pf = filter_with(10, 1);
        pf.init(1.0, 2.0, 0.3, &[0.0, 0.0, 0.0]).unwrap();
        for p in pf.particles() {
            assert_eq!((p.x, p.y, p.theta), (1.0, 2.0, 0.3));
        }
    }

    #[test]
    fn init_twice_is_rejected() {
        let mut pf = filter_with(5, 1);
        pf.init(0.0, 0.0, 0.0, &[1.0, 1.0, 0.1]).unwrap();
        assert_eq!(
            pf.init(0.0, 0.0, 0.0, &[1.0, 1.0, 0.1]),
            Err(FilterError::AlreadyInitialized)
        );
        assert_eq!(pf.particles().len(), 5);
    }

    #[test]
    fn init_rejects_negative_noise_without_changing_state() {
        let mut pf = filter_with(5, 1);
        assert_eq!(
            pf.init(0.0, 0.0, 0.0, &[1.0, -1.0, 0.1]),
            Err(FilterError::InvalidNoise(-1.0))
        );
        assert!(!pf.is_initialized());
        assert!(pf.particles().is_empty());
    }

    #[test]
    fn same_seed_gives_same_population() {
        let mut a = filter_with(50, 99);
        let mut b = filter_with(50, 99);
        a.init(0.0, 0.0, 0.0, &[1.0, 1.0, 0.5]).unwrap();
        b.init(0.0, 0.0, 0.0, &[1.0, 1.0, 0.5]).unwrap();
        a.prediction(0.1, &[0.3, 0.3, 0.01], 5.0, 0.2).unwrap();
        b.prediction(0.1, &[0.3, 0.3, 0.01], 5.0, 0.2).unwrap();
        assert_eq!(a.particles(), b.particles());
    }

    #[test]
    fn calls_before_init_fail() {
        let mut pf = filter_with(5, 1);
        assert_eq!(
            pf.prediction(0.1, &[0.1, 0.1, 0.1], 1.0, 0.0),
            Err(FilterError::NotInitialized)
        );
        assert_eq!(
            pf.update_weights(50.0, &[0.3, 0.3], &[], &Map::default()),
            Err(FilterError::NotInitialized)
        );
        assert_eq!(pf.resample(), Err(FilterError::NotInitialized));
    }

    #[test]
    fn straight_line_prediction() {
        let mut pf = filter_with(3, 1);
        pf.init(2.0, 3.0, 0.4, &[0.0, 0.0, 0.0]).unwrap();
        pf.prediction(1.0, &[0.0, 0.0, 0.0], 10.0, 0.0).unwrap();
        assert_eq!(pf.particles().len(), pf.num_particles());
        for p in pf.particles() {
            assert_approx_eq!(p.x, 2.0 + 10.0 * 0.4_f64.cos(), 1e-12);
            assert_eq!(p.y, 3.0);
            assert_eq!(p.theta, 0.4);
        }
    }

    #[test]
    fn turning_prediction() {
        let mut pf = filter_with(2, 1);
        pf.init(0.0, 0.0, 0.0, &[0.0, 0.0, 0.0]).unwrap();
        pf.prediction(1.0, &[0.0, 0.0, 0.0], 2.0, 0.5).unwrap();
        assert_eq!(pf.particles().len(), 2);
        for p in pf.particles() {
            assert_approx_eq!(p.x, 4.0 * 0.5_f64.sin(), 1e-12);
            assert_approx_eq!(p.y, 4.0 * (1.0 - 0.5_f64.cos()), 1e-12);
            assert_approx_eq!(p.theta, 0.5, 1e-12);
        }
    }

    #[test]
    fn prediction_rejects_invalid_noise() {
        let mut pf = filter_with(2, 1);
        pf.init(0.0, 0.0, 0.0, &[0.0, 0.0, 0.0]).unwrap();
        assert!(matches!(
            pf.prediction(1.0, &[0.1, f64::NAN, 0.1], 1.0, 0.0),
            Err(FilterError::InvalidNoise(_))
        ));
        assert_eq!(pf.particles()[0].x, 0.0);
    }

    #[test]
    fn data_association_picks_nearest_first_on_ties() {
        let predicted = vec![obs(1, 0.0, 0.0), obs(2, 2.0, 0.0), obs(3, 10.0, 10.0)];
        let mut observations = vec![obs(0, 1.0, 0.0), obs(0, 9.0, 9.5), obs(0, 2.2, 0.1)];
        let matches = ParticleFilter::data_association(&predicted, &mut observations);
        assert_eq!(matches, vec![Some(0), Some(2), Some(1)]);
        assert_eq!(observations[0].id, 1);
        assert_eq!(observations[1].id, 3);
        assert_eq!(observations[2].id, 2);
    }

    #[test]
    fn data_association_without_candidates_uses_sentinel() {
        let mut observations = vec![obs(7, 1.0, 1.0)];
        let matches = ParticleFilter::data_association(&[], &mut observations);
        assert_eq!(matches, vec![None]);
        assert_eq!(observations[0].id, NO_ASSOCIATION);
    }

    #[test]
    fn update_weights_with_exact_observations() {
        let mut pf = filter_with(4, 3);
        pf.init(1.0, 1.0, PI / 2.0, &[0.0, 0.0, 0.0]).unwrap();
        let map = Map::new(vec![
            Landmark { id: 1, x: 1.0, y: 6.0 },
            Landmark { id: 2, x: -2.0, y: 1.0 },
            Landmark { id: 3, x: 100.0, y: 100.0 },
        ]);
        // Heading +y: landmark 1 is 5 m ahead, landmark 2 is 3 m to the left.
        let observations = vec![obs(0, 5.0, 0.0), obs(0, 0.0, 3.0)];
        pf.update_weights(50.0, &[0.3, 0.3], &observations, &map)
            .unwrap();
        let expected = (1.0 / (2.0 * PI * 0.09)).powi(2);
        for p in pf.particles() {
            assert_approx_eq!(p.weight, expected, 1e-9);
            assert_eq!(p.associations, vec![1, 2]);
            assert_approx_eq!(p.sense_x[0], 1.0, 1e-9);
            assert_approx_eq!(p.sense_y[0], 6.0, 1e-9);
        }
        let best = pf.best_particle().unwrap();
        assert_eq!(ParticleFilter::get_associations(best), "1 2");
    }

    #[test]
    fn update_weights_penalizes_offset_particles() {
        let mut pf = filter_with(100, 5);
        pf.init(0.0, 0.0, 0.0, &[1.0, 1.0, 0.05]).unwrap();
        let map = Map::new(vec![
            Landmark { id: 1, x: 5.0, y: 0.0 },
            Landmark { id: 2, x: 0.0, y: 5.0 },
        ]);
        let observations = vec![obs(0, 5.0, 0.0), obs(0, 0.0, 5.0)];
        pf.update_weights(20.0, &[0.3, 0.3], &observations, &map)
            .unwrap();
        assert_eq!(pf.particles().len(), 100);
        assert!(pf.particles().iter().all(|p| p.weight >= 0.0));
        let best = pf.best_particle().unwrap();
        let worst = pf
            .particles()
            .iter()
            .reduce(|w, p| if p.weight < w.weight { p } else { w })
            .unwrap();
        assert!(best.x.hypot(best.y) <= worst.x.hypot(worst.y));
    }

    #[test]
    fn update_weights_uses_nearest_landmark_when_ids_repeat() {
        let mut pf = filter_with(1, 1);
        pf.init(0.0, 0.0, 0.0, &[0.0, 0.0, 0.0]).unwrap();
        let map = Map::new(vec![
            Landmark { id: 1, x: 5.0, y: 0.0 },
            Landmark { id: 1, x: 0.0, y: 5.0 },
        ]);
        pf.update_weights(50.0, &[0.3, 0.3], &[obs(0, 0.0, 5.0)], &map)
            .unwrap();
        let p = &pf.particles()[0];
        assert_approx_eq!(p.weight, 1.0 / (2.0 * PI * 0.09), 1e-9);
        assert_eq!(p.associations, vec![1]);
        assert_approx_eq!(p.sense_y[0], 5.0, 1e-12);
    }

    #[test]
    fn unmatched_observations_are_skipped() {
        let mut pf = filter_with(3, 1);
        pf.init(0.0, 0.0, 0.0, &[0.0, 0.0, 0.0]).unwrap();
        let map = Map::new(vec![Landmark { id: 1, x: 500.0, y: 0.0 }]);
        pf.update_weights(50.0, &[0.3, 0.3], &[obs(0, 1.0, 1.0)], &map)
            .unwrap();
        for p in pf.particles() {
            assert_eq!(p.weight, 1.0);
            assert!(p.associations.is_empty());
        }
    }

    #[test]
    fn update_weights_rejects_zero_landmark_noise() {
        let mut pf = filter_with(3, 1);
        pf.init(0.0, 0.0, 0.0, &[0.0, 0.0, 0.0]).unwrap();
        assert_eq!(
            pf.update_weights(50.0, &[0.0, 0.3], &[], &Map::default()),
            Err(FilterError::InvalidNoise(0.0))
        );
    }

    #[test]
    fn resample_keeps_population_and_selects_dominant_particle() {
        let mut pf = filter_with(20, 11);
        pf.init(0.0, 0.0, 0.0, &[1.0, 1.0, 0.1]).unwrap();
        let mut weights = vec![0.0; 20];
        weights[13] = 1.0;
        pf.set_weights(&weights).unwrap();
        pf.resample().unwrap();
        assert_eq!(pf.particles().len(), 20);
        assert!(pf.particles().iter().all(|p| p.id == 13));
    }

    #[test]
    fn resample_with_all_zero_weights_collapses_to_start_particle() {
        let mut pf = filter_with(15, 2);
        pf.init(0.0, 0.0, 0.0, &[1.0, 1.0, 0.1]).unwrap();
        pf.set_weights(&[0.0; 15]).unwrap();
        pf.resample().unwrap();
        assert_eq!(pf.particles().len(), 15);
        let first = pf.particles()[0].id;
        assert!(pf.particles().iter().all(|p| p.id == first));
    }

    #[test]
    fn set_weights_validates_input() {
        let mut pf = filter_with(3, 1);
        pf.init(0.0, 0.0, 0.0, &[0.0, 0.0, 0.0]).unwrap();
        assert!(pf.set_weights(&[1.0, 1.0]).is_err());
        assert!(pf.set_weights(&[1.0, -1.0, 1.0]).is_err());
        assert!(pf.set_weights(&[1.0, 2.0, 3.0]).is_ok());
    }

    #[test]
    fn effective_sample_size_bounds() {
        let mut pf = filter_with(10, 1);
        pf.init(0.0, 0.0, 0.0, &[0.0, 0.0, 0.0]).unwrap();
        assert_approx_eq!(pf.effective_sample_size(), 10.0, 1e-9);
        let mut weights = vec![0.0; 10];
        weights[0] = 3.0;
        pf.set_weights(&weights).unwrap();
        assert_approx_eq!(pf.effective_sample_size(), 1.0, 1e-12);
    }

    #[test]
    fn association_helpers_format_text() {
        let p = ParticleFilter::set_associations(
            Particle {
                associations: vec![9],
                sense_x: vec![9.0],
                sense_y: vec![9.0],
                ..Particle::default()
            },
            vec![1, 5, 12],
            vec![1.5, 2.0, -3.25],
            vec![0.5, 4.0, 7.0],
        );
        assert_eq!(ParticleFilter::get_associations(&p), "1 5 12");
        assert_eq!(ParticleFilter::get_sense_x(&p), "1.5 2 -3.25");
        assert_eq!(ParticleFilter::get_sense_y(&p), "0.5 4 7");
        assert_eq!(ParticleFilter::get_associations(&Particle::default()), "");
    }

    #[test]
    fn weighted_estimate_and_highest_weight_strategy() {
        let mut pf = filter_with(2, 1);
        pf.init(0.0, 0.0, 0.0, &[0.0, 0.0, 0.0]).unwrap();
        pf.particles[1].x = 4.0;
        pf.particles[1].theta = 0.2;
        pf.set_weights(&[1.0, 3.0]).unwrap();
        let estimate = pf.get_estimate();
        assert_approx_eq!(estimate[0], 3.0, 1e-12);
        assert_approx_eq!(estimate[1], 0.0, 1e-12);
        assert!(estimate[2] > 0.1 && estimate[2] < 0.2);
        let cov = pf.get_certainty();
        assert_approx_eq!(cov[(0, 0)], 0.25 * 9.0 + 0.75 * 1.0, 1e-12);

        pf.averaging_strategy = ParticleAveragingStrategy::HighestWeight;
        let best = pf.get_estimate();
        assert_eq!(best[0], 4.0);
        assert_eq!(pf.get_certainty(), DMatrix::zeros(3, 3));
    }

    #[test]
    fn heading_average_wraps_around_pi() {
        let mut pf = filter_with(2, 1);
        pf.init(0.0, 0.0, PI - 0.1, &[0.0, 0.0, 0.0]).unwrap();
        pf.particles[1].theta = -PI + 0.1;
        let estimate = pf.get_estimate();
        assert_approx_eq!(estimate[2].abs(), PI, 1e-9);
    }
}
