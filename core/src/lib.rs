//! Bayesian state estimation toolbox for landmark localization and lidar/radar tracking
//!
//! This crate provides two self-contained estimators that are driven one measurement tick at a time:
//!
//! - [particle]: a Sequential Monte Carlo (particle) filter that localizes a vehicle's 2-D pose
//!   $(x, y, \theta)$ against a known map of point landmarks.
//! - [kalman]: an Unscented Kalman Filter (UKF) that fuses lidar (Cartesian) and radar (polar)
//!   measurements of a single object into a constant turn rate and velocity (CTRV) state estimate.
//!
//! Neither filter owns any I/O. The caller supplies timestamped measurements and reads back the
//! published estimate. The [sim] module and the `bayesnav` binary are thin replay drivers that read
//! recorded logs from CSV files, push them through a filter, and write the estimates back out.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filters.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides
//!   random number generation for the particle filter's initialization, process noise, and resampling.
//! - [`serde`](https://crates.io/crates/serde): Provides (de)serialization of configurations and log records.
//!
//! ## Crate overview
//!
//! - [config]: Filter and scenario configuration structs with JSON/YAML/TOML file support.
//! - [kalman]: The CTRV unscented Kalman filter.
//! - [linalg]: Linear algebra helpers (symmetrization, Cholesky factors, SPD inverses).
//! - [measurements]: Lidar and radar measurement packages and their measurement models.
//! - [particle]: The landmark particle filter.
//! - [sim]: CSV replay utilities and evaluation metrics (RMSE, NIS consistency).
//!
//! ## CTRV state definition
//!
//! The UKF tracks the five-state constant turn rate and velocity model:
//!
//! $$
//! x = [p_x, p_y, v, \psi, \dot{\psi}]
//! $$
//!
//! Where:
//! - $p_x$ and $p_y$ are the Cartesian position of the object (m).
//! - $v$ is the speed magnitude along the heading (m/s).
//! - $\psi$ is the heading (rad), measured counter-clockwise from the $x$ axis.
//! - $\dot{\psi}$ is the heading rate (rad/s).
//!
//! The motion model over a time step $\Delta t$ with a non-zero heading rate is
//!
//! $$
//! \begin{aligned}
//! p_x(+) &= p_x + \frac{v}{\dot{\psi}} \left( \sin(\psi + \dot{\psi} \Delta t) - \sin\psi \right) \\\\
//! p_y(+) &= p_y + \frac{v}{\dot{\psi}} \left( \cos\psi - \cos(\psi + \dot{\psi} \Delta t) \right) \\\\
//! \psi(+) &= \psi + \dot{\psi} \Delta t
//! \end{aligned}
//! $$
//!
//! and degenerates to straight-line motion when the heading rate is close to zero. The particle
//! filter uses the same closed form for its pose hypotheses, driven by commanded velocity and yaw rate.
//!
//! ## Angle conventions
//!
//! All angular residuals (heading, radar bearing) are normalized into $(-\pi, \pi]$ with [wrap_to_pi]
//! before they enter a mean, covariance, or innovation computation.
pub mod config;
pub mod kalman;
pub mod linalg;
pub mod measurements;
pub mod particle;
pub mod sim;

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Errors raised by the estimators.
///
/// Numerical edge cases that have a well-defined fallback (near-zero yaw rate, near-zero radar range)
/// are handled inline and never surface here. These variants cover calls that cannot be honored
/// without corrupting the filter state; a tick that fails leaves the filter exactly as it was.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("filter has not been initialized")]
    NotInitialized,
    #[error("filter is already initialized")]
    AlreadyInitialized,
    #[error("invalid noise standard deviation: {0}")]
    InvalidNoise(f64),
    #[error("measurement dimension mismatch: expected {expected}, found {found}")]
    MeasurementDimension { expected: usize, found: usize },
    #[error("covariance matrix is not positive definite")]
    NotPositiveDefinite,
    #[error("matrix is singular and cannot be inverted")]
    SingularMatrix,
    #[error("measurement timestamp {timestamp} precedes the previous timestamp {previous}")]
    NonMonotonicTimestamp { previous: i64, timestamp: i64 },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Generic Bayesian filter trait shared by the estimators in this crate.
///
/// Prediction and update signatures differ between a landmark particle filter (commanded velocity
/// and raw observations) and a measurement-driven UKF, so the trait only covers what a caller reads
/// back: the latch state, the point estimate, and its spread.
pub trait BayesianFilter {
    /// Whether the filter has been seeded and is ready for prediction/update.
    fn is_initialized(&self) -> bool;
    /// Current state estimate as a column vector.
    fn get_estimate(&self) -> DVector<f64>;
    /// Uncertainty (covariance) associated with [BayesianFilter::get_estimate].
    fn get_certainty(&self) -> DMatrix<f64>;
}

/// Initialization state machine shared by both filters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterState {
    #[default]
    Uninitialized,
    Ready,
}

/// Wrap an angle to the range $(-\pi, \pi]$ radians
///
/// Angles already inside the range are returned unchanged, so wrapping is idempotent. Non-finite
/// input is passed through untouched.
///
/// # Arguments
/// * `angle` - The angle to be wrapped in radians.
/// # Returns
/// * The wrapped angle, which will be in the range (-π, π] radians.
/// # Example
/// ```rust
/// use bayesnav::wrap_to_pi;
/// use std::f64::consts::PI;
/// let angle = 3.0 * PI / 2.0;
/// let wrapped_angle = wrap_to_pi(angle);
/// assert!((wrapped_angle + PI / 2.0).abs() < 1e-12);
/// assert_eq!(wrap_to_pi(-PI), PI);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    use std::f64::consts::PI;
    if !angle.is_finite() {
        return angle;
    }
    let mut wrapped = angle;
    if wrapped.abs() > 4.0 * PI {
        // Pull large angles close to the range first so the loops below stay short.
        wrapped = wrapped.rem_euclid(2.0 * PI);
    }
    while wrapped > PI {
        wrapped -= 2.0 * PI;
    }
    while wrapped <= -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn wrap_to_pi_keeps_in_range_angles() {
        for angle in [-3.0, -1.0, 0.0, 0.5, 2.5, PI] {
            assert_eq!(wrap_to_pi(angle), angle);
        }
    }

    #[test]
    fn wrap_to_pi_maps_negative_pi_to_pi() {
        assert_eq!(wrap_to_pi(-PI), PI);
        assert_approx_eq!(wrap_to_pi(2.0 * PI + 1.0), 1.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(-2.0 * PI - 1.0), -1.0, 1e-12);
    }

    #[test]
    fn wrap_to_pi_is_idempotent_and_bounded() {
        let mut angle = -50.0;
        while angle < 50.0 {
            let once = wrap_to_pi(angle);
            let twice = wrap_to_pi(once);
            assert_eq!(once, twice, "not idempotent for {angle}");
            assert!(once > -PI && once <= PI, "{angle} wrapped to {once}");
            assert_approx_eq!(once.sin(), angle.sin(), 1e-9);
            assert_approx_eq!(once.cos(), angle.cos(), 1e-9);
            angle += 0.173;
        }
    }

    #[test]
    fn wrap_to_pi_handles_large_and_non_finite_angles() {
        let wrapped = wrap_to_pi(1.0e6);
        assert!(wrapped > -PI && wrapped <= PI);
        assert_approx_eq!(wrapped.sin(), 1.0e6_f64.sin(), 1e-6);
        assert!(wrap_to_pi(f64::NAN).is_nan());
        assert_eq!(wrap_to_pi(f64::INFINITY), f64::INFINITY);
    }
}
