//! Measurement-related code for the lidar/radar tracking filter.
//!
//! This module defines the measurement package delivered by the caller on every tick and the
//! measurement models that map CTRV states (and sigma-point clouds) into lidar and radar
//! measurement space. The models are used by the [crate::kalman] UKF to build the predicted
//! measurement mean and innovation covariance.

use crate::FilterError;

use std::fmt::{self, Debug, Display};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Radar range below which the range rate is reported as zero instead of dividing by the range.
pub const RADAR_MIN_RANGE: f64 = 1e-4;

/// Sensor that produced a [MeasurementPackage].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    /// Cartesian position measurement `[p_x, p_y]`.
    #[serde(rename = "L", alias = "lidar", alias = "LASER")]
    Lidar,
    /// Polar measurement `[rho, phi, rho_dot]`.
    #[serde(rename = "R", alias = "radar", alias = "RADAR")]
    Radar,
}
impl SensorType {
    /// Number of raw measurement components the sensor reports.
    pub fn dimension(&self) -> usize {
        match self {
            SensorType::Lidar => 2,
            SensorType::Radar => 3,
        }
    }
}
impl Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Lidar => write!(f, "L"),
            SensorType::Radar => write!(f, "R"),
        }
    }
}

/// A single timestamped sensor measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementPackage {
    pub sensor_type: SensorType,
    /// Lidar: `[p_x, p_y]` in meters. Radar: `[rho (m), phi (rad), rho_dot (m/s)]`.
    pub raw_measurements: DVector<f64>,
    /// Timestamp in microseconds.
    pub timestamp: i64,
}
impl MeasurementPackage {
    pub fn lidar(px: f64, py: f64, timestamp: i64) -> Self {
        MeasurementPackage {
            sensor_type: SensorType::Lidar,
            raw_measurements: DVector::from_vec(vec![px, py]),
            timestamp,
        }
    }
    pub fn radar(rho: f64, phi: f64, rho_dot: f64, timestamp: i64) -> Self {
        MeasurementPackage {
            sensor_type: SensorType::Radar,
            raw_measurements: DVector::from_vec(vec![rho, phi, rho_dot]),
            timestamp,
        }
    }
    /// Check the raw vector has the sensor's dimension and only finite entries.
    pub fn validate(&self) -> Result<(), FilterError> {
        let expected = self.sensor_type.dimension();
        let found = self.raw_measurements.len();
        if expected != found {
            return Err(FilterError::MeasurementDimension { expected, found });
        }
        if self.raw_measurements.iter().any(|v| !v.is_finite()) {
            return Err(FilterError::InvalidInput(format!(
                "non-finite {} measurement at {}",
                self.sensor_type, self.timestamp
            )));
        }
        Ok(())
    }
    /// Cartesian position implied by the measurement.
    pub fn position(&self) -> (f64, f64) {
        let z = &self.raw_measurements;
        match self.sensor_type {
            SensorType::Lidar => (z[0], z[1]),
            SensorType::Radar => (z[0] * z[1].cos(), z[0] * z[1].sin()),
        }
    }
}
impl Display for MeasurementPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MeasurementPackage({}, t: {}, z: {:?})",
            self.sensor_type,
            self.timestamp,
            self.raw_measurements.as_slice()
        )
    }
}

/// Generic measurement model trait for the sensors fused by the UKF
pub trait MeasurementModel {
    /// Get the dimension of the measurement vector
    fn get_dimension(&self) -> usize;
    /// Get the measurement noise characteristics in a matrix format
    fn get_noise(&self) -> DMatrix<f64>;
    /// Get the expected measurements from the state. Measurement model function
    /// that maps the state values to measurement space.
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64>;
    /// Row of the measurement vector that holds an angle, if any. Residuals on this
    /// row are wrapped to (-π, π].
    fn angle_index(&self) -> Option<usize> {
        None
    }
    /// Map every column of a state sigma-point matrix into measurement space.
    fn get_sigma_points(&self, state_sigma_points: &DMatrix<f64>) -> DMatrix<f64> {
        let mut measurement_sigma_points =
            DMatrix::<f64>::zeros(self.get_dimension(), state_sigma_points.ncols());
        for (i, sigma_point) in state_sigma_points.column_iter().enumerate() {
            let z = self.get_expected_measurement(&sigma_point.clone_owned());
            measurement_sigma_points.set_column(i, &z);
        }
        measurement_sigma_points
    }
}

/// Lidar measurement model: a linear projection of the position states.
#[derive(Clone, Debug, PartialEq)]
pub struct LidarMeasurementModel {
    pub std_px: f64,
    pub std_py: f64,
}
impl LidarMeasurementModel {
    pub fn new(std_px: f64, std_py: f64) -> Self {
        LidarMeasurementModel { std_px, std_py }
    }
    /// Observation matrix `H` mapping the 5-element CTRV state to `[p_x, p_y]`.
    pub fn observation_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(
            2,
            5,
            &[
                1.0, 0.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, 0.0,
            ],
        )
    }
}
impl Display for LidarMeasurementModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LidarMeasurementModel(std_px: {}, std_py: {})",
            self.std_px, self.std_py
        )
    }
}
impl MeasurementModel for LidarMeasurementModel {
    fn get_dimension(&self) -> usize {
        2
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.std_px.powi(2),
            self.std_py.powi(2),
        ]))
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        self.observation_matrix() * state.rows(0, 5)
    }
    fn get_sigma_points(&self, state_sigma_points: &DMatrix<f64>) -> DMatrix<f64> {
        self.observation_matrix() * state_sigma_points.rows(0, 5)
    }
}

/// Radar measurement model: range, bearing, and range rate of the tracked object.
#[derive(Clone, Debug, PartialEq)]
pub struct RadarMeasurementModel {
    pub std_rho: f64,
    pub std_phi: f64,
    pub std_rho_dot: f64,
}
impl RadarMeasurementModel {
    pub fn new(std_rho: f64, std_phi: f64, std_rho_dot: f64) -> Self {
        RadarMeasurementModel {
            std_rho,
            std_phi,
            std_rho_dot,
        }
    }
}
impl Display for RadarMeasurementModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadarMeasurementModel(std_rho: {}, std_phi: {}, std_rho_dot: {})",
            self.std_rho, self.std_phi, self.std_rho_dot
        )
    }
}
impl MeasurementModel for RadarMeasurementModel {
    fn get_dimension(&self) -> usize {
        3
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.std_rho.powi(2),
            self.std_phi.powi(2),
            self.std_rho_dot.powi(2),
        ]))
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        let (px, py, v, yaw) = (state[0], state[1], state[2], state[3]);
        let rho = (px * px + py * py).sqrt();
        let phi = py.atan2(px);
        let rho_dot = if rho < RADAR_MIN_RANGE {
            0.0
        } else {
            (px * yaw.cos() * v + py * yaw.sin() * v) / rho
        };
        DVector::from_vec(vec![rho, phi, rho_dot])
    }
    fn angle_index(&self) -> Option<usize> {
        Some(1)
    }
}

/// 95% quantile of the chi-squared distribution for the measurement dimensions used here.
///
/// A well tuned filter should produce NIS values above this threshold about 5% of the time.
pub fn chi_squared_95(degrees_of_freedom: usize) -> Option<f64> {
    match degrees_of_freedom {
        1 => Some(3.841),
        2 => Some(5.991),
        3 => Some(7.815),
        4 => Some(9.488),
        5 => Some(11.070),
        _ => None,
    }
}
