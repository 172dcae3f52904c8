//! Unscented Kalman filter for lidar/radar object tracking
//!
//! The filter tracks the five-state CTRV model $[p_x, p_y, v, \psi, \dot{\psi}]$ described in the
//! crate root. Process noise enters as two extra states (longitudinal acceleration $\nu_a$ and yaw
//! acceleration $\nu_{\ddot\psi}$), so prediction works on a seven-dimensional augmented state and
//! a fixed cloud of fifteen sigma points with spreading parameter $\lambda = 3 - n_{aug}$.
//!
//! Each call to [UnscentedKalmanFilter::process_measurement] is one tick. The first tick seeds the
//! state from the measurement. Later ticks predict forward by the timestamp difference and then
//! apply the lidar (linear) or radar (polar) update. A tick either fully succeeds or leaves the
//! filter untouched.

use crate::linalg::{cholesky_lower, spd_inverse, symmetrize};
use crate::measurements::{
    LidarMeasurementModel, MeasurementModel, MeasurementPackage, RadarMeasurementModel, SensorType,
};
use crate::{BayesianFilter, FilterError, FilterState, wrap_to_pi};

use std::fmt::{self, Debug, Display};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// CTRV state dimension.
pub const N_X: usize = 5;
/// Augmented state dimension (state plus the two process noise terms).
pub const N_AUG: usize = 7;
/// Number of sigma points, `2 * N_AUG + 1`.
pub const N_SIGMA: usize = 2 * N_AUG + 1;
/// Heading rates at or below this magnitude propagate with the straight-line model.
const YAW_RATE_THRESHOLD: f64 = 1e-3;
/// Index of the heading in the state vector.
const YAW_INDEX: usize = 3;

/// UKF configuration parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UkfConfig {
    /// Longitudinal acceleration process noise (m/s²)
    pub std_a: f64,
    /// Yaw acceleration process noise (rad/s²)
    pub std_yawdd: f64,
    /// Lidar x position noise (m)
    pub std_laspx: f64,
    /// Lidar y position noise (m)
    pub std_laspy: f64,
    /// Radar range noise (m)
    pub std_radr: f64,
    /// Radar bearing noise (rad)
    pub std_radphi: f64,
    /// Radar range rate noise (m/s)
    pub std_radrd: f64,
    pub use_laser: bool,
    pub use_radar: bool,
    /// Diagonal of the covariance set on initialization.
    pub initial_covariance_diagonal: [f64; N_X],
}
impl Default for UkfConfig {
    fn default() -> Self {
        UkfConfig {
            std_a: 30.0,
            std_yawdd: 30.0,
            std_laspx: 0.15,
            std_laspy: 0.15,
            std_radr: 0.3,
            std_radphi: 0.03,
            std_radrd: 0.3,
            use_laser: true,
            use_radar: true,
            initial_covariance_diagonal: [1.0; N_X],
        }
    }
}
impl UkfConfig {
    /// Check that every noise value is finite and non-negative and the initial covariance is
    /// positive.
    pub fn validate(&self) -> Result<(), FilterError> {
        for std in [
            self.std_a,
            self.std_yawdd,
            self.std_laspx,
            self.std_laspy,
            self.std_radr,
            self.std_radphi,
            self.std_radrd,
        ] {
            if !std.is_finite() || std < 0.0 {
                return Err(FilterError::InvalidNoise(std));
            }
        }
        if let Some(bad) = self
            .initial_covariance_diagonal
            .iter()
            .find(|v| !v.is_finite() || **v <= 0.0)
        {
            return Err(FilterError::InvalidInput(format!(
                "initial covariance diagonal entry {bad} must be positive"
            )));
        }
        Ok(())
    }
}

/// Sigma points mapped into measurement space with their mean and innovation covariance.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementPrediction {
    /// Predicted measurement mean.
    pub z_pred: DVector<f64>,
    /// Innovation covariance (sigma-point scatter plus measurement noise).
    pub s: DMatrix<f64>,
    /// Measurement sigma points, one column per state sigma point.
    pub zsig: DMatrix<f64>,
}

/// Predicted mean, covariance and sigma points produced by one prediction step.
#[derive(Clone, Debug)]
struct StatePrediction {
    x: DVector<f64>,
    p: DMatrix<f64>,
    xsig_pred: DMatrix<f64>,
}

/// Posterior produced by one measurement update.
#[derive(Clone, Debug)]
struct StateUpdate {
    x: DVector<f64>,
    p: DMatrix<f64>,
    nis: f64,
}

/// CTRV unscented Kalman filter fusing lidar and radar measurements.
#[derive(Clone)]
pub struct UnscentedKalmanFilter {
    x: DVector<f64>,
    p: DMatrix<f64>,
    xsig_pred: DMatrix<f64>,
    weights: DVector<f64>,
    lambda: f64,
    std_a: f64,
    std_yawdd: f64,
    lidar: LidarMeasurementModel,
    radar: RadarMeasurementModel,
    use_laser: bool,
    use_radar: bool,
    initial_covariance: DMatrix<f64>,
    state: FilterState,
    previous_timestamp: i64,
    nis_lidar: Option<f64>,
    nis_radar: Option<f64>,
    last_nis: Option<f64>,
}
impl Debug for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UKF")
            .field("state", &self.state)
            .field("x", &self.x.as_slice())
            .field("p_diagonal", &self.p.diagonal().as_slice())
            .field("previous_timestamp", &self.previous_timestamp)
            .field("nis_lidar", &self.nis_lidar)
            .field("nis_radar", &self.nis_radar)
            .finish()
    }
}
impl Display for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnscentedKalmanFilter")
            .field("x", &self.x)
            .field("p", &self.p)
            .field("lambda", &self.lambda)
            .field("lidar", &format_args!("{}", self.lidar))
            .field("radar", &format_args!("{}", self.radar))
            .finish()
    }
}
impl Default for UnscentedKalmanFilter {
    fn default() -> Self {
        UnscentedKalmanFilter::build(&UkfConfig::default())
    }
}
impl UnscentedKalmanFilter {
    /// Build an uninitialized filter from a configuration.
    pub fn new(config: UkfConfig) -> Result<Self, FilterError> {
        config.validate()?;
        Ok(UnscentedKalmanFilter::build(&config))
    }
    fn build(config: &UkfConfig) -> Self {
        let lambda = 3.0 - N_AUG as f64;
        let mut weights = DVector::from_element(N_SIGMA, 0.5 / (lambda + N_AUG as f64));
        weights[0] = lambda / (lambda + N_AUG as f64);
        UnscentedKalmanFilter {
            x: DVector::zeros(N_X),
            p: DMatrix::identity(N_X, N_X),
            xsig_pred: DMatrix::zeros(N_X, N_SIGMA),
            weights,
            lambda,
            std_a: config.std_a,
            std_yawdd: config.std_yawdd,
            lidar: LidarMeasurementModel::new(config.std_laspx, config.std_laspy),
            radar: RadarMeasurementModel::new(
                config.std_radr,
                config.std_radphi,
                config.std_radrd,
            ),
            use_laser: config.use_laser,
            use_radar: config.use_radar,
            initial_covariance: DMatrix::from_diagonal(&DVector::from_row_slice(
                &config.initial_covariance_diagonal,
            )),
            state: FilterState::Uninitialized,
            previous_timestamp: 0,
            nis_lidar: None,
            nis_radar: None,
            last_nis: None,
        }
    }
    /// State mean `[px, py, v, yaw, yaw_rate]`.
    pub fn mean(&self) -> &DVector<f64> {
        &self.x
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.p
    }
    /// Sigma points from the last prediction (5 x 15).
    pub fn predicted_sigma_points(&self) -> &DMatrix<f64> {
        &self.xsig_pred
    }
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }
    pub fn lambda(&self) -> f64 {
        self.lambda
    }
    pub fn previous_timestamp(&self) -> i64 {
        self.previous_timestamp
    }
    /// NIS of the most recent lidar update.
    pub fn nis_lidar(&self) -> Option<f64> {
        self.nis_lidar
    }
    /// NIS of the most recent radar update.
    pub fn nis_radar(&self) -> Option<f64> {
        self.nis_radar
    }
    /// NIS of the most recent update from either sensor.
    pub fn last_nis(&self) -> Option<f64> {
        self.last_nis
    }
    /// Run one tick: initialize on the first measurement, otherwise predict and update.
    pub fn process_measurement(
        &mut self,
        meas_package: &MeasurementPackage,
    ) -> Result<(), FilterError> {
        meas_package.validate()?;
        if !self.is_initialized() {
            self.initialize(meas_package);
            return Ok(());
        }
        if !self.sensor_enabled(meas_package.sensor_type) {
            debug!(
                "Ignoring {} measurement at {}: sensor disabled",
                meas_package.sensor_type, meas_package.timestamp
            );
            return Ok(());
        }
        if meas_package.timestamp < self.previous_timestamp {
            return Err(FilterError::NonMonotonicTimestamp {
                previous: self.previous_timestamp,
                timestamp: meas_package.timestamp,
            });
        }
        let elapsed = meas_package
            .timestamp
            .checked_sub(self.previous_timestamp)
            .ok_or_else(|| {
                FilterError::InvalidInput(format!(
                    "interval from {} to {} overflows",
                    self.previous_timestamp, meas_package.timestamp
                ))
            })?;
        let delta_t = elapsed as f64 / 1.0e6;
        let predicted = self.predict_state(delta_t)?;
        let z = &meas_package.raw_measurements;
        let updated = match meas_package.sensor_type {
            SensorType::Lidar => update_state(&predicted, &self.weights, &self.lidar, z)?,
            SensorType::Radar => update_state(&predicted, &self.weights, &self.radar, z)?,
        };
        self.xsig_pred = predicted.xsig_pred;
        self.commit_update(meas_package.sensor_type, updated);
        self.previous_timestamp = meas_package.timestamp;
        Ok(())
    }
    /// Predict sigma points, state mean and covariance forward by `delta_t` seconds.
    pub fn prediction(&mut self, delta_t: f64) -> Result<(), FilterError> {
        self.ensure_ready()?;
        let predicted = self.predict_state(delta_t)?;
        self.x = predicted.x;
        self.p = predicted.p;
        self.xsig_pred = predicted.xsig_pred;
        Ok(())
    }
    /// Augmented sigma points (7 x 15) for the current mean and covariance.
    pub fn augmented_sigma_points(&self) -> Result<DMatrix<f64>, FilterError> {
        let mut x_aug = DVector::<f64>::zeros(N_AUG);
        x_aug.rows_mut(0, N_X).copy_from(&self.x);
        let mut p_aug = DMatrix::<f64>::zeros(N_AUG, N_AUG);
        p_aug.view_mut((0, 0), (N_X, N_X)).copy_from(&self.p);
        p_aug[(N_X, N_X)] = self.std_a * self.std_a;
        p_aug[(N_X + 1, N_X + 1)] = self.std_yawdd * self.std_yawdd;
        let l = cholesky_lower(&p_aug).inspect_err(|_| {
            warn!("Augmented covariance is not positive definite; prediction rejected")
        })?;
        let spread = (self.lambda + N_AUG as f64).sqrt();
        let mut xsig_aug = DMatrix::<f64>::zeros(N_AUG, N_SIGMA);
        xsig_aug.set_column(0, &x_aug);
        for i in 0..N_AUG {
            let offset = spread * l.column(i);
            xsig_aug.set_column(i + 1, &(&x_aug + &offset));
            xsig_aug.set_column(i + 1 + N_AUG, &(&x_aug - &offset));
        }
        Ok(xsig_aug)
    }
    /// Lidar measurement prediction from the current predicted sigma points.
    pub fn predict_lidar_measurement(&self) -> Result<MeasurementPrediction, FilterError> {
        self.ensure_ready()?;
        Ok(predict_measurement(&self.xsig_pred, &self.weights, &self.lidar))
    }
    /// Radar measurement prediction from the current predicted sigma points.
    pub fn predict_radar_measurement(&self) -> Result<MeasurementPrediction, FilterError> {
        self.ensure_ready()?;
        Ok(predict_measurement(&self.xsig_pred, &self.weights, &self.radar))
    }
    /// Lidar update against the current prediction. Does not predict or touch the timestamp.
    pub fn update_lidar(&mut self, meas_package: &MeasurementPackage) -> Result<(), FilterError> {
        self.update_with(meas_package, SensorType::Lidar)
    }
    /// Radar update against the current prediction. Does not predict or touch the timestamp.
    pub fn update_radar(&mut self, meas_package: &MeasurementPackage) -> Result<(), FilterError> {
        self.update_with(meas_package, SensorType::Radar)
    }
    fn update_with(
        &mut self,
        meas_package: &MeasurementPackage,
        sensor: SensorType,
    ) -> Result<(), FilterError> {
        self.ensure_ready()?;
        if meas_package.sensor_type != sensor {
            return Err(FilterError::InvalidInput(format!(
                "expected a {sensor} measurement, got {}",
                meas_package.sensor_type
            )));
        }
        meas_package.validate()?;
        let current = StatePrediction {
            x: self.x.clone(),
            p: self.p.clone(),
            xsig_pred: self.xsig_pred.clone(),
        };
        let updated = match sensor {
            SensorType::Lidar => {
                update_state(&current, &self.weights, &self.lidar, &meas_package.raw_measurements)?
            }
            SensorType::Radar => {
                update_state(&current, &self.weights, &self.radar, &meas_package.raw_measurements)?
            }
        };
        self.commit_update(sensor, updated);
        Ok(())
    }
    fn commit_update(&mut self, sensor: SensorType, updated: StateUpdate) {
        self.x = updated.x;
        self.p = updated.p;
        match sensor {
            SensorType::Lidar => self.nis_lidar = Some(updated.nis),
            SensorType::Radar => self.nis_radar = Some(updated.nis),
        }
        self.last_nis = Some(updated.nis);
    }
    fn initialize(&mut self, meas_package: &MeasurementPackage) {
        let (px, py) = meas_package.position();
        self.x = DVector::from_vec(vec![px, py, 0.0, 0.0, 0.0]);
        self.p = self.initial_covariance.clone();
        // Every column collapses onto the seeded mean until the first prediction.
        self.xsig_pred = DMatrix::from_fn(N_X, N_SIGMA, |r, _| self.x[r]);
        self.previous_timestamp = meas_package.timestamp;
        self.state = FilterState::Ready;
        debug!(
            "UKF initialized from {} measurement at ({:.3}, {:.3}), t = {}",
            meas_package.sensor_type, px, py, meas_package.timestamp
        );
    }
    fn predict_state(&self, delta_t: f64) -> Result<StatePrediction, FilterError> {
        if !delta_t.is_finite() {
            return Err(FilterError::InvalidInput(format!(
                "prediction interval {delta_t} is not finite"
            )));
        }
        let xsig_aug = self.augmented_sigma_points()?;
        let xsig_pred = predict_sigma_points(&xsig_aug, delta_t);
        let mut x = DVector::<f64>::zeros(N_X);
        for (i, column) in xsig_pred.column_iter().enumerate() {
            x += self.weights[i] * column;
        }
        let mut p = DMatrix::<f64>::zeros(N_X, N_X);
        for (i, column) in xsig_pred.column_iter().enumerate() {
            let mut diff = column - &x;
            diff[YAW_INDEX] = wrap_to_pi(diff[YAW_INDEX]);
            p += self.weights[i] * &diff * diff.transpose();
        }
        Ok(StatePrediction {
            x,
            p: symmetrize(&p),
            xsig_pred,
        })
    }
    fn sensor_enabled(&self, sensor: SensorType) -> bool {
        match sensor {
            SensorType::Lidar => self.use_laser,
            SensorType::Radar => self.use_radar,
        }
    }
    fn ensure_ready(&self) -> Result<(), FilterError> {
        match self.state {
            FilterState::Ready => Ok(()),
            FilterState::Uninitialized => Err(FilterError::NotInitialized),
        }
    }
}
impl BayesianFilter for UnscentedKalmanFilter {
    fn is_initialized(&self) -> bool {
        self.state == FilterState::Ready
    }
    fn get_estimate(&self) -> DVector<f64> {
        self.x.clone()
    }
    fn get_certainty(&self) -> DMatrix<f64> {
        self.p.clone()
    }
}

/// Propagate one augmented sigma point `[px, py, v, yaw, yawd, nu_a, nu_yawdd]` through the CTRV
/// model, including the analytic process noise terms.
pub fn ctrv_propagate(sigma_point: &DVector<f64>, delta_t: f64) -> DVector<f64> {
    let px = sigma_point[0];
    let py = sigma_point[1];
    let v = sigma_point[2];
    let yaw = sigma_point[3];
    let yawd = sigma_point[4];
    let nu_a = sigma_point[5];
    let nu_yawdd = sigma_point[6];

    let (mut px_p, mut py_p) = if yawd.abs() > YAW_RATE_THRESHOLD {
        (
            px + v / yawd * ((yaw + yawd * delta_t).sin() - yaw.sin()),
            py + v / yawd * (yaw.cos() - (yaw + yawd * delta_t).cos()),
        )
    } else {
        (px + v * delta_t * yaw.cos(), py + v * delta_t * yaw.sin())
    };
    let mut v_p = v;
    let mut yaw_p = yaw + yawd * delta_t;
    let mut yawd_p = yawd;

    let dt2 = delta_t * delta_t;
    px_p += 0.5 * nu_a * dt2 * yaw.cos();
    py_p += 0.5 * nu_a * dt2 * yaw.sin();
    v_p += nu_a * delta_t;
    yaw_p += 0.5 * nu_yawdd * dt2;
    yawd_p += nu_yawdd * delta_t;

    DVector::from_vec(vec![px_p, py_p, v_p, yaw_p, yawd_p])
}

/// Propagate every augmented sigma point, returning the 5 x 15 predicted cloud.
fn predict_sigma_points(xsig_aug: &DMatrix<f64>, delta_t: f64) -> DMatrix<f64> {
    let mut xsig_pred = DMatrix::<f64>::zeros(N_X, xsig_aug.ncols());
    for (i, column) in xsig_aug.column_iter().enumerate() {
        xsig_pred.set_column(i, &ctrv_propagate(&column.clone_owned(), delta_t));
    }
    xsig_pred
}

/// Map state sigma points into measurement space and form mean and innovation covariance.
fn predict_measurement<M: MeasurementModel + ?Sized>(
    xsig_pred: &DMatrix<f64>,
    weights: &DVector<f64>,
    model: &M,
) -> MeasurementPrediction {
    let n_z = model.get_dimension();
    let zsig = model.get_sigma_points(xsig_pred);
    let mut z_pred = DVector::<f64>::zeros(n_z);
    for (i, column) in zsig.column_iter().enumerate() {
        z_pred += weights[i] * column;
    }
    if let Some(angle) = model.angle_index() {
        // Average bearings as residuals around the central point so the mean does not fold at ±π.
        let center = zsig[(angle, 0)];
        let offset: f64 = zsig
            .row(angle)
            .iter()
            .zip(weights.iter())
            .map(|(z, w)| w * wrap_to_pi(z - center))
            .sum();
        z_pred[angle] = wrap_to_pi(center + offset);
    }
    let mut s = DMatrix::<f64>::zeros(n_z, n_z);
    for (i, column) in zsig.column_iter().enumerate() {
        let mut diff = column - &z_pred;
        if let Some(angle) = model.angle_index() {
            diff[angle] = wrap_to_pi(diff[angle]);
        }
        s += weights[i] * &diff * diff.transpose();
    }
    s += model.get_noise();
    MeasurementPrediction { z_pred, s, zsig }
}

/// Standard UKF update of a prediction against a raw measurement.
fn update_state<M: MeasurementModel + ?Sized>(
    predicted: &StatePrediction,
    weights: &DVector<f64>,
    model: &M,
    z: &DVector<f64>,
) -> Result<StateUpdate, FilterError> {
    if z.len() != model.get_dimension() {
        return Err(FilterError::MeasurementDimension {
            expected: model.get_dimension(),
            found: z.len(),
        });
    }
    let measurement = predict_measurement(&predicted.xsig_pred, weights, model);
    let mut tc = DMatrix::<f64>::zeros(N_X, model.get_dimension());
    for (i, z_column) in measurement.zsig.column_iter().enumerate() {
        let mut z_diff = z_column - &measurement.z_pred;
        if let Some(angle) = model.angle_index() {
            z_diff[angle] = wrap_to_pi(z_diff[angle]);
        }
        let mut x_diff = predicted.xsig_pred.column(i) - &predicted.x;
        x_diff[YAW_INDEX] = wrap_to_pi(x_diff[YAW_INDEX]);
        tc += weights[i] * x_diff * z_diff.transpose();
    }
    let s_inv = spd_inverse(&measurement.s)?;
    let k = &tc * &s_inv;
    let mut y = z - &measurement.z_pred;
    if let Some(angle) = model.angle_index() {
        y[angle] = wrap_to_pi(y[angle]);
    }
    let x = &predicted.x + &k * &y;
    let p = symmetrize(&(&predicted.p - &k * &measurement.s * k.transpose()));
    let nis = (y.transpose() * &s_inv * &y)[(0, 0)];
    Ok(StateUpdate { x, p, nis })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn assert_matrix_close(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_approx_eq!(*x, *y, tol);
        }
    }

    fn initialized_with_lidar(px: f64, py: f64) -> UnscentedKalmanFilter {
        let mut ukf = UnscentedKalmanFilter::default();
        ukf.process_measurement(&MeasurementPackage::lidar(px, py, 0))
            .unwrap();
        ukf
    }

    #[test]
    fn weights_sum_to_one() {
        let ukf = UnscentedKalmanFilter::default();
        assert_eq!(ukf.weights().len(), N_SIGMA);
        assert_approx_eq!(ukf.weights().sum(), 1.0, 1e-12);
        assert_approx_eq!(ukf.weights()[0], -4.0 / 3.0, 1e-12);
        assert_approx_eq!(ukf.weights()[7], 1.0 / 6.0, 1e-12);
        assert_eq!(ukf.lambda(), -4.0);
    }

    #[test]
    fn config_validation() {
        assert!(UnscentedKalmanFilter::new(UkfConfig::default()).is_ok());
        let bad_noise = UkfConfig {
            std_radr: -0.1,
            ..Default::default()
        };
        assert_eq!(
            UnscentedKalmanFilter::new(bad_noise).unwrap_err(),
            FilterError::InvalidNoise(-0.1)
        );
        let bad_cov = UkfConfig {
            initial_covariance_diagonal: [1.0, 1.0, 0.0, 1.0, 1.0],
            ..Default::default()
        };
        assert!(UnscentedKalmanFilter::new(bad_cov).is_err());
    }

    #[test]
    fn first_lidar_measurement_initializes() {
        let ukf = initialized_with_lidar(1.0, 2.0);
        assert!(ukf.is_initialized());
        assert_eq!(ukf.mean().as_slice(), &[1.0, 2.0, 0.0, 0.0, 0.0]);
        assert_eq!(ukf.covariance(), &DMatrix::identity(N_X, N_X));
        assert_eq!(ukf.previous_timestamp(), 0);
        assert_eq!(ukf.last_nis(), None);
    }

    #[test]
    fn first_radar_measurement_initializes_from_polar() {
        let mut ukf = UnscentedKalmanFilter::default();
        ukf.process_measurement(&MeasurementPackage::radar(2.0, PI / 2.0, 5.0, 1_000))
            .unwrap();
        let x = ukf.get_estimate();
        assert_approx_eq!(x[0], 0.0, 1e-12);
        assert_approx_eq!(x[1], 2.0, 1e-12);
        assert_eq!(x[2], 0.0);
        assert_eq!(x[3], 0.0);
        assert_eq!(ukf.previous_timestamp(), 1_000);
    }

    #[test]
    fn operations_before_initialization_fail() {
        let mut ukf = UnscentedKalmanFilter::default();
        assert_eq!(ukf.prediction(0.1), Err(FilterError::NotInitialized));
        assert_eq!(
            ukf.predict_lidar_measurement().unwrap_err(),
            FilterError::NotInitialized
        );
        assert_eq!(
            ukf.update_radar(&MeasurementPackage::radar(1.0, 0.0, 0.0, 0)),
            Err(FilterError::NotInitialized)
        );
    }

    #[test]
    fn ctrv_straight_line_branch() {
        let point = DVector::from_vec(vec![1.0, 2.0, 3.0, 0.5, 0.0, 0.0, 0.0]);
        let out = ctrv_propagate(&point, 2.0);
        assert_approx_eq!(out[0], 1.0 + 6.0 * 0.5_f64.cos(), 1e-12);
        assert_approx_eq!(out[1], 2.0 + 6.0 * 0.5_f64.sin(), 1e-12);
        assert_eq!(out[2], 3.0);
        assert_eq!(out[3], 0.5);
        assert_eq!(out[4], 0.0);
    }

    #[test]
    fn ctrv_turning_branch_and_noise_terms() {
        let point = DVector::from_vec(vec![0.0, 0.0, 2.0, 0.0, 0.5, 1.0, 0.2]);
        let dt = 1.0;
        let out = ctrv_propagate(&point, dt);
        assert_approx_eq!(out[0], 4.0 * 0.5_f64.sin() + 0.5, 1e-12);
        assert_approx_eq!(out[1], 4.0 * (1.0 - 0.5_f64.cos()), 1e-12);
        assert_approx_eq!(out[2], 3.0, 1e-12);
        assert_approx_eq!(out[3], 0.5 + 0.1, 1e-12);
        assert_approx_eq!(out[4], 0.7, 1e-12);
    }

    #[test]
    fn augmented_sigma_points_layout() {
        let ukf = initialized_with_lidar(1.0, 1.0);
        let xsig_aug = ukf.augmented_sigma_points().unwrap();
        assert_eq!(xsig_aug.shape(), (N_AUG, N_SIGMA));
        assert_eq!(xsig_aug[(0, 0)], 1.0);
        assert_eq!(xsig_aug[(5, 0)], 0.0);
        // P = I, so each positive offset is sqrt(3) along one axis.
        assert_approx_eq!(xsig_aug[(0, 1)], 1.0 + 3.0_f64.sqrt(), 1e-12);
        assert_approx_eq!(xsig_aug[(0, 1 + N_AUG)], 1.0 - 3.0_f64.sqrt(), 1e-12);
        assert_approx_eq!(xsig_aug[(5, 6)], 30.0 * 3.0_f64.sqrt(), 1e-9);
    }

    #[test]
    fn zero_interval_prediction_reproduces_mean_and_covariance() {
        let mut ukf = initialized_with_lidar(3.0, -1.0);
        let p_before = ukf.covariance().clone();
        ukf.prediction(0.0).unwrap();
        let x = ukf.mean();
        assert_approx_eq!(x[0], 3.0, 1e-9);
        assert_approx_eq!(x[1], -1.0, 1e-9);
        assert_matrix_close(ukf.covariance(), &p_before, 1e-9);
    }

    #[test]
    fn collapsed_sigma_points_give_lidar_noise_as_innovation() {
        let ukf = initialized_with_lidar(0.0, 0.0);
        let prediction = ukf.predict_lidar_measurement().unwrap();
        assert_eq!(prediction.z_pred, DVector::zeros(2));
        let r = DMatrix::from_diagonal(&DVector::from_vec(vec![0.0225, 0.0225]));
        assert_matrix_close(&prediction.s, &r, 1e-15);
        assert_eq!(prediction.zsig.shape(), (2, N_SIGMA));
    }

    #[test]
    fn radar_prediction_near_origin_is_finite() {
        let mut ukf = initialized_with_lidar(0.0, 0.0);
        ukf.prediction(0.05).unwrap();
        let prediction = ukf.predict_radar_measurement().unwrap();
        assert!(prediction.zsig.iter().all(|v| v.is_finite()));
        assert!(prediction.s.iter().all(|v| v.is_finite()));
        assert_eq!(prediction.z_pred.len(), 3);
    }

    #[test]
    fn lidar_update_moves_towards_measurement_and_reports_nis() {
        let mut ukf = initialized_with_lidar(1.0, 1.0);
        ukf.prediction(0.1).unwrap();
        let prediction = ukf.predict_lidar_measurement().unwrap();
        let z = DVector::from_vec(vec![1.1, 0.9]);
        let y = &z - &prediction.z_pred;
        let expected_nis = (y.transpose() * spd_inverse(&prediction.s).unwrap() * &y)[(0, 0)];

        let meas = MeasurementPackage::lidar(1.1, 0.9, 100_000);
        ukf.update_lidar(&meas).unwrap();
        assert_approx_eq!(ukf.nis_lidar().unwrap(), expected_nis, 1e-9);
        assert_eq!(ukf.last_nis(), ukf.nis_lidar());
        assert_eq!(ukf.nis_radar(), None);
        let x = ukf.mean();
        assert!((x[0] - 1.1).abs() < 0.05);
        assert!((x[1] - 0.9).abs() < 0.05);
        let p = ukf.covariance();
        assert_eq!(p, &p.transpose());
    }

    #[test]
    fn update_rejects_wrong_sensor() {
        let mut ukf = initialized_with_lidar(1.0, 1.0);
        let result = ukf.update_radar(&MeasurementPackage::lidar(1.0, 1.0, 0));
        assert!(matches!(result, Err(FilterError::InvalidInput(_))));
    }

    #[test]
    fn process_measurement_runs_full_tick() {
        let mut ukf = initialized_with_lidar(1.0, 1.0);
        ukf.process_measurement(&MeasurementPackage::lidar(1.1, 0.9, 100_000))
            .unwrap();
        assert_eq!(ukf.previous_timestamp(), 100_000);
        assert!(ukf.nis_lidar().is_some());
        assert!((ukf.mean()[0] - 1.05).abs() < 0.1);
        ukf.process_measurement(&MeasurementPackage::radar(1.5, 0.7, 0.5, 200_000))
            .unwrap();
        assert!(ukf.nis_radar().is_some());
        assert_eq!(ukf.previous_timestamp(), 200_000);
    }

    #[test]
    fn disabled_sensor_is_ignored() {
        let config = UkfConfig {
            use_radar: false,
            ..Default::default()
        };
        let mut ukf = UnscentedKalmanFilter::new(config).unwrap();
        ukf.process_measurement(&MeasurementPackage::lidar(1.0, 1.0, 0))
            .unwrap();
        let x_before = ukf.mean().clone();
        let p_before = ukf.covariance().clone();
        ukf.process_measurement(&MeasurementPackage::radar(5.0, 0.3, 1.0, 50_000))
            .unwrap();
        assert_eq!(ukf.mean(), &x_before);
        assert_eq!(ukf.covariance(), &p_before);
        assert_eq!(ukf.previous_timestamp(), 0);
        assert_eq!(ukf.last_nis(), None);
    }

    #[test]
    fn failed_ticks_leave_filter_untouched() {
        let mut ukf = initialized_with_lidar(1.0, 1.0);
        ukf.process_measurement(&MeasurementPackage::lidar(1.0, 1.0, 100_000))
            .unwrap();
        let x_before = ukf.mean().clone();

        let result = ukf.process_measurement(&MeasurementPackage::lidar(1.0, 1.0, 50_000));
        assert_eq!(
            result,
            Err(FilterError::NonMonotonicTimestamp {
                previous: 100_000,
                timestamp: 50_000
            })
        );
        let malformed = MeasurementPackage {
            sensor_type: SensorType::Radar,
            raw_measurements: DVector::from_vec(vec![1.0, 0.0]),
            timestamp: 200_000,
        };
        assert_eq!(
            ukf.process_measurement(&malformed),
            Err(FilterError::MeasurementDimension {
                expected: 3,
                found: 2
            })
        );

        ukf.p = -DMatrix::<f64>::identity(N_X, N_X);
        assert_eq!(
            ukf.process_measurement(&MeasurementPackage::lidar(1.0, 1.0, 300_000)),
            Err(FilterError::NotPositiveDefinite)
        );
        assert_eq!(ukf.mean(), &x_before);
        assert_eq!(ukf.previous_timestamp(), 100_000);
    }

    #[test]
    fn overflowing_interval_is_rejected() {
        let mut ukf = UnscentedKalmanFilter::default();
        ukf.process_measurement(&MeasurementPackage::lidar(1.0, 1.0, -10))
            .unwrap();
        let x_before = ukf.mean().clone();
        let p_before = ukf.get_certainty();
        assert!(matches!(
            ukf.process_measurement(&MeasurementPackage::lidar(2.0, 2.0, i64::MAX)),
            Err(FilterError::InvalidInput(_))
        ));
        assert_eq!(ukf.mean(), &x_before);
        assert_eq!(ukf.get_certainty(), p_before);
        assert_eq!(ukf.previous_timestamp(), -10);
    }

    #[test]
    fn bearing_residual_is_normalized_across_pi() {
        let mut ukf = UnscentedKalmanFilter::default();
        ukf.process_measurement(&MeasurementPackage::radar(5.0, PI - 0.01, 0.0, 0))
            .unwrap();
        ukf.process_measurement(&MeasurementPackage::radar(5.0, -PI + 0.01, 0.0, 100_000))
            .unwrap();
        let x = ukf.mean();
        assert!(x.iter().all(|v| v.is_finite()));
        assert!((x[0] + 5.0).abs() < 0.5, "px = {}", x[0]);
        assert!(x[1].abs() < 0.5, "py = {}", x[1]);
        assert!(ukf.nis_radar().unwrap() < 100.0);
    }
}
