//! Replay drivers and evaluation metrics.
//!
//! This module reads recorded sensor logs from CSV, pushes them through the filters one tick at a
//! time, and writes the resulting estimates back to CSV. It also provides the RMSE and NIS
//! consistency metrics used to judge a run.
//!
//! UKF logs have one row per measurement:
//!
//! ```text
//! sensor_type,meas_1,meas_2,meas_3,timestamp,gt_px,gt_py,gt_vx,gt_vy
//! L,0.312,0.580,,1477010443000000,0.6,0.6,5.2,0.0
//! R,1.014,0.554,4.892,1477010443050000,0.86,0.6,5.2,0.0
//! ```
//!
//! Lidar rows leave `meas_3` empty. Particle filter scenarios are split across four files: the
//! landmark map (`id,x,y`), the controls (`velocity,yaw_rate`, one row per step), the vehicle-frame
//! observations (`step,x,y`, any number of rows per step), and the ground-truth poses
//! (`x,y,theta`, one row per step).
use crate::config::ParticleScenarioConfig;
use crate::kalman::{UkfConfig, UnscentedKalmanFilter};
use crate::measurements::{MeasurementPackage, SensorType, chi_squared_95};
use crate::particle::{Landmark, LandmarkObs, Map, ParticleFilter, ParticleFilterConfig};
use crate::{BayesianFilter, FilterError, wrap_to_pi};

use std::io;
use std::path::Path;

use log::{debug, info};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// One row of a lidar/radar log: the measurement plus the ground truth at that instant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub sensor_type: SensorType,
    /// Lidar: x (m). Radar: range (m).
    pub meas_1: f64,
    /// Lidar: y (m). Radar: bearing (rad).
    pub meas_2: f64,
    /// Radar range rate (m/s). Empty for lidar.
    pub meas_3: Option<f64>,
    /// Timestamp in microseconds.
    pub timestamp: i64,
    pub gt_px: f64,
    pub gt_py: f64,
    pub gt_vx: f64,
    pub gt_vy: f64,
}
impl MeasurementRecord {
    /// Reads a log of measurement records from a CSV file with headers.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        read_records(path)
    }
    /// Convert the record into the package delivered to the UKF.
    pub fn to_measurement_package(&self) -> Result<MeasurementPackage, FilterError> {
        match self.sensor_type {
            SensorType::Lidar => Ok(MeasurementPackage::lidar(
                self.meas_1,
                self.meas_2,
                self.timestamp,
            )),
            SensorType::Radar => {
                let rho_dot = self.meas_3.ok_or_else(|| {
                    FilterError::InvalidInput(format!(
                        "radar record at {} is missing its range rate",
                        self.timestamp
                    ))
                })?;
                Ok(MeasurementPackage::radar(
                    self.meas_1,
                    self.meas_2,
                    rho_dot,
                    self.timestamp,
                ))
            }
        }
    }
    /// Ground truth `[px, py, vx, vy]`.
    pub fn ground_truth(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.gt_px, self.gt_py, self.gt_vx, self.gt_vy])
    }
}

/// UKF output for one processed measurement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub timestamp: i64,
    pub sensor_type: SensorType,
    pub px: f64,
    pub py: f64,
    pub v: f64,
    pub yaw: f64,
    pub yaw_rate: f64,
    pub vx: f64,
    pub vy: f64,
    /// NIS of the update made with this measurement; empty on initialization or ignored ticks.
    pub nis: Option<f64>,
}
impl EstimateRecord {
    fn from_state(
        timestamp: i64,
        sensor_type: SensorType,
        x: &DVector<f64>,
        nis: Option<f64>,
    ) -> Self {
        EstimateRecord {
            timestamp,
            sensor_type,
            px: x[0],
            py: x[1],
            v: x[2],
            yaw: x[3],
            yaw_rate: x[4],
            vx: x[2] * x[3].cos(),
            vy: x[2] * x[3].sin(),
            nis,
        }
    }
    /// Estimated `[px, py, vx, vy]`, comparable with [MeasurementRecord::ground_truth].
    pub fn cartesian(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.px, self.py, self.vx, self.vy])
    }
}

/// Result of replaying a lidar/radar log through the UKF.
#[derive(Clone, Debug)]
pub struct UkfRunResult {
    pub estimates: Vec<EstimateRecord>,
    /// RMSE of `[px, py, vx, vy]` against the ground truth.
    pub rmse: DVector<f64>,
    /// Fraction of lidar NIS values above the 95% χ² threshold.
    pub nis_lidar_exceedance: Option<f64>,
    /// Fraction of radar NIS values above the 95% χ² threshold.
    pub nis_radar_exceedance: Option<f64>,
}
impl UkfRunResult {
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.estimates {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Replay a lidar/radar log through a fresh UKF.
///
/// Produces one estimate per record. The first failing tick aborts the run.
pub fn run_ukf(
    records: &[MeasurementRecord],
    config: &UkfConfig,
) -> Result<UkfRunResult, FilterError> {
    let mut ukf = UnscentedKalmanFilter::new(config.clone())?;
    let mut estimates = Vec::with_capacity(records.len());
    let mut estimations = Vec::with_capacity(records.len());
    let mut ground_truth = Vec::with_capacity(records.len());
    for record in records {
        let package = record.to_measurement_package()?;
        let was_initialized = ukf.is_initialized();
        ukf.process_measurement(&package)?;
        let updated = was_initialized
            && match record.sensor_type {
                SensorType::Lidar => config.use_laser,
                SensorType::Radar => config.use_radar,
            };
        let nis = if updated { ukf.last_nis() } else { None };
        let estimate =
            EstimateRecord::from_state(record.timestamp, record.sensor_type, ukf.mean(), nis);
        estimations.push(estimate.cartesian());
        ground_truth.push(record.ground_truth());
        estimates.push(estimate);
    }
    let rmse = calculate_rmse(&estimations, &ground_truth)?;
    let nis_lidar_exceedance = nis_exceedance(&estimates, SensorType::Lidar);
    let nis_radar_exceedance = nis_exceedance(&estimates, SensorType::Radar);
    info!(
        "UKF replay of {} records: RMSE [{:.4}, {:.4}, {:.4}, {:.4}]",
        estimates.len(),
        rmse[0],
        rmse[1],
        rmse[2],
        rmse[3]
    );
    Ok(UkfRunResult {
        estimates,
        rmse,
        nis_lidar_exceedance,
        nis_radar_exceedance,
    })
}

/// Fraction of a sensor's NIS values above its 95% χ² threshold, or `None` without any values.
pub fn nis_exceedance(estimates: &[EstimateRecord], sensor: SensorType) -> Option<f64> {
    let threshold = chi_squared_95(sensor.dimension())?;
    let values: Vec<f64> = estimates
        .iter()
        .filter(|e| e.sensor_type == sensor)
        .filter_map(|e| e.nis)
        .collect();
    if values.is_empty() {
        return None;
    }
    let above = values.iter().filter(|nis| **nis > threshold).count();
    Some(above as f64 / values.len() as f64)
}

/// Root mean squared error between paired estimate and ground-truth vectors.
pub fn calculate_rmse(
    estimations: &[DVector<f64>],
    ground_truth: &[DVector<f64>],
) -> Result<DVector<f64>, FilterError> {
    if estimations.is_empty() {
        return Err(FilterError::InvalidInput(
            "cannot compute RMSE of an empty estimate list".to_string(),
        ));
    }
    if estimations.len() != ground_truth.len() {
        return Err(FilterError::InvalidInput(format!(
            "{} estimates but {} ground truth values",
            estimations.len(),
            ground_truth.len()
        )));
    }
    let dim = estimations[0].len();
    let mut rmse = DVector::<f64>::zeros(dim);
    for (estimate, truth) in estimations.iter().zip(ground_truth) {
        if estimate.len() != dim || truth.len() != dim {
            return Err(FilterError::MeasurementDimension {
                expected: dim,
                found: if estimate.len() != dim {
                    estimate.len()
                } else {
                    truth.len()
                },
            });
        }
        let residual = estimate - truth;
        rmse += residual.component_mul(&residual);
    }
    rmse /= estimations.len() as f64;
    Ok(rmse.map(f64::sqrt))
}

/// Commanded motion applied between two particle filter steps.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub velocity: f64,
    pub yaw_rate: f64,
}

/// A vehicle-frame landmark observation made at a given step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub step: usize,
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthRecord {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

fn read_records<T, P>(path: P) -> Result<Vec<T>, Box<dyn std::error::Error>>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let mut rdr = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for result in rdr.deserialize() {
        records.push(result?);
    }
    Ok(records)
}

/// Read a landmark map (`id,x,y`).
pub fn read_map<P: AsRef<Path>>(path: P) -> Result<Map, Box<dyn std::error::Error>> {
    let landmarks: Vec<Landmark> = read_records(path)?;
    Ok(Map::new(landmarks))
}

/// Read the per-step controls (`velocity,yaw_rate`).
pub fn read_controls<P: AsRef<Path>>(
    path: P,
) -> Result<Vec<ControlRecord>, Box<dyn std::error::Error>> {
    read_records(path)
}

/// Read observations (`step,x,y`) and group them into `num_steps` per-step lists.
pub fn read_observations<P: AsRef<Path>>(
    path: P,
    num_steps: usize,
) -> Result<Vec<Vec<LandmarkObs>>, Box<dyn std::error::Error>> {
    let records: Vec<ObservationRecord> = read_records(path)?;
    let mut grouped = vec![Vec::new(); num_steps];
    for record in records {
        let step = grouped.get_mut(record.step).ok_or_else(|| {
            format!(
                "observation step {} is outside the {} step scenario",
                record.step, num_steps
            )
        })?;
        step.push(LandmarkObs {
            id: 0,
            x: record.x,
            y: record.y,
        });
    }
    Ok(grouped)
}

/// Read ground-truth poses (`x,y,theta`).
pub fn read_ground_truth<P: AsRef<Path>>(
    path: P,
) -> Result<Vec<GroundTruthRecord>, Box<dyn std::error::Error>> {
    read_records(path)
}

/// Inputs of a particle filter localization replay.
#[derive(Clone, Debug, Default)]
pub struct ParticleScenario {
    pub map: Map,
    /// Control applied after each step; the control of step `k` moves the vehicle to step `k + 1`.
    pub controls: Vec<ControlRecord>,
    /// Vehicle-frame observations per step.
    pub observations: Vec<Vec<LandmarkObs>>,
    /// True pose per step. The first pose seeds the filter.
    pub ground_truth: Vec<GroundTruthRecord>,
}
impl ParticleScenario {
    pub fn from_csv<P: AsRef<Path>>(
        map: P,
        controls: P,
        observations: P,
        ground_truth: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let map = read_map(map)?;
        let controls = read_controls(controls)?;
        let observations = read_observations(observations, controls.len())?;
        let ground_truth = read_ground_truth(ground_truth)?;
        Ok(ParticleScenario {
            map,
            controls,
            observations,
            ground_truth,
        })
    }
    pub fn num_steps(&self) -> usize {
        self.controls.len()
    }
}

/// Best particle after one particle filter step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleEstimateRecord {
    pub step: usize,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub weight: f64,
    pub error_x: f64,
    pub error_y: f64,
    pub error_theta: f64,
    pub associations: String,
    pub sense_x: String,
    pub sense_y: String,
}

/// Result of a particle filter localization replay.
#[derive(Clone, Debug)]
pub struct ParticleRunResult {
    pub estimates: Vec<ParticleEstimateRecord>,
}
impl ParticleRunResult {
    /// Mean absolute error `[x, y, theta]` of the best particle over the run.
    pub fn mean_error(&self) -> [f64; 3] {
        if self.estimates.is_empty() {
            return [0.0; 3];
        }
        let n = self.estimates.len() as f64;
        let mut sum = [0.0; 3];
        for e in &self.estimates {
            sum[0] += e.error_x.abs();
            sum[1] += e.error_y.abs();
            sum[2] += e.error_theta.abs();
        }
        [sum[0] / n, sum[1] / n, sum[2] / n]
    }
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.estimates {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Replay a particle filter localization scenario.
///
/// The filter is seeded around the first ground-truth pose with `sigma_pos`. Each later step
/// predicts with the previous step's control; every step then weighs against its observations and
/// resamples. The best particle of each step is reported with its pose error.
pub fn run_particle_filter(
    scenario: &ParticleScenario,
    filter_config: &ParticleFilterConfig,
    scenario_config: &ParticleScenarioConfig,
) -> Result<ParticleRunResult, FilterError> {
    let steps = scenario.num_steps();
    if steps == 0 {
        return Err(FilterError::InvalidInput("scenario has no steps".to_string()));
    }
    if scenario.observations.len() != steps || scenario.ground_truth.len() < steps {
        return Err(FilterError::InvalidInput(format!(
            "scenario has {} controls, {} observation steps and {} ground truth poses",
            steps,
            scenario.observations.len(),
            scenario.ground_truth.len()
        )));
    }
    let mut pf = ParticleFilter::new(filter_config.clone());
    let mut estimates = Vec::with_capacity(steps);
    for step in 0..steps {
        if step == 0 {
            let start = &scenario.ground_truth[0];
            pf.init(start.x, start.y, start.theta, &scenario_config.sigma_pos)?;
        } else {
            let control = &scenario.controls[step - 1];
            pf.prediction(
                scenario_config.delta_t,
                &scenario_config.sigma_pos,
                control.velocity,
                control.yaw_rate,
            )?;
        }
        pf.update_weights(
            scenario_config.sensor_range,
            &scenario_config.sigma_landmark,
            &scenario.observations[step],
            &scenario.map,
        )?;
        pf.resample()?;
        let best = pf
            .best_particle()
            .ok_or_else(|| FilterError::InvalidInput("particle population is empty".to_string()))?;
        let truth = &scenario.ground_truth[step];
        let record = ParticleEstimateRecord {
            step,
            x: best.x,
            y: best.y,
            theta: best.theta,
            weight: best.weight,
            error_x: best.x - truth.x,
            error_y: best.y - truth.y,
            error_theta: wrap_to_pi(best.theta - truth.theta),
            associations: ParticleFilter::get_associations(best),
            sense_x: ParticleFilter::get_sense_x(best),
            sense_y: ParticleFilter::get_sense_y(best),
        };
        debug!(
            "Step {}: best particle ({:.3}, {:.3}, {:.3}), error ({:.3}, {:.3}, {:.3})",
            step,
            record.x,
            record.y,
            record.theta,
            record.error_x,
            record.error_y,
            record.error_theta
        );
        estimates.push(record);
    }
    let result = ParticleRunResult { estimates };
    let error = result.mean_error();
    info!(
        "Particle filter replay of {} steps: mean error [{:.4}, {:.4}, {:.4}]",
        steps, error[0], error[1], error[2]
    );
    Ok(result)
}
