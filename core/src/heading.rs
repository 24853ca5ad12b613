//! Heading integration from raw gyroscope payloads.
//!
//! A step window arrives as the raw bytes recorded by the phone: a CSV export in the layout of the
//! [Sensor Logger](https://www.tszheichoi.com/sensorlogger) app, one row per gyroscope sample with
//! the elapsed time in seconds and the angular rate (rad/s) around each device axis. The rate
//! around the configured vertical axis is integrated over the window to give the signed heading
//! change of the step.
//!
//! Two quadrature rules are available through [`IntegrationMethod`]:
//!
//! - `Rectangular`: left Riemann sum, $\Delta\psi = \sum_i \omega_i (t_{i+1} - t_i)$
//! - `Trapezoidal`: $\Delta\psi = \sum_i \frac{1}{2}(\omega_i + \omega_{i+1}) (t_{i+1} - t_i)$
use serde::{Deserialize, Serialize};

use crate::MotionIncrement;
use crate::error::{LocalizationError, Result};

/// Numerical integration rule used to turn angular rate into an angle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationMethod {
    Rectangular,
    #[default]
    Trapezoidal,
}

/// Device axis whose rotation rate is taken as the heading rate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GyroAxis {
    X,
    Y,
    #[default]
    Z,
}

/// One row of a raw gyroscope payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GyroscopeRecord {
    /// Seconds since the start of the recording
    pub seconds_elapsed: f64,
    /// Rotation rate around the z-axis in radians/s
    pub z: f64,
    /// Rotation rate around the y-axis in radians/s
    #[serde(default)]
    pub y: f64,
    /// Rotation rate around the x-axis in radians/s
    #[serde(default)]
    pub x: f64,
}

impl GyroscopeRecord {
    pub fn rate(&self, axis: GyroAxis) -> f64 {
        match axis {
            GyroAxis::X => self.x,
            GyroAxis::Y => self.y,
            GyroAxis::Z => self.z,
        }
    }
}

/// A single angular-rate reading on the heading axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RotationSample {
    pub timestamp: f64,
    pub rate: f64,
}

impl RotationSample {
    pub fn new(timestamp: f64, rate: f64) -> Self {
        RotationSample { timestamp, rate }
    }
}

/// Parse a raw gyroscope payload (CSV with a header row).
///
/// Columns other than `seconds_elapsed`, `z`, `y` and `x` are ignored; `y` and `x` may be
/// absent.
pub fn parse_gyroscope_csv(bytes: &[u8]) -> Result<Vec<GyroscopeRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: GyroscopeRecord = result.map_err(|e| {
            LocalizationError::InvalidSensorData(format!("malformed gyroscope payload: {e}"))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Integrates a window of rotation-rate samples into one heading change.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeadingIntegrator {
    pub method: IntegrationMethod,
    pub axis: GyroAxis,
}

impl HeadingIntegrator {
    pub fn new(method: IntegrationMethod, axis: GyroAxis) -> Self {
        HeadingIntegrator { method, axis }
    }

    /// Integrate time-stamped samples into a cumulative signed angle (radians).
    ///
    /// Fails with [`LocalizationError::InvalidSensorData`] when the window is empty, when a value
    /// is not finite, or when the timestamps are not strictly increasing.
    pub fn integrate(&self, samples: &[RotationSample]) -> Result<f64> {
        if samples.is_empty() {
            return Err(LocalizationError::InvalidSensorData(
                "rotation window is empty".to_string(),
            ));
        }
        for (i, sample) in samples.iter().enumerate() {
            if !sample.timestamp.is_finite() || !sample.rate.is_finite() {
                return Err(LocalizationError::InvalidSensorData(format!(
                    "sample {i} is not finite"
                )));
            }
        }
        let mut angle = 0.0;
        for (i, pair) in samples.windows(2).enumerate() {
            let dt = pair[1].timestamp - pair[0].timestamp;
            if dt <= 0.0 {
                return Err(LocalizationError::InvalidSensorData(format!(
                    "timestamps are not increasing at sample {}",
                    i + 1
                )));
            }
            angle += match self.method {
                IntegrationMethod::Rectangular => pair[0].rate * dt,
                IntegrationMethod::Trapezoidal => 0.5 * (pair[0].rate + pair[1].rate) * dt,
            };
        }
        Ok(angle)
    }

    /// Integrate rates sampled at a fixed interval (seconds).
    pub fn integrate_uniform(&self, rates: &[f64], interval: f64) -> Result<f64> {
        if !(interval.is_finite() && interval > 0.0) {
            return Err(LocalizationError::InvalidSensorData(format!(
                "sampling interval must be positive, got {interval}"
            )));
        }
        let samples: Vec<RotationSample> = rates
            .iter()
            .enumerate()
            .map(|(i, &rate)| RotationSample::new(i as f64 * interval, rate))
            .collect();
        self.integrate(&samples)
    }

    /// Parse a raw payload and integrate the configured axis.
    pub fn integrate_payload(&self, bytes: &[u8]) -> Result<f64> {
        let samples: Vec<RotationSample> = parse_gyroscope_csv(bytes)?
            .iter()
            .map(|r| RotationSample::new(r.seconds_elapsed, r.rate(self.axis)))
            .collect();
        self.integrate(&samples)
    }

    /// Build the motion increment of one step from its raw payload.
    pub fn motion_increment(&self, bytes: &[u8], step_length: f64) -> Result<MotionIncrement> {
        let heading_delta = self.integrate_payload(bytes)?;
        Ok(MotionIncrement::new(step_length, heading_delta))
    }
}
