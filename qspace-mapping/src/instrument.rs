//! Instrument configuration: flight path calibration and detector panels.

use crate::geometry::{DetectorPanel, PanelGeometry};
use crate::{Error, Result};
use qspace_core::Vec3;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Flight path calibration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlightPath {
    /// Moderator-to-sample distance in m.
    pub l1_m: f64,
    /// Time-of-flight offset in µs added to every event.
    pub t0_us: f64,
    /// Length of one TOF clock tick in µs (0.1 at SNS).
    pub tof_tick_us: f64,
}

impl Default for FlightPath {
    fn default() -> Self {
        Self {
            l1_m: 15.0,
            t0_us: 0.0,
            tof_tick_us: 0.1,
        }
    }
}

impl FlightPath {
    /// Time of flight in µs for a raw TOF value in ticks.
    #[inline]
    #[must_use]
    pub fn tof_us(&self, ticks: u32) -> f64 {
        self.t0_us + f64::from(ticks) * self.tof_tick_us
    }

    /// Validates the calibration.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for a non-positive L1 or tick size.
    pub fn validate(&self) -> Result<()> {
        if !(self.l1_m > 0.0 && self.l1_m.is_finite()) {
            return Err(Error::Config(format!("L1 must be positive, got {}", self.l1_m)));
        }
        if !(self.tof_tick_us > 0.0 && self.tof_tick_us.is_finite()) {
            return Err(Error::Config(format!(
                "TOF tick must be positive, got {}",
                self.tof_tick_us
            )));
        }
        if !self.t0_us.is_finite() {
            return Err(Error::Config("t0 is not finite".to_string()));
        }
        Ok(())
    }
}

/// A named instrument: flight path plus panel geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct InstrumentConfig {
    /// Instrument name.
    pub name: String,
    /// Moderator distance, t0 and TOF tick.
    pub flight_path: FlightPath,
    /// Detector panels.
    pub geometry: PanelGeometry,
}

// Intermediate structs for the JSON schema
#[derive(Deserialize)]
struct JsonConfig {
    instrument: JsonInstrument,
}

#[derive(Deserialize)]
#[serde(default)]
struct JsonInstrument {
    name: String,
    flight_path: JsonFlightPath,
    panels: Vec<JsonPanel>,
}

impl Default for JsonInstrument {
    fn default() -> Self {
        Self {
            name: "unnamed".to_string(),
            flight_path: JsonFlightPath::default(),
            panels: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct JsonFlightPath {
    l1_m: f64,
    t0_us: f64,
    tof_tick_us: f64,
}

impl Default for JsonFlightPath {
    fn default() -> Self {
        let defaults = FlightPath::default();
        Self {
            l1_m: defaults.l1_m,
            t0_us: defaults.t0_us,
            tof_tick_us: defaults.tof_tick_us,
        }
    }
}

#[derive(Deserialize)]
struct JsonPanel {
    id: u32,
    first_pixel_id: u32,
    #[serde(default = "default_panel_pixels")]
    n_rows: u32,
    #[serde(default = "default_panel_pixels")]
    n_cols: u32,
    width_m: f64,
    height_m: f64,
    center: [f64; 3],
    #[serde(default = "default_x_dir")]
    x_dir: [f64; 3],
    #[serde(default = "default_y_dir")]
    y_dir: [f64; 3],
}

fn default_panel_pixels() -> u32 {
    256
}

fn default_x_dir() -> [f64; 3] {
    [1.0, 0.0, 0.0]
}

fn default_y_dir() -> [f64; 3] {
    [0.0, 0.0, 1.0]
}

impl InstrumentConfig {
    /// Creates a configuration from parts.
    ///
    /// # Errors
    /// Returns an error if the flight path is invalid or there are no panels.
    pub fn new(name: impl Into<String>, flight_path: FlightPath, geometry: PanelGeometry) -> Result<Self> {
        flight_path.validate()?;
        if geometry.panels().is_empty() {
            return Err(Error::Config("instrument has no detector panels".to_string()));
        }
        Ok(Self {
            name: name.into(),
            flight_path,
            geometry,
        })
    }

    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or describes an
    /// invalid instrument.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let json_config: JsonConfig = serde_json::from_reader(reader)?;
        Self::from_json_config(json_config)
    }

    /// Loads configuration from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or describes an invalid
    /// instrument.
    pub fn from_json(json: &str) -> Result<Self> {
        let json_config: JsonConfig = serde_json::from_str(json)?;
        Self::from_json_config(json_config)
    }

    fn from_json_config(config: JsonConfig) -> Result<Self> {
        let instrument = config.instrument;
        let flight_path = FlightPath {
            l1_m: instrument.flight_path.l1_m,
            t0_us: instrument.flight_path.t0_us,
            tof_tick_us: instrument.flight_path.tof_tick_us,
        };

        let panels = instrument
            .panels
            .into_iter()
            .map(|p| {
                DetectorPanel::new(
                    p.id,
                    p.first_pixel_id,
                    p.n_rows,
                    p.n_cols,
                    p.width_m,
                    p.height_m,
                    Vec3::from(p.center),
                    Vec3::from(p.x_dir),
                    Vec3::from(p.y_dir),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(instrument.name, flight_path, PanelGeometry::new(panels)?)
    }
}
