//! # Guide Simulator
//!
//! Runs the guiding core against a simulated equatorial mount so that
//! calibration, backlash measurement and guiding can be exercised without
//! hardware.
//!
//! | Module    | Purpose                                                   |
//! |-----------|-----------------------------------------------------------|
//! | `config`  | TOML configuration: mount, guider and sky model           |
//! | `mount`   | Simulated mount: pulses, Dec slack, drift, meridian flip  |
//! | `sink`    | Routes core events into `tracing`                         |
//! | `session` | Frame-by-frame calibrate / measure / guide sessions       |
//! | `error`   | Session errors                                            |

pub mod config;
pub mod error;
pub mod mount;
pub mod session;
pub mod sink;

pub use config::{SimConfig, SimParams};
pub use error::SimError;
pub use mount::SimulatedMount;
pub use session::{CalibrationReport, GuideReport, MeasurementReport, Session};
