//! Dec backlash compensation.
//!
//! - [`comp`] - Compensation pulse, reversal detection and adaptive tuning
//! - [`history`] - Bounded record of compensation events and their outcome

pub mod comp;
pub mod history;

pub use comp::{BacklashComp, BacklashSettings};
pub use history::{BlcEvent, BlcHistory, BlcStats, Deflection};
