//! Guide Common Library
//!
//! Shared types, constants, configuration loading and device capability
//! traits used by every crate of the guiding workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - Numeric limits and empirical tuning constants
//! - [`config`] - Configuration loading traits and types
//! - [`geometry`] - Camera/mount vector helpers
//! - [`guide`] - Calibration, guide step and direction types
//! - [`device`] - Capabilities consumed by the core (mover, pointing, algorithms)
//! - [`store`] - Profile-scoped key/value persistence
//! - [`notify`] - Fire-and-forget notification sinks
//! - [`clock`] - Millisecond time source
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use guide_common::prelude::*;
//!
//! let ofs = Point::new(3.0, -4.0);
//! assert_eq!(ofs.magnitude(), 5.0);
//! ```

pub mod clock;
pub mod config;
pub mod consts;
pub mod device;
pub mod geometry;
pub mod guide;
pub mod notify;
pub mod prelude;
pub mod store;
