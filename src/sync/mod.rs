//! Background group membership synchronization
//!
//! # Components
//!
//! - [`driver`]: Update driver claiming jobs and launching reconciliations
//! - [`reconciler`]: Fetch, diff and apply of one group's membership
//!
//! # Example
//!
//! ```ignore
//! use member_sync::sync::UpdateDriver;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! let driver = UpdateDriver::new(
//!     db,
//!     connector,
//!     config.driver,
//!     config.retry,
//!     config.upstream,
//!     metrics,
//!     shutdown_rx,
//! );
//! tokio::spawn(driver.run());
//! ```

pub mod driver;
pub mod reconciler;

pub use driver::{DriveReport, UpdateDriver};
pub use reconciler::{JobOutcome, Reconciler};
