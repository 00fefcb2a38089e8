//! fiaas deploy daemon: watches application resources and feeds them to the
//! reconciler
//!
//! - [`config`]: command line and environment configuration
//! - [`watch`]: application resources as CREATE/UPDATE/DELETE changes
//! - [`dispatcher`]: per-application FIFO workers with deletion gating
//! - [`startup`]: CRD installation and spec source detection

#![deny(missing_docs)]

pub mod config;
pub mod dispatcher;
pub mod startup;
pub mod watch;

pub use config::Cli;
pub use dispatcher::{AppReconciler, Dispatcher, DispatcherConfig};
pub use watch::{AppChange, ChangeTracker, Operation};
