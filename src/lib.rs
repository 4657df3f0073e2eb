//! Versioned, reversible runtime tuning for deployed database clusters.
//!
//! Tuning definitions are YAML (or TOML) documents grouped per component and
//! component version.  The [`optimize::OptimizeManager`] finds and parses them;
//! the resulting [`optimize::OptimizeEntrance`]s apply variables, system
//! parameters, SQL statements and SQL scripts through a [`session::Session`]
//! and can recover what they applied in reverse order.

pub mod cli;
pub mod error;
pub mod expr;
pub mod logging;
pub mod optimize;
pub mod session;
pub mod value;

pub use error::{OptimizeError, Result};
pub use expr::{Condition, Expr};
pub use session::{CommandRunner, LocalCommandRunner, MemorySession, RecordingRunner, Session};
pub use value::{Params, TypedValue, ValueType};
