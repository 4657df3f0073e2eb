//! # Module: optimize
//!
//! Versioned, reversible tuning of deployed components.
//!
//! Data flows top-down at load time and bottom-up at apply time:
//!
//! ```text
//! manager ─▶ parser ─▶ config ─▶ entrance ─▶ item ─▶ optimizer ─▶ Session
//! ```
//!
//! ## Sub-modules
//! - [`optimizer`]: query/modify statement pair for one tunable
//! - [`item`]: variables, system config, SQL statements, SQL scripts, delays
//! - [`entrance`]: ordered apply, reverse-order recover, applied-item bookkeeping
//! - [`config`]: declarations and optimizer bindings per component
//! - [`parser`]: document schema parsers and their version registry
//! - [`version`]: component versions and nearest-version file search
//! - [`manager`]: facade tying discovery, parsing and config together

pub mod config;
pub mod entrance;
pub mod item;
pub mod manager;
pub mod optimizer;
pub mod parser;
pub mod version;

pub use config::{OptimizeConfig, StageMap};
pub use entrance::{EntranceDecl, OptimizeEntrance};
pub use item::{ExecContext, Item, ItemDecl, OptimizeType, SqlFileSpec};
pub use manager::{ManagerConfig, OptimizeManager};
pub use optimizer::{Optimizer, OptimizerSet};
pub use parser::{OptimizeParser, ParserRegistry, ParserV01};
pub use version::ComponentVersion;
