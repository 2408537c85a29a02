//! Configuration for Magic Areas
//!
//! Areas are configured in `magic_areas.yaml` in the config directory:
//!
//! ```yaml
//! areas:
//!   - area: kitchen
//!     clear_timeout: 120
//!     features:
//!       humidity:
//!   - area: global
//!     type: meta
//! ```
//!
//! `!include path` and `!env_var NAME` tags are resolved while loading.

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, YamlLoader};
pub use schema::*;

pub use serde_yaml::Value;
