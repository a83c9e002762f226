//! Configuration Module
//!
//! Project catalog, AWS profile enumeration and tunnel settings.

pub mod profiles;
pub mod project;
pub mod settings;
pub mod storage;

pub use profiles::{aws_config_path, parse_profiles, read_profiles};
pub use project::{parse_port, DatabaseEngine, ProjectDefinition, RdsType};
pub use settings::{RetryPolicy, TunnelSettings};
pub use storage::{config_dir, load_settings, settings_file, ProjectStore, StorageError};
