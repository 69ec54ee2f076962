pub mod loader;
pub mod settings;

pub use loader::{load_config, load_secrets};
pub use settings::{Config, FetchMode, LayerConfig, Secrets};
