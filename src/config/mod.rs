pub mod loader;
pub mod schema;

pub use loader::{load, load_from_path, validate};
pub use schema::{ConnectMode, FetchMode, LocalSettings, LoggingSettings, RelaySettings, Settings};
