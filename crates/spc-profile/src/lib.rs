pub mod config;
mod manager;
mod profile;

pub use config::{EnvSecrets, SecretSource, StaticSecrets};
pub use manager::{ProfileManager, ProfileManagerError};
pub use profile::{AuthMethod, ConnectionProfile};
