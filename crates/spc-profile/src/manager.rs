use std::path::{Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::profile::ConnectionProfile;

const PROFILE_EXTENSION: &str = "toml";

/// Loads and saves connection profiles, one TOML file per profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileManager {
    dir: PathBuf,
    profiles: Vec<ConnectionProfile>,
}

impl ProfileManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            profiles: Vec::new(),
        }
    }

    /// Manager rooted at the per-user profile directory
    pub async fn with_default_dir() -> Result<Self, ProfileManagerError> {
        Ok(Self::new(Self::default_dir().await?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[instrument(skip(self), level = "info")]
    pub async fn load_profiles(&mut self) -> Result<(), ProfileManagerError> {
        info!("Starting to load profiles from {}", self.dir.display());

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .context("Failed to read profiles directory")
            .map_err(|e| {
                error!(
                    "Failed to read profiles directory {}: {}",
                    self.dir.display(),
                    e
                );
                ProfileManagerError::DirectoryReadFailed {
                    path: self.dir.clone(),
                    source: e,
                }
            })?;

        self.profiles.clear();
        let mut loaded_count = 0;
        let mut failed_count = 0;

        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Failed to read directory entry")
            .map_err(|e| {
                error!(
                    "Failed to read directory entry in {}: {}",
                    self.dir.display(),
                    e
                );
                ProfileManagerError::DirectoryEntryReadFailed {
                    directory: self.dir.clone(),
                    source: e,
                }
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PROFILE_EXTENSION) {
                debug!("Skipping non-profile entry: {}", path.display());
                continue;
            }

            match self.load_profile_file(&path).await {
                Ok(profile) => {
                    loaded_count += 1;
                    debug!("Successfully loaded profile from: {}", path.display());
                    self.profiles.push(profile);
                }
                Err(e) => {
                    failed_count += 1;
                    warn!(
                        "Failed to load profile from {}: {}. Skipping...",
                        path.display(),
                        e
                    );
                }
            }
        }

        self.profiles.sort_by(|a, b| a.name.cmp(&b.name));

        info!(
            "Finished loading profiles: {} loaded, {} failed",
            loaded_count, failed_count
        );

        Ok(())
    }

    /// Load a single profile by name, replacing any copy already held
    #[instrument(skip(self), level = "debug")]
    pub async fn load_profile(&mut self, name: &str) -> Result<&ConnectionProfile, ProfileManagerError> {
        let path = self.profile_path(name);
        if tokio::fs::metadata(&path).await.is_err() {
            warn!("Profile file does not exist: {}", path.display());
            return Err(ProfileManagerError::ProfileNotFound {
                name: name.to_string(),
                path,
            });
        }

        let profile = self.load_profile_file(&path).await?;
        self.profiles.retain(|p| p.name != profile.name);
        self.profiles.push(profile);

        self.profiles
            .last()
            .ok_or_else(|| ProfileManagerError::ProfileNotFound {
                name: name.to_string(),
                path,
            })
    }

    async fn load_profile_file(&self, path: &Path) -> Result<ConnectionProfile, ProfileManagerError> {
        let content = tokio::fs::read(path)
            .await
            .context("Failed to read profile file")
            .map_err(|e| {
                error!("Failed to read profile file {}: {}", path.display(), e);
                ProfileManagerError::ProfileFileReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;

        debug!(
            "Successfully read {} bytes from {}",
            content.len(),
            path.display()
        );

        let profile: ConnectionProfile = toml::from_slice(&content)
            .context("Failed to parse profile file")
            .map_err(|e| {
                error!("Failed to parse profile file {}: {}", path.display(), e);
                ProfileManagerError::ProfileParsingFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;

        info!(
            "Successfully loaded profile '{}' from {}",
            profile.name,
            path.display()
        );

        Ok(profile)
    }

    /// Write a profile to disk and keep it in the loaded set
    #[instrument(skip(self, profile), fields(profile = %profile.name), level = "debug")]
    pub async fn save_profile(&mut self, profile: ConnectionProfile) -> Result<(), ProfileManagerError> {
        if tokio::fs::metadata(&self.dir).await.is_err() {
            info!(
                "Profiles directory doesn't exist, creating: {}",
                self.dir.display()
            );
            tokio::fs::create_dir_all(&self.dir)
                .await
                .context("Failed to create profiles directory")
                .map_err(|e| {
                    error!(
                        "Failed to create profiles directory {}: {}",
                        self.dir.display(),
                        e
                    );
                    ProfileManagerError::DirectoryCreationFailed {
                        path: self.dir.clone(),
                        source: e,
                    }
                })?;
        }

        let toml = toml::to_string_pretty(&profile)
            .context("Failed to serialize profile to TOML")
            .map_err(|e| {
                error!("Failed to serialize profile {}: {}", profile.name, e);
                ProfileManagerError::ProfileSerializationFailed { source: e }
            })?;
        let file_path = self.profile_path(&profile.name);

        tokio::fs::write(&file_path, toml)
            .await
            .context("Failed to write profile file")
            .map_err(|e| {
                error!("Failed to write profile file {}: {}", file_path.display(), e);
                ProfileManagerError::ProfileFileWriteFailed {
                    path: file_path.clone(),
                    source: e,
                }
            })?;

        info!(
            "Successfully saved profile '{}' at {}",
            profile.name,
            file_path.display()
        );

        self.profiles.retain(|p| p.name != profile.name);
        self.profiles.push(profile);
        Ok(())
    }

    #[instrument(level = "debug")]
    pub async fn default_dir() -> Result<PathBuf, ProfileManagerError> {
        debug!("Getting profiles directory");

        let proj_dirs = ProjectDirs::from("", "", "spconnect").ok_or_else(|| {
            error!("Failed to determine project directories - this usually indicates an unsupported OS or missing home directory");
            ProfileManagerError::ProjectDirectoriesUnavailable
        })?;

        let profiles_dir = proj_dirs.config_dir().join("profiles");
        debug!("Profiles directory resolved to: {}", profiles_dir.display());

        Ok(profiles_dir)
    }

    fn profile_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{PROFILE_EXTENSION}"))
    }

    pub fn get(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn profiles(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }
}


#[derive(Debug, Error)]
pub enum ProfileManagerError {
    #[error(
        "Project directories are unavailable - this usually indicates an unsupported OS or missing home directory"
    )]
    ProjectDirectoriesUnavailable,

    #[error("Failed to create directory '{path}': {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to read directory '{path}': {source}")]
    DirectoryReadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to read directory entry in '{directory}': {source}")]
    DirectoryEntryReadFailed {
        directory: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Profile '{name}' not found at '{path}'")]
    ProfileNotFound { name: String, path: PathBuf },

    #[error("Failed to read profile file '{path}': {source}")]
    ProfileFileReadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to write profile file '{path}': {source}")]
    ProfileFileWriteFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to parse profile file '{path}': {source}")]
    ProfileParsingFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to serialize profile: {source}")]
    ProfileSerializationFailed {
        #[source]
        source: anyhow::Error,
    },

    #[error("Profile '{profile}' has no site URL")]
    MissingUrl { profile: String },

    #[error("Secret '{variable}' is not set")]
    MissingSecret { variable: &'static str },

    #[error("Invalid URL '{value}': {source}")]
    InvalidUrl {
        value: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to read credential file '{path}': {source}")]
    CredentialFileReadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}
