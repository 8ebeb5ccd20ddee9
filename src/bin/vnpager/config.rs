use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use vnpager::PagerOptions;

#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub name: String,
    pub page_size: Option<u32>,
    pub cluster_bytes: Option<u64>,
    pub frame_pool_pages: Option<usize>,
    pub scratch_pages: Option<usize>,
}

impl Profile {
    /// Overlays the profile onto `options`.
    pub fn apply(&self, options: &mut PagerOptions) {
        if let Some(page_size) = self.page_size {
            options.page_size = page_size;
        }
        if let Some(cluster_bytes) = self.cluster_bytes {
            options.cluster_bytes = cluster_bytes;
        }
        if let Some(frames) = self.frame_pool_pages {
            options.frame_pool_pages = frames;
        }
        if let Some(scratch) = self.scratch_pages {
            options.scratch_pages = scratch;
        }
    }
}

#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
    profiles: BTreeMap<String, Profile>,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        let profiles = parse_profiles(&data)?;
        Ok(Self {
            path,
            data,
            profiles,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_profile_name(&self) -> Option<&str> {
        self.data
            .default_profile
            .as_deref()
            .filter(|name| self.profiles.contains_key(*name))
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    pub fn set_default_profile(&mut self, name: Option<&str>) -> Result<(), ConfigError> {
        if let Some(name) = name {
            if !self.profiles.contains_key(name) {
                return Err(ConfigError::ProfileNotFound {
                    name: name.to_string(),
                });
            }
            self.data.default_profile = Some(name.to_string());
        } else {
            self.data.default_profile = None;
        }
        Ok(())
    }

    pub fn upsert_profile(&mut self, name: &str, update: ProfileUpdate) -> Result<(), ConfigError> {
        let entry = self.data.profiles.entry(name.to_string()).or_default();
        if let Some(page_size) = update.page_size {
            entry.page_size = Some(page_size);
        }
        if let Some(cluster_bytes) = update.cluster_bytes {
            entry.cluster_bytes = Some(cluster_bytes);
        }
        if let Some(frames) = update.frame_pool_pages {
            entry.frame_pool_pages = Some(frames);
        }
        if let Some(scratch) = update.scratch_pages {
            entry.scratch_pages = Some(scratch);
        }
        self.profiles = parse_profiles(&self.data)?;
        Ok(())
    }

    pub fn delete_profile(&mut self, name: &str) -> Result<(), ConfigError> {
        if self.data.profiles.remove(name).is_none() {
            return Err(ConfigError::ProfileNotFound {
                name: name.to_string(),
            });
        }
        if self.data.default_profile.as_deref() == Some(name) {
            self.data.default_profile = None;
        }
        self.profiles = parse_profiles(&self.data)?;
        Ok(())
    }

    pub fn persist(&self) -> Result<PathBuf, ConfigError> {
        let target = match self.path.clone().or_else(default_config_path) {
            Some(target) => target,
            None => return Err(ConfigError::NoConfigPath),
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized = toml::to_string_pretty(&self.data)
            .map_err(|source| ConfigError::Serialize { source })?;
        fs::write(&target, serialized).map_err(|source| ConfigError::Write {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_profiles(data: &RawConfig) -> Result<BTreeMap<String, Profile>, ConfigError> {
    let mut profiles = BTreeMap::new();
    for (name, raw) in &data.profiles {
        let profile = Profile {
            name: name.clone(),
            page_size: raw.page_size,
            cluster_bytes: raw.cluster_bytes,
            frame_pool_pages: raw.frame_pool_pages,
            scratch_pages: raw.scratch_pages,
        };
        let mut options = PagerOptions::default();
        profile.apply(&mut options);
        if let Err(err) = options.validate() {
            return Err(ConfigError::InvalidProfile {
                profile: name.clone(),
                reason: err.to_string(),
            });
        }
        profiles.insert(name.clone(), profile);
    }
    if let Some(default_name) = data.default_profile.as_ref() {
        if !profiles.contains_key(default_name) {
            return Err(ConfigError::ProfileNotFound {
                name: default_name.clone(),
            });
        }
    }
    Ok(profiles)
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    profiles: BTreeMap<String, RawProfile>,
    #[serde(default)]
    default_profile: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawProfile {
    page_size: Option<u32>,
    cluster_bytes: Option<u64>,
    frame_pool_pages: Option<usize>,
    scratch_pages: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub page_size: Option<u32>,
    pub cluster_bytes: Option<u64>,
    pub frame_pool_pages: Option<usize>,
    pub scratch_pages: Option<usize>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize CLI config: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("failed to write CLI config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String },
    #[error("profile '{profile}' is invalid: {reason}")]
    InvalidProfile { profile: String, reason: String },
    #[error("no config directory found; pass --config or set VNPAGER_CONFIG")]
    NoConfigPath,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("vnpager").join("cli.toml"))
}
