//! Board profiles.
//!
//! A profile names everything board-specific: where releases land, which
//! make target produces them, the Yocto layers and image, and the boot
//! image layout. Built-in defaults describe the LS1043ARDB; a TOML file may
//! override any subset of keys.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::artifact::RELEASE_ARCHIVE_SUFFIX;
use crate::bitbake::DEFAULT_IMAGE_TARGET;
use crate::deploy::{ImageArtifactSet, ImageComponent, DEFAULT_REMOTE_DEVICE, DEFAULT_REMOTE_HOST};
use crate::layers::{DEFAULT_RUN_LAYER, DEFAULT_SDK_LAYERS};
use crate::network::{DEFAULT_PREFIX_LEN, DEFAULT_SUBNET_ADDRESS};

pub const DEFAULT_BOARD: &str = "ls1043ardb";
pub const DEFAULT_MAKE_TARGET: &str = "ls1043ardb_robust_proxies_release";
pub const DEFAULT_RELEASE_DIR: &str = "releases/ls1043ardb_robust_proxies";
pub const DEFAULT_BUILD_DIR: &str = "build_ls1043ardb";
pub const DEFAULT_SETUP_SCRIPT: &str = "SOURCE_THIS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProfile {
    pub host: String,
    pub device: String,
    /// Host-side address bound when the board subnet is missing.
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardProfile {
    pub board: String,
    /// Relative to the ProvenCore root unless absolute.
    pub release_dir: PathBuf,
    pub archive_suffix: Vec<String>,
    pub make_target: String,
    /// Relative to the SDK root.
    pub build_dir: String,
    pub machine: String,
    pub image_target: String,
    /// Relative to the build directory.
    pub setup_script: String,
    pub run_layer: String,
    /// Relative to the SDK root, in BitBake order.
    pub layers: Vec<String>,
    pub images: ImageArtifactSet,
    pub remote: RemoteProfile,
}

impl Default for BoardProfile {
    fn default() -> Self {
        Self {
            board: DEFAULT_BOARD.to_string(),
            release_dir: PathBuf::from(DEFAULT_RELEASE_DIR),
            archive_suffix: RELEASE_ARCHIVE_SUFFIX.iter().map(|s| s.to_string()).collect(),
            make_target: DEFAULT_MAKE_TARGET.to_string(),
            build_dir: DEFAULT_BUILD_DIR.to_string(),
            machine: DEFAULT_BOARD.to_string(),
            image_target: DEFAULT_IMAGE_TARGET.to_string(),
            setup_script: DEFAULT_SETUP_SCRIPT.to_string(),
            run_layer: DEFAULT_RUN_LAYER.to_string(),
            layers: DEFAULT_SDK_LAYERS.iter().map(|s| s.to_string()).collect(),
            images: ImageArtifactSet::ls1043ardb(),
            remote: RemoteProfile {
                host: DEFAULT_REMOTE_HOST.to_string(),
                device: DEFAULT_REMOTE_DEVICE.to_string(),
                address: DEFAULT_SUBNET_ADDRESS,
                prefix_len: DEFAULT_PREFIX_LEN,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BoardProfileToml {
    board: Option<String>,
    release_dir: Option<PathBuf>,
    archive_suffix: Option<Vec<String>>,
    make_target: Option<String>,
    build_dir: Option<String>,
    machine: Option<String>,
    image_target: Option<String>,
    setup_script: Option<String>,
    run_layer: Option<String>,
    layers: Option<Vec<String>>,
    images: Option<Vec<ImageToml>>,
    remote: Option<RemoteToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    name: String,
    path: PathBuf,
    sector: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RemoteToml {
    host: Option<String>,
    device: Option<String>,
    address: Option<Ipv4Addr>,
    prefix_len: Option<u8>,
}

impl BoardProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading board profile '{}'", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("parsing board profile '{}'", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: BoardProfileToml = toml::from_str(text)?;
        let defaults = Self::default();

        let images = match raw.images {
            Some(images) => ImageArtifactSet::new(
                images
                    .into_iter()
                    .map(|i| ImageComponent::new(i.name, i.path, i.sector))
                    .collect(),
            ),
            None => defaults.images,
        };
        let remote = match raw.remote {
            Some(r) => RemoteProfile {
                host: r.host.unwrap_or(defaults.remote.host),
                device: r.device.unwrap_or(defaults.remote.device),
                address: r.address.unwrap_or(defaults.remote.address),
                prefix_len: r.prefix_len.unwrap_or(defaults.remote.prefix_len),
            },
            None => defaults.remote,
        };
        let board = raw.board.unwrap_or(defaults.board);

        let profile = Self {
            machine: raw.machine.unwrap_or_else(|| board.clone()),
            board,
            release_dir: raw.release_dir.unwrap_or(defaults.release_dir),
            archive_suffix: raw.archive_suffix.unwrap_or(defaults.archive_suffix),
            make_target: raw.make_target.unwrap_or(defaults.make_target),
            build_dir: raw.build_dir.unwrap_or(defaults.build_dir),
            image_target: raw.image_target.unwrap_or(defaults.image_target),
            setup_script: raw.setup_script.unwrap_or(defaults.setup_script),
            run_layer: raw.run_layer.unwrap_or(defaults.run_layer),
            layers: raw.layers.unwrap_or(defaults.layers),
            images,
            remote,
        };
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<()> {
        if self.board.trim().is_empty() {
            bail!("board must not be empty");
        }
        if self.archive_suffix.iter().all(|s| s.is_empty()) {
            bail!("archive_suffix must name at least one non-empty part");
        }
        if self.images.components().is_empty() {
            bail!("at least one [[images]] entry is required");
        }
        for component in self.images.components() {
            if component.offset_bytes().is_none() {
                bail!(
                    "image '{}' sector {} overflows the byte offset",
                    component.name,
                    component.sector
                );
            }
            if component.path.is_absolute() {
                bail!(
                    "image '{}' path must be relative to the deploy directory, got '{}'",
                    component.name,
                    component.path.display()
                );
            }
        }
        if self.remote.prefix_len > 32 {
            bail!("remote.prefix_len must be at most 32, got {}", self.remote.prefix_len);
        }
        if self.run_layer.contains('/') {
            bail!("run_layer must be a single directory name, got '{}'", self.run_layer);
        }
        Ok(())
    }

    /// Release directory resolved against the ProvenCore root.
    pub fn release_dir_in(&self, provencore: &Path) -> PathBuf {
        provencore.join(&self.release_dir)
    }

    /// Yocto build directory resolved against the SDK root.
    pub fn build_dir_in(&self, sdk: &Path) -> PathBuf {
        sdk.join(&self.build_dir)
    }

    pub fn setup_script_in(&self, sdk: &Path) -> PathBuf {
        self.build_dir_in(sdk).join(&self.setup_script)
    }

    pub fn suffix_parts(&self) -> Vec<&str> {
        self.archive_suffix.iter().map(String::as_str).collect()
    }
}
