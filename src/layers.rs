//! `bblayers.conf` generation.
//!
//! BitBake reads its layer search path from `<build>/conf/bblayers.conf`.
//! The last layer lives inside the run's workspace, so the file is rendered
//! from scratch on every run and replaces whatever was there before.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::workspace::write_atomic;

/// Layers of the LS1043ARDB Yocto SDK, relative to the SDK root, in the
/// order BitBake must see them.
pub const DEFAULT_SDK_LAYERS: &[&str] = &[
    "sources/poky/meta",
    "sources/poky/meta-poky",
    "sources/poky/meta-yocto-bsp",
    "sources/meta-openembedded/meta-oe",
    "sources/meta-openembedded/meta-multimedia",
    "sources/meta-openembedded/meta-python",
    "sources/meta-openembedded/meta-networking",
    "sources/meta-openembedded/meta-gnome",
    "sources/meta-openembedded/meta-filesystems",
    "sources/meta-openembedded/meta-webserver",
    "sources/meta-openembedded/meta-perl",
    "sources/meta-virtualization",
    "sources/meta-cloud-services",
    "sources/meta-security",
    "sources/meta-freescale",
    "sources/meta-freescale-distro",
    "sources/meta-qoriq",
];

/// Layer shipped inside the release archive.
pub const DEFAULT_RUN_LAYER: &str = "meta-provenrun";

const HEADER: &str = "\
# POKY_BBLAYERS_CONF_VERSION is increased each time build/conf/bblayers.conf
# changes incompatibly
POKY_BBLAYERS_CONF_VERSION = \"2\"

BBPATH = \"${TOPDIR}\"
BBFILES ?= \"\"

BBLAYERS ?= \" \\
";

const FOOTER: &str = "    \"\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayerConfig {
    fixed: Vec<PathBuf>,
    run_layer: PathBuf,
}

impl BuildLayerConfig {
    pub fn new(fixed: Vec<PathBuf>, run_layer: PathBuf) -> Self {
        Self { fixed, run_layer }
    }

    /// Fixed layers resolved against `sdk_root`, plus `<workspace>/<run_layer>`.
    pub fn for_sdk<S: AsRef<str>>(
        sdk_root: &Path,
        layers: &[S],
        workspace: &Path,
        run_layer: &str,
    ) -> Self {
        let fixed = layers
            .iter()
            .map(|rel| sdk_root.join(rel.as_ref()))
            .collect();
        Self::new(fixed, workspace.join(run_layer))
    }

    /// Every layer in the order it is written.
    pub fn layers(&self) -> impl Iterator<Item = &Path> {
        self.fixed
            .iter()
            .map(PathBuf::as_path)
            .chain(std::iter::once(self.run_layer.as_path()))
    }

    pub fn run_layer(&self) -> &Path {
        &self.run_layer
    }

    pub fn render(&self) -> String {
        let mut out = String::from(HEADER);
        for layer in self.layers() {
            out.push_str("    ");
            out.push_str(&layer.display().to_string());
            out.push_str(" \\\n");
        }
        out.push_str(FOOTER);
        out
    }

    /// Write `<build_dir>/conf/bblayers.conf`, replacing any previous file.
    pub fn write(&self, build_dir: &Path) -> Result<PathBuf> {
        let path = conf_path(build_dir);
        write_atomic(&path, self.render().as_bytes())
            .with_context(|| format!("writing layer configuration '{}'", path.display()))?;
        Ok(path)
    }
}

pub fn conf_path(build_dir: &Path) -> PathBuf {
    build_dir.join("conf").join("bblayers.conf")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample(workspace: &str) -> BuildLayerConfig {
        BuildLayerConfig::for_sdk(
            Path::new("/sdk"),
            &["sources/poky/meta", "sources/meta-qoriq"],
            Path::new(workspace),
            DEFAULT_RUN_LAYER,
        )
    }

    #[test]
    fn test_render_exact_bytes() {
        let expected = "\
# POKY_BBLAYERS_CONF_VERSION is increased each time build/conf/bblayers.conf
# changes incompatibly
POKY_BBLAYERS_CONF_VERSION = \"2\"

BBPATH = \"${TOPDIR}\"
BBFILES ?= \"\"

BBLAYERS ?= \" \\
    /sdk/sources/poky/meta \\
    /sdk/sources/meta-qoriq \\
    /tmp/2026-10-18T09h05m.X.ls1043ardb/meta-provenrun \\
    \"

";
        assert_eq!(sample("/tmp/2026-10-18T09h05m.X.ls1043ardb").render(), expected);
    }

    #[test]
    fn test_default_layers_keep_declared_order() {
        let config =
            BuildLayerConfig::for_sdk(Path::new("/sdk"), DEFAULT_SDK_LAYERS, Path::new("/w"), "meta-provenrun");
        let layers: Vec<_> = config.layers().map(Path::to_path_buf).collect();
        assert_eq!(layers.len(), DEFAULT_SDK_LAYERS.len() + 1);
        assert_eq!(layers[0], PathBuf::from("/sdk/sources/poky/meta"));
        assert_eq!(layers[16], PathBuf::from("/sdk/sources/meta-qoriq"));
        assert_eq!(layers[17], PathBuf::from("/w/meta-provenrun"));
    }

    #[test]
    fn test_new_workspace_changes_only_last_layer() {
        let a = sample("/tmp/run-a").render();
        let b = sample("/tmp/run-b").render();
        let diff: Vec<_> = a
            .lines()
            .zip(b.lines())
            .filter(|(x, y)| x != y)
            .collect();
        assert_eq!(
            diff,
            vec![(
                "    /tmp/run-a/meta-provenrun \\",
                "    /tmp/run-b/meta-provenrun \\"
            )]
        );
        assert!(sample("/tmp/run-b").run_layer().starts_with("/tmp/run-b"));
    }

    #[test]
    fn test_write_overwrites_previous_file() {
        let temp = TempDir::new().unwrap();
        let build_dir = temp.path().join("build_ls1043ardb");
        fs::create_dir_all(build_dir.join("conf")).unwrap();
        fs::write(conf_path(&build_dir), "BBLAYERS ?= \"/stale\"\n").unwrap();

        let path = sample("/tmp/run-a").write(&build_dir).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, sample("/tmp/run-a").render());
        assert!(!written.contains("/stale"));

        sample("/tmp/run-b").write(&build_dir).unwrap();
        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("/tmp/run-b/meta-provenrun"));
        assert!(!rewritten.contains("/tmp/run-a"));
    }

    #[test]
    fn test_write_creates_conf_dir() {
        let temp = TempDir::new().unwrap();
        let path = sample("/w").write(temp.path()).unwrap();
        assert_eq!(path, temp.path().join("conf/bblayers.conf"));
        assert!(path.is_file());
    }
}
