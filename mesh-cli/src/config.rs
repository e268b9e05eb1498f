//! On-disk config file for `mesh-cli dev`, loaded from `mesh.toml` in a
//! working directory. `mesh-core` itself knows nothing about files; this is
//! purely the CLI's convenience layer on top of [`mesh_core::NodeConfig`].

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_device_type() -> String {
    "desktop".to_string()
}

fn default_mesh_port() -> u16 {
    mesh_core::config::DEFAULT_MESH_PORT
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileConfig {
    pub device_id: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    pub hostname_prefix: String,
    pub sidecar_path: String,
    pub state_dir: String,
    pub auth_key: Option<String>,
    #[serde(default)]
    pub user_designated_primary: bool,
    #[serde(default = "default_mesh_port")]
    pub mesh_port: u16,
}

const TEMPLATE: &str = r#"# mesh-cli configuration
device_id = "REPLACE_WITH_A_STABLE_ID"
device_type = "desktop"
hostname_prefix = "mesh"
sidecar_path = "/usr/local/bin/mesh-sidecar"
state_dir = "./state"
# auth_key = "tskey-..."
user_designated_primary = false
# mesh_port = 52742
"#;

impl FileConfig {
    /// Loads `mesh.toml` from `dir`. If it doesn't exist yet, writes the
    /// template and returns an error asking the operator to fill it in and
    /// rerun — the same first-run contract the rest of the pack's CLIs use.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join("mesh.toml");
        if !path.exists() {
            fs::create_dir_all(dir)?;
            fs::write(&path, TEMPLATE)?;
            anyhow::bail!(
                "wrote a default config to {}; edit it and rerun",
                path.display()
            );
        }
        let content = fs::read_to_string(&path)?;
        let config: FileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn write_template(dir: &Path) -> anyhow::Result<std::path::PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join("mesh.toml");
        if path.exists() {
            anyhow::bail!("{} already exists", path.display());
        }
        fs::write(&path, TEMPLATE)?;
        Ok(path)
    }

    pub fn into_node_config(self) -> mesh_core::NodeConfig {
        let mut config = mesh_core::NodeConfig::new(
            self.device_id,
            self.device_type,
            self.hostname_prefix,
            self.sidecar_path,
            self.state_dir,
        );
        config.auth_key = self.auth_key;
        config.user_designated_primary = self.user_designated_primary;
        config.mesh_port = self.mesh_port;
        config
    }
}
