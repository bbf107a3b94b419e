use std::path::Path;

use anyhow::Context as _;
#[allow(unused_imports)]
use log::debug;
use serde::{Deserialize, Serialize};

// Per-workspace configuration stored at <baseDir>/config.toml. The file
// belongs to the user; we only create it when it's missing so the command
// runners have something to execute.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub command: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PreviewConfig {
    pub command: String,
    pub url: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            command: "go run main.go".to_owned(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            command: "npm run dev".to_owned(),
            url: "http://localhost:3000".to_owned(),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            preview: PreviewConfig::default(),
        }
    }
}

impl WorkspaceConfig {
    // Loads <base_dir>/config.toml, writing the defaults there first if the
    // file doesn't exist yet.
    pub async fn load(base_dir: &Path) -> anyhow::Result<Self> {
        let config_path = base_dir.join("config.toml");
        if !tokio::fs::try_exists(&config_path)
            .await
            .with_context(|| format!("checking for {:?}", config_path))?
        {
            let config = Self::default();
            config.save(base_dir).await.context("writing default config")?;
            return Ok(config);
        }

        let raw = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("reading {:?}", config_path))?;
        toml::from_str(&raw).with_context(|| format!("parsing {:?}", config_path))
    }

    pub async fn save(&self, base_dir: &Path) -> anyhow::Result<()> {
        let config_path = base_dir.join("config.toml");
        let raw = toml::to_string(self).context("encoding config")?;
        tokio::fs::write(&config_path, raw)
            .await
            .with_context(|| format!("writing {:?}", config_path))
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[googletest::test]
    #[tokio::test]
    async fn load_creates_default_file() {
        let tmp_dir = TempDir::new().expect("couldn't make tempdir");
        let config = WorkspaceConfig::load(tmp_dir.path()).await.unwrap();
        assert_eq!(config, WorkspaceConfig::default());

        // The defaults must actually have been persisted.
        let raw = std::fs::read_to_string(tmp_dir.path().join("config.toml")).unwrap();
        let reparsed: WorkspaceConfig = toml::from_str(&raw).unwrap();
        assert_eq!(reparsed, config);
    }

    #[googletest::test]
    #[tokio::test]
    async fn load_reads_existing_file() {
        let tmp_dir = TempDir::new().expect("couldn't make tempdir");
        let config_toml = r#"
            [run]
            command = "cargo run"

            [preview]
            command = "python -m http.server"
            url = "http://localhost:8000"
        "#;
        std::fs::write(tmp_dir.path().join("config.toml"), config_toml).unwrap();

        let config = WorkspaceConfig::load(tmp_dir.path()).await.unwrap();
        expect_that!(config.run.command, eq("cargo run"));
        expect_that!(config.preview.url, eq("http://localhost:8000"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn load_rejects_unknown_fields() {
        let tmp_dir = TempDir::new().expect("couldn't make tempdir");
        std::fs::write(
            tmp_dir.path().join("config.toml"),
            "[run]\ncommand = \"x\"\nbogus = 1\n",
        )
        .unwrap();
        expect_that!(WorkspaceConfig::load(tmp_dir.path()).await, err(anything()));
    }
}
