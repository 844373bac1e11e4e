// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! File-backed configuration loading shared by the oracle sync binaries.
//!
//! YAML (`.yaml`/`.yml`) and JSON files are supported. Before parsing, every
//! `${VAR_NAME}` placeholder is replaced with the value of the matching
//! environment variable so secrets never have to live in the file itself.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::OnceLock;

pub trait Config: Serialize + DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let content = substitute_env_vars(&content);
        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {:?}", path))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {:?}", path))?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Substitute environment variables in the format ${VAR_NAME}.
///
/// Placeholders whose variable is not set are kept verbatim so that
/// validation can report them.
pub fn substitute_env_vars(content: &str) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex is valid")
    });

    re.replace_all(content, |caps: &regex::Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    "Environment variable {} not found, keeping placeholder",
                    &caps[1]
                );
                caps[0].to_string()
            }
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "kebab-case")]
    struct Sample {
        rpc_url: String,
        batch_size: u64,
    }

    impl Config for Sample {}

    #[test]
    fn test_substitute_env_vars() {
        std::env::set_var("ORACLE_SYNC_CONFIG_TEST_URL", "http://node:8545");
        let out = substitute_env_vars("url: ${ORACLE_SYNC_CONFIG_TEST_URL}/rpc");
        assert_eq!(out, "url: http://node:8545/rpc");

        let kept = substitute_env_vars("key: ${ORACLE_SYNC_CONFIG_TEST_MISSING}");
        assert_eq!(kept, "key: ${ORACLE_SYNC_CONFIG_TEST_MISSING}");
    }

    #[test]
    fn test_load_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("sample.yaml");
        std::fs::write(&yaml_path, "rpc-url: http://localhost:8545\nbatch-size: 10\n").unwrap();
        let from_yaml = Sample::load(&yaml_path).unwrap();
        assert_eq!(from_yaml.batch_size, 10);

        let json_path = dir.path().join("sample.json");
        from_yaml.save(&json_path).unwrap();
        let from_json = Sample::load(&json_path).unwrap();
        assert_eq!(from_yaml, from_json);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Sample::load(dir.path().join("absent.yaml")).is_err());
    }
}
