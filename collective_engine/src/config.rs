/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Engine configuration.
//!
//! Settings come from defaults, environment variables, or YAML files, and
//! can be layered with [`EngineConfig::merge`].

use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use strum::IntoEnumIterator;

use crate::kind::CollectiveKind;
use crate::kind::Tag;

/// Tag used by the engine's own barrier.
pub const DEFAULT_SYSTEM_TAG: Tag = -1;

/// When a send action counts as complete.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SendCompletion {
    /// As soon as the transport accepts the message.
    #[default]
    Injection,
    /// When the transport's injection acknowledgement comes back.
    Acknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Algorithm selected per collective kind. Kinds not listed use the
    /// built-in default.
    pub algorithms: BTreeMap<CollectiveKind, String>,
    pub send_completion: SendCompletion,
    /// Tag of the barrier run by `wait_barrier`. Negative tags are reserved
    /// for the engine.
    pub system_tag: Tag,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            algorithms: BTreeMap::new(),
            send_completion: SendCompletion::default(),
            system_tag: DEFAULT_SYSTEM_TAG,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `COLLECTIVE_*` environment variables:
    /// `COLLECTIVE_ALGORITHM_<KIND>` (for example
    /// `COLLECTIVE_ALGORITHM_ALLREDUCE=recursive_doubling`),
    /// `COLLECTIVE_SEND_COMPLETION` and `COLLECTIVE_SYSTEM_TAG`. Values that
    /// do not parse are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        for kind in CollectiveKind::iter() {
            let key = format!("COLLECTIVE_ALGORITHM_{}", kind.to_string().to_uppercase());
            if let Some(name) = lookup(&key) {
                config.algorithms.insert(kind, name);
            }
        }

        if let Some(val) = lookup("COLLECTIVE_SEND_COMPLETION") {
            if let Ok(parsed) = SendCompletion::from_str(&val) {
                config.send_completion = parsed;
            }
        }

        if let Some(val) = lookup("COLLECTIVE_SYSTEM_TAG") {
            if let Ok(parsed) = val.parse::<Tag>() {
                config.system_tag = parsed;
            }
        }

        config
    }

    /// Load configuration from a YAML file. Missing keys take defaults.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, anyhow::Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String, anyhow::Error> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Merge with another configuration, with the other taking precedence
    /// wherever it differs from the defaults.
    pub fn merge(&mut self, other: &Self) {
        let defaults = Self::default();
        self.algorithms.extend(
            other
                .algorithms
                .iter()
                .map(|(kind, name)| (*kind, name.clone())),
        );
        if other.send_completion != defaults.send_completion {
            self.send_completion = other.send_completion;
        }
        if other.system_tag != defaults.system_tag {
            self.system_tag = other.system_tag;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.algorithms.is_empty());
        assert_eq!(config.send_completion, SendCompletion::Injection);
        assert_eq!(config.system_tag, -1);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("COLLECTIVE_ALGORITHM_ALLREDUCE", "recursive_doubling"),
            ("COLLECTIVE_ALGORITHM_REDUCE_SCATTER", "halving"),
            ("COLLECTIVE_SEND_COMPLETION", "acknowledged"),
            ("COLLECTIVE_SYSTEM_TAG", "not a number"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(
            config.algorithms.get(&CollectiveKind::Allreduce).map(String::as_str),
            Some("recursive_doubling")
        );
        assert_eq!(
            config.algorithms.get(&CollectiveKind::ReduceScatter).map(String::as_str),
            Some("halving")
        );
        assert_eq!(config.send_completion, SendCompletion::Acknowledged);
        assert_eq!(config.system_tag, DEFAULT_SYSTEM_TAG);
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "algorithms:\n  alltoall: direct\nsystem_tag: -7").unwrap();
        let config = EngineConfig::from_yaml(file.path()).unwrap();
        assert_eq!(
            config.algorithms.get(&CollectiveKind::Alltoall).map(String::as_str),
            Some("direct")
        );
        assert_eq!(config.system_tag, -7);
        assert_eq!(config.send_completion, SendCompletion::Injection);

        let yaml = config.to_yaml().unwrap();
        assert_eq!(EngineConfig::from_yaml_str(&yaml).unwrap(), config);
        assert!(EngineConfig::from_yaml_str("send_completion: sometimes").is_err());
    }

    #[test]
    fn test_merge() {
        let mut base = EngineConfig::default();
        base.algorithms
            .insert(CollectiveKind::Allreduce, "halving".to_string());
        base.system_tag = -3;

        let mut other = EngineConfig::default();
        other
            .algorithms
            .insert(CollectiveKind::Allreduce, "recursive_doubling".to_string());
        other.send_completion = SendCompletion::Acknowledged;

        base.merge(&other);
        assert_eq!(
            base.algorithms.get(&CollectiveKind::Allreduce).map(String::as_str),
            Some("recursive_doubling")
        );
        assert_eq!(base.send_completion, SendCompletion::Acknowledged);
        assert_eq!(base.system_tag, -3);
    }
}
