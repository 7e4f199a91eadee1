// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! User config layout.
//!
//! The user config is a YAML file at the project root named `config.yaml`.
//! It carries metadata about a run together with two lists of
//! __configuration entries__: what the run reads from the registry, and what
//! it writes back.
//!
//! ```yaml
//! run_metadata:
//!   description: SEIRS model run
//!   script: python3 model.py
//! read:
//!   - data_product: disease/sars_cov2/*
//! write:
//!   - data_product: model/output/*
//! ```
//!
//! # Wildcards
//!
//! A value of an entry may contain the wildcard token `*`, which is later
//! expanded against a registry by the [glob resolver](crate::resolve). Only a
//! single value of an entry may carry a wildcard. That rule is enforced while
//! parsing, so a [`UserConfig`] obtained through [`FromStr`] never holds an
//! invalid entry.

use crate::config::ConfigError;

use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map, BTreeMap},
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Token marking a value as a pattern to expand.
pub const WILDCARD: char = '*';

/// One read or write declaration of a user config.
#[derive(Default, Debug, PartialEq, Eq, Hash, Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ConfigEntry(BTreeMap<String, String>);

impl ConfigEntry {
    /// Construct empty entry.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set value of key, returning the value it replaces.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Key-value pairs whose value contains the wildcard token.
    pub fn wildcard_fields(&self) -> Vec<(&str, &str)> {
        self.iter()
            .filter(|(_, value)| value.contains(WILDCARD))
            .collect()
    }

    /// Copy of entry with value of `key` replaced.
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut entry = self.clone();
        entry.insert(key, value);
        entry
    }
}

impl<K, V> FromIterator<(K, V)> for ConfigEntry
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a ConfigEntry {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Section of user config an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Read,
    Write,
}

impl Display for Section {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Read => fmt.write_str("read"),
            Self::Write => fmt.write_str("write"),
        }
    }
}

/// User config layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    /// Metadata describing the run.
    #[serde(default)]
    pub run_metadata: RunMetadata,

    /// Objects the run reads from the registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<ConfigEntry>,

    /// Objects the run writes to the registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write: Vec<ConfigEntry>,
}

impl UserConfig {
    pub fn section(&self, section: Section) -> &[ConfigEntry] {
        match section {
            Section::Read => self.read.as_slice(),
            Section::Write => self.write.as_slice(),
        }
    }

    /// Replace entries of a section.
    pub fn set_section(&mut self, section: Section, entries: Vec<ConfigEntry>) {
        match section {
            Section::Read => self.read = entries,
            Section::Write => self.write = entries,
        }
    }

    /// Check the single wildcard rule over both sections.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MultipleWildcards`] for the first entry that
    ///   carries more than one globbable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for section in [Section::Read, Section::Write] {
            for (index, entry) in self.section(section).iter().enumerate() {
                let fields = entry.wildcard_fields();
                if fields.len() > 1 {
                    return Err(ConfigError::MultipleWildcards {
                        section,
                        index,
                        fields: fields.into_iter().map(|(key, _)| key.to_string()).collect(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl FromStr for UserConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let config: UserConfig = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }
}

impl Display for UserConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            serde_yaml::to_string(self)
                .map_err(ConfigError::Yaml)?
                .as_str(),
        )
    }
}

/// Metadata about a run.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RunMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Directory of the project repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_repo: Option<String>,

    /// Command executed by `fair run`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_input_namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_output_namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_data_registry_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_data_registry_url: Option<String>,

    /// Directory new data products are written to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_data_store: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserialize_user_config() -> anyhow::Result<()> {
        let result: UserConfig = indoc! {r#"
            run_metadata:
              description: SEIRS model run
              script: python3 model.py
            read:
              - data_product: disease/sars_cov2/*
                version: "0.1.0"
            write:
              - data_product: model/output
        "#}
        .parse()?;

        let expect = UserConfig {
            run_metadata: RunMetadata {
                description: Some("SEIRS model run".into()),
                script: Some("python3 model.py".into()),
                ..RunMetadata::default()
            },
            read: vec![ConfigEntry::from_iter([
                ("data_product", "disease/sars_cov2/*"),
                ("version", "0.1.0"),
            ])],
            write: vec![ConfigEntry::from_iter([("data_product", "model/output")])],
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn reject_multiple_wildcards_while_parsing() {
        let result = indoc! {r#"
            read:
              - data_product: fine
            write:
              - data_product: fine
              - data_product: model/*
                namespace: team-*
        "#}
        .parse::<UserConfig>();

        match result {
            Err(ConfigError::MultipleWildcards {
                section,
                index,
                fields,
            }) => {
                assert_eq!(section, Section::Write);
                assert_eq!(index, 1);
                assert_eq!(fields, vec!["data_product".to_string(), "namespace".to_string()]);
            }
            other => panic!("expected wildcard rejection, got {other:?}"),
        }
    }

    #[test]
    fn wildcard_fields_of_entry() {
        let entry = ConfigEntry::from_iter([("name", "dataset-*"), ("namespace", "team")]);
        assert_eq!(entry.wildcard_fields(), vec![("name", "dataset-*")]);

        let entry = ConfigEntry::from_iter([("name", "dataset-1")]);
        assert!(entry.wildcard_fields().is_empty());
    }

    #[test]
    fn serialize_user_config_round_trip() -> anyhow::Result<()> {
        let mut config = UserConfig::default();
        config.run_metadata.description = Some("blah".into());
        config.set_section(
            Section::Read,
            vec![ConfigEntry::from_iter([("data_product", "a/*")])],
        );

        let text = config.to_string();
        assert!(!text.contains("write"));
        assert_eq!(text.parse::<UserConfig>()?, config);

        Ok(())
    }
}
