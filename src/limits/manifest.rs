//! Limits manifest.
//!
//! A manifest is a YAML mapping from limit names to values, for example:
//!
//! ```yaml
//! object-storage/request:
//!   frequency: 1
//! fs/read:
//!   byte-rate: 1000000
//! threads/simultaneous-instances:
//!   count: 5
//! execution/cpu-time:
//!   duration-ms: 500
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::limit::{Limit, LimitValue};
use super::registry::LimitRegistry;
use crate::error::{Result, WardenError};

/// Value of one entry of a [`LimitsManifest`]. Exactly one field is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LimitEntry {
    /// Operations per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<i64>,
    /// Bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_rate: Option<i64>,
    /// A plain total
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    /// A time budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl LimitEntry {
    /// The typed value of the entry of limit `name`.
    pub fn to_value(&self, name: &str) -> Result<LimitValue> {
        let values = [
            self.frequency.map(LimitValue::Frequency),
            self.byte_rate.map(LimitValue::ByteRate),
            self.count.map(LimitValue::Count),
            self.duration_ms
                .map(|ms| LimitValue::Duration(Duration::from_millis(ms))),
        ];

        let mut set = values.into_iter().flatten();
        match (set.next(), set.next()) {
            (Some(value), None) => Ok(value),
            _ => Err(WardenError::Config(format!(
                "limit '{}': exactly one of frequency, byte-rate, count or duration-ms should be set",
                name
            ))),
        }
    }
}

/// Limits requested by a module, keyed by limit name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LimitsManifest {
    pub limits: BTreeMap<String, LimitEntry>,
}

impl LimitsManifest {
    /// Load a manifest from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limits manifest");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a manifest from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // An empty document is an empty manifest.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Turn every entry into a validated [`Limit`], in name order.
    ///
    /// Fails on the first entry the registry rejects.
    pub fn to_limits(&self, registry: &LimitRegistry) -> Result<Vec<Limit>> {
        self.limits
            .iter()
            .map(|(name, entry)| {
                let value = entry.to_value(name)?;
                let limit = registry.make_limit(name, value).map_err(WardenError::from)?;
                debug!(limit = %limit, "Manifest limit validated");
                Ok::<_, WardenError>(limit)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimitError;
    use crate::limits::{
        LimitKind, EXECUTION_CPU_TIME_LIMIT_NAME, THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME,
    };
    use std::io::Write;

    const MANIFEST: &str = r#"
object-storage/request:
  frequency: 1
threads/simultaneous-instances:
  count: 5
execution/cpu-time:
  duration-ms: 500
"#;

    fn registry() -> LimitRegistry {
        let registry = LimitRegistry::new();
        registry.register_limit("object-storage/request", LimitKind::FrequencyLimit, 0);
        registry
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = LimitsManifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(manifest.len(), 3);
        assert_eq!(
            manifest.limits.get("object-storage/request"),
            Some(&LimitEntry {
                frequency: Some(1),
                ..Default::default()
            })
        );
        assert_eq!(
            manifest.limits[EXECUTION_CPU_TIME_LIMIT_NAME]
                .to_value(EXECUTION_CPU_TIME_LIMIT_NAME)
                .unwrap(),
            LimitValue::Duration(Duration::from_millis(500))
        );
        assert_eq!(
            manifest.limits[THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME]
                .to_value(THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME)
                .unwrap(),
            LimitValue::Count(5)
        );
    }

    #[test]
    fn test_byte_rate_entry() {
        let manifest = LimitsManifest::from_yaml("fs/read:\n  byte-rate: 1000000\n").unwrap();
        assert_eq!(
            manifest.limits["fs/read"].to_value("fs/read").unwrap(),
            LimitValue::ByteRate(1_000_000)
        );
    }

    #[test]
    fn test_entry_needs_exactly_one_value() {
        let manifest = LimitsManifest::from_yaml(
            "object-storage/request:\n  frequency: 1\n  count: 2\nfs/read: {}\n",
        )
        .unwrap();

        assert!(matches!(
            manifest.limits["object-storage/request"].to_value("object-storage/request"),
            Err(WardenError::Config(_))
        ));
        assert!(matches!(
            manifest.limits["fs/read"].to_value("fs/read"),
            Err(WardenError::Config(_))
        ));
        assert!(matches!(manifest.to_limits(&registry()), Err(WardenError::Config(_))));
    }

    #[test]
    fn test_empty_manifest() {
        let manifest = LimitsManifest::from_yaml("  \n").unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_manifest_to_limits() {
        let limits = LimitsManifest::from_yaml(MANIFEST)
            .unwrap()
            .to_limits(&registry())
            .unwrap();

        let names: Vec<&str> = limits.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                EXECUTION_CPU_TIME_LIMIT_NAME,
                "object-storage/request",
                THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME,
            ]
        );
        assert!(limits[0].is_auto_depleting());
        assert_eq!(limits[0].value, 500_000_000);
        assert_eq!(limits[1].kind, LimitKind::FrequencyLimit);
        assert_eq!(limits[2].value, 5);
    }

    #[test]
    fn test_manifest_with_wrong_kind() {
        let manifest = LimitsManifest::from_yaml("object-storage/request:\n  count: 3\n").unwrap();
        let err = manifest.to_limits(&registry()).unwrap_err();

        assert!(matches!(
            err,
            WardenError::Limit(LimitError::WrongKind { ref name, .. }) if name == "object-storage/request"
        ));
    }

    #[test]
    fn test_manifest_with_unknown_limit() {
        let manifest = LimitsManifest::from_yaml("net/unknown:\n  frequency: 3\n").unwrap();
        assert!(matches!(
            manifest.to_limits(&registry()),
            Err(WardenError::Limit(LimitError::UnregisteredLimit(_)))
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            LimitsManifest::from_yaml("object-storage/request:\n  weekly: 3\n"),
            Err(WardenError::Yaml(_))
        ));
    }

    #[test]
    fn test_manifest_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MANIFEST.as_bytes()).unwrap();

        let manifest = LimitsManifest::from_file(file.path()).unwrap();
        assert_eq!(manifest.len(), 3);

        assert!(matches!(
            LimitsManifest::from_file("/nonexistent/limits.yaml"),
            Err(WardenError::Io(_))
        ));
    }
}
