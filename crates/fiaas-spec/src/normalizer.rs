//! Spec normalization across schema versions
//!
//! Older versions are upgraded one step at a time through [`UPGRADES`] until
//! the document reaches [`CANONICAL_VERSION`], which is parsed directly.

use serde_json::Value;
use tracing::debug;

use fiaas_common::{Error, Result};

use crate::app_spec::AppSpec;
use crate::raw::RawSpecDocument;
use crate::{v2, v3};

/// The version parsed directly into an [`AppSpec`]
pub const CANONICAL_VERSION: u32 = 3;

/// Rewrites a config of one version into the shape of the next
pub type Upgrade = fn(&str, Value) -> Result<Value>;

/// Ordered upgrade steps, keyed by the version they upgrade from
pub const UPGRADES: &[(u32, Upgrade)] = &[(2, v2::upgrade_to_v3)];

const MAX_NAME_LENGTH: usize = 63;

/// Normalize a raw document of any supported version into an [`AppSpec`]
pub fn normalize(raw: &RawSpecDocument) -> Result<AppSpec> {
    validate_identity(raw)?;

    let mut version = raw.version()?;
    if version > CANONICAL_VERSION {
        return Err(Error::unsupported_version(&raw.name, version.to_string()));
    }

    let mut config = without_version(raw.config.clone());
    while version < CANONICAL_VERSION {
        let (_, upgrade) = UPGRADES
            .iter()
            .find(|(from, _)| *from == version)
            .ok_or_else(|| Error::unsupported_version(&raw.name, version.to_string()))?;
        debug!(app = %raw.name, from = version, to = version + 1, "upgrading config");
        config = upgrade(&raw.name, config)?;
        version += 1;
    }

    v3::parse(raw, config)
}

fn without_version(config: Value) -> Value {
    match config {
        Value::Object(mut map) => {
            map.remove("version");
            Value::Object(map)
        }
        Value::Null => Value::Object(Default::default()),
        other => other,
    }
}

/// Application names become object names and label values
pub fn is_valid_app_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_NAME_LENGTH
        && bytes[0].is_ascii_lowercase()
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[bytes.len() - 1] != b'-'
}

fn validate_identity(raw: &RawSpecDocument) -> Result<()> {
    if !is_valid_app_name(&raw.name) {
        return Err(Error::validation_for_field(
            &raw.name,
            "name",
            format!(
                "{:?} must match [a-z]([-a-z0-9]*[a-z0-9])? and be at most {} characters",
                raw.name, MAX_NAME_LENGTH
            ),
        ));
    }
    if raw.image.trim().is_empty() {
        return Err(Error::validation_for_field(
            &raw.name,
            "image",
            "image must not be empty",
        ));
    }
    if raw.namespace.is_empty() {
        return Err(Error::validation_for_field(
            &raw.name,
            "namespace",
            "namespace must not be empty",
        ));
    }
    Ok(())
}
