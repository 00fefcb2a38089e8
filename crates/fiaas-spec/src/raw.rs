//! Raw versioned config documents and the value conversions shared by all
//! schema versions

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use fiaas_common::{Error, Result};

/// A submitted application: identity plus the unparsed versioned config
#[derive(Clone, Debug, PartialEq)]
pub struct RawSpecDocument {
    /// Application name
    pub name: String,
    /// Namespace the application lives in
    pub namespace: String,
    /// Full container image reference
    pub image: String,
    /// Correlation id of this deploy
    pub deployment_id: String,
    /// Versioned config payload (`version` key plus version-specific fields)
    pub config: Value,
}

impl RawSpecDocument {
    /// Create a document
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        image: impl Into<String>,
        deployment_id: impl Into<String>,
        config: Value,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            image: image.into(),
            deployment_id: deployment_id.into(),
            config,
        }
    }

    /// Schema version tag of the config.
    ///
    /// A missing tag means the first, long unsupported, generation. Numeric
    /// strings are accepted.
    pub fn version(&self) -> Result<u32> {
        let tag = match &self.config {
            Value::Object(map) => map.get("version"),
            Value::Null => None,
            _ => {
                return Err(Error::validation_for(
                    &self.name,
                    "config must be a mapping",
                ))
            }
        };
        match tag {
            None | Some(Value::Null) => Ok(1),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| Error::unsupported_version(&self.name, n.to_string())),
            Some(Value::String(s)) => s
                .trim()
                .parse::<u32>()
                .map_err(|_| Error::unsupported_version(&self.name, s.clone())),
            Some(other) => Err(Error::validation_for_field(
                &self.name,
                "version",
                format!("expected a number, found {}", other),
            )),
        }
    }
}

/// A port given by name or by number
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PortRef {
    Number(u32),
    Name(String),
}

impl PortRef {
    pub(crate) fn name(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "port {}", n),
            Self::Name(name) => write!(f, "port {:?}", name),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

impl<'de> Deserialize<'de> for PortRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => Ok(Self::Number(clamp_u32(n))),
            NumberOrString::String(s) => match s.trim().parse::<u64>() {
                Ok(n) => Ok(Self::Number(clamp_u32(n))),
                Err(_) => Ok(Self::Name(s)),
            },
        }
    }
}

fn clamp_u32(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Port number given as an integer or a numeric string. Range checks happen
/// during validation so errors can name the field.
pub(crate) fn port_number<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(clamp_u32(n)),
        NumberOrString::String(s) => s
            .trim()
            .parse::<u64>()
            .map(clamp_u32)
            .map_err(|_| serde::de::Error::custom(format!("invalid port number {:?}", s))),
    }
}

/// Distinguishes an absent quantity (outer None) from an explicit null
/// (`Some(None)`). Numbers are kept in their textual form.
pub(crate) fn quantity<'de, D>(deserializer: D) -> std::result::Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None => Ok(Some(None)),
        Some(Value::String(s)) => Ok(Some(Some(s))),
        Some(Value::Number(n)) => Ok(Some(Some(n.to_string()))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid quantity {}",
            other
        ))),
    }
}

/// Parse a version-specific config, reporting serde errors as schema errors
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(app: &str, config: Value) -> Result<T> {
    serde_json::from_value(config).map_err(|e| Error::validation_for(app, e.to_string()))
}
