//! Deployment bundle model
//!
//! A bundle is a declarative description of services (charm, unit count,
//! options, constraints) plus the relations between them. The gateway only
//! checks that a bundle is well formed; whether it can actually be deployed
//! is decided by the deployment engine inside the worker process.
//!
//! Accepted shape:
//!
//! ```yaml
//! series: trusty            # optional
//! services:                 # required, non-empty ("applications" also accepted)
//!   wordpress:
//!     charm: cs:trusty/wordpress-2
//!     num_units: 2          # optional, defaults to 1
//!     options: {debug: yes} # optional mapping
//!     constraints: mem=2G   # optional
//!   mysql:
//!     charm: cs:trusty/mysql-10
//! relations:                # optional
//!   - [wordpress:db, mysql:db]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Bundle name used for v4 bundles, which carry no name of their own
pub const V4_BUNDLE_NAME: &str = "bundle-v4";

/// Reasons a bundle payload is rejected before a job is created
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BundleError {
    /// No bundle contents were provided at all
    #[error("no bundle contents provided")]
    Missing,

    /// The payload (or one of its sections) has the wrong type
    #[error("{section} must be a mapping, found {found}")]
    NotAMapping {
        section: String,
        found: &'static str,
    },

    /// The bundle does not define any service
    #[error("bundle does not define any services")]
    NoServices,

    /// A service definition is invalid
    #[error("invalid service {service}: {reason}")]
    InvalidService { service: String, reason: String },

    /// A relation definition is invalid
    #[error("invalid relation #{index}: {reason}")]
    InvalidRelation { index: usize, reason: String },

    /// Top-level series is not a string
    #[error("series must be a string")]
    InvalidSeries,

    /// YAML contents could not be decoded
    #[error("invalid YAML contents: {0}")]
    InvalidYaml(String),

    /// A named bundle is not present in the YAML document
    #[error("bundle {0} not found")]
    NotFound(String),

    /// Several bundles were provided but none was selected by name
    #[error("no bundle name provided")]
    NameRequired,
}

/// One service entry of a bundle
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub charm: String,
    pub num_units: u64,
    pub options: Map<String, Value>,
    pub constraints: Option<String>,
}

/// A relation between two endpoints (`service` or `service:relation`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub from: String,
    pub to: String,
}

/// A structurally valid bundle
///
/// The original payload is kept verbatim so that it can be handed to the
/// worker unchanged; the parsed view is used for validation and planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Bundle {
    raw: Value,
    series: Option<String>,
    services: BTreeMap<String, ServiceSpec>,
    relations: Vec<Relation>,
}

impl Bundle {
    /// Validate a structured payload and build a bundle from it
    pub fn from_value(raw: Value) -> Result<Self, BundleError> {
        let root = match &raw {
            Value::Null => return Err(BundleError::Missing),
            Value::Object(map) => map,
            other => {
                return Err(BundleError::NotAMapping {
                    section: "bundle".to_string(),
                    found: kind(other),
                })
            }
        };

        let series = match root.get("series") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(BundleError::InvalidSeries),
        };

        let services_value = root
            .get("services")
            .or_else(|| root.get("applications"))
            .ok_or(BundleError::NoServices)?;
        let services_map = services_value.as_object().ok_or_else(|| BundleError::NotAMapping {
            section: "services".to_string(),
            found: kind(services_value),
        })?;
        if services_map.is_empty() {
            return Err(BundleError::NoServices);
        }

        let mut services = BTreeMap::new();
        for (name, definition) in services_map {
            services.insert(name.clone(), parse_service(name, definition)?);
        }

        let relations = match root.get("relations") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .enumerate()
                .map(|(index, entry)| parse_relation(index, entry, &services))
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(BundleError::InvalidRelation {
                    index: 0,
                    reason: format!("relations must be a list, found {}", kind(other)),
                })
            }
        };

        Ok(Self {
            raw,
            series,
            services,
            relations,
        })
    }

    /// Decode YAML bundle contents
    ///
    /// With `version == Some(4)` the document is the bundle itself. Older
    /// documents map bundle names to bundles; `name` selects one and may be
    /// omitted when the document holds exactly one bundle.
    ///
    /// Returns the resolved bundle name together with the bundle.
    pub fn from_yaml(
        contents: &str,
        version: Option<u64>,
        name: Option<&str>,
    ) -> Result<(String, Self), BundleError> {
        let document: Value = serde_yaml::from_str(contents)
            .map_err(|e| BundleError::InvalidYaml(e.to_string()))?;

        if version == Some(4) {
            let name = name.unwrap_or(V4_BUNDLE_NAME).to_string();
            return Ok((name, Self::from_value(document)?));
        }

        let mut bundles = match document {
            Value::Object(map) => map,
            Value::Null => return Err(BundleError::Missing),
            other => {
                return Err(BundleError::NotAMapping {
                    section: "bundles".to_string(),
                    found: kind(&other),
                })
            }
        };

        let name = match name {
            Some(name) => name.to_string(),
            None if bundles.len() == 1 => bundles
                .keys()
                .next()
                .cloned()
                .ok_or(BundleError::NameRequired)?,
            None => return Err(BundleError::NameRequired),
        };
        let bundle = bundles
            .remove(&name)
            .ok_or_else(|| BundleError::NotFound(name.clone()))?;
        Ok((name, Self::from_value(bundle)?))
    }

    /// Original payload, exactly as submitted
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn series(&self) -> Option<&str> {
        self.series.as_deref()
    }

    /// Services keyed by name, in name order
    pub fn services(&self) -> &BTreeMap<String, ServiceSpec> {
        &self.services
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Total number of units the bundle asks for (saturating)
    pub fn unit_count(&self) -> u64 {
        self.services
            .values()
            .map(|s| s.num_units)
            .fold(0, u64::saturating_add)
    }
}

impl TryFrom<Value> for Bundle {
    type Error = BundleError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Bundle> for Value {
    fn from(bundle: Bundle) -> Self {
        bundle.raw
    }
}

impl Relation {
    /// Service names on both ends (relation names stripped)
    pub fn services(&self) -> (&str, &str) {
        (endpoint_service(&self.from), endpoint_service(&self.to))
    }
}

fn parse_service(name: &str, definition: &Value) -> Result<ServiceSpec, BundleError> {
    let invalid = |reason: String| BundleError::InvalidService {
        service: name.to_string(),
        reason,
    };

    if name.trim().is_empty() {
        return Err(invalid("service name is empty".to_string()));
    }
    let fields = definition
        .as_object()
        .ok_or_else(|| invalid(format!("definition must be a mapping, found {}", kind(definition))))?;

    let charm = match fields.get("charm") {
        Some(Value::String(charm)) if !charm.trim().is_empty() => charm.clone(),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            return Err(invalid("no charm specified".to_string()))
        }
        Some(other) => return Err(invalid(format!("charm must be a string, found {}", kind(other)))),
    };

    let num_units = match fields.get("num_units") {
        None | Some(Value::Null) => 1,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| invalid(format!("num_units must be a non-negative integer, found {}", value)))?,
    };

    let options = match fields.get("options") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(options)) => options.clone(),
        Some(other) => return Err(invalid(format!("options must be a mapping, found {}", kind(other)))),
    };

    let constraints = match fields.get("constraints") {
        None | Some(Value::Null) => None,
        Some(Value::String(c)) => Some(c.clone()),
        Some(other) => {
            return Err(invalid(format!("constraints must be a string, found {}", kind(other))))
        }
    };

    Ok(ServiceSpec {
        charm,
        num_units,
        options,
        constraints,
    })
}

fn parse_relation(
    index: usize,
    entry: &Value,
    services: &BTreeMap<String, ServiceSpec>,
) -> Result<Relation, BundleError> {
    let invalid = |reason: String| BundleError::InvalidRelation { index, reason };

    let endpoints = entry
        .as_array()
        .ok_or_else(|| invalid(format!("expected a pair of endpoints, found {}", kind(entry))))?;
    if endpoints.len() != 2 {
        return Err(invalid(format!(
            "expected 2 endpoints, found {}",
            endpoints.len()
        )));
    }

    let mut names = Vec::with_capacity(2);
    for endpoint in endpoints {
        let endpoint = endpoint
            .as_str()
            .ok_or_else(|| invalid("endpoints must be strings".to_string()))?;
        let service = endpoint_service(endpoint);
        if !services.contains_key(service) {
            return Err(invalid(format!("service {} is not defined", service)));
        }
        names.push(endpoint.to_string());
    }

    let to = names.pop().unwrap_or_default();
    let from = names.pop().unwrap_or_default();
    Ok(Relation { from, to })
}

fn endpoint_service(endpoint: &str) -> &str {
    endpoint.split(':').next().unwrap_or(endpoint)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}
