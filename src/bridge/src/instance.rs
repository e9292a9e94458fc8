use std::fmt;

use common::model::{Attributes, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TranslateError;
use crate::translate;

/// An entry of the external registry.
///
/// `key` is the identity used by the reconciler: two observations with equal
/// keys are the same instance, whatever else differs between them.
pub trait ExternalInstance: Clone + Send + Sync + 'static {
    type Key: Clone + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static;

    fn key(&self) -> Self::Key;

    /// Service name the instance is registered under
    fn name(&self) -> &str;

    /// Normalized record for the catalog, status not yet assigned
    fn to_record(&self) -> Result<Record, TranslateError>;
}

/// Lifetime class of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceType {
    #[default]
    Dynamic,
    Static,
    Permanent,
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceType::Dynamic => "DYNAMIC",
            InstanceType::Static => "STATIC",
            InstanceType::Permanent => "PERMANENT",
        };
        f.write_str(s)
    }
}

/// Service instance as stored in a coordination-service discovery tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_port: Option<u16>,
    /// Opaque service description
    #[serde(default)]
    pub payload: Attributes,
    /// Milliseconds since the epoch
    #[serde(default, rename = "registrationTimeUTC")]
    pub registration_time_utc: i64,
    #[serde(default)]
    pub service_type: InstanceType,
    /// Endpoint template such as `{scheme}://{address}:{port}/api`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_spec: Option<String>,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_ssl_port(mut self, ssl_port: u16) -> Self {
        self.ssl_port = Some(ssl_port);
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_uri_spec(mut self, uri_spec: impl Into<String>) -> Self {
        self.uri_spec = Some(uri_spec.into());
        self
    }

    pub fn with_registration_time(mut self, millis: i64) -> Self {
        self.registration_time_utc = millis;
        self
    }
}

/// Identity of a [`ServiceInstance`]: its name, id and connection coordinates.
///
/// A moved endpoint (new address or port) is a different instance, a changed
/// payload is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub name: String,
    pub id: String,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub ssl_port: Option<u16>,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.id)?;
        if let Some(address) = &self.address {
            write!(f, "@{address}")?;
        }
        match (self.port, self.ssl_port) {
            (_, Some(ssl_port)) => write!(f, ":{ssl_port}"),
            (Some(port), None) => write!(f, ":{port}"),
            (None, None) => Ok(()),
        }
    }
}

impl ExternalInstance for ServiceInstance {
    type Key = InstanceKey;

    fn key(&self) -> InstanceKey {
        InstanceKey {
            name: self.name.clone(),
            id: self.id.clone(),
            address: self.address.clone(),
            port: self.port,
            ssl_port: self.ssl_port,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn to_record(&self) -> Result<Record, TranslateError> {
        translate::translate(self)
    }
}
