use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// String-keyed JSON scalars, ordered by key.
pub type Attributes = serde_json::Map<String, Value>;

/// Discovery type of a published record.
///
/// The well-known types serialize to the strings used by discovery consumers
/// (`http-endpoint`, `jdbc`, ...). Types declared by an external ecosystem that
/// are not known here round-trip through [`RecordType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    HttpEndpoint,
    JdbcDataSource,
    RedisDataSource,
    MongoDataSource,
    MessageSource,
    EventBusService,
    Unknown,
    Other(String),
}

impl RecordType {
    pub fn as_str(&self) -> &str {
        match self {
            RecordType::HttpEndpoint => "http-endpoint",
            RecordType::JdbcDataSource => "jdbc",
            RecordType::RedisDataSource => "redis",
            RecordType::MongoDataSource => "mongo",
            RecordType::MessageSource => "message-source",
            RecordType::EventBusService => "eventbus-service-proxy",
            RecordType::Unknown => "unknown",
            RecordType::Other(s) => s,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let record_type = match s {
            "http-endpoint" => RecordType::HttpEndpoint,
            "jdbc" => RecordType::JdbcDataSource,
            "redis" => RecordType::RedisDataSource,
            "mongo" => RecordType::MongoDataSource,
            "message-source" => RecordType::MessageSource,
            "eventbus-service-proxy" => RecordType::EventBusService,
            "unknown" | "" => RecordType::Unknown,
            other => RecordType::Other(other.to_string()),
        };
        Ok(record_type)
    }
}

impl From<&str> for RecordType {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(t) => t,
            Err(never) => match never {},
        }
    }
}

impl Serialize for RecordType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RecordType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RecordType::from(s.as_str()))
    }
}

/// Availability of a record as seen by catalog consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Up,
    Down,
    OutOfService,
    #[default]
    Unknown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Up => "UP",
            Status::Down => "DOWN",
            Status::OutOfService => "OUT_OF_SERVICE",
            Status::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(Status::Up),
            "DOWN" => Ok(Status::Down),
            "OUT_OF_SERVICE" => Ok(Status::OutOfService),
            "UNKNOWN" => Ok(Status::Unknown),
            other => Err(format!("unknown record status: {other}")),
        }
    }
}

/// Opaque handle returned by a catalog when a record is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordHandle(String);

impl RecordHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized description of a service published into the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Provenance of the record (origin system, origin id, timestamps, ...)
    #[serde(default)]
    pub metadata: Attributes,
    /// Connection details (endpoint, port, address, ...)
    #[serde(default)]
    pub location: Attributes,
    #[serde(default)]
    pub status: Status,
    /// Set by the catalog once the record is published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<RecordHandle>,
}

impl Record {
    pub fn new(name: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            name: name.into(),
            record_type,
            metadata: Attributes::new(),
            location: Attributes::new(),
            status: Status::Unknown,
            registration: None,
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// `location.endpoint` when present as a string
    pub fn endpoint(&self) -> Option<&str> {
        self.location.get("endpoint").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_type_round_trips_known_and_declared_types() {
        assert_eq!(RecordType::from("http-endpoint"), RecordType::HttpEndpoint);
        assert_eq!(RecordType::from("redis"), RecordType::RedisDataSource);
        assert_eq!(RecordType::from(""), RecordType::Unknown);
        assert_eq!(
            RecordType::from("grpc"),
            RecordType::Other("grpc".to_string())
        );
        assert_eq!(RecordType::Other("grpc".to_string()).to_string(), "grpc");
    }

    #[test]
    fn test_record_serializes_with_discovery_field_names() {
        let mut record = Record::new("my-service", RecordType::HttpEndpoint).with_status(Status::Up);
        record.location.insert("port".into(), json!(8080));

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "http-endpoint");
        assert_eq!(value["status"], "UP");
        assert_eq!(value["location"]["port"], 8080);
        assert!(value.get("registration").is_none());

        let back: Record = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_status_parses_display_form() {
        for status in [Status::Up, Status::Down, Status::OutOfService, Status::Unknown] {
            assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
        }
        assert!("up".parse::<Status>().is_err());
    }
}
