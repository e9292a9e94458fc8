//! Services exposed by a cluster orchestration API.
//!
//! Such services carry no explicit discovery type, so the record type is
//! inferred by [`classify`](crate::classify::classify) from the first declared
//! port and the service labels.

use std::collections::BTreeMap;
use std::fmt;

use common::model::{Record, RecordType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::classify;
use crate::error::TranslateError;
use crate::instance::ExternalInstance;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
}

impl ServicePort {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_target_port(mut self, target_port: u16) -> Self {
        self.target_port = Some(target_port);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KubernetesService {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

impl KubernetesService {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_port(mut self, port: ServicePort) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_cluster_ip(mut self, ip: impl Into<String>) -> Self {
        self.cluster_ip = Some(ip.into());
        self
    }

    /// Discovery type of the service, [`RecordType::Unknown`] without ports
    pub fn discovery_type(&self) -> RecordType {
        self.ports
            .first()
            .map(|p| classify(p.port, &self.labels).record_type)
            .unwrap_or(RecordType::Unknown)
    }
}

/// Identity of a [`KubernetesService`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.uid)
    }
}

impl ExternalInstance for KubernetesService {
    type Key = ServiceKey;

    fn key(&self) -> ServiceKey {
        ServiceKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn to_record(&self) -> Result<Record, TranslateError> {
        translate_service(self)
    }
}

/// Build the catalog record of a cluster service.
pub fn translate_service(service: &KubernetesService) -> Result<Record, TranslateError> {
    if service.name.is_empty() {
        return Err(TranslateError::MissingField("name"));
    }
    if service.namespace.is_empty() {
        return Err(TranslateError::MissingField("namespace"));
    }
    if service.uid.is_empty() {
        return Err(TranslateError::MissingField("uid"));
    }
    let port = service.ports.first().ok_or(TranslateError::NoPorts)?;

    let classification = classify(port.port, &service.labels);
    let mut record = Record::new(service.name.clone(), classification.record_type);

    for (key, value) in &service.labels {
        record.metadata.insert(key.clone(), Value::from(value.clone()));
    }
    record
        .metadata
        .insert("kubernetes.name".into(), Value::from(service.name.clone()));
    record.metadata.insert(
        "kubernetes.namespace".into(),
        Value::from(service.namespace.clone()),
    );
    record
        .metadata
        .insert("kubernetes.uuid".into(), Value::from(service.uid.clone()));

    record.location.insert("port".into(), Value::from(port.port));
    if let Some(host) = &service.cluster_ip {
        record.location.insert("host".into(), Value::from(host.clone()));
    }
    if let Some(ssl) = classification.ssl {
        record.location.insert("ssl".into(), Value::from(ssl));
        if let Some(host) = &service.cluster_ip {
            let scheme = if ssl { "https" } else { "http" };
            record.location.insert(
                "endpoint".into(),
                Value::from(format!("{scheme}://{host}:{}", port.port)),
            );
        }
    }

    Ok(record)
}
