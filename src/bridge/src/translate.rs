//! Translation of coordination-tree service instances into catalog records.

use common::model::{Record, RecordType};
use serde_json::Value;

use crate::error::TranslateError;
use crate::instance::ServiceInstance;

/// Payload key declaring the discovery type of an instance
pub const SERVICE_TYPE_KEY: &str = "service-type";

/// Prefix of the provenance keys added to record metadata
pub const METADATA_PREFIX: &str = "registry-";

fn provenance(field: &str) -> String {
    format!("{METADATA_PREFIX}{field}")
}

/// Build the catalog record describing `instance`.
///
/// The payload becomes the record metadata, augmented with the registry id,
/// address, ports, registration time and lifetime class of the instance. The
/// location carries an `endpoint` URI plus the raw `port`, `ssl-port` and
/// `address` fields.
pub fn translate(instance: &ServiceInstance) -> Result<Record, TranslateError> {
    if instance.name.is_empty() {
        return Err(TranslateError::MissingField("name"));
    }
    if instance.id.is_empty() {
        return Err(TranslateError::MissingField("id"));
    }

    let record_type = instance
        .payload
        .get(SERVICE_TYPE_KEY)
        .and_then(Value::as_str)
        .map(RecordType::from)
        .unwrap_or(RecordType::Unknown);

    let mut record = Record::new(instance.name.clone(), record_type);

    record.metadata = instance.payload.clone();
    let metadata = &mut record.metadata;
    metadata.insert(provenance("id"), Value::from(instance.id.clone()));
    metadata.insert(
        provenance("service-type"),
        Value::from(instance.service_type.to_string()),
    );
    metadata.insert(
        provenance("registration-time"),
        Value::from(instance.registration_time_utc),
    );
    if let Some(address) = &instance.address {
        metadata.insert(provenance("address"), Value::from(address.clone()));
    }
    if let Some(port) = instance.port {
        metadata.insert(provenance("port"), Value::from(port));
    }
    if let Some(ssl_port) = instance.ssl_port {
        metadata.insert(provenance("ssl-port"), Value::from(ssl_port));
    }

    let endpoint = match &instance.uri_spec {
        Some(spec) => render_uri_spec(spec, instance),
        None => synthesize_endpoint(instance),
    };
    let location = &mut record.location;
    location.insert("endpoint".into(), Value::from(endpoint));
    if let Some(port) = instance.port {
        location.insert("port".into(), Value::from(port));
    }
    if let Some(ssl_port) = instance.ssl_port {
        location.insert("ssl-port".into(), Value::from(ssl_port));
    }
    if let Some(address) = &instance.address {
        location.insert("address".into(), Value::from(address.clone()));
    }

    Ok(record)
}

fn scheme(instance: &ServiceInstance) -> &'static str {
    if instance.ssl_port.is_some() {
        "https"
    } else {
        "http"
    }
}

/// `scheme://address:port`, the secure port winning over the plain one
fn synthesize_endpoint(instance: &ServiceInstance) -> String {
    let address = instance.address.as_deref().unwrap_or_default();
    match instance.ssl_port.or(instance.port) {
        Some(port) => format!("{}://{address}:{port}", scheme(instance)),
        None => format!("{}://{address}", scheme(instance)),
    }
}

/// Render a URI template, substituting `{field}` placeholders.
///
/// Known fields are `scheme`, `name`, `id`, `address`, `port`, `ssl-port`,
/// `registration-time-utc` and `service-type`. Any other placeholder is looked
/// up in the payload; placeholders without a value render empty.
pub fn render_uri_spec(spec: &str, instance: &ServiceInstance) -> String {
    let mut rendered = String::with_capacity(spec.len());
    let mut rest = spec;

    while let Some(open) = rest.find('{') {
        let Some(len) = rest[open..].find('}') else {
            break;
        };
        rendered.push_str(&rest[..open]);
        let field = &rest[open + 1..open + len];
        if let Some(value) = placeholder(field, instance) {
            rendered.push_str(&value);
        }
        rest = &rest[open + len + 1..];
    }
    rendered.push_str(rest);
    rendered
}

fn placeholder(field: &str, instance: &ServiceInstance) -> Option<String> {
    match field {
        "scheme" => Some(scheme(instance).to_string()),
        "name" => Some(instance.name.clone()),
        "id" => Some(instance.id.clone()),
        "address" => instance.address.clone(),
        "port" => instance.port.map(|p| p.to_string()),
        "ssl-port" => instance.ssl_port.map(|p| p.to_string()),
        "registration-time-utc" => Some(instance.registration_time_utc.to_string()),
        "service-type" => Some(instance.service_type.to_string()),
        other => match instance.payload.get(other)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            value => Some(value.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ExternalInstance;

    fn instance() -> ServiceInstance {
        ServiceInstance::new("orders", "a1")
            .with_address("10.0.0.1")
            .with_registration_time(1_700_000_000_000)
    }

    #[test]
    fn test_metadata_copies_payload_and_adds_provenance() {
        let record = translate(&instance().with_port(8080).with_payload("team", "billing")).unwrap();

        assert_eq!(record.name, "orders");
        assert_eq!(record.metadata["team"], "billing");
        assert_eq!(record.metadata["registry-id"], "a1");
        assert_eq!(record.metadata["registry-address"], "10.0.0.1");
        assert_eq!(record.metadata["registry-port"], 8080);
        assert_eq!(record.metadata["registry-registration-time"], 1_700_000_000_000i64);
        assert_eq!(record.metadata["registry-service-type"], "DYNAMIC");
        assert!(record.metadata.get("registry-ssl-port").is_none());
    }

    #[test]
    fn test_type_from_payload_or_unknown() {
        let typed = instance().with_payload(SERVICE_TYPE_KEY, "redis");
        assert_eq!(translate(&typed).unwrap().record_type, RecordType::RedisDataSource);

        // Port 8080 alone does not make it an HTTP endpoint on this path
        let untyped = instance().with_port(8080);
        assert_eq!(translate(&untyped).unwrap().record_type, RecordType::Unknown);
    }

    #[test]
    fn test_endpoint_prefers_ssl_port() {
        let both = instance().with_port(8080).with_ssl_port(8443);
        let record = translate(&both).unwrap();
        assert_eq!(record.endpoint(), Some("https://10.0.0.1:8443"));
        assert_eq!(record.location["port"], 8080);
        assert_eq!(record.location["ssl-port"], 8443);
        assert_eq!(record.location["address"], "10.0.0.1");

        let plain = translate(&instance().with_port(8080)).unwrap();
        assert_eq!(plain.endpoint(), Some("http://10.0.0.1:8080"));
        assert!(plain.location.get("ssl-port").is_none());

        let bare = translate(&instance()).unwrap();
        assert_eq!(bare.endpoint(), Some("http://10.0.0.1"));
        assert!(bare.location.get("port").is_none());
    }

    #[test]
    fn test_uri_spec_wins_over_synthesized_endpoint() {
        let spec = instance()
            .with_port(8080)
            .with_payload("root", "v2")
            .with_uri_spec("{scheme}://{address}:{port}/{root}/{name}{missing}");
        let record = translate(&spec).unwrap();
        assert_eq!(record.endpoint(), Some("http://10.0.0.1:8080/v2/orders"));
        assert_eq!(record.location["port"], 8080);
    }

    #[test]
    fn test_render_uri_spec_keeps_unterminated_text() {
        let rendered = render_uri_spec("{scheme}://{address", &instance().with_ssl_port(443));
        assert_eq!(rendered, "https://{address");
    }

    #[test]
    fn test_missing_identity_is_an_error() {
        let no_name = ServiceInstance::new("", "a1");
        assert_eq!(translate(&no_name), Err(TranslateError::MissingField("name")));
        let no_id = ServiceInstance::new("orders", "");
        assert_eq!(translate(&no_id), Err(TranslateError::MissingField("id")));
    }

    #[test]
    fn test_translation_is_deterministic() {
        let instance = instance()
            .with_port(8080)
            .with_ssl_port(8443)
            .with_payload("team", "billing")
            .with_payload(SERVICE_TYPE_KEY, "http-endpoint");
        assert_eq!(instance.to_record().unwrap(), instance.to_record().unwrap());
    }
}
