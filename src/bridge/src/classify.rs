//! Discovery type inference for endpoints that declare no explicit type.

use std::collections::BTreeMap;

use common::model::RecordType;

/// Label overriding the inferred type
pub const SERVICE_TYPE_LABEL: &str = "service-type";

/// Label flagging an HTTP endpoint as served over TLS
pub const SSL_LABEL: &str = "ssl";

const HTTP_PORTS: [u16; 7] = [80, 443, 8080, 8443, 8000, 8888, 9000];
const HTTPS_PORTS: [u16; 2] = [443, 8443];
const REDIS_PORTS: [u16; 1] = [6379];
const JDBC_PORTS: [u16; 1] = [3306];
const MONGO_PORTS: [u16; 3] = [27017, 27018, 27019];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub record_type: RecordType,
    /// Transport security of an HTTP endpoint, `None` for other types
    pub ssl: Option<bool>,
}

/// Classify an endpoint from its port and labels.
///
/// An explicit `service-type` label wins; for `http-endpoint` the `ssl` label
/// decides transport security. Without a usable label the port is matched
/// against the well-known port table. Never fails: anything unrecognized is
/// [`RecordType::Unknown`].
pub fn classify(port: u16, labels: &BTreeMap<String, String>) -> Classification {
    let declared = labels
        .get(SERVICE_TYPE_LABEL)
        .map(|label| RecordType::from(label.as_str()))
        .filter(|t| *t != RecordType::Unknown);

    match declared {
        Some(RecordType::HttpEndpoint) => Classification {
            record_type: RecordType::HttpEndpoint,
            ssl: Some(labels.get(SSL_LABEL).is_some_and(|v| v == "true")),
        },
        Some(record_type) => Classification {
            record_type,
            ssl: None,
        },
        None => {
            let record_type = classify_port(port);
            let ssl = (record_type == RecordType::HttpEndpoint).then(|| HTTPS_PORTS.contains(&port));
            Classification { record_type, ssl }
        }
    }
}

/// Well-known port table, first match wins
pub fn classify_port(port: u16) -> RecordType {
    if HTTP_PORTS.contains(&port) {
        RecordType::HttpEndpoint
    } else if REDIS_PORTS.contains(&port) {
        RecordType::RedisDataSource
    } else if JDBC_PORTS.contains(&port) {
        RecordType::JdbcDataSource
    } else if MONGO_PORTS.contains(&port) {
        RecordType::MongoDataSource
    } else {
        RecordType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_port_table() {
        for port in [80, 443, 8080, 8443, 8000, 8888, 9000] {
            assert_eq!(classify_port(port), RecordType::HttpEndpoint, "port {port}");
        }
        assert_eq!(classify_port(6379), RecordType::RedisDataSource);
        assert_eq!(classify_port(3306), RecordType::JdbcDataSource);
        for port in [27017, 27018, 27019] {
            assert_eq!(classify_port(port), RecordType::MongoDataSource, "port {port}");
        }
        for port in [0, 22, 433, 1524, 5432, 27020, u16::MAX] {
            assert_eq!(classify_port(port), RecordType::Unknown, "port {port}");
        }
    }

    #[test]
    fn test_http_label_with_ssl_flag() {
        let secure = classify(80, &labels(&[("service-type", "http-endpoint"), ("ssl", "true")]));
        assert_eq!(secure.record_type, RecordType::HttpEndpoint);
        assert_eq!(secure.ssl, Some(true));

        let plain = classify(1524, &labels(&[("service-type", "http-endpoint")]));
        assert_eq!(plain.record_type, RecordType::HttpEndpoint);
        assert_eq!(plain.ssl, Some(false));

        let odd = classify(8443, &labels(&[("service-type", "http-endpoint"), ("ssl", "yes")]));
        assert_eq!(odd.ssl, Some(false));
    }

    #[test]
    fn test_other_labels_override_port() {
        let redis = classify(8080, &labels(&[("service-type", "redis")]));
        assert_eq!(redis.record_type, RecordType::RedisDataSource);
        assert_eq!(redis.ssl, None);

        // An "unknown" label is no better than no label
        let unknown = classify(3306, &labels(&[("service-type", "unknown")]));
        assert_eq!(unknown.record_type, RecordType::JdbcDataSource);
    }

    #[test]
    fn test_port_based_http_ssl() {
        assert_eq!(classify(443, &BTreeMap::new()).ssl, Some(true));
        assert_eq!(classify(8080, &BTreeMap::new()).ssl, Some(false));
        assert_eq!(classify(6379, &BTreeMap::new()).ssl, None);
    }
}
