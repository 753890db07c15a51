use serde::Serialize;

pub const DEFAULT_METHOD: &str = "CONNECT";

/// Normalize a request method for comparison. Absent methods become CONNECT.
pub fn normalize_method(method: Option<&str>) -> String {
    match method {
        Some(m) if !m.is_empty() => m.to_uppercase(),
        _ => DEFAULT_METHOD.to_string(),
    }
}

/// Per-request routing input produced by the listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub connection_id: u64,
    pub hostname: String,
    pub port: u16,
    /// `true` for plain HTTP forwarding, `false` for CONNECT tunnels
    pub is_http: bool,
    /// Upper-cased method, CONNECT when the request carried none
    pub method: String,
    pub url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_method() {
        assert_eq!(normalize_method(Some("get")), "GET");
        assert_eq!(normalize_method(Some("Connect")), "CONNECT");
        assert_eq!(normalize_method(Some("")), "CONNECT");
        assert_eq!(normalize_method(None), "CONNECT");
    }

    #[test]
    fn test_request_info_never_serializes_password() {
        let info = RequestInfo {
            connection_id: 7,
            hostname: "example.com".to_string(),
            port: 443,
            is_http: false,
            method: "CONNECT".to_string(),
            url: "example.com:443".to_string(),
            username: "alice".to_string(),
            password: "secret".to_string(),
        };

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["connectionId"], 7);
        assert_eq!(value["isHttp"], false);
        assert!(value.get("password").is_none());
    }
}
