//! TPP SSH certificate HTTP API client.
//!
//! Two endpoints are used:
//!
//! 1. POST `{url}/vedsdk/SSHCertificates/Request`  → request DN (pickup id)
//! 2. POST `{url}/vedsdk/SSHCertificates/Retrieve` → certificate, keys, details
//!
//! Both authenticate with a bearer access token.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::TppError;

/// Folder prepended to bare template names to form the CA template DN.
pub const TEMPLATE_ROOT: &str = "\\VED\\Certificate Authority\\SSH\\Templates\\";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertificateRequestBody {
    #[serde(rename = "CADN")]
    pub ca_dn: String,
    #[serde(rename = "PolicyDN", skip_serializing_if = "Option::is_none")]
    pub policy_dn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub destination_addresses: Vec<String>,
    pub key_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validity_period: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_data: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_addresses: Vec<String>,
}

/// `Response` block present on every TPP SSH API reply.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseStatus {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertificateRequestResponse {
    #[serde(rename = "DN", default)]
    pub dn: String,
    #[serde(rename = "Response", default)]
    pub response: ResponseStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RetrieveBody<'a> {
    #[serde(rename = "DN")]
    dn: &'a str,
    include_private_key_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    private_key_passphrase: Option<&'a str>,
    include_certificate_details: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CertificateDetailsWire {
    #[serde(rename = "CertificateType", default)]
    pub certificate_type: String,
    #[serde(rename = "PublicKeyFingerprintSHA256", default)]
    pub public_key_fingerprint_sha256: String,
    #[serde(rename = "CAFingerprintSHA256", default)]
    pub ca_fingerprint_sha256: String,
    #[serde(rename = "SerialNumber", default)]
    pub serial_number: String,
    #[serde(rename = "ValidFrom", default)]
    pub valid_from: i64,
    #[serde(rename = "ValidTo", default)]
    pub valid_to: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessingDetails {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_description: String,
}

#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertificateRetrieveResponse {
    #[serde(default)]
    pub certificate_data: String,
    #[serde(default)]
    pub private_key_data: Zeroizing<String>,
    #[serde(default)]
    pub public_key_data: String,
    #[serde(default)]
    pub certificate_details: Option<CertificateDetailsWire>,
    #[serde(default)]
    pub processing_details: Option<ProcessingDetails>,
    #[serde(default)]
    pub response: ResponseStatus,
}

impl std::fmt::Debug for CertificateRetrieveResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRetrieveResponse")
            .field("certificate_data", &self.certificate_data)
            .field("private_key_data", &"[redacted]")
            .field("public_key_data", &self.public_key_data)
            .field("certificate_details", &self.certificate_details)
            .field("processing_details", &self.processing_details)
            .field("response", &self.response)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Connection settings for a TPP instance.
#[derive(Clone)]
pub struct TppConfig {
    /// Base URL, with or without a trailing `/vedsdk`.
    pub url: String,
    pub access_token: Zeroizing<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for TppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TppConfig")
            .field("url", &self.url)
            .field("access_token", &"[redacted]")
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl TppConfig {
    pub fn from_connection(conn: &sshcert_core::config::ConnectionConfig) -> Result<Self, TppError> {
        if conn.url.trim().is_empty() {
            return Err(TppError::Config("connection.url is required"));
        }
        let access_token = conn
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(TppError::Config("connection.access_token is required"))?;
        Ok(Self {
            url: conn.url.clone(),
            access_token,
            request_timeout: conn.request_timeout(),
            connect_timeout: conn.connect_timeout(),
        })
    }
}

pub struct TppClient {
    http: HttpClient,
    sdk_url: String,
    access_token: Zeroizing<String>,
}

impl TppClient {
    pub fn new(config: TppConfig) -> Result<Self, TppError> {
        let http = HttpClient::builder()
            .user_agent(format!("sshcert/{}", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            http,
            sdk_url: sdk_url(&config.url),
            access_token: config.access_token,
        })
    }

    /// Submit a certificate request.  Returns the request DN.
    pub async fn request_certificate(
        &self,
        body: &CertificateRequestBody,
    ) -> Result<String, TppError> {
        let url = format!("{}/SSHCertificates/Request", self.sdk_url);

        debug!(key_id = %body.key_id, ca_dn = %body.ca_dn, "SSH certificate request");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(self.access_token.as_str())
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        let dn = parse_request_response(status, &text)?;
        debug!(%dn, "SSH certificate request accepted");
        Ok(dn)
    }

    /// Make one retrieve call for `dn`.
    pub async fn retrieve_certificate(
        &self,
        dn: &str,
        passphrase: Option<&str>,
        include_details: bool,
        timeout: Option<Duration>,
    ) -> Result<CertificateRetrieveResponse, TppError> {
        let url = format!("{}/SSHCertificates/Retrieve", self.sdk_url);
        let body = RetrieveBody {
            dn,
            include_private_key_data: true,
            private_key_passphrase: passphrase,
            include_certificate_details: include_details,
        };

        debug!(%dn, "SSH certificate retrieve");

        let mut req = self
            .http
            .post(&url)
            .bearer_auth(self.access_token.as_str())
            .json(&body);
        if let Some(t) = timeout.filter(|t| !t.is_zero()) {
            req = req.timeout(t);
        }
        let resp = req.send().await?;

        let status = resp.status();
        let text = resp.text().await?;
        parse_retrieve_response(status, &text)
    }
}

/// Interpret a reply from the request endpoint.  Returns the request DN.
pub fn parse_request_response(status: StatusCode, body: &str) -> Result<String, TppError> {
    if !status.is_success() {
        return Err(http_failure("certificate request", status, body));
    }
    let parsed: CertificateRequestResponse = serde_json::from_str(body)?;
    if !parsed.response.success {
        return Err(TppError::Rejected(describe(&parsed.response)));
    }
    if parsed.dn.is_empty() {
        return Err(TppError::Api(
            "certificate request succeeded but returned no DN".to_string(),
        ));
    }
    Ok(parsed.dn)
}

/// Interpret a reply from the retrieve endpoint.  Pending and failed
/// processing states are left to the caller.
pub fn parse_retrieve_response(
    status: StatusCode,
    body: &str,
) -> Result<CertificateRetrieveResponse, TppError> {
    if !status.is_success() {
        return Err(http_failure("certificate retrieve", status, body));
    }
    Ok(serde_json::from_str(body)?)
}

/// Normalise a configured base URL to the `…/vedsdk` root.
fn sdk_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = base.strip_suffix("/vedsdk").unwrap_or(base);
    format!("{base}/vedsdk")
}

fn http_failure(what: &str, status: StatusCode, body: &str) -> TppError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TppError::Auth(format!("{what} failed ({status}): {body}"))
        }
        _ => TppError::Api(format!("{what} failed ({status}): {body}")),
    }
}

pub(crate) fn describe(status: &ResponseStatus) -> String {
    if status.error_message.is_empty() {
        format!("error code {}", status.error_code)
    } else {
        format!("{} (error code {})", status.error_message, status.error_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdk_url_normalisation() {
        assert_eq!(sdk_url("https://tpp.example.com"), "https://tpp.example.com/vedsdk");
        assert_eq!(sdk_url("https://tpp.example.com/"), "https://tpp.example.com/vedsdk");
        assert_eq!(
            sdk_url("https://tpp.example.com/vedsdk/"),
            "https://tpp.example.com/vedsdk"
        );
    }

    #[test]
    fn request_body_uses_tpp_field_names() {
        let mut extensions = BTreeMap::new();
        extensions.insert("permit-pty".to_string(), String::new());
        let body = CertificateRequestBody {
            ca_dn: format!("{TEMPLATE_ROOT}T1"),
            policy_dn: Some("\\VED\\Policy\\SSH".to_string()),
            key_id: "svc1".to_string(),
            principals: vec!["deploy".to_string()],
            validity_period: Some("24h".to_string()),
            public_key_data: Some("ssh-rsa AAAA svc1".to_string()),
            extensions,
            ..Default::default()
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["CADN"], "\\VED\\Certificate Authority\\SSH\\Templates\\T1");
        assert_eq!(json["PolicyDN"], "\\VED\\Policy\\SSH");
        assert_eq!(json["KeyId"], "svc1");
        assert_eq!(json["Principals"][0], "deploy");
        assert_eq!(json["ValidityPeriod"], "24h");
        assert_eq!(json["PublicKeyData"], "ssh-rsa AAAA svc1");
        assert_eq!(json["Extensions"]["permit-pty"], "");
        // Empty / absent fields are omitted entirely.
        assert!(json.get("ObjectName").is_none());
        assert!(json.get("SourceAddresses").is_none());
        assert!(json.get("ForceCommand").is_none());
    }

    #[test]
    fn retrieve_body_omits_absent_passphrase() {
        let body = RetrieveBody {
            dn: "\\VED\\Certificates\\svc1",
            include_private_key_data: true,
            private_key_passphrase: None,
            include_certificate_details: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["DN"], "\\VED\\Certificates\\svc1");
        assert_eq!(json["IncludeCertificateDetails"], true);
        assert!(json.get("PrivateKeyPassphrase").is_none());
    }

    #[test]
    fn parse_issued_retrieve_response() {
        let json = r#"{
            "CertificateData": "ssh-rsa-cert-v01@openssh.com AAAA",
            "PrivateKeyData": "",
            "PublicKeyData": "ssh-rsa AAAA svc1",
            "CertificateDetails": {
                "CertificateType": "User",
                "PublicKeyFingerprintSHA256": "ab12",
                "CAFingerprintSHA256": "cd34",
                "SerialNumber": "0123",
                "ValidFrom": 1709294400,
                "ValidTo": 1709380800
            },
            "ProcessingDetails": { "Status": "Issued" },
            "Response": { "Success": true }
        }"#;
        let resp: CertificateRetrieveResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.certificate_data, "ssh-rsa-cert-v01@openssh.com AAAA");
        assert!(resp.private_key_data.is_empty());
        let details = resp.certificate_details.unwrap();
        assert_eq!(details.certificate_type, "User");
        assert_eq!(details.public_key_fingerprint_sha256, "ab12");
        assert_eq!(details.ca_fingerprint_sha256, "cd34");
        assert_eq!(details.valid_from, 1_709_294_400);
        assert!(resp.response.success);
    }

    #[test]
    fn request_response_yields_dn() {
        let json = r#"{"DN": "\\VED\\Certificates\\svc1", "Response": {"Success": true}}"#;
        assert_eq!(
            parse_request_response(StatusCode::OK, json).unwrap(),
            "\\VED\\Certificates\\svc1"
        );
    }

    #[test]
    fn request_http_failures_map_by_status() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            match parse_request_response(status, "token expired") {
                Err(TppError::Auth(m)) => {
                    assert!(m.contains("certificate request"));
                    assert!(m.contains("token expired"));
                }
                other => panic!("expected auth error for {status}, got {other:?}"),
            }
        }
        assert!(matches!(
            parse_request_response(StatusCode::INTERNAL_SERVER_ERROR, "oops"),
            Err(TppError::Api(m)) if m.contains("500") && m.contains("oops")
        ));
    }

    #[test]
    fn request_unsuccessful_reply_is_rejected() {
        let json = r#"{"Response": {"Success": false, "ErrorCode": 7, "ErrorMessage": "template disabled"}}"#;
        assert!(matches!(
            parse_request_response(StatusCode::OK, json),
            Err(TppError::Rejected(m)) if m == "template disabled (error code 7)"
        ));
    }

    #[test]
    fn request_success_without_dn_is_api_error() {
        let json = r#"{"DN": "", "Response": {"Success": true}}"#;
        assert!(matches!(
            parse_request_response(StatusCode::OK, json),
            Err(TppError::Api(m)) if m.contains("no DN")
        ));
    }

    #[test]
    fn malformed_body_is_json_error() {
        assert!(matches!(
            parse_request_response(StatusCode::OK, "<html>"),
            Err(TppError::Json(_))
        ));
        assert!(matches!(
            parse_retrieve_response(StatusCode::OK, "not json"),
            Err(TppError::Json(_))
        ));
    }

    #[test]
    fn retrieve_http_failures_map_by_status() {
        assert!(matches!(
            parse_retrieve_response(StatusCode::UNAUTHORIZED, ""),
            Err(TppError::Auth(m)) if m.contains("certificate retrieve")
        ));
        assert!(matches!(
            parse_retrieve_response(StatusCode::BAD_GATEWAY, "upstream"),
            Err(TppError::Api(m)) if m.contains("502") && m.contains("upstream")
        ));
    }

    #[test]
    fn retrieve_pending_reply_parses() {
        let json = r#"{
            "ProcessingDetails": {"Status": "Pending Issuance"},
            "Response": {"Success": false}
        }"#;
        let resp = parse_retrieve_response(StatusCode::OK, json).unwrap();
        assert!(resp.certificate_data.is_empty());
        assert_eq!(resp.processing_details.unwrap().status, "Pending Issuance");
    }

    #[test]
    fn describe_prefers_message() {
        let status = ResponseStatus {
            success: false,
            error_code: 1234,
            error_message: "template disabled".to_string(),
        };
        assert_eq!(describe(&status), "template disabled (error code 1234)");
        assert_eq!(describe(&ResponseStatus::default()), "error code 0");
    }

    #[test]
    fn config_requires_url_and_token() {
        let mut conn = sshcert_core::config::ConnectionConfig::default();
        assert!(matches!(
            TppConfig::from_connection(&conn),
            Err(TppError::Config(_))
        ));
        conn.url = "https://tpp.example.com".to_string();
        assert!(matches!(
            TppConfig::from_connection(&conn),
            Err(TppError::Config(_))
        ));
        conn.access_token = Some(Zeroizing::new("tok".to_string()));
        let cfg = TppConfig::from_connection(&conn).unwrap();
        assert_eq!(cfg.url, "https://tpp.example.com");
        let debug = format!("{cfg:?}");
        assert!(debug.contains("[redacted]"));
        assert!(!debug.contains("\"tok\""));
    }
}
