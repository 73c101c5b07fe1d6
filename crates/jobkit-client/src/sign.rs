//! V4-style request signing: HMAC-SHA256 over a canonical request with a
//! date-scoped derived key.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// Long-lived access credentials plus the region/service scope they sign for.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub service: String,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            region: region.into(),
            service: "ml_platform".to_string(),
        }
    }
}

/// Headers to attach to the outgoing request.
pub(crate) struct SignedRequest {
    pub x_date: String,
    pub content_sha256: String,
    pub authorization: String,
}

pub(crate) fn sign_request(
    credentials: &Credentials,
    method: &str,
    path: &str,
    query: &[(&str, &str)],
    host: &str,
    content_type: &str,
    body: &[u8],
    now: DateTime<Utc>,
) -> SignedRequest {
    let x_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let short_date = now.format("%Y%m%d").to_string();
    let content_sha256 = hex::encode(Sha256::digest(body));

    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| {
            (
                urlencoding::encode(k).into_owned(),
                urlencoding::encode(v).into_owned(),
            )
        })
        .collect();
    pairs.sort();
    let canonical_query = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_headers = format!(
        "content-type:{content_type}\nhost:{host}\nx-content-sha256:{content_sha256}\nx-date:{x_date}\n"
    );
    let signed_headers = "content-type;host;x-content-sha256;x-date";
    let canonical_request = format!(
        "{method}\n{path}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{content_sha256}"
    );

    let scope = format!(
        "{short_date}/{}/{}/request",
        credentials.region, credentials.service
    );
    let string_to_sign = format!(
        "HMAC-SHA256\n{x_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(credentials.secret_access_key.as_bytes(), short_date.as_bytes());
    let k_region = hmac_sha256(&k_date, credentials.region.as_bytes());
    let k_service = hmac_sha256(&k_region, credentials.service.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"request");
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    );

    SignedRequest {
        x_date,
        content_sha256,
        authorization,
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn credentials() -> Credentials {
        Credentials::new("AKTEST", "secret", "region-1")
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap()
    }

    #[test]
    fn signature_is_deterministic_for_fixed_inputs() {
        let query = [("Action", "GetCustomTask"), ("Version", "2021-10-01")];
        let first = sign_request(
            &credentials(),
            "POST",
            "/",
            &query,
            "api.example",
            "application/json",
            b"{\"Id\":\"t-1\"}",
            fixed_now(),
        );
        let second = sign_request(
            &credentials(),
            "POST",
            "/",
            &query,
            "api.example",
            "application/json",
            b"{\"Id\":\"t-1\"}",
            fixed_now(),
        );
        assert_eq!(first.authorization, second.authorization);
        assert_eq!(first.x_date, "20240601T083000Z");
        assert_eq!(first.content_sha256, second.content_sha256);
    }

    #[test]
    fn authorization_carries_scope_and_signed_headers() {
        let signed = sign_request(
            &credentials(),
            "POST",
            "/",
            &[("Action", "ListFlavorsV2")],
            "api.example",
            "application/json",
            b"{}",
            fixed_now(),
        );
        assert!(signed
            .authorization
            .starts_with("HMAC-SHA256 Credential=AKTEST/20240601/region-1/ml_platform/request"));
        assert!(signed
            .authorization
            .contains("SignedHeaders=content-type;host;x-content-sha256;x-date"));
    }

    #[test]
    fn secret_and_payload_change_the_signature() {
        let query = [("Action", "GetCustomTask")];
        let base = sign_request(
            &credentials(),
            "POST",
            "/",
            &query,
            "api.example",
            "application/json",
            b"{}",
            fixed_now(),
        );
        let other_secret = Credentials::new("AKTEST", "other", "region-1");
        let signed = sign_request(
            &other_secret,
            "POST",
            "/",
            &query,
            "api.example",
            "application/json",
            b"{}",
            fixed_now(),
        );
        assert_ne!(base.authorization, signed.authorization);

        let other_body = sign_request(
            &credentials(),
            "POST",
            "/",
            &query,
            "api.example",
            "application/json",
            b"{\"Id\":\"t-2\"}",
            fixed_now(),
        );
        assert_ne!(base.authorization, other_body.authorization);
    }
}
