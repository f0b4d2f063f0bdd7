//! AWS SigV4 request signing
//!
//! Implements the header-based Signature Version 4 flow:
//!
//! 1. canonical request (method, URI, query, headers, signed header list, payload hash)
//! 2. string to sign (`AWS4-HMAC-SHA256`, timestamp, credential scope, hashed canonical request)
//! 3. signing key derived from the secret, date, region and service
//! 4. `Authorization` header

use super::{host_header, sha256_hex, uri_encode, SignableRequest, SigningError};
use crate::s3::credentials::Credentials;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// SigV4 request signer
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    credentials: Credentials,
    region: String,
    service: String,
}

impl SigV4Signer {
    /// Create a signer for the S3 service in `region`
    pub fn new(credentials: Credentials, region: &str) -> Self {
        Self {
            credentials,
            region: region.to_string(),
            service: "s3".to_string(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Sign `request` as of `now`.
    ///
    /// Adds `host`, `x-amz-date`, `x-amz-content-sha256`, `x-amz-security-token`
    /// (temporary credentials only) and `authorization`. Every header present on
    /// the request before signing is part of the signature.
    pub fn sign(
        &self,
        request: &mut SignableRequest,
        now: DateTime<Utc>,
    ) -> Result<(), SigningError> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let host = host_header(request.url())?;
        let payload_hash = request.payload_hash().to_string();
        request.insert_header("host", host);
        request.insert_header("x-amz-date", amz_date.clone());
        request.insert_header("x-amz-content-sha256", payload_hash);
        if let Some(token) = self.credentials.session_token() {
            request.insert_header("x-amz-security-token", token);
        }

        let (canonical_request, signed_headers) = canonical_request(request);
        let scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signing_key = self.signing_key(&date_stamp);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        tracing::trace!(
            canonical_request = %canonical_request,
            signed_headers = %signed_headers,
            "Signed request"
        );

        request.insert_header(
            "authorization",
            format!(
                "{} Credential={}/{},SignedHeaders={},Signature={}",
                ALGORITHM,
                self.credentials.access_key_id(),
                scope,
                signed_headers,
                signature
            ),
        );

        Ok(())
    }

    /// Derive the signing key for `date_stamp` (`YYYYMMDD`)
    pub fn signing_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_secret = format!("AWS4{}", self.credentials.secret_access_key());
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }
}

/// Build the canonical request, returning it with the signed header list
pub(crate) fn canonical_request(request: &SignableRequest) -> (String, String) {
    let canonical_uri = match request.url().path() {
        "" => "/".to_string(),
        path => path.to_string(),
    };

    let mut query: Vec<(String, String)> = request
        .url()
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    query.sort();
    let canonical_query = query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    // BTreeMap keeps header names sorted
    let mut canonical_headers = String::new();
    for (name, value) in request.headers() {
        if name == "authorization" {
            continue;
        }
        canonical_headers.push_str(name);
        canonical_headers.push(':');
        canonical_headers.push_str(&normalize_header_value(value));
        canonical_headers.push('\n');
    }
    let signed_headers = request
        .headers()
        .keys()
        .filter(|name| name.as_str() != "authorization")
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(";");

    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method(),
        canonical_uri,
        canonical_query,
        canonical_headers,
        signed_headers,
        request.payload_hash()
    );

    (canonical, signed_headers)
}

/// Trim and collapse runs of whitespace
fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
