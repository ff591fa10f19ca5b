//! AWS Signature Version 4 for S3 requests
//!
//! Credentials come from `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY`
//! (`AWS_SESSION_TOKEN` optional), falling back to the `[default]` or
//! `$AWS_PROFILE` section of `~/.aws/credentials`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{EmbrError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const DEFAULT_REGION: &str = "us-east-1";
const SERVICE: &str = "s3";

/// SHA-256 of the empty payload
pub const EMPTY_PAYLOAD_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn from_env() -> Option<Self> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").ok().filter(|v| !v.is_empty())?;
        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok().filter(|v| !v.is_empty())?;
        Some(Self {
            access_key,
            secret_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok().filter(|v| !v.is_empty()),
        })
    }

    /// Read `profile` from an AWS shared credentials file
    pub fn from_file(path: &Path, profile: &str) -> Result<Option<Self>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::parse_profile(&text, profile))
    }

    fn parse_profile(text: &str, profile: &str) -> Option<Self> {
        let mut in_section = false;
        let (mut access_key, mut secret_key, mut session_token) = (None, None, None);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_section = section.trim() == profile;
                continue;
            }
            if !in_section {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "aws_access_key_id" => access_key = Some(value),
                "aws_secret_access_key" => secret_key = Some(value),
                "aws_session_token" => session_token = Some(value),
                _ => {}
            }
        }
        Some(Self {
            access_key: access_key?,
            secret_key: secret_key?,
            session_token,
        })
    }

    fn credentials_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AWS_SHARED_CREDENTIALS_FILE") {
            return Some(PathBuf::from(path));
        }
        std::env::var("HOME")
            .ok()
            .map(|home| Path::new(&home).join(".aws").join("credentials"))
    }

    /// Environment first, then the shared credentials file
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_env() {
            return Ok(creds);
        }
        let profile = std::env::var("AWS_PROFILE").unwrap_or_else(|_| "default".to_string());
        if let Some(path) = Self::credentials_file() {
            if let Some(creds) = Self::from_file(&path, &profile)? {
                return Ok(creds);
            }
        }
        Err(EmbrError::Auth(format!(
            "no AWS credentials in the environment or profile '{}'",
            profile
        )))
    }
}

/// Region from the URL, then `AWS_REGION`, then us-east-1
pub fn resolve_region(from_url: Option<&str>) -> String {
    from_url
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()))
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

/// RFC 3986 percent-encoding as SigV4 expects; `/` is kept unless `encode_slash`
pub fn uri_encode(s: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            b'/' if !encode_slash => out.push('/'),
            _ => {
                let _ = write!(out, "%{:02X}", b);
            }
        }
    }
    out
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| EmbrError::Auth(format!("HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `kSigning` for a date (`YYYYMMDD`), region and service
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

/// One request to sign
#[derive(Debug, Clone)]
pub struct SignRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    /// Already URI-encoded path, starting with `/`
    pub path: &'a str,
    /// Decoded query parameters
    pub query: &'a [(String, String)],
    pub payload_sha256: &'a str,
}

/// Sorted, encoded query string
pub fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Headers (`host` excluded) to attach to the request, `authorization` last
pub fn sign(
    request: &SignRequest<'_>,
    creds: &Credentials,
    region: &str,
    now: DateTime<Utc>,
) -> Result<Vec<(String, String)>> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut headers: Vec<(String, String)> = vec![
        ("host".into(), request.host.to_string()),
        ("x-amz-content-sha256".into(), request.payload_sha256.to_string()),
        ("x-amz-date".into(), amz_date.clone()),
    ];
    if let Some(token) = &creds.session_token {
        headers.push(("x-amz-security-token".into(), token.clone()));
    }
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method,
        request.path,
        canonical_query(request.query),
        canonical_headers,
        signed_headers,
        request.payload_sha256
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, SERVICE);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );
    let key = signing_key(&creds.secret_key, &date, region, SERVICE)?;
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    let mut out: Vec<(String, String)> = headers.into_iter().filter(|(k, _)| k != "host").collect();
    out.push((
        "authorization".into(),
        format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, creds.access_key, scope, signed_headers, signature
        ),
    ));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn creds() -> Credentials {
        Credentials {
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            session_token: None,
        }
    }

    #[test]
    fn test_signing_key_derivation() {
        let key = signing_key("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY", "20120215", "us-east-1", "iam").unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("a b/c~d", false), "a%20b/c~d");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
        assert_eq!(sha256_hex(b""), EMPTY_PAYLOAD_SHA256);
    }

    #[test]
    fn test_canonical_query_is_sorted() {
        let query = vec![
            ("prefix".to_string(), "sets/main/".to_string()),
            ("list-type".to_string(), "2".to_string()),
        ];
        assert_eq!(canonical_query(&query), "list-type=2&prefix=sets%2Fmain%2F");
    }

    #[test]
    fn test_sign_produces_authorization() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let request = SignRequest {
            method: "GET",
            host: "bucket.s3.us-east-1.amazonaws.com",
            path: "/sets/main/metadata.json",
            query: &[],
            payload_sha256: EMPTY_PAYLOAD_SHA256,
        };
        let headers = sign(&request, &creds(), "us-east-1", now).unwrap();
        let auth = &headers.last().unwrap().1;
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/us-east-1/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));
        assert!(headers.iter().any(|(k, v)| k == "x-amz-date" && v == "20240501T120000Z"));
        assert!(!headers.iter().any(|(k, _)| k == "host"));

        // Deterministic for identical input
        assert_eq!(sign(&request, &creds(), "us-east-1", now).unwrap(), headers);
    }

    #[test]
    fn test_session_token_is_signed() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut creds = creds();
        creds.session_token = Some("tok".into());
        let request = SignRequest {
            method: "PUT",
            host: "h",
            path: "/k",
            query: &[],
            payload_sha256: EMPTY_PAYLOAD_SHA256,
        };
        let headers = sign(&request, &creds, "eu-west-1", now).unwrap();
        assert!(headers.iter().any(|(k, v)| k == "x-amz-security-token" && v == "tok"));
        assert!(headers.last().unwrap().1.contains("x-amz-security-token"));
    }

    #[test]
    fn test_credentials_file_profiles() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("credentials");
        std::fs::write(
            &path,
            "[default]\naws_access_key_id = A1\naws_secret_access_key = S1\n\n\
             [work]\naws_access_key_id=A2\naws_secret_access_key=S2\naws_session_token=T2\n",
        )
        .unwrap();
        let default = Credentials::from_file(&path, "default").unwrap().unwrap();
        assert_eq!(default.access_key, "A1");
        assert_eq!(default.session_token, None);
        let work = Credentials::from_file(&path, "work").unwrap().unwrap();
        assert_eq!(work.secret_key, "S2");
        assert_eq!(work.session_token.as_deref(), Some("T2"));
        assert!(Credentials::from_file(&path, "other").unwrap().is_none());
        assert!(Credentials::from_file(&temp_dir.path().join("none"), "default").unwrap().is_none());
    }

    #[test]
    fn test_region_from_url_wins() {
        assert_eq!(resolve_region(Some("eu-central-1")), "eu-central-1");
    }
}
