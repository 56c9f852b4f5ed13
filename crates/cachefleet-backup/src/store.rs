//! Object storage — bucket get-or-create and put-blob.
//!
//! [`S3Store`] speaks the S3 REST API with path-style addressing
//! (`<endpoint>/<bucket>/<key>`) and AWS Signature Version 4.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";
const DEFAULT_REGION: &str = "us-east-1";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket. An existing bucket is not an error.
    async fn ensure_bucket(&self, bucket: &str) -> StoreResult<()>;

    /// Upload the file at `path` as `key`. Returns the bytes written.
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> StoreResult<u64>;
}

#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct S3Store {
    http: reqwest::Client,
    endpoint: Url,
    credentials: S3Credentials,
}

impl S3Store {
    pub fn new(endpoint: &str, credentials: S3Credentials) -> StoreResult<Self> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| StoreError::Endpoint(format!("{endpoint}: {e}")))?;
        if endpoint.host_str().is_none() {
            return Err(StoreError::Endpoint(endpoint.to_string()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.as_str().trim_end_matches('/'), path)
    }

    fn host_header(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Signed PUT. `tolerated` is a non-2xx status that still counts as
    /// success.
    async fn put(
        &self,
        path: &str,
        body: Vec<u8>,
        tolerated: Option<StatusCode>,
    ) -> StoreResult<()> {
        let url = self.url(path);
        let payload_hash = hex::encode(Sha256::digest(&body));
        let signed = sign(
            &self.credentials,
            "PUT",
            path,
            &self.host_header(),
            &payload_hash,
            Utc::now(),
        )?;

        let resp = self
            .http
            .put(&url)
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-content-sha256", &payload_hash)
            .header(reqwest::header::AUTHORIZATION, &signed.authorization)
            .body(body)
            .send()
            .await
            .map_err(|source| StoreError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = resp.status();
        debug!(%url, status = status.as_u16(), "object store response");
        if status.is_success() || Some(status) == tolerated {
            return Ok(());
        }
        Err(StoreError::Status {
            method: "PUT",
            url,
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn ensure_bucket(&self, bucket: &str) -> StoreResult<()> {
        // 409: the bucket already exists.
        let path = format!("/{}", uri_encode(bucket));
        let body = bucket_configuration(&self.credentials.region);
        self.put(&path, body.into_bytes(), Some(StatusCode::CONFLICT))
            .await
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> StoreResult<u64> {
        let body = tokio::fs::read(path).await.map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let size = body.len() as u64;
        let object_path = format!("/{}/{}", uri_encode(bucket), uri_encode(key));
        self.put(&object_path, body, None).await?;
        info!(%bucket, %key, size, "object uploaded");
        Ok(size)
    }
}

/// CreateBucket body. us-east-1 is the default location and takes none;
/// any other region must be named or S3 rejects the request.
fn bucket_configuration(region: &str) -> String {
    if region.is_empty() || region == DEFAULT_REGION {
        return String::new();
    }
    format!(
        "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <LocationConstraint>{region}</LocationConstraint>\
         </CreateBucketConfiguration>"
    )
}

// ── Signature V4 ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct Signed {
    amz_date: String,
    authorization: String,
}

fn sign(
    credentials: &S3Credentials,
    method: &str,
    canonical_uri: &str,
    host: &str,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> StoreResult<Signed> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/{}/{SERVICE}/aws4_request", credentials.region);

    let canonical_request = format!(
        "{method}\n{canonical_uri}\n\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{payload_hash}"
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&credentials.secret_key, &date, &credentials.region, SERVICE)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    Ok(Signed {
        authorization: format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            credentials.access_key
        ),
        amz_date,
    })
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> StoreResult<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> StoreResult<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| StoreError::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encode everything but unreserved characters and `/`.
fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::Path as UrlPath;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::put;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    fn credentials() -> S3Credentials {
        S3Credentials {
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            region: "us-east-1".into(),
        }
    }

    #[test]
    fn uri_encode_keeps_slashes_and_unreserved() {
        assert_eq!(uri_encode("a/b-c_d.e~f"), "a/b-c_d.e~f");
        assert_eq!(uri_encode("2024-01-02T03:04:05Z-redis-backup"), "2024-01-02T03%3A04%3A05Z-redis-backup");
        assert_eq!(uri_encode("a b"), "a%20b");
    }

    #[test]
    fn signature_is_deterministic_and_scoped() {
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        let empty = hex::encode(Sha256::digest(b""));
        let a = sign(&credentials(), "PUT", "/bucket", "s3.local:9000", &empty, now).unwrap();
        let b = sign(&credentials(), "PUT", "/bucket", "s3.local:9000", &empty, now).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.amz_date, "20150830T123600Z");
        assert!(a.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/s3/aws4_request, SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));
        let signature = a.authorization.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);

        let c = sign(&credentials(), "PUT", "/other", "s3.local:9000", &empty, now).unwrap();
        assert_ne!(a.authorization, c.authorization);
    }

    #[test]
    fn signing_key_matches_published_derivation() {
        // Derivation example from the AWS SigV4 documentation.
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[derive(Clone, Default)]
    struct Received {
        requests: Arc<Mutex<Vec<(String, HeaderMap, Vec<u8>)>>>,
    }

    async fn fake_s3(bucket_status: AxumStatus) -> (String, Received) {
        let received = Received::default();
        let bucket_log = received.clone();
        let object_log = received.clone();
        let router = Router::new()
            .route(
                "/{bucket}",
                put(
                    move |UrlPath(bucket): UrlPath<String>, headers: HeaderMap, body: Bytes| {
                        let log = bucket_log.clone();
                        async move {
                            log.requests.lock().unwrap().push((bucket, headers, body.to_vec()));
                            bucket_status
                        }
                    },
                ),
            )
            .route(
                "/{bucket}/{*key}",
                put(
                    move |UrlPath((bucket, key)): UrlPath<(String, String)>,
                          headers: HeaderMap,
                          body: Bytes| {
                        let log = object_log.clone();
                        async move {
                            log.requests
                                .lock()
                                .unwrap()
                                .push((format!("{bucket}/{key}"), headers, body.to_vec()));
                            AxumStatus::OK
                        }
                    },
                ),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), received)
    }

    #[tokio::test]
    async fn existing_bucket_is_success() {
        let (endpoint, received) = fake_s3(AxumStatus::CONFLICT).await;
        let store = S3Store::new(&endpoint, credentials()).unwrap();
        store.ensure_bucket("backups").await.unwrap();
        assert_eq!(received.requests.lock().unwrap()[0].0, "backups");
    }

    #[tokio::test]
    async fn bucket_outside_us_east_1_names_its_region() {
        let (endpoint, received) = fake_s3(AxumStatus::OK).await;
        let store = S3Store::new(
            &endpoint,
            S3Credentials {
                region: "eu-west-1".into(),
                ..credentials()
            },
        )
        .unwrap();
        store.ensure_bucket("backups").await.unwrap();

        let requests = received.requests.lock().unwrap();
        let (_, headers, body) = &requests[0];
        let body = std::str::from_utf8(body).unwrap();
        assert!(body.starts_with("<CreateBucketConfiguration"), "{body}");
        assert!(body.contains("<LocationConstraint>eu-west-1</LocationConstraint>"), "{body}");
        assert!(body.ends_with("</CreateBucketConfiguration>"), "{body}");
        assert_eq!(
            headers["x-amz-content-sha256"],
            hex::encode(Sha256::digest(body.as_bytes())).as_str()
        );
        assert!(headers["authorization"]
            .to_str()
            .unwrap()
            .contains("/eu-west-1/s3/aws4_request"));
    }

    #[tokio::test]
    async fn bucket_in_us_east_1_has_no_body() {
        let (endpoint, received) = fake_s3(AxumStatus::OK).await;
        let store = S3Store::new(&endpoint, credentials()).unwrap();
        store.ensure_bucket("backups").await.unwrap();
        assert!(received.requests.lock().unwrap()[0].2.is_empty());
    }

    #[tokio::test]
    async fn forbidden_bucket_is_error() {
        let (endpoint, _) = fake_s3(AxumStatus::FORBIDDEN).await;
        let store = S3Store::new(&endpoint, credentials()).unwrap();
        let err = store.ensure_bucket("backups").await.unwrap_err();
        assert!(matches!(err, StoreError::Status { status: 403, .. }));
    }

    #[tokio::test]
    async fn put_file_signs_and_uploads_body() {
        let (endpoint, received) = fake_s3(AxumStatus::OK).await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("dump.rdb");
        std::fs::write(&file, vec![7u8; 1024]).unwrap();

        let store = S3Store::new(&endpoint, credentials()).unwrap();
        let size = store
            .put_file("backups", "prefix/node-0/inst-A/backup", &file)
            .await
            .unwrap();
        assert_eq!(size, 1024);

        let requests = received.requests.lock().unwrap();
        let (path, headers, body) = &requests[0];
        assert_eq!(path, "backups/prefix/node-0/inst-A/backup");
        assert_eq!(body.len(), 1024);
        assert_eq!(
            headers["x-amz-content-sha256"],
            hex::encode(Sha256::digest(&vec![7u8; 1024])).as_str()
        );
        assert!(headers["authorization"]
            .to_str()
            .unwrap()
            .starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    }

    #[test]
    fn rejects_endpoint_without_host() {
        assert!(matches!(
            S3Store::new("not a url", credentials()),
            Err(StoreError::Endpoint(_))
        ));
    }
}
