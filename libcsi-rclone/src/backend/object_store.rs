//! Object-storage client boundary used by the S3 backend.
//!
//! [`ObjectStore`] is the narrow set of bucket/prefix calls the backend
//! needs.  [`HttpObjectStore`] implements it against any S3-compatible
//! endpoint with path-style addressing and AWS Signature Version 4.

use std::sync::LazyLock;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use regex::Regex;
use reqwest::{Client, Method, Response, StatusCode, Url};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::error::CsiError;

/// Bucket and prefix operations against an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `true` if `bucket` exists and is reachable with these credentials.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, CsiError>;

    /// Create `bucket`.  Creating a bucket the caller already owns succeeds.
    async fn create_bucket(&self, bucket: &str) -> Result<(), CsiError>;

    /// Delete every object in `bucket`, then the bucket itself.
    ///
    /// Fails with [`CsiError::VolumeNotFound`] if the bucket does not exist.
    async fn remove_bucket(&self, bucket: &str) -> Result<(), CsiError>;

    /// Write the empty directory marker object `<prefix>/`.
    async fn create_prefix(&self, bucket: &str, prefix: &str) -> Result<(), CsiError>;

    /// Delete every object under `<prefix>/`, including the marker.
    ///
    /// A missing bucket or an empty prefix is not an error.
    async fn remove_prefix(&self, bucket: &str, prefix: &str) -> Result<(), CsiError>;
}

const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";
const DEFAULT_REGION: &str = "us-east-1";

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Key>([^<]*)</Key>").expect("valid regex"));
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<NextContinuationToken>([^<]*)</NextContinuationToken>").expect("valid regex")
});
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Code>([^<]*)</Code>").expect("valid regex"));

/// S3 client speaking the REST API over HTTP(S).
pub struct HttpObjectStore {
    client: Client,
    endpoint: Url,
    region: String,
    access_key: String,
    secret_key: String,
}

impl std::fmt::Debug for HttpObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpObjectStore")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl HttpObjectStore {
    /// Create a client for `endpoint` (e.g. `https://storage.example.com`).
    ///
    /// An empty `region` signs requests for `us-east-1`.
    pub fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, CsiError> {
        let endpoint = parse_endpoint(endpoint)?;
        let client = Client::builder().build().map_err(CsiError::internal)?;
        Ok(Self {
            client,
            endpoint,
            region: if region.is_empty() {
                DEFAULT_REGION.to_owned()
            } else {
                region.to_owned()
            },
            access_key: access_key.to_owned(),
            secret_key: secret_key.to_owned(),
        })
    }

    /// Send a signed request for `/<bucket>[/<key>]`.
    async fn send(
        &self,
        method: Method,
        bucket: &str,
        key: Option<&str>,
        query: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<Response, CsiError> {
        let mut path = self.endpoint.path().trim_end_matches('/').to_owned();
        path.push('/');
        path.push_str(bucket);
        if let Some(key) = key {
            path.push('/');
            path.push_str(key);
        }

        let canonical_uri = uri_encode(&path, false);
        let canonical_query = canonical_query(query);
        let host = host_header(&self.endpoint)?;
        let now = chrono::Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(&body));

        let canonical_request = canonical_request(
            method.as_str(),
            &canonical_uri,
            &canonical_query,
            &host,
            &payload_hash,
            &amz_date,
        );
        let scope = format!("{date}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "{SIGNING_ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signature = sign(&self.secret_key, &date, &self.region, &string_to_sign)?;
        let authorization = format!(
            "{SIGNING_ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            self.access_key
        );

        let mut url = format!(
            "{}://{host}{canonical_uri}",
            self.endpoint.scheme()
        );
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }
        let url = Url::parse(&url).map_err(CsiError::internal)?;

        debug!(%method, %url, "S3 request");
        self.client
            .request(method, url)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("authorization", authorization)
            .body(body)
            .send()
            .await
            .map_err(CsiError::backend)
    }

    /// List every key in `bucket` starting with `prefix`.
    ///
    /// Returns `None` when the bucket does not exist.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Option<Vec<String>>, CsiError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(token) = token.as_deref() {
                query.push(("continuation-token", token));
            }
            let response = self.send(Method::GET, bucket, None, &query, Vec::new()).await?;
            match response.status() {
                StatusCode::OK => {}
                StatusCode::NOT_FOUND => return Ok(None),
                _ => return Err(unexpected("list objects", bucket, response).await),
            }
            let body = response.text().await.map_err(CsiError::backend)?;
            let page = parse_list_page(&body);
            keys.extend(page.keys);
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(Some(keys)),
            }
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CsiError> {
        let response = self
            .send(Method::DELETE, bucket, Some(key), &[], Vec::new())
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(unexpected("delete object", bucket, response).await),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    #[instrument(skip(self))]
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, CsiError> {
        let response = self
            .send(Method::HEAD, bucket, None, &[], Vec::new())
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(unexpected("head bucket", bucket, response).await),
        }
    }

    #[instrument(skip(self))]
    async fn create_bucket(&self, bucket: &str) -> Result<(), CsiError> {
        let body = if self.region == DEFAULT_REGION {
            Vec::new()
        } else {
            format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.region
            )
            .into_bytes()
        };
        let response = self.send(Method::PUT, bucket, None, &[], body).await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => {
                let text = response.text().await.map_err(CsiError::backend)?;
                match error_code(&text) {
                    Some("BucketAlreadyOwnedByYou") => Ok(()),
                    code => Err(CsiError::BackendError(format!(
                        "create bucket {bucket}: {}",
                        code.unwrap_or("conflict")
                    ))),
                }
            }
            _ => Err(unexpected("create bucket", bucket, response).await),
        }
    }

    #[instrument(skip(self))]
    async fn remove_bucket(&self, bucket: &str) -> Result<(), CsiError> {
        let keys = self
            .list_keys(bucket, "")
            .await?
            .ok_or_else(|| CsiError::VolumeNotFound(bucket.to_owned()))?;
        for key in &keys {
            self.delete_object(bucket, key).await?;
        }

        let response = self
            .send(Method::DELETE, bucket, None, &[], Vec::new())
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(CsiError::VolumeNotFound(bucket.to_owned())),
            _ => Err(unexpected("delete bucket", bucket, response).await),
        }
    }

    #[instrument(skip(self))]
    async fn create_prefix(&self, bucket: &str, prefix: &str) -> Result<(), CsiError> {
        let marker = format!("{}/", prefix.trim_end_matches('/'));
        let response = self
            .send(Method::PUT, bucket, Some(&marker), &[], Vec::new())
            .await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            _ => Err(unexpected("put prefix marker", bucket, response).await),
        }
    }

    #[instrument(skip(self))]
    async fn remove_prefix(&self, bucket: &str, prefix: &str) -> Result<(), CsiError> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let Some(keys) = self.list_keys(bucket, &dir).await? else {
            return Ok(());
        };
        for key in &keys {
            self.delete_object(bucket, key).await?;
        }
        Ok(())
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, CsiError> {
    let url = Url::parse(endpoint)
        .map_err(|e| CsiError::InvalidArgument(format!("endpoint {endpoint:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(CsiError::InvalidArgument(format!(
            "endpoint {endpoint:?} must be an http(s) URL with a host"
        )));
    }
    Ok(url)
}

fn host_header(endpoint: &Url) -> Result<String, CsiError> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| CsiError::Internal("endpoint without host".into()))?;
    Ok(match endpoint.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}

/// Percent-encode per SigV4: everything but `A-Za-z0-9-_.~` (and `/` in
/// paths) becomes `%XX` with uppercase hex.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn canonical_query(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonical_request(
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    host: &str,
    payload_hash: &str,
    amz_date: &str,
) -> String {
    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n\
         host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n\
         {SIGNED_HEADERS}\n{payload_hash}"
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CsiError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(CsiError::internal)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the SigV4 signing key for `date`/`region`/`s3` and sign
/// `string_to_sign`, returning lowercase hex.
fn sign(secret_key: &str, date: &str, region: &str, string_to_sign: &str) -> Result<String, CsiError> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, b"s3")?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    Ok(hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?))
}

struct ListPage {
    keys: Vec<String>,
    next_token: Option<String>,
}

fn parse_list_page(xml: &str) -> ListPage {
    let keys = KEY_RE
        .captures_iter(xml)
        .map(|c| xml_unescape(&c[1]))
        .collect();
    let truncated = xml.contains("<IsTruncated>true</IsTruncated>");
    let next_token = TOKEN_RE
        .captures(xml)
        .map(|c| xml_unescape(&c[1]))
        .filter(|_| truncated);
    ListPage { keys, next_token }
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn error_code(xml: &str) -> Option<&str> {
    CODE_RE.captures(xml).and_then(|c| c.get(1)).map(|m| m.as_str())
}

async fn unexpected(operation: &str, bucket: &str, response: Response) -> CsiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = error_code(&body).unwrap_or(body.trim()).to_owned();
    CsiError::BackendError(format!("{operation} {bucket}: HTTP {status}: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_encoding() {
        assert_eq!(uri_encode("/bucket/a b/c~d", false), "/bucket/a%20b/c~d");
        assert_eq!(uri_encode("a/b=c", true), "a%2Fb%3Dc");
    }

    #[test]
    fn canonical_query_is_sorted_and_encoded() {
        assert_eq!(
            canonical_query(&[("prefix", "vol 1/"), ("list-type", "2")]),
            "list-type=2&prefix=vol%201%2F"
        );
        assert_eq!(canonical_query(&[]), "");
    }

    #[test]
    fn canonical_request_layout() {
        let req = canonical_request("GET", "/b", "list-type=2", "s3.local:9000", "abc", "20240101T000000Z");
        assert_eq!(
            req,
            "GET\n/b\nlist-type=2\nhost:s3.local:9000\nx-amz-content-sha256:abc\n\
             x-amz-date:20240101T000000Z\n\nhost;x-amz-content-sha256;x-amz-date\nabc"
        );
    }

    #[test]
    fn signature_matches_reference() {
        // Reference value computed independently with HMAC-SHA256.
        let sig = sign(
            "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY",
            "20130524",
            "us-east-1",
            "AWS4-HMAC-SHA256\n20130524T000000Z\n20130524/us-east-1/s3/aws4_request\n\
             7344ae5b7ee6c3e7e6b0fe0640412a37625d1fbfff95c48bbb2dc43964946972",
        )
        .unwrap();
        assert_eq!(sig, "f0e8bdb87c964420e857bd35b5d6ed310bd44f0170aba48dd91039c6036bdb41");
    }

    #[test]
    fn list_page_parsing() {
        let xml = "<ListBucketResult><IsTruncated>true</IsTruncated>\
                   <Contents><Key>vol/</Key></Contents>\
                   <Contents><Key>vol/a&amp;b.txt</Key></Contents>\
                   <NextContinuationToken>tok=1</NextContinuationToken></ListBucketResult>";
        let page = parse_list_page(xml);
        assert_eq!(page.keys, vec!["vol/", "vol/a&b.txt"]);
        assert_eq!(page.next_token.as_deref(), Some("tok=1"));

        let last = parse_list_page("<IsTruncated>false</IsTruncated><Key>x</Key>");
        assert_eq!(last.keys, vec!["x"]);
        assert!(last.next_token.is_none());
    }

    #[test]
    fn error_code_extraction() {
        let xml = "<Error><Code>BucketAlreadyOwnedByYou</Code><Message>..</Message></Error>";
        assert_eq!(error_code(xml), Some("BucketAlreadyOwnedByYou"));
        assert_eq!(error_code("not xml"), None);
    }

    #[test]
    fn endpoint_validation() {
        assert!(HttpObjectStore::new("https://storage.example.com", "", "a", "s").is_ok());
        assert!(matches!(
            HttpObjectStore::new("storage.example.com", "", "a", "s"),
            Err(CsiError::InvalidArgument(_))
        ));
        assert!(matches!(
            HttpObjectStore::new("ftp://storage.example.com", "", "a", "s"),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn host_header_keeps_explicit_port() {
        let url = parse_endpoint("http://minio.local:9000").unwrap();
        assert_eq!(host_header(&url).unwrap(), "minio.local:9000");
        let url = parse_endpoint("https://s3.amazonaws.com").unwrap();
        assert_eq!(host_header(&url).unwrap(), "s3.amazonaws.com");
    }
}
