// Dropbox API v2 client
// RPC endpoints:     https://api.dropboxapi.com/2/...
// Content endpoints: https://content.dropboxapi.com/2/... (download, upload, download_zip)
//
// Content endpoints take their arguments as JSON in the `Dropbox-API-Arg`
// header. HTTP headers must be ASCII, so non-ASCII characters in paths
// (Japanese file names are common here) are sent as \uXXXX escapes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::{header, Client, Response, StatusCode};
use serde::{de::DeserializeOwned, de::IgnoredAny, Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{ByteStream, EntryKind, StorageEntry, StorageError, StorageGateway, WriteMode};
use crate::config::DropboxCredentials;

const DEFAULT_API_BASE: &str = "https://api.dropboxapi.com";
const DEFAULT_CONTENT_BASE: &str = "https://content.dropboxapi.com";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";
// Refresh this long before the provider-reported expiry
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 300;

pub struct DropboxClient {
    http: Client,
    api_base: String,
    content_base: String,
    credentials: DropboxCredentials,
    token: RwLock<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

// Wire types
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum WireMetadata {
    File {
        name: String,
        #[serde(default)]
        path_lower: Option<String>,
        #[serde(default)]
        path_display: Option<String>,
        #[serde(default)]
        server_modified: Option<DateTime<Utc>>,
        #[serde(default)]
        size: Option<u64>,
    },
    Folder {
        name: String,
        #[serde(default)]
        path_lower: Option<String>,
        #[serde(default)]
        path_display: Option<String>,
    },
    Deleted {
        name: String,
    },
}

impl WireMetadata {
    fn into_entry(self) -> Option<StorageEntry> {
        match self {
            WireMetadata::File {
                name,
                path_lower,
                path_display,
                server_modified,
                size,
            } => Some(StorageEntry {
                kind: EntryKind::File,
                path_lower: path_lower.unwrap_or_default(),
                path_display: path_display.unwrap_or_default(),
                name,
                server_modified,
                size,
            }),
            WireMetadata::Folder {
                name,
                path_lower,
                path_display,
            } => Some(StorageEntry {
                kind: EntryKind::Folder,
                path_lower: path_lower.unwrap_or_default(),
                path_display: path_display.unwrap_or_default(),
                name,
                server_modified: None,
                size: None,
            }),
            WireMetadata::Deleted { .. } => None,
        }
    }
}

#[derive(Deserialize)]
struct ListFolderResponse {
    entries: Vec<WireMetadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Deserialize)]
struct TemporaryLinkResponse {
    link: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error_summary: String,
}

impl DropboxClient {
    pub fn new(credentials: DropboxCredentials) -> Self {
        Self::with_base_urls(credentials, DEFAULT_API_BASE, DEFAULT_CONTENT_BASE)
    }

    /// Point the client at different hosts (used by tests against a mock server)
    pub fn with_base_urls(
        credentials: DropboxCredentials,
        api_base: impl Into<String>,
        content_base: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            content_base: content_base.into().trim_end_matches('/').to_string(),
            credentials,
            token: RwLock::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, StorageError> {
        match &self.credentials {
            DropboxCredentials::Static { access_token } => Ok(access_token.clone()),
            DropboxCredentials::Refresh { .. } => {
                if let Some(token) = self.token.read().await.as_ref() {
                    if token.is_fresh(Utc::now()) {
                        return Ok(token.value.clone());
                    }
                }
                self.refresh_access_token().await
            }
        }
    }

    /// Exchange the long-lived refresh token for a short-lived access token
    async fn refresh_access_token(&self) -> Result<String, StorageError> {
        let DropboxCredentials::Refresh {
            refresh_token,
            client_id,
            client_secret,
        } = &self.credentials
        else {
            return Err(StorageError::Auth("no refresh credential configured".into()));
        };

        let mut slot = self.token.write().await;
        // Another request may have refreshed while we waited for the lock
        if let Some(token) = slot.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.value.clone());
            }
        }

        debug!("Refreshing Dropbox access token");
        let response = self
            .http
            .post(format!("{}/oauth2/token", self.api_base))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Auth(format!(
                "token refresh failed ({}): {}",
                status, body
            )));
        }

        let token: TokenResponse = response.json().await?;
        let expires_at = token
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs - TOKEN_EXPIRY_MARGIN_SECS));
        let value = token.access_token;
        *slot = Some(CachedToken {
            value: value.clone(),
            expires_at,
        });

        Ok(value)
    }

    /// Map non-success responses onto `StorageError`
    async fn check(&self, response: Response, path: &str) -> Result<Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let summary = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error_summary)
            .unwrap_or(body);

        match status {
            StatusCode::CONFLICT if summary.contains("not_found") => {
                Err(StorageError::NotFound(path.to_string()))
            }
            StatusCode::UNAUTHORIZED => {
                // Force a refresh on the next call
                *self.token.write().await = None;
                Err(StorageError::Auth(summary))
            }
            _ => Err(StorageError::Api {
                status: status.as_u16(),
                summary,
            }),
        }
    }

    async fn rpc<A, R>(&self, endpoint: &str, arg: &A, path: &str) -> Result<R, StorageError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}/2/{}", self.api_base, endpoint))
            .bearer_auth(self.access_token().await?)
            .json(arg)
            .send()
            .await?;

        let response = self.check(response, path).await?;
        Ok(response.json::<R>().await?)
    }

    async fn content(
        &self,
        endpoint: &str,
        arg: &serde_json::Value,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Response, StorageError> {
        let mut request = self
            .http
            .post(format!("{}/2/{}", self.content_base, endpoint))
            .bearer_auth(self.access_token().await?)
            .header(API_ARG_HEADER, header_arg(arg));

        if let Some(body) = body {
            request = request
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(body);
        }

        let response = request.send().await?;
        self.check(response, path).await
    }
}

/// Serialize an argument for the `Dropbox-API-Arg` header, escaping
/// everything outside printable ASCII.
fn header_arg(arg: &serde_json::Value) -> String {
    let raw = arg.to_string();
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() && ch != '\u{7f}' {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

#[async_trait]
impl StorageGateway for DropboxClient {
    fn provider_name(&self) -> &'static str {
        "dropbox"
    }

    async fn list_folder(&self, path: &str) -> Result<Vec<StorageEntry>, StorageError> {
        let mut page: ListFolderResponse = self
            .rpc("files/list_folder", &json!({ "path": path }), path)
            .await?;
        let mut entries: Vec<StorageEntry> = page
            .entries
            .drain(..)
            .filter_map(WireMetadata::into_entry)
            .collect();

        while page.has_more {
            page = self
                .rpc(
                    "files/list_folder/continue",
                    &json!({ "cursor": page.cursor }),
                    path,
                )
                .await?;
            entries.extend(page.entries.drain(..).filter_map(WireMetadata::into_entry));
        }

        Ok(entries)
    }

    async fn get_metadata(&self, path: &str) -> Result<StorageEntry, StorageError> {
        let metadata: WireMetadata = self
            .rpc("files/get_metadata", &json!({ "path": path }), path)
            .await?;
        metadata
            .into_entry()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn download(&self, path: &str) -> Result<Bytes, StorageError> {
        let response = self
            .content("files/download", &json!({ "path": path }), path, None)
            .await?;
        Ok(response.bytes().await?)
    }

    async fn upload(
        &self,
        path: &str,
        contents: Bytes,
        mode: WriteMode,
    ) -> Result<StorageEntry, StorageError> {
        let arg = json!({
            "path": path,
            "mode": mode.as_str(),
            "autorename": false,
            "mute": true,
        });
        let response = self.content("files/upload", &arg, path, Some(contents)).await?;

        // Upload returns bare file metadata without a ".tag"
        let mut value: serde_json::Value = response.json().await?;
        if let Some(object) = value.as_object_mut() {
            object
                .entry(".tag")
                .or_insert_with(|| serde_json::Value::String("file".into()));
        }
        serde_json::from_value::<WireMetadata>(value)
            .map_err(|e| StorageError::Decode(e.to_string()))?
            .into_entry()
            .ok_or_else(|| StorageError::Decode(format!("upload of {} returned no entry", path)))
    }

    async fn temporary_link(&self, path: &str) -> Result<String, StorageError> {
        let response: TemporaryLinkResponse = self
            .rpc("files/get_temporary_link", &json!({ "path": path }), path)
            .await?;
        Ok(response.link)
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let _: IgnoredAny = self
            .rpc(
                "files/move_v2",
                &json!({ "from_path": from, "to_path": to, "autorename": false }),
                from,
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let _: IgnoredAny = self
            .rpc("files/delete_v2", &json!({ "path": path }), path)
            .await?;
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<(), StorageError> {
        let _: IgnoredAny = self
            .rpc(
                "files/create_folder_v2",
                &json!({ "path": path, "autorename": false }),
                path,
            )
            .await?;
        Ok(())
    }

    async fn download_zip(&self, path: &str) -> Result<ByteStream, StorageError> {
        let response = self
            .content("files/download_zip", &json!({ "path": path }), path, None)
            .await?;
        if let Some(length) = response.content_length() {
            debug!(path, length, "Streaming zip bundle");
        } else {
            warn!(path, "Zip bundle has no content length");
        }
        Ok(response.bytes_stream().map_err(StorageError::from).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn static_credentials() -> DropboxCredentials {
        DropboxCredentials::Static {
            access_token: "static-token".into(),
        }
    }

    #[test]
    fn test_header_arg_escapes_non_ascii() {
        let arg = json!({ "path": "/Web/写真.jpg" });
        assert_eq!(header_arg(&arg), r#"{"path":"/Web/\u5199\u771f.jpg"}"#);
    }

    #[test]
    fn test_header_arg_escapes_astral_as_surrogate_pair() {
        let arg = json!({ "path": "/📷" });
        assert_eq!(header_arg(&arg), r#"{"path":"/\ud83d\udcf7"}"#);
    }

    #[tokio::test]
    async fn test_list_folder_follows_cursor() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("POST", "/2/files/list_folder")
            .match_header("authorization", "Bearer static-token")
            .match_body(Matcher::PartialJson(json!({ "path": "/Web" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "entries": [
                        {
                            ".tag": "file",
                            "name": "a.jpg",
                            "path_lower": "/web/a.jpg",
                            "path_display": "/Web/a.jpg",
                            "server_modified": "2024-05-01T10:00:00Z",
                            "size": 10
                        },
                        { ".tag": "folder", "name": "sub", "path_lower": "/web/sub", "path_display": "/Web/sub" }
                    ],
                    "cursor": "c1",
                    "has_more": true
                })
                .to_string(),
            )
            .create_async()
            .await;
        let second = server
            .mock("POST", "/2/files/list_folder/continue")
            .match_body(Matcher::PartialJson(json!({ "cursor": "c1" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "entries": [
                        { ".tag": "file", "name": "b.jpg", "path_lower": "/web/b.jpg", "path_display": "/Web/b.jpg" },
                        { ".tag": "deleted", "name": "gone.jpg" }
                    ],
                    "cursor": "c2",
                    "has_more": false
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = DropboxClient::with_base_urls(static_credentials(), server.url(), server.url());
        let entries = client.list_folder("/Web").await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_file());
        assert_eq!(entries[0].server_modified.unwrap().to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(entries[1].kind, EntryKind::Folder);
        assert_eq!(entries[2].name, "b.jpg");
    }

    #[tokio::test]
    async fn test_metadata_not_found_maps_to_signal() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/2/files/get_metadata")
            .with_status(409)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error_summary":"path/not_found/..","error":{".tag":"path"}}"#)
            .create_async()
            .await;

        let client = DropboxClient::with_base_urls(static_credentials(), server.url(), server.url());
        let err = client.get_metadata("/Web/missing.jpg").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!client.exists("/Web/missing.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn test_rate_limit_is_an_api_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/2/files/get_temporary_link")
            .with_status(429)
            .with_body(r#"{"error_summary":"too_many_requests/.."}"#)
            .create_async()
            .await;

        let client = DropboxClient::with_base_urls(static_credentials(), server.url(), server.url());
        match client.temporary_link("/Web/a.jpg").await {
            Err(StorageError::Api { status, summary }) => {
                assert_eq!(status, 429);
                assert!(summary.starts_with("too_many_requests"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_token_is_exchanged_once() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "long-lived".into()),
                Matcher::UrlEncoded("client_id".into(), "app-key".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"fresh-token","token_type":"bearer","expires_in":14400}"#)
            .expect(1)
            .create_async()
            .await;
        let link = server
            .mock("POST", "/2/files/get_temporary_link")
            .match_header("authorization", "Bearer fresh-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"metadata":{},"link":"https://dl.example/a.jpg"}"#)
            .expect(2)
            .create_async()
            .await;

        let credentials = DropboxCredentials::Refresh {
            refresh_token: "long-lived".into(),
            client_id: "app-key".into(),
            client_secret: "app-secret".into(),
        };
        let client = DropboxClient::with_base_urls(credentials, server.url(), server.url());

        assert_eq!(client.temporary_link("/Web/a.jpg").await.unwrap(), "https://dl.example/a.jpg");
        assert_eq!(client.temporary_link("/Web/a.jpg").await.unwrap(), "https://dl.example/a.jpg");

        token.assert_async().await;
        link.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_sends_overwrite_mode_in_header() {
        let mut server = Server::new_async().await;
        let upload = server
            .mock("POST", "/2/files/upload")
            .match_header("dropbox-api-arg", Matcher::Regex(r#""mode":"overwrite""#.into()))
            .match_header("content-type", "application/octet-stream")
            .match_body("jpeg-bytes")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"name":"a.jpg","path_lower":"/web/a.jpg","path_display":"/Web/a.jpg","size":10}"#)
            .create_async()
            .await;

        let client = DropboxClient::with_base_urls(static_credentials(), server.url(), server.url());
        let entry = client
            .upload("/Web/a.jpg", Bytes::from_static(b"jpeg-bytes"), WriteMode::Overwrite)
            .await
            .unwrap();

        upload.assert_async().await;
        assert!(entry.is_file());
        assert_eq!(entry.path_lower, "/web/a.jpg");
    }

    #[tokio::test]
    async fn test_download_zip_streams_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/2/files/download_zip")
            .with_status(200)
            .with_header("content-type", "application/zip")
            .with_body("PK-zip-body")
            .create_async()
            .await;

        let client = DropboxClient::with_base_urls(static_credentials(), server.url(), server.url());
        let chunks: Vec<Bytes> = client
            .download_zip("/Final")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"PK-zip-body");
    }
}
