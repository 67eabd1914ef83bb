// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cloud Controller v3 HTTP client.
//!
//! Thin request layer: bearer authentication (UAA client-credentials with a
//! cached token, or a fixed token), JSON bodies, pagination, asynchronous
//! job tracking, and the mapping from HTTP failures onto [`PlatformError`].
//! Requests are never retried here.

use crate::domain::platform::PlatformError;
use crate::infrastructure::cloud_foundry::models::{CfErrors, Job, Paginated, TokenResponse};
use crate::infrastructure::platform::poller::{PollOutcome, StatusPoller};
use parking_lot::Mutex;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// How the client authenticates against the Cloud Controller.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Pre-issued bearer token, used as is.
    Bearer(String),
    /// UAA `client_credentials` grant.
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
    },
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Refresh this long before the token actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

pub struct CloudFoundryClient {
    http: Client,
    api_url: String,
    credentials: Credentials,
    token: Mutex<Option<CachedToken>>,
}

impl CloudFoundryClient {
    /// `timeout` bounds every single request (the per-call API timeout).
    pub fn new(api_url: impl Into<String>, credentials: Credentials, timeout: Duration) -> Result<Self, PlatformError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlatformError::Http(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            credentials,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.api_url, path)
        }
    }

    async fn access_token(&self) -> Result<String, PlatformError> {
        let (token_url, client_id, client_secret) = match &self.credentials {
            Credentials::Bearer(token) => return Ok(token.clone()),
            Credentials::ClientCredentials {
                token_url,
                client_id,
                client_secret,
            } => (token_url, client_id, client_secret),
        };

        let cached = self
            .token
            .lock()
            .as_ref()
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.token.clone());
        if let Some(token) = cached {
            return Ok(token);
        }

        debug!(token_url = %token_url, client_id = %client_id, "Requesting UAA token");
        let response = self
            .http
            .post(token_url)
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::Serialization(e.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(600));
        *self.token.lock() = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });
        Ok(token.access_token)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, PlatformError> {
        let token = self.access_token().await?;
        Ok(self.http.request(method, self.url(path)).bearer_auth(token))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, PlatformError> {
        let response = builder.send().await.map_err(map_transport_error)?;
        check_status(response).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, PlatformError> {
        debug!(path, "GET");
        let response = self.send(self.request(Method::GET, path).await?.query(query)).await?;
        decode(response).await
    }

    /// `None` on 404.
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, PlatformError> {
        match self.get(path, query).await {
            Ok(value) => Ok(Some(value)),
            Err(PlatformError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// First page only; enough for name lookups.
    pub async fn first<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Option<T>, PlatformError> {
        let page: Paginated<T> = self.get(path, query).await?;
        Ok(page.resources.into_iter().next())
    }

    /// Every resource across all pages.
    pub async fn list<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<T>, PlatformError> {
        let mut page: Paginated<T> = self.get(path, query).await?;
        let mut all = std::mem::take(&mut page.resources);
        while let Some(next) = page.pagination.next.take() {
            page = self.get(&next.href, &[]).await?;
            all.append(&mut page.resources);
        }
        Ok(all)
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, PlatformError> {
        debug!(path, "POST");
        let response = self.send(self.request(Method::POST, path).await?.json(body)).await?;
        decode(response).await
    }

    /// POST that may complete asynchronously; returns the job URL when the
    /// platform answered `202 Accepted`.
    pub async fn post_async<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Option<String>, PlatformError> {
        debug!(path, "POST (async)");
        let response = self.send(self.request(Method::POST, path).await?.json(body)).await?;
        Ok(job_location(&response))
    }

    pub async fn patch<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, PlatformError> {
        debug!(path, "PATCH");
        let response = self.send(self.request(Method::PATCH, path).await?.json(body)).await?;
        decode(response).await
    }

    pub async fn patch_async<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Option<String>, PlatformError> {
        debug!(path, "PATCH (async)");
        let response = self.send(self.request(Method::PATCH, path).await?.json(body)).await?;
        Ok(job_location(&response))
    }

    /// Returns the job URL when deletion is asynchronous.
    pub async fn delete(&self, path: &str) -> Result<Option<String>, PlatformError> {
        debug!(path, "DELETE");
        let response = self.send(self.request(Method::DELETE, path).await?).await?;
        Ok(job_location(&response))
    }

    /// Multipart upload of application bits.
    pub async fn upload<T: DeserializeOwned>(&self, path: &str, bits: Vec<u8>) -> Result<T, PlatformError> {
        debug!(path, bytes = bits.len(), "UPLOAD");
        let part = Part::bytes(bits)
            .file_name("app.zip")
            .mime_str("application/zip")
            .map_err(|e| PlatformError::Http(e.to_string()))?;
        let form = Form::new().part("bits", part);
        let response = self
            .send(self.request(Method::POST, path).await?.multipart(form))
            .await?;
        decode(response).await
    }

    /// Unauthenticated download of an artifact served over HTTP(S).
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, PlatformError> {
        debug!(url, "Downloading artifact");
        let response = self.send(self.http.get(url)).await?;
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        Ok(bytes.to_vec())
    }

    /// Polls an asynchronous job until it completes.
    pub async fn wait_for_job(&self, poller: &StatusPoller, job_url: &str) -> Result<(), PlatformError> {
        poller
            .poll(job_url, move || async move {
                let job: Job = self.get(job_url, &[]).await?;
                match job.state.as_str() {
                    "COMPLETE" => Ok(PollOutcome::Ready(())),
                    "FAILED" => {
                        let detail = job
                            .errors
                            .iter()
                            .map(|e| e.detail.as_str())
                            .collect::<Vec<_>>()
                            .join("; ");
                        Err(PlatformError::Rejected(format!("job {} failed: {}", job.guid, detail)))
                    }
                    other => Ok(PollOutcome::Pending(other.to_string())),
                }
            })
            .await
    }

    /// Waits for the job when there is one.
    pub async fn settle(&self, poller: &StatusPoller, job: Option<String>) -> Result<(), PlatformError> {
        match job {
            Some(url) => self.wait_for_job(poller, &url).await,
            None => Ok(()),
        }
    }
}

fn job_location(response: &Response) -> Option<String> {
    if response.status() != StatusCode::ACCEPTED {
        return None;
    }
    response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, PlatformError> {
    let body = response.text().await.map_err(map_transport_error)?;
    Ok(serde_json::from_str(&body)?)
}

async fn check_status(response: Response) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(map_status(status, &body))
}

fn map_transport_error(e: reqwest::Error) -> PlatformError {
    if e.is_timeout() {
        PlatformError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        PlatformError::Transient(e.to_string())
    } else {
        PlatformError::Http(e.to_string())
    }
}

/// Maps a failed Cloud Controller response onto the platform error taxonomy.
pub fn map_status(status: StatusCode, body: &str) -> PlatformError {
    let detail = serde_json::from_str::<CfErrors>(body)
        .ok()
        .and_then(|e| e.errors.into_iter().next())
        .map(|e| format!("{} ({}): {}", e.title, e.code, e.detail))
        .unwrap_or_else(|| format!("HTTP {}: {}", status, body));

    match status {
        StatusCode::NOT_FOUND => PlatformError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Unauthorized(detail),
        StatusCode::CONFLICT => PlatformError::Conflict(detail),
        StatusCode::UNPROCESSABLE_ENTITY if names_existing_resource(&detail) => {
            PlatformError::AlreadyExists(detail)
        }
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => PlatformError::Rejected(detail),
        StatusCode::TOO_MANY_REQUESTS => PlatformError::Transient(detail),
        s if s.is_server_error() => PlatformError::Transient(detail),
        _ => PlatformError::Http(detail),
    }
}

fn names_existing_resource(detail: &str) -> bool {
    let detail = detail.to_lowercase();
    ["already taken", "already been taken", "must be unique", "already exists", "already bound"]
        .iter()
        .any(|needle| detail.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cloud_foundry::models::Space;

    fn cf_error(code: u64, title: &str, detail: &str) -> String {
        serde_json::json!({ "errors": [{ "code": code, "title": title, "detail": detail }] }).to_string()
    }

    #[test]
    fn status_mapping() {
        assert!(map_status(StatusCode::NOT_FOUND, "").is_not_found());
        assert!(map_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, &cf_error(10003, "CF-NotAuthorized", "nope")),
            PlatformError::Unauthorized(_)
        ));
        assert!(matches!(
            map_status(
                StatusCode::UNPROCESSABLE_ENTITY,
                &cf_error(10008, "CF-UnprocessableEntity", "Name must be unique per organization")
            ),
            PlatformError::AlreadyExists(_)
        ));
        assert!(matches!(
            map_status(
                StatusCode::UNPROCESSABLE_ENTITY,
                &cf_error(10008, "CF-UnprocessableEntity", "Memory quota exceeded")
            ),
            PlatformError::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn follows_pagination() {
        let mut server = mockito::Server::new_async().await;
        let next = format!("{}/v3/spaces?page=2", server.url());
        let _page1 = server
            .mock("GET", "/v3/spaces")
            .match_query(mockito::Matcher::UrlEncoded("names".into(), "a,b".into()))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "pagination": { "total_results": 2, "next": { "href": next } },
                    "resources": [{ "guid": "g-a", "name": "a" }]
                })
                .to_string(),
            )
            .create_async()
            .await;
        let _page2 = server
            .mock("GET", "/v3/spaces")
            .match_query(mockito::Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "pagination": { "total_results": 2, "next": null },
                    "resources": [{ "guid": "g-b", "name": "b" }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = CloudFoundryClient::new(
            server.url(),
            Credentials::Bearer("t".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let spaces: Vec<Space> = client.list("/v3/spaces", &[("names", "a,b")]).await.unwrap();
        assert_eq!(spaces.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn client_credentials_token_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"abc","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let orgs = server
            .mock("GET", "/v3/organizations")
            .match_header("authorization", "Bearer abc")
            .with_status(200)
            .with_body(r#"{"pagination":{"total_results":0},"resources":[]}"#)
            .expect(2)
            .create_async()
            .await;

        let client = CloudFoundryClient::new(
            server.url(),
            Credentials::ClientCredentials {
                token_url: format!("{}/oauth/token", server.url()),
                client_id: "broker".into(),
                client_secret: "secret".into(),
            },
            Duration::from_secs(5),
        )
        .unwrap();

        for _ in 0..2 {
            let page: Paginated<Space> = client.get("/v3/organizations", &[]).await.unwrap();
            assert!(page.resources.is_empty());
        }
        token.assert_async().await;
        orgs.assert_async().await;
    }
}
