use reqwest::{Method, StatusCode};
use snafu::prelude::*;

use super::error::variant::*;
use super::Result;
use crate::fallback::{self, BoxError, StatusProvider, StatusReport};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// Analysis status HTTP API client
#[derive(Debug, Clone)]
pub struct StatusClient {
    client: reqwest::Client,
    base: url::Url,
}

impl StatusClient {
    fn build<S: AsRef<str> + ?Sized>(
        base: &S,
        headers: reqwest::header::HeaderMap,
    ) -> Result<Self> {
        let base_str = base.as_ref();
        let base = url::Url::parse(base_str).context(BaseURLInvalid { url: base_str })?;
        ensure!(
            !base.cannot_be_a_base(),
            BaseURLCannotBeBase { url: base_str }
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .deflate(true)
            .user_agent(APP_USER_AGENT)
            .default_headers(headers)
            .build()
            .context(ClientCreateFailed)?;

        Ok(Self { client, base })
    }

    /// create a new api client for the service at `base`, e.g. `http://127.0.0.1:8000/api`
    pub fn new<S: AsRef<str> + ?Sized>(base: &S) -> Result<Self> {
        Self::build(base, reqwest::header::HeaderMap::new())
    }

    /// create a new api client sending a bearer token
    pub fn new_with_token<S: AsRef<str> + ?Sized, T: AsRef<str> + ?Sized>(
        base: &S,
        token: &T,
    ) -> Result<Self> {
        let auth_header_value = format!("Bearer {}", token.as_ref())
            .parse()
            .map_err(|_| TokenInvalid.build())?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::AUTHORIZATION, auth_header_value);

        Self::build(base, headers)
    }

    /// url of the status document of `analysis_id`
    pub fn status_url(&self, analysis_id: &str) -> url::Url {
        let mut url = self.base.clone();
        // base is checked to be a base url on construction
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["analysis", analysis_id, "status"]);
        }
        url
    }

    async fn request<R>(&self, url: url::Url) -> Result<R>
    where
        R: serde::de::DeserializeOwned,
    {
        let url_str = url.to_string();

        log::trace!("GET {}", url_str);

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|_| RequestFailed {
                method: Method::GET,
                url: &url_str,
            })?;

        ensure!(
            resp.status() == StatusCode::OK,
            HTTPStatusNotOK {
                method: Method::GET,
                url: &url_str,
                status_code: resp.status()
            }
        );

        let body = resp.bytes().await.with_context(|_| RequestFailed {
            method: Method::GET,
            url: &url_str,
        })?;

        serde_json::from_slice(&body).with_context(|_| ParseBodyFailed { body })
    }

    /// Call GET /analysis/{id}/status
    pub async fn analysis_status(&self, analysis_id: &str) -> Result<StatusReport> {
        self.request(self.status_url(analysis_id)).await
    }
}

#[async_trait::async_trait]
impl StatusProvider for StatusClient {
    async fn get_status(
        &self,
        analysis_id: &str,
    ) -> std::result::Result<StatusReport, fallback::StatusError> {
        self.analysis_status(analysis_id)
            .await
            .map_err(|err| Box::new(err) as BoxError)
            .context(fallback::status_error::Query { analysis_id })
    }
}
