//! reqwest-backed implementation of [`SourceApi`].

use std::time::Duration;

use async_trait::async_trait;
use deltasync_core::PageRequest;
use reqwest::Url;
use tracing::debug;

use crate::wire::{decode_attributes, decode_list_page, AttributePage, ListPage};
use crate::{SourceApi, SourceError};

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct SourceApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub list_path: String,
    pub attribute_path: String,
    /// `limit` sent with every attribute request.
    pub attribute_limit: u32,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for SourceApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            list_path: "/records".to_string(),
            attribute_path: "/attributes".to_string(),
            attribute_limit: 1000,
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpSourceApi {
    client: reqwest::Client,
    list_url: Url,
    attribute_url: Url,
    api_key: String,
    attribute_limit: u32,
}

impl HttpSourceApi {
    pub fn new(config: SourceApiConfig) -> Result<Self, SourceError> {
        if config.api_key.trim().is_empty() {
            return Err(SourceError::Config("missing api key".to_string()));
        }
        let base = Url::parse(&config.base_url)
            .map_err(|e| SourceError::Config(format!("invalid base url: {e}")))?;
        let list_url = join_path(&base, &config.list_path)?;
        let attribute_url = join_path(&base, &config.attribute_path)?;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            list_url,
            attribute_url,
            api_key: config.api_key,
            attribute_limit: config.attribute_limit.max(1),
        })
    }

    pub fn list_url(&self, page: PageRequest) -> Url {
        let mut url = self.list_url.clone();
        url.query_pairs_mut()
            .append_pair("limit", &page.limit.to_string())
            .append_pair("offset", &page.offset.to_string());
        url
    }

    pub fn attribute_url(&self, owner_ids: &[String]) -> Url {
        let mut url = self.attribute_url.clone();
        url.query_pairs_mut()
            .append_pair("ownerIdsIn", &owner_ids.join(","))
            .append_pair("limit", &self.attribute_limit.to_string());
        url
    }

    async fn get_body(&self, url: Url) -> Result<Vec<u8>, SourceError> {
        debug!(path = url.path(), "source request");
        let resp = self
            .client
            .get(url.clone())
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp.bytes().await?.to_vec());
        }

        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_LIMIT {
            let cut = (0..=ERROR_BODY_LIMIT)
                .rev()
                .find(|i| body.is_char_boundary(*i))
                .unwrap_or(0);
            body.truncate(cut);
        }
        Err(SourceError::http(status, strip_query(&url), body))
    }
}

#[async_trait]
impl SourceApi for HttpSourceApi {
    async fn list_page(&self, page: PageRequest) -> Result<ListPage, SourceError> {
        let body = self.get_body(self.list_url(page)).await?;
        decode_list_page(&body)
    }

    async fn fetch_attributes(&self, owner_ids: &[String]) -> Result<AttributePage, SourceError> {
        let body = self.get_body(self.attribute_url(owner_ids)).await?;
        decode_attributes(&body)
    }

    fn attribute_limit(&self) -> usize {
        self.attribute_limit as usize
    }
}

fn join_path(base: &Url, path: &str) -> Result<Url, SourceError> {
    if base.cannot_be_a_base() {
        return Err(SourceError::Config(format!("base url cannot carry paths: {base}")));
    }
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(None);
    Ok(url)
}

fn strip_query(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(base_url: &str) -> HttpSourceApi {
        HttpSourceApi::new(SourceApiConfig {
            base_url: base_url.to_string(),
            api_key: "secret".to_string(),
            attribute_limit: 250,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn list_url_carries_limit_and_offset() {
        let api = api("https://crm.example.com/api/v2/");
        let url = api.list_url(PageRequest { offset: 200, limit: 100 });
        assert_eq!(
            url.as_str(),
            "https://crm.example.com/api/v2/records?limit=100&offset=200"
        );
    }

    #[test]
    fn attribute_url_filters_by_owner_ids() {
        let api = api("https://crm.example.com");
        let url = api.attribute_url(&["a1".to_string(), "b2".to_string()]);
        assert_eq!(
            url.as_str(),
            "https://crm.example.com/attributes?ownerIdsIn=a1%2Cb2&limit=250"
        );
    }

    #[test]
    fn missing_credentials_are_config_errors() {
        let err = HttpSourceApi::new(SourceApiConfig {
            base_url: "https://crm.example.com".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, SourceError::Config(_)));

        let err = HttpSourceApi::new(SourceApiConfig {
            base_url: "not a url".into(),
            api_key: "k".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, SourceError::Config(_)));
    }
}
