use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;

/// Thin authenticated client for the Elasticsearch REST API.
#[derive(Clone, Debug)]
pub struct EsHttp {
    client: Client,
    base_url: Arc<str>,
    user: Arc<str>,
    pass: Arc<str>,
}

impl EsHttp {
    pub fn new(
        base_url: impl Into<Arc<str>>,
        user: impl Into<Arc<str>>,
        pass: impl Into<Arc<str>>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building elasticsearch client")?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            user: user.into(),
            pass: pass.into(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(&*self.user, Some(&*self.pass))
    }

    pub async fn send_expect(
        &self,
        req: reqwest::RequestBuilder,
        context: &'static str,
        ok: impl FnOnce(StatusCode) -> bool,
    ) -> Result<Response> {
        let resp = req.send().await.context(context)?;
        let status = resp.status();
        if ok(status) {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!(
            "{} status={} body_sample={}",
            context,
            status,
            truncate_body_snippet(&text, 500)
        );
    }

    /// `None` on 404, the parsed body on success.
    pub async fn get_optional(&self, path: &str, context: &'static str) -> Result<Option<Value>> {
        let resp = self
            .send_expect(self.request(Method::GET, path), context, |s| {
                s.is_success() || s == StatusCode::NOT_FOUND
            })
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        resp.json().await.context(context).map(Some)
    }

    pub async fn put_value(&self, path: &str, body: &Value, context: &'static str) -> Result<Value> {
        let resp = self
            .send_expect(self.request(Method::PUT, path).json(body), context, |s| {
                s.is_success()
            })
            .await?;
        resp.json().await.context(context)
    }
}

pub fn normalize_base_url(base_url: impl Into<Arc<str>>) -> Arc<str> {
    let base_url: Arc<str> = base_url.into();
    if base_url.ends_with('/') {
        Arc::from(base_url.trim_end_matches('/'))
    } else {
        base_url
    }
}

fn truncate_body_snippet(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slashes_are_dropped() {
        assert_eq!(&*normalize_base_url("http://es:9200//"), "http://es:9200");
        assert_eq!(&*normalize_base_url("http://es:9200"), "http://es:9200");
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        let s = "é".repeat(10);
        let cut = truncate_body_snippet(&s, 3);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 6);
    }
}
