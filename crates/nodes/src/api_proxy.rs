//! API_PROXY: an outbound HTTP call guarded by the SSRF check, with GET
//! responses cached by `(method, url, hash(headers))`.
//!
//! Config:
//! ```json
//! { "url": "https://api.example.com/items", "method": "GET",
//!   "headers": { "accept": "application/json" }, "body": null,
//!   "timeoutMs": 30000, "cacheTtlSeconds": 300 }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{ssrf, ExecutableNode, ExecutionContext, KvCache, NodeError, NodeOutput};

pub struct ApiProxyNode {
    client: reqwest::Client,
    cache: Arc<dyn KvCache>,
    default_ttl: Duration,
    default_timeout: Duration,
}

impl ApiProxyNode {
    pub fn new(
        cache: Arc<dyn KvCache>,
        default_ttl: Duration,
        default_timeout: Duration,
    ) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder()
            // Redirects could bounce a vetted URL to an internal one.
            .redirect(reqwest::redirect::Policy::none())
            .dns_resolver(Arc::new(ssrf::GuardedResolver))
            .build()
            .map_err(|e| NodeError::Permanent(format!("http client build failed: {e}")))?;

        Ok(Self {
            client,
            cache,
            default_ttl,
            default_timeout,
        })
    }

    fn headers(config: &Value) -> BTreeMap<String, String> {
        config
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(k, v)| {
                        let v = v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string());
                        (k.to_ascii_lowercase(), v)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Cache key for a request. Headers are hashed in sorted order so the key
/// does not depend on how the config map was written.
pub fn cache_key(method: &str, url: &str, headers: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in headers {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("api_proxy:{method}:{url}:{}", hex::encode(hasher.finalize()))
}

/// Error for a non-2xx response. The message carries only the reason phrase:
/// the target URL is logged instead, since retry classification matches on
/// the message text.
pub fn status_error(status: u16) -> NodeError {
    let reason = reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("error")
        .to_ascii_lowercase();
    NodeError::Http { status, message: reason }
}

fn transport_error(e: reqwest::Error) -> NodeError {
    let timeout = e.is_timeout();
    let e = e.without_url();
    if timeout {
        NodeError::Transient(format!("request timeout: {e}"))
    } else {
        NodeError::Transient(format!("network error: {e}"))
    }
}

#[async_trait]
impl ExecutableNode for ApiProxyNode {
    async fn execute(
        &self,
        config: &Value,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let raw_url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::invalid_config("API_PROXY", "missing 'url'"))?;
        let method_name = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| NodeError::invalid_config("API_PROXY", format!("bad method '{method_name}'")))?;

        let url = ssrf::validate_target(raw_url)
            .map_err(|v| NodeError::Permanent(format!("request forbidden: {v}")))?;
        ssrf::validate_resolved(&url)
            .await
            .map_err(|v| NodeError::Permanent(format!("request forbidden: {v}")))?;

        let headers = Self::headers(config);
        let key = cache_key(&method_name, url.as_str(), &headers);
        let cacheable = method == Method::GET;

        if cacheable {
            if let Some(hit) = self.cache.get(&key).await {
                debug!(node_id = %ctx.node_id, "api proxy cache hit for {}", url);
                return Ok(NodeOutput::Complete(hit));
            }
        }

        let timeout = config
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let mut request = self.client.request(method.clone(), url.clone()).timeout(timeout);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if method != Method::GET && method != Method::HEAD {
            let body = config.get("body").cloned().unwrap_or(input);
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            warn!(node_id = %ctx.node_id, %url, "api proxy request failed: {e}");
            transport_error(e)
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            warn!(node_id = %ctx.node_id, %url, "api proxy response body failed: {e}");
            transport_error(e)
        })?;

        if !status.is_success() {
            warn!(node_id = %ctx.node_id, %url, status = status.as_u16(), "api proxy upstream error");
            return Err(status_error(status.as_u16()));
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        let output = json!({
            "status": status.as_u16(),
            "body": body,
        });

        if cacheable {
            let ttl = config
                .get("cacheTtlSeconds")
                .and_then(Value::as_u64)
                .map(Duration::from_secs)
                .unwrap_or(self.default_ttl);
            if !ttl.is_zero() {
                self.cache.set(&key, output.clone(), ttl).await;
            }
        }

        Ok(NodeOutput::Complete(output))
    }
}
