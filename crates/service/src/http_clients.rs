//! Outbound HTTP client. One process-wide client per traffic
//! class, each carrying its own proxy policy: a proxy URL (possibly empty
//! -> direct), a `no_proxy` host pattern list, and a `direct_fallback`
//! flag that retries once without the proxy on proxy failure, generalized
//! to three shared clients instead of one per account.
//!
//! Process-wide proxy environment variables (`HTTP_PROXY`/`HTTPS_PROXY`)
//! are never honored implicitly -- every client is built with
//! `.no_proxy()` and proxies are applied explicitly.

use std::time::Duration;

use reqwest::Proxy;

const CONNECT_TIMEOUT_SECS: u64 = 60;
const READ_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct ProxyPolicy {
    pub proxy_url: String,
    pub no_proxy_hosts: Vec<String>,
    pub direct_fallback: bool,
}

impl ProxyPolicy {
    pub fn direct() -> Self {
        ProxyPolicy {
            proxy_url: String::new(),
            no_proxy_hosts: Vec::new(),
            direct_fallback: true,
        }
    }

    fn host_is_no_proxy(&self, host: &str) -> bool {
        self.no_proxy_hosts
            .iter()
            .any(|pattern| host == pattern || host.ends_with(&format!(".{pattern}")))
    }

    /// Whether a request to `host` should go direct under this policy.
    pub fn should_go_direct(&self, host: &str) -> bool {
        self.proxy_url.is_empty() || self.host_is_no_proxy(host)
    }
}

fn build_client(proxy: Option<&str>, timeout: Duration, connect_timeout: Duration) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .no_proxy()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(60)));
    if let Some(url) = proxy.filter(|u| !u.is_empty()) {
        if let Ok(p) = Proxy::all(url) {
            builder = builder.proxy(p);
        }
    }
    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// A client bound to one traffic class's proxy policy, with an optional
/// fallback direct client used when the proxied request errors and
/// `direct_fallback` is set.
pub struct TrafficClient {
    pub policy: ProxyPolicy,
    proxied: reqwest::Client,
    direct: reqwest::Client,
}

impl TrafficClient {
    pub fn new(policy: ProxyPolicy) -> Self {
        let timeout = Duration::from_secs(READ_TIMEOUT_SECS);
        let connect_timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        let proxied = build_client(Some(policy.proxy_url.as_str()), timeout, connect_timeout);
        let direct = build_client(None, timeout, connect_timeout);
        TrafficClient {
            policy,
            proxied,
            direct,
        }
    }

    fn client_for_host(&self, host: &str) -> &reqwest::Client {
        if self.policy.should_go_direct(host) {
            &self.direct
        } else {
            &self.proxied
        }
    }

    /// Issue a request, honoring the no-proxy list and retrying direct
    /// once on a proxy transport error when `direct_fallback` is enabled.
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
        let host = request.url().host_str().unwrap_or("").to_string();
        let went_direct = self.policy.should_go_direct(&host);
        let client = self.client_for_host(&host);
        let cloned = request.try_clone();
        match client.execute(request).await {
            Ok(resp) => Ok(resp),
            Err(err) if !went_direct && self.policy.direct_fallback => {
                if let Some(retry_req) = cloned {
                    self.direct.execute(retry_req).await
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    pub fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|s| s.to_string()))
            .unwrap_or_default();
        self.client_for_host(&host).request(method, url)
    }

    /// Bare `reqwest::Client` for call sites that build their own request
    /// (e.g. file download, which only needs a bearer header) rather than
    /// going through `request`/`execute`'s proxy-fallback wrapping.
    pub fn plain_client(&self) -> &reqwest::Client {
        &self.direct
    }
}

/// The three process-wide clients: auth traffic, chat traffic, or
/// generic.
pub struct HttpClients {
    pub auth: TrafficClient,
    pub chat: TrafficClient,
    pub generic: TrafficClient,
}

impl HttpClients {
    pub fn new(policy: ProxyPolicy) -> Self {
        HttpClients {
            auth: TrafficClient::new(policy.clone()),
            chat: TrafficClient::new(policy.clone()),
            generic: TrafficClient::new(policy),
        }
    }

    /// `LOCAL_IGNORE_PROXY` forces all three clients direct process-wide.
    pub fn from_settings(basic: &crate::settings::BasicSettings) -> Self {
        let policy = if basic.local_ignore_proxy {
            ProxyPolicy::direct()
        } else {
            ProxyPolicy {
                proxy_url: basic.proxy_url.clone(),
                no_proxy_hosts: basic.no_proxy.clone(),
                direct_fallback: basic.direct_fallback,
            }
        };
        HttpClients::new(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_proxy_matches_exact_and_subdomain() {
        let policy = ProxyPolicy {
            proxy_url: "http://proxy.local:8080".to_string(),
            no_proxy_hosts: vec!["internal.example".to_string()],
            direct_fallback: true,
        };
        assert!(policy.should_go_direct("internal.example"));
        assert!(policy.should_go_direct("api.internal.example"));
        assert!(!policy.should_go_direct("other.example"));
    }

    #[test]
    fn empty_proxy_url_always_goes_direct() {
        let policy = ProxyPolicy::direct();
        assert!(policy.should_go_direct("anything.example"));
    }
}
