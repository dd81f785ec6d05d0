//! Shared HTTP client factory.
//!
//! One `reqwest::Client` per `(interactive, proxied)` combination is built on
//! first use and cached. Clients are cheap to clone and safe to share across
//! pipelines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{ClientBuilder, Proxy};
use tracing::debug;
use url::Url;

use crate::config::TransferConfig;
use crate::error::HttpTransferError;

/// Fixed worst-case write timeout: bounds connection setup and upload stalls.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Certificate policy hook.
///
/// Interactive requests come from an explicit user action and may use a
/// policy that can ask the user about an unknown certificate; background
/// requests must not.
pub trait TrustManager: Send + Sync {
    fn configure(&self, builder: ClientBuilder, interactive: bool) -> ClientBuilder;
}

/// Platform root store for every request.
pub struct SystemTrust;

impl TrustManager for SystemTrust {
    fn configure(&self, builder: ClientBuilder, _interactive: bool) -> ClientBuilder {
        builder
    }
}

/// Whether `url` points at an onion service.
pub fn is_onion(url: &Url) -> bool {
    url.host_str()
        .map(|h| h.trim_end_matches('.').to_ascii_lowercase().ends_with(".onion"))
        .unwrap_or(false)
}

pub struct HttpClients {
    read_timeout: Duration,
    user_agent: String,
    use_tor: bool,
    proxy_url: String,
    trust: Arc<dyn TrustManager>,
    cache: Mutex<HashMap<(bool, bool), reqwest::Client>>,
}

impl HttpClients {
    pub fn new(config: &TransferConfig, trust: Arc<dyn TrustManager>) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            user_agent: config.user_agent.clone(),
            use_tor: config.use_tor,
            proxy_url: config.proxy_url.clone(),
            trust,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Whether requests to `url` go through the proxy.
    pub fn is_proxied(&self, url: &Url) -> bool {
        self.use_tor || is_onion(url)
    }

    /// Returns the client to use for `url`.
    pub fn for_url(&self, url: &Url, interactive: bool) -> Result<reqwest::Client, HttpTransferError> {
        let key = (interactive, self.is_proxied(url));
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = cache.get(&key) {
            return Ok(client.clone());
        }
        let client = self.build(key.0, key.1)?;
        cache.insert(key, client.clone());
        Ok(client)
    }

    fn build(&self, interactive: bool, proxied: bool) -> Result<reqwest::Client, HttpTransferError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(WRITE_TIMEOUT)
            .read_timeout(self.read_timeout)
            .user_agent(self.user_agent.clone());
        builder = if proxied {
            builder.proxy(Proxy::all(&self.proxy_url)?)
        } else {
            builder.no_proxy()
        };
        builder = self.trust.configure(builder, interactive);
        debug!(interactive, proxied, "building HTTP client");
        Ok(builder.build()?)
    }

    #[cfg(test)]
    pub(crate) fn cached(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTrust {
        interactive: AtomicUsize,
        background: AtomicUsize,
    }

    impl TrustManager for CountingTrust {
        fn configure(&self, builder: ClientBuilder, interactive: bool) -> ClientBuilder {
            if interactive {
                self.interactive.fetch_add(1, Ordering::SeqCst);
            } else {
                self.background.fetch_add(1, Ordering::SeqCst);
            }
            builder
        }
    }

    #[test]
    fn onion_detection() {
        assert!(is_onion(&Url::parse("http://abcdef.onion/x").unwrap()));
        assert!(is_onion(&Url::parse("https://ABC.ONION./x").unwrap()));
        assert!(!is_onion(&Url::parse("https://onion.example/x").unwrap()));
    }

    #[test]
    fn proxy_routing() {
        let clients = HttpClients::new(&TransferConfig::default(), Arc::new(SystemTrust));
        assert!(!clients.is_proxied(&Url::parse("https://h.example/").unwrap()));
        assert!(clients.is_proxied(&Url::parse("http://x.onion/").unwrap()));

        let tor = TransferConfig {
            use_tor: true,
            ..TransferConfig::default()
        };
        let clients = HttpClients::new(&tor, Arc::new(SystemTrust));
        assert!(clients.is_proxied(&Url::parse("https://h.example/").unwrap()));
    }

    #[tokio::test]
    async fn clients_cached_per_mode() {
        let trust = Arc::new(CountingTrust {
            interactive: AtomicUsize::new(0),
            background: AtomicUsize::new(0),
        });
        let clients = HttpClients::new(&TransferConfig::default(), trust.clone());
        let plain = Url::parse("https://h.example/a").unwrap();
        let onion = Url::parse("http://x.onion/a").unwrap();

        clients.for_url(&plain, true).unwrap();
        clients.for_url(&plain, true).unwrap();
        clients.for_url(&plain, false).unwrap();
        clients.for_url(&onion, false).unwrap();

        assert_eq!(clients.cached(), 3);
        assert_eq!(trust.interactive.load(Ordering::SeqCst), 1);
        assert_eq!(trust.background.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bad_proxy_url_is_an_error() {
        let config = TransferConfig {
            use_tor: true,
            proxy_url: "::not a url::".into(),
            ..TransferConfig::default()
        };
        let clients = HttpClients::new(&config, Arc::new(SystemTrust));
        assert!(clients.for_url(&Url::parse("https://h/").unwrap(), false).is_err());
    }
}
