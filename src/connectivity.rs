// Connectivity checks
//
// Sync cycles ask "are we online?" on every lifecycle trigger. The answer is
// cached for a short TTL so rapid foreground/background cycling does not probe
// the network each time. The probe is a trait so tests can script it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Probe that issues a HEAD request against a health URL
pub struct HttpProbe {
    http: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client for probe: {}", e);
                Client::new()
            });
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_online(&self) -> bool {
        match self.http.head(&self.url).send().await {
            // Any answer at all means the network path works
            Ok(response) => {
                log::debug!("Connectivity probe: HTTP {}", response.status());
                true
            }
            Err(e) => {
                log::debug!("Connectivity probe failed: {}", e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedAnswer {
    online: bool,
    checked_at: Instant,
}

/// Short-TTL cache in front of a `ConnectivityProbe`
#[derive(Clone)]
pub struct ConnectivityCache {
    probe: Arc<dyn ConnectivityProbe>,
    ttl: Duration,
    last: Arc<Mutex<Option<CachedAnswer>>>,
}

impl ConnectivityCache {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, ttl: Duration) -> Self {
        Self {
            probe,
            ttl,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Cached answer if fresh, otherwise probe
    pub async fn is_online(&self) -> bool {
        let mut last = self.last.lock().await;
        if let Some(answer) = *last {
            if answer.checked_at.elapsed() < self.ttl {
                return answer.online;
            }
        }
        let online = self.probe.is_online().await;
        *last = Some(CachedAnswer {
            online,
            checked_at: Instant::now(),
        });
        online
    }

    /// Forget the cached answer, e.g. after a request failed with a network error
    pub async fn invalidate(&self) {
        *self.last.lock().await = None;
    }
}
