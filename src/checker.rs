use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::header::{HOST, USER_AGENT};
use reqwest::{Client, Url};
use tracing::{debug, warn};

use crate::metrics::MetricSample;
use crate::scheduler::{CheckRequest, Checker};

const DESKTOP_AGENT: &str = concat!("pagerace/", env!("CARGO_PKG_VERSION"));
const MOBILE_AGENT: &str = concat!(
    "Mozilla/5.0 (Linux; Android 14) Mobile pagerace/",
    env!("CARGO_PKG_VERSION")
);

/// Loads the document over plain HTTP and times the response.
///
/// Reports `ttfb` (ms until headers), `load` (ms until the body is read)
/// and `bytes` (body size). Replay requests are pinned to the proxy port
/// for the URL scheme while keeping the original `Host` header.
#[derive(Debug, Clone)]
pub struct HttpChecker {
    client: Client,
}

impl HttpChecker {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn prepare(&self, request: &CheckRequest) -> Result<(Client, Url, Option<String>)> {
        let url = Url::parse(&request.site.url)
            .with_context(|| format!("invalid url for site '{}'", request.site.name))?;
        let Some(endpoint) = &request.replay else {
            return Ok((self.client.clone(), url, None));
        };

        let host = url
            .host_str()
            .with_context(|| format!("url '{url}' has no host"))?
            .to_string();
        let port = match url.scheme() {
            "https" => endpoint.https_port,
            _ => endpoint.http_port,
        };
        let proxy: SocketAddr = tokio::net::lookup_host((endpoint.host.as_str(), port))
            .await
            .with_context(|| format!("cannot resolve replay host '{}'", endpoint.host))?
            .next()
            .with_context(|| format!("replay host '{}' has no addresses", endpoint.host))?;

        let mut routed = url.clone();
        if routed.set_port(Some(port)).is_err() {
            bail!("cannot route '{url}' through the replay proxy");
        }
        // the proxy presents its own certificate for every host
        let client = Client::builder()
            .no_proxy()
            .resolve(&host, proxy)
            .danger_accept_invalid_certs(true)
            .build()
            .context("Failed to build replay HTTP client")?;
        Ok((client, routed, Some(host)))
    }
}

#[async_trait]
impl Checker for HttpChecker {
    fn metric_names(&self) -> Vec<String> {
        vec!["ttfb".into(), "load".into(), "bytes".into()]
    }

    async fn check(&self, request: &CheckRequest) -> Result<MetricSample> {
        let (client, url, host) = self.prepare(request).await?;
        let agent = if request.site.mobile {
            MOBILE_AGENT
        } else {
            DESKTOP_AGENT
        };
        let mut builder = client.get(url.clone()).header(USER_AGENT, agent);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let ttfb = started.elapsed();
        let status = response.status();
        if !status.is_success() {
            bail!("{url} responded with status {status}");
        }
        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading body of {url} failed"))?;
        let load = started.elapsed();

        debug!(
            site = %request.site.name,
            ttfb_ms = ttfb.as_secs_f64() * 1000.0,
            load_ms = load.as_secs_f64() * 1000.0,
            bytes = body.len(),
            "page loaded"
        );
        Ok(vec![
            ttfb.as_secs_f64() * 1000.0,
            load.as_secs_f64() * 1000.0,
            body.len() as f64,
        ])
    }
}

const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);

/// Re-runs a failing check up to `attempts` times in total, pausing
/// `backoff` between attempts.
pub struct RetryingChecker<C> {
    inner: C,
    attempts: usize,
    backoff: Duration,
}

impl<C: Checker> RetryingChecker<C> {
    pub fn new(inner: C, attempts: usize) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl<C: Checker> Checker for RetryingChecker<C> {
    fn metric_names(&self) -> Vec<String> {
        self.inner.metric_names()
    }

    async fn check(&self, request: &CheckRequest) -> Result<MetricSample> {
        let mut attempt = 1;
        loop {
            match self.inner.check(request).await {
                Ok(sample) => return Ok(sample),
                Err(err) if attempt < self.attempts => {
                    warn!(
                        site = %request.site.name,
                        attempt,
                        max_attempts = self.attempts,
                        error = %format!("{err:#}"),
                        "check attempt failed, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err.context(format!("check failed after {attempt} attempts")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Site;
    use crate::scheduler::ReplayEndpoint;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn request(url: &str) -> CheckRequest {
        CheckRequest {
            site: Site::new("alpha", url),
            site_index: 0,
            iteration: 0,
            replay: None,
        }
    }

    /// Serves a single response and reports the raw request it received.
    async fn serve_once(status: &'static str, body: &'static str) -> (u16, oneshot::Receiver<String>) {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        serve_once_on(addr, status, body).await
    }

    async fn serve_once_on(
        addr: SocketAddr,
        status: &'static str,
        body: &'static str,
    ) -> (u16, oneshot::Receiver<String>) {
        let listener = TcpListener::bind(addr).await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let read = socket.read(&mut buf).await.expect("read");
            let _ = tx.send(String::from_utf8_lossy(&buf[..read]).to_string());
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            let _ = socket.shutdown().await;
        });
        (port, rx)
    }

    #[tokio::test]
    async fn measures_live_page() {
        let (port, seen) = serve_once("200 OK", "hello").await;
        let checker = HttpChecker::new().expect("client");

        let sample = checker
            .check(&request(&format!("http://127.0.0.1:{port}/")))
            .await
            .expect("sample");

        assert_eq!(sample.len(), checker.metric_names().len());
        assert!(sample[0] >= 0.0);
        assert!(sample[1] >= sample[0]);
        assert_eq!(sample[2], 5.0);
        let raw = seen.await.expect("request").to_lowercase();
        assert!(raw.contains("user-agent: pagerace/"));
    }

    #[tokio::test]
    async fn replay_routes_to_proxy_port_with_original_host() {
        let (port, seen) = serve_once("200 OK", "replayed").await;
        let checker = HttpChecker::new().expect("client");
        let mut req = request("http://www.alpha.test/index.html");
        req.replay = Some(ReplayEndpoint {
            host: "127.0.0.1".into(),
            http_port: port,
            https_port: port.wrapping_add(1),
        });

        let sample = checker.check(&req).await.expect("sample");
        assert_eq!(sample[2], 8.0);
        let raw = seen.await.expect("request").to_lowercase();
        assert!(raw.starts_with("get /index.html"));
        assert!(raw.contains("host: www.alpha.test"));
    }

    #[tokio::test]
    async fn replay_host_may_be_a_hostname() {
        let local = tokio::net::lookup_host(("localhost", 0))
            .await
            .expect("resolve localhost")
            .next()
            .expect("localhost address");
        let (port, seen) = serve_once_on(local, "200 OK", "ok").await;
        let checker = HttpChecker::new().expect("client");
        let mut req = request("http://www.alpha.test/");
        req.replay = Some(ReplayEndpoint {
            host: "localhost".into(),
            http_port: port,
            https_port: port.wrapping_add(1),
        });

        let sample = checker.check(&req).await.expect("sample");
        assert_eq!(sample[2], 2.0);
        let raw = seen.await.expect("request").to_lowercase();
        assert!(raw.contains("host: www.alpha.test"));
    }

    #[tokio::test]
    async fn error_status_fails_the_check() {
        let (port, _seen) = serve_once("503 Service Unavailable", "").await;
        let checker = HttpChecker::new().expect("client");
        let err = checker
            .check(&request(&format!("http://127.0.0.1:{port}/")))
            .await
            .expect_err("503");
        assert!(err.to_string().contains("503"));
    }

    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Checker for Flaky {
        fn metric_names(&self) -> Vec<String> {
            vec!["load".into()]
        }

        async fn check(&self, _request: &CheckRequest) -> Result<MetricSample> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                bail!("crash #{call}");
            }
            Ok(vec![42.0])
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let checker = RetryingChecker::new(
            Flaky {
                failures: 2,
                calls: AtomicUsize::new(0),
            },
            3,
        )
        .with_backoff(Duration::from_millis(1));
        let sample = checker.check(&request("http://a.test/")).await.expect("sample");
        assert_eq!(sample, vec![42.0]);
        assert_eq!(checker.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_limit() {
        let checker = RetryingChecker::new(
            Flaky {
                failures: 5,
                calls: AtomicUsize::new(0),
            },
            2,
        )
        .with_backoff(Duration::from_millis(20));
        let started = Instant::now();
        let err = checker
            .check(&request("http://a.test/"))
            .await
            .expect_err("exhausted");
        assert_eq!(checker.inner.calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(format!("{err:#}").contains("after 2 attempts"));
    }
}
