//! HTTP transport against the portal.
//!
//! Redirects are followed by hand: the SSO handshake sets cookies on
//! intermediate hops, and reqwest's automatic redirect handling would drop
//! them. The cookie jar is a plain map, which also makes persisting it
//! trivial.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use reqwest::{redirect, Method, StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::types::AuthenticatedUser;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const FRONTEND_ORIGIN: &str = "https://frontend.cloud.pje.jus.br";
const MAX_REDIRECTS: usize = 10;

/// A fetched page after redirects have settled.
#[derive(Debug)]
pub struct PageResponse {
    pub final_url: Url,
    pub status: StatusCode,
    pub body: String,
}

/// An API call result: status plus raw body text.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.body).ok()
    }
}

struct Transport {
    http: reqwest::Client,
    cookies: HashMap<String, String>,
    user: Option<AuthenticatedUser>,
}

pub struct SessionClient {
    config: EngineConfig,
    inner: Mutex<Transport>,
}

fn build_http(timeout_secs: u64) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "Accept",
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        "Accept-Language",
        HeaderValue::from_static("pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7"),
    );
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .redirect(redirect::Policy::none())
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("building http client")
}

impl SessionClient {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let http = build_http(config.http_timeout_secs)?;
        Ok(Self {
            config,
            inner: Mutex::new(Transport { http, cookies: HashMap::new(), user: None }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Cookie jar ─────────────────────────────────────────────────────────

    pub fn cookies(&self) -> HashMap<String, String> {
        self.lock().cookies.clone()
    }

    pub fn set_cookies(&self, cookies: HashMap<String, String>) {
        self.lock().cookies = cookies;
    }

    pub fn cookie_header(&self) -> String {
        self.lock()
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn absorb_cookies(&self, headers: &HeaderMap) {
        let mut inner = self.lock();
        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let Some(pair) = raw.split(';').next() else { continue };
            if let Some((name, val)) = pair.split_once('=') {
                inner.cookies.insert(name.trim().to_string(), val.trim().to_string());
            }
        }
    }

    // ── Current user ───────────────────────────────────────────────────────

    pub fn user(&self) -> Option<AuthenticatedUser> {
        self.lock().user.clone()
    }

    pub fn set_user(&self, user: Option<AuthenticatedUser>) {
        self.lock().user = user;
    }

    /// Drop the transport and the in-memory session state.
    pub fn clear_session(&self) {
        let mut inner = self.lock();
        inner.cookies.clear();
        inner.user = None;
    }

    /// Recreate the underlying HTTP client, abandoning in-flight connections.
    /// Used on cancellation so a hung request cannot stall the unwind.
    pub fn reset_transport(&self) -> Result<()> {
        let http = build_http(self.config.http_timeout_secs)?;
        self.lock().http = http;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Transport> {
        // Cookie/user state is plain data; a poisoned lock only means a
        // panicking test thread, so keep the state usable.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn http(&self) -> reqwest::Client {
        self.lock().http.clone()
    }

    // ── Browser-shaped requests (manual redirects) ─────────────────────────

    /// GET following up to [`MAX_REDIRECTS`] hops, absorbing cookies on each.
    pub async fn get(&self, url: &str) -> Result<PageResponse> {
        self.request_following(Method::GET, url, None).await
    }

    /// POST a form body; any redirect chain after it is followed with GETs.
    pub async fn post_form(&self, url: &str, form: &[(String, String)]) -> Result<PageResponse> {
        let body = form
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        self.request_following(Method::POST, url, Some(body)).await
    }

    async fn request_following(
        &self,
        method: Method,
        url: &str,
        form_body: Option<String>,
    ) -> Result<PageResponse> {
        let mut current = Url::parse(url).with_context(|| format!("invalid url {url}"))?;
        let mut method = method;
        let mut body = form_body;

        for hop in 0..MAX_REDIRECTS {
            let mut req = self.http().request(method.clone(), current.clone());
            if !self.lock().cookies.is_empty() {
                req = req.header(COOKIE, self.cookie_header());
            }
            if let Some(form) = body.take() {
                req = req
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(form);
            }
            let resp = req
                .send()
                .await
                .with_context(|| format!("requesting {current}"))?;
            self.absorb_cookies(resp.headers());

            let status = resp.status();
            if status.is_redirection() {
                let Some(location) = resp.headers().get(LOCATION).and_then(|v| v.to_str().ok())
                else {
                    bail!("redirect from {current} without a Location header");
                };
                let next = current
                    .join(location)
                    .with_context(|| format!("bad redirect target {location}"))?;
                debug!(hop, from = %current, to = %next, "following redirect");
                current = next;
                method = Method::GET;
                continue;
            }

            let final_url = resp.url().clone();
            let text = resp.text().await.context("reading response body")?;
            return Ok(PageResponse { final_url, status, body: text });
        }
        bail!("redirect loop at {current} (more than {MAX_REDIRECTS} hops)")
    }

    // ── API-shaped requests ────────────────────────────────────────────────

    fn api_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert("X-pje-legacy-app", HeaderValue::from_static("pje-tjba-1g"));
        headers.insert("Origin", HeaderValue::from_static(FRONTEND_ORIGIN));
        if let Ok(v) = HeaderValue::from_str(&format!("{FRONTEND_ORIGIN}/")) {
            headers.insert("Referer", v);
        }
        if let Ok(v) = HeaderValue::from_str(&self.cookie_header()) {
            headers.insert("X-pje-cookies", v);
        }
        if let Some(user) = self.user() {
            if user.user_location_id > 0 {
                if let Ok(v) = HeaderValue::from_str(&user.user_location_id.to_string()) {
                    headers.insert("X-pje-usuario-localizacao", v);
                }
            }
        }
        headers
    }

    /// GET `{api_base}/{path}` with the portal's API headers.
    pub async fn api_get(&self, path: &str) -> Result<ApiResponse> {
        let url = format!("{}/{}", self.config.api_base(), path);
        let resp = self
            .http()
            .get(&url)
            .headers(self.api_headers())
            .header(COOKIE, self.cookie_header())
            .send()
            .await
            .with_context(|| format!("api get {path}"))?;
        let status = resp.status();
        let body = resp.text().await.context("reading api body")?;
        Ok(ApiResponse { status, body })
    }

    /// POST `{api_base}/{path}` with a JSON payload.
    pub async fn api_post(&self, path: &str, payload: &serde_json::Value) -> Result<ApiResponse> {
        let url = format!("{}/{}", self.config.api_base(), path);
        let resp = self
            .http()
            .post(&url)
            .headers(self.api_headers())
            .header(COOKIE, self.cookie_header())
            .json(payload)
            .send()
            .await
            .with_context(|| format!("api post {path}"))?;
        let status = resp.status();
        let body = resp.text().await.context("reading api body")?;
        Ok(ApiResponse { status, body })
    }

    /// Full-URL GET (pre-signed storage URLs, download-area fetch URLs).
    /// The client-level timeout is a total-request deadline that would abort
    /// a healthy slow transfer mid-stream, so document fetches override it
    /// with the dedicated download deadline.
    pub async fn get_raw(&self, url: &str) -> Result<reqwest::Response> {
        self.http()
            .get(url)
            .timeout(Duration::from_secs(self.config.download_timeout_secs))
            .header(COOKIE, self.cookie_header())
            .send()
            .await
            .with_context(|| format!("requesting {url}"))
    }

    /// Stream a URL to `path`. Returns bytes written.
    pub async fn download_to_file(&self, url: &str, path: &Path) -> Result<u64> {
        let mut resp = self.get_raw(url).await?;
        if !resp.status().is_success() {
            bail!("download of {url} failed with status {}", resp.status());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.context("reading download chunk")? {
            file.write_all(&chunk).await.context("writing download chunk")?;
            written += chunk.len() as u64;
        }
        file.flush().await.context("flushing download")?;
        if written == 0 {
            warn!(url, path = %path.display(), "downloaded file is empty");
        }
        Ok(written)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SessionClient {
        SessionClient::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let c = client();
        c.set_cookies(HashMap::from([("A".to_string(), "1".to_string())]));
        assert_eq!(c.cookie_header(), "A=1");
    }

    #[test]
    fn set_cookie_parsing_keeps_first_pair() {
        let c = client();
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("JSESSIONID=abc123; Path=/pje; HttpOnly"),
        );
        headers.append(SET_COOKIE, HeaderValue::from_static("KC_SESSION=xyz; Secure"));
        c.absorb_cookies(&headers);
        let cookies = c.cookies();
        assert_eq!(cookies.get("JSESSIONID").map(String::as_str), Some("abc123"));
        assert_eq!(cookies.get("KC_SESSION").map(String::as_str), Some("xyz"));
    }

    #[test]
    fn clear_session_empties_state() {
        let c = client();
        c.set_cookies(HashMap::from([("A".to_string(), "1".to_string())]));
        c.set_user(Some(AuthenticatedUser { id: 1, ..Default::default() }));
        c.clear_session();
        assert!(c.cookies().is_empty());
        assert!(c.user().is_none());
    }

    #[test]
    fn reset_transport_preserves_cookies() {
        let c = client();
        c.set_cookies(HashMap::from([("A".to_string(), "1".to_string())]));
        c.reset_transport().unwrap();
        assert_eq!(c.cookies().len(), 1);
    }

    #[tokio::test]
    async fn slow_download_outlives_page_timeout() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Streams 40 bytes in 8-byte chunks, 600 ms apart: a healthy
        // transfer that takes ~3 s end to end, never stalling.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 40\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            for chunk in [b'x'; 40].chunks(8) {
                socket.write_all(chunk).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(600)).await;
            }
        });

        let config = EngineConfig { http_timeout_secs: 2, ..EngineConfig::default() };
        let c = SessionClient::new(config).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autos.pdf");

        let written = c
            .download_to_file(&format!("http://{addr}/documento"), &path)
            .await
            .unwrap();
        assert_eq!(written, 40);
        assert_eq!(std::fs::read(&path).unwrap().len(), 40);
        server.await.unwrap();
    }

    #[test]
    fn api_headers_carry_portal_identity() {
        let c = client();
        c.set_cookies(HashMap::from([("JSESSIONID".to_string(), "abc".to_string())]));
        c.set_user(Some(AuthenticatedUser { user_location_id: 77, ..Default::default() }));
        let headers = c.api_headers();
        assert_eq!(headers.get("X-pje-legacy-app").unwrap(), "pje-tjba-1g");
        assert_eq!(headers.get("X-pje-cookies").unwrap(), "JSESSIONID=abc");
        assert_eq!(headers.get("X-pje-usuario-localizacao").unwrap(), "77");
        assert_eq!(headers.get("Origin").unwrap(), FRONTEND_ORIGIN);
    }
}
