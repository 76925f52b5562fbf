//! Strategy-chain behavior of the resolution service: stub strategies for
//! the chain semantics, plus a loopback portal for the tag scan strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use pje_core::{CaseNumber, EngineConfig, FailureKind, SessionClient};
use pje_services::resolution::{
    ResolutionHit, ResolutionService, ResolveStrategy, TagLookupStrategy,
};

struct StubStrategy {
    name: &'static str,
    hit: Option<i64>,
    broken: bool,
    calls: Arc<AtomicUsize>,
}

impl StubStrategy {
    fn hit(name: &'static str, id: i64, calls: Arc<AtomicUsize>) -> Box<Self> {
        Box::new(Self { name, hit: Some(id), broken: false, calls })
    }

    fn miss(name: &'static str, calls: Arc<AtomicUsize>) -> Box<Self> {
        Box::new(Self { name, hit: None, broken: false, calls })
    }

    fn failing(name: &'static str, calls: Arc<AtomicUsize>) -> Box<Self> {
        Box::new(Self { name, hit: None, broken: true, calls })
    }
}

#[async_trait]
impl ResolveStrategy for StubStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn resolve(
        &self,
        _client: &SessionClient,
        _number: &CaseNumber,
    ) -> Result<Option<ResolutionHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            bail!("instabilidade simulada");
        }
        Ok(self
            .hit
            .map(|id| ResolutionHit { id, access_key: "chave".to_string() }))
    }
}

fn client() -> Arc<SessionClient> {
    Arc::new(SessionClient::new(EngineConfig::default()).unwrap())
}

const NUMBER: &str = "0000001-23.2024.8.05.0001";

#[tokio::test]
async fn first_hit_short_circuits_the_chain() {
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let service = ResolutionService::with_strategies(
        client(),
        vec![
            StubStrategy::hit("primeira", 41, first.clone()),
            StubStrategy::hit("segunda", 42, second.clone()),
        ],
    );

    let result = service.resolve(NUMBER).await;

    assert!(result.found);
    assert_eq!(result.id, Some(41));
    assert_eq!(result.strategy.as_deref(), Some("primeira"));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bare_digits_resolve_through_the_second_strategy() {
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let service = ResolutionService::with_strategies(
        client(),
        vec![
            StubStrategy::miss("primeira", first.clone()),
            StubStrategy::hit("segunda", 42, second.clone()),
        ],
    );

    let result = service.resolve("00000012320248050001").await;

    assert!(result.found);
    assert_eq!(result.id, Some(42));
    assert_eq!(result.strategy.as_deref(), Some("segunda"));
    assert_eq!(result.number.as_ref().map(|n| n.as_str()), Some(NUMBER));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn strategy_error_does_not_stop_the_chain() {
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let service = ResolutionService::with_strategies(
        client(),
        vec![
            StubStrategy::failing("primeira", first.clone()),
            StubStrategy::hit("segunda", 7, second.clone()),
        ],
    );

    let result = service.resolve(NUMBER).await;

    assert!(result.found);
    assert_eq!(result.strategy.as_deref(), Some("segunda"));
    assert_eq!(first.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_input_never_reaches_a_strategy() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = ResolutionService::with_strategies(
        client(),
        vec![StubStrategy::hit("primeira", 1, calls.clone())],
    );

    let result = service.resolve("123-abc").await;

    assert!(!result.found);
    assert_eq!(result.failure, Some(FailureKind::InvalidNumber));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ── Loopback portal for the tag scan ──────────────────────────────────────

fn request_complete(data: &[u8]) -> bool {
    let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let headers = String::from_utf8_lossy(&data[..pos]).to_ascii_lowercase();
    let body_len = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    data.len() >= pos + 4 + body_len
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        let Ok(n) = socket.read(&mut buf).await else { break };
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if request_complete(&data) {
            break;
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

/// Answers the three calls the tag scan makes: tag listing, the tag's case
/// listing, and access key generation.
async fn serve_tag_portal(listener: TcpListener) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else { return };
        tokio::spawn(async move {
            let request = read_request(&mut socket).await;
            let body = if request.contains("/painelUsuario/etiquetas/") {
                format!(r#"[{{"numeroProcesso":"{NUMBER}","idProcesso":4242}}]"#)
            } else if request.contains("/painelUsuario/etiquetas") {
                r#"{"entities":[{"id":7,"nomeTag":"urgente"}]}"#.to_string()
            } else if request.contains("gerarChaveAcessoProcesso") {
                "\"chave-etiqueta\"".to_string()
            } else {
                "{}".to_string()
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[tokio::test]
async fn tag_scan_finds_the_case_in_a_tag_listing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_tag_portal(listener));

    let config = EngineConfig { base_url: format!("http://{addr}"), ..EngineConfig::default() };
    let service = ResolutionService::with_strategies(
        Arc::new(SessionClient::new(config).unwrap()),
        vec![Box::new(TagLookupStrategy)],
    );

    let result = service.resolve(NUMBER).await;

    assert!(result.found);
    assert_eq!(result.id, Some(4242));
    assert_eq!(result.strategy.as_deref(), Some("etiquetas"));
    assert_eq!(result.access_key, "chave-etiqueta");
    server.abort();
}

#[tokio::test]
async fn results_are_cached_per_number() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = ResolutionService::with_strategies(
        client(),
        vec![StubStrategy::hit("primeira", 5, calls.clone())],
    );

    service.resolve(NUMBER).await;
    service.resolve(NUMBER).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    service.clear_cache();
    service.resolve(NUMBER).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
