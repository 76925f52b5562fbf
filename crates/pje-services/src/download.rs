//! Document download against the portal's Seam-era pages.
//!
//! A download request is an AJAX form post on the digital-records page.
//! Depending on server mood the answer is either a pre-signed storage URL
//! (file now) or a promise that the package will appear in the user's
//! download area (file later). Both paths are handled here; the polling of
//! the download area is bounded and cancellable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pje_core::scrape::{current_month_year, extract_viewstate};
use pje_core::types::doc_type_code;
use pje_core::{CaseNumber, DeliveryMode, DownloadAvailability, DownloadOutcome, SessionClient};

use crate::pace_short;

const RECORDS_PAGE: &str = "/pje/Processo/ConsultaProcesso/Detalhe/listAutosDigitais.seam";

/// Historical ids of the download button, newest first. Tried when none of
/// the markup patterns match.
const KNOWN_BUTTON_IDS: &[&str] = &[
    "navbar:j_id280",
    "navbar:j_id278",
    "navbar:j_id271",
    "navbar:j_id270",
    "navbar:j_id267",
];

pub struct DownloadService {
    client: Arc<SessionClient>,
}

impl DownloadService {
    pub fn new(client: Arc<SessionClient>) -> Self {
        Self { client }
    }

    /// Open the digital-records page for a case. `None` on any failure.
    async fn open_case_page(&self, id: i64, access_key: &str) -> Option<String> {
        let url = format!(
            "{}{RECORDS_PAGE}?idProcesso={id}&ca={access_key}",
            self.client.config().base_url
        );
        match self.client.get(&url).await {
            Ok(page) if page.status.is_success() => Some(page.body),
            Ok(page) => {
                warn!(id, status = %page.status, "records page rejected");
                None
            }
            Err(err) => {
                warn!(id, %err, "records page unreachable");
                None
            }
        }
    }

    /// Request the document bundle for one case.
    pub async fn request_download(
        &self,
        id: i64,
        number: &CaseNumber,
        doc_type: &str,
        out_dir: &Path,
    ) -> DownloadOutcome {
        let access_key = crate::resolution::generate_access_key(&self.client, id).await;
        if access_key.is_empty() {
            return DownloadOutcome::failed("chave de acesso indisponivel");
        }

        pace_short().await;
        let Some(html) = self.open_case_page(id, &access_key).await else {
            return DownloadOutcome::failed("pagina de autos inacessivel");
        };

        let Some(viewstate) = extract_viewstate(&html) else {
            return DownloadOutcome::failed("ViewState ausente na pagina de autos");
        };
        let Some(button) = find_download_button(&html) else {
            return DownloadOutcome::failed("botao de download nao localizado");
        };

        pace_short().await;

        let form = download_form(doc_type, &viewstate, &button);
        let url = format!("{}{RECORDS_PAGE}", self.client.config().base_url);
        let resp = match self.client.post_form(&url, &form).await {
            Ok(resp) if resp.status.is_success() => resp,
            Ok(resp) => {
                return DownloadOutcome::failed(format!(
                    "solicitacao rejeitada com status {}",
                    resp.status
                ))
            }
            Err(err) => return DownloadOutcome::failed(format!("falha na solicitacao: {err}")),
        };

        self.classify_response(&resp.body, number, out_dir).await
    }

    async fn classify_response(
        &self,
        body: &str,
        number: &CaseNumber,
        out_dir: &Path,
    ) -> DownloadOutcome {
        let text = body.to_lowercase();

        if text.contains("sendo gerado") || text.contains("aguarde") {
            if let Some(url) = extract_direct_url(body) {
                if let Some(file) = self.fetch_direct(&url, number, out_dir).await {
                    return DownloadOutcome {
                        ok: true,
                        mode: Some(DeliveryMode::Direct),
                        file: Some(file),
                        message: "arquivo baixado diretamente".into(),
                    };
                }
            }
            // Generated but no URL yet; it will land in the download area.
            return DownloadOutcome {
                ok: true,
                mode: Some(DeliveryMode::DownloadArea),
                file: None,
                message: "documento em geracao".into(),
            };
        }

        let queued = ["disponibilizado", "area de download", "documento solicitado"]
            .iter()
            .any(|p| text.contains(p));
        if queued {
            return DownloadOutcome {
                ok: true,
                mode: Some(DeliveryMode::DownloadArea),
                file: None,
                message: "aguardando area de download".into(),
            };
        }

        DownloadOutcome::failed("resposta do portal nao reconhecida")
    }

    async fn fetch_direct(
        &self,
        url: &str,
        number: &CaseNumber,
        out_dir: &Path,
    ) -> Option<PathBuf> {
        let name = direct_file_name(url)
            .unwrap_or_else(|| format!("{}-processo.pdf", number.as_str()));
        let path = out_dir.join(name);
        match self.client.download_to_file(url, &path).await {
            Ok(bytes) if bytes > 0 => {
                info!(number = %number, path = %path.display(), bytes, "direct download done");
                Some(path)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(number = %number, %err, "direct download failed");
                None
            }
        }
    }

    // ── Download area ──────────────────────────────────────────────────────

    /// List the user's pending/ready download packages. Empty on failure.
    pub async fn list_available(&self) -> Vec<DownloadAvailability> {
        let Some(user) = self.client.user() else {
            return Vec::new();
        };
        let path = format!(
            "pjedocs-api/v1/downloadService/recuperarDownloadsDisponiveis\
             ?idUsuario={}&sistemaOrigem=PRIMEIRA_INSTANCIA",
            user.id
        );
        match self.client.api_get(&path).await {
            Ok(resp) if resp.ok() => {
                #[derive(Deserialize)]
                struct Listing {
                    #[serde(rename = "downloadsDisponiveis", default)]
                    items: Vec<DownloadAvailability>,
                }
                serde_json::from_str::<Listing>(&resp.body)
                    .map(|l| l.items)
                    .unwrap_or_default()
            }
            Ok(resp) => {
                debug!(status = %resp.status, "download listing rejected");
                Vec::new()
            }
            Err(err) => {
                warn!(%err, "download listing failed");
                Vec::new()
            }
        }
    }

    /// Fetch one package from the download area into `out_dir`.
    pub async fn fetch_from_area(
        &self,
        item: &DownloadAvailability,
        out_dir: &Path,
    ) -> Option<PathBuf> {
        let path = format!(
            "pjedocs-api/v2/repositorio/gerar-url-download?hashDownload={}",
            item.hash
        );
        let url = match self.client.api_get(&path).await {
            Ok(resp) if resp.ok() => resp.body.trim().trim_matches('"').to_string(),
            _ => return None,
        };
        if url.is_empty() {
            return None;
        }
        let target = out_dir.join(&item.file_name);
        match self.client.download_to_file(&url, &target).await {
            Ok(bytes) if bytes > 0 => {
                info!(file = %target.display(), bytes, "fetched from download area");
                Some(target)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(file = %item.file_name, %err, "download area fetch failed");
                None
            }
        }
    }

    /// Poll the download area until every number in `pending` is covered,
    /// `max_wait` elapses, or cancellation fires. Returns the fetched files.
    pub async fn wait_for_pending(
        &self,
        pending: &[String],
        out_dir: &Path,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Vec<PathBuf> {
        if pending.is_empty() {
            return Vec::new();
        }
        info!(count = pending.len(), "waiting for download area");

        let mut fetched = Vec::new();
        let mut remaining: Vec<String> = pending.to_vec();
        let interval = Duration::from_secs(self.client.config().poll_interval_secs);
        let deadline = Instant::now() + max_wait;

        // Give the portal a head start before the first poll.
        if sleep_or_cancelled(Duration::from_secs(5), cancel).await {
            return fetched;
        }

        while !remaining.is_empty() && Instant::now() < deadline {
            if cancel.is_cancelled() {
                break;
            }
            for item in self.list_available().await {
                if cancel.is_cancelled() {
                    return fetched;
                }
                let covered: Vec<String> = remaining
                    .iter()
                    .filter(|n| item.covers(n))
                    .cloned()
                    .collect();
                if covered.is_empty() {
                    continue;
                }
                if let Some(path) = self.fetch_from_area(&item, out_dir).await {
                    fetched.push(path);
                    remaining.retain(|n| !covered.contains(n));
                }
            }
            if !remaining.is_empty() {
                debug!(remaining = remaining.len(), "still waiting for downloads");
                if sleep_or_cancelled(interval, cancel).await {
                    break;
                }
            }
        }
        fetched
    }
}

/// Sleep that loses against cancellation. Returns true when cancelled.
pub(crate) async fn sleep_or_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.cancelled() => true,
    }
}

// ── Page scraping ──────────────────────────────────────────────────────────

fn find_download_button(html: &str) -> Option<String> {
    let patterns = [
        r#"(?is)<input[^>]*id="(navbar:j_id\d+)"[^>]*onclick="iniciarTemporizadorDownload\(\)[^"]*"[^>]*value="Download"[^>]*>"#,
        r#"(?is)<input[^>]*value="Download"[^>]*id="(navbar:j_id\d+)"[^>]*onclick="iniciarTemporizadorDownload\(\)[^"]*"[^>]*>"#,
        r#"(?is)id="navbar:botoesDownload"[^>]*>.*?<input[^>]*id="(navbar:j_id\d+)"[^>]*value="Download""#,
    ];
    for pattern in patterns {
        let Ok(re) = Regex::new(pattern) else { continue };
        if let Some(caps) = re.captures(html) {
            if let Some(m) = caps.get(1) {
                return Some(m.as_str().to_string());
            }
        }
    }
    KNOWN_BUTTON_IDS
        .iter()
        .find(|id| html.contains(*id))
        .map(|id| (*id).to_string())
}

fn download_form(doc_type: &str, viewstate: &str, button: &str) -> Vec<(String, String)> {
    let month = current_month_year();
    vec![
        ("AJAXREQUEST".into(), "_viewRoot".into()),
        ("navbar:cbTipoDocumento".into(), doc_type_code(doc_type).to_string()),
        ("navbar:idDe".into(), String::new()),
        ("navbar:idAte".into(), String::new()),
        ("navbar:dtInicioInputDate".into(), String::new()),
        ("navbar:dtInicioInputCurrentDate".into(), month.clone()),
        ("navbar:dtFimInputDate".into(), String::new()),
        ("navbar:dtFimInputCurrentDate".into(), month),
        ("navbar:cbCronologia".into(), "DESC".into()),
        (String::new(), "on".into()),
        ("navbar".into(), "navbar".into()),
        ("autoScroll".into(), String::new()),
        ("javax.faces.ViewState".into(), viewstate.to_string()),
        (button.to_string(), button.to_string()),
        ("AJAX:EVENTS_COUNT".into(), "1".into()),
    ]
}

fn extract_direct_url(html: &str) -> Option<String> {
    let re = Regex::new(
        r#"(https://[^"'<>\s]*\.s3\.[^"'<>\s]*\.amazonaws\.com/[^"'<>\s]*-processo\.pdf[^"'<>\s]*)"#,
    )
    .ok()?;
    Some(re.captures(html)?.get(1)?.as_str().replace("&amp;", "&"))
}

fn direct_file_name(url: &str) -> Option<String> {
    let re = Regex::new(r"/([^/?]+-processo\.pdf)").ok()?;
    Some(re.captures(url)?.get(1)?.as_str().to_string())
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_found_by_markup() {
        let html = r#"<input id="navbar:j_id312" onclick="iniciarTemporizadorDownload();A4J.AJAX" value="Download" type="button">"#;
        assert_eq!(find_download_button(html).as_deref(), Some("navbar:j_id312"));
    }

    #[test]
    fn button_found_by_reversed_attribute_order() {
        let html = r#"<input value="Download" id="navbar:j_id299" onclick="iniciarTemporizadorDownload()">"#;
        assert_eq!(find_download_button(html).as_deref(), Some("navbar:j_id299"));
    }

    #[test]
    fn button_falls_back_to_known_ids() {
        let html = r#"<div>pagina sem marcador<span>navbar:j_id271</span></div>"#;
        assert_eq!(find_download_button(html).as_deref(), Some("navbar:j_id271"));
        assert!(find_download_button("<html></html>").is_none());
    }

    #[test]
    fn direct_url_extracted_and_unescaped() {
        let html = concat!(
            r#"<script>abrir("https://bucket-docs.s3.sa-east-1.amazonaws.com/"#,
            r#"0000001-23.2024.8.05.0001-processo.pdf?X-Amz-Expires=300&amp;sig=abc")</script>"#,
        );
        let url = extract_direct_url(html).unwrap();
        assert!(url.contains("X-Amz-Expires=300&sig=abc"));
        assert!(extract_direct_url("<html>nada</html>").is_none());
    }

    #[test]
    fn direct_file_name_from_url() {
        assert_eq!(
            direct_file_name("https://b.s3.x.amazonaws.com/abc-processo.pdf?sig=1").as_deref(),
            Some("abc-processo.pdf")
        );
        assert!(direct_file_name("https://example.com/outro.zip").is_none());
    }

    #[test]
    fn download_form_shape() {
        let form = download_form("Sentença", "vs42", "navbar:j_id280");
        let get = |k: &str| {
            form.iter()
                .find(|(name, _)| name == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("navbar:cbTipoDocumento"), Some("62"));
        assert_eq!(get("navbar:cbCronologia"), Some("DESC"));
        assert_eq!(get("javax.faces.ViewState"), Some("vs42"));
        assert_eq!(get("navbar:j_id280"), Some("navbar:j_id280"));
    }
}
