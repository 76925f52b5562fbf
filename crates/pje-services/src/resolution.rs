//! Case resolution: turn a CNJ number into the portal's internal case id
//! and, when possible, an access key.
//!
//! Strategies are tried in order; the first hit wins. A strategy error is
//! logged and swallowed so the remaining strategies still run. The default
//! chain is REST probing, the public search form, then the task panel; the
//! tag scan is opt-in via [`ResolutionService::with_strategies`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use pje_core::scrape::extract_viewstate;
use pje_core::{CaseNumber, FailureKind, ResolutionResult, SessionClient};

use crate::pace_short;

/// What a successful strategy produces.
#[derive(Debug, Clone)]
pub struct ResolutionHit {
    pub id: i64,
    pub access_key: String,
}

#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means "not found here"; `Err` means the strategy itself
    /// broke and the next one should still run.
    async fn resolve(
        &self,
        client: &SessionClient,
        number: &CaseNumber,
    ) -> Result<Option<ResolutionHit>>;
}

/// Fetch an access key for a case id. Empty string on failure.
pub async fn generate_access_key(client: &SessionClient, id: i64) -> String {
    match client
        .api_get(&format!("painelUsuario/gerarChaveAcessoProcesso/{id}"))
        .await
    {
        Ok(resp) if resp.ok() => resp.body.trim().trim_matches('"').to_string(),
        Ok(resp) => {
            debug!(id, status = %resp.status, "access key rejected");
            String::new()
        }
        Err(err) => {
            warn!(id, %err, "access key request failed");
            String::new()
        }
    }
}

// ── Strategy: REST probing ─────────────────────────────────────────────────

/// Probes a fixed list of REST endpoints that different portal versions
/// expose for number lookup.
pub struct ApiStrategy;

const API_GET_PATHS: &[&str] = &[
    "processos/numero/{numero}",
    "painelUsuario/processos/numero/{numero}",
];

#[async_trait]
impl ResolveStrategy for ApiStrategy {
    fn name(&self) -> &'static str {
        "api_processo"
    }

    async fn resolve(
        &self,
        client: &SessionClient,
        number: &CaseNumber,
    ) -> Result<Option<ResolutionHit>> {
        let encoded = urlencoding::encode(number.as_str()).into_owned();

        for path in API_GET_PATHS {
            let path = path.replace("{numero}", &encoded);
            let resp = client.api_get(&path).await?;
            if resp.ok() {
                if let Some(id) = extract_case_id(&resp.body) {
                    return Ok(Some(ResolutionHit { id, access_key: String::new() }));
                }
            }
            pace_short().await;
        }

        let payload = json!({
            "numeroProcesso": number.as_str(),
            "page": 0,
            "maxResults": 1,
        });
        let resp = client.api_post("painelUsuario/pesquisarProcessos", &payload).await?;
        if resp.ok() {
            if let Some(id) = extract_case_id(&resp.body) {
                return Ok(Some(ResolutionHit { id, access_key: String::new() }));
            }
        }
        Ok(None)
    }
}

/// Pull an internal case id out of an arbitrary response body: JSON field
/// scan first, regex over the raw text as fallback.
fn extract_case_id(body: &str) -> Option<i64> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(id) = scan_json_for_id(&value) {
            return Some(id);
        }
    }
    let re = Regex::new(r#""(?:idProcesso|idProcessoTrf)"\s*:\s*(\d+)"#).ok()?;
    re.captures(body)?.get(1)?.as_str().parse().ok()
}

fn scan_json_for_id(value: &Value) -> Option<i64> {
    match value {
        Value::Object(map) => {
            for key in ["idProcesso", "id", "idProcessoTrf"] {
                if let Some(id) = map.get(key).and_then(Value::as_i64) {
                    if id > 0 {
                        return Some(id);
                    }
                }
            }
            map.values().find_map(scan_json_for_id)
        }
        Value::Array(items) => items.iter().find_map(scan_json_for_id),
        _ => None,
    }
}

// ── Strategy: public search form ───────────────────────────────────────────

/// Emulates the public case-search page: a Seam form POST with the six CNJ
/// fields, then a row click to harvest the access key.
pub struct DirectSearchStrategy;

const SEARCH_PAGE: &str = "/pje/Processo/ConsultaProcesso/listView.seam";
const SEARCH_BUTTON_FALLBACK: &str = "fPP:j_id455";
const NO_SELECTION: &str = "org.jboss.seam.ui.NoSelectionConverter.noSelectionValue";

#[async_trait]
impl ResolveStrategy for DirectSearchStrategy {
    fn name(&self) -> &'static str {
        "busca_direta"
    }

    async fn resolve(
        &self,
        client: &SessionClient,
        number: &CaseNumber,
    ) -> Result<Option<ResolutionHit>> {
        let base = &client.config().base_url;
        let page = client.get(&format!("{base}{SEARCH_PAGE}?iframe=true")).await?;
        if !page.status.is_success() {
            return Ok(None);
        }
        let Some(viewstate) = extract_viewstate(&page.body) else {
            warn!("search page without ViewState");
            return Ok(None);
        };
        let button = find_search_button(&page.body)
            .unwrap_or_else(|| SEARCH_BUTTON_FALLBACK.to_string());

        pace_short().await;

        let form = search_form(number, &viewstate, &button);
        let resp = client.post_form(&format!("{base}{SEARCH_PAGE}"), &form).await?;
        if !resp.status.is_success() {
            return Ok(None);
        }

        let Some(id) = extract_table_id(&resp.body) else {
            return Ok(None);
        };

        let access_key = self
            .click_result_row(client, &resp.body, id, &viewstate)
            .await
            .unwrap_or_default();
        Ok(Some(ResolutionHit { id, access_key }))
    }
}

impl DirectSearchStrategy {
    /// Replays the row click; the response links back with `&ca=<hex>`.
    async fn click_result_row(
        &self,
        client: &SessionClient,
        table_html: &str,
        id: i64,
        viewstate: &str,
    ) -> Option<String> {
        let row_re = Regex::new(&format!(r"fPP:processosTable:{id}:(j_id\d+)")).ok()?;
        let control = row_re.captures(table_html)?.get(1)?.as_str();
        let element_id = format!("fPP:processosTable:{id}:{control}");

        pace_short().await;

        let form = vec![
            ("AJAXREQUEST".to_string(), "_viewRoot".to_string()),
            ("fPP".to_string(), "fPP".to_string()),
            (element_id.clone(), element_id.clone()),
            ("idProcessoSelecionado".to_string(), id.to_string()),
            ("ajaxSingle".to_string(), element_id),
            ("javax.faces.ViewState".to_string(), viewstate.to_string()),
        ];
        let base = &client.config().base_url;
        let resp = client
            .post_form(&format!("{base}{SEARCH_PAGE}"), &form)
            .await
            .ok()?;
        if !resp.status.is_success() {
            return None;
        }
        let ca_re = Regex::new(r"[&?]ca=([a-f0-9]+)").ok()?;
        Some(ca_re.captures(&resp.body)?.get(1)?.as_str().to_string())
    }
}

fn find_search_button(html: &str) -> Option<String> {
    let re = Regex::new(r#"(?i)id="(fPP:j_id\d+)"[^>]*value="Pesquisar""#).ok()?;
    Some(re.captures(html)?.get(1)?.as_str().to_string())
}

fn search_form(number: &CaseNumber, viewstate: &str, button: &str) -> Vec<(String, String)> {
    let parts = number.parts();
    let mut form: Vec<(String, String)> = vec![
        ("AJAXREQUEST".into(), "_viewRoot".into()),
        ("fPP".into(), "fPP".into()),
        ("fPP:numeroProcesso:numeroSequencial".into(), parts.sequential),
        ("fPP:numeroProcesso:numeroDigitoVerificador".into(), parts.check_digit),
        ("fPP:numeroProcesso:Ano".into(), parts.year),
        ("fPP:numeroProcesso:ramoJustica".into(), parts.segment),
        ("fPP:numeroProcesso:respectivoTribunal".into(), parts.court),
        ("fPP:numeroProcesso:NumeroOrgaoJustica".into(), parts.origin),
        ("fPP:j_id150:nomeParte".into(), String::new()),
        ("fPP:decorationDados:ufOABCombo".into(), NO_SELECTION.into()),
        ("fPP:jurisdicaoComboDecoration:jurisdicaoCombo".into(), NO_SELECTION.into()),
        ("fPP:orgaoJulgadorComboDecoration:orgaoJulgadorCombo".into(), NO_SELECTION.into()),
        (
            "fPP:processoReferenciaDecoration:habilitarMascaraProcessoReferencia".into(),
            "true".into(),
        ),
        ("fPP:dataAutuacaoDecoration:dataAutuacaoInicioInputCurrentDate".into(), String::new()),
        ("fPP:dataAutuacaoDecoration:dataAutuacaoFimInputCurrentDate".into(), String::new()),
        ("tipoMascaraDocumento".into(), "on".into()),
        ("javax.faces.ViewState".into(), viewstate.to_string()),
        ("AJAX:EVENTS_COUNT".into(), "1".into()),
    ];
    form.push((button.to_string(), button.to_string()));
    form
}

fn extract_table_id(html: &str) -> Option<i64> {
    if let Ok(re) = Regex::new(r"processosTable:(\d+):j_id\d+") {
        if let Some(caps) = re.captures(html) {
            return caps.get(1)?.as_str().parse().ok();
        }
    }
    let re = Regex::new(r#"idProcessoSelecionado['"]?\s*[:=]\s*(\d+)"#).ok()?;
    re.captures(html)?.get(1)?.as_str().parse().ok()
}

// ── Strategy: task-panel lookup ────────────────────────────────────────────

/// Asks each of the user's task queues for the exact number. Slow, but works
/// for cases that the public search hides.
pub struct TaskPanelStrategy;

const MAX_PANEL_QUEUES: usize = 10;
const MAX_FAVOURITE_QUEUES: usize = 5;

#[async_trait]
impl ResolveStrategy for TaskPanelStrategy {
    fn name(&self) -> &'static str {
        "painel_tarefas"
    }

    async fn resolve(
        &self,
        client: &SessionClient,
        number: &CaseNumber,
    ) -> Result<Option<ResolutionHit>> {
        for (endpoint, favourites, cap) in [
            ("painelUsuario/tarefas", false, MAX_PANEL_QUEUES),
            ("painelUsuario/tarefasFavoritas", true, MAX_FAVOURITE_QUEUES),
        ] {
            let payload = json!({"numeroProcesso": "", "competencia": "", "etiquetas": []});
            let resp = client.api_post(endpoint, &payload).await?;
            if !resp.ok() {
                continue;
            }
            let queues: Vec<Value> = serde_json::from_str(&resp.body).unwrap_or_default();
            for queue in queues.iter().take(cap) {
                let Some(name) = queue.get("nome").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(hit) = self.probe_queue(client, name, favourites, number).await? {
                    return Ok(Some(hit));
                }
            }
        }
        Ok(None)
    }
}

impl TaskPanelStrategy {
    async fn probe_queue(
        &self,
        client: &SessionClient,
        queue: &str,
        favourites: bool,
        number: &CaseNumber,
    ) -> Result<Option<ResolutionHit>> {
        let path = format!(
            "painelUsuario/recuperarProcessosTarefaPendenteComCriterios/{}/{}",
            urlencoding::encode(queue),
            favourites
        );
        let payload = json!({
            "numeroProcesso": number.as_str(),
            "classe": null,
            "tags": [],
            "page": 0,
            "maxResults": 1,
            "competencia": "",
        });
        let resp = client.api_post(&path, &payload).await?;
        if !resp.ok() {
            return Ok(None);
        }
        let Some(data) = resp.json() else {
            return Ok(None);
        };
        let Some(first) = data.get("entities").and_then(Value::as_array).and_then(|e| e.first())
        else {
            return Ok(None);
        };
        if first.get("numeroProcesso").and_then(Value::as_str) == Some(number.as_str()) {
            if let Some(id) = first.get("idProcesso").and_then(Value::as_i64) {
                debug!(queue, "case found in task queue");
                return Ok(Some(ResolutionHit { id, access_key: String::new() }));
            }
        }
        Ok(None)
    }
}

// ── Strategy: tag scan ─────────────────────────────────────────────────────

/// Walks the user's tags and scans each tag's case listing for the exact
/// number. Slowest of the lot, so it is kept out of the default chain;
/// select it through [`ResolutionService::with_strategies`].
pub struct TagLookupStrategy;

const MAX_TAGS: usize = 15;
const TAG_CASES_LIMIT: usize = 500;

#[async_trait]
impl ResolveStrategy for TagLookupStrategy {
    fn name(&self) -> &'static str {
        "etiquetas"
    }

    async fn resolve(
        &self,
        client: &SessionClient,
        number: &CaseNumber,
    ) -> Result<Option<ResolutionHit>> {
        let payload = json!({"page": 0, "maxResults": 50, "tagsString": ""});
        let resp = client.api_post("painelUsuario/etiquetas", &payload).await?;
        if !resp.ok() {
            return Ok(None);
        }
        for tag_id in tag_ids(&resp.body).into_iter().take(MAX_TAGS) {
            let resp = client
                .api_get(&format!(
                    "painelUsuario/etiquetas/{tag_id}/processos?limit={TAG_CASES_LIMIT}"
                ))
                .await?;
            if resp.ok() {
                if let Some(id) = find_case_in_listing(&resp.body, number) {
                    debug!(tag_id, "case found under tag");
                    return Ok(Some(ResolutionHit { id, access_key: String::new() }));
                }
            }
            pace_short().await;
        }
        Ok(None)
    }
}

fn tag_ids(body: &str) -> Vec<i64> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return Vec::new();
    };
    match value.get("entities").and_then(Value::as_array) {
        Some(entities) => entities
            .iter()
            .filter_map(|tag| tag.get("id").and_then(Value::as_i64))
            .collect(),
        None => Vec::new(),
    }
}

/// Exact-number match over a tag's case listing.
fn find_case_in_listing(body: &str, number: &CaseNumber) -> Option<i64> {
    let cases: Vec<Value> = serde_json::from_str(body).ok()?;
    cases.iter().find_map(|case| {
        if case.get("numeroProcesso").and_then(Value::as_str) == Some(number.as_str()) {
            case.get("idProcesso").and_then(Value::as_i64)
        } else {
            None
        }
    })
}

// ── Service ────────────────────────────────────────────────────────────────

pub struct ResolutionService {
    client: Arc<SessionClient>,
    strategies: Vec<Box<dyn ResolveStrategy>>,
    cache: Mutex<HashMap<String, ResolutionResult>>,
}

impl ResolutionService {
    pub fn new(client: Arc<SessionClient>) -> Self {
        Self::with_strategies(
            client,
            vec![
                Box::new(ApiStrategy),
                Box::new(DirectSearchStrategy),
                Box::new(TaskPanelStrategy),
            ],
        )
    }

    pub fn with_strategies(
        client: Arc<SessionClient>,
        strategies: Vec<Box<dyn ResolveStrategy>>,
    ) -> Self {
        Self { client, strategies, cache: Mutex::new(HashMap::new()) }
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Resolve one number through the strategy chain, first hit wins.
    /// Invalid shapes fail without touching the network.
    pub async fn resolve(&self, input: &str) -> ResolutionResult {
        let Some(number) = CaseNumber::parse(input) else {
            return ResolutionResult::not_found(input, None, FailureKind::InvalidNumber);
        };

        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.get(number.as_str()) {
                debug!(number = %number, "resolution cache hit");
                return cached.clone();
            }
        }

        let mut result =
            ResolutionResult::not_found(input, Some(number.clone()), FailureKind::NotFound);

        for strategy in &self.strategies {
            match strategy.resolve(&self.client, &number).await {
                Ok(Some(hit)) => {
                    let access_key = if hit.access_key.is_empty() {
                        generate_access_key(&self.client, hit.id).await
                    } else {
                        hit.access_key
                    };
                    info!(number = %number, id = hit.id, via = strategy.name(), "case resolved");
                    result = ResolutionResult {
                        number: Some(number.clone()),
                        raw_input: input.to_string(),
                        id: Some(hit.id),
                        access_key,
                        found: true,
                        strategy: Some(strategy.name().to_string()),
                        failure: None,
                    };
                    break;
                }
                Ok(None) => {
                    debug!(number = %number, strategy = strategy.name(), "no hit");
                }
                Err(err) => {
                    warn!(number = %number, strategy = strategy.name(), %err, "strategy failed");
                }
            }
        }

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(number.as_str().to_string(), result.clone());
        }
        result
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_id_from_json_scan() {
        assert_eq!(extract_case_id(r#"{"idProcesso": 123, "nome": "x"}"#), Some(123));
        assert_eq!(extract_case_id(r#"{"entities": [{"id": 77}]}"#), Some(77));
        assert_eq!(extract_case_id(r#"{"wrapper": {"idProcessoTrf": 9}}"#), Some(9));
        assert_eq!(extract_case_id(r#"{"id": 0}"#), None);
        assert_eq!(extract_case_id("[]"), None);
    }

    #[test]
    fn case_id_regex_fallback_on_broken_json() {
        assert_eq!(extract_case_id(r#"garbage "idProcesso": 55 trailing"#), Some(55));
        assert_eq!(extract_case_id("<html>nothing</html>"), None);
    }

    #[test]
    fn table_id_patterns() {
        assert_eq!(
            extract_table_id(r#"<a id="fPP:processosTable:4321:j_id467">ver</a>"#),
            Some(4321)
        );
        assert_eq!(
            extract_table_id(r#"onclick="sel({idProcessoSelecionado: 88})""#),
            Some(88)
        );
        assert_eq!(extract_table_id("<table></table>"), None);
    }

    #[test]
    fn search_button_detected_with_fallback() {
        let html = r#"<input id="fPP:j_id501" type="submit" value="Pesquisar"/>"#;
        assert_eq!(find_search_button(html).as_deref(), Some("fPP:j_id501"));
        assert!(find_search_button("<form></form>").is_none());
    }

    #[test]
    fn tag_ids_from_entities() {
        let body = r#"{"entities": [{"id": 7, "nomeTag": "urgente"}, {"nomeTag": "sem id"}, {"id": 9}]}"#;
        assert_eq!(tag_ids(body), vec![7, 9]);
        assert!(tag_ids(r#"{"entities": []}"#).is_empty());
        assert!(tag_ids("not json").is_empty());
    }

    #[test]
    fn tag_listing_matches_exact_number_only() {
        let number = CaseNumber::parse("0000001-23.2024.8.05.0001").unwrap();
        let body = r#"[
            {"numeroProcesso": "0000009-23.2024.8.05.0001", "idProcesso": 1},
            {"numeroProcesso": "0000001-23.2024.8.05.0001", "idProcesso": 4242}
        ]"#;
        assert_eq!(find_case_in_listing(body, &number), Some(4242));
        assert_eq!(find_case_in_listing("[]", &number), None);
        assert_eq!(find_case_in_listing(r#"{"entities": []}"#, &number), None);
    }

    #[test]
    fn search_form_carries_cnj_parts() {
        let number = CaseNumber::parse("0000001-23.2024.8.05.0001").unwrap();
        let form = search_form(&number, "vs", "fPP:j_id455");
        let get = |k: &str| {
            form.iter()
                .find(|(name, _)| name == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("fPP:numeroProcesso:numeroSequencial"), Some("0000001"));
        assert_eq!(get("fPP:numeroProcesso:Ano"), Some("2024"));
        assert_eq!(get("fPP:numeroProcesso:NumeroOrgaoJustica"), Some("0001"));
        assert_eq!(get("fPP:j_id455"), Some("fPP:j_id455"));
        assert_eq!(get("javax.faces.ViewState"), Some("vs"));
    }
}
