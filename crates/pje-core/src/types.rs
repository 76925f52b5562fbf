//! Data model for the portal's JSON payloads and for the values the
//! services hand each other.

use serde::{Deserialize, Serialize};

use crate::cnj::CaseNumber;

// ── Authenticated user ─────────────────────────────────────────────────────

/// The user behind the current session, as reported by `usuario/currentUser`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    #[serde(rename = "idUsuario", default)]
    pub id: i64,
    #[serde(rename = "nomeUsuario", default)]
    pub name: String,
    #[serde(default)]
    pub login: String,
    #[serde(rename = "idOrgaoJulgador", default)]
    pub organ_id: i64,
    #[serde(rename = "idPapel", default)]
    pub role_id: i64,
    #[serde(rename = "idLocalizacaoFisica", default)]
    pub physical_location_id: i64,
    #[serde(rename = "idUsuarioLocalizacaoMagistradoServidor", default)]
    pub user_location_id: i64,
}

/// One row of the profile-selection table. `index` is the zero-based row
/// position the selection form expects; the favourite profile shown in the
/// table header uses index -1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub index: i32,
    pub name: String,
    pub organ: String,
    pub role: String,
}

impl Profile {
    pub fn full_name(&self) -> String {
        let mut parts = vec![self.name.as_str()];
        if !self.organ.is_empty() {
            parts.push(&self.organ);
        }
        if !self.role.is_empty() {
            parts.push(&self.role);
        }
        parts.join(" / ")
    }
}

// ── Panel directory ────────────────────────────────────────────────────────

/// A task queue from the user panel.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskQueue {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "nome", default)]
    pub name: String,
    #[serde(rename = "quantidadePendente", default)]
    pub pending: u64,
    #[serde(skip, default)]
    pub favourite: bool,
}

/// A tag from the panel's tag search.
#[derive(Debug, Clone, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "nomeTag", default)]
    pub name: String,
    #[serde(rename = "nomeTagCompleto", default)]
    pub full_name: String,
    #[serde(rename = "favorita", default)]
    pub favourite: bool,
}

/// A case row as listed inside a task queue, a tag, or a subject grouping.
#[derive(Debug, Clone, Deserialize)]
pub struct CaseSummary {
    #[serde(rename = "idProcesso", default)]
    pub id: i64,
    #[serde(rename = "numeroProcesso", default)]
    pub number: String,
    #[serde(rename = "idTaskInstance", default)]
    pub task_instance_id: i64,
    #[serde(rename = "poloAtivo", default)]
    pub plaintiff: String,
    #[serde(rename = "poloPassivo", default)]
    pub defendant: String,
    #[serde(rename = "classeJudicial", default)]
    pub judicial_class: String,
    #[serde(rename = "assuntoPrincipal", default)]
    pub main_subject: String,
}

/// Cases grouped under one main subject, ordered by group size.
#[derive(Debug, Clone)]
pub struct SubjectGroup {
    pub subject: String,
    pub cases: Vec<CaseSummary>,
}

// ── Resolution ─────────────────────────────────────────────────────────────

/// What one retrieval target looks like once resolution has run.
#[derive(Debug, Clone)]
pub struct ResolutionResult {
    pub number: Option<CaseNumber>,
    pub raw_input: String,
    pub id: Option<i64>,
    pub access_key: String,
    pub found: bool,
    /// Which strategy produced the hit.
    pub strategy: Option<String>,
    pub failure: Option<FailureKind>,
}

impl ResolutionResult {
    pub fn not_found(raw_input: &str, number: Option<CaseNumber>, failure: FailureKind) -> Self {
        Self {
            number,
            raw_input: raw_input.to_string(),
            id: None,
            access_key: String::new(),
            found: false,
            strategy: None,
            failure: Some(failure),
        }
    }
}

/// Why a target failed. The report renders these as prefixed error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidNumber,
    NotFound,
    Timeout,
    Request,
}

impl FailureKind {
    pub fn describe(self, target: &str) -> String {
        match self {
            Self::InvalidNumber => format!("{target}: numero de processo invalido"),
            Self::NotFound => format!("{target}: processo nao encontrado"),
            Self::Timeout => format!("{target}: tempo de busca esgotado"),
            Self::Request => format!("{target}: falha de comunicacao com o portal"),
        }
    }
}

// ── Download ───────────────────────────────────────────────────────────────

/// How the portal answered a download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryMode {
    /// A pre-signed URL was served and the file is already on disk.
    Direct,
    /// The document will appear in the user's download area later.
    DownloadArea,
}

/// Outcome of one `request_download` call.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub ok: bool,
    pub mode: Option<DeliveryMode>,
    pub file: Option<std::path::PathBuf>,
    pub message: String,
}

impl DownloadOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self { ok: false, mode: None, file: None, message: message.into() }
    }
}

/// One entry of the user's download area.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadAvailability {
    #[serde(rename = "idUsuario", default)]
    pub user_id: i64,
    #[serde(rename = "nomeArquivo", default)]
    pub file_name: String,
    #[serde(rename = "hashDownload", default)]
    pub hash: String,
    #[serde(rename = "situacaoDownload", default)]
    pub situation: String,
    #[serde(rename = "itens", default)]
    pub items: Vec<DownloadItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadItem {
    #[serde(rename = "numeroProcesso", default)]
    pub case_number: String,
}

impl DownloadAvailability {
    /// Distinct case numbers covered by this package.
    pub fn case_numbers(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for item in &self.items {
            if !item.case_number.is_empty() && !seen.contains(&item.case_number.as_str()) {
                seen.push(item.case_number.as_str());
            }
        }
        seen
    }

    pub fn covers(&self, number: &str) -> bool {
        self.items.iter().any(|i| i.case_number == number)
    }
}

/// Document-type filter of the download form. The portal identifies types by
/// numeric code; names are matched case- and accent-insensitively.
pub const DOC_TYPES: &[(&str, &str)] = &[
    ("selecione", "0"),
    ("peticao inicial", "12"),
    ("peticao", "36"),
    ("documento de identificacao", "52"),
    ("documento de comprovacao", "53"),
    ("certidao", "57"),
    ("decisao", "64"),
    ("procuracao", "161"),
    ("despacho", "63"),
    ("sentenca", "62"),
    ("acordao", "74"),
    ("outros documentos", "93"),
];

/// Resolve a document-type name to its portal code. Unknown names fall back
/// to `0` (everything).
pub fn doc_type_code(name: &str) -> &'static str {
    let folded = crate::scrape::fold_for_match(name);
    DOC_TYPES
        .iter()
        .find(|(n, _)| *n == folded)
        .map(|(_, code)| *code)
        .unwrap_or("0")
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_parses_portal_payload() {
        let json = r#"{
            "idUsuario": 42,
            "nomeUsuario": "Maria da Silva",
            "login": "maria.silva",
            "idOrgaoJulgador": 7,
            "idPapel": 3,
            "idLocalizacaoFisica": 1,
            "idUsuarioLocalizacaoMagistradoServidor": 99
        }"#;
        let user: AuthenticatedUser = serde_json::from_str(json).unwrap();
        assert_eq!(user.id, 42);
        assert_eq!(user.user_location_id, 99);
    }

    #[test]
    fn user_defaults_missing_fields() {
        let user: AuthenticatedUser = serde_json::from_str(r#"{"login":"x"}"#).unwrap();
        assert_eq!(user.id, 0);
        assert_eq!(user.user_location_id, 0);
    }

    #[test]
    fn profile_full_name_skips_empty_parts() {
        let p = Profile {
            index: 0,
            name: "Assessor".into(),
            organ: "1a Vara Civel".into(),
            role: String::new(),
        };
        assert_eq!(p.full_name(), "Assessor / 1a Vara Civel");
    }

    #[test]
    fn availability_case_numbers_deduped() {
        let a = DownloadAvailability {
            user_id: 1,
            file_name: "lote.zip".into(),
            hash: "abc".into(),
            situation: "CONCLUIDO".into(),
            items: vec![
                DownloadItem { case_number: "0000001-23.2024.8.05.0001".into() },
                DownloadItem { case_number: "0000001-23.2024.8.05.0001".into() },
                DownloadItem { case_number: String::new() },
            ],
        };
        assert_eq!(a.case_numbers(), vec!["0000001-23.2024.8.05.0001"]);
        assert!(a.covers("0000001-23.2024.8.05.0001"));
        assert!(!a.covers("0000002-23.2024.8.05.0001"));
    }

    #[test]
    fn doc_type_lookup() {
        assert_eq!(doc_type_code("Sentença"), "62");
        assert_eq!(doc_type_code("PETICAO INICIAL"), "12");
        assert_eq!(doc_type_code("inexistente"), "0");
    }
}
