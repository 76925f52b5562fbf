//! The processing report: the single structure that is mutated through a run,
//! emitted as progress snapshots, and persisted as JSON at the end.
//!
//! Field names are the portal-era Portuguese ones so persisted reports stay
//! compatible with the tooling that already reads them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};

/// Where a run currently is in its state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Iniciando,
    BuscandoTarefa,
    BuscandoEtiqueta,
    BuscandoProcesso,
    ListandoProcessos,
    Processando,
    BaixandoLote,
    AguardandoDownloads,
    VerificandoIntegridade,
    Retry(u32),
    Concluido,
    ConcluidoComFalhas,
    Cancelado,
    Erro,
}

impl RunStatus {
    pub fn as_str(&self) -> std::borrow::Cow<'static, str> {
        use std::borrow::Cow;
        match self {
            Self::Iniciando => Cow::Borrowed("iniciando"),
            Self::BuscandoTarefa => Cow::Borrowed("buscando_tarefa"),
            Self::BuscandoEtiqueta => Cow::Borrowed("buscando_etiqueta"),
            Self::BuscandoProcesso => Cow::Borrowed("buscando_processo"),
            Self::ListandoProcessos => Cow::Borrowed("listando_processos"),
            Self::Processando => Cow::Borrowed("processando"),
            Self::BaixandoLote => Cow::Borrowed("baixando_lote"),
            Self::AguardandoDownloads => Cow::Borrowed("aguardando_downloads"),
            Self::VerificandoIntegridade => Cow::Borrowed("verificando_integridade"),
            Self::Retry(round) => Cow::Owned(format!("retry_{round}")),
            Self::Concluido => Cow::Borrowed("concluido"),
            Self::ConcluidoComFalhas => Cow::Borrowed("concluido_com_falhas"),
            Self::Cancelado => Cow::Borrowed("cancelado"),
            Self::Erro => Cow::Borrowed("erro"),
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "iniciando" => Self::Iniciando,
            "buscando_tarefa" => Self::BuscandoTarefa,
            "buscando_etiqueta" => Self::BuscandoEtiqueta,
            "buscando_processo" => Self::BuscandoProcesso,
            "listando_processos" => Self::ListandoProcessos,
            "processando" => Self::Processando,
            "baixando_lote" => Self::BaixandoLote,
            "aguardando_downloads" => Self::AguardandoDownloads,
            "verificando_integridade" => Self::VerificandoIntegridade,
            "concluido" => Self::Concluido,
            "concluido_com_falhas" => Self::ConcluidoComFalhas,
            "cancelado" => Self::Cancelado,
            "erro" => Self::Erro,
            other => Self::Retry(other.strip_prefix("retry_")?.parse().ok()?),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Concluido | Self::ConcluidoComFalhas | Self::Cancelado | Self::Erro
        )
    }
}

impl Serialize for RunStatus {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_str(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown run status: {s}")))
    }
}

/// Retry-round accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStats {
    pub tentativas: u32,
    pub processos_reprocessados: Vec<String>,
    pub processos_falha_definitiva: Vec<String>,
}

/// Integrity verdict after reconciling the report against on-disk files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Integrity {
    Pendente,
    Ok,
    Inconsistente,
}

/// Snapshot of a run. Cloned on every state transition; consumers never see
/// a later mutation through an earlier snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingReport {
    /// Run kind: "tarefa", "etiqueta", "numero" or "assunto".
    pub tipo: String,
    pub diretorio: String,
    pub data_inicio: String,
    pub data_fim: Option<String>,
    /// Total targets in this run.
    pub processos: u64,
    pub sucesso: u64,
    pub falha: u64,
    /// Validated files on disk, keyed by nothing in particular: plain paths.
    pub arquivos: Vec<String>,
    pub erros: Vec<String>,
    pub status: RunStatus,
    pub processo_atual: Option<String>,
    /// 1-based index of the target being worked, capped at `processos`.
    pub progresso: u64,
    pub integridade: Integrity,
    pub retries: RetryStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tarefa: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etiqueta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assunto: Option<String>,
}

impl ProcessingReport {
    pub fn new(tipo: &str, diretorio: &Path) -> Self {
        Self {
            tipo: tipo.to_string(),
            diretorio: diretorio.display().to_string(),
            data_inicio: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            data_fim: None,
            processos: 0,
            sucesso: 0,
            falha: 0,
            arquivos: Vec::new(),
            erros: Vec::new(),
            status: RunStatus::Iniciando,
            processo_atual: None,
            progresso: 0,
            integridade: Integrity::Pendente,
            retries: RetryStats::default(),
            tarefa: None,
            etiqueta: None,
            assunto: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.data_fim = Some(Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
        self.processo_atual = None;
    }

    /// Persist under the run directory as `relatorio_<timestamp>.json`, or
    /// `relatorio_cancelado.json` for a cancelled run. Returns the path.
    pub fn persist(&self, stamp: &str) -> Result<PathBuf> {
        let name = if self.status == RunStatus::Cancelado {
            "relatorio_cancelado.json".to_string()
        } else {
            format!("relatorio_{stamp}.json")
        };
        let path = Path::new(&self.diretorio).join(name);
        let body = serde_json::to_string_pretty(self).context("serializing report")?;
        std::fs::write(&path, body)
            .with_context(|| format!("writing report to {}", path.display()))?;
        Ok(path)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
