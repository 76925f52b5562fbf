//! The processing orchestrator: turns a target set (task queue, tag,
//! subject, or explicit numbers) into downloaded files, a verified output
//! directory, and a persisted report.
//!
//! The pipeline is best effort across all targets: per-item failures are
//! recorded and never abort the run. Cancellation is cooperative and checked
//! at every iteration boundary; every wait races the cancellation token.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pje_core::scrape::{sanitize_dir_name, timestamp_str};
use pje_core::{
    CaseNumber, CaseSummary, DownloadOutcome, EngineConfig, FailureKind, Integrity,
    ProcessingReport, ResolutionResult, RunStatus, SessionClient, SubjectGroup, Tag, TaskQueue,
};

use crate::directory::DirectoryService;
use crate::download::{sleep_or_cancelled, DownloadService};
use crate::resolution::ResolutionService;

// ── Seams ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CaseResolver: Send + Sync {
    async fn resolve(&self, input: &str) -> ResolutionResult;
    fn clear_cache(&self);
}

#[async_trait]
pub trait DownloadApi: Send + Sync {
    async fn request_download(
        &self,
        id: i64,
        number: &CaseNumber,
        doc_type: &str,
        out_dir: &Path,
    ) -> DownloadOutcome;

    async fn wait_for_pending(
        &self,
        pending: &[String],
        out_dir: &Path,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Vec<PathBuf>;
}

#[async_trait]
pub trait CaseDirectory: Send + Sync {
    async fn find_task(&self, name: &str, favourites: bool) -> Option<TaskQueue>;
    async fn list_task_cases(&self, task: &TaskQueue) -> Vec<CaseSummary>;
    async fn find_tag(&self, name: &str) -> Option<Tag>;
    async fn list_tag_cases(&self, tag: &Tag) -> Vec<CaseSummary>;
    async fn find_subject(&self, query: &str) -> Option<SubjectGroup>;
    fn clear_cache(&self);
}

#[async_trait]
impl CaseResolver for ResolutionService {
    async fn resolve(&self, input: &str) -> ResolutionResult {
        ResolutionService::resolve(self, input).await
    }

    fn clear_cache(&self) {
        ResolutionService::clear_cache(self);
    }
}

#[async_trait]
impl DownloadApi for DownloadService {
    async fn request_download(
        &self,
        id: i64,
        number: &CaseNumber,
        doc_type: &str,
        out_dir: &Path,
    ) -> DownloadOutcome {
        DownloadService::request_download(self, id, number, doc_type, out_dir).await
    }

    async fn wait_for_pending(
        &self,
        pending: &[String],
        out_dir: &Path,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Vec<PathBuf> {
        DownloadService::wait_for_pending(self, pending, out_dir, max_wait, cancel).await
    }
}

#[async_trait]
impl CaseDirectory for DirectoryService {
    async fn find_task(&self, name: &str, favourites: bool) -> Option<TaskQueue> {
        DirectoryService::find_task(self, name, favourites).await
    }

    async fn list_task_cases(&self, task: &TaskQueue) -> Vec<CaseSummary> {
        DirectoryService::list_task_cases(self, task).await
    }

    async fn find_tag(&self, name: &str) -> Option<Tag> {
        DirectoryService::find_tag(self, name).await
    }

    async fn list_tag_cases(&self, tag: &Tag) -> Vec<CaseSummary> {
        DirectoryService::list_tag_cases(self, tag).await
    }

    async fn find_subject(&self, query: &str) -> Option<SubjectGroup> {
        DirectoryService::find_subject(self, query).await
    }

    fn clear_cache(&self) {
        DirectoryService::clear_cache(self);
    }
}

// ── Targets ────────────────────────────────────────────────────────────────

/// One unit of work. However a case was discovered, the pipeline only cares
/// about its number and, when already known, its internal id.
#[derive(Debug, Clone)]
pub struct CaseTarget {
    pub number: CaseNumber,
    pub id: Option<i64>,
}

/// Per-run knobs beyond the target selection itself.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub doc_type: String,
    pub wait_for_downloads: bool,
    pub limit: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            doc_type: "Selecione".to_string(),
            wait_for_downloads: true,
            limit: None,
        }
    }
}

/// Marker for the cooperative-cancellation unwind.
struct Cancelled;

// ── Processor ──────────────────────────────────────────────────────────────

pub struct Processor {
    config: EngineConfig,
    resolver: Arc<dyn CaseResolver>,
    downloads: Arc<dyn DownloadApi>,
    directory: Arc<dyn CaseDirectory>,
    progress: mpsc::UnboundedSender<ProcessingReport>,
    cancel: CancellationToken,
    session: Option<Arc<SessionClient>>,
}

impl Processor {
    pub fn new(
        config: EngineConfig,
        resolver: Arc<dyn CaseResolver>,
        downloads: Arc<dyn DownloadApi>,
        directory: Arc<dyn CaseDirectory>,
        progress: mpsc::UnboundedSender<ProcessingReport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            resolver,
            downloads,
            directory,
            progress,
            cancel,
            session: None,
        }
    }

    /// Attach the live session so cancellation can reset the transport.
    pub fn with_session(mut self, session: Arc<SessionClient>) -> Self {
        self.session = Some(session);
        self
    }

    fn emit(&self, report: &ProcessingReport) {
        // A dropped receiver only means nobody is watching.
        let _ = self.progress.send(report.clone());
    }

    fn set_status(&self, report: &mut ProcessingReport, status: RunStatus) {
        report.status = status;
        self.emit(report);
    }

    fn ensure_active(&self) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    async fn pace(&self) -> Result<(), Cancelled> {
        let jitter = crate::jitter_ms(&self.config);
        if sleep_or_cancelled(Duration::from_millis(jitter), &self.cancel).await {
            return Err(Cancelled);
        }
        Ok(())
    }

    // ── Entry points ───────────────────────────────────────────────────────

    pub async fn run_by_task(
        &self,
        name: &str,
        favourites: bool,
        opts: &RunOptions,
    ) -> ProcessingReport {
        let dir = self.config.download_dir.join(sanitize_dir_name(name));
        let Some(mut report) = self.start_report("tarefa", &dir) else {
            return self.broken_dir_report("tarefa", &dir);
        };
        report.tarefa = Some(name.to_string());
        self.emit(&report);

        info!(task = name, "processing by task");
        if self.ensure_active().is_err() {
            return self.finalize(report, true).await;
        }

        self.set_status(&mut report, RunStatus::BuscandoTarefa);
        let Some(task) = self.directory.find_task(name, favourites).await else {
            report.erros.push(format!("Tarefa nao encontrada: {name}"));
            return self.abort_with_error(report).await;
        };

        self.set_status(&mut report, RunStatus::ListandoProcessos);
        let mut cases = self.directory.list_task_cases(&task).await;
        if let Some(limit) = opts.limit {
            cases.truncate(limit);
        }
        let targets = self.targets_from_cases(&mut report, cases);
        self.run_targets(report, targets, opts).await
    }

    pub async fn run_by_tag(&self, name: &str, opts: &RunOptions) -> ProcessingReport {
        let dir = self.config.download_dir.join(sanitize_dir_name(name));
        let Some(mut report) = self.start_report("etiqueta", &dir) else {
            return self.broken_dir_report("etiqueta", &dir);
        };
        report.etiqueta = Some(name.to_string());
        self.emit(&report);

        info!(tag = name, "processing by tag");
        if self.ensure_active().is_err() {
            return self.finalize(report, true).await;
        }

        self.set_status(&mut report, RunStatus::BuscandoEtiqueta);
        let Some(tag) = self.directory.find_tag(name).await else {
            report.erros.push(format!("Etiqueta nao encontrada: {name}"));
            return self.abort_with_error(report).await;
        };

        self.set_status(&mut report, RunStatus::ListandoProcessos);
        let mut cases = self.directory.list_tag_cases(&tag).await;
        if let Some(limit) = opts.limit {
            cases.truncate(limit);
        }
        let targets = self.targets_from_cases(&mut report, cases);
        self.run_targets(report, targets, opts).await
    }

    pub async fn run_by_subject(&self, query: &str, opts: &RunOptions) -> ProcessingReport {
        let dir = self.config.download_dir.join(sanitize_dir_name(query));
        let Some(mut report) = self.start_report("assunto", &dir) else {
            return self.broken_dir_report("assunto", &dir);
        };
        report.assunto = Some(query.to_string());
        self.emit(&report);

        info!(subject = query, "processing by subject");
        if self.ensure_active().is_err() {
            return self.finalize(report, true).await;
        }

        self.set_status(&mut report, RunStatus::BuscandoTarefa);
        let Some(group) = self.directory.find_subject(query).await else {
            report.erros.push(format!("Assunto nao encontrado: {query}"));
            return self.abort_with_error(report).await;
        };
        report.assunto = Some(group.subject.clone());

        self.set_status(&mut report, RunStatus::ListandoProcessos);
        let mut cases = group.cases;
        if let Some(limit) = opts.limit {
            cases.truncate(limit);
        }
        let targets = self.targets_from_cases(&mut report, cases);
        self.run_targets(report, targets, opts).await
    }

    pub async fn run_by_numbers(&self, numbers: &[String], opts: &RunOptions) -> ProcessingReport {
        let dir = self
            .config
            .download_dir
            .join(format!("processos_{}", timestamp_str()));
        let Some(mut report) = self.start_report("numero", &dir) else {
            return self.broken_dir_report("numero", &dir);
        };
        self.emit(&report);

        info!(count = numbers.len(), "processing by number");
        self.resolver.clear_cache();

        report.processos = numbers.len() as u64;
        let mut targets = Vec::new();
        for raw in numbers {
            match CaseNumber::parse(raw) {
                Some(number) => targets.push(CaseTarget { number, id: None }),
                None => {
                    report.falha += 1;
                    report.erros.push(FailureKind::InvalidNumber.describe(raw));
                }
            }
        }
        self.run_targets(report, targets, opts).await
    }

    // ── Target production helpers ──────────────────────────────────────────

    fn start_report(&self, kind: &str, dir: &Path) -> Option<ProcessingReport> {
        if let Err(err) = std::fs::create_dir_all(dir) {
            error!(%err, dir = %dir.display(), "cannot create output directory");
            return None;
        }
        Some(ProcessingReport::new(kind, dir))
    }

    fn broken_dir_report(&self, kind: &str, dir: &Path) -> ProcessingReport {
        let mut report = ProcessingReport::new(kind, dir);
        report.erros.push(format!("Diretorio inacessivel: {}", dir.display()));
        report.finish(RunStatus::Erro);
        self.emit(&report);
        report
    }

    async fn abort_with_error(&self, mut report: ProcessingReport) -> ProcessingReport {
        report.finish(RunStatus::Erro);
        self.persist(&report);
        self.emit(&report);
        report
    }

    fn targets_from_cases(
        &self,
        report: &mut ProcessingReport,
        cases: Vec<CaseSummary>,
    ) -> Vec<CaseTarget> {
        report.processos = cases.len() as u64;
        let mut targets = Vec::new();
        for case in cases {
            match CaseNumber::parse(&case.number) {
                Some(number) => targets.push(CaseTarget { number, id: Some(case.id) }),
                None => {
                    report.falha += 1;
                    report.erros.push(FailureKind::InvalidNumber.describe(&case.number));
                }
            }
        }
        targets
    }

    // ── Shared pipeline ────────────────────────────────────────────────────

    async fn run_targets(
        &self,
        mut report: ProcessingReport,
        targets: Vec<CaseTarget>,
        opts: &RunOptions,
    ) -> ProcessingReport {
        if targets.is_empty() {
            report.erros.push("Nenhum processo encontrado".to_string());
            report.finish(if report.falha > 0 {
                RunStatus::ConcluidoComFalhas
            } else {
                RunStatus::Concluido
            });
            self.persist(&report);
            self.emit(&report);
            return report;
        }

        let cancelled = self.drive(&mut report, targets, opts).await.is_err();
        self.finalize(report, cancelled).await
    }

    async fn drive(
        &self,
        report: &mut ProcessingReport,
        targets: Vec<CaseTarget>,
        opts: &RunOptions,
    ) -> Result<(), Cancelled> {
        let dir = PathBuf::from(&report.diretorio);
        let expected: Vec<String> =
            targets.iter().map(|t| t.number.as_str().to_string()).collect();
        let mut ids: HashMap<String, i64> = targets
            .iter()
            .filter_map(|t| t.id.map(|id| (t.number.as_str().to_string(), id)))
            .collect();
        let mut pending: Vec<String> = Vec::new();
        let total = targets.len();

        self.set_status(report, RunStatus::Processando);

        for (i, target) in targets.into_iter().enumerate() {
            self.ensure_active()?;

            let number = target.number.clone();
            report.processo_atual = Some(number.as_str().to_string());
            report.progresso = (i + 1) as u64;
            info!(number = %number, progress = i + 1, total, "processing case");
            self.emit(report);

            let id = match target.id {
                Some(id) => id,
                None => {
                    self.set_status(report, RunStatus::BuscandoProcesso);
                    match self.resolve_bounded(&number).await? {
                        Ok(id) => {
                            ids.insert(number.as_str().to_string(), id);
                            self.set_status(report, RunStatus::Processando);
                            id
                        }
                        Err(kind) => {
                            report.falha += 1;
                            report.erros.push(kind.describe(number.as_str()));
                            self.set_status(report, RunStatus::Processando);
                            continue;
                        }
                    }
                }
            };

            let outcome = self
                .downloads
                .request_download(id, &number, &opts.doc_type, &dir)
                .await;
            self.classify(report, &number, outcome, &mut pending);
            self.emit(report);
            self.pace().await?;

            if pending.len() >= self.config.batch_size {
                self.ensure_active()?;
                self.set_status(report, RunStatus::BaixandoLote);
                let fetched = self
                    .downloads
                    .wait_for_pending(
                        &pending,
                        &dir,
                        Duration::from_secs(self.config.batch_wait_secs),
                        &self.cancel,
                    )
                    .await;
                self.absorb_files(report, fetched);
                pending.clear();
                self.set_status(report, RunStatus::Processando);
            }
        }

        if opts.wait_for_downloads && !pending.is_empty() {
            self.ensure_active()?;
            report.processo_atual = Some(format!("Aguardando {} downloads", pending.len()));
            self.set_status(report, RunStatus::AguardandoDownloads);
            let fetched = self
                .downloads
                .wait_for_pending(
                    &pending,
                    &dir,
                    Duration::from_secs(self.config.final_wait_secs),
                    &self.cancel,
                )
                .await;
            self.absorb_files(report, fetched);
        }

        self.ensure_active()?;
        report.processo_atual = Some("Verificando arquivos".to_string());
        self.set_status(report, RunStatus::VerificandoIntegridade);

        let mut missing = missing_numbers(&expected, &dir);
        report.integridade = if missing.is_empty() {
            Integrity::Ok
        } else {
            Integrity::Inconsistente
        };
        self.emit(report);

        // Retry rounds reuse cached internal ids; targets that never resolved
        // are out of reach here and stay missing.
        let mut round = 0;
        while !missing.is_empty() && round < self.config.max_retries {
            self.ensure_active()?;
            round += 1;
            report.retries.tentativas = round;
            report.processo_atual = Some(format!(
                "Retry {round}/{} - {} processos",
                self.config.max_retries,
                missing.len()
            ));
            self.set_status(report, RunStatus::Retry(round));
            info!(round, missing = missing.len(), "retry round");

            if sleep_or_cancelled(Duration::from_secs(self.config.retry_delay_secs), &self.cancel)
                .await
            {
                return Err(Cancelled);
            }

            for number_str in missing.clone() {
                self.ensure_active()?;
                let Some(&id) = ids.get(&number_str) else { continue };
                let Some(number) = CaseNumber::parse(&number_str) else { continue };
                report.processo_atual = Some(format!("Retry: {number_str}"));
                self.emit(report);

                let outcome = self
                    .downloads
                    .request_download(id, &number, &opts.doc_type, &dir)
                    .await;
                if outcome.ok {
                    report.retries.processos_reprocessados.push(number_str.clone());
                    if let Some(file) = outcome.file {
                        self.absorb_files(report, vec![file]);
                    }
                }
                self.pace().await?;
            }

            if sleep_or_cancelled(Duration::from_secs(self.config.retry_settle_secs), &self.cancel)
                .await
            {
                return Err(Cancelled);
            }
            let fetched = self
                .downloads
                .wait_for_pending(
                    &missing,
                    &dir,
                    Duration::from_secs(self.config.batch_wait_secs),
                    &self.cancel,
                )
                .await;
            self.absorb_files(report, fetched);

            missing = missing_numbers(&expected, &dir);
            report.integridade = if missing.is_empty() {
                Integrity::Ok
            } else {
                Integrity::Inconsistente
            };
            self.emit(report);
        }

        report.retries.processos_falha_definitiva = missing;
        Ok(())
    }

    /// Race resolution against the configured timeout and the cancel token.
    async fn resolve_bounded(
        &self,
        number: &CaseNumber,
    ) -> Result<Result<i64, FailureKind>, Cancelled> {
        let resolver = self.resolver.clone();
        let input = number.as_str().to_string();
        let mut handle = tokio::spawn(async move { resolver.resolve(&input).await });

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) if result.found => {
                    Ok(result.id.ok_or(FailureKind::NotFound))
                }
                Ok(result) => Ok(Err(result.failure.unwrap_or(FailureKind::NotFound))),
                Err(err) => {
                    warn!(%err, "resolution task aborted");
                    Ok(Err(FailureKind::Request))
                }
            },
            _ = tokio::time::sleep(Duration::from_secs(self.config.search_timeout_secs)) => {
                handle.abort();
                warn!(number = %number, "resolution timed out");
                Ok(Err(FailureKind::Timeout))
            }
            _ = self.cancel.cancelled() => {
                handle.abort();
                Err(Cancelled)
            }
        }
    }

    fn classify(
        &self,
        report: &mut ProcessingReport,
        number: &CaseNumber,
        outcome: DownloadOutcome,
        pending: &mut Vec<String>,
    ) {
        if !outcome.ok {
            report.falha += 1;
            report
                .erros
                .push(format!("Falha ao solicitar download: {number}: {}", outcome.message));
            return;
        }
        match outcome.file {
            Some(file) if file_is_valid(&file) => {
                let path = file.display().to_string();
                if !report.arquivos.contains(&path) {
                    report.arquivos.push(path);
                    report.sucesso += 1;
                }
            }
            _ => pending.push(number.as_str().to_string()),
        }
    }

    fn absorb_files(&self, report: &mut ProcessingReport, files: Vec<PathBuf>) {
        for file in files {
            let path = file.display().to_string();
            if !report.arquivos.contains(&path) {
                report.arquivos.push(path);
                report.sucesso += 1;
            }
        }
    }

    // ── Finalization ───────────────────────────────────────────────────────

    async fn finalize(&self, mut report: ProcessingReport, cancelled: bool) -> ProcessingReport {
        report.arquivos.retain(|path| file_is_valid(Path::new(path)));
        report.sucesso = report.arquivos.len() as u64;
        report.falha = report.processos.saturating_sub(report.sucesso);

        let status = if cancelled {
            RunStatus::Cancelado
        } else if report.integridade == Integrity::Ok {
            RunStatus::Concluido
        } else if !report.retries.processos_falha_definitiva.is_empty() {
            RunStatus::ConcluidoComFalhas
        } else {
            RunStatus::Concluido
        };
        report.finish(status);

        if cancelled {
            if let Some(session) = &self.session {
                if let Err(err) = session.reset_transport() {
                    warn!(%err, "transport reset after cancellation failed");
                }
            }
        }

        self.persist(&report);
        info!(
            status = %report.status.as_str(),
            total = report.processos,
            ok = report.sucesso,
            failed = report.falha,
            "run finished"
        );
        self.emit(&report);
        report
    }

    fn persist(&self, report: &ProcessingReport) {
        if let Err(err) = report.persist(&timestamp_str()) {
            warn!(%err, "could not persist report");
        }
    }
}

// ── Integrity ──────────────────────────────────────────────────────────────

/// Exists, non-empty, and the first byte is readable.
pub fn file_is_valid(path: &Path) -> bool {
    use std::io::Read;
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() || meta.len() == 0 {
        return false;
    }
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).is_ok()
}

fn downloaded_numbers(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut numbers = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_lowercase();
                e == "pdf" || e == "zip"
            })
            .unwrap_or(false);
        if !ext_ok || !file_is_valid(&path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(number) = CaseNumber::from_file_name(name) {
            let number = number.as_str().to_string();
            if !numbers.contains(&number) {
                numbers.push(number);
            }
        }
    }
    numbers
}

/// Expected numbers with no valid file on disk.
pub fn missing_numbers(expected: &[String], dir: &Path) -> Vec<String> {
    let present = downloaded_numbers(dir);
    expected
        .iter()
        .filter(|n| !present.contains(n))
        .cloned()
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_validity_checks() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.pdf");
        std::fs::write(&good, b"%PDF-1.4").unwrap();
        let empty = dir.path().join("b.pdf");
        std::fs::write(&empty, b"").unwrap();

        assert!(file_is_valid(&good));
        assert!(!file_is_valid(&empty));
        assert!(!file_is_valid(&dir.path().join("nope.pdf")));
        assert!(!file_is_valid(dir.path()));
    }

    #[test]
    fn missing_numbers_reconciled_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let a = "0000001-23.2024.8.05.0001";
        let b = "0000002-34.2024.8.05.0001";
        std::fs::write(dir.path().join(format!("{a}-processo.pdf")), b"%PDF").unwrap();
        std::fs::write(dir.path().join("relatorio_x.json"), b"{}").unwrap();
        // Empty files do not count as downloaded.
        std::fs::write(dir.path().join(format!("{b}-processo.pdf")), b"").unwrap();

        let expected = vec![a.to_string(), b.to_string()];
        assert_eq!(missing_numbers(&expected, dir.path()), vec![b.to_string()]);
    }

    #[test]
    fn zip_packages_count_for_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let a = "0000001-23.2024.8.05.0001";
        std::fs::write(dir.path().join(format!("{a}.zip")), b"PK").unwrap();
        assert!(missing_numbers(&[a.to_string()], dir.path()).is_empty());
    }

    #[test]
    fn run_options_defaults() {
        let opts = RunOptions::default();
        assert_eq!(opts.doc_type, "Selecione");
        assert!(opts.wait_for_downloads);
        assert!(opts.limit.is_none());
    }
}
