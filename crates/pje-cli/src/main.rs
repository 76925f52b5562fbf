use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pje_core::{
    resolve_credentials, EngineConfig, ProcessingReport, RunStatus, SessionClient, SessionStore,
};
use pje_services::{
    AuthService, DirectoryService, DownloadService, Processor, ResolutionService, RunOptions,
};

// ── CLI surface ───────────────────────────────────────────────────────────

enum Command {
    Help,
    Task { name: String, favourites: bool },
    Tag { name: String },
    Subject { query: String },
    Numbers { numbers: Vec<String> },
    Profiles,
    DocTypes,
}

struct Cli {
    command: Command,
    user: Option<String>,
    password: Option<String>,
    profile: Option<String>,
    doc_type: String,
    limit: Option<usize>,
    ignored_queues: Vec<String>,
    no_wait: bool,
    force_login: bool,
}

const USAGE: &str = "\
pje-cli - baixa autos digitais do PJe em lote

Uso:
  pje-cli tarefa <nome> [opcoes]        processa uma tarefa do painel
  pje-cli etiqueta <nome> [opcoes]      processa os processos de uma etiqueta
  pje-cli assunto <texto> [opcoes]      processa um agrupamento por assunto
  pje-cli numero <n1> [n2 ...]          processa numeros CNJ avulsos
  pje-cli perfis                        lista os perfis disponiveis
  pje-cli tipos                         lista os tipos de documento

Opcoes:
  --usuario <login>       credencial (ou PJE_USER / USER no ambiente)
  --senha <senha>         credencial (ou PJE_PASSWORD / PASSWORD)
  --perfil <nome>         seleciona um perfil antes de processar
  --favoritas             busca a tarefa entre as favoritas
  --tipo-documento <t>    filtro de tipo de documento (padrao: todos)
  --limite <n>            limita a quantidade de processos
  --ignorar-tarefa <nome> exclui uma tarefa do agrupamento por assunto
  --sem-espera            nao aguarda downloads pendentes ao final
  --forcar-login          ignora a sessao persistida
";

fn parse_args(args: Vec<String>) -> Result<Cli> {
    let mut positional = Vec::new();
    let mut user = None;
    let mut password = None;
    let mut profile = None;
    let mut doc_type = "Selecione".to_string();
    let mut limit = None;
    let mut ignored_queues = Vec::new();
    let mut favourites = false;
    let mut no_wait = false;
    let mut force_login = false;

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--usuario" => user = Some(value(&mut it, "--usuario")?),
            "--senha" => password = Some(value(&mut it, "--senha")?),
            "--perfil" => profile = Some(value(&mut it, "--perfil")?),
            "--tipo-documento" => doc_type = value(&mut it, "--tipo-documento")?,
            "--limite" => {
                let raw = value(&mut it, "--limite")?;
                limit = Some(raw.parse().with_context(|| format!("limite invalido: {raw}"))?);
            }
            "--ignorar-tarefa" => ignored_queues.push(value(&mut it, "--ignorar-tarefa")?),
            "--favoritas" => favourites = true,
            "--sem-espera" => no_wait = true,
            "--forcar-login" => force_login = true,
            // An explicit help request is not an error: short-circuit so the
            // usage goes to stdout and the process exits 0.
            "-h" | "--help" => {
                return Ok(Cli {
                    command: Command::Help,
                    user: None,
                    password: None,
                    profile: None,
                    doc_type,
                    limit: None,
                    ignored_queues: Vec::new(),
                    no_wait: false,
                    force_login: false,
                })
            }
            other if other.starts_with("--") => bail!("opcao desconhecida: {other}\n\n{USAGE}"),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("tarefa") => Command::Task {
            name: required(positional.next(), "tarefa <nome>")?,
            favourites,
        },
        Some("etiqueta") => Command::Tag { name: required(positional.next(), "etiqueta <nome>")? },
        Some("assunto") => Command::Subject {
            query: required(positional.next(), "assunto <texto>")?,
        },
        Some("numero") => {
            let numbers: Vec<String> = positional.collect();
            if numbers.is_empty() {
                bail!("informe ao menos um numero de processo\n\n{USAGE}");
            }
            Command::Numbers { numbers }
        }
        Some("perfis") => Command::Profiles,
        Some("tipos") => Command::DocTypes,
        Some(other) => bail!("comando desconhecido: {other}\n\n{USAGE}"),
        None => bail!("{USAGE}"),
    };

    Ok(Cli {
        command,
        user,
        password,
        profile,
        doc_type,
        limit,
        ignored_queues,
        no_wait,
        force_login,
    })
}

fn value(it: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    it.next().with_context(|| format!("{flag} exige um valor"))
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    value.with_context(|| format!("uso: pje-cli {what}"))
}

// ── Progress output ───────────────────────────────────────────────────────

fn print_snapshot(snapshot: &ProcessingReport) {
    let current = snapshot.processo_atual.as_deref().unwrap_or("");
    println!(
        "[{}] {}/{} ok={} falha={} {}",
        snapshot.status.as_str(),
        snapshot.progresso,
        snapshot.processos,
        snapshot.sucesso,
        snapshot.falha,
        current
    );
}

fn print_summary(report: &ProcessingReport) {
    println!();
    println!("status:      {}", report.status.as_str());
    println!("diretorio:   {}", report.diretorio);
    println!("processos:   {}", report.processos);
    println!("sucesso:     {}", report.sucesso);
    println!("falha:       {}", report.falha);
    if !report.retries.processos_falha_definitiva.is_empty() {
        println!("sem arquivo: {}", report.retries.processos_falha_definitiva.join(", "));
    }
    for erro in &report.erros {
        println!("erro:        {erro}");
    }
}

// ── main ──────────────────────────────────────────────────────────────────

/// Console logging plus, when the log dir is writable, a plain-text file log.
fn init_logging(config: &EngineConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pje_cli=info,pje_services=info,pje_core=warn".into());

    let file = std::fs::create_dir_all(&config.log_dir).ok().and_then(|()| {
        let name = format!("pje_{}.log", pje_core::scrape::timestamp_str());
        std::fs::File::create(config.log_dir.join(name)).ok()
    });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    match file {
        Some(file) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
            .init(),
        None => registry.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args(std::env::args().skip(1).collect())?;

    if let Command::Help = cli.command {
        print!("{USAGE}");
        return Ok(());
    }
    if let Command::DocTypes = cli.command {
        for (name, code) in pje_core::types::DOC_TYPES {
            println!("{code:>4}  {name}");
        }
        return Ok(());
    }

    let config = EngineConfig::from_env();
    init_logging(&config);
    std::fs::create_dir_all(&config.download_dir)
        .with_context(|| format!("criando {}", config.download_dir.display()))?;
    std::fs::create_dir_all(&config.session_dir)
        .with_context(|| format!("criando {}", config.session_dir.display()))?;

    let Some((username, secret)) = resolve_credentials(cli.user.clone(), cli.password.clone())
    else {
        bail!("credenciais ausentes: use --usuario/--senha ou PJE_USER/PJE_PASSWORD");
    };

    let client = Arc::new(SessionClient::new(config.clone())?);
    let auth = AuthService::new(Arc::clone(&client), SessionStore::new(&config.session_dir));

    let mut logged_in = auth.login(&username, &secret, cli.force_login).await;
    if !logged_in && auth.session_corrupted() {
        auth.reset_session();
        logged_in = auth.login(&username, &secret, true).await;
    }
    if !logged_in {
        bail!("autenticacao falhou para {username}");
    }
    info!(user = %username, "sessao ativa");

    if let Command::Profiles = cli.command {
        let profiles = auth.list_profiles().await;
        if profiles.is_empty() {
            println!("nenhum perfil disponivel");
        }
        for profile in profiles {
            println!("{:>3}  {}", profile.index, profile.full_name());
        }
        return Ok(());
    }

    let directory = Arc::new(DirectoryService::new(Arc::clone(&client)));

    if let Some(name) = &cli.profile {
        if !auth.select_profile(name).await {
            bail!("perfil nao encontrado: {name}");
        }
        directory.clear_cache();
        info!(profile = %name, "perfil selecionado");
    }
    if !cli.ignored_queues.is_empty() {
        directory.set_ignored_queues(&cli.ignored_queues);
    }

    let resolver = Arc::new(ResolutionService::new(Arc::clone(&client)));
    let downloads = Arc::new(DownloadService::new(Arc::clone(&client)));

    let (tx, mut rx) = mpsc::unbounded_channel::<ProcessingReport>();
    let printer = tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            print_snapshot(&snapshot);
        }
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupcao recebida, finalizando com seguranca");
                cancel.cancel();
            }
        });
    }

    let processor = Processor::new(
        config,
        resolver,
        downloads,
        directory,
        tx,
        cancel,
    )
    .with_session(Arc::clone(&client));

    let opts = RunOptions {
        doc_type: cli.doc_type.clone(),
        wait_for_downloads: !cli.no_wait,
        limit: cli.limit,
    };

    let report = match &cli.command {
        Command::Task { name, favourites } => {
            processor.run_by_task(name, *favourites, &opts).await
        }
        Command::Tag { name } => processor.run_by_tag(name, &opts).await,
        Command::Subject { query } => processor.run_by_subject(query, &opts).await,
        Command::Numbers { numbers } => processor.run_by_numbers(numbers, &opts).await,
        Command::Help | Command::Profiles | Command::DocTypes => unreachable!(),
    };

    // The processor owns the last progress sender; drop it so the printer
    // task sees the channel close and drains.
    drop(processor);
    let _ = printer.await;
    print_summary(&report);

    if report.status == RunStatus::Erro {
        std::process::exit(1);
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn parses_task_with_flags() {
        let cli = parse_args(args(&[
            "tarefa",
            "Minutar sentenca",
            "--favoritas",
            "--limite",
            "5",
            "--tipo-documento",
            "sentenca",
        ]))
        .unwrap();
        match cli.command {
            Command::Task { name, favourites } => {
                assert_eq!(name, "Minutar sentenca");
                assert!(favourites);
            }
            _ => panic!("wrong command"),
        }
        assert_eq!(cli.limit, Some(5));
        assert_eq!(cli.doc_type, "sentenca");
    }

    #[test]
    fn parses_numbers_list() {
        let cli = parse_args(args(&["numero", "0000001-23.2024.8.05.0001", "00000023420248050001"]))
            .unwrap();
        match cli.command {
            Command::Numbers { numbers } => assert_eq!(numbers.len(), 2),
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn rejects_unknown_command_and_flags() {
        assert!(parse_args(args(&["inexistente"])).is_err());
        assert!(parse_args(args(&["tarefa", "x", "--nope"])).is_err());
        assert!(parse_args(args(&["numero"])).is_err());
        assert!(parse_args(args(&[])).is_err());
    }

    #[test]
    fn help_is_a_command_not_an_error() {
        for flags in [&["-h"][..], &["--help"][..], &["tarefa", "x", "--help"][..]] {
            let cli = parse_args(args(flags)).unwrap();
            assert!(matches!(cli.command, Command::Help));
        }
    }

    #[test]
    fn credentials_flags_pass_through() {
        let cli = parse_args(args(&["tarefa", "x", "--usuario", "u", "--senha", "s"])).unwrap();
        assert_eq!(cli.user.as_deref(), Some("u"));
        assert_eq!(cli.password.as_deref(), Some("s"));
        assert!(!cli.force_login);
    }
}
