//! siteplane - deploy and manage sites on this host
//!
//! Usage:
//!   siteplane [--config <path>] <command>
//!
//!   deploy <dir> --domain <domain> [--kind process|container] [--name <name>]
//!          [--port <port>] [--alias <domain>]... [--tls]
//!   delete <name>
//!   import <name> <dump.sql> [--rewrite <from> <to>]
//!   list
//!   status <name>
//!   audit [<name>] [--limit <n>]
//!   reconcile
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result};
use serde::Serialize;
use siteplane::audit::DEFAULT_QUERY_LIMIT;
use siteplane::config::Config;
use siteplane::site::{DeleteRequest, DeployRequest, ImportRequest, SiteKind};
use siteplane::{Pipeline, PipelineError, PKG_NAME, VERSION};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Directories never shipped as site files
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules"];

#[derive(Debug)]
enum Command {
    Deploy(DeployOptions),
    Delete { name: String },
    Import(ImportOptions),
    List,
    Status { name: String },
    Audit { name: Option<String>, limit: usize },
    Reconcile,
    Help,
    Version,
}

#[derive(Debug)]
struct DeployOptions {
    dir: PathBuf,
    domain: String,
    kind: SiteKind,
    name: Option<String>,
    port: Option<u16>,
    aliases: Vec<String>,
    tls: bool,
}

#[derive(Debug)]
struct ImportOptions {
    name: String,
    dump: PathBuf,
    rewrite: Option<(String, String)>,
}

/// How a CLI invocation ended
enum Failure {
    Usage(String),
    Setup(anyhow::Error),
    Pipeline(PipelineError),
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Failure::Setup(err)
    }
}

impl From<PipelineError> for Failure {
    fn from(err: PipelineError) -> Self {
        Failure::Pipeline(err)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("siteplane=info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let code = match run(args).await {
        Ok(()) => 0,
        Err(Failure::Usage(message)) => {
            eprintln!("Error: {}\n", message);
            print_help();
            2
        }
        Err(Failure::Setup(e)) => {
            eprintln!("Error: {:#}", e);
            1
        }
        Err(Failure::Pipeline(e)) => {
            println!("{{\"error\":{}}}", e.to_json());
            e.kind.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(args: Vec<String>) -> Result<(), Failure> {
    let (config_path, args) = take_config_flag(args).map_err(Failure::Usage)?;
    let command = parse_command(&args).map_err(Failure::Usage)?;

    match command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("{} {}", PKG_NAME, VERSION);
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(config_path)?;
    let pipeline = Pipeline::from_config(&config)?;

    match command {
        Command::Deploy(opts) => {
            let files = read_site_files(&opts.dir)?;
            info!(dir = %opts.dir.display(), files = files.len(), "Read site files");
            let request = DeployRequest {
                name: opts.name,
                kind: opts.kind,
                files,
                domain: opts.domain,
                preferred_port: opts.port,
                aliases: opts.aliases,
                tls: opts.tls,
            };
            print_json(&pipeline.deploy(request).await?)?;
        }
        Command::Delete { name } => {
            print_json(&pipeline.delete(DeleteRequest { site_name: name }).await?)?;
        }
        Command::Import(opts) => {
            let request = ImportRequest {
                site_name: opts.name,
                dump_path: opts.dump,
                rewrite_urls: opts.rewrite,
            };
            print_json(&pipeline.import(request).await?)?;
        }
        Command::List => print_json(&pipeline.list()?)?,
        Command::Status { name } => print_json(&pipeline.status(&name).await?)?,
        Command::Audit { name, limit } => {
            print_json(&pipeline.audit(name.as_deref(), limit)?)?;
        }
        Command::Reconcile => print_json(&pipeline.reconcile().await?)?,
        Command::Help | Command::Version => {}
    }

    Ok(())
}

fn load_config(explicit: Option<PathBuf>) -> Result<Config> {
    match Config::resolve_path(explicit) {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            info!(path = %path.display(), "Configuration loaded");
            Ok(config)
        }
        None => {
            debug!("No configuration file found, using defaults");
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
    println!("{}", json);
    Ok(())
}

/// Read every text file under `dir` into a relative path -> content map
fn read_site_files(dir: &Path) -> Result<BTreeMap<String, String>> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }

    let mut files = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("Failed to read directory {}", current.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                let skipped = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| SKIPPED_DIRS.contains(&n))
                    .unwrap_or(false);
                if !skipped {
                    pending.push(path);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let relative = path
                .strip_prefix(dir)
                .with_context(|| format!("{} escapes {}", path.display(), dir.display()))?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {} as UTF-8 text", path.display()))?;
            files.insert(key, content);
        }
    }

    Ok(files)
}

/// Pull `--config <path>` out of the arguments, wherever it appears
fn take_config_flag(args: Vec<String>) -> Result<(Option<PathBuf>, Vec<String>), String> {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let path = iter.next().ok_or("--config requires a path")?;
            config = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }

    Ok((config, rest))
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };
    let rest = &args[1..];

    match first.as_str() {
        "deploy" => parse_deploy_command(rest),
        "delete" | "rm" => Ok(Command::Delete {
            name: single_positional(rest, "delete <name>")?,
        }),
        "import" => parse_import_command(rest),
        "list" | "ls" => Ok(Command::List),
        "status" => Ok(Command::Status {
            name: single_positional(rest, "status <name>")?,
        }),
        "audit" => parse_audit_command(rest),
        "reconcile" => Ok(Command::Reconcile),
        "help" | "--help" | "-h" => Ok(Command::Help),
        "version" | "--version" | "-V" => Ok(Command::Version),
        other => Err(format!("unknown command '{}'", other)),
    }
}

fn next_value<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<String, String> {
    iter.next()
        .cloned()
        .ok_or_else(|| format!("{} requires a value", flag))
}

fn single_positional(args: &[String], usage: &str) -> Result<String, String> {
    match args {
        [name] if !name.starts_with('-') => Ok(name.clone()),
        _ => Err(format!("usage: siteplane {}", usage)),
    }
}

fn parse_deploy_command(args: &[String]) -> Result<Command, String> {
    let mut dir = None;
    let mut domain = None;
    let mut kind = SiteKind::Process;
    let mut name = None;
    let mut port = None;
    let mut aliases = Vec::new();
    let mut tls = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--domain" | "-d" => domain = Some(next_value(&mut iter, arg)?),
            "--kind" | "-k" => kind = next_value(&mut iter, arg)?.parse()?,
            "--name" | "-n" => name = Some(next_value(&mut iter, arg)?),
            "--port" | "-p" => {
                let value = next_value(&mut iter, arg)?;
                port = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| format!("invalid port '{}'", value))?,
                );
            }
            "--alias" | "-a" => aliases.push(next_value(&mut iter, arg)?),
            "--tls" => tls = true,
            other if other.starts_with('-') => return Err(format!("unknown option '{}'", other)),
            other if dir.is_none() => dir = Some(PathBuf::from(other)),
            other => return Err(format!("unexpected argument '{}'", other)),
        }
    }

    Ok(Command::Deploy(DeployOptions {
        dir: dir.unwrap_or_else(|| PathBuf::from(".")),
        domain: domain.ok_or("deploy requires --domain")?,
        kind,
        name,
        port,
        aliases,
        tls,
    }))
}

fn parse_import_command(args: &[String]) -> Result<Command, String> {
    let mut positional = Vec::new();
    let mut rewrite = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rewrite" | "-r" => {
                let from = next_value(&mut iter, arg)?;
                let to = next_value(&mut iter, arg)?;
                rewrite = Some((from, to));
            }
            other if other.starts_with('-') => return Err(format!("unknown option '{}'", other)),
            other => positional.push(other.to_string()),
        }
    }

    match <[String; 2]>::try_from(positional) {
        Ok([name, dump]) => Ok(Command::Import(ImportOptions {
            name,
            dump: PathBuf::from(dump),
            rewrite,
        })),
        Err(_) => Err("usage: siteplane import <name> <dump.sql> [--rewrite <from> <to>]".to_string()),
    }
}

fn parse_audit_command(args: &[String]) -> Result<Command, String> {
    let mut name = None;
    let mut limit = DEFAULT_QUERY_LIMIT;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--limit" | "-l" => {
                let value = next_value(&mut iter, arg)?;
                limit = value
                    .parse()
                    .map_err(|_| format!("invalid limit '{}'", value))?;
            }
            other if other.starts_with('-') => return Err(format!("unknown option '{}'", other)),
            other if name.is_none() => name = Some(other.to_string()),
            other => return Err(format!("unexpected argument '{}'", other)),
        }
    }

    Ok(Command::Audit { name, limit })
}

fn print_help() {
    eprintln!(
        r#"{} {} - deploy and manage sites on this host

USAGE:
    siteplane [--config <path>] <command>

COMMANDS:
    deploy <dir>      Deploy the files in <dir> (default: current directory)
        --domain, -d <domain>     Primary domain (required)
        --kind, -k <kind>         process (default) or container
        --name, -n <name>         Site name (default: derived from domain)
        --port, -p <port>         Preferred port
        --alias, -a <domain>      Additional domain, repeatable
        --tls                     Serve HTTPS with certificates from cert_dir
    delete <name>     Remove a site's rule, workload, files and port
    import <name> <dump.sql>
        --rewrite, -r <from> <to> Rewrite URLs after loading the dump
    list              List all sites
    status <name>     Show a site with its live workload status
    audit [<name>]    Show deployment records, newest first
        --limit, -l <n>           Maximum records (default: {})
    reconcile         Repair interrupted runs and report drift

Config is read from --config, $SITEPLANE_CONFIG, /etc/siteplane/config.toml
or the user config directory. Logs go to stderr (RUST_LOG overrides)."#,
        PKG_NAME, VERSION, DEFAULT_QUERY_LIMIT
    );
}
