use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use konverge_apply::{
    compute_set_id, ApplyResult, ApplySet, ApplySetConfig, ApplySetError, ApplySetTooling, ApplyableObject,
    KubeStore, MappingResolver,
};
use konverge_core::{parse_gvk_key, GroupKind};
use kube::core::{DynamicObject, ObjectMeta, TypeMeta};
use tracing::info;

mod manifest;
mod report;

use report::PassReport;

#[derive(Parser, Debug)]
#[command(name = "konvergectl", version, about = "Set-based apply and prune")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the owner; also the default for namespaced manifests without one
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(clap::Args, Debug, Clone)]
struct OwnerArgs {
    /// Owner GVK key, e.g. "v1/Secret" or "example.com/v1/Bundle"
    #[arg(long = "owner")]
    owner: String,
    /// Owner object name
    #[arg(long = "owner-name")]
    owner_name: String,
}

#[derive(clap::Args, Debug)]
struct ApplyArgs {
    #[command(flatten)]
    owner: OwnerArgs,
    /// Manifest files or directories
    #[arg(short = 'f', long = "filename", required = true)]
    files: Vec<PathBuf>,
    /// Delete set members that are not in the manifests
    #[arg(long = "prune", action = ArgAction::SetTrue)]
    prune: bool,
    /// Ask the server to validate without persisting
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
    #[arg(long = "field-manager", env = "KONVERGE_FIELD_MANAGER", default_value = "konvergectl")]
    field_manager: String,
    /// Extra label stamped on every object, as key=value (repeatable)
    #[arg(long = "tool-label", value_parser = parse_label)]
    tool_labels: Vec<(String, String)>,
    /// Stop the pass after this many seconds, reporting what was done so far
    #[arg(long = "timeout-secs")]
    timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply manifests as one set, optionally pruning what the set no longer contains
    Apply(ApplyArgs),
    /// Print the set id for an owner
    Id {
        #[command(flatten)]
        owner: OwnerArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("KONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}

/// Owner skeleton from CLI arguments; the engine reads the live copy itself.
fn owner_object(args: &OwnerArgs, namespace: Option<&str>) -> Result<DynamicObject> {
    let (group, version, kind) = parse_gvk_key(&args.owner).map_err(|e| anyhow!("--owner: {e}"))?;
    let api_version = if group.is_empty() { version } else { format!("{group}/{version}") };
    Ok(DynamicObject {
        types: Some(TypeMeta { api_version, kind }),
        metadata: ObjectMeta {
            name: Some(args.owner_name.clone()),
            namespace: namespace.map(str::to_string),
            ..Default::default()
        },
        data: serde_json::json!({}),
    })
}

fn set_id_for(args: &OwnerArgs, namespace: Option<&str>) -> Result<String> {
    let (group, _version, kind) = parse_gvk_key(&args.owner).map_err(|e| anyhow!("--owner: {e}"))?;
    Ok(compute_set_id(&args.owner_name, namespace.unwrap_or_default(), &kind, &group))
}

/// Fill in `default_ns` for namespaced objects that carry no namespace.
async fn default_namespace(
    resolver: &dyn MappingResolver,
    obj: &mut DynamicObject,
    default_ns: Option<&str>,
) -> Result<()> {
    let Some(ns) = default_ns else { return Ok(()) };
    if obj.metadata.namespace.as_deref().is_some_and(|s| !s.is_empty()) {
        return Ok(());
    }
    let Some(types) = obj.types.as_ref() else { return Ok(()) };
    let (group, version) = konverge_core::split_api_version(&types.api_version);
    let gk = GroupKind::new(group, types.kind.clone());
    let mapping = resolver.resolve(&gk, Some(version.as_str())).await?;
    if mapping.is_some_and(|m| m.namespaced()) {
        obj.metadata.namespace = Some(ns.to_string());
    }
    Ok(())
}

/// Run one pass; a fatal error still yields the outcomes recorded before it.
async fn converge(
    set: &mut ApplySet,
    prune: bool,
    dry_run: bool,
    timeout_secs: Option<u64>,
) -> (ApplyResult, Option<ApplySetError>) {
    let deadline = timeout_secs.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let outcome = match (deadline, dry_run) {
        (Some(at), true) => set.dry_run_until(prune, at).await,
        (Some(at), false) => set.apply_until(prune, at).await,
        (None, true) => set.dry_run(prune).await,
        (None, false) => set.apply(prune).await,
    };
    match outcome {
        Ok(result) => (result, None),
        Err(aborted) => (aborted.result, Some(aborted.error)),
    }
}

async fn run_apply(args: ApplyArgs, namespace: Option<String>, output: Output) -> Result<()> {
    let ApplyArgs { owner: owner_args, files, prune, dry_run, field_manager, tool_labels, timeout_secs } = args;
    let limits = manifest::Limits::from_env();
    let mut objects = Vec::new();
    for path in manifest::expand_paths(&files)? {
        objects.extend(manifest::load_file(&path, limits)?);
    }
    info!(objects = objects.len(), prune, dry_run, "manifests loaded");

    let store = Arc::new(KubeStore::try_default().await.context("connecting to cluster")?);
    let mut config = ApplySetConfig::new(field_manager, ApplySetTooling::new("konvergectl", env!("CARGO_PKG_VERSION")));
    for (k, v) in tool_labels {
        config = config.with_tool_label(k, v);
    }
    let owner = owner_object(&owner_args, namespace.as_deref())?;
    let mut set = ApplySet::new(owner, store.clone(), store.clone(), config).await?;

    for (idx, mut obj) in objects.into_iter().enumerate() {
        default_namespace(store.as_ref(), &mut obj, namespace.as_deref()).await?;
        let id = format!("{idx}:{}", obj.metadata.name.as_deref().unwrap_or_default());
        set.add(ApplyableObject::new(id, obj)).await?;
    }

    let (result, fatal) = converge(&mut set, prune, dry_run, timeout_secs).await;
    let report = PassReport::new(set.set_id(), dry_run, &result);
    match output {
        Output::Human => report.human_lines().iter().for_each(|l| println!("{l}")),
        Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if let Some(e) = fatal {
        let hint = if matches!(e, ApplySetError::DeadlineExceeded { .. }) { "; re-run to converge" } else { "" };
        return Err(anyhow::Error::new(e).context(format!("apply pass aborted{hint}")));
    }
    let mut problems = Vec::new();
    if let Err(e) = result.apply_errors() {
        problems.push(e.to_string());
    }
    if let Err(e) = result.prune_errors() {
        problems.push(e.to_string());
    }
    if !problems.is_empty() {
        return Err(anyhow!(problems.join("\n")));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply(args) => run_apply(args, cli.namespace, cli.output).await?,
        Commands::Id { owner } => {
            let id = set_id_for(&owner, cli.namespace.as_deref())?;
            match cli.output {
                Output::Human => println!("{id}"),
                Output::Json => println!("{}", serde_json::json!({ "set_id": id })),
            }
        }
    }
    Ok(())
}
