use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kapsule_app::{Change, ChangeMeta, RecordedApp, RecordedApps};
use kapsule_apply::documents::{label_document, namespaces, parse_documents};
use kapsule_apply::ssa::apply_document;
use kapsule_apply::wait::{wait_for, WaitOpts};
use kapsule_apply::{state_label, waiters};
use kapsule_core::{LabelSelector, Resource};
use kapsule_kubehub::{get_kube_client, ApiResolver, ClusterResources, ConfigMapStore};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kapsulectl", version, about = "Kapsule CLI: deploy and track labelled apps")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace holding app records
    #[arg(long = "ns", global = true, env = "KAPSULE_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List apps
    Ls {
        /// Only apps whose records carry these labels, e.g. "team=web"
        #[arg(long = "labels")]
        labels: Option<LabelSelector>,
    },
    /// Show an app's record and the state of its resources
    Inspect {
        #[arg(short = 'a', long = "app")]
        app: String,
    },
    /// List an app's recorded changes
    Changes {
        #[arg(short = 'a', long = "app")]
        app: String,
        #[command(subcommand)]
        action: Option<ChangesAction>,
    },
    /// Delete an app: its changes, its resources, then its record
    Delete {
        #[arg(short = 'a', long = "app")]
        app: String,
    },
    /// Rename an app record (change history stays under the old name)
    Rename {
        #[arg(short = 'a', long = "app")]
        app: String,
        #[arg(long = "new-name")]
        new_name: String,
    },
    /// Apply a YAML file as an app and wait for it to converge
    Deploy {
        #[arg(short = 'a', long = "app")]
        app: String,
        /// Multi-document YAML file
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Labels to merge into the app record, e.g. "team=web"
        #[arg(long = "labels")]
        labels: Option<LabelSelector>,
        /// Wait for applied resources to converge
        #[arg(long = "wait", action = ArgAction::Set, default_value_t = true)]
        wait: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ChangesAction {
    /// Delete the oldest changes, keeping the app's last change
    Gc {
        /// Number of changes to keep
        #[arg(long = "max", default_value_t = 200)]
        max: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("KAPSULE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

/// Serve Prometheus metrics when `KAPSULE_METRICS_ADDR` is a valid `host:port`.
fn init_metrics() {
    let Ok(raw) = std::env::var("KAPSULE_METRICS_ADDR") else { return };
    let listen: std::net::SocketAddr = match raw.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(addr = %raw, error = %e, "ignoring KAPSULE_METRICS_ADDR; expected host:port");
            return;
        }
    };
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(listen).install() {
        warn!(addr = %listen, error = %e, "metrics exporter not installed");
        return;
    }
    info!(addr = %listen, "serving metrics");
}

/// Cluster-backed collaborators shared by all commands.
struct Ctx {
    namespace: String,
    resolver: Arc<ApiResolver>,
    resources: Arc<ClusterResources>,
    apps: RecordedApps,
}

impl Ctx {
    async fn connect(namespace: &str) -> Result<Self> {
        let client = get_kube_client().await?;
        let resolver = Arc::new(ApiResolver::new(client.clone()).await?);
        let resources = Arc::new(ClusterResources::new(resolver.clone()));
        let store = Arc::new(ConfigMapStore::new(client, namespace));
        let apps = RecordedApps::new(namespace, store, resources.clone());
        Ok(Self { namespace: namespace.to_string(), resolver, resources, apps })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ctx = Ctx::connect(&cli.namespace).await?;

    match cli.command {
        Commands::Ls { labels } => {
            let labels = labels.map(|l| l.terms().clone()).unwrap_or_default();
            info!(ns = %ctx.namespace, labels = ?labels, "ls invoked");
            let apps = ctx.apps.list(&labels).await?;
            let rows: Vec<AppRow> = apps.iter().map(AppRow::from_app).collect();
            match cli.output {
                Output::Human => {
                    println!("{:<24} {:<36} {:<10} {}", "NAME", "LAST CHANGE", "STATUS", "AGE");
                    for r in &rows {
                        println!("{:<24} {:<36} {:<10} {}", r.name, dash(&r.last_change), r.status, render_age(r.last_change_at));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Inspect { app } => {
            info!(app = %app, ns = %ctx.namespace, "inspect invoked");
            let app = ctx.apps.find(&app);
            let meta = app.meta().await?;
            let resources = app.labeled_app().await?.resources().await?;
            let rows: Vec<ResourceRow> = resources.iter().map(|r| ResourceRow::classify(r, &resources)).collect();
            match cli.output {
                Output::Human => {
                    println!("App '{}' (namespace: {})", app.name(), app.namespace());
                    println!("label: {}={}", meta.label_key, meta.label_value);
                    if !meta.last_change_name.is_empty() {
                        println!("last change: {} ({})", meta.last_change_name, meta.last_change.status());
                    }
                    println!();
                    println!("{:<8} {:<10} {}", "STATE", "POLICY", "RESOURCE");
                    for r in &rows {
                        println!("{:<8} {:<10} {}", r.state, dash(r.policy.unwrap_or("")), r.resource);
                        if !r.message.is_empty() {
                            println!("{:<8} {:<10}   ^ {}", "", "", r.message);
                        }
                    }
                }
                Output::Json => {
                    #[derive(Serialize)]
                    struct Inspect<'a> { app: &'a str, namespace: &'a str, meta: &'a kapsule_app::AppMeta, resources: &'a [ResourceRow] }
                    let out = Inspect { app: app.name(), namespace: app.namespace(), meta: &meta, resources: &rows };
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Changes { app, action: Some(ChangesAction::Gc { max }) } => {
            info!(app = %app, max, ns = %ctx.namespace, "changes gc invoked");
            let deleted = ctx.apps.find(&app).gc_changes(max).await?;
            match cli.output {
                Output::Human => println!("deleted {} change(s) of app '{}'", deleted, app),
                Output::Json => println!("{}", serde_json::json!({ "app": app, "deleted": deleted })),
            }
        }
        Commands::Changes { app, action: None } => {
            info!(app = %app, ns = %ctx.namespace, "changes invoked");
            let changes = ctx.apps.find(&app).changes().await?;
            let rows: Vec<ChangeRow> = changes.iter().map(|c| ChangeRow::from_change(c)).collect();
            match cli.output {
                Output::Human => {
                    println!("{:<36} {:<10} {:<8} {}", "NAME", "STATUS", "AGE", "DESCRIPTION");
                    for r in &rows {
                        println!("{:<36} {:<10} {:<8} {}", r.name, r.status, render_age(r.started_at), r.description);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Delete { app } => {
            info!(app = %app, ns = %ctx.namespace, "delete invoked");
            let app = ctx.apps.find(&app);
            if !app.exists().await? {
                eprintln!("App '{}' (namespace: {}) does not exist", app.name(), app.namespace());
                return Ok(());
            }
            app.delete().await?;
            println!("deleted app '{}'", app.name());
        }
        Commands::Rename { app, new_name } => {
            info!(app = %app, new_name = %new_name, ns = %ctx.namespace, "rename invoked");
            ctx.apps.find(&app).rename(&new_name).await?;
            println!("renamed app '{}' to '{}'", app, new_name);
        }
        Commands::Deploy { app, file, labels, wait } => {
            info!(app = %app, file = %file.display(), ns = %ctx.namespace, wait, "deploy invoked");
            let labels = labels.map(|l| l.terms().clone()).unwrap_or_default();
            let summary = deploy(&ctx, ctx.apps.find(&app), &file, &labels, wait, cli.output).await?;
            match cli.output {
                Output::Human => println!("Succeeded: {} ({} resources)", summary.change, summary.resources.len()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
            }
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct DeploySummary {
    app: String,
    change: String,
    resources: Vec<String>,
}

async fn deploy(
    ctx: &Ctx,
    app: RecordedApp,
    file: &Path,
    labels: &BTreeMap<String, String>,
    wait: bool,
    output: Output,
) -> Result<DeploySummary> {
    let yaml = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let mut docs = parse_documents(&yaml)?;
    if docs.is_empty() {
        return Err(anyhow!("no documents found in {}", file.display()));
    }

    app.create_or_update(labels).await?;
    let selector = app.label_selector().await?;
    for doc in docs.iter_mut() {
        for (k, v) in selector.terms() {
            label_document(doc, k, v);
        }
    }

    let nss = namespaces(&docs, &ctx.namespace, |doc| {
        let api_version = doc["apiVersion"].as_str().unwrap_or_default();
        let kind = doc["kind"].as_str().unwrap_or_default();
        // unknown kinds fail at apply; count them as namespaced until then
        ctx.resolver.is_namespaced(api_version, kind).unwrap_or(true)
    });
    let meta = ChangeMeta::new(format!("update: {} resources", docs.len()), nss);
    let mut change = app.begin_change(meta).await?;
    info!(app = %app.name(), change = %change.name(), docs = docs.len(), "change begun");

    match apply_and_wait(ctx, &docs, &selector, wait, output).await {
        Ok(applied) => {
            change.succeed().await?;
            Ok(DeploySummary { app: app.name().to_string(), change: change.name().to_string(), resources: applied })
        }
        Err(e) => {
            if let Err(fail_err) = change.fail().await {
                warn!(change = %change.name(), error = %fail_err, "could not mark change failed");
            }
            Err(e)
        }
    }
}

async fn apply_and_wait(
    ctx: &Ctx,
    docs: &[serde_json::Value],
    selector: &LabelSelector,
    wait: bool,
    output: Output,
) -> Result<Vec<String>> {
    let mut applied: Vec<Resource> = Vec::with_capacity(docs.len());
    for doc in docs {
        let res = apply_document(&ctx.resolver, doc, &ctx.namespace).await?;
        if output == Output::Human {
            println!("applied {}", res.description());
        }
        applied.push(res);
    }
    if !wait {
        return Ok(applied.iter().map(Resource::description).collect());
    }

    let opts = WaitOpts::default();
    for res in &applied {
        let desc = res.description();
        let mut last = String::new();
        let state = wait_for(ctx.resources.as_ref(), res, selector, &opts, |state, msgs| {
            if output == Output::Human && state.message != last {
                println!("{}: waiting on {}: {}", state_label(state), desc, state.message);
                for m in msgs {
                    println!("  {}", m);
                }
                last = state.message.clone();
            }
            debug!(res = %desc, msgs = msgs.len(), "progress");
        })
        .await?;
        if state.terminally_failed() {
            return Err(anyhow!("Resource '{}' failed: {}", desc, state.message));
        }
        if output == Output::Human {
            println!("ok: {}", desc);
        }
    }
    Ok(applied.iter().map(Resource::description).collect())
}

#[derive(Debug, Serialize)]
struct AppRow {
    name: String,
    last_change: String,
    status: String,
    last_change_at: Option<DateTime<Utc>>,
}

impl AppRow {
    fn from_app(app: &RecordedApp) -> Self {
        let meta = app.cached_meta().unwrap_or_default();
        let has_change = !meta.last_change_name.is_empty();
        Self {
            name: app.name().to_string(),
            status: if has_change { meta.last_change.status().to_string() } else { String::new() },
            last_change_at: meta.last_change.finished_at.or(meta.last_change.started_at),
            last_change: meta.last_change_name,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChangeRow {
    name: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    description: String,
    namespaces: Vec<String>,
}

impl ChangeRow {
    fn from_change(c: &dyn Change) -> Self {
        let m = c.meta();
        Self {
            name: c.name().to_string(),
            status: c.status().to_string(),
            started_at: m.started_at,
            finished_at: m.finished_at,
            description: m.description.clone(),
            namespaces: m.namespaces.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ResourceRow {
    resource: String,
    state: &'static str,
    policy: Option<&'static str>,
    message: String,
}

impl ResourceRow {
    /// Kind policy verdict for `res`; kinds without a policy count as ok.
    fn classify(res: &Resource, all: &[Resource]) -> Self {
        let state = waiters::classify(res, all).unwrap_or_else(kapsule_apply::DoneApplyState::ok);
        Self {
            resource: res.description(),
            state: state_label(&state),
            policy: waiters::policy_name(res),
            message: state.message,
        }
    }
}

fn dash(s: &str) -> &str {
    if s.is_empty() { "-" } else { s }
}

fn render_age(ts: Option<DateTime<Utc>>) -> String {
    let Some(ts) = ts else { return "-".to_string() };
    let mut secs = (Utc::now() - ts).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn deploy_args_parse() {
        let cli = Cli::try_parse_from(["kapsulectl", "--ns", "apps", "deploy", "-a", "web", "-f", "web.yaml", "--labels", "team=a"]).unwrap();
        assert_eq!(cli.namespace, "apps");
        match cli.command {
            Commands::Deploy { app, labels, wait, .. } => {
                assert_eq!(app, "web");
                assert!(wait);
                assert_eq!(labels.unwrap().to_string(), "team=a");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["kapsulectl", "deploy", "-a", "web", "-f", "x", "--labels", "oops"]).is_err());
    }

    #[test]
    fn changes_gc_args_parse() {
        let cli = Cli::try_parse_from(["kapsulectl", "changes", "-a", "web", "gc", "--max", "3"]).unwrap();
        match cli.command {
            Commands::Changes { app, action: Some(ChangesAction::Gc { max }) } => {
                assert_eq!(app, "web");
                assert_eq!(max, 3);
            }
            other => panic!("unexpected command {:?}", other),
        }
        let cli = Cli::try_parse_from(["kapsulectl", "changes", "-a", "web"]).unwrap();
        assert!(matches!(cli.command, Commands::Changes { action: None, .. }));
    }

    #[test]
    fn render_age_buckets() {
        assert_eq!(render_age(None), "-");
        assert_eq!(render_age(Some(Utc::now() - chrono::Duration::minutes(5))), "5m");
        assert_eq!(render_age(Some(Utc::now() - chrono::Duration::hours(50))), "2d2h");
    }

    #[test]
    fn resource_rows_default_to_ok_without_policy() {
        let cm = Resource::new(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c", "namespace": "ns" } }));
        let row = ResourceRow::classify(&cm, &[]);
        assert_eq!(row.state, "ok");
        assert!(row.policy.is_none());

        let job = Resource::new(json!({ "apiVersion": "batch/v1", "kind": "Job", "metadata": { "name": "j", "namespace": "ns" }, "status": { "active": 1 } }));
        let row = ResourceRow::classify(&job, &[]);
        assert_eq!(row.state, "ongoing");
        assert_eq!(row.policy, Some("job"));
    }
}
