use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use cachet_api::{
    ApplyResourceChangeRequest, CacheProvider, InProcProvider, KeepersPolicy, PlanResourceChangeRequest,
    ProviderConfig, UpgradeResourceStateRequest, ValidateResourceTypeConfigRequest,
};
use cachet_apply::{system_clock, Clock, FixedClock, PlanAction};
use cachet_codec::{DynamicValue, StateCodec};
use cachet_core::{has_errors, Diagnostic, Type};
use cachet_schema::CACHE_STORE;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::info;

mod doc;

#[derive(Parser, Debug)]
#[command(name = "cachetctl", version, about = "Cachet CLI: drive cache_store records through plan/apply")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// What planning does when keepers change (noop|replace)
    #[arg(long = "keepers-policy", global = true, env = "CACHET_KEEPERS_POLICY")]
    keepers_policy: Option<String>,

    /// Resource type name
    #[arg(long = "type", global = true, default_value = CACHE_STORE)]
    type_name: String,

    /// Pin the apply clock to this unix time (seconds)
    #[arg(long = "now", global = true)]
    now: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the provider schema
    Schema,
    /// Validate a configuration document
    Validate {
        /// JSON or YAML file ("-" for stdin)
        config: PathBuf,
    },
    /// Plan a change; omit --proposed to plan a destroy
    Plan {
        #[arg(long = "proposed")]
        proposed: Option<PathBuf>,
        #[arg(long = "prior")]
        prior: Option<PathBuf>,
    },
    /// Apply a planned state; omit --planned to apply a destroy
    Apply {
        #[arg(long = "planned")]
        planned: Option<PathBuf>,
        #[arg(long = "prior")]
        prior: Option<PathBuf>,
    },
    /// Upgrade stored state to the latest schema version
    Upgrade {
        /// Stored state, JSON or YAML
        state: PathBuf,
        /// Schema version the state was recorded under
        #[arg(long = "from-version")]
        from_version: i64,
    },
    /// Plan and apply in one go
    Run {
        #[arg(long = "proposed")]
        proposed: Option<PathBuf>,
        #[arg(long = "prior")]
        prior: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("CACHET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CACHET_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CACHET_METRICS_ADDR; expected host:port");
        }
    }
}

struct Session {
    provider: InProcProvider,
    codec: StateCodec,
    type_name: String,
    output: Output,
}

impl Session {
    fn record_type(&self) -> Result<Type> {
        self.provider.schemas().resource_type(&self.type_name).map_err(|e| anyhow!(e))
    }

    fn load(&self, path: &Path) -> Result<Json> {
        let text = if path == Path::new("-") {
            let mut s = String::new();
            std::io::stdin().read_to_string(&mut s).context("reading stdin")?;
            s
        } else {
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
        };
        doc::parse_document(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Load a document and encode it as a boundary value of the record type.
    fn load_state(&self, path: Option<&Path>) -> Result<Option<DynamicValue>> {
        let Some(path) = path else { return Ok(None) };
        let value = doc::to_value(self.load(path)?);
        let dv = self.codec.encode(&value, &self.record_type()?).with_context(|| format!("encoding {}", path.display()))?;
        Ok(Some(dv))
    }

    fn render_state(&self, dv: Option<&DynamicValue>) -> Result<Json> {
        match dv {
            None => Ok(Json::Null),
            Some(dv) => Ok(doc::to_document(&self.codec.decode(dv, &self.record_type()?)?)),
        }
    }

    fn print<T: Serialize>(&self, out: &T, human: impl FnOnce()) -> Result<()> {
        match self.output {
            Output::Human => human(),
            Output::Json => println!("{}", serde_json::to_string_pretty(out)?),
        }
        Ok(())
    }
}

/// Print diagnostics to stderr; fail when any is an error.
fn check(diags: &[Diagnostic]) -> Result<()> {
    for d in diags {
        eprintln!("{}", d);
    }
    if has_errors(diags) {
        bail!("{} error diagnostic(s)", diags.iter().filter(|d| d.is_error()).count());
    }
    Ok(())
}

#[derive(Serialize)]
struct PlanOutput {
    action: Option<PlanAction>,
    planned_state: Json,
    requires_replace: Vec<String>,
    adds: usize,
    updates: usize,
    removes: usize,
    diagnostics: Vec<Diagnostic>,
}

#[derive(Serialize)]
struct StateOutput {
    state: Json,
    diagnostics: Vec<Diagnostic>,
}

async fn plan(s: &Session, proposed: Option<&Path>, prior: Option<&Path>) -> Result<(Option<DynamicValue>, Option<DynamicValue>)> {
    let proposed = s.load_state(proposed)?;
    let prior = s.load_state(prior)?;
    let resp = s
        .provider
        .plan_resource_change(PlanResourceChangeRequest {
            type_name: s.type_name.clone(),
            prior_state: prior.clone(),
            proposed_new_state: proposed.clone(),
            config: proposed,
            prior_private: Vec::new(),
        })
        .await?;
    let out = PlanOutput {
        action: resp.action,
        planned_state: s.render_state(resp.planned_state.as_ref())?,
        requires_replace: resp.requires_replace.iter().map(ToString::to_string).collect(),
        adds: resp.summary.adds,
        updates: resp.summary.updates,
        removes: resp.summary.removes,
        diagnostics: resp.diagnostics.clone(),
    };
    s.print(&out, || {
        if let Some(action) = out.action {
            println!("plan: {} (+{} ~{} -{})", action, out.adds, out.updates, out.removes);
        }
        if !out.requires_replace.is_empty() {
            println!("  requires replace: {}", out.requires_replace.join(", "));
        }
        if !out.planned_state.is_null() {
            println!("{}", serde_json::to_string_pretty(&out.planned_state).unwrap_or_default());
        }
    })?;
    check(&resp.diagnostics)?;
    Ok((resp.planned_state, prior))
}

async fn apply(s: &Session, planned: Option<DynamicValue>, prior: Option<DynamicValue>) -> Result<()> {
    let resp = s
        .provider
        .apply_resource_change(ApplyResourceChangeRequest {
            type_name: s.type_name.clone(),
            prior_state: prior,
            planned_state: planned,
            config: None,
            planned_private: Vec::new(),
        })
        .await?;
    let out = StateOutput { state: s.render_state(resp.new_state.as_ref())?, diagnostics: resp.diagnostics.clone() };
    s.print(&out, || {
        if out.state.is_null() {
            println!("applied: record destroyed");
        } else {
            println!("{}", serde_json::to_string_pretty(&out.state).unwrap_or_default());
        }
    })?;
    check(&resp.diagnostics)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut config = ProviderConfig::from_env();
    if let Some(policy) = cli.keepers_policy.as_deref() {
        config.keepers_policy = KeepersPolicy::from_str(policy).map_err(|e| anyhow!(e))?;
    }
    let clock: Arc<dyn Clock> = match cli.now {
        Some(ts) => Arc::new(FixedClock(ts)),
        None => system_clock(),
    };
    info!(keepers_policy = ?config.keepers_policy, max_state_bytes = config.limits.max_bytes, "cachetctl starting");
    let s = Session {
        provider: InProcProvider::with_clock(config, clock),
        codec: StateCodec::new(config.limits),
        type_name: cli.type_name,
        output: cli.output,
    };

    match cli.command {
        Commands::Schema => {
            let resp = s.provider.get_provider_schema().await?;
            s.print(&resp, || {
                for (name, schema) in &resp.resource_schemas {
                    println!("{} (version {})", name, schema.version);
                    for a in &schema.block.attributes {
                        println!("  {:<10} {:<16} {:?}", a.name, a.ty.to_string(), a.presence);
                    }
                }
            })?;
        }
        Commands::Validate { config } => {
            let dv = s.load_state(Some(&config))?;
            let resp = s
                .provider
                .validate_resource_type_config(ValidateResourceTypeConfigRequest { type_name: s.type_name.clone(), config: dv })
                .await?;
            s.print(&resp, || {
                if resp.diagnostics.is_empty() {
                    println!("{}: configuration is valid", config.display());
                }
            })?;
            check(&resp.diagnostics)?;
        }
        Commands::Plan { proposed, prior } => {
            plan(&s, proposed.as_deref(), prior.as_deref()).await?;
        }
        Commands::Apply { planned, prior } => {
            let planned = s.load_state(planned.as_deref())?;
            let prior = s.load_state(prior.as_deref())?;
            apply(&s, planned, prior).await?;
        }
        Commands::Upgrade { state, from_version } => {
            let raw = serde_json::to_vec(&s.load(&state)?)?;
            let resp = s
                .provider
                .upgrade_resource_state(UpgradeResourceStateRequest {
                    type_name: s.type_name.clone(),
                    version: from_version,
                    raw_state: DynamicValue::Json(raw),
                })
                .await?;
            let out = StateOutput { state: s.render_state(resp.upgraded_state.as_ref())?, diagnostics: resp.diagnostics.clone() };
            s.print(&out, || println!("{}", serde_json::to_string_pretty(&out.state).unwrap_or_default()))?;
            check(&resp.diagnostics)?;
        }
        Commands::Run { proposed, prior } => {
            let (planned, prior) = plan(&s, proposed.as_deref(), prior.as_deref()).await?;
            apply(&s, planned, prior).await?;
        }
    }
    Ok(())
}
