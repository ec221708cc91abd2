use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sshcert_core::config::{Config, ConnectionConfig};
use sshcert_core::record::{ReadOutcome, ResourceState, fields};
use sshcert_core::store::StateStore;
use sshcert_core::{CertificateAuthority, IssueError, RequestParams};
use sshcert_issuer::{IssuanceSettings, IssuanceWorkflow};
use sshcert_keygen::SshKeyGenerator;
use sshcert_tpp::{TppAuthority, TppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Reset SIGPIPE to default so piping output to `head` etc. exits cleanly
    // instead of panicking with "broken pipe".
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    // Logs go to stderr; stdout carries command output only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match Options::parse(&args) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("error: {e}");
            print_help();
            std::process::exit(1);
        }
    };
    let cmd = opts.args.first().map(String::as_str).unwrap_or("help");

    match cmd {
        "issue" => cmd_issue(&opts).await,
        "retrieve" | "resume" => cmd_retrieve(&opts).await,
        "show" => cmd_show(&opts),
        "delete" | "rm" => cmd_delete(&opts),
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        "\
sshcert - request and track SSH certificates

USAGE:
    sshcert [--config <path>] <command> [args...]

COMMANDS:
    issue <request.toml>                Generate or read the public key, submit a signing
                                        request and wait for the certificate
    retrieve <request.toml>             Pick up a request that was submitted earlier
                                        (after a timeout or interruption) without
                                        submitting again (alias: resume)
    show [--json] [--field=<name>] <key_id>
                                        Show the stored certificate for key_id
    delete <key_id>                     Forget the stored certificate (alias: rm)
    help                                Show this help

OPTIONS:
    -c, --config <path>                 Config file (default: $XDG_CONFIG_HOME/sshcert/config.toml)
    --json                              Print JSON instead of key/value lines
    --field=<name>                      Print one raw field, e.g. certificate or private_key

REQUEST FILE:
    key_id = \"svc1\"                     Required
    template = \"T1\"                     Required; bare names are looked up under the
                                        SSH template folder
    public_key_method = \"local\"         local | file | service (default: local)
    public_key = \"ssh-rsa AAAA...\"      Required when public_key_method = \"file\"
    key_size = 3072                     Local keys only; <= 0 means 3072
    key_passphrase = \"...\"              Encrypts the private key (local or service)
    windows = false                     Keep CRLF in service-generated private keys
    valid_hours = 24
    principals = [\"deploy\"]
    source_address = [\"10.0.0.0/8\"]
    destination_address = [\"db1.example.com\"]
    extension = [\"permit-pty\", \"login@example.com:ops\"]
    folder, force_command, object_name  Optional strings

ENVIRONMENT:
    RUST_LOG                            Log filter (default: info)

EXAMPLES:
    sshcert issue svc1.toml
    sshcert show svc1
    sshcert show --field=certificate svc1 > ~/.ssh/id_rsa-cert.pub
    sshcert retrieve svc1.toml          # after a pickup timeout
    sshcert delete svc1"
    );
}

/// Parsed global options plus the remaining positional arguments.
#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    config: Option<PathBuf>,
    json: bool,
    field: Option<String>,
    args: Vec<String>,
}

impl Options {
    fn parse(args: &[String]) -> Result<Self> {
        let mut opts = Options::default();
        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_str();
            if arg == "--config" || arg == "-c" {
                let Some(path) = args.get(i + 1) else {
                    bail!("--config requires a path argument");
                };
                opts.config = Some(PathBuf::from(path));
                i += 2;
                continue;
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                opts.config = Some(PathBuf::from(path));
            } else if arg == "--json" {
                opts.json = true;
            } else if let Some(name) = arg.strip_prefix("--field=") {
                opts.field = Some(name.to_string());
            } else {
                opts.args.push(arg.to_string());
            }
            i += 1;
        }
        Ok(opts)
    }

    /// The single positional argument after the command.
    fn operand(&self, what: &str) -> Result<&str> {
        match self.args.get(1..) {
            Some([one]) => Ok(one.as_str()),
            Some([]) | None => bail!("missing {what}"),
            Some(_) => bail!("expected exactly one {what}"),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_issue(opts: &Options) -> Result<()> {
    let request_path = PathBuf::from(opts.operand("request file")?);
    let config = load_config(&opts.config_path())?;
    let request = load_request(&request_path)?
        .validate()
        .context("invalid request")?;
    let key_id = request.request().key_id.clone();

    let store = build_store(&config)?;
    ensure_not_issued(&store, &key_id)?;
    let workflow = build_workflow(&config)?;
    let cancel = cancel_on_ctrl_c();

    let mut state = store.create(&key_id);
    match workflow.issue(&request, &mut state, &cancel).await {
        Ok(_) => {
            state.commit()?;
            print_state(state.state(), opts)
        }
        Err(e) => Err(explain(e, &request_path)),
    }
}

async fn cmd_retrieve(opts: &Options) -> Result<()> {
    let request_path = PathBuf::from(opts.operand("request file")?);
    let config = load_config(&opts.config_path())?;
    let request = load_request(&request_path)?
        .validate()
        .context("invalid request")?;
    let key_id = request.request().key_id.clone();

    let store = build_store(&config)?;
    let mut state = store.open(&key_id)?;
    let Some(handle) = state.state().identity() else {
        bail!("no submitted request is recorded for '{key_id}'; run `sshcert issue` first");
    };
    let local = state.state().key_material();

    let workflow = build_workflow(&config)?;
    let cancel = cancel_on_ctrl_c();

    match workflow.resume(&request, handle, local, &mut state, &cancel).await {
        Ok(_) => {
            state.commit()?;
            print_state(state.state(), opts)
        }
        Err(e) => Err(explain(e, &request_path)),
    }
}

/// A stored certificate is only replaced after an explicit `delete`.
fn ensure_not_issued(store: &StateStore, key_id: &str) -> Result<()> {
    let existing = store.load(key_id)?;
    if existing.has_certificate() {
        bail!(
            "a certificate is already stored for '{key_id}' (request {}); \
             run `sshcert delete {key_id}` first to replace it",
            existing.id
        );
    }
    Ok(())
}

fn cmd_show(opts: &Options) -> Result<()> {
    let key_id = opts.operand("key id")?;
    let config = load_config(&opts.config_path())?;
    let store = build_store(&config)?;

    let mut state = store.load(key_id)?;
    match state.refresh() {
        ReadOutcome::Present => print_state(&state, opts),
        ReadOutcome::Absent => {
            // Nothing observable: the stored state is stale, drop it.
            if store.remove(key_id)? {
                tracing::info!(%key_id, "no certificate stored; cleared stale state");
            }
            eprintln!("no certificate stored for '{key_id}'");
            Ok(())
        }
    }
}

fn cmd_delete(opts: &Options) -> Result<()> {
    let key_id = opts.operand("key id")?;
    let config = load_config(&opts.config_path())?;
    let store = build_store(&config)?;

    if store.remove(key_id)? {
        println!("removed '{key_id}' (the certificate itself is not revoked)");
    } else {
        println!("'{key_id}' already absent");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Build the certificate authority once per process.
fn build_authority(conn: &ConnectionConfig) -> Result<Arc<dyn CertificateAuthority>> {
    match conn.kind.as_str() {
        "tpp" => {
            let config = TppConfig::from_connection(conn)?;
            tracing::debug!(url = %config.url, "using TPP certificate authority");
            Ok(Arc::new(TppAuthority::new(config)?))
        }
        other => bail!("unsupported connection type '{other}' (supported: tpp)"),
    }
}

fn build_workflow(config: &Config) -> Result<IssuanceWorkflow> {
    let authority = build_authority(&config.connection)?;
    Ok(IssuanceWorkflow::new(
        authority,
        Arc::new(SshKeyGenerator),
        IssuanceSettings::from(&config.issuance),
    ))
}

fn build_store(config: &Config) -> Result<StateStore> {
    match &config.state.dir {
        Some(dir) => Ok(StateStore::new(dir.clone())),
        None => Ok(StateStore::from_env()?),
    }
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping");
            token.cancel();
        }
    });
    cancel
}

/// Turn a workflow failure into a user-facing error, with a hint when the
/// request can still be picked up.
fn explain(err: IssueError, request_path: &Path) -> anyhow::Error {
    if err.is_resumable() {
        let hint = format!(
            "the request was accepted; run `sshcert retrieve {}` to pick it up later",
            request_path.display()
        );
        anyhow::Error::new(err).context(hint)
    } else {
        anyhow::Error::new(err)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Fields printed by default, in order.  The private key is only printed
/// when asked for with `--field=private_key`.
const SUMMARY_FIELDS: [&str; 8] = [
    fields::CERTIFICATE_TYPE,
    fields::SERIAL,
    fields::VALID_FROM,
    fields::VALID_TO,
    fields::PUBLIC_KEY_FINGERPRINT,
    fields::SIGNING_CA,
    fields::PUBLIC_KEY,
    fields::CERTIFICATE,
];

fn print_state(state: &ResourceState, opts: &Options) -> Result<()> {
    if let Some(name) = &opts.field {
        let value = if name == fields::ID {
            Some(state.id.as_str())
        } else {
            state.get(name)
        };
        let Some(value) = value else {
            bail!("unknown field '{name}'");
        };
        println!("{value}");
        return Ok(());
    }

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&summary_json(state))?);
    } else {
        println!("{}: {}", fields::ID, state.id);
        for name in SUMMARY_FIELDS {
            println!("{name}: {}", state.get(name).unwrap_or(""));
        }
    }
    Ok(())
}

fn summary_json(state: &ResourceState) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    obj.insert(fields::ID.to_string(), serde_json::Value::String(state.id.clone()));
    for name in SUMMARY_FIELDS {
        let value = state.get(name).unwrap_or("").to_string();
        obj.insert(name.to_string(), serde_json::Value::String(value));
    }
    serde_json::Value::Object(obj)
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            tracing::warn!("neither XDG_CONFIG_HOME nor HOME are set; using current directory for config");
            PathBuf::from(".")
        });
    base.join("sshcert").join("config.toml")
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::warn!("config file not found at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    warn_if_exposed(path, "config file");

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

fn load_request(path: &Path) -> Result<RequestParams> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read request file {}", path.display()))?;
    let params: RequestParams = toml::from_str(&content)
        .with_context(|| format!("failed to parse request file {}", path.display()))?;
    if params.key_passphrase.is_some() {
        warn_if_exposed(path, "request file");
    }
    Ok(params)
}

/// Warn when a file that may hold secrets is readable by group or others.
fn warn_if_exposed(path: &Path, what: &str) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mode = meta.mode();
                if mode & 0o077 != 0 {
                    tracing::warn!(
                        path = %path.display(),
                        mode = format!("{:o}", mode & 0o777),
                        "{what} is readable by group or others, recommend: chmod 600 {}",
                        path.display()
                    );
                }
            }
            Err(e) => {
                tracing::warn!("could not check {what} permissions: {e}");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (path, what);
}
