use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use obx_bridge::memory::encode_object;
use obx_bridge::{
    AsyncEngine, Bridge, BridgeConfig, EngineError, LocalPorts, MemoryBox, MemoryQuery,
    MemoryStore, MemorySync, Payload, PortReceiver, PutCompletionMessage, PutMode, QueryEngine,
    StoreEngine, StreamItem, SyncChange, SyncEngine, SyncEvent, SyncEventKind,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "OBX_BRIDGE_LOG";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "obx-bridge-cli")]
#[command(about = "Drives the obx bridge against the in-memory engine and prints port messages")]
struct Cli {
    /// JSON bridge config; `OBX_BRIDGE_*` variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print each port message as JSON.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Observe(ObserveArgs),
    Stream(StreamArgs),
    Put(PutArgs),
    Sync(SyncArgs),
    ShowConfig,
}

#[derive(clap::Args, Debug)]
struct ObserveArgs {
    /// Comma-separated entity type ids touched by one commit; repeatable.
    #[arg(long = "commit", required = true)]
    commits: Vec<String>,
    /// Observe only this entity type.
    #[arg(long)]
    type_id: Option<u32>,
}

#[derive(clap::Args, Debug)]
struct StreamArgs {
    #[arg(long = "row")]
    rows: Vec<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    by_reference: bool,
    /// Fail the query after this many rows.
    #[arg(long)]
    fail_after: Option<usize>,
    #[arg(long, default_value_t = 10_001)]
    fail_code: i32,
}

#[derive(clap::Args, Debug)]
struct PutArgs {
    /// Object body; repeatable.
    #[arg(long = "object", required = true)]
    objects: Vec<String>,
    /// Object id; `0` lets the box assign one.
    #[arg(long, default_value_t = 0)]
    id: u64,
    #[arg(long, value_enum, default_value_t = ModeArg::Put)]
    mode: ModeArg,
}

#[derive(clap::Args, Debug)]
struct SyncArgs {
    #[arg(long = "event", value_enum, required = true)]
    events: Vec<KindArg>,
    #[arg(long, default_value_t = 43)]
    login_failure_code: i32,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Put,
    Insert,
    Update,
}

impl From<ModeArg> for PutMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Put => PutMode::Put,
            ModeArg::Insert => PutMode::Insert,
            ModeArg::Update => PutMode::Update,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Connect,
    Disconnect,
    Login,
    LoginFailure,
    Complete,
    Change,
    ServerTime,
}

impl From<KindArg> for SyncEventKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Connect => SyncEventKind::Connect,
            KindArg::Disconnect => SyncEventKind::Disconnect,
            KindArg::Login => SyncEventKind::Login,
            KindArg::LoginFailure => SyncEventKind::LoginFailure,
            KindArg::Complete => SyncEventKind::Complete,
            KindArg::Change => SyncEventKind::Change,
            KindArg::ServerTime => SyncEventKind::ServerTime,
        }
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Observe(args) => observe_command(config, args, cli.json),
        Commands::Stream(args) => stream_command(config, args, cli.json),
        Commands::Put(args) => put_command(config, args, cli.json),
        Commands::Sync(args) => sync_command(config, args, cli.json),
        Commands::ShowConfig => show_config_command(&config),
    });

    match result {
        Ok(code) => code,
        Err(error) => {
            tracing::debug!(%error, "command failed");
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig, String> {
    let base = match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading bridge config");
            BridgeConfig::from_json_file(path).map_err(|e| e.to_string())?
        }
        None => BridgeConfig::default(),
    };
    base.with_lookup(|key| std::env::var(key).ok())
        .map_err(|e| e.to_string())
}

struct Session {
    bridge: Bridge,
    ports: LocalPorts,
    rx: PortReceiver,
}

fn open_session(config: BridgeConfig) -> Result<Session, String> {
    let ports = LocalPorts::from_config(&config);
    let bridge = Bridge::new(config);
    bridge
        .init(Arc::new(ports.clone()))
        .map_err(|e| e.to_string())?;
    let rx = ports.open();
    Ok(Session { bridge, ports, rx })
}

fn observe_command(
    config: BridgeConfig,
    args: ObserveArgs,
    json: bool,
) -> Result<ExitCode, String> {
    let session = open_session(config)?;
    let store = Arc::new(MemoryStore::new());
    let engine: Arc<dyn StoreEngine> = store.clone();
    let port = session.rx.id();

    let handle = match args.type_id {
        Some(type_id) => session.bridge.observe_single_type(&engine, type_id, port),
        None => session.bridge.observe(&engine, port),
    }
    .map_err(|e| e.to_string())?;

    for commit in &args.commits {
        store.commit(&parse_type_ids(commit)?);
    }
    session
        .bridge
        .close_observer(Some(handle))
        .map_err(|e| e.to_string())?;

    let messages = session.rx.drain();
    print_messages(&messages, json, |payload| {
        let ids: Vec<String> = payload
            .as_array()
            .unwrap_or_default()
            .iter()
            .filter_map(Payload::as_int)
            .map(|id| id.to_string())
            .collect();
        format!("changed types: {}", ids.join(","))
    })?;
    print_port_summary(&session, json);
    Ok(ExitCode::SUCCESS)
}

fn parse_type_ids(commit: &str) -> Result<Vec<u32>, String> {
    commit
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse()
                .map_err(|_| format!("invalid type id '{part}' in --commit {commit}"))
        })
        .collect()
}

fn stream_command(config: BridgeConfig, args: StreamArgs, json: bool) -> Result<ExitCode, String> {
    let session = open_session(config)?;
    let mut query = MemoryQuery::new(args.rows.iter().map(String::as_bytes));
    if let Some(rows) = args.fail_after {
        query = query.failing_after(rows, EngineError::failed(args.fail_code, "query failed"));
    }
    let query: Arc<dyn QueryEngine> = Arc::new(query);
    let port = session.rx.id();

    let handle = if args.by_reference {
        session.bridge.query_find_stream_by_reference(&query, port)
    } else {
        session.bridge.query_find_stream(&query, port)
    }
    .map_err(|e| e.to_string())?;

    let mut messages = Vec::new();
    loop {
        let payload = session
            .rx
            .recv_timeout(WAIT)
            .ok_or_else(|| "stream did not terminate".to_string())?;
        let end = payload.is_null();
        messages.push(payload);
        if end {
            break;
        }
    }
    session
        .bridge
        .close_stream(handle)
        .map_err(|e| e.to_string())?;

    let failed = messages.iter().any(|payload| {
        matches!(
            StreamItem::from_payload(payload),
            Some(StreamItem::Error { .. })
        )
    });
    if failed {
        tracing::warn!(port = %port, "query stream reported an error");
    }
    print_messages(&messages, json, |payload| match StreamItem::from_payload(payload) {
        Some(StreamItem::Row(row)) => format!("row: {}", String::from_utf8_lossy(row)),
        Some(StreamItem::Error { code, detail }) => format!("error {code}: {detail}"),
        Some(StreamItem::End) => "end".to_string(),
        None => format!("unexpected: {payload:?}"),
    })?;
    Ok(if failed {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

fn put_command(config: BridgeConfig, args: PutArgs, json: bool) -> Result<ExitCode, String> {
    let session = open_session(config)?;
    let boxed = Arc::new(MemoryBox::new().map_err(|e| e.to_string())?);
    let ctx: Arc<dyn AsyncEngine> = boxed.clone();
    let port = session.rx.id();

    for body in &args.objects {
        session
            .bridge
            .put_object_async(&ctx, port, encode_object(args.id, body.as_bytes()), args.mode.into())
            .map_err(|e| e.to_string())?;
    }

    let mut messages = Vec::with_capacity(args.objects.len());
    for _ in &args.objects {
        let payload = session
            .rx
            .recv_timeout(WAIT)
            .ok_or_else(|| "put completion did not arrive".to_string())?;
        messages.push(payload);
    }

    let failed = messages.iter().any(|payload| {
        PutCompletionMessage::from_payload(payload).is_none_or(|message| !message.is_success())
    });
    if failed {
        tracing::warn!(port = %port, "at least one put failed");
    }
    print_messages(&messages, json, |payload| {
        match PutCompletionMessage::from_payload(payload) {
            Some(message) if message.is_success() => format!("put {}: ok", message.id),
            Some(message) => format!("put {}: error {}", message.id, message.code),
            None => format!("unexpected: {payload:?}"),
        }
    })?;
    Ok(if failed {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

fn sample_event(kind: SyncEventKind, login_failure_code: i32) -> SyncEvent {
    match kind {
        SyncEventKind::Connect => SyncEvent::Connected,
        SyncEventKind::Disconnect => SyncEvent::Disconnected,
        SyncEventKind::Login => SyncEvent::LoggedIn,
        SyncEventKind::LoginFailure => SyncEvent::LoginFailed {
            code: login_failure_code,
        },
        SyncEventKind::Complete => SyncEvent::Complete,
        SyncEventKind::Change => SyncEvent::Changes {
            changes: vec![SyncChange {
                entity_id: 1,
                puts: vec![1, 2],
                removals: vec![3],
            }],
        },
        SyncEventKind::ServerTime => SyncEvent::ServerTime {
            unix_nanos: 1_700_000_000_000_000_000,
        },
    }
}

fn sync_command(config: BridgeConfig, args: SyncArgs, json: bool) -> Result<ExitCode, String> {
    let session = open_session(config)?;
    let sync = Arc::new(MemorySync::new());
    let engine: Arc<dyn SyncEngine> = sync.clone();
    let port = session.rx.id();

    let mut handles = Vec::new();
    for kind in SyncEventKind::ALL {
        handles.push(
            session
                .bridge
                .sync_listener(&engine, kind, port)
                .map_err(|e| e.to_string())?,
        );
    }

    let kinds: Vec<SyncEventKind> = args.events.iter().map(|kind| (*kind).into()).collect();
    for kind in &kinds {
        sync.emit(&sample_event(*kind, args.login_failure_code));
    }
    for handle in handles {
        session
            .bridge
            .close_sync_listener(Some(handle))
            .map_err(|e| e.to_string())?;
    }

    let messages = session.rx.drain();
    tracing::debug!(events = kinds.len(), messages = messages.len(), "sync events drained");
    let mut kinds = kinds.into_iter();
    print_messages(&messages, json, |payload| {
        let kind = kinds
            .next()
            .map(|kind| kind.to_string())
            .unwrap_or_else(|| "?".to_string());
        format!("{kind}: {payload:?}")
    })?;
    Ok(ExitCode::SUCCESS)
}

fn show_config_command(config: &BridgeConfig) -> Result<ExitCode, String> {
    let json = serde_json::to_string_pretty(config).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(ExitCode::SUCCESS)
}

fn print_messages(
    messages: &[Payload],
    json: bool,
    mut describe: impl FnMut(&Payload) -> String,
) -> Result<(), String> {
    for payload in messages {
        if json {
            let line = serde_json::to_string(payload).map_err(|e| e.to_string())?;
            println!("{line}");
        } else {
            println!("{}", describe(payload));
        }
    }
    Ok(())
}

fn print_port_summary(session: &Session, json: bool) {
    if json {
        return;
    }
    let stats = session.ports.stats();
    println!(
        "port {}: accepted={} dropped_full={} dropped_closed={}",
        session.rx.id(),
        stats.accepted,
        stats.dropped_full,
        stats.dropped_closed
    );
}
