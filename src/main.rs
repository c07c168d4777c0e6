use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

use phantom_core::generic::GenericCodec;
use phantom_core::mock::Session;
use phantom_core::mockdb::MockDb;
use phantom_core::mysql::MySqlCodec;
use phantom_core::postgres::PostgresCodec;
use phantom_core::registry::IntegrationRegistry;
use phantom_core::resolve::StaticDestinationResolver;
use phantom_core::storage::{MockReader, MockWriter};
use phantom_proxy::{ProxyDispatcher, RecordTarget};
use phantom_storage::FjallMockStore;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    Record,
    Replay,
}

#[derive(Parser)]
#[command(name = "phantom", about = "Record/replay L4 proxy core", version)]
struct Cli {
    /// Whether to record live traffic or replay a previously recorded session
    #[arg(short, long, value_enum)]
    mode: Mode,

    /// Address the proxy listens on
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    listen: SocketAddr,

    /// Original destination to dial in record mode; ignored in replay mode
    #[arg(short, long)]
    upstream: Option<SocketAddr>,

    /// Session name mocks are recorded under / replayed from
    #[arg(short, long, default_value = "default")]
    session: String,

    /// Directory the mock store persists to
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("phantom")
        .join("mocks")
}

fn init_registry() -> &'static IntegrationRegistry {
    // Generic matches everything, so it must be last — anything it would
    // shadow gets a chance to claim the connection first.
    IntegrationRegistry::init(vec![
        Box::new(PostgresCodec::new()),
        Box::new(MySqlCodec::new()),
        Box::new(GenericCodec::new()),
    ])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let registry = init_registry();
    let session = Session::new(cli.session.clone());
    let cancel = CancellationToken::new();

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl-C, shutting down");
            ctrl_c_cancel.cancel();
        }
    });

    match cli.mode {
        Mode::Record => {
            let upstream = cli
                .upstream
                .ok_or_else(|| anyhow::anyhow!("--upstream is required in record mode"))?;
            let store = Arc::new(FjallMockStore::open(&data_dir)?);
            let resolver = Arc::new(StaticDestinationResolver::new(upstream));
            let dispatcher = ProxyDispatcher::record(
                registry,
                session,
                RecordTarget {
                    resolver,
                    writer: store as Arc<dyn MockWriter>,
                },
            );
            eprintln!("phantom: recording on {} -> {}", cli.listen, upstream);
            dispatcher.run(cli.listen, cancel).await?;
        }
        Mode::Replay => {
            let store = FjallMockStore::open(&data_dir)?;
            let mocks = store.load(&session)?;
            let mock_db = Arc::new(MockDb::new());
            mock_db.set_mocks(mocks, vec![]);
            let dispatcher = ProxyDispatcher::replay(registry, session, mock_db);
            eprintln!("phantom: replaying on {}", cli.listen);
            dispatcher.run(cli.listen, cancel).await?;
        }
    }

    Ok(())
}
