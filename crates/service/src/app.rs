//! Startup wiring: assembles every component into one
//! `AppState` and serves the axum router: build state, bind a
//! listener, `axum::serve(..).with_graceful_shutdown(..)` against the
//! full route table in `routes.rs`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acctrelay_core::storage::KEY_ACCOUNTS;
use acctrelay_core::{Account, Storage};

use crate::account::AccountPool;
use crate::http_clients::HttpClients;
use crate::jwt_minter::JwtMinter;
use crate::media::MediaHandler;
use crate::orchestrator::{ChatLockTable, Orchestrator};
use crate::refresh_loop::{spawn_refresh_loop, RefreshController};
use crate::session_cache::SessionBindingCache;
use crate::settings::Settings;
use crate::stats::StatsStore;
use crate::task_queue::{TaskQueueConfig, TaskSupervisor};

/// Everything a request handler might need, bundled behind `Arc`s so
/// cloning `AppState` into an axum `State` extractor is cheap (every
/// shared structure here already owns its own internal locking).
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Mutex<Settings>>,
    pub storage: Arc<Storage>,
    pub pool: Arc<AccountPool>,
    pub bindings: Arc<SessionBindingCache>,
    pub http: Arc<HttpClients>,
    pub media: Arc<MediaHandler>,
    pub orchestrator: Arc<Orchestrator>,
    pub supervisor: Arc<TaskSupervisor>,
    pub refresh_controller: Arc<RefreshController>,
    pub stats: Arc<StatsStore>,
    pub admin_key: String,
    pub started_at: i64,
}

fn media_dir() -> PathBuf {
    std::env::var("ACCTRELAY_MEDIA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("acctrelay")
                .join("media")
        })
}

fn worker_binary() -> String {
    std::env::var("ACCTRELAY_WORKER_BIN").unwrap_or_else(|_| "acctrelay-browser-worker".to_string())
}

fn worker_engine() -> String {
    std::env::var("ACCTRELAY_WORKER_ENGINE").unwrap_or_else(|_| "chromium".to_string())
}

/// Builds every component and wires the background loops
/// (session-binding flusher, media sweeper, stats flusher, auto-refresh
/// tick). Split out from `start_server` so tests can build a state without
/// binding a socket.
pub fn build_state() -> AppState {
    let database_url = std::env::var("DATABASE_URL").ok();
    let storage = Storage::open_default(database_url.as_deref(), "acctrelay").expect("open storage");
    storage.init().expect("init storage");
    let storage = Arc::new(storage);

    let settings = Settings::load(&storage);
    let admin_key = settings.basic.admin_key.clone();
    let accounts: Vec<Account> = storage.get_json(KEY_ACCOUNTS).ok().flatten().unwrap_or_default();

    let pool = Arc::new(AccountPool::new(accounts));
    let http = Arc::new(HttpClients::from_settings(&settings.basic));
    let bindings = Arc::new(SessionBindingCache::load_from(
        &storage,
        settings.session.binding_ttl_secs,
        settings.session.binding_max_entries,
    ));
    let jwt_minter = Arc::new(JwtMinter::new(settings.basic.upstream_base.clone()));
    let media = Arc::new(MediaHandler::new(media_dir(), settings.basic.upstream_base.clone()));
    let locks = Arc::new(ChatLockTable::default());
    let stats = Arc::new(StatsStore::load_from(&storage));

    let orchestrator = Arc::new(Orchestrator {
        pool: pool.clone(),
        locks,
        bindings: bindings.clone(),
        http: http.clone(),
        jwt_minter,
        media: media.clone(),
        retry: settings.retry.clone(),
        image_mode: settings.image_generation.output_mode,
        video_mode: settings.video_generation.output_mode,
        upstream_base: settings.basic.upstream_base.clone(),
        media_base_url: settings
            .public_display
            .base_url_override
            .clone()
            .unwrap_or_default(),
    });

    let supervisor = TaskSupervisor::new(TaskQueueConfig {
        worker_binary: worker_binary(),
        subprocess_timeout: Duration::from_secs(settings.retry.subprocess_timeout_secs),
    });

    let settings = Arc::new(Mutex::new(settings));
    let refresh_controller = spawn_refresh_loop(
        pool.clone(),
        storage.clone(),
        settings.clone(),
        supervisor.clone(),
        worker_engine(),
    );

    let session_settings = settings.lock().expect("settings mutex poisoned").session.clone();
    crate::session_cache::spawn_flusher(bindings.clone(), storage.clone(), session_settings.binding_flush_interval_secs);
    crate::media::spawn_sweeper(
        media_dir(),
        session_settings.media_sweep_interval_secs,
        session_settings.media_max_age_secs,
    );
    crate::stats::spawn_flusher(stats.clone(), storage.clone(), 30);

    AppState {
        settings,
        storage,
        pool,
        bindings,
        http,
        media,
        orchestrator,
        supervisor,
        refresh_controller,
        stats,
        admin_key,
        started_at: acctrelay_core::time::now_ts(),
    }
}

async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn serve(state: AppState) -> std::io::Result<()> {
    let listen_addr = state.settings.lock().expect("settings mutex poisoned").basic.listen_addr.clone();
    let addr: SocketAddr = listen_addr
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

    let app = crate::routes::build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("event=listening addr={addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown_signal())
    .await
    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
}

/// Synchronous entrypoint: builds its own multi-thread runtime and blocks
/// for the life of the process, so the binary crate never has to depend
/// on `tokio` itself.
pub fn start_server() -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let state = build_state();
    runtime.block_on(serve(state))
}
