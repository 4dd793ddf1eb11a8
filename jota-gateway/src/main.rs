//! Jota inference gateway binary.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jota_gateway::dispatch::{sanitize_utf8, DEFAULT_WORKERS};
use jota_gateway::session::Session;
use jota_gateway::{
    ws, AppState, Args, AuthSettings, CredentialCache, EnvFile, HardwareMonitor,
    InferenceDispatcher, MetricsBroadcaster, SessionRegistry, Settings, SubscriberSet,
};
use jota_protocol::InferParams;
use jota_runtime::echo::EchoModel;
use jota_runtime::{backend_init, gguf, TextModel};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Jota inference gateway");

    let env = EnvFile::load_default();
    let settings = Settings::resolve(args)?;
    let auth_settings = AuthSettings::from_env(&env);

    // The auth backend is load-bearing; refuse to start without it.
    let auth = Arc::new(CredentialCache::new(auth_settings));
    if !auth.verify_backend_liveness().await {
        return Err("JotaDB auth backend is unreachable, refusing to start".into());
    }
    tracing::info!("JotaDB auth backend is healthy");

    let monitor = Arc::new(HardwareMonitor::init());

    let model_file = gguf::probe(&settings.model_path)?;
    tracing::info!(
        "Model file {} (GGUF v{}, {} MB)",
        model_file.path.display(),
        model_file.version,
        model_file.size_bytes / (1024 * 1024)
    );

    let gpu_layers = if settings.gpu_layers < 0 {
        monitor.recommend_gpu_layers(model_file.size_bytes) as i32
    } else {
        settings.gpu_layers
    };
    tracing::info!("GPU layers: {}", gpu_layers);

    backend_init();
    let model: Arc<dyn TextModel> = Arc::new(EchoModel::new());

    let registry = Arc::new(SessionRegistry::new(
        model.clone(),
        settings.ctx_size,
        auth.clone(),
    ));
    let dispatcher = Arc::new(InferenceDispatcher::new(registry.clone(), DEFAULT_WORKERS));
    let subscribers = Arc::new(SubscriberSet::new());
    let broadcaster = MetricsBroadcaster::spawn(
        monitor.clone(),
        registry.clone(),
        dispatcher.clone(),
        subscribers.clone(),
    );

    if let Some(prompt) = settings.prompt.clone() {
        run_local_prompt(model.clone(), settings.ctx_size, prompt).await?;
    }

    let state = Arc::new(AppState::new(
        auth,
        registry.clone(),
        dispatcher.clone(),
        subscribers,
        monitor,
    ));
    let app = ws::app(state);

    let addr = format!("0.0.0.0:{}", settings.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    broadcaster.shutdown().await;
    dispatcher.shutdown().await;
    registry.close_all().await;
    tracing::info!("Gateway stopped");

    Ok(())
}

/// `--prompt`: run one generation to stdout before serving.
async fn run_local_prompt(
    model: Arc<dyn TextModel>,
    ctx_size: u32,
    prompt: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = model.new_context(ctx_size)?;
    let session = Session::new("sess_local".to_string(), "startup".to_string(), model, ctx);

    let stats = tokio::task::spawn_blocking(move || {
        session.generate(&prompt, &InferParams::default(), |piece| {
            print!("{}", sanitize_utf8(piece));
            let _ = std::io::stdout().flush();
            true
        })
    })
    .await?;

    println!();
    tracing::info!(
        "Local generation: {} tokens in {:.0} ms ({:.1} tok/s)",
        stats.tokens,
        stats.total_ms,
        stats.tps
    );
    Ok(())
}
