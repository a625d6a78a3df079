use authrelay::artifact::ArtifactRelay;
use authrelay::flow::machine::FlowConfig;
use authrelay::server::{routes, AppState, PageLauncher};
use authrelay::session::SessionRegistry;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9669)]
    port: u16,

    /// Address of the remote login form
    #[arg(long)]
    login_url: String,

    /// Directory where puzzle images are staged for the solver
    #[arg(long, default_value = "./relay")]
    relay_dir: PathBuf,

    /// Directory for per-session cookie exports
    #[arg(long, default_value = "./exports")]
    export_dir: PathBuf,

    /// Path to a Chrome executable (auto-download otherwise)
    #[arg(long)]
    chrome_path: Option<String>,

    /// Run Chrome headless
    #[arg(long)]
    headless: bool,

    /// Pass --no-sandbox to Chrome (Linux AppArmor workaround)
    #[arg(long)]
    no_sandbox: bool,

    /// Connect to an existing Chrome on this debug port instead of launching
    #[arg(long)]
    debug_port: Option<u16>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    log::info!("Starting authrelay on port {}", args.port);

    let state = Arc::new(AppState {
        registry: SessionRegistry::new(),
        relay: Arc::new(ArtifactRelay::new(args.relay_dir)),
        launcher: PageLauncher {
            chrome_path: args.chrome_path,
            headless: args.headless,
            no_sandbox: args.no_sandbox,
            debug_port: args.debug_port,
        },
        flow_config: FlowConfig {
            login_url: args.login_url,
            ..FlowConfig::default()
        },
        export_dir: args.export_dir,
    });

    let api = routes(state.clone());

    // Bind manually to handle "port in use" error gracefully
    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind to port {}: {}", args.port, e);
            eprintln!(
                "Error: Port {} is already in use or unavailable.",
                args.port
            );
            std::process::exit(1);
        }
    };

    log::info!("Listening on http://{}", addr);

    let serve = warp::serve(api)
        .run_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener));

    tokio::select! {
        _ = serve => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down, releasing sessions");
            state.registry.shutdown().await;
        }
    }
}
