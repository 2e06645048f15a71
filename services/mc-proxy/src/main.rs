// mc-proxy: a man-in-the-middle proxy sitting between one game client and
// one upstream server, intercepting packets through a hook pipeline and
// exposing a command graph/module lifecycle to the modules it loads.
//
// Single-threaded by design (SPEC_FULL.md §5): the hook pipeline, command
// registry, and module registry are all `Rc`/`RefCell`-based and `?Send`,
// so the whole service runs on a `LocalSet` under a current-thread runtime
// rather than tokio's default multi-thread scheduler.

use mc_proxy::config;
use mc_proxy::connector::TcpUpstreamConnector;
use mc_proxy::modules_scan;
use mc_proxy::transport::{DebugLoggingTransport, TcpTransport};
use mp_modules::{Module, ModuleFactory};
use mp_protocol::OfflineAuthProvider;
use mp_proxy_core::ProxyCore;
use std::rc::Rc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    let disable_color = std::env::var("LOG_DISABLE_COLOR").as_deref() == Ok("1");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(!disable_color)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "mc-proxy starting");

    let cfg = match config::load_config() {
        Ok(cfg) => {
            info!(
                proxy_port = cfg.proxy_port,
                upstream = %cfg.server.address,
                upstream_port = cfg.server.port,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(cfg));
}

async fn run(cfg: config::ProxyConfig) {
    let mut core = ProxyCore::new(cfg.command_prefix.clone());

    core.modules()
        .borrow_mut()
        .register_factory(ModuleFactory {
            key: "core".into(),
            build: Rc::new(|| Box::new(mp_core_module::CoreModule::new()) as Box<dyn Module>),
        });
    core.modules()
        .borrow_mut()
        .set_module_config(cfg.modules.config.clone());

    modules_scan::scan_and_import(&core.modules(), &cfg.modules.dir);

    for name in &cfg.modules.load {
        // "core" is always imported above even if the manifest scan found
        // nothing; any other entry in `modules.load` must already have
        // been imported by the scan, or loading fails loudly here rather
        // than silently skipping a module the operator asked for by name.
        if name == "core" && !core.modules().borrow().is_loaded("core") {
            if let Err(e) = core.modules().borrow_mut().import("core") {
                error!(module = "core", error = %e, "failed to import core module");
                std::process::exit(1);
            }
        }
        if let Err(e) = core.modules().borrow_mut().load(name).await {
            error!(module = %name, error = %e, "failed to load module, exiting");
            std::process::exit(1);
        }
        info!(module = %name, "module loaded");
    }

    let listener = match TcpListener::bind(("0.0.0.0", cfg.proxy_port)).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: failed to bind proxy port {}: {e}", cfg.proxy_port);
            std::process::exit(1);
        }
    };
    info!(port = cfg.proxy_port, "proxy listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::task::spawn_local(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let connector = Rc::new(TcpUpstreamConnector {
        address: cfg.server.address.clone(),
        port: cfg.server.port,
        auth: Rc::new(OfflineAuthProvider {
            username: cfg.auth.username.clone(),
        }),
    });

    let mut rx = shutdown_rx.clone();
    loop {
        tokio::select! {
            biased;
            _ = rx.changed() => {
                if *rx.borrow() {
                    info!("shutdown requested, no longer accepting new connections");
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "client connected");
                        let client = DebugLoggingTransport::wrap(TcpTransport::new(stream), "client");
                        let result = core
                            .serve_client(Box::new(client), connector.as_ref(), shutdown_rx.clone())
                            .await;
                        if let Err(e) = result {
                            warn!(error = %e, "connection ended with error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept error");
                    }
                }
            }
        }
    }

    info!("mc-proxy shut down gracefully");
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
