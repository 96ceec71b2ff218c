use anyhow::{Context, Result};
use std::sync::Arc;
use taskwarden_daemon::{
    analyzer::LibraryAnalyzer,
    collector::{linux::LinuxProcessCollector, netlink::NetlinkProcessFeed, ProcessEventFeed},
    config::Config,
    control::LinuxProcessControl,
    foreground::ForegroundEvent,
    manager::{Collaborators, ManagerEvent, ProcessManager},
    notifier::Notifier,
    power::GovernorPower,
    protocol::{Request, Response},
    socket::{handle_client, RequestHandler, SocketServer},
    watchlist::Watchlist,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

struct DaemonState {
    manager: Arc<ProcessManager>,
}

#[async_trait::async_trait]
impl RequestHandler for DaemonState {
    async fn handle(&self, request: Request) -> Response {
        let manager = &self.manager;
        match request {
            Request::Ping => Response::Pong,
            Request::ListProcesses => Response::data(serde_json::json!(manager.summaries())),
            Request::ListRules => Response::data(serde_json::json!(manager.watchlist().configs())),
            Request::GetStatus => Response::Status {
                data: manager.status(),
            },
            Request::HastenScan => Response::data(serde_json::json!({
                "scheduled": manager.hasten_scan(),
            })),
            Request::FreeMemory { params } => {
                let summary = manager.free_memory(params.ignore_pid).await;
                Response::data(serde_json::json!(summary))
            }
            Request::IgnorePid { params } => Response::success(manager.ignore_pid(params.pid)),
            Request::UnignorePid { params } => Response::success(manager.unignore_pid(params.pid)),
            Request::ForegroundChanged { params } => {
                manager.on_foreground_changed(ForegroundEvent {
                    pid: params.pid,
                    fullscreen: params.fullscreen,
                });
                Response::success(true)
            }
            Request::PowerBehaviour { params } => {
                manager.on_power_behaviour_changed(params.behaviour);
                Response::success(true)
            }
        }
    }
}

/// Forward manager events to socket clients and, where it matters, the desktop.
async fn forward_events(
    mut events: broadcast::Receiver<ManagerEvent>,
    clients: broadcast::Sender<String>,
    notifier: Notifier,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event forwarder lagged, {} events dropped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match &event {
            ManagerEvent::FreeWill { pid, name, rule } => {
                notifier.send(
                    &format!("taskwarden: {} left alone", name),
                    &format!("PID {} keeps reverting rule '{}'", pid, rule),
                );
            }
            ManagerEvent::PushFeedFailed { reason } => {
                notifier.send("taskwarden: process events unavailable", reason);
            }
            _ => {}
        }
        if clients.receiver_count() == 0 {
            continue;
        }
        if let Ok(json) = serde_json::to_string(&Response::Event { data: event }) {
            let _ = clients.send(json);
        }
    }
}

fn load_config() -> Config {
    let config_path = Config::config_path();
    if config_path.exists() {
        Config::load(&config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        })
    } else {
        info!("No config file found, using defaults");
        Config::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("taskwarden daemon starting...");

    let config = Arc::new(load_config());
    let (watchlist, _warnings) =
        Watchlist::from_configs(&config.rules, config.debounce.settings());

    let collector = LinuxProcessCollector::probe().context("process enumeration unavailable")?;
    let feed: Arc<dyn ProcessEventFeed> = Arc::new(NetlinkProcessFeed::new());
    let collaborators = Collaborators {
        collector: Arc::new(collector),
        control: Arc::new(LinuxProcessControl::new()),
        power: Arc::new(GovernorPower::new()),
        feed: Some(feed),
        analyzer: Some(Arc::new(LibraryAnalyzer)),
    };
    let manager = ProcessManager::new(Arc::clone(&config), collaborators, Arc::new(watchlist));

    let socket_path = SocketServer::socket_path();
    let server = SocketServer::bind(&socket_path)
        .await
        .with_context(|| format!("cannot bind {:?}", socket_path))?;

    tokio::spawn(forward_events(
        manager.subscribe(),
        server.broadcast_sender(),
        Notifier::new(config.general.notifications),
    ));

    manager.start().context("failed to start process manager")?;

    let state = Arc::new(DaemonState {
        manager: Arc::clone(&manager),
    });
    let mut terminate = signal(SignalKind::terminate())?;

    info!("Daemon ready, listening for connections...");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            accepted = server.accept() => match accepted {
                Ok(stream) => {
                    let state = Arc::clone(&state);
                    let broadcast_rx = server.broadcast_sender().subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, broadcast_rx, state).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
        }
    }

    info!("Shutting down");
    manager.shutdown().await;
    Ok(())
}
