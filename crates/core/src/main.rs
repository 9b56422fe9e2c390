use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bus::EventBus;
use commands::{ChangesetManager, CommandManager, CommandService, PriorValueSource};
use devices::{DeviceManager, DeviceService};
use diagnostics::{DiagnosticsEngine, DiagnosticsService, Scheduler};
use events::{EventProcessor, EventService};
use llm::{SessionManager, ToolContext, ToolRegistry, WorkflowEngine};
use mcp::{McpAdapter, McpRequest, ResourceCatalog};
use miette::Result;
use owo_colors::OwoColorize;
use roaming::{RoamingDetector, RoamingHistoryEngine, RoamingService};
use router::RouterService;
use serde_json::Value;
use storage::Store;
use tokio::signal;
use topology::{InferenceService, QualityMonitor, TopologyManager};
use tracing::{error, info, warn};
use transport::MqttTransport;
use types::system_service::Service;
use types::{DeviceId, WifiMode};

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Depth of the transport -> router hand-off channel.
const INBOUND_QUEUE: usize = 4096;

/// Captures pre-execute values for reversible operations by reading the
/// live device model.
struct ModelPriorValues {
    devices: Arc<DeviceManager>,
}

#[async_trait]
impl PriorValueSource for ModelPriorValues {
    async fn capture(&self, device: &DeviceId, operation: &str, _args: &Value) -> Option<Value> {
        let record = self.devices.get(device).await?;
        match operation {
            "configure_wifi" | "set_channel" => {
                let ap = record
                    .interfaces
                    .iter()
                    .find_map(|i| i.wifi.as_ref().filter(|w| w.mode == WifiMode::Ap))?;
                Some(serde_json::json!({
                    "ssid": ap.ssid,
                    "channel": ap.channel,
                    "band": ap.band,
                }))
            }
            "set_tx_power" => record.attributes.get("tx_power").cloned().map(|v| {
                serde_json::json!({ "tx_power": v })
            }),
            _ => None,
        }
    }
}

pub struct System {
    transport: Arc<MqttTransport>,
    router: Arc<RouterService>,
    event_bus: Arc<EventBus>,
    device_service: Arc<DeviceService>,
    event_service: Arc<EventService>,
    command_service: Arc<CommandService>,
    inference_service: Arc<InferenceService>,
    roaming_service: Arc<RoamingService>,
    diagnostics_service: Arc<DiagnosticsService>,
}

impl System {
    pub async fn start(&self) -> Result<()> {
        info!("Starting event bus...");
        self.event_bus.clone().start().await?;

        info!("Starting device service...");
        self.device_service.clone().start().await?;

        info!("Starting event service...");
        self.event_service.clone().start().await?;

        info!("Starting command service...");
        self.command_service.clone().start().await?;

        info!("Starting inference service...");
        self.inference_service.clone().start().await?;

        info!("Starting roaming service...");
        self.roaming_service.clone().start().await?;

        info!("Starting diagnostics service...");
        self.diagnostics_service.clone().start().await?;

        info!("Starting router...");
        self.router.clone().start().await?;

        // Transport last: messages only flow once every consumer is up.
        info!("Starting MQTT transport...");
        self.transport.clone().start().await?;

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        // Reverse order: stop the intake first, drain the rest.
        info!("Stopping MQTT transport...");
        self.transport.stop().await?;

        info!("Stopping router...");
        self.router.stop().await?;

        info!("Stopping diagnostics service...");
        self.diagnostics_service.stop().await?;

        info!("Stopping roaming service...");
        self.roaming_service.stop().await?;

        info!("Stopping inference service...");
        self.inference_service.stop().await?;

        info!("Stopping command service...");
        self.command_service.stop().await?;

        info!("Stopping event service...");
        self.event_service.stop().await?;

        info!("Stopping device service...");
        self.device_service.stop().await?;

        info!("Stopping event bus...");
        self.event_bus.stop().await?;

        Ok(())
    }
}

/// Serve the MCP envelope over stdin/stdout: one JSON request per line.
async fn serve_mcp_stdio(adapter: Arc<McpAdapter>) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<McpRequest>(&line) {
            Ok(request) => adapter.handle(request).await,
            Err(e) => mcp::McpResponse::err(None, mcp::McpErrorBody::invalid_params(e.to_string())),
        };
        let mut payload = serde_json::to_vec(&response)
            .unwrap_or_else(|_| b"{\"error\":{\"code\":-32603,\"message\":\"encode\"}}".to_vec());
        payload.push(b'\n');
        if stdout.write_all(&payload).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    logging::setup_logging()?;

    info!("");
    info!("   {} {}", "◆ Lattice".cyan(), VERSION.cyan());

    // Configuration: missing file falls back to defaults, malformed file
    // is a hard configuration error.
    let config_path =
        std::env::var("LATTICE_CONFIG").unwrap_or_else(|_| "./config/lattice.yaml".to_string());
    let cfg = if Path::new(&config_path).exists() {
        match config::Config::from_file(&config_path).await {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("{:?}", miette::Report::new(e));
                std::process::exit(mcp::exit_codes::CONFIG_ERROR);
            }
        }
    } else {
        info!("no config at {config_path}, using defaults");
        config::Config::default()
    };

    // Shared infrastructure.
    let store = Store::new();
    let event_bus = Arc::new(EventBus::new());

    // Transport -> router channel.
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(INBOUND_QUEUE);
    let transport = Arc::new(MqttTransport::new(
        cfg.mqtt.clone(),
        cfg.namespace.clone(),
        inbound_tx,
    ));
    let router = Arc::new(RouterService::new(inbound_rx, event_bus.clone()));

    // Device and event planes.
    let device_mgr = Arc::new(DeviceManager::new(
        store.clone(),
        cfg.devices.offline_threshold_s as i64 * 1000,
    ));
    let device_service = Arc::new(DeviceService::new(device_mgr.clone(), event_bus.clone()));
    let event_processor = Arc::new(EventProcessor::new(store.clone(), cfg.events.queue_capacity));
    let event_service = Arc::new(EventService::new(event_processor.clone(), event_bus.clone()));

    // Command plane.
    let publisher: Arc<dyn commands::RequestPublisher> = Arc::new(transport.publisher());
    let command_mgr = Arc::new(CommandManager::new(store.clone(), publisher));
    let command_service = Arc::new(CommandService::new(command_mgr.clone(), event_bus.clone()));
    let changeset_mgr = Arc::new(ChangesetManager::new(
        store.clone(),
        command_mgr.clone(),
        Arc::new(ModelPriorValues {
            devices: device_mgr.clone(),
        }),
    ));

    // Topology plane.
    let topology_mgr = Arc::new(TopologyManager::new(device_mgr.clone(), cfg.inference.clone()));
    let quality = Arc::new(QualityMonitor::new(cfg.inference.interval_s as i64 * 1000));
    let inference_service = Arc::new(InferenceService::new(
        topology_mgr.clone(),
        quality,
        event_bus.clone(),
        &cfg.inference,
    ));

    // Roaming plane.
    let detector = Arc::new(RoamingDetector::new(
        store.clone(),
        cfg.roaming.roaming_window_s as i64 * 1000,
    ));
    let history = Arc::new(RoamingHistoryEngine::new(
        detector.clone(),
        cfg.roaming.clone(),
        &cfg.history,
    ));
    let roaming_service = Arc::new(RoamingService::new(
        detector,
        history.clone(),
        event_bus.clone(),
    ));

    // Diagnostics plane.
    let diag_engine = Arc::new(DiagnosticsEngine::new(
        command_mgr.clone(),
        store.clone(),
        cfg.diagnostics.max_concurrent_site,
    ));
    let diagnostics_service = Arc::new(DiagnosticsService::new(
        diag_engine.clone(),
        Arc::new(Scheduler::new()),
        device_mgr.clone(),
        cfg.diagnostics.clone(),
    ));

    // LLM tool surface.
    let tool_ctx = Arc::new(ToolContext {
        devices: device_mgr,
        topology: topology_mgr,
        roaming: history,
        diagnostics: diag_engine,
        commands: command_mgr,
        changesets: changeset_mgr,
        namespace: cfg.namespace.clone(),
    });
    let registry = Arc::new(ToolRegistry::new(tool_ctx.clone()));
    llm::register_builtin_tools(&registry).await;
    let workflow_engine = Arc::new(WorkflowEngine::new(registry.clone()));

    if let Some(dir) = &cfg.workflows_dir {
        match config::WorkflowSet::load_dir(dir).await {
            Ok(set) => {
                let report = llm::load_workflows(&workflow_engine, set).await;
                for warning in &report.warnings {
                    warn!("workflow config: {warning}");
                }
                if !report.is_valid {
                    for err in &report.errors {
                        error!("workflow config: {err}");
                    }
                    std::process::exit(mcp::exit_codes::CONFIG_ERROR);
                }
            }
            Err(e) => {
                error!("{:?}", miette::Report::new(e));
                std::process::exit(mcp::exit_codes::CONFIG_ERROR);
            }
        }
    }

    let session_mgr = Arc::new(SessionManager::new(store, registry));
    let adapter = Arc::new(McpAdapter::new(
        session_mgr,
        workflow_engine,
        ResourceCatalog::new(tool_ctx),
    ));

    let system = Arc::new(System {
        transport,
        router,
        event_bus,
        device_service,
        event_service,
        command_service,
        inference_service,
        roaming_service,
        diagnostics_service,
    });

    if let Err(e) = system.clone().start().await {
        error!("startup failed: {e}");
        std::process::exit(mcp::exit_codes::RUNTIME_FAILURE);
    }
    info!(
        "System running after {:?}, press Ctrl+C to exit",
        start_time.elapsed()
    );

    // Optional MCP stdio endpoint for an external LLM host.
    if std::env::args().any(|a| a == "--mcp-stdio") {
        let adapter = adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_mcp_stdio(adapter).await {
                error!("mcp stdio endpoint failed: {e}");
            }
        });
    }

    match signal::ctrl_c().await {
        Ok(()) => {
            system.stop().await?;
            std::process::exit(mcp::exit_codes::SUCCESS);
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            std::process::exit(mcp::exit_codes::RUNTIME_FAILURE);
        }
    }
}
