use std::sync::Arc;

use commands::{ChangesetManager, CommandManager};
use devices::DeviceManager;
use diagnostics::DiagnosticsEngine;
use roaming::RoamingHistoryEngine;
use topology::TopologyManager;

/// The dependency slice tools run against. Built once at startup from the
/// root container and shared by every tool invocation.
pub struct ToolContext {
    pub devices: Arc<DeviceManager>,
    pub topology: Arc<TopologyManager>,
    pub roaming: Arc<RoamingHistoryEngine>,
    pub diagnostics: Arc<DiagnosticsEngine>,
    pub commands: Arc<CommandManager>,
    pub changesets: Arc<ChangesetManager>,
    pub namespace: config::NamespaceConfig,
}
