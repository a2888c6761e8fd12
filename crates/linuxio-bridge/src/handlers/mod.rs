//! Built-in handler modules installed at bridge startup.
//!
//! This is the representative set the core routes to: file transfer and
//! archiving, the PTY terminal, system-bus operations, and bridge
//! control. Deeper domain modules (containers, storage, VPN) hang off
//! the same registry but live outside the core.

pub mod control;
pub mod filebrowser;
pub mod network;
pub mod systemd;
pub mod terminal;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bus::BusManager;
use crate::registry::RegistryBuilder;

/// Shared services handed to handler modules at installation.
pub struct HandlerDeps {
    /// Serialized system-bus access.
    pub bus: Arc<BusManager>,
    /// Bridge shutdown trigger, shared with `control.shutdown`.
    pub shutdown: CancellationToken,
}

/// Install every built-in module into the registry.
pub fn install(builder: &mut RegistryBuilder, deps: &HandlerDeps) {
    control::install(builder, deps);
    filebrowser::install(builder);
    terminal::install(builder);
    network::install(builder, deps);
    systemd::install(builder, deps);
}
