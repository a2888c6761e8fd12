//! systemd unit control (`systemd` namespace). Privileged only.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::bus::{BusCall, BusManager, CallClass};
use crate::context::StreamContext;
use crate::emitter::Emitter;
use crate::error::HandlerError;
use crate::registry::{Handler, RegistryBuilder};

use super::HandlerDeps;

const SYSTEMD_DESTINATION: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const SYSTEMD_MANAGER: &str = "org.freedesktop.systemd1.Manager";

/// Register the `systemd` namespace.
pub fn install(builder: &mut RegistryBuilder, deps: &HandlerDeps) {
    for (command, method) in [
        ("start", "StartUnit"),
        ("stop", "StopUnit"),
        ("restart", "RestartUnit"),
    ] {
        builder.register_privileged(
            "systemd",
            command,
            Arc::new(UnitAction {
                bus: Arc::clone(&deps.bus),
                method,
            }),
        );
    }
}

/// `systemd.start|stop|restart <unit>`: queue a unit job.
struct UnitAction {
    bus: Arc<BusManager>,
    method: &'static str,
}

#[async_trait]
impl Handler for UnitAction {
    async fn execute(
        &self,
        ctx: &StreamContext,
        args: &[String],
        emit: &Emitter,
    ) -> Result<(), HandlerError> {
        let unit = args
            .first()
            .filter(|unit| !unit.is_empty())
            .ok_or_else(|| HandlerError::bad_request("missing argument: unit"))?;

        tracing::info!(
            session = %ctx.session.session_id,
            user = %ctx.session.user,
            method = self.method,
            %unit,
            "unit action"
        );

        let call = BusCall::new(SYSTEMD_DESTINATION, SYSTEMD_PATH, SYSTEMD_MANAGER, self.method)
            .with_args("ss", vec![unit.clone(), "replace".to_string()]);
        let job = self.bus.call(CallClass::Apply, &call).await?;

        emit.result(json!({ "unit": unit, "job": job })).await?;
        Ok(())
    }
}
