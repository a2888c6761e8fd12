//! Bridge control operations.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::context::StreamContext;
use crate::emitter::Emitter;
use crate::error::HandlerError;
use crate::registry::{Handler, RegistryBuilder};

use super::HandlerDeps;

/// Register the `control` namespace.
pub fn install(builder: &mut RegistryBuilder, deps: &HandlerDeps) {
    builder.register("control", "ping", Arc::new(Ping));
    builder.register("control", "sessions", Arc::new(Sessions));
    builder.register(
        "control",
        "shutdown",
        Arc::new(Shutdown {
            trigger: deps.shutdown.clone(),
        }),
    );
}

/// Liveness probe.
struct Ping;

#[async_trait]
impl Handler for Ping {
    async fn execute(
        &self,
        ctx: &StreamContext,
        _args: &[String],
        emit: &Emitter,
    ) -> Result<(), HandlerError> {
        emit.result(json!({
            "message": "pong",
            "session": ctx.session.session_id,
            "user": ctx.session.user,
        }))
        .await?;
        Ok(())
    }
}

/// Active session records reachable through this bridge. Privilege
/// separation gives every bridge exactly one, so the list has one
/// entry; aggregation across users happens in the web tier.
struct Sessions;

#[async_trait]
impl Handler for Sessions {
    async fn execute(
        &self,
        ctx: &StreamContext,
        _args: &[String],
        emit: &Emitter,
    ) -> Result<(), HandlerError> {
        emit.result(json!({
            "sessions": [{
                "id": ctx.session.session_id,
                "user": ctx.session.user,
                "uid": ctx.session.uid,
                "gid": ctx.session.gid,
                "privileged": ctx.session.privileged,
            }],
        }))
        .await?;
        Ok(())
    }
}

/// Orderly bridge shutdown: answer first, then trigger the drain.
struct Shutdown {
    trigger: CancellationToken,
}

#[async_trait]
impl Handler for Shutdown {
    async fn execute(
        &self,
        ctx: &StreamContext,
        _args: &[String],
        emit: &Emitter,
    ) -> Result<(), HandlerError> {
        tracing::info!(session = %ctx.session.session_id, "shutdown requested");
        emit.result(json!({ "shutting_down": true })).await?;
        self.trigger.cancel();
        Ok(())
    }
}
