//! NetworkManager queries (`dbus` namespace).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::bus::{BusCall, BusManager, CallClass};
use crate::context::StreamContext;
use crate::emitter::Emitter;
use crate::error::HandlerError;
use crate::registry::{Handler, RegistryBuilder};

use super::HandlerDeps;

const NM_DESTINATION: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";

/// Register the `dbus` namespace.
pub fn install(builder: &mut RegistryBuilder, deps: &HandlerDeps) {
    builder.register(
        "dbus",
        "GetNetworkInfo",
        Arc::new(GetNetworkInfo {
            bus: Arc::clone(&deps.bus),
        }),
    );
}

/// `dbus.GetNetworkInfo`: NetworkManager's top-level properties.
struct GetNetworkInfo {
    bus: Arc<BusManager>,
}

#[async_trait]
impl Handler for GetNetworkInfo {
    async fn execute(
        &self,
        _ctx: &StreamContext,
        _args: &[String],
        emit: &Emitter,
    ) -> Result<(), HandlerError> {
        let call = BusCall::new(
            NM_DESTINATION,
            NM_PATH,
            "org.freedesktop.DBus.Properties",
            "GetAll",
        )
        .with_args("s", vec![NM_DESTINATION.to_string()]);

        let properties = self.bus.call(CallClass::Read, &call).await?;
        emit.result(json!({ "network": properties })).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, BusTransport};
    use crate::context::SessionInfo;
    use crate::runtime::{BridgeConfig, BridgeRuntime};
    use linuxio_mux::{Multiplexer, MuxConfig, StreamEvent};
    use linuxio_proto::OpenRequest;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Stub bus: fails once with `Closed`, then answers.
    struct FlakyNm {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BusTransport for FlakyNm {
        async fn call(&self, call: &BusCall) -> Result<Value, BusError> {
            assert_eq!(call.member, "GetAll");
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                Err(BusError::Closed("stale".to_string()))
            } else {
                Ok(json!({ "Version": "1.44.2", "State": 70 }))
            }
        }
    }

    fn network_runtime(bus: Arc<BusManager>) -> BridgeRuntime {
        let session = SessionInfo {
            session_id: "09".repeat(16),
            user: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            privileged: false,
        };
        let deps = HandlerDeps {
            bus,
            shutdown: CancellationToken::new(),
        };
        let mut builder = RegistryBuilder::new();
        install(&mut builder, &deps);
        BridgeRuntime::new(BridgeConfig::new(session, "secret"), builder.freeze())
    }

    #[tokio::test]
    async fn test_get_network_info_retries_closed_connection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory_calls = Arc::clone(&calls);
        let bus = Arc::new(BusManager::new(Box::new(move || {
            Arc::new(FlakyNm {
                calls: Arc::clone(&factory_calls),
            }) as Arc<dyn BusTransport>
        })));

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let runtime = network_runtime(bus);
        {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.serve_stream(server_io).await });
        }

        let client = Multiplexer::client(client_io, MuxConfig::default());
        let mut handle = client
            .open_stream(&OpenRequest::new("call", "dbus", "GetNetworkInfo", vec![]))
            .await
            .unwrap();

        match handle.next_event().await.unwrap() {
            StreamEvent::Result(result) => {
                // The first failure never surfaced; the retry's payload did.
                assert!(result.is_ok(), "{result:?}");
                assert_eq!(result.data.unwrap()["network"]["Version"], "1.44.2");
            }
            other => panic!("expected result, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
