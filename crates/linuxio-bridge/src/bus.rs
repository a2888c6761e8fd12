//! Shared system-bus discipline.
//!
//! Every D-Bus call a handler makes goes through the [`BusManager`]: one
//! process-wide mutex per bridge (concurrent `CreateTransaction` storms
//! in PackageKit are not survivable), a deadline per call class, and a
//! single reconnect-and-retry when the connection reports closed.
//!
//! The transport is a trait. The shipped [`BusctlTransport`] shells out
//! to `busctl --json=short`; tests inject stubs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// System-bus errors.
#[derive(Debug, Error, Clone)]
pub enum BusError {
    /// The bus itself is unreachable.
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// The connection was closed under us; retryable once.
    #[error("bus connection closed: {0}")]
    Closed(String),

    /// The called service returned an error.
    #[error("bus call failed: {name}: {message}")]
    Call {
        /// D-Bus error name.
        name: String,
        /// Error message from the service.
        message: String,
    },

    /// The per-class deadline passed.
    #[error("bus call timed out ({0})")]
    Timeout(&'static str),

    /// The reply did not decode.
    #[error("bus reply decode failed: {0}")]
    Decode(String),
}

impl BusError {
    /// Whether a fresh connection may fix this.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, BusError::Closed(_))
    }
}

/// Deadline class of a bus call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Property reads and queries.
    Read,
    /// State-changing applies (unit start/stop, connection changes).
    Apply,
    /// Offline-update triggers.
    Trigger,
    /// Long streaming transactions (package installs with signals).
    Streaming,
}

impl CallClass {
    /// The class deadline.
    #[must_use]
    pub fn deadline(self) -> Duration {
        match self {
            CallClass::Read => Duration::from_secs(5),
            CallClass::Apply => Duration::from_secs(8),
            CallClass::Trigger => Duration::from_secs(10),
            CallClass::Streaming => Duration::from_secs(30 * 60),
        }
    }

    /// Label for timeouts and logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            CallClass::Read => "read",
            CallClass::Apply => "apply",
            CallClass::Trigger => "trigger",
            CallClass::Streaming => "streaming",
        }
    }
}

/// One method call.
#[derive(Debug, Clone)]
pub struct BusCall {
    /// Service destination.
    pub destination: String,
    /// Object path.
    pub path: String,
    /// Interface name.
    pub interface: String,
    /// Method member.
    pub member: String,
    /// Argument signature, empty for no arguments.
    pub signature: String,
    /// Arguments in `busctl` text form.
    pub args: Vec<String>,
}

impl BusCall {
    /// An argumentless call.
    #[must_use]
    pub fn new(
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            signature: String::new(),
            args: Vec::new(),
        }
    }

    /// Attach arguments with their signature.
    #[must_use]
    pub fn with_args(mut self, signature: impl Into<String>, args: Vec<String>) -> Self {
        self.signature = signature.into();
        self.args = args;
        self
    }
}

/// A bus connection capable of method calls.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Perform one method call, returning the decoded reply body.
    async fn call(&self, call: &BusCall) -> Result<Value, BusError>;
}

/// Produces fresh transports for the retry-once policy.
pub type TransportFactory = Box<dyn Fn() -> Arc<dyn BusTransport> + Send + Sync>;

/// Serialized access to the system bus with deadlines and retry-once.
pub struct BusManager {
    transport: tokio::sync::Mutex<Arc<dyn BusTransport>>,
    factory: TransportFactory,
}

impl BusManager {
    /// Manager over a transport factory; the factory is invoked once
    /// now and once per reconnect.
    #[must_use]
    pub fn new(factory: TransportFactory) -> Self {
        let transport = factory();
        Self {
            transport: tokio::sync::Mutex::new(transport),
            factory,
        }
    }

    /// Manager over the shipped `busctl` transport.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Box::new(|| Arc::new(BusctlTransport::system())))
    }

    /// Perform a call under the bus mutex with the class deadline.
    ///
    /// If the connection reports closed, a fresh transport is built and
    /// the call retried exactly once.
    ///
    /// # Errors
    ///
    /// Returns the transport's error, or `BusError::Timeout` when the
    /// class deadline passes.
    pub async fn call(&self, class: CallClass, call: &BusCall) -> Result<Value, BusError> {
        let mut transport = self.transport.lock().await;

        match Self::call_with_deadline(&**transport, class, call).await {
            Err(err) if err.is_closed() => {
                tracing::debug!(
                    member = %call.member,
                    error = %err,
                    "bus connection closed, reconnecting once"
                );
                *transport = (self.factory)();
                Self::call_with_deadline(&**transport, class, call).await
            }
            other => other,
        }
    }

    async fn call_with_deadline(
        transport: &dyn BusTransport,
        class: CallClass,
        call: &BusCall,
    ) -> Result<Value, BusError> {
        match tokio::time::timeout(class.deadline(), transport.call(call)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(class.label())),
        }
    }
}

/// Transport shelling out to `busctl` per call. Stateless, so "closed"
/// never originates here; the variant exists for transports that hold a
/// connection.
pub struct BusctlTransport {
    system: bool,
}

impl BusctlTransport {
    /// Transport against the system bus.
    #[must_use]
    pub fn system() -> Self {
        Self { system: true }
    }

    /// Transport against the session bus.
    #[must_use]
    pub fn session() -> Self {
        Self { system: false }
    }
}

#[async_trait]
impl BusTransport for BusctlTransport {
    async fn call(&self, call: &BusCall) -> Result<Value, BusError> {
        let mut command = tokio::process::Command::new("busctl");
        command
            .arg(if self.system { "--system" } else { "--user" })
            .arg("--json=short")
            .arg("call")
            .arg(&call.destination)
            .arg(&call.path)
            .arg(&call.interface)
            .arg(&call.member);
        if !call.signature.is_empty() {
            command.arg(&call.signature);
            command.args(&call.args);
        }

        let output = command.output().await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                BusError::Unavailable("busctl not installed".to_string())
            } else {
                BusError::Unavailable(err.to_string())
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("Connection reset") || stderr.contains("connection closed") {
                return Err(BusError::Closed(stderr));
            }
            return Err(BusError::Call {
                name: "busctl".to_string(),
                message: stderr,
            });
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout).map_err(|err| BusError::Decode(err.to_string()))
    }
}
