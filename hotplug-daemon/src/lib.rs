//! hotplug daemon: event queue, worker pool, retry timers, dispatch loop,
//! broadcast gateway and the control socket runtime.

pub mod broadcast;
pub mod engine;
mod error;
pub mod finalizer;
pub mod paths;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod retry;
pub mod runner;
mod runtime;
pub mod source;
pub mod timers;

pub use broadcast::{BroadcastGateway, MonitorTransport, Transport};
pub use engine::{ControlMessage, Engine, EngineSettings, EngineStats, EngineStatus};
pub use error::{DaemonError, DependencyError, TransportError};
pub use finalizer::{Finalized, Finalizer};
pub use pool::{WorkerCompletion, WorkerId, WorkerPool, WorkerState};
pub use protocol::{
    monitor, request_ping, request_set_paused, request_settle, request_status, request_stop,
    request_trigger, send_request, DaemonRequest, DaemonResponse,
};
pub use queue::{BlockState, DependencyResolver, DevpathResolver, Event, EventQueue, Ready};
pub use retry::{RetryPolicy, RetryState};
pub use runner::{CommandRunner, Job, PassthroughRunner, RuleRunner};
pub use runtime::{init_tracing, load_config, run, start_blocking, DaemonOptions};
pub use source::{ChannelSource, EventSender, EventSource, JsonLinesSource};
