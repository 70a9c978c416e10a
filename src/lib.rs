/*!
corebridge: native backend for core-manager desktop UIs.

Three subsystems talk to the UI only through an event bus:
- `server`: embedded HTTP servers that forward requests to the UI and wait
  for its reply, plus static file serving and uploads;
- `client`: cancellable outbound HTTP with proxy support and progress events;
- `process`: supervised child processes with graceful-then-forced termination.

`host` maps named calls onto them and runs the JSON-lines stdio transport.
*/

pub mod client;
pub mod config;
pub mod correlation;
pub mod doctor;
pub mod env;
pub mod errors;
pub mod events;
pub mod host;
pub mod logging;
pub mod process;
pub mod server;
pub mod types;
pub mod util;

pub use client::OutboundClient;
pub use config::BridgeConfig;
pub use correlation::{CorrelationRegistry, NotFound, Outcome, ResponseData};
pub use env::{AppEnv, TASK_SCHEDULER_ARG};
pub use errors::{display_for_bridge_error, is_not_found, BridgeError};
pub use events::{BusEvent, EventArgs, EventBus, LocalBus, Subscription};
pub use host::Bridge;
pub use logging::init_logging;
pub use process::{ProcessControl, Supervisor, SystemControl, Termination};
pub use server::BridgeServers;
pub use types::{
    BodyMode, ExecOptions, FlagResult, HttpResult, IoOptions, RequestOptions, ServerOptions,
    WireHeaders,
};
