//! boxlet: master/proxy/worker process runtime routing binary envelopes to
//! command handlers.

mod health;
mod launch;
mod logging;
mod version;

pub mod admin;
pub mod app;
pub mod bridge;
pub mod client;
pub mod config;
pub mod envelope;
pub mod group;
pub mod master;
pub mod permit;
pub mod proxy;
pub mod request;
pub mod role;
pub mod route;
pub mod stats;
pub mod worker;

pub use app::{Application, ApplicationBuilder, BuildError};
pub use client::{Client, ClientError};
pub use config::{AdminConfig, ConfigError, GroupId, MasterConfig, RespawnPolicy, WorkerGroup};
pub use envelope::{Cmd, DecodeError, Envelope, EnvelopeCodec, ErrorBody, ErrorCode, pack, unpack};
pub use health::Health;
pub use launch::run;
pub use logging::init_tracing;
pub use master::{ExecSpawner, Master, MasterError, MasterState, ProcessSpawner, SpawnError};
pub use proxy::{Proxy, ProxyError, ProxyServer};
pub use request::{HandlerError, Reply, ReplyPatch, Request, RequestState};
pub use role::{ChildMarker, ProcessRole};
pub use route::{Blueprint, DuplicateRouteError, Handler, Route, handler_fn};
pub use version::{BOXLET_VERSION, VersionInfo};
pub use worker::{TransportError, WorkerContext, run_worker};
