//! # magikd
//!
//! **Container Engine Core**
//!
//! This crate is the daemon side of a container engine: layered filesystem
//! storage, an image graph, a container registry with a persistent name
//! graph, and container lifecycles driven through pluggable execution and
//! network backends. It does not parse CLI arguments or serve an API; a
//! front end owns a [`Daemon`] and calls into it.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Daemon                                 │
//! │  create → start → kill / stop / restart → pause / unpause           │
//! │  commit │ changes │ diff │ mount │ restore on boot │ shutdown       │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐  ┌──────────────────┐  ┌───────────────┐  │
//! │  │   ContainerStore     │  │    LinkGraph     │  │  TruncIndex   │  │
//! │  │  id → Arc<Container> │  │  /name → id      │  │  id prefixes  │  │
//! │  │                      │  │  /a/alias → id   │  │               │  │
//! │  └──────────────────────┘  └──────────────────┘  └───────────────┘  │
//! │                                                                     │
//! │  ┌───────────────────────────────────────────────────────────────┐  │
//! │  │                          Graph                                │  │
//! │  │   images: <root>/graph/<id>/{json,layersize}                  │  │
//! │  └──────────────────────────────┬────────────────────────────────┘  │
//! ├─────────────────────────────────┼───────────────────────────────────┤
//! │                      Backends   │                                   │
//! │  ┌──────────────────────────────┴──┐  ┌────────────┐  ┌──────────┐  │
//! │  │          GraphDriver            │  │ ExecDriver │  │ Network  │  │
//! │  │  vfs (copy) │ layered (diff dir)│  │  (trait)   │  │ Backend  │  │
//! │  │  NaiveDiffDriver for diff/apply │  │            │  │ (bridge) │  │
//! │  └─────────────────────────────────┘  └────────────┘  └──────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌─────────┐  start   ┌─────────┐  pause   ┌────────┐
//!   │ Created │ ───────► │ Running │ ───────► │ Paused │
//!   └─────────┘          └────┬────┘ ◄─────── └────────┘
//!                             │  ▲    unpause
//!                        exit │  │ restart policy
//!                             ▼  │
//!                        ┌────────────┐
//!                        │ Restarting │
//!                        └─────┬──────┘
//!                              │ policy says no / user stop
//!                              ▼
//!                         ┌─────────┐
//!                         │ Stopped │ ──── start ────► Running
//!                         └─────────┘
//! ```
//!
//! # Persisted Layout
//!
//! ```text
//! <root>/
//! ├── <driver>/            graph driver storage (vfs, layered)
//! ├── graph/               image records
//! │   └── _tmp/            staging for registration and deletion
//! ├── containers/<id>/     container records (see [`container`])
//! └── linkgraph.db         names and links (redb)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use magikd::{Daemon, DaemonBackends, DaemonConfig, BridgeNetwork};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> magikd::Result<()> {
//!     let backends = DaemonBackends::new(Arc::new(MyExecDriver::new()))
//!         .with_network(Arc::new(BridgeNetwork::new()));
//!     let daemon = Daemon::new(DaemonConfig::with_root("/var/lib/magikd"), backends).await?;
//!
//!     let container = daemon
//!         .create(Default::default(), Default::default(), "busybox", "web")
//!         .await?;
//!     daemon.start(&container).await?;
//!     daemon.shutdown().await
//! }
//! ```

pub mod archive;
pub mod config;
pub mod constants;
pub mod container;
pub mod containers;
pub mod daemon;
pub mod error;
pub mod etchosts;
pub mod execdriver;
pub mod fsutil;
pub mod graph;
pub mod graphdriver;
pub mod image;
pub mod linkgraph;
pub mod links;
pub mod names;
pub mod network;
pub mod resolvconf;
pub mod runconfig;
pub mod state;
pub mod streams;
pub mod sysinfo;
pub mod truncindex;

// Re-exports
pub use archive::{Change, ChangeKind, LayerArchive};
pub use config::DaemonConfig;
pub use constants::*;
pub use container::{Container, NetworkSettings};
pub use daemon::{Daemon, DaemonBackends};
pub use error::{Error, Result};
pub use execdriver::{Command, ExecDriver, ExitStatus, Pipes, ProcessInfo, Signal, StartCallback};
pub use graph::Graph;
pub use graphdriver::{DriverRegistry, GraphDriver, ProtoDriver};
pub use image::Image;
pub use linkgraph::LinkGraph;
pub use network::{BridgeNetwork, NetworkBackend};
pub use runconfig::{HostConfig, NetworkMode, RestartPolicy, RunConfig};
pub use state::{State, Status};
pub use sysinfo::SysInfo;
pub use truncindex::TruncIndex;
