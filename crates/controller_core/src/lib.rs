//! # Controller Core - Resumable Links and Address Routing
//!
//! The link layer of the cluster controller. Hosts (processes running game
//! server instances) and controls (administrative clients) connect to the
//! controller over long-lived WebSocket links; this crate keeps those links
//! alive across network blips and moves typed traffic between them.
//!
//! ## Architecture Overview
//!
//! ### Core Components
//!
//! * **Address** ([`address`]) - identifies the controller, a host, an
//!   instance, a control or a broadcast class
//! * **Session Connector** ([`connector`]) - one logical session across many
//!   raw sockets, with sequence numbered delivery, heartbeats and resume
//! * **Link Registry** ([`registry`]) - handshake server and the live map of
//!   host ids, control ids and session ids to links
//! * **Router** ([`router`]) - next-hop resolution, broadcast and the table of
//!   forwarded requests waiting for a reply
//! * **Link** ([`link`]) - ingress validation, permission checks and dispatch
//!   into the central [`handlers`] tables
//!
//! ### Message Flow
//!
//! 1. The [`ControllerServer`] accepts a TCP connection and upgrades it
//! 2. The registry sends `hello` and waits for `registerHost`,
//!    `registerControl` or `resume`
//! 3. Steady-state frames are sequenced by the connector and handed to the link
//! 4. The link dispatches to a local handler or asks the router to forward
//!
//! ## Collaborators
//!
//! Instance placement, users and host records live outside this crate and
//! are reached through the traits in [`collaborators`]. In-memory versions
//! are provided for tests and small deployments.
//!
//! ## Example
//!
//! ```rust,no_run
//! use controller_core::{
//!     builtin, Collaborators, ControllerConfig, ControllerServer, TokenSigner,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (collaborators, _memory) = Collaborators::in_memory();
//! let server = ControllerServer::new(
//!     ControllerConfig::default(),
//!     TokenSigner::new(b"secret".to_vec())?,
//!     collaborators,
//!     builtin::default_handlers()?,
//! )?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub use address::{Address, AddressType, BroadcastClass};
pub use collaborators::{
    Collaborators, HostDirectory, HostRegistration, InstanceDirectory, MemoryCollaborators,
    MemoryHostDirectory, MemoryInstanceDirectory, MemoryUserStore, User, UserStore,
    CONNECT_PERMISSION,
};
pub use config::ControllerConfig;
pub use connector::{Connector, ConnectorEvent, SessionState, SessionTiming};
pub use error::{
    CloseCode, ErrorCode, HandlerError, LinkError, RequestError, RouteError, ServerError,
};
pub use handlers::{
    EventMessage, HandlerContext, HandlerScope, HandlerTable, Permission, RequestMessage,
};
pub use link::{Link, LinkKind};
pub use message::{Frame, Message, PluginVersions};
pub use metrics::{LinkMetrics, LinkStats};
pub use registry::{LinkRegistry, RegistryEvent};
pub use router::{RouteOutcome, Router};
pub use server::{bind_listener, ControllerServer};
pub use token::{TokenError, TokenSigner};
pub use utils::current_timestamp_ms;

pub mod address;
pub mod builtin;
pub mod collaborators;
pub mod config;
pub mod connector;
pub mod error;
pub mod handlers;
pub mod link;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod socket;
pub mod token;
pub mod utils;
