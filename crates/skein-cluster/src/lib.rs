//! skein-cluster — cluster membership on top of skein RPC.
//!
//! # Architecture
//!
//! ```text
//! Register server
//!   ├── Server (skein-rpc) hosting RegisterService per connection
//!   │   ├── reg      → Registry::register → reg.ok {id, key, ip, hosts}
//!   │   │              then `add` to every other live node
//!   │   └── on_close → Registry::disconnect → `remove` to the others
//!   ├── Sweeper (fixed interval)
//!   │   └── Registry::sweep → hard delete / missed-close soft delete
//!   └── Registry
//!       └── StateStore (skein-state, redb)
//!
//! Node
//!   └── RegistrationClient (Session: heartbeat + reconnect)
//!       └── MembershipView  (group, id) → Host, watch notifications
//! ```

pub mod client;
pub mod error;
pub mod node;
pub mod registry;
pub mod server;
pub mod service;
pub mod sweeper;
pub mod types;
pub mod view;

pub use client::{RegistrationClient, RegistrationConfig};
pub use error::{ClusterError, ClusterResult};
pub use node::NodeService;
pub use registry::{Registration, Registry, RegistryConfig, SweepReport};
pub use server::{RegisterHandle, RegisterServer, RegisterServerConfig};
pub use service::{REGISTER_SERVICE, RegisterService};
pub use types::{Assignment, RegisterReply, RegisterRequest, RemovedNode};
pub use view::MembershipView;
