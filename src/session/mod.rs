//! # Sessions
//!
//! Connected-client state and the structures that feed the writers.
//!
//! ## Components
//! - **Session**: one client, composed of a stream channel plus optional datagram
//!   and KCP channels
//! - **Queue**: bounded outbound packet queue with a pluggable overload policy
//! - **Manager**: registry indexed by session id, UDP conveying id and KCP conv
//! - **Partition**: deterministic sharding of work across independent queues

pub mod channel;
pub mod manager;
pub mod partition;
pub mod queue;
#[allow(clippy::module_inception)]
pub mod session;

pub use manager::SessionManager;
pub use partition::{QueuePartitionManager, TicketQueue};
pub use queue::{DefaultPacketQueuePolicy, NoSheddingPolicy, PacketQueue, PacketQueuePolicy};
pub use session::Session;
