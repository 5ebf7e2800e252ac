//! Fleet orchestration: the managed-client registry with bounded-parallel
//! startup, the phased shutdown coordinator, and the supervisor facade tying
//! config, store, events, and clients together.

pub mod fleet;
pub mod shutdown;
pub mod supervisor;

pub use fleet::{ConnectAllReport, FleetManager, FleetSettings};
pub use shutdown::{ShutdownCoordinator, ShutdownPhase, ShutdownProgress, ShutdownReport};
pub use supervisor::{ServerSnapshot, Supervisor, SupervisorOptions};
