//! Agent scheduling for Ferry CI: the agent registry, cross-process agent
//! locks, build admission, command dispatch and the queues around them.

pub mod callback;
pub mod config;
pub mod dispatcher;
pub mod hosts;
pub mod jobs;
pub mod lock;
pub mod memory;
pub mod priority;
pub mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use callback::CallbackRouter;
pub use config::SchedulerConfig;
pub use dispatcher::{
    CmdDispatcher, Dispatch, DispatchConfig, DispatchOutcome, DispatchRequest, DispatchState,
    FailureReason,
};
pub use hosts::HostManager;
pub use jobs::{FlowQueues, QueuedJob};
pub use lock::DistributedLock;
pub use memory::{MemoryAgentStore, MemoryBroker, MemoryCoordinationService, MemorySession};
pub use priority::PriorityAdmissionQueue;
pub use registry::{AgentRegistry, ReclaimReport, spawn_persistence, spawn_reclaimer};
