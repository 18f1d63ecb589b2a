// NVR broker integration
//
// Everything that talks to the external streaming broker (go2rtc):
// - supervisor: launch, adopt and tear down the broker process
// - api: typed HTTP client for the broker's control plane
// - registry: desired camera set and its reconciliation with the broker
// - health: periodic liveness and byte-flow checks with rate-limited restarts

pub mod api;
pub mod broker_config;
pub mod control;
pub mod health;
pub mod procfs;
pub mod registry;
pub mod source;
pub mod supervisor;

pub use api::{BrokerApiError, BrokerClient};
pub use control::BrokerControl;
pub use health::{HealthMonitor, HealthOptions, RecorderReconnect, TickOutcome};
pub use registry::{RegistryError, StreamRegistry, SyncReport};
pub use supervisor::{BrokerSupervisor, SupervisorError, SupervisorOptions};
