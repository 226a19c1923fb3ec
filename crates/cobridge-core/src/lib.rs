// cobridge-core: Resource observation engine, device registry, and the
// cloud connection manager that registers a device with a cloud service.

pub mod cloud;
pub mod config;
pub mod credentials;
pub mod device;
pub mod error;
pub mod resource;

// ── Primary re-exports ──────────────────────────────────────────────
pub use cloud::{CloudManager, SaveCallback};
pub use config::{
    CloudConfiguration, CloudManagerConfig, ConfigurationRepresentation, ConfigurationUpdate,
    PersistedState, ProvisioningStatus,
};
pub use credentials::{Credentials, CredentialsRecord};
pub use device::{Device, LinkFilter, Registry, ResourceTable};
pub use error::CoreError;
pub use resource::{Policy, Resource, ResourceBuilder};
