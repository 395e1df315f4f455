pub mod authority;
pub mod device;
pub mod events;
pub mod manager;
pub mod session;

pub use authority::{AuthDecision, Authority, StaticAuthority};
pub use device::{ConnId, Device, DeviceHandle};
pub use events::{DeviceEvent, EnrollResult, VerifyResult};
pub use manager::Manager;
pub use session::SessionState;
