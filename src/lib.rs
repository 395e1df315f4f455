// Core modules
pub mod common;
pub mod core;
pub mod sensor;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use common::{Config, Result, RidgelineError};
pub use core::{MatchEngine, MatchIndex, SimilarityTransform};
pub use sensor::{Frame, FrameSource, ImageDirSource};
pub use service::{
    AuthDecision, Authority, ConnId, Device, DeviceEvent, DeviceHandle, Manager, StaticAuthority,
};
pub use storage::{SubjectRecord, Template, TemplateStore};
