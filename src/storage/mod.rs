pub mod template_store;

pub use template_store::{SubjectRecord, Template, TemplateStore};
