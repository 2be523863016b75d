//! Price lookup capability, sessions, and the configurable HTML source.
//!
//! This crate provides:
//! - [`SessionFactory`] / [`LookupSession`]: the opaque per-source lookup
//!   contract the orchestration core is written against
//! - [`LookupError`]: per-item failure classes (not found, failed, session died)
//! - [`HtmlSource`]: a CSS-selector driven implementation over HTTP
//! - [`SourceRegistry`]: configured sources by name

pub mod capability;
pub mod html;
pub mod registry;

pub use capability::{LookupError, LookupSession, SessionFactory};
pub use html::HtmlSource;
pub use registry::SourceRegistry;
