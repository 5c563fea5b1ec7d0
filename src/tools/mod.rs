//! Tool bindings, per-agent catalogs, and the remote action client.

pub mod binding;
pub mod catalog;
pub mod remote;

pub use binding::ToolBinding;
pub use catalog::{CatalogAssembler, ToolCatalog};
pub use remote::{ActionClient, ActionResponse, HttpActionClient};
