pub mod server;

pub use server::{AssignConfig, AssignMode, ServerConfig, SessionSection, StoreBackend};
