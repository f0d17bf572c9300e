pub mod chat;
pub mod error;
pub mod events;
pub mod models;
pub mod session;

pub use error::{ChatError, ChatResult, ProviderError, ProviderErrorKind};
