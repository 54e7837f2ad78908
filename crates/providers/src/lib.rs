//! Provider adapters for opsloop.
//!
//! All providers implement the `opsloop_core::Provider` trait. The router
//! builds one gated adapter per configured provider.

pub mod anthropic;
mod http;
pub mod gate;
pub mod openai_compat;
pub mod router;

pub use anthropic::AnthropicProvider;
pub use gate::GatedProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use router::{PooledProvider, ProviderKind, ProviderPool, ProviderSettings, build_provider};
