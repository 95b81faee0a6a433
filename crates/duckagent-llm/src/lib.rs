//! Language-model adapters used by the router's fallback classifier, the
//! planner's free-form expansion, and the reference SQL/summary steps.
//!
//! Provides the `LanguageModel` trait, an OpenAI chat adapter, a deterministic
//! mock, and `TokenLedger` for explicit token accounting.

mod ledger;
mod mock;
mod model;
mod openai;
mod types;

pub use ledger::{MeteredModel, TokenLedger};
pub use mock::MockModel;
pub use model::{DynModel, LanguageModel};
pub use openai::OpenAiChat;
pub use types::*;
