pub mod chat;
pub mod config;
pub mod correlator;
pub mod error;
pub mod models;
pub mod prompt;

pub use chat::{
    AnalysisBackend, ChatClient, ChatConfig, ChatError, DeltaDecoder, DeltaStream, SYSTEM_PROMPT,
};
pub use config::TracelensConfig;
pub use correlator::{split_categories, ExchangeObserver, ObservedExchange, TraceCorrelator};
pub use error::TracelensError;
pub use prompt::{build_prompt, is_successful, FormatError, PromptOutcome};
