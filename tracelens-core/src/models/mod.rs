pub mod session;
pub mod step;

pub use session::{AnalysisSession, SessionState};
pub use step::ChainStep;
