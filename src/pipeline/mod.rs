pub mod backend;
pub mod ollama;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod session;
pub mod stream_guard;
pub mod transcript;

pub use backend::*;
pub use orchestrator::*;
pub use parser::*;
pub use prompt::*;
pub use session::*;
pub use transcript::*;
