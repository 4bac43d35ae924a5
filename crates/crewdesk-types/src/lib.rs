pub mod command;
pub mod debug;
pub mod envelope;
pub mod llm;
pub mod mode;

pub use command::*;
pub use debug::*;
pub use envelope::*;
pub use llm::*;
pub use mode::*;
