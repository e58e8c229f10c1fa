mod chat;
mod thread;
mod tool;

pub use chat::*;
pub use thread::*;
pub use tool::*;
