//! Command dispatch
//!
//! A single loop reads console commands and runs them, one at a time,
//! against the current generation and the shared connection.

mod console;
mod dispatcher;
mod source;

pub use console::Console;
pub use dispatcher::{
    CommandDispatcher, DispatchLoop, EXIT_COMMAND, LoopExit, LoopState, SharedSource, Termination,
};
pub use source::{CommandSource, LineSource, stdin};
