//! Terminal session multiplexing over the control-plane link

mod handlers;
mod manager;

pub use handlers::{
    TerminalCloseHandler, TerminalCreateHandler, TerminalInputHandler, TerminalResizeHandler,
};
pub use manager::{CloseCallback, OutputCallback, SessionInfo, TerminalManager};
