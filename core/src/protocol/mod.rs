// Protocol module: stream reassembly, framing, correlation and dispatch

pub mod buffer;
pub mod correlation;
pub mod engine;
pub mod frame;
pub mod handlers;

pub use buffer::{Message, ProcessState, StreamBuffer, TERMINATOR};
pub use correlation::{PendingCommands, ResponseFuture};
pub use engine::{
    DispatchError, DrainOutcome, EngineContext, EngineEffect, LinkStatus, ProtocolEngine,
};
pub use frame::{Frame, FrameError};
pub use handlers::{HandlerSet, LockHandler, LoggingHandler, RfidHandler, RoleHandler};
