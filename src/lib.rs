//! Library crate backing the `webcard-host` binary: a native-messaging
//! host bridging a browser extension to the system's PC/SC smart-card
//! resource manager.

pub mod apdu;
pub mod commands;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod framing;
pub mod json;
pub mod registry;
pub mod resource_manager;

use std::io;

use error::HostError;
use event_loop::EventLoop;
use framing::FramedIo;
use resource_manager::PcscResourceManager;

/// Validate the standard streams, establish a PC/SC context, and run the
/// event loop to completion. Returns once stdin closes or framing breaks.
pub fn run() -> Result<(), HostError> {
    event_loop::log_startup(env!("CARGO_PKG_VERSION"));

    let stdin = io::stdin();
    let stdout = io::stdout();
    framing::validate_streams(&stdin, &stdout)?;

    let io = FramedIo::new(stdin, stdout);
    let rm: Box<dyn resource_manager::ResourceManager> = Box::new(PcscResourceManager::new());
    let event_loop = EventLoop::new(io, rm);
    event_loop.run()
}
