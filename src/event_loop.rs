//! The single-threaded cooperative driver: fleet poll, card-state poll,
//! one request, repeat. Ordering within a tick is fixed (fleet events,
//! then card events, then the current request's response) so the
//! browser never sees a response interleaved with an event it didn't
//! expect.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::commands;
use crate::error::HostError;
use crate::framing::FramedIo;
use crate::json::{self, JsonValue};
use crate::registry::{CardTransition, ReaderRegistry};
use crate::resource_manager::ResourceManager;

const FLEET_POLL_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_SLEEP: Duration = Duration::from_millis(10);

pub struct EventLoop<R, W> {
    io: FramedIo<R, W>,
    registry: ReaderRegistry,
    rm: Box<dyn ResourceManager>,
}

impl<R: Read + AsRawFd, W: Write> EventLoop<R, W> {
    pub fn new(io: FramedIo<R, W>, rm: Box<dyn ResourceManager>) -> Self {
        Self {
            io,
            registry: ReaderRegistry::new(),
            rm,
        }
    }

    /// Establish the PC/SC context, run until stdin closes or framing
    /// breaks, then release the context. Only a fatal resource-manager
    /// failure surfaces as `Err`.
    pub fn run(mut self) -> Result<(), HostError> {
        self.rm.establish_context()?;
        let result = self.drive();
        self.rm.release_context();
        result
    }

    fn drive(&mut self) -> Result<(), HostError> {
        let mut last_fleet_poll = Instant::now()
            .checked_sub(FLEET_POLL_INTERVAL)
            .unwrap_or_else(Instant::now);

        loop {
            if last_fleet_poll.elapsed() >= FLEET_POLL_INTERVAL {
                self.poll_fleet()?;
                last_fleet_poll = Instant::now();
            }

            self.poll_card_states()?;

            match self.io.peek_available() {
                Ok(0) => {}
                Ok(_) => match self.io.read_message() {
                    Ok(bytes) => self.handle_request(&bytes)?,
                    Err(e) => {
                        debug!("framing error, shutting down: {e}");
                        return Ok(());
                    }
                },
                Err(e) => {
                    debug!("input stream closed, shutting down: {e}");
                    return Ok(());
                }
            }

            thread::sleep(IDLE_SLEEP);
        }
    }

    /// Refresh the reader fleet and emit `readers-added`/`readers-removed`.
    /// Retries immediately on a service-stopped signal, matching the
    /// "re-establish then loop step 1a again" instruction.
    fn poll_fleet(&mut self) -> Result<(), HostError> {
        loop {
            let diff = self.registry.fetch_and_diff(self.rm.as_mut())?;
            if diff.service_stopped {
                continue;
            }
            if !diff.added.is_empty() {
                self.write_event(&commands::readers_added_event(&diff.added))?;
            }
            if !diff.removed.is_empty() {
                self.write_event(&commands::readers_removed_event(&diff.removed))?;
            }
            return Ok(());
        }
    }

    fn poll_card_states(&mut self) -> Result<(), HostError> {
        let changes = self.registry.poll_card_states(self.rm.as_mut())?;
        for change in changes {
            let event = match change.transition {
                CardTransition::Inserted => {
                    let atr = self
                        .registry
                        .get(change.index)
                        .map(|r| r.atr.clone())
                        .unwrap_or_default();
                    commands::card_insert_event(change.index, &atr)
                }
                CardTransition::Removed => commands::card_remove_event(change.index),
            };
            self.write_event(&event)?;
        }
        Ok(())
    }

    fn handle_request(&mut self, bytes: &[u8]) -> Result<(), HostError> {
        let value = match json::parse(bytes) {
            Ok(v) => v,
            Err(e) => {
                debug!("dropping unparseable request: {e}");
                return Ok(());
            }
        };
        let request = match value {
            JsonValue::Object(obj) => obj,
            _ => {
                debug!("dropping non-object request");
                return Ok(());
            }
        };
        let response = commands::dispatch(&mut self.registry, self.rm.as_mut(), &request);
        self.io
            .write_message(json::serialize(&JsonValue::Object(response)).as_bytes())
    }

    fn write_event(&mut self, event: &crate::json::JsonObject) -> Result<(), HostError> {
        self.io
            .write_message(json::serialize(&JsonValue::Object(event.clone())).as_bytes())
    }
}

pub fn log_startup(version: &str) {
    info!("webcard-host {version} starting");
}
