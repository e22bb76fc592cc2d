//! Device-side serving loop.
//!
//! [`Server`] ties a [`Link`] to an [`Engine`]: it waits for requests,
//! feeds them to the engine and sends back the single response each one
//! produces. Confirmation deadlines are honoured while idle.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::device::flash::FlashDriver;
use crate::device::ui::UserInterface;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::transport::{Incoming, Link};

/// Wait per loop iteration when nothing else is due.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Statistics of a finished serving session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServeSummary {
    /// Requests that received a response.
    pub requests_handled: u64,
    /// A verified image is present.
    pub firmware_present: bool,
}

/// Engine bound to a transport.
pub struct Server<P: Port, F, U> {
    link: Link<P>,
    engine: Engine<F, U>,
    handled: u64,
}

impl<P: Port, F: FlashDriver, U: UserInterface> Server<P, F, U> {
    /// Serve `engine` over `port`.
    pub fn new(port: P, engine: Engine<F, U>) -> Result<Self> {
        let link = Link::new(port)?.with_stream_timeout(engine.config().frame_timeout);
        Ok(Self {
            link,
            engine,
            handled: 0,
        })
    }

    /// The engine.
    pub fn engine(&self) -> &Engine<F, U> {
        &self.engine
    }

    /// The port.
    pub fn port(&self) -> &P {
        self.link.port()
    }

    /// Process at most one request, waiting no later than `deadline`.
    ///
    /// Returns `true` if a request was received.
    pub fn step(&mut self, deadline: Instant) -> Result<bool> {
        let wait_until = self
            .engine
            .next_deadline()
            .map_or(deadline, |due| due.min(deadline));

        let (received, reply) = match self.link.poll(wait_until)? {
            Some(Incoming::Message(msg)) => (true, Some(self.engine.handle(msg, Instant::now()))),
            Some(Incoming::Upload(mut stream)) => {
                let result = self.engine.handle_upload(&mut stream);
                drop(stream);
                match result {
                    Ok(reply) => (true, Some(reply)),
                    Err(Error::Disconnected) => return Err(Error::Disconnected),
                    Err(e) => {
                        warn!("Upload request dropped: {e}");
                        (true, None)
                    },
                }
            },
            None => (false, self.engine.poll_timeout(Instant::now())),
        };

        if let Some(reply) = reply {
            if received {
                self.handled += 1;
            }
            self.link.send(&reply)?;
        }
        Ok(received)
    }

    /// Serve until the peer disconnects or an interrupt is requested.
    pub fn run(&mut self) -> Result<ServeSummary> {
        info!(
            "Serving {} on {}",
            self.engine.session_id(),
            self.link.port().name()
        );

        loop {
            if crate::is_interrupted_requested() {
                self.engine.disconnect();
                return Err(Error::Interrupted);
            }

            match self.step(Instant::now() + IDLE_POLL) {
                Ok(_) => {},
                Err(Error::Disconnected) => {
                    self.engine.disconnect();
                    let summary = self.summary();
                    info!("Peer disconnected after {} requests", summary.requests_handled);
                    return Ok(summary);
                },
                Err(e) => {
                    debug!("Serving stopped: {e}");
                    self.engine.disconnect();
                    return Err(e);
                },
            }
        }
    }

    /// Current statistics.
    pub fn summary(&self) -> ServeSummary {
        ServeSummary {
            requests_handled: self.handled,
            firmware_present: self.engine.flash().image_state().is_bootable(),
        }
    }
}
