//! The process-wide event multiplexer. One instance is constructed in
//! `main` and threaded explicitly through the `Server` rather than hidden
//! behind a singleton.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use mio_signals::{Signal, SignalSet, Signals};

/// Reserved token for the listener; connection tokens start at 2.
pub const LISTENER_TOKEN: Token = Token(0);
/// Reserved token for the SIGINT source, registered like any other fd.
pub const SIGNAL_TOKEN: Token = Token(1);
const FIRST_DYNAMIC_TOKEN: usize = 2;

/// The outcome of one `poll_and_dispatch` pass.
pub enum PollOutcome {
    /// At least one registration became ready; `Events` can be iterated.
    Ready,
    /// A shutdown signal (SIGINT) was observed.
    Shutdown,
}

pub struct PollRegistry {
    poll: Poll,
    events: Events,
    signals: Signals,
    next_token: usize,
}

impl PollRegistry {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut signals = Signals::new(SignalSet::all())?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            signals,
            next_token: FIRST_DYNAMIC_TOKEN,
        })
    }

    /// Allocates a fresh, never-reused token for a new connection.
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn register(
        &self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister(
        &self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister(&self, source: &mut impl Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks until at least one registration is ready, or a shutdown
    /// signal arrives. `EINTR` is tolerated transparently (mio retries).
    pub fn poll_and_dispatch(&mut self, timeout: Option<Duration>) -> io::Result<PollOutcome> {
        self.poll.poll(&mut self.events, timeout)?;

        for event in self.events.iter() {
            if event.token() == SIGNAL_TOKEN {
                while let Some(signal) = self.signals.receive()? {
                    if matches!(signal, Signal::Interrupt | Signal::Terminate | Signal::Quit) {
                        return Ok(PollOutcome::Shutdown);
                    }
                }
            }
        }

        Ok(PollOutcome::Ready)
    }

    /// Iterates the events captured by the most recent `poll_and_dispatch`,
    /// skipping the reserved signal token.
    pub fn events(&self) -> impl Iterator<Item = &mio::event::Event> {
        self.events.iter().filter(|e| e.token() != SIGNAL_TOKEN)
    }
}
