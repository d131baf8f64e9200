//! A single-threaded readiness loop.
//!
//! Descriptors are registered together with a [`Handler`], the conditions of
//! interest, and an optional periodic timeout. Each [`Reactor::turn`] waits
//! until a watched descriptor is ready or the earliest deadline passes, then
//! invokes the handler of every descriptor that is ready or timed out.
//!
//! Handlers run to completion on the reactor thread and receive the reactor
//! itself, so they may register or unregister any descriptor, including the
//! one being dispatched. Other threads use a [`ReactorHandle`], which wakes a
//! blocked wait.
//!
//! The wait is backed by `mio`, which is edge-triggered. A descriptor that is
//! dispatched for I/O is re-armed afterwards, so one that still has queued data
//! is reported again on the next turn, as it would be with `select()`.

use std::{
    collections::HashMap,
    fmt, io,
    os::fd::{AsRawFd, RawFd},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use mio::{unix::SourceFd, Events, Poll, Token, Waker};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENT_CAPACITY: usize = 64;

/// mio only has a priority interest on Linux. Elsewhere exceptional conditions
/// surface as errors on a readable registration.
#[cfg(any(target_os = "linux", target_os = "android"))]
const EXCEPTIONAL: mio::Interest = mio::Interest::PRIORITY;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const EXCEPTIONAL: mio::Interest = mio::Interest::READABLE;

/// An open file descriptor watched by the reactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(RawFd);

impl Descriptor {
    pub const fn from_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    pub fn of(source: &impl AsRawFd) -> Self {
        Self(source.as_raw_fd())
    }

    pub const fn raw(self) -> RawFd {
        self.0
    }

    fn token(self) -> Token {
        Token(self.0 as usize)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// Conditions a registration watches for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
    pub exceptional: bool,
}

impl Interest {
    /// A pure timer.
    pub const NONE: Self = Self {
        readable: false,
        writable: false,
        exceptional: false,
    };

    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
        exceptional: false,
    };

    pub const fn with_exceptional(mut self) -> Self {
        self.exceptional = true;
        self
    }

    pub const fn with_writable(mut self) -> Self {
        self.writable = true;
        self
    }

    fn to_mio(self) -> Option<mio::Interest> {
        [
            (self.readable, mio::Interest::READABLE),
            (self.writable, mio::Interest::WRITABLE),
            (self.exceptional, EXCEPTIONAL),
        ]
        .into_iter()
        .filter(|(wanted, _)| *wanted)
        .map(|(_, interest)| interest)
        .reduce(|acc, interest| acc | interest)
    }
}

/// Why a handler is being invoked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub exceptional: bool,
    /// The deadline passed and no I/O condition is reported in the same pass.
    pub timed_out: bool,
}

impl Readiness {
    pub const fn has_io(&self) -> bool {
        self.readable || self.writable || self.exceptional
    }
}

/// Callback for a registered descriptor. Context lives in the implementing type.
pub trait Handler {
    fn on_ready(&mut self, reactor: &mut Reactor, descriptor: Descriptor, readiness: Readiness);
}

impl<F> Handler for F
where
    F: FnMut(&mut Reactor, Descriptor, Readiness),
{
    fn on_ready(&mut self, reactor: &mut Reactor, descriptor: Descriptor, readiness: Readiness) {
        self(reactor, descriptor, readiness);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to create the poller: {0}")]
    Poll(#[source] io::Error),

    #[error("Failed to watch {descriptor}: {source}")]
    Register {
        descriptor: Descriptor,
        source: io::Error,
    },

    /// The readiness wait failed for a reason other than an interruption.
    #[error("Waiting for readiness failed: {0}")]
    Wait(#[source] io::Error),

    #[error("Failed to spawn the reactor thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("The reactor has shut down")]
    Shutdown,
}

struct Registration {
    /// `None` only while the handler is being invoked.
    handler: Option<Box<dyn Handler>>,
    interest: Interest,
    interval: Option<Duration>,
    deadline: Option<Instant>,
    /// Tells a registration apart from an earlier one of the same descriptor.
    generation: u64,
    in_poll: bool,
}

enum Command {
    Register {
        descriptor: Descriptor,
        handler: Box<dyn Handler + Send>,
        interest: Interest,
        timeout_seconds: u32,
    },
    Unregister(Descriptor),
    Shutdown,
}

/// The readiness loop. Lives on one thread; see [`Reactor::spawn`].
pub struct Reactor {
    poll: Poll,
    events: Events,
    registrations: HashMap<Descriptor, Registration>,
    next_generation: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: ReactorHandle,
    shutdown: bool,
}

impl Reactor {
    /// # Errors
    /// Fails if the operating system poller cannot be created.
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new().map_err(Error::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::Poll)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            registrations: HashMap::new(),
            next_generation: 0,
            commands: rx,
            handle: ReactorHandle {
                commands: tx,
                waker: Arc::new(waker),
            },
            shutdown: false,
        })
    }

    /// Run a new reactor on a dedicated thread. `setup` runs on that thread
    /// before the loop starts and typically registers the first descriptors.
    /// # Errors
    /// Fails if the thread cannot be spawned or the reactor cannot be created.
    pub fn spawn<F>(
        name: impl Into<String>,
        setup: F,
    ) -> Result<(ReactorHandle, JoinHandle<Result<(), Error>>), Error>
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let mut reactor = Reactor::new()?;
                // The caller may have given up waiting; the loop runs regardless.
                let _ = tx.send(reactor.handle());
                setup(&mut reactor);
                reactor.run()
            })
            .map_err(Error::Spawn)?;

        match rx.blocking_recv() {
            Ok(handle) => Ok((handle, thread)),
            Err(_) => Err(match thread.join() {
                Ok(Err(e)) => e,
                _ => Error::Shutdown,
            }),
        }
    }

    /// A handle for controlling this reactor from other threads.
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Watch `descriptor`, replacing any previous registration of it.
    /// A nonzero `timeout_seconds` arms a periodic deadline that is pushed back
    /// by the interval after every dispatch. Zero means no timeout.
    /// # Errors
    /// Fails if the poller refuses the descriptor, for example because it is closed.
    pub fn register(
        &mut self,
        descriptor: Descriptor,
        handler: impl Handler + 'static,
        interest: Interest,
        timeout_seconds: u32,
    ) -> Result<(), Error> {
        self.register_boxed(descriptor, Box::new(handler), interest, timeout_seconds)
    }

    fn register_boxed(
        &mut self,
        descriptor: Descriptor,
        handler: Box<dyn Handler>,
        interest: Interest,
        timeout_seconds: u32,
    ) -> Result<(), Error> {
        let wanted = interest.to_mio();
        let in_poll = self
            .registrations
            .get(&descriptor)
            .is_some_and(|r| r.in_poll);
        let registry = self.poll.registry();
        let raw = descriptor.raw();
        let mut source = SourceFd(&raw);
        // A stale entry left by a descriptor closed without unregistering is
        // gone from the poll set, and its number may belong to a new socket.
        match (in_poll, wanted) {
            (false, Some(i)) => registry.register(&mut source, descriptor.token(), i),
            (true, Some(i)) => match registry.reregister(&mut source, descriptor.token(), i) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(%descriptor, "stale registration, watching the descriptor afresh");
                    registry.register(&mut source, descriptor.token(), i)
                }
                other => other,
            },
            (true, None) => match registry.deregister(&mut source) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
            (false, None) => Ok(()),
        }
        .map_err(|source| Error::Register { descriptor, source })?;

        let interval = (timeout_seconds != 0).then(|| Duration::from_secs(timeout_seconds.into()));
        self.next_generation += 1;
        self.registrations.insert(
            descriptor,
            Registration {
                handler: Some(handler),
                interest,
                interval,
                deadline: interval.map(|i| Instant::now() + i),
                generation: self.next_generation,
                in_poll: wanted.is_some(),
            },
        );
        trace!(%descriptor, ?interest, timeout_seconds, "registered");
        Ok(())
    }

    /// Stop watching `descriptor`. Unknown descriptors are ignored.
    pub fn unregister(&mut self, descriptor: Descriptor) {
        let Some(registration) = self.registrations.remove(&descriptor) else {
            return;
        };
        if registration.in_poll {
            let raw = descriptor.raw();
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&raw)) {
                // A closed descriptor has already left the poll set.
                debug!(%descriptor, "deregister failed: {e}");
            }
        }
        trace!(%descriptor, "unregistered");
    }

    pub fn is_registered(&self, descriptor: Descriptor) -> bool {
        self.registrations.contains_key(&descriptor)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Make [`Reactor::run`] return after the current pass.
    pub fn shutdown(&mut self) {
        self.shutdown = true;
    }

    /// Loop until shut down.
    /// # Errors
    /// Returns the first wait failure that is not an interruption.
    pub fn run(&mut self) -> Result<(), Error> {
        info!("reactor running");
        while !self.shutdown {
            self.turn(None)?;
        }
        info!("reactor stopped");
        Ok(())
    }

    /// One wait and dispatch pass. The wait lasts until a descriptor is ready,
    /// the earliest deadline passes, or `max_wait` elapses.
    /// # Errors
    /// Returns `Error::Wait` if the poller fails for a reason other than an interruption.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> Result<(), Error> {
        let now = Instant::now();
        let until_deadline = self
            .registrations
            .values()
            .filter_map(|r| r.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now));
        let timeout = match (until_deadline, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                trace!("wait interrupted");
                return Ok(());
            }
            Err(e) => return Err(Error::Wait(e)),
        }

        let mut ready: HashMap<Descriptor, Readiness> = HashMap::new();
        for event in &self.events {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let r = ready
                .entry(Descriptor(event.token().0 as RawFd))
                .or_default();
            r.readable |= event.is_readable() || event.is_read_closed();
            r.writable |= event.is_writable() || event.is_write_closed();
            r.exceptional |= event.is_error() || event.is_priority();
        }

        self.run_commands();
        self.dispatch(&ready, Instant::now());
        Ok(())
    }

    fn run_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Register {
                    descriptor,
                    handler,
                    interest,
                    timeout_seconds,
                } => {
                    if let Err(e) = self.register_boxed(descriptor, handler, interest, timeout_seconds) {
                        warn!("{e}");
                    }
                }
                Command::Unregister(descriptor) => self.unregister(descriptor),
                Command::Shutdown => self.shutdown = true,
            }
        }
    }

    fn dispatch(&mut self, ready: &HashMap<Descriptor, Readiness>, now: Instant) {
        // Decide the whole pass up front. Handlers may change the table, so each
        // entry is checked again right before its handler runs.
        let mut due: Vec<(Descriptor, u64, Readiness)> = self
            .registrations
            .iter()
            .filter_map(|(&descriptor, reg)| {
                let io = ready.get(&descriptor).copied().unwrap_or_default();
                let mut readiness = Readiness {
                    readable: io.readable && reg.interest.readable,
                    writable: io.writable && reg.interest.writable,
                    exceptional: io.exceptional && reg.interest.exceptional,
                    timed_out: false,
                };
                readiness.timed_out =
                    !readiness.has_io() && reg.deadline.is_some_and(|d| d <= now);
                (readiness.has_io() || readiness.timed_out)
                    .then_some((descriptor, reg.generation, readiness))
            })
            .collect();
        due.sort_unstable_by_key(|(descriptor, ..)| *descriptor);

        for (descriptor, generation, readiness) in due {
            let Some(reg) = self.registrations.get_mut(&descriptor) else {
                continue;
            };
            if reg.generation != generation {
                continue;
            }
            let Some(mut handler) = reg.handler.take() else {
                continue;
            };

            handler.on_ready(self, descriptor, readiness);

            // Put the handler back unless it unregistered or replaced itself.
            let Some(reg) = self.registrations.get_mut(&descriptor) else {
                continue;
            };
            if reg.generation != generation {
                continue;
            }
            reg.handler = Some(handler);
            reg.deadline = reg.interval.map(|i| Instant::now() + i);
            if readiness.has_io() {
                self.rearm(descriptor);
            }
        }
    }

    fn rearm(&mut self, descriptor: Descriptor) {
        let Some(interest) = self
            .registrations
            .get(&descriptor)
            .and_then(|r| r.interest.to_mio())
        else {
            return;
        };
        let raw = descriptor.raw();
        if let Err(e) =
            self.poll
                .registry()
                .reregister(&mut SourceFd(&raw), descriptor.token(), interest)
        {
            warn_once!(%descriptor, "descriptor was closed without being unregistered, dropping it: {e}");
            self.registrations.remove(&descriptor);
        }
    }
}

/// Controls a [`Reactor`] from any thread. Every request wakes a blocked wait.
#[derive(Clone)]
pub struct ReactorHandle {
    commands: mpsc::UnboundedSender<Command>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Like [`Reactor::register`]. Registration errors are logged by the reactor.
    /// # Errors
    /// Returns `Error::Shutdown` if the reactor is gone.
    pub fn register(
        &self,
        descriptor: Descriptor,
        handler: impl Handler + Send + 'static,
        interest: Interest,
        timeout_seconds: u32,
    ) -> Result<(), Error> {
        self.send(Command::Register {
            descriptor,
            handler: Box::new(handler),
            interest,
            timeout_seconds,
        })
    }

    /// # Errors
    /// Returns `Error::Shutdown` if the reactor is gone.
    pub fn unregister(&self, descriptor: Descriptor) -> Result<(), Error> {
        self.send(Command::Unregister(descriptor))
    }

    /// # Errors
    /// Returns `Error::Shutdown` if the reactor is gone.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::Shutdown)?;
        self.waker.wake().map_err(Error::Wait)
    }
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle").finish_non_exhaustive()
    }
}
