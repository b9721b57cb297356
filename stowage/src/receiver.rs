//! The UDP measurement receiver.
//!
//! Parses wire lines of the form `key:value|type[|@rate]` -- type tags `c`
//! for counters, `g` for gauges, `ms` for timers -- and feeds them to the
//! matching handler. A datagram may carry several newline-separated lines.
//! Bad input is counted and logged, never fatal: the transport is unreliable
//! by design and the daemon keeps its at-most-once posture.
//!
//! ## Metrics
//!
//! `packets_received`: Datagrams received
//! `lines_received`: Wire lines parsed out of datagrams
//! `lines_rejected`: Wire lines dropped for parse or handler errors

use std::{io, net::SocketAddr, sync::Arc};

use metrics::counter;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::{handler::HandlerSet, signals::Watcher};

/// Errors produced by [`Receiver`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error binding UDP socket
    #[error("Failed to bind UDP socket to {addr}: {source}")]
    Bind {
        /// Binding address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error receiving packet
    #[error("Failed to receive packet on {addr}: {source}")]
    Recv {
        /// Listening address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

/// Errors produced when parsing a wire line.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParseError {
    /// The line has no `:` separating key from value.
    #[error("missing value separator")]
    MissingValueSeparator,
    /// The line has no `|` introducing the type tag.
    #[error("missing type tag")]
    MissingType,
    /// The type tag is not one of `c`, `g`, `ms`.
    #[error("unknown type tag {0:?}")]
    UnknownType(String),
    /// The key is empty.
    #[error("empty key")]
    EmptyKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Counter,
    Gauge,
    Timer,
}

#[derive(Debug, PartialEq, Eq)]
struct Line<'a> {
    key: &'a str,
    value: Option<&'a str>,
    rate: Option<&'a str>,
    kind: Kind,
}

fn parse_line(line: &str) -> Result<Line<'_>, ParseError> {
    let (key, rest) = line
        .split_once(':')
        .ok_or(ParseError::MissingValueSeparator)?;
    if key.is_empty() {
        return Err(ParseError::EmptyKey);
    }
    let mut fields = rest.split('|');
    let value = fields.next().filter(|value| !value.is_empty());
    let tag = fields.next().ok_or(ParseError::MissingType)?;
    let kind = match tag {
        "c" => Kind::Counter,
        "g" => Kind::Gauge,
        "ms" => Kind::Timer,
        other => return Err(ParseError::UnknownType(other.to_owned())),
    };
    let rate = fields.next().filter(|rate| !rate.is_empty());
    Ok(Line {
        key,
        value,
        rate,
        kind,
    })
}

fn dispatch(handlers: &HandlerSet, raw: &str) {
    counter!("lines_received").increment(1);
    let outcome = match parse_line(raw) {
        Ok(line) => match line.kind {
            Kind::Counter => handlers.counters.handle(line.key, line.value, line.rate),
            Kind::Gauge => handlers.gauges.handle(line.key, line.value, line.rate),
            Kind::Timer => handlers.timers.handle(line.key, line.value, line.rate),
        },
        Err(err) => {
            counter!("lines_rejected").increment(1);
            debug!(line = raw, %err, "unparseable wire line");
            return;
        }
    };
    if let Err(err) = outcome {
        counter!("lines_rejected").increment(1);
        debug!(line = raw, %err, "measurement rejected");
    }
}

/// The UDP receiver.
///
/// Listens for measurement datagrams and feeds the handler set until a
/// shutdown signal is received.
pub struct Receiver {
    binding_addr: SocketAddr,
    handlers: Arc<HandlerSet>,
    shutdown: Watcher,
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("binding_addr", &self.binding_addr)
            .field("handlers", &"HandlerSet")
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

impl Receiver {
    /// Create a new [`Receiver`] bound to nothing yet; the socket is opened
    /// by [`Receiver::run`].
    #[must_use]
    pub fn new(binding_addr: SocketAddr, handlers: Arc<HandlerSet>, shutdown: Watcher) -> Self {
        Self {
            binding_addr,
            handlers,
            shutdown,
        }
    }

    /// Run the receiver to completion or until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Function will return an error if the socket cannot be bound or a
    /// receive fails.
    pub async fn run(self) -> Result<(), Error> {
        let socket = UdpSocket::bind(&self.binding_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: self.binding_addr,
                source: Box::new(source),
            })?;
        info!(addr = %self.binding_addr, "receiver listening");
        let mut buf = vec![0; 65536];

        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                packet = socket.recv_from(&mut buf) => {
                    let (bytes, _) = packet.map_err(|source| Error::Recv {
                        addr: self.binding_addr,
                        source: Box::new(source),
                    })?;
                    counter!("packets_received").increment(1);
                    for raw in buf[..bytes].split(|&byte| byte == b'\n') {
                        let Ok(raw) = std::str::from_utf8(raw) else {
                            counter!("lines_rejected").increment(1);
                            debug!("dropping non-utf8 wire line");
                            continue;
                        };
                        let raw = raw.trim();
                        if raw.is_empty() {
                            continue;
                        }
                        dispatch(&self.handlers, raw);
                    }
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return Ok(());
                }
            }
        }
    }
}
