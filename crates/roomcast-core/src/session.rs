//! Client sessions: one admitted connection and its two pumps.
//!
//! The inbound pump reads frames, stamps the session's identity on decoded
//! messages and hands them to the hub. The outbound pump drains the mailbox
//! into the connection and keeps the peer alive with pings. Whichever pump
//! stops first brings the other one down, and the session is unregistered
//! exactly once.

use crate::gate::Admission;
use crate::hub::{HubError, HubHandle};
use crate::id::SessionKey;
use crate::message::Message;
use crate::metrics;
use crate::registry::{mailbox, MailboxReceiver, SessionHandle};
use roomcast_protocol::{codec, Frame, ProtocolError, WireFormat, MAX_MESSAGE_SIZE};
use roomcast_transport::{Connection, ConnectionId, FrameSink, FrameStream, TransportError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The hub is not running.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// The connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame violated the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Nothing was received within the liveness window.
    #[error("No frame received within {0:?}")]
    LivenessTimeout(Duration),

    /// A write did not complete within the write deadline.
    #[error("Write did not complete within {0:?}")]
    WriteTimeout(Duration),

    /// A pump task panicked or was cancelled.
    #[error("Session task failed: {0}")]
    Task(String),

    /// The session settings cannot be served.
    #[error("Invalid session config: {0}")]
    InvalidConfig(&'static str),
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Mailbox capacity; a full mailbox evicts the session.
    pub mailbox_capacity: usize,
    /// Deadline for a single write.
    pub write_timeout: Duration,
    /// Longest silence tolerated from the peer.
    pub pong_timeout: Duration,
    /// Interval between pings. Must be shorter than `pong_timeout`.
    pub ping_interval: Duration,
    /// Largest accepted inbound frame.
    pub max_message_size: usize,
    /// Most messages coalesced into one outbound frame.
    pub max_batch: usize,
    /// Encoding of outbound frames.
    pub format: WireFormat,
}

impl SessionConfig {
    /// Check the settings the pumps rely on.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] if the ping interval is zero or
    /// not shorter than the liveness window.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.ping_interval.is_zero() {
            return Err(SessionError::InvalidConfig("ping_interval must be non-zero"));
        }
        if self.ping_interval >= self.pong_timeout {
            return Err(SessionError::InvalidConfig(
                "ping_interval must be shorter than pong_timeout",
            ));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            write_timeout: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            max_message_size: MAX_MESSAGE_SIZE,
            max_batch: 64,
            format: WireFormat::Json,
        }
    }
}

/// A registered session that has not started serving yet.
pub struct ClientSession {
    key: SessionKey,
    hub: HubHandle,
    connection: Box<dyn Connection>,
    mailbox: MailboxReceiver,
    retired: oneshot::Receiver<()>,
    config: SessionConfig,
}

impl ClientSession {
    /// Register an admitted connection with the hub.
    ///
    /// On return the session is visible to routing; messages addressed to it
    /// queue in its mailbox until [`ClientSession::serve`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] for unusable settings, or
    /// [`SessionError::Hub`] if the hub is not running.
    pub async fn register(
        hub: HubHandle,
        connection: Box<dyn Connection>,
        admission: Admission,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let (room, user) = admission.into_parts();
        let key = SessionKey::new(room, user);
        let (tx, rx) = mailbox(config.mailbox_capacity);
        let (retire, retired) = oneshot::channel();

        hub.register(SessionHandle::new(key.clone(), tx).with_retire_signal(retire))
            .await?;
        info!(
            session = %key.id,
            room = %key.room,
            user = %key.user,
            connection = %connection.id(),
            remote = connection.remote_addr().as_deref().unwrap_or("-"),
            "Session registered"
        );

        Ok(Self {
            key,
            hub,
            connection,
            mailbox: rx,
            retired,
            config,
        })
    }

    /// The session's registry key.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Start both pumps and return immediately.
    #[must_use]
    pub fn serve(self) -> SessionTasks {
        let connection_id = self.connection.id().clone();
        let (sink, stream) = self.connection.split();
        let (writer_alive, writer_gone) = oneshot::channel();

        let inbound = InboundPump {
            key: self.key.clone(),
            hub: self.hub,
            stream,
            writer_gone,
            config: self.config.clone(),
        };
        let outbound = OutboundPump {
            key: self.key.clone(),
            sink,
            mailbox: self.mailbox,
            retired: self.retired,
            _writer_alive: writer_alive,
            config: self.config,
        };

        SessionTasks {
            key: self.key,
            connection: connection_id,
            inbound: tokio::spawn(inbound.run()),
            outbound: tokio::spawn(outbound.run()),
        }
    }
}

/// How each pump of a finished session ended.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Inbound pump result.
    pub inbound: Result<(), SessionError>,
    /// Outbound pump result.
    pub outbound: Result<(), SessionError>,
}

/// The running pumps of a session.
pub struct SessionTasks {
    key: SessionKey,
    connection: ConnectionId,
    inbound: JoinHandle<Result<(), SessionError>>,
    outbound: JoinHandle<Result<(), SessionError>>,
}

impl SessionTasks {
    /// The session's registry key.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Wait for both pumps to finish.
    pub async fn join(self) -> SessionOutcome {
        let (inbound, outbound) = tokio::join!(self.inbound, self.outbound);
        let outcome = SessionOutcome {
            inbound: inbound.unwrap_or_else(|e| Err(SessionError::Task(e.to_string()))),
            outbound: outbound.unwrap_or_else(|e| Err(SessionError::Task(e.to_string()))),
        };
        info!(
            session = %self.key.id,
            room = %self.key.room,
            user = %self.key.user,
            connection = %self.connection,
            inbound = ?outcome.inbound.as_ref().err(),
            outbound = ?outcome.outbound.as_ref().err(),
            "Session ended"
        );
        outcome
    }
}

struct InboundPump {
    key: SessionKey,
    hub: HubHandle,
    stream: Box<dyn FrameStream>,
    writer_gone: oneshot::Receiver<()>,
    config: SessionConfig,
}

impl InboundPump {
    async fn run(mut self) -> Result<(), SessionError> {
        let result = self.read_loop().await;
        if let Err(e) = &result {
            debug!(session = %self.key, error = %e, "Inbound pump stopped");
        }

        // The hub ignores this if the session was already replaced or evicted.
        if let Err(e) = self.hub.unregister(self.key.clone()).await {
            debug!(session = %self.key, error = %e, "Unregister skipped");
        }
        result
    }

    async fn read_loop(&mut self) -> Result<(), SessionError> {
        let pong_timeout = self.config.pong_timeout;
        let mut deadline = Instant::now() + pong_timeout;

        loop {
            let received = tokio::select! {
                biased;
                _ = &mut self.writer_gone => return Ok(()),
                received = time::timeout_at(deadline, self.stream.recv()) => received,
            };

            let frame = match received {
                Err(_) => return Err(SessionError::LivenessTimeout(pong_timeout)),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(None)) | Ok(Ok(Some(Frame::Close))) => return Ok(()),
                Ok(Ok(Some(frame))) => frame,
            };
            deadline = Instant::now() + pong_timeout;

            match codec::decode(&frame, self.config.max_message_size) {
                Ok(Some(wire)) => {
                    metrics::record_inbound();
                    let message = Message::from_wire(wire, &self.key.user, &self.key.room);
                    trace!(session = %self.key, message = message.id, "Routing message");
                    self.hub.route(message).await?;
                }
                Ok(None) => trace!(session = %self.key, frame = ?frame.frame_type(), "Liveness frame"),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    metrics::record_decode_error();
                    warn!(session = %self.key, error = %e, "Dropping undecodable frame");
                }
            }
        }
    }
}

/// Why the outbound pump stopped writing.
enum Halt {
    /// The hub dropped the session's handle.
    Retired,
    Failed(SessionError),
}

struct OutboundPump {
    key: SessionKey,
    sink: Box<dyn FrameSink>,
    mailbox: MailboxReceiver,
    // Resolves once the hub has replaced, evicted or removed the session.
    retired: oneshot::Receiver<()>,
    // Dropped when the pump exits, which stops the inbound pump.
    _writer_alive: oneshot::Sender<()>,
    config: SessionConfig,
}

impl OutboundPump {
    async fn run(mut self) -> Result<(), SessionError> {
        let result = match self.write_loop().await {
            Halt::Retired => {
                debug!(session = %self.key, "Session retired by the hub, closing connection");
                // Best effort: the peer may already be gone or stalled.
                let limit = self.config.write_timeout;
                let _ = time::timeout(limit, self.sink.send(Frame::Close)).await;
                Ok(())
            }
            Halt::Failed(e) => {
                debug!(session = %self.key, error = %e, "Outbound pump stopped");
                Err(e)
            }
        };
        if let Err(e) = self.sink.close().await {
            debug!(session = %self.key, error = %e, "Close failed");
        }
        result
    }

    /// Drain the mailbox into the sink until the session is retired or a
    /// write fails. A retired session's backlog is discarded.
    async fn write_loop(&mut self) -> Halt {
        let interval = self.config.ping_interval;
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let max_batch = self.config.max_batch.max(1);
        let mut batch = Vec::with_capacity(max_batch);

        loop {
            tokio::select! {
                biased;
                _ = &mut self.retired => return Halt::Retired,
                received = self.mailbox.recv() => {
                    let Some(first) = received else {
                        return Halt::Retired;
                    };

                    batch.push(first.to_wire());
                    while batch.len() < max_batch {
                        match self.mailbox.try_recv() {
                            Ok(next) => batch.push(next.to_wire()),
                            Err(_) => break,
                        }
                    }

                    let frame = match codec::encode_batch(self.config.format, &batch) {
                        Ok(frame) => frame,
                        Err(e) => return Halt::Failed(e.into()),
                    };
                    trace!(session = %self.key, count = batch.len(), bytes = frame.len(), "Writing batch");
                    batch.clear();
                    if let Err(halt) = self.write(frame).await {
                        return halt;
                    }
                    metrics::record_write("messages");
                }
                _ = ticker.tick() => {
                    if let Err(halt) = self.write(Frame::ping()).await {
                        return halt;
                    }
                    metrics::record_write("ping");
                }
            }
        }
    }

    /// Write one frame within the write deadline, giving up early if the
    /// session is retired meanwhile.
    async fn write(&mut self, frame: Frame) -> Result<(), Halt> {
        let limit = self.config.write_timeout;
        tokio::select! {
            biased;
            _ = &mut self.retired => Err(Halt::Retired),
            written = time::timeout(limit, self.sink.send(frame)) => match written {
                Ok(result) => result.map_err(|e| Halt::Failed(e.into())),
                Err(_) => Err(Halt::Failed(SessionError::WriteTimeout(limit))),
            },
        }
    }
}
