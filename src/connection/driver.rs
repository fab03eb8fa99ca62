//! The connection driver task.
//!
//! A small state machine run by a single task:
//!
//! - `Idle`: no link and nothing scheduled; waits for a control message.
//! - `Opening`: one call to [`Transport::open`](crate::Transport::open).
//! - `Open`: reads deliveries, reassembles frames, hands each parsed frame to
//!   the [`LinkHandler`] to completion before reading the next.
//! - `Backoff`: sleeps before the next automatic attempt.
//!
//! Control messages are honoured in every phase, so a shutdown never waits
//! for a slow open or a long backoff.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time;

use super::{
    //
    CloseReason,
    ConnectionEvent,
    ConnectionState,
    Control,
    DriverSettings,
    LinkHandler,
};
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_trace,
    log_warn,
    ConnectionError,
    Endpoint,
    FrameBuffer,
    Inbound,
    KvError,
    Link,
    Result,
    TransportPtr,
};

type Reply = oneshot::Sender<Result<()>>;

enum Phase {
    Idle,
    Opening { retry: u32, done: Option<Reply> },
    Open(Link),
    Backoff { retry: u32 },
    Stopped,
}

pub(super) struct Driver {
    // ---
    transport: TransportPtr,
    handler: Arc<dyn LinkHandler>,
    settings: DriverSettings,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    endpoint: Option<Endpoint>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Driver {
    // ---

    pub(super) fn new(
        transport: TransportPtr,
        handler: Arc<dyn LinkHandler>,
        settings: DriverSettings,
        state: watch::Sender<ConnectionState>,
        events: broadcast::Sender<ConnectionEvent>,
        control: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        Self {
            transport,
            handler,
            settings,
            state,
            events,
            control,
            endpoint: None,
            shutdown_waiters: Vec::new(),
        }
    }

    pub(super) async fn run(mut self) {
        // ---
        log_debug!("{}: connection driver started", self.settings.client_id);

        let mut phase = Phase::Idle;

        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Opening { retry, done } => self.open(retry, done).await,
                Phase::Open(link) => self.serve(link).await,
                Phase::Backoff { retry } => self.backoff(retry).await,
                Phase::Stopped => break,
            };
        }

        self.set_state(ConnectionState::Closed);
        self.handler.stopped();

        log_info!("{}: connection driver stopped", self.settings.client_id);

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    async fn idle(&mut self) -> Phase {
        // ---
        let control = self.control.recv().await;
        self.on_control(control)
    }

    /// Next phase for a control message received while no link is up.
    fn on_control(&mut self, control: Option<Control>) -> Phase {
        // ---
        match control {
            Some(Control::Connect { endpoint, done }) => {
                self.endpoint = Some(endpoint);
                Phase::Opening {
                    retry: 0,
                    done: Some(done),
                }
            }
            Some(Control::Reconnect { done }) => {
                if self.endpoint.is_none() {
                    let _ = done.send(Err(KvError::MissingConfig(
                        "reconnect before any connect: no endpoint".into(),
                    )));
                    return Phase::Idle;
                }
                Phase::Opening {
                    retry: 0,
                    done: Some(done),
                }
            }
            Some(Control::Shutdown { done }) => {
                self.shutdown_waiters.push(done);
                Phase::Stopped
            }
            // every client handle is gone
            None => Phase::Stopped,
        }
    }

    async fn open(&mut self, retry: u32, done: Option<Reply>) -> Phase {
        // ---
        let Some(endpoint) = self.endpoint.clone() else {
            return Phase::Idle;
        };

        self.set_state(ConnectionState::Connecting);

        let transport = Arc::clone(&self.transport);

        let opened = tokio::select! {
            opened = transport.open(&endpoint) => opened,
            control = self.control.recv() => {
                if let Some(done) = done {
                    let _ = done.send(Err(ConnectionError::Open(
                        "superseded before the link opened".into(),
                    )
                    .into()));
                }
                self.set_state(ConnectionState::Closed);
                return self.on_control(control);
            }
        };

        match opened {
            Ok(link) => {
                log_info!(
                    "{}: connected to {} via {}",
                    self.settings.client_id,
                    endpoint.address,
                    self.transport.transport_id()
                );

                self.handler.link_up(link.outbox.clone());
                self.set_state(ConnectionState::Open);

                if let Some(done) = done {
                    let _ = done.send(Ok(()));
                }
                Phase::Open(link)
            }
            Err(err) => {
                log_warn!(
                    "{}: failed to open {} (retry {retry}): {err}",
                    self.settings.client_id,
                    endpoint.address
                );

                self.set_state(ConnectionState::Closed);

                if let Some(done) = done {
                    let _ = done.send(Err(err));
                }
                self.schedule_retry(retry + 1)
            }
        }
    }

    async fn serve(&mut self, link: Link) -> Phase {
        // ---
        let Link {
            outbox,
            mut inbox,
            shutdown,
        } = link;

        let mut frames = FrameBuffer::new(self.settings.max_frame_len);

        let (reason, next) = loop {
            tokio::select! {
                delivery = inbox.recv() => match delivery {
                    Some(delivery) => match frames.push(&delivery) {
                        Ok(batch) => {
                            for frame in batch {
                                self.dispatch_frame(&frame);
                            }
                        }
                        Err(err) => {
                            log_error!("{}: abandoning link: {err}", self.settings.client_id);
                            break (CloseReason::Protocol(err.to_string()), None);
                        }
                    },
                    None => break (CloseReason::TransportClosed, None),
                },

                control = self.control.recv() => match control {
                    Some(Control::Connect { endpoint, done }) => {
                        self.endpoint = Some(endpoint);
                        break (
                            CloseReason::Reconnect,
                            Some(Phase::Opening { retry: 0, done: Some(done) }),
                        );
                    }
                    Some(Control::Reconnect { done }) => {
                        break (
                            CloseReason::Reconnect,
                            Some(Phase::Opening { retry: 0, done: Some(done) }),
                        );
                    }
                    Some(Control::Shutdown { done }) => {
                        self.shutdown_waiters.push(done);
                        break (CloseReason::Shutdown, Some(Phase::Stopped));
                    }
                    None => break (CloseReason::Shutdown, Some(Phase::Stopped)),
                },
            }
        };

        drop(outbox);
        shutdown.notify_one();

        self.handler.link_down();
        self.set_state(ConnectionState::Closed);
        let _ = self.events.send(ConnectionEvent::Closed {
            reason: reason.clone(),
        });

        log_info!("{}: link closed: {reason:?}", self.settings.client_id);

        match next {
            Some(phase) => phase,
            None => self.schedule_retry(1),
        }
    }

    async fn backoff(&mut self, retry: u32) -> Phase {
        // ---
        let delay = self.settings.policy.delay_for(retry);

        log_debug!(
            "{}: reconnect attempt {retry} in {delay:?}",
            self.settings.client_id
        );

        tokio::select! {
            _ = time::sleep(delay) => Phase::Opening { retry, done: None },
            control = self.control.recv() => self.on_control(control),
        }
    }

    fn schedule_retry(&self, retry: u32) -> Phase {
        // ---
        if self.settings.policy.allows(retry) {
            Phase::Backoff { retry }
        } else {
            if self.settings.policy.enabled {
                log_error!(
                    "{}: giving up after {} reconnect attempts",
                    self.settings.client_id,
                    retry - 1
                );
            }
            Phase::Idle
        }
    }

    fn dispatch_frame(&self, frame: &[u8]) {
        // ---
        log_trace!(
            "{}: inbound {}",
            self.settings.client_id,
            String::from_utf8_lossy(frame)
        );

        match Inbound::parse(frame) {
            Ok(inbound) => self.handler.inbound(inbound),
            Err(err) => self.handler.malformed(err),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        // ---
        let previous = self.state.send_replace(next);
        if previous != next {
            let _ = self.events.send(ConnectionEvent::StateChanged(next));
        }
    }
}
