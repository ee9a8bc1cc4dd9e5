use std::{thread, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, select};
use log::{debug, error, info, warn};

use crate::{
    notify::{Inbox, Invocation, error::NotifyError},
    source::backoff::Backoff,
};

/// Connection to a device that can run named actions.
pub trait ActionClient: Send {
    fn connect(&mut self) -> Result<(), NotifyError>;

    /// Runs `action`, passing `argument` as its only string parameter.
    fn invoke(&mut self, action: &str, argument: Option<&str>) -> Result<(), NotifyError>;

    fn ping(&mut self) -> Result<(), NotifyError>;

    fn disconnect(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Drains queued invocations into an [`ActionClient`].
///
/// Invocations are only taken off the queue while connected, so an
/// unreachable device leaves them to the queue's drop-oldest policy.
pub struct NotifierWorker<C> {
    client: C,
    invocations: Receiver<Invocation>,
    lifeline: Receiver<()>,
    state: ConnectionState,
    backoff: Backoff,
    max_attempts: u32,
    keepalive: Duration,
}

impl<C: ActionClient> NotifierWorker<C> {
    pub fn new(client: C, inbox: Inbox, max_attempts: u32, keepalive: Duration) -> Self {
        Self {
            client,
            invocations: inbox.invocations,
            lifeline: inbox.lifeline,
            state: ConnectionState::Disconnected,
            backoff: Backoff::default(),
            max_attempts: max_attempts.max(1),
            keepalive,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Runs until every [`NotifierHandle`](super::NotifierHandle) is gone.
    pub fn run(mut self) {
        loop {
            if self.state != ConnectionState::Connected {
                if let Err(err) = self.connect() {
                    let delay = self.backoff.next_delay();
                    warn!(
                        "notifier connection attempt {} failed: {err}, retrying in {delay:?}",
                        self.backoff.attempts()
                    );
                    if self.wait_or_shutdown(delay) {
                        break;
                    }
                    continue;
                }
            }

            match self.invocations.recv_timeout(self.keepalive) {
                Ok(invocation) => self.deliver(invocation),
                Err(RecvTimeoutError::Timeout) => self.keep_alive(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if self.state == ConnectionState::Connected {
            self.client.disconnect();
            self.state = ConnectionState::Disconnected;
        }
        debug!("notifier stopped");
    }

    fn wait_or_shutdown(&self, delay: Duration) -> bool {
        select! {
            recv(self.lifeline) -> _ => true,
            default(delay) => false,
        }
    }

    fn connect(&mut self) -> Result<(), NotifyError> {
        self.state = ConnectionState::Connecting;
        match self.client.connect() {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.backoff.reset();
                info!("notifier connected");
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    fn mark_disconnected(&mut self) {
        self.client.disconnect();
        self.state = ConnectionState::Disconnected;
    }

    fn deliver(&mut self, invocation: Invocation) {
        let action = invocation.action.as_str();
        let argument = invocation.argument.as_deref();

        for attempt in 1..=self.max_attempts {
            if self.state != ConnectionState::Connected {
                if let Err(err) = self.connect() {
                    warn!("call '{action}' attempt {attempt}: reconnect failed: {err}");
                    if !err.is_retryable() {
                        break;
                    }
                    if attempt < self.max_attempts {
                        thread::sleep(self.backoff.next_delay());
                    }
                    continue;
                }
            }

            match self.client.invoke(action, argument) {
                Ok(()) => {
                    info!("executed action '{action}'");
                    return;
                }
                Err(err) if !err.is_retryable() => {
                    warn!("action '{action}' failed: {err}, not retrying");
                    return;
                }
                Err(err) => {
                    warn!("call '{action}' attempt {attempt} failed: {err}");
                    self.mark_disconnected();
                }
            }
        }

        error!("giving up on call '{action}', dropping it");
    }

    fn keep_alive(&mut self) {
        if let Err(err) = self.client.ping() {
            warn!("notifier keep-alive failed: {err}");
            self.mark_disconnected();
        }
    }
}
