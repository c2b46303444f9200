//! Request/response transport abstraction.
//!
//! The engine never blocks on the network and never pulls in an async
//! runtime: a request returns a [`ResponseFuture`] whose readiness is
//! polled from the shard manager's cron tick, with a deadline after which
//! it reports [`PollOutcome::TimedOut`].

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::time::Instant;

use dashmap::DashMap;

use crate::messages::{Address, Message};

/// Result of polling a [`ResponseFuture`].
#[derive(Debug)]
pub enum PollOutcome {
    Ready(Message),
    Pending,
    TimedOut,
}

/// A poll-based future for one response, with a deadline.
pub struct ResponseFuture {
    rx: Receiver<Message>,
    deadline: Instant,
}

impl ResponseFuture {
    pub fn new(rx: Receiver<Message>, deadline: Instant) -> Self {
        Self { rx, deadline }
    }

    /// A future that is already completed.
    pub fn ready(message: Message, deadline: Instant) -> Self {
        let (tx, rx) = channel();
        let _ = tx.send(message);
        Self { rx, deadline }
    }

    /// Non-blocking readiness check. A disconnected sender counts as a
    /// timeout (the peer gave up).
    pub fn poll(&self) -> PollOutcome {
        match self.rx.try_recv() {
            Ok(message) => PollOutcome::Ready(message),
            Err(TryRecvError::Empty) => {
                if Instant::now() >= self.deadline {
                    PollOutcome::TimedOut
                } else {
                    PollOutcome::Pending
                }
            }
            Err(TryRecvError::Disconnected) => PollOutcome::TimedOut,
        }
    }

    /// The sending half for transports that answer asynchronously.
    pub fn pair(deadline: Instant) -> (Sender<Message>, Self) {
        let (tx, rx) = channel();
        (tx, Self { rx, deadline })
    }
}

/// The transport seam between the shard manager and the outside world.
pub trait Transport: Send + Sync {
    /// Issues a request; the response (if any) completes the returned
    /// future before `deadline`.
    fn request(&self, to: Address, message: Message, deadline: Instant) -> ResponseFuture;
}

type Handler = Arc<dyn Fn(Message) -> Option<Message> + Send + Sync>;

/// In-process transport for tests: handlers registered per address answer
/// synchronously, the future completes on the next poll.
#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<Address, Handler>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, address: Address, handler: F)
    where
        F: Fn(Message) -> Option<Message> + Send + Sync + 'static,
    {
        self.handlers.insert(address, Arc::new(handler));
    }
}

impl Transport for LocalTransport {
    fn request(&self, to: Address, message: Message, deadline: Instant) -> ResponseFuture {
        let (tx, future) = ResponseFuture::pair(deadline);
        if let Some(handler) = self.handlers.get(&to) {
            if let Some(response) = handler.value()(message) {
                let _ = tx.send(response);
            }
        }
        // An unknown address or a silent handler leaves the future to time
        // out, exactly like a dead peer.
        future
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::messages::HeartbeatResponse;

    fn address(n: u128) -> Address {
        Address::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7000, Uuid::from_u128(n))
    }

    #[test]
    fn registered_handler_answers() {
        let transport = LocalTransport::new();
        transport.register(address(1), |_| {
            Some(Message::HeartbeatResponse(HeartbeatResponse {
                success: true,
                ..Default::default()
            }))
        });
        let future = transport.request(
            address(1),
            Message::Cron,
            Instant::now() + Duration::from_millis(100),
        );
        match future.poll() {
            PollOutcome::Ready(Message::HeartbeatResponse(resp)) => assert!(resp.success),
            other => panic!("unexpected poll outcome: {:?}", other),
        }
    }

    #[test]
    fn unknown_address_times_out() {
        let transport = LocalTransport::new();
        let future = transport.request(address(9), Message::Cron, Instant::now());
        assert!(matches!(future.poll(), PollOutcome::TimedOut));
    }
}
