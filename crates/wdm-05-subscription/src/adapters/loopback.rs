//! # Loopback Network
//!
//! Pairs exchanges in-process. Exchange `k` has an initiator end `2k` and a
//! responder end `2k+1`. Messages the initiator sends go to the handler
//! registered for the peer (its replies come back on the initiator end) or,
//! with no handler, to the responder end's inbox.
//!
//! Faults can be injected to exercise retry paths:
//!
//! | Fault | Effect |
//! |-------|--------|
//! | `fail_next_sends(n)` | next `n` sends return `SendFailed` |
//! | `drop_next_replies(n)` | replies to the next `n` handled messages vanish |
//! | `partition(peer)` | opens and sends involving `peer` fail with `Unreachable` |

use crate::domain::TransportError;
use crate::ports::{MessageHandler, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{ExchangeHandle, PeerId, WdmMessage};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

type Inbox = Arc<tokio::sync::Mutex<UnboundedReceiver<WdmMessage>>>;

struct Endpoint {
    tx: UnboundedSender<WdmMessage>,
    rx: Inbox,
}

impl Endpoint {
    fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

struct Exchange {
    peer: PeerId,
    initiator: Endpoint,
    responder: Endpoint,
}

#[derive(Default)]
struct NetworkState {
    next_exchange: u64,
    exchanges: HashMap<u64, Exchange>,
    handlers: HashMap<PeerId, Weak<dyn MessageHandler>>,
    partitioned: HashSet<PeerId>,
    fail_sends: u32,
    drop_replies: u32,
    delivered: u64,
}

enum Route {
    Deliver(UnboundedSender<WdmMessage>),
    Handler(Arc<dyn MessageHandler>, ExchangeHandle, UnboundedSender<WdmMessage>),
}

/// In-process transport shared by every node in a test or embedding.
#[derive(Default)]
pub struct LoopbackNetwork {
    state: Mutex<NetworkState>,
}

impl LoopbackNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes requests for `peer` to `handler`. The network does not keep
    /// the handler alive.
    pub fn register_handler<H: MessageHandler + 'static>(&self, peer: PeerId, handler: &Arc<H>) {
        let handler: Arc<dyn MessageHandler> = handler.clone();
        self.state.lock().handlers.insert(peer, Arc::downgrade(&handler));
    }

    /// Stops routing to `peer`'s handler.
    pub fn unregister_handler(&self, peer: PeerId) {
        self.state.lock().handlers.remove(&peer);
    }

    /// Makes the next `count` sends fail.
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().fail_sends = count;
    }

    /// Discards the replies to the next `count` handled messages.
    pub fn drop_next_replies(&self, count: u32) {
        self.state.lock().drop_replies = count;
    }

    /// Cuts `peer` off.
    pub fn partition(&self, peer: PeerId) {
        self.state.lock().partitioned.insert(peer);
    }

    /// Reconnects `peer`.
    pub fn heal(&self, peer: PeerId) {
        self.state.lock().partitioned.remove(&peer);
    }

    /// Open exchanges.
    pub fn open_exchanges(&self) -> usize {
        self.state.lock().exchanges.len()
    }

    /// Messages delivered so far.
    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    fn split(handle: ExchangeHandle) -> (u64, bool) {
        (handle.0 / 2, handle.0 % 2 == 0)
    }

    fn route(&self, exchange: ExchangeHandle) -> Result<Route, TransportError> {
        let mut state = self.state.lock();
        let (k, initiator) = Self::split(exchange);
        let (peer, route) = {
            let record = state
                .exchanges
                .get(&k)
                .ok_or(TransportError::UnknownExchange(exchange))?;
            let route = if initiator {
                let handler = state.handlers.get(&record.peer).and_then(Weak::upgrade);
                match handler {
                    Some(handler) => Route::Handler(
                        handler,
                        ExchangeHandle(2 * k + 1),
                        record.initiator.tx.clone(),
                    ),
                    None => Route::Deliver(record.responder.tx.clone()),
                }
            } else {
                Route::Deliver(record.initiator.tx.clone())
            };
            (record.peer, route)
        };
        if state.partitioned.contains(&peer) {
            return Err(TransportError::Unreachable(peer));
        }
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(TransportError::SendFailed("injected failure".to_string()));
        }
        state.delivered += 1;
        Ok(route)
    }

    fn take_drop(&self) -> bool {
        let mut state = self.state.lock();
        if state.drop_replies > 0 {
            state.drop_replies -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl Transport for LoopbackNetwork {
    async fn open_exchange(&self, peer: PeerId) -> Result<ExchangeHandle, TransportError> {
        let mut state = self.state.lock();
        if state.partitioned.contains(&peer) {
            return Err(TransportError::Unreachable(peer));
        }
        let k = state.next_exchange;
        state.next_exchange += 1;
        state.exchanges.insert(
            k,
            Exchange {
                peer,
                initiator: Endpoint::new(),
                responder: Endpoint::new(),
            },
        );
        debug!(peer = %peer, exchange = 2 * k, "Exchange opened");
        Ok(ExchangeHandle(2 * k))
    }

    async fn send(&self, exchange: ExchangeHandle, message: WdmMessage) -> Result<(), TransportError> {
        match self.route(exchange)? {
            Route::Deliver(tx) => tx
                .send(message)
                .map_err(|_| TransportError::Closed(exchange)),
            Route::Handler(handler, responder, reply_tx) => {
                let replies = handler.handle_message(responder, message).await;
                if self.take_drop() {
                    debug!(exchange = %exchange, dropped = replies.len(), "Replies dropped");
                    return Ok(());
                }
                for reply in replies {
                    // Initiator already closed: nothing left to deliver to.
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    async fn on_message(&self, exchange: ExchangeHandle) -> Result<WdmMessage, TransportError> {
        let inbox = {
            let state = self.state.lock();
            let (k, initiator) = Self::split(exchange);
            let record = state
                .exchanges
                .get(&k)
                .ok_or(TransportError::UnknownExchange(exchange))?;
            let endpoint = if initiator {
                &record.initiator
            } else {
                &record.responder
            };
            endpoint.rx.clone()
        };
        let mut rx = inbox.lock().await;
        rx.recv().await.ok_or(TransportError::Closed(exchange))
    }

    fn close(&self, exchange: ExchangeHandle) {
        let (k, _) = Self::split(exchange);
        // Dropping the record drops both senders, which ends pending receives.
        if self.state.lock().exchanges.remove(&k).is_some() {
            debug!(exchange = %exchange, "Exchange closed");
        }
    }
}
