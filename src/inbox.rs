//! Handler slot with a backlog: packets that arrive before a handler is
//! attached wait in arrival order and are flushed to the handler when one is
//! set.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::packet::{Packet, SharedHandler};

struct State<P: ?Sized> {
    handler: Option<SharedHandler<P>>,
    backlog: VecDeque<Box<dyn Packet>>,
    /// A flush is draining `backlog`; new arrivals queue behind it.
    flushing: bool,
}

pub(crate) struct Inbox<P: ?Sized> {
    state: Mutex<State<P>>,
}

impl<P: ?Sized> Inbox<P> {
    pub(crate) fn new() -> Self {
        Self { state: Mutex::new(State { handler: None, backlog: VecDeque::new(), flushing: false }) }
    }

    /// Hands `packet` to the handler, or queues it.
    pub(crate) fn deliver(&self, peer: &P, packet: Box<dyn Packet>) {
        let handler = {
            let mut state = self.state.lock();
            match &state.handler {
                Some(handler) if !state.flushing && state.backlog.is_empty() => handler.clone(),
                _ => {
                    state.backlog.push_back(packet);
                    return;
                }
            }
        };
        handler.handle(peer, packet);
    }

    /// Replaces the handler and flushes the backlog to it, oldest first.
    ///
    /// The lock is released around every handler call, so the handler may
    /// send packets or even swap itself out.
    pub(crate) fn set_handler(&self, peer: &P, handler: Option<SharedHandler<P>>) {
        {
            let mut state = self.state.lock();
            state.handler = handler;
            if state.flushing {
                // the running flush picks up the new handler
                return;
            }
            state.flushing = true;
        }
        loop {
            let (handler, packet) = {
                let mut state = self.state.lock();
                match (state.handler.clone(), state.backlog.pop_front()) {
                    (Some(handler), Some(packet)) => (handler, packet),
                    (None, Some(packet)) => {
                        state.backlog.push_front(packet);
                        state.flushing = false;
                        return;
                    }
                    (_, None) => {
                        state.flushing = false;
                        return;
                    }
                }
            };
            handler.handle(peer, packet);
        }
    }

    pub(crate) fn has_handler(&self) -> bool {
        self.state.lock().handler.is_some()
    }

    /// Pops the oldest queued packet.
    pub(crate) fn poll(&self) -> Option<Box<dyn Packet>> {
        self.state.lock().backlog.pop_front()
    }

    pub(crate) fn pending(&self) -> usize {
        self.state.lock().backlog.len()
    }
}
