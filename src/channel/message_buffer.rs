use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, MutexGuard, Semaphore, TryAcquireError};
use tracing::trace;

use crate::message::ChannelMessage;

/// Creates the ordered queue between the tasks reading from connections and the consumer. It is
///  optionally bounded: a full buffer suspends [MessageSender::push], so the feeding task stops
///  reading from its connection and thereby applies back-pressure.
///
/// The buffer is closed when all senders are dropped. Messages that are buffered at that point
///  remain available to the receiver.
pub fn message_buffer(max_queue: Option<usize>) -> (MessageSender, MessageReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        len: AtomicUsize::new(0),
        slots: max_queue.map(Semaphore::new),
        overflow: AtomicUsize::new(0),
    });

    (
        MessageSender { sender, shared: shared.clone() },
        MessageReceiver { receiver: Mutex::new(receiver), shared },
    )
}

struct Shared {
    len: AtomicUsize,
    /// free slots, `None` for an unbounded buffer
    slots: Option<Semaphore>,
    /// number of buffered messages that were pushed beyond the bound
    overflow: AtomicUsize,
}

impl Shared {
    fn on_consumed(&self) {
        self.len.fetch_sub(1, Ordering::AcqRel);
        if let Some(slots) = &self.slots {
            // consuming an overflow message does not free a slot
            if self.overflow.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)).is_err() {
                slots.add_permits(1);
            }
        }
    }
}

#[derive(Clone)]
pub struct MessageSender {
    sender: mpsc::UnboundedSender<ChannelMessage>,
    shared: Arc<Shared>,
}

impl MessageSender {
    /// Appends a message, waiting for room if the buffer is bounded and full. Fails, returning the
    ///  message, if the receiver is gone.
    ///
    /// Dropping the returned future before it completes leaves the buffer unchanged.
    pub async fn push(&self, msg: ChannelMessage) -> Result<(), ChannelMessage> {
        if let Some(slots) = &self.shared.slots {
            match slots.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(msg),
            }
        }
        self.send(msg)
    }

    /// Appends a message without waiting, exceeding the bound if necessary. This is for a
    ///  message that was already taken from a connection which is being shut down.
    pub fn push_overflow(&self, msg: ChannelMessage) -> Result<(), ChannelMessage> {
        if let Some(slots) = &self.shared.slots {
            match slots.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(TryAcquireError::NoPermits) => {
                    self.shared.overflow.fetch_add(1, Ordering::AcqRel);
                }
                Err(TryAcquireError::Closed) => return Err(msg),
            }
        }
        self.send(msg)
    }

    fn send(&self, msg: ChannelMessage) -> Result<(), ChannelMessage> {
        self.shared.len.fetch_add(1, Ordering::AcqRel);
        match self.sender.send(msg) {
            Ok(()) => {
                trace!(len = self.shared.len.load(Ordering::Acquire), "buffered message");
                Ok(())
            }
            Err(e) => {
                self.shared.len.fetch_sub(1, Ordering::AcqRel);
                Err(e.0)
            }
        }
    }
}

/// The consuming end of a message buffer. Only one caller at a time can take messages, see
///  [MessageReceiver::try_lock].
pub struct MessageReceiver {
    receiver: Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    shared: Arc<Shared>,
}

impl MessageReceiver {
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `None` while another caller is taking messages
    pub fn try_lock(&self) -> Option<ReceiveGuard<'_>> {
        let receiver = self.receiver.try_lock().ok()?;
        Some(ReceiveGuard {
            receiver,
            shared: &self.shared,
        })
    }
}

impl Drop for MessageReceiver {
    fn drop(&mut self) {
        // wakes up senders waiting for room
        if let Some(slots) = &self.shared.slots {
            slots.close();
        }
    }
}

pub struct ReceiveGuard<'a> {
    receiver: MutexGuard<'a, mpsc::UnboundedReceiver<ChannelMessage>>,
    shared: &'a Shared,
}

impl ReceiveGuard<'_> {
    /// Takes the oldest message, waiting for one if the buffer is empty. Returns `None` once the
    ///  buffer is closed and drained.
    ///
    /// This is cancel safe: a message is removed from the buffer only when it is returned.
    pub async fn pop(&mut self) -> Option<ChannelMessage> {
        let msg = self.receiver.recv().await?;
        self.shared.on_consumed();
        Some(msg)
    }

    /// Non-suspending variant of [ReceiveGuard::pop]
    pub fn try_pop(&mut self) -> Option<ChannelMessage> {
        let msg = self.receiver.try_recv().ok()?;
        self.shared.on_consumed();
        Some(msg)
    }
}
