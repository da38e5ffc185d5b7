use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::endpoint::EndpointDescriptor;
use crate::transport::{Transport, TransportConnection, TransportError};

/// What [ScriptedTransport] does on a connection attempt
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    Connect,
    Fail(TransportError),
    /// never completes, i.e. runs into the channel's open timeout
    Hang,
}

/// An in-memory [Transport] whose connection attempts follow a script. Attempts beyond the end of
///  the script succeed. Every successful attempt creates a connection that is controlled through
///  a [ConnectionHandle].
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
    connected: Notify,
}

#[derive(Default)]
struct ScriptState {
    script: VecDeque<OpenBehavior>,
    attempts: Vec<EndpointDescriptor>,
    connections: Vec<ConnectionHandle>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport {
            state: Default::default(),
            connected: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// appends to the script
    pub fn script(&self, behaviors: impl IntoIterator<Item = OpenBehavior>) {
        self.lock().script.extend(behaviors);
    }

    /// all connection attempts so far, successful or not
    pub fn open_attempts(&self) -> Vec<EndpointDescriptor> {
        self.lock().attempts.clone()
    }

    pub fn num_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// The n-th successfully opened connection (0-based). Panics if there is no such connection.
    pub fn connection(&self, index: usize) -> ConnectionHandle {
        self.lock().connections.get(index)
            .cloned()
            .unwrap_or_else(|| panic!("there is no connection #{}", index))
    }

    /// Waits until the n-th connection is opened
    pub async fn wait_for_connection(&self, index: usize) -> ConnectionHandle {
        loop {
            let mut notified = pin!(self.connected.notified());
            notified.as_mut().enable();

            if let Some(handle) = self.lock().connections.get(index) {
                return handle.clone();
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, endpoint: &EndpointDescriptor) -> Result<Box<dyn TransportConnection>, TransportError> {
        let behavior = {
            let mut state = self.lock();
            state.attempts.push(endpoint.clone());
            state.script.pop_front().unwrap_or(OpenBehavior::Connect)
        };

        match behavior {
            OpenBehavior::Connect => {
                let (sender, receiver) = mpsc::unbounded_channel();
                let closed = Arc::new(AtomicBool::new(false));

                self.lock().connections.push(ConnectionHandle {
                    endpoint: endpoint.clone(),
                    sender,
                    closed: closed.clone(),
                });
                self.connected.notify_waiters();

                Ok(Box::new(ScriptedConnection {
                    receiver,
                    closed,
                }))
            }
            OpenBehavior::Fail(e) => Err(e),
            OpenBehavior::Hang => std::future::pending().await,
        }
    }
}

/// The remote side of a [ScriptedTransport] connection
#[derive(Clone)]
pub struct ConnectionHandle {
    endpoint: EndpointDescriptor,
    sender: mpsc::UnboundedSender<Result<Option<Bytes>, TransportError>>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    pub fn send(&self, payload: Bytes) {
        let _ = self.sender.send(Ok(Some(payload)));
    }

    pub fn send_text(&self, text: &str) {
        self.send(Bytes::copy_from_slice(text.as_bytes()));
    }

    /// the connection breaks with the given error
    pub fn fail(&self, error: TransportError) {
        let _ = self.sender.send(Err(error));
    }

    /// the remote side closes the connection in an orderly fashion
    pub fn close_remote(&self) {
        let _ = self.sender.send(Ok(None));
    }

    /// true if the client closed the connection
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct ScriptedConnection {
    receiver: mpsc::UnboundedReceiver<Result<Option<Bytes>, TransportError>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportConnection for ScriptedConnection {
    async fn recv_next(&mut self) -> Result<Option<Bytes>, TransportError> {
        self.receiver.recv().await
            .unwrap_or(Ok(None))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.receiver.close();
        Ok(())
    }
}
