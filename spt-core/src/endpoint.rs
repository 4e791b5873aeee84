use crate::batch::PredictionOutput;
use crate::error::ProtocolError;
use crate::protocol::{Envelope, EndpointId, ModelReply, ModelRequest, ReplyPayload, RequestId};
use crate::registry::RegistryMsg;
use ndarray::ArrayD;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

type PendingMap = Arc<Mutex<HashMap<RequestId, mpsc::UnboundedSender<ModelReply>>>>;

/// One side of a bidirectional message pipe to the model-hosting task.
///
/// Several requests may be in flight concurrently; replies arrive in any
/// order and are routed back by request id. The id counter lives on the
/// endpoint, so ids are unique per channel without any global state.
pub struct ChannelEndpoint {
    endpoint_id: EndpointId,
    to_registry: mpsc::UnboundedSender<RegistryMsg>,
    next_id: AtomicU64,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    demux: JoinHandle<()>,
}

impl ChannelEndpoint {
    pub(crate) fn new(
        endpoint_id: EndpointId,
        to_registry: mpsc::UnboundedSender<RegistryMsg>,
        mut replies: mpsc::UnboundedReceiver<ModelReply>,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pending_demux = pending.clone();
        let closed = Arc::new(AtomicBool::new(false));
        let closed_demux = closed.clone();

        // Routes replies to whoever registered the id; a final reply retires
        // the id. Ends when the registry drops its sender (close or unload),
        // at which point every parked caller is woken with a closed channel.
        let demux = tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                let mut map = pending_demux.lock().expect("pending map poisoned");

                let retire = reply.done;
                let id = reply.id;

                match map.get(&id) {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => {
                        warn!("Dropping reply for unknown request id {id}");
                    }
                }

                if retire {
                    map.remove(&id);
                }
            }

            closed_demux.store(true, Ordering::SeqCst);
            pending_demux.lock().expect("pending map poisoned").clear();
        });

        ChannelEndpoint {
            endpoint_id,
            to_registry,
            next_id: AtomicU64::new(0),
            pending,
            closed,
            demux,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.endpoint_id
    }

    fn register(&self) -> Result<(RequestId, mpsc::UnboundedReceiver<ModelReply>), ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut map = self.pending.lock().expect("pending map poisoned");
        map.insert(id, tx);

        // Checked after the insert so the demux shutdown either removes the
        // entry or this load observes the flag; no ordering loses the caller.
        if self.closed.load(Ordering::SeqCst) {
            map.remove(&id);
            return Err(ProtocolError::ChannelClosed);
        }

        Ok((id, rx))
    }

    fn dispatch(&self, id: RequestId, request: ModelRequest) -> Result<(), ProtocolError> {
        self.to_registry
            .send(RegistryMsg::FromEndpoint {
                endpoint: self.endpoint_id,
                envelope: Envelope { id, request },
            })
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Sends one request and awaits its single final reply.
    pub async fn request(&self, request: ModelRequest) -> Result<ReplyPayload, ProtocolError> {
        let (id, mut rx) = self.register()?;
        self.dispatch(id, request)?;

        match rx.recv().await {
            Some(reply) => {
                debug_assert!(reply.done, "single-reply request got a non-final reply");
                reply.result.map_err(ProtocolError::Remote)
            }
            None => Err(ProtocolError::ChannelClosed),
        }
    }

    /// Sends one request and returns the raw reply stream, for multi-part
    /// operations such as a learn episode.
    pub fn request_streaming(
        &self,
        request: ModelRequest,
    ) -> Result<mpsc::UnboundedReceiver<ModelReply>, ProtocolError> {
        let (id, rx) = self.register()?;
        self.dispatch(id, request)?;
        Ok(rx)
    }

    pub async fn predict(
        &self,
        slots: Vec<ArrayD<f32>>,
    ) -> Result<PredictionOutput, ProtocolError> {
        match self.request(ModelRequest::Predict { slots }).await? {
            ReplyPayload::Prediction(output) => Ok(output),
            _ => Err(ProtocolError::UnexpectedReply("expected Prediction")),
        }
    }

    /// Drains in-flight work on the remote side, awaits confirmation, then
    /// detaches the endpoint.
    pub async fn close(self) -> Result<(), ProtocolError> {
        match self.request(ModelRequest::Close).await? {
            ReplyPayload::Closed => Ok(()),
            _ => Err(ProtocolError::UnexpectedReply("expected Closed")),
        }
    }
}

impl Drop for ChannelEndpoint {
    fn drop(&mut self) {
        self.demux.abort();
    }
}
