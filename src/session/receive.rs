//! The per-connection receive loop.

use std::sync::Arc;

use futures_util::SinkExt;
use tokio::{sync::watch, time::timeout};
use tracing::{Instrument, debug, error, info, warn};

use super::{
    BoxedReader,
    DisconnectCallback,
    ReceiveEvent,
    ReceiveOutcome,
    SessionInner,
    pending::InboundResponse,
};
use crate::{
    frame::{FrameReader, InboundFrame, MessageKind, OutboundFrame},
    protocol::{EnvelopeHead, Response, ResponseOutcome},
    serializer::PayloadSerializer,
};

/// Read frames until the stream ends or shutdown is requested, then fail
/// every pending request and run the disconnect callback.
pub(super) async fn run(
    inner: Arc<SessionInner>,
    mut frames: FrameReader<BoxedReader>,
    mut shutdown: watch::Receiver<bool>,
    on_disconnect: Option<DisconnectCallback>,
) {
    debug!("receive loop started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("session shut down locally");
                break;
            }
            frame = frames.read_frame() => match frame {
                Ok(frame) => handle_frame(&inner, frame),
                Err(err) if err.is_closed() => {
                    info!(error = %err, "peer disconnected");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "read failed; treating as disconnect");
                    break;
                }
            },
        }
    }
    drop(frames);

    let abandoned = inner.pending.close();
    if abandoned > 0 {
        info!(abandoned, "failing requests still awaiting a response");
    }
    inner.finished.send_replace(true);
    close_writer(&inner).await;
    inner.publish(ReceiveEvent::disconnect());
    if let Some(callback) = on_disconnect {
        callback().await;
    }
    debug!("receive loop finished");
}

async fn close_writer(inner: &SessionInner) {
    let mut writer = inner.writer.lock().await;
    match timeout(inner.write_timeout, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "closing the write half failed"),
        Err(_) => debug!("closing the write half timed out"),
    }
}

fn handle_frame(inner: &Arc<SessionInner>, frame: InboundFrame) {
    let InboundFrame { header, payload } = frame;
    let type_id = header.type_id;
    let Some(payload) = payload else {
        warn!(type_id, length = header.length, "payload length rejected; frame skipped");
        not_recognised(inner, type_id, None);
        return;
    };
    let kind = header.message_kind();
    let head: EnvelopeHead = match inner.serializer.deserialize(&payload) {
        Ok(head) => head,
        Err(err) => {
            warn!(type_id, error = %err, "undecodable envelope");
            not_recognised(inner, type_id, None);
            return;
        }
    };

    if kind.is_none() || !inner.registry.contains_id(type_id) {
        warn!(
            kind = header.kind,
            type_id,
            request_identifier = %head.request_identifier,
            "unrecognised frame"
        );
        if header.kind == MessageKind::Request.as_raw() {
            reply_failure(
                inner,
                type_id,
                &head,
                ResponseOutcome::ProtocolNotRecognised,
                format!("type id {type_id} is not part of the protocol"),
            );
        }
        not_recognised(inner, type_id, Some(head.request_identifier));
        return;
    }

    match kind {
        Some(MessageKind::Request) => handle_request(inner, type_id, head, payload),
        Some(MessageKind::Response) => handle_response(inner, type_id, head, payload),
        Some(MessageKind::Unset) | None => not_recognised(inner, type_id, Some(head.request_identifier)),
    }
}

fn handle_request(inner: &Arc<SessionInner>, type_id: i32, head: EnvelopeHead, payload: Vec<u8>) {
    let call = match inner.dispatch.dispatch(type_id, payload) {
        Ok(call) => call,
        Err(err) => {
            let name = inner.registry.name_of(type_id).unwrap_or("unknown");
            warn!(
                type_id,
                payload = name,
                request_identifier = %head.request_identifier,
                error = %err,
                "request not handled"
            );
            reply_failure(
                inner,
                type_id,
                &head,
                ResponseOutcome::RequestNotHandled,
                format!("no handler for {name}"),
            );
            inner.publish(ReceiveEvent {
                outcome: ReceiveOutcome::RequestNotHandled,
                type_id: Some(type_id),
                request_identifier: Some(head.request_identifier),
            });
            return;
        }
    };

    debug!(
        operation = call.operation,
        request_identifier = %head.request_identifier,
        "dispatching request"
    );
    inner.publish(ReceiveEvent {
        outcome: ReceiveOutcome::Success,
        type_id: Some(type_id),
        request_identifier: Some(head.request_identifier.clone()),
    });

    let task_inner = Arc::clone(inner);
    let operation = call.operation;
    let response_type = call.response_type;
    let future = call.future;
    tokio::spawn(
        async move {
            // a nested task turns a handler panic into a JoinError
            let reply = match tokio::spawn(future).await {
                Ok(Ok(envelope)) => Some(OutboundFrame::new(MessageKind::Response, response_type, envelope)),
                Ok(Err(err)) => {
                    warn!(operation, error = %err, "handler failed");
                    failure_frame(&task_inner, type_id, &head, ResponseOutcome::Error, err.to_string())
                }
                Err(join_err) => {
                    error!(operation, error = %join_err, "handler panicked");
                    failure_frame(
                        &task_inner,
                        type_id,
                        &head,
                        ResponseOutcome::Error,
                        format!("handler for {operation} panicked"),
                    )
                }
            };
            if let Some(frame) = reply {
                if let Err(err) = task_inner.write_frame(frame).await {
                    warn!(operation, error = %err, "failed to send response");
                }
            }
        }
        .in_current_span(),
    );
}

fn handle_response(inner: &SessionInner, type_id: i32, head: EnvelopeHead, envelope: Vec<u8>) {
    let delivered = inner
        .pending
        .complete(&head.request_identifier, InboundResponse { type_id, envelope });
    let outcome = if delivered {
        debug!(request_identifier = %head.request_identifier, "response delivered");
        ReceiveOutcome::Success
    } else {
        warn!(request_identifier = %head.request_identifier, "wayward response; nobody is waiting");
        ReceiveOutcome::WaywardMessage
    };
    inner.publish(ReceiveEvent {
        outcome,
        type_id: Some(type_id),
        request_identifier: Some(head.request_identifier),
    });
}

fn not_recognised(inner: &SessionInner, type_id: i32, request_identifier: Option<String>) {
    inner.publish(ReceiveEvent {
        outcome: ReceiveOutcome::ProtocolNotRecognised,
        type_id: Some(type_id),
        request_identifier,
    });
}

/// Encode a payload-less failure response carrying the request's type id.
fn failure_frame(
    inner: &SessionInner,
    type_id: i32,
    head: &EnvelopeHead,
    outcome: ResponseOutcome,
    detail: String,
) -> Option<OutboundFrame> {
    let response = Response::<()>::failure(head.request_identifier.as_str(), outcome, Some(detail));
    match inner.serializer.serialize(&response) {
        Ok(envelope) => Some(OutboundFrame::new(MessageKind::Response, type_id, envelope)),
        Err(err) => {
            error!(error = %err, "failed to encode failure response");
            None
        }
    }
}

/// Send a failure response without holding up the receive loop.
fn reply_failure(
    inner: &Arc<SessionInner>,
    type_id: i32,
    head: &EnvelopeHead,
    outcome: ResponseOutcome,
    detail: String,
) {
    let Some(frame) = failure_frame(inner, type_id, head, outcome, detail) else {
        return;
    };
    let task_inner = Arc::clone(inner);
    tokio::spawn(
        async move {
            if let Err(err) = task_inner.write_frame(frame).await {
                warn!(error = %err, "failed to send failure response");
            }
        }
        .in_current_span(),
    );
}
