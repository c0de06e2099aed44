//! One-shot completion of asynchronous writes, posted to a port.
//!
//! Each accepted write produces exactly one `Array[Int(id), Int(code)]`
//! message when the engine finishes it. Code `0` means the write applied;
//! otherwise `id` is the id the write was attempted under (0 when none was
//! generated).

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::engine::{AsyncEngine, PutCompletion, PutMode};
use crate::error::{BridgeError, BridgeResult, EngineResult, ErrorCode, HandleKind};
use crate::port::{MessagePort, Payload, PortId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PutCompletionMessage {
    pub id: u64,
    pub code: i32,
}

impl PutCompletionMessage {
    pub fn from_result(id: u64, result: &EngineResult<()>) -> Self {
        let code = match result {
            Ok(()) => ErrorCode::Success.as_i32(),
            Err(err) => err.code(),
        };
        Self { id, code }
    }

    pub fn is_success(&self) -> bool {
        self.code == ErrorCode::Success.as_i32()
    }

    pub fn to_payload(self) -> Payload {
        Payload::ints([self.id as i64, i64::from(self.code)])
    }

    pub fn from_payload(payload: &Payload) -> Option<Self> {
        match payload.as_array()? {
            [id, code] => Some(Self {
                id: id.as_int()? as u64,
                code: i32::try_from(code.as_int()?).ok()?,
            }),
            _ => None,
        }
    }
}

/// Decrements the in-flight counter when the completion is consumed or
/// dropped unused.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct AsyncPutAdapter {
    poster: Arc<dyn MessagePort>,
    in_flight: Arc<AtomicUsize>,
}

impl AsyncPutAdapter {
    pub fn new(poster: Arc<dyn MessagePort>) -> Self {
        Self {
            poster,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queues the write and returns the id the engine assigned. A synchronous
    /// rejection is returned here and posts nothing.
    pub fn put(
        &self,
        ctx: &Arc<dyn AsyncEngine>,
        port: PortId,
        bytes: Vec<u8>,
        mode: PutMode,
    ) -> BridgeResult<u64> {
        let poster = self.poster.clone();
        let guard = InFlight::enter(&self.in_flight);
        let done: PutCompletion = Box::new(move |id, result| {
            let _guard = guard;
            let message = PutCompletionMessage::from_result(id, &result);
            if !poster.post(port, message.to_payload()) {
                tracing::warn!(
                    port = %port,
                    id,
                    code = message.code,
                    "put completion not accepted"
                );
            }
        });

        let id = ctx
            .put_async(bytes, mode, done)
            .map_err(|err| BridgeError::from_engine(HandleKind::AsyncContext, err))?;
        tracing::trace!(port = %port, id, ?mode, "async put queued");
        Ok(id)
    }

    /// Writes accepted by the engine whose completion has not run yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn completion_message_round_trips_through_payload() {
        let message = PutCompletionMessage::from_result(
            9,
            &Err(EngineError::failed(404, "object 9 not found")),
        );
        assert_eq!(message, PutCompletionMessage { id: 9, code: 404 });
        assert!(!message.is_success());
        assert_eq!(message.to_payload(), Payload::ints([9, 404]));
        assert_eq!(
            PutCompletionMessage::from_payload(&message.to_payload()),
            Some(message)
        );
        assert_eq!(PutCompletionMessage::from_payload(&Payload::Null), None);
    }

    struct RejectingEngine;

    impl AsyncEngine for RejectingEngine {
        fn put_async(
            &self,
            _bytes: Vec<u8>,
            _mode: PutMode,
            _done: PutCompletion,
        ) -> EngineResult<u64> {
            Err(EngineError::Closed)
        }
    }

    #[test]
    fn synchronous_rejection_posts_nothing() {
        let ports = crate::port::LocalPorts::new(0);
        let rx = ports.open();
        let adapter = AsyncPutAdapter::new(Arc::new(ports.clone()));
        let engine: Arc<dyn AsyncEngine> = Arc::new(RejectingEngine);

        let err = adapter
            .put(&engine, rx.id(), vec![1], PutMode::Put)
            .expect_err("engine rejects");
        assert_eq!(err, BridgeError::invalid_handle(HandleKind::AsyncContext));
        assert!(rx.drain().is_empty());
        assert_eq!(adapter.in_flight(), 0);
    }
}
