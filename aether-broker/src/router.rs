//! Command routing: one inbound message in, at most one reply out.
//!
//! Every delivery is acknowledged exactly once, before it is handled.
//! Messages that are not a command envelope are logged and dropped without
//! a reply. Everything else gets exactly one reply when the caller asked
//! for one, whether the command succeeded or not.

use aether_compute::{ComputeError, ErrorKind, VmManager};
use aether_core::{Command, Envelope, Reply};
use async_trait::async_trait;
use serde_json::Value;

use crate::error::{compute_reason, BrokerError};

/// Executes decoded commands. The seam between transport and engine.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// # Errors
    /// Returns the error of the operation the command maps to.
    async fn handle(&self, command: Command) -> Result<Value, ComputeError>;
}

#[async_trait]
impl CommandHandler for VmManager {
    async fn handle(&self, command: Command) -> Result<Value, ComputeError> {
        self.execute(command).await
    }
}

/// One message taken from the bus.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];

    /// Queue the caller wants the reply on, if any.
    fn reply_to(&self) -> Option<&str>;

    fn correlation_id(&self) -> Option<&str>;

    /// # Errors
    /// Returns [`BrokerError::Bus`] if the acknowledgement cannot be sent.
    async fn ack(&self) -> Result<(), BrokerError>;
}

/// Where replies are published.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// # Errors
    /// Returns [`BrokerError::Bus`] if the reply cannot be published.
    async fn publish(
        &self,
        reply_to: &str,
        correlation_id: Option<&str>,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;
}

/// What became of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not a command envelope; acknowledged and dropped.
    Dropped,
    /// A recognised command was run.
    Handled { success: bool, replied: bool },
}

/// Decodes deliveries and hands them to a [`CommandHandler`].
pub struct Router<H> {
    handler: H,
}

impl<H: CommandHandler> Router<H> {
    #[must_use]
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    /// Acknowledge, decode and run one delivery, then publish the reply.
    ///
    /// Handler failures become error replies and never surface here.
    ///
    /// # Errors
    /// Returns an error only if the transport fails to acknowledge or to
    /// publish the reply.
    pub async fn dispatch<D, S>(&self, delivery: &D, sink: &S) -> Result<Outcome, BrokerError>
    where
        D: Delivery + ?Sized,
        S: ReplySink + ?Sized,
    {
        delivery.ack().await?;

        let envelope = match Envelope::decode(delivery.body()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "dropping message");
                return Ok(Outcome::Dropped);
            }
        };

        let reply = self.run(envelope).await;
        let success = reply.is_success();

        let Some(reply_to) = delivery.reply_to() else {
            tracing::debug!("no reply destination, discarding reply");
            return Ok(Outcome::Handled { success, replied: false });
        };
        let body = serde_json::to_vec(&reply)?;
        sink.publish(reply_to, delivery.correlation_id(), body).await?;
        Ok(Outcome::Handled { success, replied: true })
    }

    async fn run(&self, envelope: Envelope) -> Reply {
        let kind = envelope.kind;
        let command = match envelope.into_command() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(command = %kind, error = %e, "rejecting command options");
                return Reply::error(e.to_string());
            }
        };

        tracing::debug!(command = %kind, "handling command");
        match self.handler.handle(command).await {
            Ok(response) => Reply::success(response),
            Err(e) => {
                if e.kind() == ErrorKind::Internal {
                    tracing::error!(command = %kind, error = ?e, "command failed");
                } else {
                    tracing::warn!(command = %kind, error = %e, "command failed");
                }
                Reply::error(compute_reason(&e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    /// Answers `list-vms` with an empty list, fails `delete-vm` as not
    /// found and `start-vm` with an I/O error.
    struct StubHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for StubHandler {
        async fn handle(&self, command: Command) -> Result<Value, ComputeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match command {
                Command::DeleteVm(target) => Err(ComputeError::VmNotFound(target.vm_id)),
                Command::StartVm(_) => Err(ComputeError::Io(std::io::Error::other("EIO"))),
                _ => Ok(json!([])),
            }
        }
    }

    struct TestDelivery {
        body: Vec<u8>,
        reply_to: Option<String>,
        correlation_id: Option<String>,
        acks: AtomicUsize,
    }

    impl TestDelivery {
        fn new(body: &str, reply_to: Option<&str>) -> Self {
            Self {
                body: body.as_bytes().to_vec(),
                reply_to: reply_to.map(str::to_owned),
                correlation_id: Some("corr-1".to_owned()),
                acks: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Delivery for TestDelivery {
        fn body(&self) -> &[u8] {
            &self.body
        }

        fn reply_to(&self) -> Option<&str> {
            self.reply_to.as_deref()
        }

        fn correlation_id(&self) -> Option<&str> {
            self.correlation_id.as_deref()
        }

        async fn ack(&self) -> Result<(), BrokerError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<(String, Option<String>, Value)>>,
    }

    impl RecordingSink {
        fn published(&self) -> Vec<(String, Option<String>, Value)> {
            match self.published.lock() {
                Ok(p) => p.clone(),
                Err(e) => panic!("sink poisoned: {e}"),
            }
        }
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn publish(
            &self,
            reply_to: &str,
            correlation_id: Option<&str>,
            body: Vec<u8>,
        ) -> Result<(), BrokerError> {
            let value: Value = serde_json::from_slice(&body)?;
            match self.published.lock() {
                Ok(mut p) => p.push((reply_to.to_owned(), correlation_id.map(str::to_owned), value)),
                Err(e) => panic!("sink poisoned: {e}"),
            }
            Ok(())
        }
    }

    fn router() -> Router<StubHandler> {
        Router::new(StubHandler {
            calls: AtomicUsize::new(0),
        })
    }

    async fn dispatch(router: &Router<StubHandler>, delivery: &TestDelivery, sink: &RecordingSink) -> Outcome {
        match router.dispatch(delivery, sink).await {
            Ok(outcome) => outcome,
            Err(e) => panic!("dispatch failed: {e}"),
        }
    }

    #[tokio::test]
    async fn malformed_messages_are_acked_without_reply() {
        let router = router();
        let sink = RecordingSink::default();
        for body in [
            "not json",
            "[]",
            r#"{"options": {}}"#,
            r#"{"command": 3}"#,
            r#"{"command": "reboot-vm"}"#,
            r#"{"command": "list-vms", "options": "all"}"#,
        ] {
            let delivery = TestDelivery::new(body, Some("amq.gen-reply"));
            assert_eq!(dispatch(&router, &delivery, &sink).await, Outcome::Dropped, "{body}");
            assert_eq!(delivery.acks.load(Ordering::SeqCst), 1, "{body} must be acked once");
        }
        assert!(sink.published().is_empty(), "no reply may be sent");
        assert_eq!(router.handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_reply_echoes_correlation_id() {
        let router = router();
        let sink = RecordingSink::default();
        let delivery = TestDelivery::new(r#"{"command": "list-vms"}"#, Some("amq.gen-reply"));

        let outcome = dispatch(&router, &delivery, &sink).await;
        assert_eq!(outcome, Outcome::Handled { success: true, replied: true });
        assert_eq!(delivery.acks.load(Ordering::SeqCst), 1);

        let published = sink.published();
        assert_eq!(published.len(), 1, "exactly one reply");
        let (reply_to, correlation_id, body) = &published[0];
        assert_eq!(reply_to, "amq.gen-reply");
        assert_eq!(correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(
            *body,
            json!({"execution-info": {"status": "success"}, "response": []})
        );
    }

    #[tokio::test]
    async fn handler_error_becomes_error_reply() {
        let router = router();
        let sink = RecordingSink::default();
        let delivery = TestDelivery::new(
            r#"{"command": "delete-vm", "options": {"vm-id": "abcdefgh"}}"#,
            Some("amq.gen-reply"),
        );

        let outcome = dispatch(&router, &delivery, &sink).await;
        assert_eq!(outcome, Outcome::Handled { success: false, replied: true });
        let body = &sink.published()[0].2;
        assert_eq!(body["execution-info"]["status"], "error");
        assert_eq!(body["execution-info"]["reason"], "VM \"abcdefgh\" does not exist");
        assert!(body.get("response").is_none());
    }

    #[tokio::test]
    async fn internal_errors_are_not_leaked() {
        let router = router();
        let sink = RecordingSink::default();
        let delivery = TestDelivery::new(
            r#"{"command": "start-vm", "options": {"vm-id": "abcdefgh"}}"#,
            Some("amq.gen-reply"),
        );
        dispatch(&router, &delivery, &sink).await;
        assert_eq!(sink.published()[0].2["execution-info"]["reason"], "internal error");
    }

    #[tokio::test]
    async fn option_errors_are_replied_without_calling_handler() {
        let router = router();
        let sink = RecordingSink::default();
        for body in [
            r#"{"command": "create-vm", "options": {}}"#,
            r#"{"command": "stop-vm", "options": {"vm-id": "../../etc"}}"#,
        ] {
            let delivery = TestDelivery::new(body, Some("amq.gen-reply"));
            let outcome = dispatch(&router, &delivery, &sink).await;
            assert_eq!(outcome, Outcome::Handled { success: false, replied: true }, "{body}");
        }
        assert_eq!(sink.published().len(), 2);
        assert_eq!(router.handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn command_without_reply_destination_still_runs() {
        let router = router();
        let sink = RecordingSink::default();
        let delivery = TestDelivery::new(r#"{"command": "list-vms"}"#, None);

        let outcome = dispatch(&router, &delivery, &sink).await;
        assert_eq!(outcome, Outcome::Handled { success: true, replied: false });
        assert!(sink.published().is_empty());
        assert_eq!(router.handler.calls.load(Ordering::SeqCst), 1);
    }
}
