//! Echo fast-path
//!
//! Echo is a connectivity probe, not work: it skips the task table and the
//! idempotency index entirely so probes never pollute the retention window.
//! It still goes through routing and inflight reservation, which is what
//! makes it a faithful end-to-end check of the dispatch path.

use std::time::Duration;

use chrono::TimeDelta;
use serde_json::json;
use tracing::debug;

use crate::session::CommandOutcome;
use crate::{Error, Result};

use super::Dispatcher;

/// Capability name every echo-capable worker declares
pub const ECHO_CAPABILITY: &str = "echo";

impl Dispatcher {
    /// Dispatch an echo probe and wait for the reflected message.
    ///
    /// # Errors
    ///
    /// [`Error::NoEchoWorker`] when no online worker declares `echo`,
    /// [`Error::NoCapacity`] when all echo workers are saturated,
    /// [`Error::EchoTimeout`] on local expiry, and worker errors verbatim.
    pub async fn dispatch_echo(&self, message: &str, timeout: Option<Duration>) -> Result<String> {
        let timeout = self.config.clamp_echo_timeout(timeout);
        let now = self.clock.now();
        let offline_ttl = TimeDelta::from_std(self.config.offline_ttl).unwrap_or(TimeDelta::MAX);

        let (record, guard) = match self.router.pick(ECHO_CAPABILITY, None, now, offline_ttl) {
            Ok(picked) => picked,
            Err(Error::NoWorker(_)) => return Err(Error::NoEchoWorker),
            Err(err) => return Err(err),
        };

        let Some(session) = self.sessions.session_for_node(&record.node_id) else {
            drop(guard);
            return Err(Error::NoEchoWorker);
        };

        let handle = session
            .dispatch(
                ECHO_CAPABILITY,
                json!({ "message": message }),
                "",
                None,
                guard,
            )
            .await?;

        debug!(node_id = %record.node_id, "Echo dispatched");
        match handle.wait(timeout).await {
            CommandOutcome::Success { payload, .. } => {
                // Workers reflect the payload; accept both the wrapped and
                // the bare-string form.
                let echoed = payload
                    .get("message")
                    .and_then(|m| m.as_str())
                    .or_else(|| payload.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(echoed)
            }
            CommandOutcome::Failure { code, message } => Err(Error::worker(code, message)),
            CommandOutcome::TimedOut => Err(Error::EchoTimeout),
            CommandOutcome::SessionClosed => Err(Error::SessionClosed),
            CommandOutcome::Canceled => Err(Error::Internal("echo probe canceled".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::DispatcherConfig;
    use crate::identity::{IdentityStore, IdentityVerifier, MemoryIdentityStore, WorkerType};
    use crate::protocol::{CapabilityDecl, CommandResult, DispatcherFrame, Hello};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn dispatcher_with_worker(echo_replies: bool) -> (Arc<Dispatcher>, String) {
        let store = Arc::new(MemoryIdentityStore::new());
        let verifier = Arc::new(IdentityVerifier::new(
            Arc::clone(&store) as Arc<dyn IdentityStore>,
            b"test-key".to_vec(),
        ));
        let secret = verifier
            .create("node-1", "acct-1", WorkerType::Normal)
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(verifier, Arc::new(SystemClock), DispatcherConfig::default());

        let (tx, mut rx) = mpsc::channel(16);
        let hello = Hello {
            node_id: "node-1".into(),
            node_name: "prober".into(),
            executor_kind: "echo".into(),
            capabilities: vec![CapabilityDecl {
                name: "echo".into(),
                max_inflight: 1,
            }],
            labels: HashMap::new(),
            version: "1.0.0".into(),
            worker_secret: secret.clone(),
        };
        let (session, _ack) = dispatcher.sessions().open(hello, tx).await.unwrap();

        let sessions = Arc::clone(dispatcher.sessions());
        let session_id = session.session_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if !echo_replies {
                    continue;
                }
                if let DispatcherFrame::CommandDispatch(dispatch) = frame {
                    let _ = sessions.handle_result(
                        &session_id,
                        CommandResult {
                            command_id: dispatch.command_id,
                            payload: Some(dispatch.payload),
                            error: None,
                            completed_unix_ms: 1,
                        },
                    );
                }
            }
        });

        (dispatcher, secret)
    }

    #[tokio::test]
    async fn echo_round_trips_and_frees_the_slot() {
        let (dispatcher, _) = dispatcher_with_worker(true).await;

        let echoed = dispatcher
            .dispatch_echo("hello", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(echoed, "hello");

        let stats = dispatcher.inflight_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].capabilities[0].inflight, 0);
    }

    #[tokio::test]
    async fn echo_without_worker_is_dedicated_error() {
        let store = Arc::new(MemoryIdentityStore::new());
        let verifier = Arc::new(IdentityVerifier::new(
            store as Arc<dyn IdentityStore>,
            b"k".to_vec(),
        ));
        let dispatcher = Dispatcher::new(verifier, Arc::new(SystemClock), DispatcherConfig::default());

        let err = dispatcher.dispatch_echo("hi", None).await.unwrap_err();
        assert!(matches!(err, Error::NoEchoWorker));
    }

    #[tokio::test]
    async fn echo_timeout_when_worker_is_silent() {
        let mut config = DispatcherConfig::default();
        config.echo_timeout_min = Duration::from_millis(10);
        // Build with a silent worker and a tiny minimum echo timeout.
        let store = Arc::new(MemoryIdentityStore::new());
        let verifier = Arc::new(IdentityVerifier::new(
            Arc::clone(&store) as Arc<dyn IdentityStore>,
            b"test-key".to_vec(),
        ));
        let secret = verifier
            .create("node-1", "acct-1", WorkerType::Normal)
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(verifier, Arc::new(SystemClock), config);

        let (tx, mut rx) = mpsc::channel(16);
        let hello = Hello {
            node_id: "node-1".into(),
            node_name: "prober".into(),
            executor_kind: "echo".into(),
            capabilities: vec![CapabilityDecl {
                name: "echo".into(),
                max_inflight: 1,
            }],
            labels: HashMap::new(),
            version: "1.0.0".into(),
            worker_secret: secret,
        };
        let _ = dispatcher.sessions().open(hello, tx).await.unwrap();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let err = dispatcher
            .dispatch_echo("hi", Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EchoTimeout));

        // The slot freed even though the worker never answered.
        let stats = dispatcher.inflight_stats();
        assert_eq!(stats[0].capabilities[0].inflight, 0);
    }

    #[tokio::test]
    async fn saturated_echo_worker_reports_no_capacity() {
        let (dispatcher, _) = dispatcher_with_worker(false).await;

        // Occupy the single echo slot with a probe that will only time out.
        let first = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                dispatcher
                    .dispatch_echo("blocked", Some(Duration::from_secs(1)))
                    .await
            }
        });
        // Give the first probe time to reserve.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = dispatcher
            .dispatch_echo("hi", Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCapacity(_)));

        let _ = first.await;
    }
}
