//! Single-slot command mailbox between management backends and the
//! launcher.
//!
//! Protocol: a requester takes the outer ddl lock (one extension command at
//! a time cluster-wide), posts its command, and waits for the launcher's
//! reply with a timeout. A requester that times out reports `Pending`; the
//! launcher's late reply is dropped.

use diskquota_common::{DdlCommand, DdlResult, Oid};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

/// A posted command waiting for the launcher.
pub struct DdlEnvelope {
    pub cmd: DdlCommand,
    pub db: Oid,
    pub reply: oneshot::Sender<DdlResult>,
}

/// Requester-side handle. The launcher holds the matching receiver.
pub struct DdlMailbox {
    /// Serializes extension DDL across all requesters.
    ddl_lock: Mutex<()>,
    slot: mpsc::Sender<DdlEnvelope>,
}

impl DdlMailbox {
    /// Create the mailbox and the launcher's receiving end.
    pub fn new() -> (Self, mpsc::Receiver<DdlEnvelope>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                ddl_lock: Mutex::new(()),
                slot: tx,
            },
            rx,
        )
    }

    /// Post a command and wait for the launcher's verdict.
    pub async fn request(&self, cmd: DdlCommand, db: Oid, timeout: Duration) -> DdlResult {
        let _ddl_guard = self.ddl_lock.lock().await;

        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = DdlEnvelope {
            cmd,
            db,
            reply: reply_tx,
        };
        if self.slot.send(envelope).await.is_err() {
            warn!(db, ?cmd, "launcher mailbox is closed");
            return DdlResult::Pending;
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => DdlResult::Pending,
            Err(_) => {
                warn!(db, ?cmd, "timed out waiting for launcher reply");
                DdlResult::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_reply_roundtrip() {
        let (mailbox, mut rx) = DdlMailbox::new();
        let launcher = tokio::spawn(async move {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.cmd, DdlCommand::CreateExtension);
            assert_eq!(envelope.db, 42);
            envelope.reply.send(DdlResult::Ok).unwrap();
        });

        let result = mailbox
            .request(DdlCommand::CreateExtension, 42, Duration::from_secs(1))
            .await;
        assert_eq!(result, DdlResult::Ok);
        launcher.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_reports_pending() {
        let (mailbox, _rx) = DdlMailbox::new();
        let result = mailbox
            .request(DdlCommand::DropExtension, 1, Duration::from_millis(20))
            .await;
        assert_eq!(result, DdlResult::Pending);
    }

    #[tokio::test]
    async fn closed_launcher_reports_pending() {
        let (mailbox, rx) = DdlMailbox::new();
        drop(rx);
        let result = mailbox
            .request(DdlCommand::CreateExtension, 1, Duration::from_millis(20))
            .await;
        assert_eq!(result, DdlResult::Pending);
    }

    #[tokio::test]
    async fn commands_are_serialized() {
        let (mailbox, mut rx) = DdlMailbox::new();
        let mailbox = std::sync::Arc::new(mailbox);

        let launcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(envelope) = rx.recv().await {
                seen.push(envelope.db);
                envelope.reply.send(DdlResult::Ok).unwrap();
                if seen.len() == 2 {
                    break;
                }
            }
            seen
        });

        let a = {
            let mb = mailbox.clone();
            tokio::spawn(async move {
                mb.request(DdlCommand::CreateExtension, 1, Duration::from_secs(1))
                    .await
            })
        };
        let b = {
            let mb = mailbox.clone();
            tokio::spawn(async move {
                mb.request(DdlCommand::CreateExtension, 2, Duration::from_secs(1))
                    .await
            })
        };

        assert_eq!(a.await.unwrap(), DdlResult::Ok);
        assert_eq!(b.await.unwrap(), DdlResult::Ok);
        let seen = launcher.await.unwrap();
        assert_eq!(seen.len(), 2);
    }
}
