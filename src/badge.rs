//! Pending-request badge.
//!
//! The badge shows how many requests are waiting for the user across every
//! queue. It is a pure read of the controller's counts, recomputed on each
//! badge or state event.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::controller::{Controller, ControllerEvent};
use crate::platform::Platform;

/// Lengths of the independent pending queues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeCounts {
    pub unapproved_txs: usize,
    pub unapproved_msgs: usize,
    pub unapproved_personal_msgs: usize,
    pub unapproved_typed_msgs: usize,
    pub provider_requests: usize,
}

impl BadgeCounts {
    pub fn total(&self) -> usize {
        self.unapproved_txs
            + self.unapproved_msgs
            + self.unapproved_personal_msgs
            + self.unapproved_typed_msgs
            + self.provider_requests
    }

    /// Empty when nothing is pending, otherwise the decimal count.
    pub fn label(&self) -> String {
        match self.total() {
            0 => String::new(),
            n => n.to_string(),
        }
    }
}

/// Keep the platform badge in sync with the controller until cancelled.
pub fn spawn_badge_updater(
    controller: Arc<Controller>,
    platform: Arc<dyn Platform>,
    color: String,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        let mut shown: Option<String> = None;
        loop {
            let label = controller.badge_counts().await.label();
            if shown.as_deref() != Some(label.as_str()) {
                platform.set_badge_text(&label);
                platform.set_badge_background_color(&color);
                shown = Some(label);
            }
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ControllerEvent::BadgeUpdate(_)) | Ok(ControllerEvent::StateChanged) => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => break,
                        Err(RecvError::Closed) => return,
                    },
                    _ = cancel.cancelled() => return,
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::PlatformConfig;
    use crate::controller::testing::harness;
    use crate::platform::HeadlessPlatform;
    use crate::transaction::TxParams;

    #[test]
    fn label_is_empty_at_zero() {
        assert_eq!(BadgeCounts::default().label(), "");
        let counts = BadgeCounts {
            unapproved_txs: 2,
            unapproved_msgs: 1,
            unapproved_personal_msgs: 1,
            unapproved_typed_msgs: 0,
            provider_requests: 3,
        };
        assert_eq!(counts.total(), 7);
        assert_eq!(counts.label(), "7");
    }

    #[tokio::test]
    async fn badge_follows_pending_transactions() {
        let h = harness();
        let platform = Arc::new(HeadlessPlatform::new(PlatformConfig::default()));
        let cancel = CancellationToken::new();
        let task = spawn_badge_updater(
            h.controller.clone(),
            platform.clone(),
            crate::constants::BADGE_COLOR.into(),
            cancel.clone(),
        );

        let params = TxParams {
            from: h.account.clone(),
            to: Some("0x6b175474e89094c44da98b954eedeac495271d0f".into()),
            ..Default::default()
        };
        let id = h
            .controller
            .submit_transaction_request(params, "https://dapp.example")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = platform.snapshot();
        assert_eq!(snap.badge_text, "1");
        assert_eq!(snap.badge_color, "#506F8B");

        h.controller.reject_transaction(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(platform.snapshot().badge_text, "");

        cancel.cancel();
        task.await.unwrap();
    }
}
