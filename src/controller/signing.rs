//! Message signing flows shared by the three signing queues.

use super::{BadgeSource, Controller, ControllerError};
use crate::messages::{MessageError, MessageKind, MsgParams};

impl Controller {
    /// Queue a signature request and wait for the user's decision.
    pub async fn new_unsigned_message(
        &self,
        kind: MessageKind,
        params: MsgParams,
        origin: &str,
    ) -> Result<String, ControllerError> {
        let id = self.ids.next_id();
        let chain_id = self.network.chain_id();
        let (_, waiter) = self
            .state
            .write()
            .await
            .queue(kind)
            .add_unapproved(id, params, origin, &chain_id)?;
        tracing::info!("New unapproved {} request {} from {}", kind.method(), id, origin);
        self.emit_badge(BadgeSource::from(kind));
        self.confirmation.trigger_ui().await;
        let signature = waiter.await.map_err(|_| ControllerError::Shutdown)??;
        Ok(signature)
    }

    /// The user approved message `id`: sign it and resolve the request.
    pub async fn sign_message(&self, kind: MessageKind, id: u64) -> Result<String, ControllerError> {
        let params = self.state.write().await.queue(kind).approve(id)?;
        self.emit_badge(BadgeSource::from(kind));

        let signed = self.signer.sign_message(kind, &params.from, &params.data);
        let mut state = self.state.write().await;
        let result = match signed {
            Ok(signature) => {
                state.queue(kind).set_signed(id, signature.clone())?;
                Ok(signature)
            }
            Err(e) => {
                tracing::error!("Signing {} request {} failed: {}", kind.method(), id, e);
                let error = MessageError::Signer(e.to_string());
                state.queue(kind).set_errored(id, error.clone())?;
                Err(error.into())
            }
        };
        drop(state);
        self.emit(super::ControllerEvent::StateChanged);
        result
    }

    /// The user declined message `id`.
    pub async fn cancel_message(&self, kind: MessageKind, id: u64) -> Result<(), ControllerError> {
        self.state.write().await.queue(kind).reject(id)?;
        self.emit_badge(BadgeSource::from(kind));
        Ok(())
    }
}
