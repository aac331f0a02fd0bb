use std::sync::Arc;

use async_trait::async_trait;

use super::MessageReceiver;
use crate::error::BoxError;

/// Transport-specific behaviour of one inbound endpoint's listener.
///
/// [`MessageReceiver`] owns lifecycle, connection state and cluster rules;
/// implementations only supply the work done at each step. Every method
/// has a no-op default.
#[async_trait]
pub trait ReceiverHooks: Send + Sync {
    async fn do_initialise(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_connect(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_disconnect(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_start(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_stop(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_dispose(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Ok(())
    }

    /// Cheap liveness check run before a connect retry.
    async fn validate_connection(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Ok(())
    }

    /// `false` restricts connecting and starting to the cluster primary node.
    fn should_consume_in_every_node(&self) -> bool {
        true
    }
}
