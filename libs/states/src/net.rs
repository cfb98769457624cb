//! Network states.
//!
//! Networks are rebuilt from parameters on every activation rather than
//! stored anywhere, so the backend reports a single `default` state and
//! treats every manipulation as already done.

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{StateBackend, StateRequest};
use crate::error::StateError;

/// Stateless backend treating every network as holding one default state.
#[derive(Debug, Default)]
pub struct NetBackend;

impl NetBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for NetBackend {
    async fn show(&self, _req: &StateRequest) -> Result<Vec<String>, StateError> {
        Ok(vec!["default".to_string()])
    }

    async fn get(&self, req: &StateRequest) -> Result<(), StateError> {
        debug!(net = %req.object_name(), "Activating the network from parameters");
        Ok(())
    }

    async fn set(&self, req: &StateRequest) -> Result<(), StateError> {
        debug!(net = %req.object_name(), "Network states need no storing");
        Ok(())
    }

    async fn unset(&self, req: &StateRequest) -> Result<(), StateError> {
        debug!(net = %req.object_name(), "Network states need no removal");
        Ok(())
    }

    async fn check_root(&self, _req: &StateRequest) -> Result<bool, StateError> {
        Ok(true)
    }

    async fn initialize(&self, _req: &StateRequest) -> Result<(), StateError> {
        Ok(())
    }

    async fn finalize(&self, _req: &StateRequest) -> Result<(), StateError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vtgrid_params::params;

    use super::*;

    #[tokio::test]
    async fn networks_always_hold_the_default_state() {
        let backend = NetBackend::new();
        let req = StateRequest::new("net1", "nets", params! {});
        assert_eq!(backend.show(&req).await.unwrap(), vec!["default"]);
        assert!(backend.check_root(&req).await.unwrap());
        backend.get(&req).await.unwrap();
    }
}
