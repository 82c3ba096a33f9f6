use tokio::sync::watch;

use crate::model::Viewer;
use crate::ports::AuthProvider;

/// Auth provider driven by explicit sign-in/sign-out calls.
pub struct MemoryAuth {
    state: watch::Sender<Option<Viewer>>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    pub fn signed_in(viewer: Viewer) -> Self {
        let auth = Self::new();
        auth.sign_in(viewer);
        auth
    }

    pub fn sign_in(&self, viewer: Viewer) {
        log::info!("signed in as {}", viewer.id);
        self.state.send_replace(Some(viewer));
    }

    pub fn sign_out(&self) {
        if self.state.send_replace(None).is_some() {
            log::info!("signed out");
        }
    }
}

impl Default for MemoryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthProvider for MemoryAuth {
    fn current_viewer(&self) -> Option<Viewer> {
        self.state.borrow().clone()
    }

    fn on_auth_change(&self) -> watch::Receiver<Option<Viewer>> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auth_changes_are_observed() {
        let auth = MemoryAuth::new();
        assert!(auth.current_viewer().is_none());

        let mut rx = auth.on_auth_change();
        auth.sign_in(Viewer::new("u1", "Ada"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().map(|v| v.id.as_str()), Some("u1"));

        auth.sign_out();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
        assert!(auth.current_viewer().is_none());
    }
}
