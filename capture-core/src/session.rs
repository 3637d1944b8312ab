//! Upload session state machine
//!
//! Tracks the remote multipart identity and the one-directional lifecycle
//! shared by the streaming and batch coordinators.

use serde::Serialize;
use tracing::info;

use crate::error::{CaptureError, Result};

/// Upload session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, nothing sent yet
    Idle,
    /// Waiting for the initiate call
    Initializing,
    /// Parts are being uploaded
    Uploading,
    /// Completion call in flight
    Finalizing,
    /// Remote object assembled
    Completed,
    /// Failed with an unrecoverable error
    Error,
    /// Cancelled by the caller
    Cancelled,
}

impl SessionState {
    /// No further parts are scheduled once a session is terminal
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Error | SessionState::Cancelled
        )
    }

    /// Whether `next` is reachable from this state in one step
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Initializing) => true,
            // nothing was ever uploaded
            (Idle, Completed | Cancelled) => true,
            (Initializing, Uploading) => true,
            (Uploading, Finalizing) => true,
            (Finalizing, Completed) => true,
            (Initializing | Uploading | Finalizing, Error | Cancelled) => true,
            _ => false,
        }
    }
}

/// A single multipart upload session
#[derive(Debug, Clone)]
pub struct UploadSession {
    upload_id: Option<String>,
    key: Option<String>,
    mime_type: String,
    state: SessionState,
}

impl UploadSession {
    /// Create an idle session for the given MIME type
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self {
            upload_id: None,
            key: None,
            mime_type: mime_type.into(),
            state: SessionState::Idle,
        }
    }

    /// Record the identity returned by initiate
    pub fn bind(&mut self, upload_id: String, key: String) {
        self.upload_id = Some(upload_id);
        self.key = Some(key);
    }

    /// Move to `next`, rejecting anything outside the lifecycle graph
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CaptureError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        info!(
            upload_id = self.upload_id.as_deref().unwrap_or("-"),
            "Session {:?} -> {:?}", self.state, next
        );
        self.state = next;
        Ok(())
    }

    /// Move to a terminal failure state unless already terminal
    pub fn fail(&mut self, next: SessionState) {
        if !self.state.is_terminal() {
            self.state = next;
        }
    }

    /// Error out if the session can no longer accept work
    pub fn ensure_open(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(CaptureError::SessionClosed { state: self.state });
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Both halves of the remote identity, if initiate succeeded
    pub fn remote(&self) -> Option<(&str, &str)> {
        Some((self.upload_id.as_deref()?, self.key.as_deref()?))
    }
}
