use std::{io, path::PathBuf};

use thiserror::Error;

use crate::call_session::CallState;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("relay rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("cannot {action} while call is {state:?}")]
    InvalidState {
        action: &'static str,
        state: CallState,
    },
    #[error("no active call")]
    NoActiveCall,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("no conversation selected")]
    NoActiveCounterpart,
    #[error("message has neither text nor attachments")]
    EmptyMessage,
    #[error("failed to read attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
