//! HTTP transfer engine.
//!
//! [`TransferManager`] owns every in-flight transfer of a chat client. A
//! download probes the remote size, waits for the user when the file is too
//! large to fetch automatically, resumes interrupted downloads with range
//! requests and decrypts `aesgcm://` content. An upload negotiates a slot over
//! the signaling channel and streams the (optionally encrypted) file to it.
//!
//! The chat client plugs in through [`MessageRef`], [`TransferHost`],
//! [`FileStore`] and [`courier_slot::SignalingChannel`].

pub mod client;
pub mod config;
pub mod download;
pub mod error;
mod manager;
pub mod message;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{HttpClients, SystemTrust, TrustManager, WRITE_TIMEOUT};
pub use config::{ConfigError, TransferConfig};
pub use download::DownloadTransfer;
pub use error::{ErrorCategory, HttpTransferError, TransportKind};
pub use manager::{Services, TransferManager};
pub use message::{
    DirectoryStore, FailureReason, FileParams, FileStore, MessageHandle, MessageRef, TransferHost,
    Transferable,
};
pub use upload::UploadTransfer;
