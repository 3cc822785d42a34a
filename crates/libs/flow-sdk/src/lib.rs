//! Client-side session and notification layer for the Flow local backend.
//!
//! The backend is a child process speaking JSON over HTTP on localhost. This
//! crate launches and supervises it, issues named-parameter RPC calls, and
//! keeps one long-poll `WaitForNotification` call outstanding per active
//! session so server-pushed changes reach registered handlers.
//!
//! # Pieces
//!
//! - [`Flow`]: cloneable facade over one backend and its sessions, with
//!   [`WeakFlow`] for handlers that call back into it
//! - [`SessionManager`]: session map plus the current-session default
//! - [`Session`]: callback table, bounded notification and error queues, poller
//! - [`NotificationPoller`]: one named worker thread per active session
//! - [`BoundedQueue`]: fixed capacity, drops the oldest entry when full
//! - [`RpcClient`] over a [`Transport`] ([`HttpTransport`] in production)
//! - [`BackendProcess`]: spawn, handshake, liveness, graceful-then-forced stop
//!
//! Draining is explicit: callers pull with
//! [`Flow::process_one_notification`] or loop with
//! [`Flow::process_notifications`] until a [`StopFlag`] is stopped.

#![allow(clippy::result_large_err)]

pub mod backend;
pub mod callbacks;
mod client;
pub mod config;
mod error;
pub mod event;
pub mod manager;
pub mod poller;
pub mod queue;
pub mod rpc;
pub mod session;

pub use backend::{BackendProcess, Handshake};
pub use callbacks::{CallbackRegistry, HandlerError, HandlerResult};
pub use client::{AccountRequest, DeviceRequest, Flow, WeakFlow};
pub use config::FlowConfig;
pub use error::FlowError;
pub use event::{Notification, NotificationKind};
pub use manager::SessionManager;
pub use poller::{NotificationPoller, NotificationSource, PollerState};
pub use queue::{BoundedQueue, MAX_QUEUE_SIZE};
pub use rpc::{HttpTransport, Liveness, RpcClient, RpcRequest, Transport, WAIT_FOR_NOTIFICATION};
pub use session::{Session, SessionId, StopFlag, DEFAULT_DRAIN_TIMEOUT};
