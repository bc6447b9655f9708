// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client-side transport for a shared-memory PCM audio daemon: lock-free
// FIFO and seqlock mailbox primitives, a PCM stream/client state machine
// on top of them, an async-io request/reply channel (in-process or over a
// socket with fd passing), a small cbpoll-style event loop, and the
// remote-client handshake that wires all of it to a running server.

pub mod error;
pub use error::{DspdError, DspdResult};

pub mod clock;

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

pub mod semaphore;
pub use semaphore::IpcSemaphore;

mod mutex;
pub use mutex::IpcMutex;

mod condition;
pub use condition::IpcCondition;

mod rw_lock;
pub use rw_lock::RwLock;

mod spin_lock;
pub use spin_lock::SpinLock;

mod waiter;
pub use waiter::Waiter;

pub mod fifo;
pub use fifo::Fifo;

pub mod mbx;
pub use mbx::Mbx;

pub mod shm_layout;
pub use shm_layout::{SectionId, ShmLayout};

pub mod pcm;

pub mod asyncio;

pub mod eventloop;

pub mod rclient;
pub use rclient::RemoteClient;

pub mod config;
pub use config::DspdConfig;

pub mod logging;
