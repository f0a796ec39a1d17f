//! Event-loop driven channel pipelines with flow control and TLS.
//!
//! `sluice` is the core of an asynchronous networked system: per-thread
//! [`EventLoop`]s multiplex OS readiness, timers and cross-thread
//! [`Task`]s; [`channel`]s run bidirectional pipelines of handlers with
//! per-slot read windows for backpressure; the [`tls`] module layers a
//! handshake state machine over an opaque provider; and [`bootstrap`]
//! composes sockets, channels and TLS into ready pipelines.
//!
//! # Threading model
//!
//! Everything on a channel happens on its event loop's thread, one
//! callback at a time. The only cross-thread operations are scheduling
//! tasks, `Channel::shutdown`, window increments through a
//! [`channel::SlotHandle`], and `EventLoop::stop`; each marshals
//! itself to the owning loop. There is no implicit suspension: a
//! callback runs to completion, and deferred work is expressed as a
//! task.
//!
//! # Getting started
//!
//! ```no_run
//! use sluice::bootstrap::{ClientBootstrap, ClientConnectionOptions};
//! use sluice::event_loop::{EventLoopGroup, EventLoopGroupOptions};
//!
//! # fn main() -> sluice::Result<()> {
//! let group = EventLoopGroup::new(EventLoopGroupOptions::default())?;
//! let bootstrap = ClientBootstrap::new(&group);
//! bootstrap.connect(
//!     ClientConnectionOptions::new("example.com", 80).on_setup(|result| {
//!         match result {
//!             Ok(setup) => println!("connected: {:?}", setup.channel),
//!             Err(err) => eprintln!("setup failed: {}", err),
//!         }
//!     }),
//! );
//! # group.shutdown()
//! # }
//! ```

#![warn(missing_docs, missing_debug_implementations)]

#[macro_use]
mod macros;

pub mod bootstrap;
pub mod channel;
pub mod clock;
mod error;
pub mod event_loop;
mod interest;
pub mod net;
pub mod resolver;
mod sys;
mod task;
pub mod tls;

pub use crate::error::{Error, Result};
pub use crate::event_loop::{EventLoop, EventLoopGroup, EventLoopGroupOptions, EventLoopOptions};
pub use crate::interest::{Interest, Readiness};
pub use crate::task::{Task, TaskId, TaskStatus};
