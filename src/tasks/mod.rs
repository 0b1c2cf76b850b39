//! Background Tasks Module
//!
//! Timers that remove memoized entries when their expiry policy says so.
//!
//! # Schedulers
//! - [`TokioScheduler`]: spawned tasks on a tokio runtime
//! - [`ThreadScheduler`]: one shared timer thread for the whole process
//! - [`DefaultScheduler`]: tokio when available, the timer thread otherwise
//! - [`VirtualTimer`]: hand-driven virtual time

mod expiry;
mod virtual_time;

pub use expiry::{
    DefaultScheduler, ExpiryTask, Scheduler, ThreadScheduler, TokioScheduler, EXPIRY_THREAD_NAME,
};
pub use virtual_time::VirtualTimer;
