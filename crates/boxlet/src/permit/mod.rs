//! Per-group worker permits.
//!
//! A permit owns the write half of one worker's socket. Its type says what
//! the proxy may still do with it:
//!
//! - `PermitInUse`: a task is outstanding. Resolve it with `into_idle()`
//!   once the worker reports `Idle`, or `into_poisoned()` when it is lost.
//! - `PermitIdle`: goes back to the pool when dropped.
//! - `PermitPoisoned`: closes the socket when dropped and has no way back.

mod pool;

pub use pool::{
    PermitError, PermitIdle, PermitInUse, PermitPoisoned, PermitPool, PoolOccupancy, TaskWriter,
};
