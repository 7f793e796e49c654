//! datacol-ops — live operations against running workloads.
//!
//! Everything here works on pods the reconciler produced, located through
//! the same labels it applies, but is otherwise independent of deploys in
//! flight.
//!
//! # Components
//!
//! - **`exec`** — remote command execution: attach to a running pod, or
//!   spin up a throwaway run pod, exec, and tear it down
//! - **`logs`** — one ordered output stream merged from every pod's live
//!   log stream
//! - **`process`** — the process-list read model

pub mod exec;
pub mod logs;
pub mod process;

pub use exec::{ExecOptions, ProcessRunOptions, exec_in_pod, process_exec, process_run};
pub use logs::{LogSource, LogStreamOptions, MultiplexOptions, log_stream, multiplex};
pub use process::process_list;
