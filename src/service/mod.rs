//! Agent process plumbing: the session runner contract, the in-memory
//! process registry, and OS process helpers.

pub mod process;
pub mod registry;
pub mod runner;

pub use process::{is_process_alive, is_same_process, process_start_time, terminate_pid};
pub use registry::{ProcessEntry, ProcessRegistry};
pub use runner::{
    CommandRunner, LaunchRequest, ProcessHandle, SessionEvent, SessionRunner, StreamTranslator,
};
