//! Process sandbox for running the external verifier.
//!
//! Each run gets its own process group, a hard wall-clock timeout, bounded
//! output capture, and a temp input file staged inside the working directory.
//!
//! # Example
//!
//! ```ignore
//! use prover_eval::sandbox::{ProcessRegistry, ProcessSandbox, SandboxConfig, SandboxRequest, StagedInput};
//!
//! let registry = ProcessRegistry::new();
//! let sandbox = ProcessSandbox::new(SandboxConfig::default(), registry.clone());
//!
//! let request = SandboxRequest::new("lake", "/path/to/project", Duration::from_secs(120))
//!     .with_args(["env", "lean", "{input}"])
//!     .with_input(StagedInput::new(lean_source, "s0_problem_0001_a3", ".lean"));
//!
//! let output = sandbox.run(&request).await?;
//! if output.timed_out() { /* ... */ }
//! ```

pub mod capture;
pub mod process;
pub mod registry;
pub mod terminate;

pub use process::{
    ProcessSandbox, SandboxConfig, SandboxOutput, SandboxRequest, StagedInput, TerminationReason,
    INPUT_PLACEHOLDER,
};
pub use registry::{GroupLease, ProcessRegistry};
pub use terminate::{group_alive, terminate_process_tree};
