//! Leaf components of the gateway: prompt formatting, process invocation and
//! output sanitizing. Nothing in here holds state across calls.

pub mod process;
pub mod sanitizer;
pub mod template_engine;

pub use process::{
    check_artifacts, command_args, Invocation, InvocationOutcome, LlamaCliInvoker,
    ProcessInvoker, ProcessOutput,
};
pub use sanitizer::{clean, detect_and_decode, Detection, ResponseDecoder};
pub use template_engine::ChatFormat;
