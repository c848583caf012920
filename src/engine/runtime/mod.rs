//! Runtime strategies
//!
//! - `in_page` - evaluate the payload in the connected page
//! - `subprocess` - run the payload under an external interpreter

pub mod in_page;
pub mod subprocess;

pub use in_page::wrap_source;
pub use subprocess::{parse_stdout, resolve_interpreter, ProcessOutput, ProcessSpec};
