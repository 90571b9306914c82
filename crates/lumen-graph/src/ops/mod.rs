//! Concrete graph ops.

mod conv;
mod input_process;
mod output_process;
mod pool;
mod upsample;

pub use conv::{ConcatConv, Conv};
pub use input_process::InputProcess;
pub use output_process::OutputProcess;
pub use pool::Pool;
pub use upsample::Upsample;
