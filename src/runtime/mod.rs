pub mod native;
pub mod traits;

pub use native::NativeCommandRunner;
pub use traits::{CommandOutput, CommandRunner, CommandSpec, ProcessError};
