pub mod externs;
pub mod runtime_error;
pub mod session;
pub mod vm_bc;

pub use externs::{ExternError, ExternTable, Signature};
pub use runtime_error::VmError;
pub use session::{Session, SessionError};
pub use vm_bc::{VirtualMachine, VmConfig};
