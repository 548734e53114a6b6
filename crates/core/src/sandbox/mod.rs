//! Layers one and two of server isolation: static validation of the source
//! and the on-disk instance whose wrapper guards imports at runtime.

mod builder;
pub mod policy;
mod validator;

pub use builder::{
    sandbox_env, LaunchSpec, SandboxBuilder, SandboxInstance, BLOCKED_IMPORT_MARKER, ENTRY_FILE,
    LOG_FILE, STORAGE_DIR, WRAPPER_FILE,
};
pub use validator::CodeValidator;
