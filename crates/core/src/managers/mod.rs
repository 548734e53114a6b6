mod ai_servers;
pub mod external;
mod management;
pub mod manifest;
pub mod mcp;
pub mod mcp_protocol;
pub mod mcp_transport;
pub mod router;
pub mod supervisor;

pub use ai_servers::{AiServers, Created};
pub use external::ExternalServers;
pub use management::ManagementTools;
pub use manifest::{ManifestEntry, ManifestStore};
pub use router::{BuiltinHandler, ToolRouter, ToolTarget};
pub use supervisor::{ProcessSupervisor, Redeployed, SupervisorOptions};
