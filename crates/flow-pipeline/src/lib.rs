pub mod books;
pub mod capture;
pub mod decode;
pub mod device;
pub mod extmap;
pub mod flow;
pub mod flowtree;
pub mod ipfrag;
pub mod nffile;
pub mod node;
pub mod nodelist;
pub mod rotation;
pub mod spool;
pub mod worker;

pub use books::Bookkeeper;
pub use capture::{spawn_capture, CaptureConfig};
pub use device::PacketDevice;
pub use extmap::ExtensionSet;
pub use flow::{spawn_flow, FlowConfig};
pub use flowtree::{DEFAULT_ACTIVE_SECS, DEFAULT_CACHE_SIZE, DEFAULT_INACTIVE_SECS};
pub use nffile::{Compression, FlowFileReader};
pub use node::{FlowKey, FlowNode, NodeEvent};
pub use nodelist::{node_list, NodeReceiver, NodeSender};
pub use worker::{SupervisorTx, WorkerEvent};
