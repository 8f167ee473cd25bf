//! Common imports for building on starmesh.

pub use crate::config::MeshConfig;
pub use crate::error::{DispatchError, LinkError, MeshError};
pub use crate::events::{BusEvent, EventBus, Matcher};
pub use crate::link::{Delivery, LinkEvent, LinkEventKind, LinkManager};
pub use crate::network::{reducer, NetworkEvent, NetworkEventKind, Reducer, ReplicationNetwork};
pub use crate::transport::{MemoryNetwork, Network};
pub use crate::types::{PeerId, Tag};

// Re-export commonly used external types
pub use serde::{Deserialize, Serialize};
pub use serde_json::{json, Value};
pub use std::rc::Rc;
pub use std::time::Duration;
