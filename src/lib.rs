pub mod collective;
pub mod config;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod error;
pub mod group;
pub mod reduce;
pub mod store;
pub mod tensor;
pub mod transport;
pub mod types;
mod work;

pub use collective::{RecvWork, SendWork};
pub use config::GroupOptions;
pub use error::{CohortError, Result};
pub use group::ProcessGroup;
pub use reduce::{reduce_function, ReduceFn};
pub use store::{HashStore, PrefixStore, Store};
pub use tensor::{Element, Tensor};
pub use transport::{Context, LocalDevice, PendingRecv, PendingSend, TransportDevice};
pub use types::{DeviceKind, Layout, Rank, ReduceOp, ScalarType};
pub use work::Work;
