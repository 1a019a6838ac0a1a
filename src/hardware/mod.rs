pub mod dispatch;
pub mod interface;
pub mod simulated;

pub use dispatch::{dispatch, DispatchReport, DispatchSettings};
pub use interface::{AwgDevice, AwgSession, DeviceStatus};
pub use simulated::{AwgCall, SimulatedAwg};
