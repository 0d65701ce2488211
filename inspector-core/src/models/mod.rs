pub mod node;
pub mod session;

pub use node::{BootDevice, InterfaceValidation, IpmiCredentials, Node, NodeValidation, PowerState, Port};
pub use session::{Attributes, Options, Session, SessionRow, BMC_ADDRESS_ATTRIBUTE, MACS_ATTRIBUTE, TIMEOUT_ERROR};
