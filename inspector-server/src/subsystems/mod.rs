pub mod firewall;
pub mod introspect;
pub mod sweep;
