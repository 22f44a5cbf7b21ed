//! Probe module registry

mod echo_state;
mod http;
mod null_udp;

pub use echo_state::EchoStateProbe;
pub use http::HttpProbe;
pub use null_udp::NullUdpProbe;

use crate::contract::ProbeModule;
use crate::tls_state::TlsStateProbe;
use strobe_core::{Error, Result};

/// Instantiate a probe module by name
pub fn create_probe_module(name: &str) -> Result<Box<dyn ProbeModule>> {
    match name {
        "http" => Ok(Box::new(HttpProbe::new())),
        "null-udp" => Ok(Box::new(NullUdpProbe::new())),
        "echo-state" => Ok(Box::new(EchoStateProbe::new())),
        "tls-state" => Ok(Box::new(TlsStateProbe::new())),
        other => Err(Error::Config(format!("unknown probe module: {}", other))),
    }
}

pub fn list_probe_modules() -> &'static [&'static str] {
    &["http", "null-udp", "echo-state", "tls-state"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_knows_every_probe() {
        for name in list_probe_modules() {
            let probe = create_probe_module(name).unwrap();
            assert_eq!(&probe.name(), name);
        }
        assert!(create_probe_module("nope").is_err());
    }
}
