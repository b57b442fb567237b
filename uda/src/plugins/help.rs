//! The built-in server-side function library. Small by design: it answers
//! liveness pings and describes what the server has loaded.

use std::fmt::Write as _;

use crate::errors::{Result, UdaError};
use crate::plugins::{Plugin, PluginInterface};

pub struct HelpPlugin;

impl Plugin for HelpPlugin {
    fn entry(&self, iface: &mut PluginInterface<'_>) -> Result<()> {
        match iface.request.function.as_str() {
            "ping" => {
                *iface.data_block = crate::block::DataBlock::from_string("pong");
                iface.data_block.data_desc = "server liveness".to_string();
                Ok(())
            }
            "help" | "" => {
                *iface.data_block = crate::block::DataBlock::from_string(
                    "help::ping() - test server liveness\n\
                     help::services() - list the registered data access plugins\n",
                );
                Ok(())
            }
            "services" => {
                let listing = render_services(iface.plugins);
                *iface.data_block = crate::block::DataBlock::from_string(&listing);
                Ok(())
            }
            other => Err(UdaError::Plugin {
                code: 998,
                message: format!("unknown help function '{other}'"),
            }),
        }
    }
}

/// Renders the services listing for the help plugin; called by the server,
/// which owns the registry.
pub fn render_services(descriptors: &[crate::plugins::PluginDescriptor]) -> String {
    let mut out = format!("{} registered plugins:\n", descriptors.len());
    for d in descriptors {
        let _ = writeln!(out, "  {} [{:?}]", d.format, d.class);
    }
    out
}
