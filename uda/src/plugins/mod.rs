use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::block::DataBlock;
use crate::environment::Environment;
use crate::errors::{Result, UdaError};
use crate::metadata::{DataSource, SignalDesc};
use crate::request::{RequestBlock, RequestKind};
use crate::structured::UserDefinedTypeList;

pub mod help;

/// How a plugin is addressed in a source string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginClass {
    File,
    Server,
    Function,
    Device,
    Other,
}

/// Registry entry: how a format prefix resolves to a backend.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    /// Prefix matched against source strings, case-insensitively.
    pub format: String,
    /// Filename extension matched when probing pathlike sources.
    pub extension: String,
    /// Entry-point symbol; "SERVERSIDE" marks the default function library.
    pub symbol: String,
    pub class: PluginClass,
    /// The request kind this descriptor routes to.
    pub kind: RequestKind,
    /// DEVICE class only: the access protocol the device name rewrites to.
    pub device_protocol: String,
    pub device_host: String,
    pub device_port: String,
}

impl PluginDescriptor {
    pub fn new(format: &str, class: PluginClass, kind: RequestKind) -> Self {
        PluginDescriptor {
            format: format.to_string(),
            extension: String::new(),
            symbol: String::new(),
            class,
            kind,
            device_protocol: String::new(),
            device_host: String::new(),
            device_port: String::new(),
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }

    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbol = symbol.to_string();
        self
    }

    pub fn device(format: &str, protocol: &str, host: &str, port: &str) -> Self {
        PluginDescriptor {
            format: format.to_string(),
            extension: String::new(),
            symbol: String::new(),
            class: PluginClass::Device,
            kind: RequestKind::Unknown,
            device_protocol: protocol.to_string(),
            device_host: host.to_string(),
            device_port: port.to_string(),
        }
    }
}

/// Everything a plugin sees. Plugins must be re-entrant; the dispatcher does
/// not serialise calls.
pub struct PluginInterface<'a> {
    pub request: &'a RequestBlock,
    pub data_source: &'a DataSource,
    pub signal_desc: &'a SignalDesc,
    pub data_block: &'a mut DataBlock,
    pub types: &'a mut UserDefinedTypeList,
    pub environment: &'a Environment,
    /// The registry's descriptor table, for plugins that describe the server.
    pub plugins: &'a [PluginDescriptor],
}

impl PluginInterface<'_> {
    /// Runs `body` over an acquired resource and releases it on every exit
    /// path, success or failure.
    pub fn with_resource<Res, Out>(
        &mut self,
        mut resource: Res,
        body: impl FnOnce(&mut Self, &mut Res) -> Result<Out>,
        release: impl FnOnce(Res),
    ) -> Result<Out> {
        let out = body(self, &mut resource);
        release(resource);
        out
    }
}

/// A backend reader's stable entry point.
pub trait Plugin: Send + Sync {
    fn entry(&self, iface: &mut PluginInterface<'_>) -> Result<()>;
}

/// Ordered set of plugin descriptors plus their implementations, looked up
/// case-insensitively by format or extension.
#[derive(Default)]
pub struct PluginRegistry {
    descriptors: Vec<PluginDescriptor>,
    entries: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the stock formats and the built-in help library.
    pub fn with_builtins() -> Self {
        let mut registry = PluginRegistry::new();
        registry.register(
            PluginDescriptor::new("help", PluginClass::Function, RequestKind::ServerSide)
                .with_symbol("SERVERSIDE"),
            Some(Arc::new(help::HelpPlugin)),
        );
        registry.register(
            PluginDescriptor::new("generic", PluginClass::Server, RequestKind::Generic),
            None,
        );
        registry.register(
            PluginDescriptor::new("netcdf", PluginClass::File, RequestKind::File)
                .with_extension("nc"),
            None,
        );
        registry.register(
            PluginDescriptor::new("hdf5", PluginClass::File, RequestKind::File)
                .with_extension("h5"),
            None,
        );
        registry.register(
            PluginDescriptor::new("ida3", PluginClass::File, RequestKind::File)
                .with_extension("99"),
            None,
        );
        registry.register(
            PluginDescriptor::new("xml", PluginClass::File, RequestKind::File)
                .with_extension("xml"),
            None,
        );
        registry.register(
            PluginDescriptor::new("csv", PluginClass::File, RequestKind::File)
                .with_extension("csv"),
            None,
        );
        registry.register(
            PluginDescriptor::new("UDA", PluginClass::Server, RequestKind::Forward),
            None,
        );
        registry.register(
            PluginDescriptor::new("MDS+", PluginClass::Server, RequestKind::Mds),
            None,
        );
        registry.register(
            PluginDescriptor::new("SQL", PluginClass::Server, RequestKind::Sql),
            None,
        );
        registry.register(
            PluginDescriptor::new("WEB", PluginClass::Server, RequestKind::Web),
            None,
        );
        registry
    }

    pub fn register(&mut self, descriptor: PluginDescriptor, entry: Option<Arc<dyn Plugin>>) {
        if let Some(entry) = entry {
            self.entries
                .insert(descriptor.format.to_lowercase(), entry);
        }
        self.descriptors.push(descriptor);
    }

    pub fn find_by_format(&self, format: &str) -> Option<&PluginDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.format.eq_ignore_ascii_case(format))
    }

    pub fn find_by_extension(&self, extension: &str) -> Option<&PluginDescriptor> {
        self.descriptors
            .iter()
            .find(|d| !d.extension.is_empty() && d.extension.eq_ignore_ascii_case(extension))
    }

    /// The default server-side function library, when one is registered.
    pub fn serverside(&self) -> Option<&PluginDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.symbol.eq_ignore_ascii_case("SERVERSIDE"))
    }

    pub fn descriptors(&self) -> &[PluginDescriptor] {
        &self.descriptors
    }

    fn entry_for(&self, request: &RequestBlock) -> Result<(&PluginDescriptor, &Arc<dyn Plugin>)> {
        let lookup = match request.kind {
            RequestKind::Generic => "generic",
            RequestKind::Forward => "UDA",
            RequestKind::Mds => "MDS+",
            RequestKind::Sql => "SQL",
            RequestKind::Web => "WEB",
            _ => request.format.as_str(),
        };
        let descriptor = self.find_by_format(lookup).ok_or_else(|| UdaError::Plugin {
            code: 999,
            message: format!("no data access plugin identified for '{lookup}'"),
        })?;
        let entry = self
            .entries
            .get(&descriptor.format.to_lowercase())
            .ok_or_else(|| UdaError::Plugin {
                code: 999,
                message: format!("plugin '{}' has no implementation loaded", descriptor.format),
            })?;
        Ok((descriptor, entry))
    }

    /// Routes a request to its plugin and collects the result into
    /// `iface.data_block`.
    pub fn dispatch(&self, iface: &mut PluginInterface<'_>) -> Result<()> {
        let (descriptor, entry) = self.entry_for(iface.request)?;
        debug!(
            "dispatching {:?} request to plugin '{}'",
            iface.request.kind, descriptor.format
        );
        entry.entry(iface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.find_by_format("NETCDF").is_some());
        assert!(registry.find_by_extension("NC").is_some());
        assert!(registry.find_by_format("nosuch").is_none());
        assert_eq!(registry.serverside().unwrap().format, "help");
    }

    #[test]
    fn dispatch_without_implementation_is_a_plugin_error() {
        let registry = PluginRegistry::with_builtins();
        let mut request = RequestBlock::new();
        request.kind = RequestKind::File;
        request.format = "netcdf".to_string();
        let mut block = DataBlock::new();
        let mut types = UserDefinedTypeList::new();
        let environment = Environment::default();
        let data_source = DataSource::default();
        let signal_desc = SignalDesc::default();
        let descriptors = registry.descriptors().to_vec();
        let mut iface = PluginInterface {
            request: &request,
            data_source: &data_source,
            signal_desc: &signal_desc,
            data_block: &mut block,
            types: &mut types,
            environment: &environment,
            plugins: &descriptors,
        };
        assert!(matches!(
            registry.dispatch(&mut iface),
            Err(UdaError::Plugin { .. })
        ));
    }
}
