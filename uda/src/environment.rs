use std::env;

use log::debug;

use crate::protocol::{DEFAULT_PORT, DEFAULT_TIMEOUT_SECS};

pub const DEFAULT_API_DELIM: &str = "::";
pub const DEFAULT_DEVICE: &str = "MAST";
pub const DEFAULT_ARCHIVE: &str = "MAST";
pub const DEFAULT_FORMAT: &str = "netcdf";

/// Process configuration, read once at startup and never mutated after.
#[derive(Debug, Clone)]
pub struct Environment {
    pub host: String,
    pub port: u16,
    /// When set, every request is forwarded to this peer without
    /// interpretation.
    pub proxy: String,
    pub default_device: String,
    pub default_archive: String,
    /// Server-side default file format for bare `/shot[/pass]` paths.
    pub default_format: String,
    pub api_delim: String,
    pub client_flags: u32,
    pub private_flags: u32,
    pub timeout_secs: u64,
    pub enable_cache: bool,
    pub client_doi: String,
    pub os_name: String,
    /// Probe binary used to tell netCDF4 from HDF5 when sniffing magics.
    pub dump_netcdf: Option<String>,
    /// Probe binary used to recognise legacy IDA files.
    pub dump_ida: Option<String>,
}

impl Default for Environment {
    fn default() -> Self {
        Environment {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            proxy: String::new(),
            default_device: DEFAULT_DEVICE.to_string(),
            default_archive: DEFAULT_ARCHIVE.to_string(),
            default_format: DEFAULT_FORMAT.to_string(),
            api_delim: DEFAULT_API_DELIM.to_string(),
            client_flags: 0,
            private_flags: 0,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            enable_cache: false,
            client_doi: String::new(),
            os_name: String::new(),
            dump_netcdf: None,
            dump_ida: None,
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

impl Environment {
    /// Captures the recognised `UDA_*` variables from the process
    /// environment. Anything unset keeps its default.
    pub fn capture() -> Self {
        let mut e = Environment::default();
        if let Some(host) = var("UDA_HOST") {
            e.host = host;
        }
        if let Some(port) = var("UDA_PORT").and_then(|p| p.parse().ok()) {
            e.port = port;
        }
        if let Some(proxy) = var("UDA_PROXY") {
            e.proxy = proxy;
        }
        if let Some(device) = var("UDA_DEVICE") {
            e.default_device = device;
        }
        if let Some(archive) = var("UDA_ARCHIVE") {
            e.default_archive = archive;
        }
        if let Some(format) = var("UDA_FORMAT") {
            e.default_format = format;
        }
        if let Some(delim) = var("UDA_API_DELIM") {
            e.api_delim = delim;
        }
        if let Some(flags) = var("UDA_CLIENTFLAGS").and_then(|f| f.parse().ok()) {
            e.client_flags = flags;
        }
        if let Some(flags) = var("UDA_PRIVATEFLAGS").and_then(|f| f.parse().ok()) {
            e.private_flags = flags;
        }
        if let Some(timeout) = var("UDA_TIMEOUT").and_then(|t| t.parse().ok()) {
            e.timeout_secs = timeout;
        }
        e.enable_cache = var("UDA_CACHE").is_some();
        if let Some(doi) = var("UDA_CLIENT_DOI") {
            e.client_doi = doi;
        }
        if let Some(os) = var("OSTYPE") {
            e.os_name = os;
        }
        e.dump_netcdf = var("UDA_DUMP_NETCDF");
        e.dump_ida = var("UDA_DUMP_IDA");
        debug!("environment captured: {}:{}", e.host, e.port);
        e
    }
}
