//! Normalises a free-form `(signal, source)` pair into a RequestBlock.
//!
//! Source forms recognised:
//!
//!   shot                        integer pulse number
//!   shot/pass                   pass may be text, e.g. LATEST
//!   DEVICE::shot[/pass]
//!   FORMAT::/path/to/file
//!   /path/to/file.ext           format from the extension or a magic probe
//!   function(args)              server-side function
//!   LIBRARY::function(args)     function-library plugin
//!   PROTOCOL::host:port/tail    server access
//!   DEVICE::FORMAT::...         device rewritten to its access protocol
//!
//! Signal forms: `signal`, `ARCHIVE::signal`, with an optional trailing
//! subset expression in `[]` or `{}` and an optional `lib::fn(args)` shape
//! when no source is given.

use std::io::Read;

use log::debug;

use crate::environment::Environment;
use crate::errors::{RequestError, Result};
use crate::plugins::{PluginClass, PluginRegistry};
use crate::protocol::{MAX_RANK, MAX_REQUEST_DEPTH};
use crate::request::{DataSubset, NameValueList, RequestBlock, RequestKind};

const MAX_ARCHIVE_NAME: usize = 256;

/// Parses one request. The registry supplies format prefixes, extensions and
/// device protocols; the environment supplies the defaults and the delimiter.
pub fn make_request_block(
    signal: &str,
    source: &str,
    registry: &PluginRegistry,
    environment: &Environment,
) -> Result<RequestBlock> {
    parse_with_depth(signal, source, registry, environment, 0)
}

fn parse_with_depth(
    signal: &str,
    source: &str,
    registry: &PluginRegistry,
    environment: &Environment,
    depth: usize,
) -> Result<RequestBlock> {
    let delim = environment.api_delim.as_str();
    let mut rb = RequestBlock::new();
    rb.api_delim = delim.to_string();
    rb.signal = signal.trim().to_string();
    rb.source = source.trim().to_string();

    let archive_prefix = format!("{}{}", environment.default_archive, delim);
    let device_prefix = format!("{}{}", environment.default_device, delim);

    let no_source = rb.source.is_empty()
        || rb.source.eq_ignore_ascii_case(&environment.default_device)
        || rb.source.eq_ignore_ascii_case(&device_prefix);

    if (rb.signal.is_empty() || rb.signal.eq_ignore_ascii_case(&archive_prefix)) && no_source {
        return Err(RequestError::EmptyRequest.into());
    }

    // Acting as a proxy: requests are redirected without interpretation.
    if !environment.proxy.is_empty() {
        rb.kind = RequestKind::Forward;
        rb.server = environment.proxy.clone();
        return Ok(rb);
    }

    // Strip a leading default-device prefix from the source.
    if !no_source && starts_with_ignore_case(&rb.source, &device_prefix) {
        rb.source = rb.source[device_prefix.len()..].trim_start().to_string();
    }

    // Split at the first delimiter into prefix and tail.
    let (mut prefix, mut work) = match rb.source.find(delim) {
        Some(at) => (
            Some(rb.source[..at].trim().to_string()),
            rb.source[at + delim.len()..].to_string(),
        ),
        None => (None, rb.source.clone()),
    };

    // DEVICE::LIBRARY::function(...) with the default device: discard the
    // device name and continue as if the source began at the library.
    if let Some(p) = &prefix {
        if p.eq_ignore_ascii_case(&environment.default_device) {
            if let Some(at) = work.find(delim) {
                prefix = Some(work[..at].trim().to_string());
                work = work[at + delim.len()..].trim_start().to_string();
            } else {
                prefix = None;
            }
        }
    }

    let mut is_function = false;
    let mut is_server = false;
    let mut is_foreign = false;

    'source_scan: {
        if no_source {
            rb.device = environment.default_device.clone();
            break 'source_scan;
        }

        match &prefix {
            None => {
                debug!("no device, format, protocol or library prefix present");
                rb.device = environment.default_device.clone();

                // shot or shot/pass selects the generic catalog.
                if generic_request_test(&work, &mut rb) {
                    break 'source_scan;
                }

                let p0 = work.find('/');
                let p1 = work.rfind('/');
                let popen = work.find('(');
                let pclose = work.rfind(')');

                let function_shaped = match (popen, pclose) {
                    (Some(o), Some(c)) => {
                        let path_before = p0.map(|s| s < o).unwrap_or(false);
                        let path_after = p1.map(|s| s > c).unwrap_or(false);
                        !path_before && !path_after
                    }
                    _ => false,
                };

                if !function_shaped {
                    if (p0.is_some() || p1.is_some()) && (popen.is_some() || pclose.is_some()) {
                        return Err(RequestError::PathWithParens.into());
                    }
                    // A private file: identify the format from the name or
                    // the first bytes of the file.
                    if !source_file_format_test(&work, &mut rb, registry, environment)? {
                        debug!("file format not identified from '{}'", work);
                        return Err(RequestError::UnknownFormat.into());
                    }
                    expand_environment_variables(&mut rb.path);
                    break 'source_scan;
                }

                // Internal server-side function.
                let inner = function_arguments(&work).ok_or(RequestError::FunctionSyntax)?;
                rb.kind = RequestKind::ServerSide;
                extract_function_name(&work, delim, &mut rb);
                rb.name_values = name_value_pairs(&inner, true)?;

                // An archive prefix on the signal may name a function library.
                extract_archive(&mut rb, false, environment)?;
                if let Some(desc) = registry.find_by_format(&rb.archive) {
                    rb.kind = desc.kind;
                    rb.format = desc.format.clone();
                }
                break 'source_scan;
            }
            Some(prefix) => {
                debug!("prefix '{}' present in the source", prefix);

                if let Some(desc) = registry.find_by_format(prefix) {
                    if desc.class == PluginClass::Device {
                        // Rewrite the device name to its access protocol and
                        // parse the substituted source.
                        let proto = registry.find_by_format(&desc.device_protocol);
                        if let Some(proto) = proto
                            .filter(|p| matches!(p.class, PluginClass::Server | PluginClass::Device))
                        {
                            let mut rewritten =
                                format!("{}{}{}", proto.format, delim, desc.device_host);
                            if !desc.device_port.is_empty() {
                                rewritten.push(':');
                                rewritten.push_str(&desc.device_port);
                            }
                            if !work.is_empty() {
                                if !work.starts_with('/') {
                                    rewritten.push('/');
                                }
                                rewritten.push_str(&work);
                            }
                            if depth >= MAX_REQUEST_DEPTH {
                                return Err(RequestError::RequestDepthExceeded.into());
                            }
                            debug!("device '{}' rewritten to '{}'", prefix, rewritten);
                            return parse_with_depth(
                                signal,
                                &rewritten,
                                registry,
                                environment,
                                depth + 1,
                            );
                        }
                    } else {
                        rb.kind = desc.kind;
                        rb.format = desc.format.clone();
                        if desc.class == PluginClass::File {
                            rb.path = work.clone();
                            rb.file = basename(&work).to_string();
                        } else {
                            // The tail is resolved by the selected server or
                            // library, not by the client.
                            rb.path = work.clone();
                            rb.file.clear();
                            if desc.class == PluginClass::Function {
                                is_function = true;
                                extract_function_name(&work, delim, &mut rb);
                            }
                        }
                        is_server = desc.class == PluginClass::Server;
                        if desc.class == PluginClass::File {
                            rb.device = environment.default_device.clone();
                            expand_environment_variables(&mut rb.path);
                            break 'source_scan;
                        }
                    }
                }

                if rb.kind == RequestKind::Unknown {
                    // Unregistered prefix: a foreign device. The catalog
                    // identifies how to reach its data.
                    debug!("no plugin identified for the prefix '{}'", prefix);
                    is_foreign = true;
                    rb.device = prefix.clone();
                    rb.kind = RequestKind::Generic;
                    break 'source_scan;
                }

                rb.device = environment.default_device.clone();

                if is_server && !is_function {
                    break 'source_scan;
                }

                // A library plugin was named: the tail must be a function.
                let p0 = work.find('/');
                let p1 = work.rfind('/');
                let popen = work.find('(');
                let pclose = work.rfind(')');
                let well_formed = match (popen, pclose) {
                    (Some(o), Some(c)) => {
                        o < c
                            && !p0.map(|s| s < o).unwrap_or(false)
                            && !p1.map(|s| s > c).unwrap_or(false)
                    }
                    _ => false,
                };
                if !well_formed {
                    return Err(RequestError::FunctionSyntax.into());
                }
                let inner = function_arguments(&work).ok_or(RequestError::FunctionSyntax)?;
                rb.name_values = name_value_pairs(&inner, true)?;
                break 'source_scan;
            }
        }
    }

    debug!("source scan complete: {:?} '{}'", rb.kind, rb.format);

    // Extract a trailing subset expression from the signal.
    match extract_subset(&rb.signal)? {
        Some((subset, text)) => {
            if let Some(at) = rb.signal.find(&text) {
                rb.signal.truncate(at);
                rb.signal = rb.signal.trim().to_string();
            }
            rb.subset = subset;
            rb.subset_text = text;
        }
        None => {
            rb.subset = DataSubset::default();
            rb.subset_text.clear();
        }
    }

    // Detach an archive prefix from the signal unless the request is being
    // forwarded or names a foreign device.
    let reduce_signal = rb.kind != RequestKind::Forward && !is_foreign;
    extract_archive(&mut rb, reduce_signal, environment)?;
    if rb.archive.is_empty() {
        rb.archive = environment.default_archive.clone();
    }

    // A function call in the signal, prefixed by a library other than the
    // default archive.
    if !is_server
        && !rb.archive.eq_ignore_ascii_case(&environment.default_archive)
        && rb.signal.contains('(')
        && rb.signal.rfind(')').map(|c| c > rb.signal.find('(').unwrap_or(0)) == Some(true)
    {
        if let Some(inner) = function_arguments(&rb.signal) {
            is_function = true;
            rb.name_values = name_value_pairs(&inner, true)?;
            let signal = rb.signal.clone();
            extract_function_name(&signal, delim, &mut rb);
        }
    }

    if no_source {
        debug!("no source: all requirements are in the signal");
        if is_function {
            // Match the archive name against the function libraries.
            let mut found = false;
            if let Some(desc) = registry.find_by_format(&rb.archive) {
                rb.kind = desc.kind;
                rb.format = desc.format.clone();
                found = desc.class == PluginClass::Function;
            }
            if !found {
                // Fall back to the default server-side function library.
                match registry.serverside() {
                    Some(desc) => {
                        rb.kind = RequestKind::ServerSide;
                        rb.format = desc.format.clone();
                    }
                    None => rb.function.clear(),
                }
            }
        } else {
            // No source and no library: a generic catalog lookup.
            rb.kind = RequestKind::Generic;
        }
    } else if is_function && !rb.archive.eq_ignore_ascii_case(&environment.default_archive) {
        // LIBRARY::function in the signal combined with a source: the source
        // keeps priority unless it left the request undecided.
        if let Some(desc) = registry.find_by_format(&rb.archive) {
            if desc.class == PluginClass::Function
                && !desc.symbol.eq_ignore_ascii_case("SERVERSIDE")
                && matches!(rb.kind, RequestKind::Generic | RequestKind::Unknown)
            {
                rb.kind = desc.kind;
                rb.format = desc.format.clone();
            }
        }
    }

    match rb.kind {
        RequestKind::Mds => parse_mds_source(&work, &mut rb)?,
        RequestKind::Forward | RequestKind::Web => parse_server_source(&work, &mut rb),
        RequestKind::Sql => parse_sql_source(&mut rb),
        _ => {}
    }

    Ok(rb)
}

fn starts_with_ignore_case(haystack: &str, prefix: &str) -> bool {
    haystack.len() >= prefix.len() && haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn is_number(s: &str) -> bool {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `shot` or `shot/pass`: selects the generic catalog and captures the
/// identifiers.
fn generic_request_test(source: &str, rb: &mut RequestBlock) -> bool {
    if source.is_empty() || source.starts_with('/') {
        return false;
    }
    if is_number(source) {
        if let Ok(exp_number) = source.parse() {
            rb.kind = RequestKind::Generic;
            rb.exp_number = exp_number;
            rb.path.clear();
            debug!("shot number identified, selecting the generic catalog");
            return true;
        }
        return false;
    }
    let mut tokens = source.split('/');
    let first = tokens.next().unwrap_or("");
    if !is_number(first) {
        return false;
    }
    let Ok(exp_number) = first.parse() else {
        return false;
    };
    rb.kind = RequestKind::Generic;
    rb.exp_number = exp_number;
    rb.path.clear();
    if let Some(second) = tokens.next().filter(|t| !t.is_empty()) {
        if is_number(second) {
            if let Ok(pass) = second.parse() {
                rb.pass = pass;
            }
        } else {
            rb.tpass = second.to_string();
        }
    }
    true
}

fn is_legal_file_path(path: &str) -> bool {
    path.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'/' | b'$' | b'~'))
}

/// Identifies a private file's format from its extension, or failing that
/// from its first bytes. Returns false when no format could be identified.
fn source_file_format_test(
    source: &str,
    rb: &mut RequestBlock,
    registry: &PluginRegistry,
    environment: &Environment,
) -> Result<bool> {
    rb.format.clear();
    rb.file.clear();
    rb.kind = RequestKind::Unknown;

    if source.is_empty() || !is_legal_file_path(source) {
        return Ok(false);
    }

    let extension = basename(source).rsplit_once('.').map(|(_, ext)| ext);

    match extension {
        None => {
            // No extension: read the first bytes. netCDF and HDF5 share the
            // HDF label, so a dumper utility disambiguates when available.
            let Some(magic) = read_magic(source) else {
                return Ok(false);
            };
            if magic.starts_with("CDF") {
                rb.format = "netcdf".to_string();
            } else if magic.starts_with("HDF") || magic.contains("HDF") {
                rb.format = match &environment.dump_netcdf {
                    Some(dumper) if probe_reports(dumper, source, "netcdf") => {
                        "netcdf".to_string()
                    }
                    _ => "hdf5".to_string(),
                };
            } else if let Some(dumper) = &environment.dump_ida {
                if probe_succeeds(dumper, source) {
                    rb.format = "ida3".to_string();
                } else {
                    return Ok(false);
                }
            } else {
                return Ok(false);
            }
        }
        Some(ext) => {
            if let Some(desc) = registry.find_by_extension(ext) {
                rb.format = desc.format.clone();
            } else if ext.len() == 2 && is_number(ext) {
                rb.format = "ida3".to_string();
            } else if ext.eq_ignore_ascii_case("nc") || ext.eq_ignore_ascii_case("cdf") {
                rb.format = "netcdf".to_string();
            } else if ext.eq_ignore_ascii_case("hf")
                || ext.eq_ignore_ascii_case("h5")
                || ext.eq_ignore_ascii_case("hdf5")
            {
                rb.format = "hdf5".to_string();
            } else if ext.eq_ignore_ascii_case("xml") {
                rb.format = "xml".to_string();
            } else if ext.eq_ignore_ascii_case("csv") {
                rb.format = "csv".to_string();
            } else if source.starts_with('/')
                && source[1..].starts_with(|c: char| c.is_ascii_digit())
                && generic_request_test(&source[1..], rb)
            {
                // A bare /shot[/pass] path: the default server file format.
                rb.kind = RequestKind::Unknown;
                rb.format = environment.default_format.clone();
            } else {
                return Ok(false);
            }
        }
    }

    // The format must be backed by a registered plugin.
    if let Some(desc) = registry.find_by_format(&rb.format.clone()) {
        debug!("format '{}' identified for '{}'", rb.format, source);
        rb.kind = desc.kind;
        if desc.class == PluginClass::File {
            rb.file = basename(source).to_string();
            rb.path = source.to_string();
        } else {
            rb.file.clear();
        }
        return Ok(true);
    }
    Ok(false)
}

fn read_magic(source: &str) -> Option<String> {
    let mut file = std::fs::File::open(source).ok()?;
    let mut buf = [0u8; 10];
    let n = file.read(&mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf[..n]).trim().to_string())
}

fn probe_reports(dumper: &str, source: &str, needle: &str) -> bool {
    std::process::Command::new(dumper)
        .arg("-h")
        .arg(source)
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(needle))
        .unwrap_or(false)
}

fn probe_succeeds(dumper: &str, source: &str) -> bool {
    std::process::Command::new(dumper)
        .arg("-h")
        .arg(source)
        .output()
        .map(|out| !String::from_utf8_lossy(&out.stdout).contains("ida_open error"))
        .unwrap_or(false)
}

/// The text between the outermost parentheses, or None when unbalanced.
fn function_arguments(text: &str) -> Option<String> {
    let open = text.find('(')?;
    let close = text.rfind(')')?;
    if close < open {
        return None;
    }
    Some(text[open + 1..close].trim().to_string())
}

/// The token before `(`, with every `LIB::` prefix stripped.
fn extract_function_name(text: &str, delim: &str, rb: &mut RequestBlock) {
    if text.is_empty() {
        return;
    }
    let Some(open) = text.find('(') else {
        return;
    };
    let mut name = &text[..open];
    while let Some(at) = name.find(delim) {
        name = &name[at + delim.len()..];
    }
    rb.function = name.trim().to_string();
}

/// Resolves `$VAR` components of a server-side path against the process
/// environment. Unset variables are left verbatim.
fn expand_environment_variables(path: &mut String) {
    if !path.contains('$') {
        return;
    }
    let mut out = String::with_capacity(path.len());
    let mut rest = path.as_str();
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        rest = &rest[at + 1..];
        let end = rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(rest.len());
        let name = &rest[..end];
        match std::env::var(name) {
            Ok(value) if !name.is_empty() => out.push_str(&value),
            _ => {
                out.push('$');
                out.push_str(name);
            }
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    debug!("path expanded to '{}'", out);
    *path = out;
}

/// Detaches an `ARCHIVE::` prefix from the signal. Bracketed numeric content
/// adjoining the delimiter is subset syntax, not an archive name, and is
/// left alone. When `reduce_signal` is false the archive is recorded but the
/// signal is passed on untouched.
fn extract_archive(
    rb: &mut RequestBlock,
    reduce_signal: bool,
    environment: &Environment,
) -> Result<()> {
    let delim = rb.api_delim.clone();
    rb.signal = rb.signal.trim().to_string();
    if rb.signal.is_empty() {
        return Ok(());
    }
    let Some(at) = rb.signal.find(&delim) else {
        return Ok(());
    };

    if at >= MAX_ARCHIVE_NAME {
        return Err(RequestError::ArchiveNameTooLong.into());
    }
    let candidate = rb.signal[..at].trim().to_string();
    let remainder = rb.signal[at + delim.len()..].to_string();

    // An archive name equal to the local archive is dropped entirely.
    if reduce_signal && candidate.eq_ignore_ascii_case(&environment.default_archive) {
        rb.archive.clear();
        rb.signal = remainder;
        return extract_archive(rb, reduce_signal, environment);
    }

    if !is_legal_file_path(&candidate) {
        rb.archive.clear();
        return Ok(());
    }

    // Subset-syntax conflict tests on both sides of the delimiter.
    let left_conflict = candidate
        .find(['[', '{'])
        .map(|b| {
            let inner = &candidate[b + 1..];
            inner.is_empty() || is_number(inner)
        })
        .unwrap_or(false);
    let right_conflict = remainder
        .find([']', '}'])
        .map(|b| {
            let inner = &remainder[..b];
            inner.is_empty() || is_number(inner)
        })
        .unwrap_or(false);

    if left_conflict || right_conflict {
        rb.archive.clear();
        return Ok(());
    }

    rb.archive = candidate;
    if reduce_signal {
        rb.signal = remainder.trim().to_string();
    }
    debug!("archive '{}', signal '{}'", rb.archive, rb.signal);
    Ok(())
}

/// Parses a trailing subset expression. `Ok(None)` means the bracketed text
/// is not subset syntax and the signal is left untouched; malformed bounds
/// are an error.
fn extract_subset(signal: &str) -> Result<Option<(DataSubset, String)>> {
    let Some(open) = signal.find(['[', '{']) else {
        return Ok(None);
    };
    let Some(close) = signal.rfind([']', '}']) else {
        return Ok(None);
    };
    if close < open {
        return Ok(None);
    }

    let text = signal[open..=close].to_string();
    let inner = text[1..text.len() - 1]
        .replace("][", ",")
        .replace("}{", ",");

    let mut subset = DataSubset::default();
    for dim in inner.split(',').take(MAX_RANK) {
        let dim = dim.trim();

        // Normalise the shorthand forms: ':...' -> '0:...', 'a::c' -> 'a:*:c'.
        let mut work = dim.to_string();
        if work.starts_with(':') {
            work.insert(0, '0');
        }
        if let Some(at) = work.find("::") {
            work.replace_range(at..at + 2, ":*:");
        }

        let (start, stop, count, stride, flag);
        if work.contains(':') {
            let parts: Vec<&str> = work.splitn(3, ':').map(str::trim).collect();
            if parts[0].is_empty() || !is_number(parts[0]) {
                return Ok(None);
            }
            start = parse_index(parts[0])?;
            let mut dim_stop = start;
            let mut dim_count = 1;
            let mut dim_flag = true;
            match parts.get(1).copied().unwrap_or("") {
                "" | "*" => {
                    dim_stop = -1;
                    dim_count = -1;
                }
                bound if is_number(bound) => {
                    dim_stop = parse_index(bound)?;
                    if dim_stop < start {
                        return Err(RequestError::BadSubset.into());
                    }
                    dim_count = dim_stop - start + 1;
                }
                _ => return Ok(None),
            }
            let mut dim_stride = 1;
            if let Some(step) = parts.get(2).filter(|s| !s.is_empty()) {
                if !is_number(step) {
                    return Ok(None);
                }
                dim_stride = step
                    .parse::<i32>()
                    .map_err(|_| RequestError::BadSubset)?;
                if dim_stride < 1 {
                    return Err(RequestError::BadSubset.into());
                }
                if dim_stride > 1 {
                    dim_flag = true;
                    if dim_count > 1 {
                        dim_count = (dim_count + dim_stride - 1) / dim_stride;
                    }
                }
            }
            if dim_stop == -1 && dim_count == -1 && dim_stride == 1 && start == 0 {
                dim_flag = false;
            }
            stop = dim_stop;
            count = dim_count;
            stride = dim_stride;
            flag = dim_flag;
        } else if work.is_empty() || work == "*" {
            start = 0;
            stop = -1;
            count = -1;
            stride = 1;
            flag = false;
        } else if is_number(&work) {
            start = parse_index(&work)?;
            stop = start;
            count = 1;
            stride = 1;
            flag = true;
        } else {
            return Ok(None);
        }

        subset.start.push(start);
        subset.stop.push(stop);
        subset.count.push(count);
        subset.stride.push(stride);
        subset.subset_flag.push(flag);
        subset.rank += 1;
    }

    if subset.rank == 0 {
        return Ok(None);
    }
    Ok(Some((subset, text)))
}

fn parse_index(text: &str) -> Result<i32> {
    let value: i32 = text.parse().map_err(|_| RequestError::BadSubset)?;
    if value < 0 {
        return Err(RequestError::BadSubset.into());
    }
    Ok(value)
}

/// `name1=value1, name2=value2, ...` with optional quoting, `/flag`
/// keywords, placeholder values, and a `delimiter='c'` override.
pub fn name_value_pairs(pair_list: &str, strip: bool) -> Result<NameValueList> {
    let mut list = NameValueList::new();
    let text = pair_list.trim();
    if text.is_empty() {
        return Ok(list);
    }
    if text.starts_with('=') || text.ends_with('=') {
        return Err(RequestError::NameValueSyntax.into());
    }

    let delimiter = find_delimiter_override(text).unwrap_or(',');

    // Split on the delimiter, ignoring any inside quotes.
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in text.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                current.push(c);
            }
            None if c == delimiter => {
                pairs.push(std::mem::take(&mut current));
            }
            None => current.push(c),
        }
    }
    pairs.push(current);

    for pair in pairs {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (name, value) = parse_name_value(pair, delimiter)?;
        let (value, quoted) = if strip { strip_quotes(&value) } else { (value, false) };
        let (name, _) = if strip {
            strip_quotes(&name)
        } else {
            (name, false)
        };
        list.insert(&name, &value, quoted);
    }
    Ok(list)
}

/// Recognises a leading-position `delimiter='c'` pair.
fn find_delimiter_override(text: &str) -> Option<char> {
    let lower = text.to_ascii_lowercase();
    let at = lower.find("delimiter")?;
    // Accepted only at the start of the list; anywhere else 'delimiter' is
    // an ordinary argument name whose pair uses the proposed character.
    let before = text[..at].trim();
    let after = text[at + "delimiter".len()..].trim_start();
    let rest = after.strip_prefix('=')?.trim_start();
    let mut chars = rest.chars();
    let (q1, proposal, q2) = (chars.next()?, chars.next()?, chars.next()?);
    if (q1 == '\'' || q1 == '"') && q1 == q2 {
        if before.is_empty() || before.ends_with(proposal) {
            return Some(proposal);
        }
    }
    None
}

fn parse_name_value(pair: &str, _delimiter: char) -> Result<(String, String)> {
    if let Some((name, value)) = pair.split_once('=') {
        let name = name.trim().to_string();
        let mut value = value.trim().to_string();
        // A trailing unquoted parenthesis is an artifact of placeholder
        // substitution, not part of the value.
        if value.ends_with(')') && !value.starts_with('\'') && !value.starts_with('"') {
            value.pop();
            value = value.trim_end().to_string();
        }
        if name.is_empty() {
            return Err(RequestError::NameValueSyntax.into());
        }
        Ok((name, value))
    } else if let Some(keyword) = pair.strip_prefix('/') {
        // Keyword form: /name binds to true.
        Ok((keyword.trim().to_string(), "true".to_string()))
    } else {
        // Stand-alone placeholder value.
        Ok((pair.to_string(), pair.to_string()))
    }
}

fn strip_quotes(text: &str) -> (String, bool) {
    let t = text.trim();
    if t.len() >= 2 {
        let bytes = t.as_bytes();
        if (bytes[0] == b'\'' && bytes[t.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[t.len() - 1] == b'"')
        {
            return (t[1..t.len() - 1].trim().to_string(), true);
        }
    }
    (t.to_string(), false)
}

/// MDS+ sources: `server/tree/number`, `tree/number`, `server`, or empty.
/// Tokenised from the right: a trailing number is the tree number, the token
/// before it the tree name, everything else the server.
fn parse_mds_source(tail: &str, rb: &mut RequestBlock) -> Result<()> {
    if tail.is_empty() {
        rb.server.clear();
        return Ok(());
    }
    let trimmed = tail.trim_start_matches('/');
    let tokens: Vec<&str> = trimmed.split('/').filter(|t| !t.is_empty()).collect();
    match tokens.last() {
        Some(last) if is_number(last) => {
            rb.exp_number = last.parse().map_err(|_| RequestError::NoServerSpecified)?;
            if tokens.len() < 2 {
                return Err(RequestError::NoServerSpecified.into());
            }
            rb.file = tokens[tokens.len() - 2].to_string();
            let server = tokens[..tokens.len() - 2].join("/");
            rb.server = if tail.starts_with('/') && !server.is_empty() {
                format!("/{server}")
            } else {
                server
            };
        }
        Some(_) => {
            rb.server = tail.to_string();
        }
        None => rb.server.clear(),
    }
    Ok(())
}

/// Peer and web sources: `server[:port]/source`, with an optional `SSL://`
/// prefix kept attached to the server.
fn parse_server_source(tail: &str, rb: &mut RequestBlock) {
    rb.server = tail.to_string();
    let after_scheme = tail.find("SSL://").map(|at| at + 6).unwrap_or(0);
    if let Some(slash) = tail[after_scheme..].find('/') {
        let at = after_scheme + slash;
        rb.server = tail[..at].to_string();
        rb.file = tail[at + 1..].to_string();
    }
}

/// SQL sources: `server/path...`.
fn parse_sql_source(rb: &mut RequestBlock) {
    rb.server = rb.path.clone();
    if let Some(at) = rb.server.find('/') {
        rb.path = rb.server[at + 1..].to_string();
        rb.server.truncate(at);
    } else {
        rb.path.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UdaError;
    use crate::plugins::PluginDescriptor;

    fn env() -> Environment {
        Environment::default()
    }

    fn registry() -> PluginRegistry {
        PluginRegistry::with_builtins()
    }

    #[test]
    fn generic_integer_shot() {
        let rb = make_request_block("ip", "12345", &registry(), &env()).unwrap();
        assert_eq!(rb.kind, RequestKind::Generic);
        assert_eq!(rb.exp_number, 12345);
        assert_eq!(rb.archive, env().default_archive);
        assert_eq!(rb.signal, "ip");
        assert!(rb.subset.is_empty());
        assert!(rb.name_values.is_empty());
    }

    #[test]
    fn generic_shot_with_pass_and_text_pass() {
        let rb = make_request_block("ip", "12345/7", &registry(), &env()).unwrap();
        assert_eq!(rb.exp_number, 12345);
        assert_eq!(rb.pass, 7);

        let rb = make_request_block("ip", "12345/LATEST", &registry(), &env()).unwrap();
        assert_eq!(rb.tpass, "LATEST");
        assert_eq!(rb.pass, -1);
    }

    #[test]
    fn file_by_extension() {
        let rb = make_request_block("/group/x", "/data/run.nc", &registry(), &env()).unwrap();
        assert_eq!(rb.kind, RequestKind::File);
        assert_eq!(rb.format, "netcdf");
        assert_eq!(rb.file, "run.nc");
        assert_eq!(rb.path, "/data/run.nc");
    }

    #[test]
    fn file_by_explicit_format_prefix() {
        let rb = make_request_block("/top/te", "HDF5::/scratch/shot.dat", &registry(), &env())
            .unwrap();
        assert_eq!(rb.kind, RequestKind::File);
        assert_eq!(rb.format, "hdf5");
        assert_eq!(rb.file, "shot.dat");
        assert_eq!(rb.path, "/scratch/shot.dat");
    }

    #[test]
    fn function_call_via_source() {
        let rb = make_request_block("", "help::ping()", &registry(), &env()).unwrap();
        assert_eq!(rb.kind, RequestKind::ServerSide);
        assert_eq!(rb.format, "help");
        assert_eq!(rb.function, "ping");
        assert!(rb.name_values.is_empty());
    }

    #[test]
    fn function_call_with_arguments() {
        let rb = make_request_block(
            "",
            "help::services(verbose='yes, please', /brief)",
            &registry(),
            &env(),
        )
        .unwrap();
        assert_eq!(rb.function, "services");
        assert_eq!(rb.name_values.value("verbose"), Some("yes, please"));
        assert!(rb.name_values.get("verbose").unwrap().quoted);
        assert_eq!(rb.name_values.value("brief"), Some("true"));
    }

    #[test]
    fn subset_with_stride_and_open_dimension() {
        let rb = make_request_block("te[0:99:2, *]", "54321", &registry(), &env()).unwrap();
        assert_eq!(rb.signal, "te");
        assert_eq!(rb.subset.rank, 2);
        assert_eq!(rb.subset.start, vec![0, 0]);
        assert_eq!(rb.subset.stop, vec![99, -1]);
        assert_eq!(rb.subset.stride, vec![2, 1]);
        assert_eq!(rb.subset.count, vec![50, -1]);
        assert_eq!(rb.subset_text, "[0:99:2, *]");
    }

    #[test]
    fn subset_forms() {
        for (text, start, stop, count, stride) in [
            ("x[5]", 5, 5, 1, 1),
            ("x[3:]", 3, -1, -1, 1),
            ("x[3:*]", 3, -1, -1, 1),
            ("x[0:9]", 0, 9, 10, 1),
            ("x[2:11:3]", 2, 11, 4, 3),
            ("x[::4]", 0, -1, -1, 4),
            ("x{1:5}", 1, 5, 5, 1),
        ] {
            let rb = make_request_block(text, "1", &registry(), &env()).unwrap();
            assert_eq!(rb.signal, "x", "{text}");
            assert_eq!(rb.subset.start[0], start, "{text}");
            assert_eq!(rb.subset.stop[0], stop, "{text}");
            assert_eq!(rb.subset.count[0], count, "{text}");
            assert_eq!(rb.subset.stride[0], stride, "{text}");
        }
    }

    #[test]
    fn bad_subsets_are_rejected() {
        for text in ["x[9:3]", "x[0:5:0]", "x[-4]", "x[2:-1]"] {
            let err = make_request_block(text, "1", &registry(), &env()).unwrap_err();
            assert!(
                matches!(err, UdaError::Request(RequestError::BadSubset)),
                "{text}: {err}"
            );
        }
    }

    #[test]
    fn non_subset_brackets_stay_in_the_signal() {
        let rb = make_request_block("group[name]", "1", &registry(), &env()).unwrap();
        assert_eq!(rb.signal, "group[name]");
        assert!(rb.subset.is_empty());
    }

    #[test]
    fn multi_bracket_subset_syntax() {
        let rb = make_request_block("te[0:10][4]", "1", &registry(), &env()).unwrap();
        assert_eq!(rb.subset.rank, 2);
        assert_eq!(rb.subset.stop, vec![10, 4]);
    }

    #[test]
    fn mds_source_with_server_tree_and_shot() {
        let rb = make_request_block(
            "\\mag",
            "MDS+::server.example.org/tree/77",
            &registry(),
            &env(),
        )
        .unwrap();
        assert_eq!(rb.kind, RequestKind::Mds);
        assert_eq!(rb.server, "server.example.org");
        assert_eq!(rb.file, "tree");
        assert_eq!(rb.exp_number, 77);
    }

    #[test]
    fn mds_source_without_server_uses_default() {
        let rb = make_request_block("\\mag", "MDS+::tree/42", &registry(), &env()).unwrap();
        assert_eq!(rb.server, "");
        assert_eq!(rb.file, "tree");
        assert_eq!(rb.exp_number, 42);
    }

    #[test]
    fn mds_number_without_tree_is_an_error() {
        let err = make_request_block("\\mag", "MDS+::42", &registry(), &env()).unwrap_err();
        assert!(matches!(
            err,
            UdaError::Request(RequestError::NoServerSpecified)
        ));
    }

    #[test]
    fn peer_forwarding_splits_server_and_source() {
        let rb = make_request_block("ip", "UDA::far.host:56565/98765", &registry(), &env())
            .unwrap();
        assert_eq!(rb.kind, RequestKind::Forward);
        assert_eq!(rb.server, "far.host:56565");
        assert_eq!(rb.file, "98765");
    }

    #[test]
    fn forwarding_keeps_the_archive_attached() {
        let rb = make_request_block("OTHER::ip", "UDA::far.host/11", &registry(), &env())
            .unwrap();
        assert_eq!(rb.kind, RequestKind::Forward);
        assert_eq!(rb.signal, "OTHER::ip");
        assert_eq!(rb.archive, "OTHER");
    }

    #[test]
    fn foreign_device_prefix_goes_generic() {
        let rb = make_request_block("density", "ITER::55", &registry(), &env()).unwrap();
        assert_eq!(rb.kind, RequestKind::Generic);
        assert_eq!(rb.device, "ITER");
        // Signal stays untouched for foreign devices.
        assert_eq!(rb.signal, "density");
    }

    #[test]
    fn device_indirection_rewrites_to_protocol() {
        let mut registry = registry();
        registry.register(
            PluginDescriptor::device("JET", "UDA", "jet.host", "56565"),
            None,
        );
        let rb = make_request_block("ip", "JET::12345", &registry, &env()).unwrap();
        assert_eq!(rb.kind, RequestKind::Forward);
        assert_eq!(rb.server, "jet.host:56565");
        assert_eq!(rb.file, "12345");
    }

    #[test]
    fn device_chain_hits_the_depth_guard() {
        let mut registry = registry();
        // LOOP's access protocol is LOOP itself, so substitution never
        // resolves to a server.
        registry.register(PluginDescriptor::device("LOOP", "LOOP", "nowhere", ""), None);
        let err = make_request_block("x", "LOOP::1", &registry, &env()).unwrap_err();
        assert!(matches!(
            err,
            UdaError::Request(RequestError::RequestDepthExceeded)
        ));
    }

    #[test]
    fn proxy_short_circuits_interpretation() {
        let mut environment = env();
        environment.proxy = "proxy.host:56565".to_string();
        let rb =
            make_request_block("ARC::te[0:5]", "whatever::works", &registry(), &environment)
                .unwrap();
        assert_eq!(rb.kind, RequestKind::Forward);
        assert_eq!(rb.server, "proxy.host:56565");
        // Untouched pass-through.
        assert_eq!(rb.signal, "ARC::te[0:5]");
        assert_eq!(rb.source, "whatever::works");
    }

    #[test]
    fn empty_request_is_rejected() {
        let err = make_request_block("", "", &registry(), &env()).unwrap_err();
        assert!(matches!(err, UdaError::Request(RequestError::EmptyRequest)));
    }

    #[test]
    fn path_mixed_with_parens_is_rejected() {
        let err = make_request_block("x", "/data/fun(a)/file", &registry(), &env()).unwrap_err();
        assert!(matches!(
            err,
            UdaError::Request(RequestError::PathWithParens)
        ));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = make_request_block("x", "/data/run.xyz", &registry(), &env()).unwrap_err();
        assert!(matches!(err, UdaError::Request(RequestError::UnknownFormat)));
    }

    #[test]
    fn magic_probe_identifies_legacy_netcdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shotfile");
        std::fs::write(&path, b"CDF\x01rest-of-header").unwrap();
        let source = path.to_str().unwrap().to_string();
        let rb = make_request_block("x", &source, &registry(), &env()).unwrap();
        assert_eq!(rb.format, "netcdf");
        assert_eq!(rb.kind, RequestKind::File);
    }

    #[test]
    fn magic_probe_defaults_hdf_label_to_hdf5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hdffile");
        std::fs::write(&path, b"\x89HDF\r\n\x1a\n\x00\x00").unwrap();
        let source = path.to_str().unwrap().to_string();
        let rb = make_request_block("x", &source, &registry(), &env()).unwrap();
        assert_eq!(rb.format, "hdf5");
    }

    #[test]
    fn signal_side_function_without_source() {
        let rb = make_request_block("help::ping()", "", &registry(), &env()).unwrap();
        assert_eq!(rb.kind, RequestKind::ServerSide);
        assert_eq!(rb.format, "help");
        assert_eq!(rb.function, "ping");
    }

    #[test]
    fn bare_signal_without_source_is_generic() {
        let rb = make_request_block("ip", "", &registry(), &env()).unwrap();
        assert_eq!(rb.kind, RequestKind::Generic);
    }

    #[test]
    fn default_device_prefix_is_stripped() {
        let rb = make_request_block("ip", "MAST::12345", &registry(), &env()).unwrap();
        assert_eq!(rb.kind, RequestKind::Generic);
        assert_eq!(rb.exp_number, 12345);
    }

    #[test]
    fn archive_prefix_is_detached() {
        let rb = make_request_block("AMC::ip", "12345", &registry(), &env()).unwrap();
        assert_eq!(rb.archive, "AMC");
        assert_eq!(rb.signal, "ip");
    }

    #[test]
    fn default_archive_prefix_is_discarded() {
        let rb = make_request_block("MAST::ip", "12345", &registry(), &env()).unwrap();
        assert_eq!(rb.archive, env().default_archive);
        assert_eq!(rb.signal, "ip");
    }

    #[test]
    fn name_value_delimiter_override() {
        let list = name_value_pairs("delimiter=';'; a=1; b='x;y'", true).unwrap();
        assert_eq!(list.value("a"), Some("1"));
        assert_eq!(list.value("b"), Some("x;y"));
        assert_eq!(list.value("delimiter"), Some(";"));
    }

    #[test]
    fn quoted_values_keep_the_list_delimiter() {
        let list = name_value_pairs("names='a,b,c', n=3", true).unwrap();
        assert_eq!(list.value("names"), Some("a,b,c"));
        assert_eq!(list.value("n"), Some("3"));
    }

    #[test]
    fn name_value_syntax_errors() {
        assert!(name_value_pairs("=3", true).is_err());
        assert!(name_value_pairs("a=3, b=", true).is_err());
    }

    #[test]
    fn round_trip_of_canonical_forms() {
        let registry = registry();
        let environment = env();
        for (signal, source) in [
            ("ip", "12345"),
            ("ip", "12345/7"),
            ("te[0:99:2]", "54321"),
            ("/group/x", "netcdf::/data/run.nc"),
            ("", "help::ping()"),
        ] {
            let rb = make_request_block(signal, source, &registry, &environment).unwrap();
            let (rsignal, rsource) = rb.render();
            let rb2 = make_request_block(&rsignal, &rsource, &registry, &environment).unwrap();
            assert_eq!(rb, rb2, "{signal} | {source}");
        }
    }
}
