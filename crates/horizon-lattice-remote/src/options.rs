//! Global options for remote requests.
//!
//! Options are passed explicitly to [`HttpRemote`](crate::HttpRemote); there is
//! no ambient global state. They can be assembled in code or loaded from a TOML
//! document:
//!
//! ```toml
//! [remote]
//! fallback_base_address = "https://api.example.com"
//! user_agent = "MyApp/1.0"
//! profiling_enabled = true
//!
//! [services.users]
//! host = "https://users.example.com"
//! ```
//!
//! Every value of the document is also exposed as a [`ConfigurationLookup`],
//! so a request URI of `[[services:users:host]]/v1` resolves against it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use url::Url;

use crate::converters::ContentConverter;
use crate::error::{RemoteError, Result};
use crate::processors::ContentProcessor;

/// Read-only key lookup used to resolve `[[key]]` placeholders.
///
/// Keys of nested sections are joined with `:`.
pub trait ConfigurationLookup: Send + Sync {
    /// Look up a configuration value by key.
    fn get(&self, key: &str) -> Option<String>;
}

/// A lookup that never resolves anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyConfiguration;

impl ConfigurationLookup for EmptyConfiguration {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }
}

impl ConfigurationLookup for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl ConfigurationLookup for toml::Value {
    fn get(&self, key: &str) -> Option<String> {
        let mut current = self;
        for segment in key.split(':') {
            current = current.as_table()?.get(segment.trim())?;
        }
        match current {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Integer(i) => Some(i.to_string()),
            toml::Value::Float(f) => Some(f.to_string()),
            toml::Value::Boolean(b) => Some(b.to_string()),
            toml::Value::Datetime(d) => Some(d.to_string()),
            toml::Value::Array(_) | toml::Value::Table(_) => None,
        }
    }
}

/// The `[remote]` section of a TOML options document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RemoteSection {
    fallback_base_address: Option<String>,
    default_content_type: Option<String>,
    default_encoding: Option<String>,
    user_agent: Option<String>,
    trace_identifier_header: Option<String>,
    profiling_enabled: Option<bool>,
    json_pretty: Option<bool>,
    max_response_content_buffer_size: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OptionsDocument {
    remote: RemoteSection,
}

/// Options shared by every request dispatched through one
/// [`HttpRemote`](crate::HttpRemote).
#[derive(Clone)]
pub struct HttpRemoteOptions {
    /// Base address used when neither the request nor the client has one.
    pub fallback_base_address: Option<Url>,
    /// Media type assumed for text content with no explicit type.
    pub default_content_type: String,
    /// Charset assumed for text content with no explicit encoding.
    pub default_encoding: String,
    /// User agent applied once to every logical client lacking one.
    pub user_agent: String,
    /// Header carrying the trace identifier.
    pub trace_identifier_header: String,
    /// Emit an `info` line per dispatched request.
    pub profiling_enabled: bool,
    /// Pretty-print JSON request bodies.
    pub json_pretty: bool,
    /// Upper bound for buffered response bodies.
    pub max_response_content_buffer_size: Option<u64>,
    /// Lookup for `[[key]]` placeholders.
    pub configuration: Arc<dyn ConfigurationLookup>,
    /// User processors, consulted before the built-ins.
    pub processors: Vec<Arc<dyn ContentProcessor>>,
    /// User converters, consulted before the built-ins.
    pub converters: Vec<Arc<dyn ContentConverter>>,
}

impl Default for HttpRemoteOptions {
    fn default() -> Self {
        Self {
            fallback_base_address: None,
            default_content_type: "text/plain".to_string(),
            default_encoding: "utf-8".to_string(),
            user_agent: format!("HorizonLattice/{} (Rust)", env!("CARGO_PKG_VERSION")),
            trace_identifier_header: "X-Trace-Id".to_string(),
            profiling_enabled: false,
            json_pretty: false,
            max_response_content_buffer_size: None,
            configuration: Arc::new(EmptyConfiguration),
            processors: Vec::new(),
            converters: Vec::new(),
        }
    }
}

impl HttpRemoteOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a TOML document.
    ///
    /// The whole document also becomes the configuration lookup.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let document: OptionsDocument = toml::from_str(source)?;
        let value: toml::Value = toml::from_str(source)?;

        let mut options = Self::default();
        let section = document.remote;
        if let Some(address) = section.fallback_base_address {
            options.fallback_base_address = Some(Url::parse(&address).map_err(|e| {
                RemoteError::Configuration(format!("invalid fallback_base_address: {e}"))
            })?);
        }
        if let Some(content_type) = section.default_content_type {
            options.default_content_type = content_type;
        }
        if let Some(encoding) = section.default_encoding {
            options.default_encoding = encoding;
        }
        if let Some(user_agent) = section.user_agent {
            options.user_agent = user_agent;
        }
        if let Some(header) = section.trace_identifier_header {
            options.trace_identifier_header = header;
        }
        if let Some(enabled) = section.profiling_enabled {
            options.profiling_enabled = enabled;
        }
        if let Some(pretty) = section.json_pretty {
            options.json_pretty = pretty;
        }
        options.max_response_content_buffer_size = section.max_response_content_buffer_size;
        options.configuration = Arc::new(value);
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Set the fallback base address.
    pub fn fallback_base_address(mut self, address: Url) -> Self {
        self.fallback_base_address = Some(address);
        self
    }

    /// Set the configuration lookup.
    pub fn configuration(mut self, lookup: impl ConfigurationLookup + 'static) -> Self {
        self.configuration = Arc::new(lookup);
        self
    }

    /// Register a content processor ahead of the built-ins.
    pub fn add_processor(mut self, processor: impl ContentProcessor + 'static) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// Register a content converter ahead of the built-ins.
    pub fn add_converter(mut self, converter: impl ContentConverter + 'static) -> Self {
        self.converters.push(Arc::new(converter));
        self
    }

    /// Enable or disable profiling output.
    pub fn profiling(mut self, enabled: bool) -> Self {
        self.profiling_enabled = enabled;
        self
    }

    /// Limit the size of buffered response bodies.
    pub fn max_response_content_buffer_size(mut self, limit: u64) -> Self {
        self.max_response_content_buffer_size = Some(limit);
        self
    }
}

impl std::fmt::Debug for HttpRemoteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteOptions")
            .field("fallback_base_address", &self.fallback_base_address)
            .field("default_content_type", &self.default_content_type)
            .field("default_encoding", &self.default_encoding)
            .field("user_agent", &self.user_agent)
            .field("profiling_enabled", &self.profiling_enabled)
            .field("processors", &self.processors.len())
            .field("converters", &self.converters.len())
            .finish()
    }
}
