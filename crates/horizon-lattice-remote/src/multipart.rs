//! Multipart form assembly.
//!
//! A [`MultipartFormBuilder`] collects [`PartContent`] entries in insertion
//! order. [`MultipartForm::build`] materializes each part through the content
//! processor chain and frames the result as `multipart/form-data` (RFC 7578).
//! When any part is streamed the composite body is streamed as well.
//!
//! # Example
//!
//! ```ignore
//! use horizon_lattice_remote::MultipartFormBuilder;
//!
//! let form = MultipartFormBuilder::new()
//!     .add_text("title", "Report")?
//!     .add_file_from_path("report.pdf", "file", None, None)?;
//! ```

use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, future, stream};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use url::Url;

use crate::builder::Disposable;
use crate::error::{RemoteError, Result};
use crate::http::{
    APPLICATION_JSON, APPLICATION_XML, BodyStream, ByteStream, ContentBody, ContentValue,
    FORM_URL_ENCODED, HttpClient, HttpContent, HttpResponse, MULTIPART_FORM_DATA, MediaType,
    OCTET_STREAM, RequestMetadata, TEXT_HTML, TEXT_PLAIN,
};
use crate::processors::{ContentProcessorChain, object_pairs, scalar_to_string};

const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Hook run on every part before it is appended.
pub type PreAddHook = Arc<dyn Fn(&mut PartContent) + Send + Sync>;

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn default_boundary() -> String {
    format!("----HorizonLatticeBoundary{}", random_token(16))
}

fn escape_quoted(value: &str) -> String {
    value.replace('"', "%22").replace(['\r', '\n'], "")
}

fn guess_media_type(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "txt" | "log" => TEXT_PLAIN,
        "htm" | "html" => TEXT_HTML,
        "xml" => APPLICATION_XML,
        "json" => APPLICATION_JSON,
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => OCTET_STREAM,
    }
}

fn require_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(RemoteError::invalid_argument("name", "part name must not be empty"));
    }
    Ok(())
}

fn file_stream(file: tokio::fs::File) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    stream::try_unfold(file, |mut file| async move {
        let mut buffer = BytesMut::with_capacity(FILE_CHUNK_SIZE);
        let read = file.read_buf(&mut buffer).await?;
        if read == 0 {
            Ok(None)
        } else {
            Ok(Some((buffer.freeze(), file)))
        }
    })
}

fn response_stream(response: HttpResponse) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    stream::try_unfold(response.bytes_stream(), |mut body| async move {
        let chunk = body.next_chunk().await.map_err(std::io::Error::other)?;
        Ok(chunk.map(|chunk| (chunk, body)))
    })
}

/// One named section of a multipart body.
#[derive(Clone, Debug)]
pub struct PartContent {
    /// Form field name.
    pub name: String,
    /// Raw value, serialized through the processor chain.
    pub value: ContentValue,
    /// Media type of the part.
    pub content_type: Option<String>,
    /// Charset of textual parts.
    pub encoding: Option<String>,
    /// File name; its presence makes the part file-shaped.
    pub file_name: Option<String>,
}

impl PartContent {
    /// Create a part.
    pub fn new(name: impl Into<String>, value: impl Into<ContentValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            content_type: None,
            encoding: None,
            file_name: None,
        }
    }

    /// Set the media type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the charset.
    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    /// Set the file name.
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

/// An assembled list of parts ready to be framed.
#[derive(Clone, Debug)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<PartContent>,
    omit_content_type: bool,
}

impl MultipartForm {
    /// The boundary string.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Parts in insertion order.
    pub fn parts(&self) -> &[PartContent] {
        &self.parts
    }

    /// Frame the parts as one `multipart/form-data` body.
    ///
    /// Returns `None` when no part materialized.
    pub fn build(&self, processors: &ContentProcessorChain) -> Result<Option<HttpContent>> {
        let mut segments: Vec<ContentBody> = Vec::with_capacity(self.parts.len() * 3 + 1);
        let mut materialized = 0usize;

        for part in &self.parts {
            let content = match self.materialize(part, processors)? {
                Some(content) => content,
                None if part.file_name.is_some() => {
                    HttpContent::from_bytes(Bytes::new(), self.placeholder_media_type(part))
                }
                None => continue,
            };

            segments.push(ContentBody::Bytes(self.part_head(part, &content)));
            segments.push(content.body().clone());
            segments.push(ContentBody::Bytes(Bytes::from_static(b"\r\n")));
            materialized += 1;
        }

        if materialized == 0 {
            return Ok(None);
        }

        segments.push(ContentBody::Bytes(Bytes::from(format!(
            "--{}--\r\n",
            self.boundary
        ))));

        let mut media_type = MediaType::parse(MULTIPART_FORM_DATA)?;
        media_type.set_param("boundary", self.boundary.clone());

        tracing::debug!(
            target: "horizon_lattice_remote::multipart",
            parts = materialized,
            boundary = %self.boundary,
            "Assembled multipart body"
        );

        Ok(Some(combine(segments, media_type)?))
    }

    fn materialize(
        &self,
        part: &PartContent,
        processors: &ContentProcessorChain,
    ) -> Result<Option<HttpContent>> {
        if let Some(nested) = part.value.downcast_ref::<MultipartForm>() {
            return nested.build(processors);
        }
        processors.process(
            &part.value,
            part.content_type.as_deref(),
            part.encoding.as_deref(),
        )
    }

    fn placeholder_media_type(&self, part: &PartContent) -> Option<MediaType> {
        let content_type = part.content_type.as_deref()?;
        match MediaType::parse(content_type) {
            Ok(media_type) => Some(media_type),
            Err(err) => {
                tracing::warn!(
                    target: "horizon_lattice_remote::multipart",
                    part = %part.name,
                    error = %err,
                    "Ignoring invalid part media type"
                );
                None
            }
        }
    }

    fn part_head(&self, part: &PartContent, content: &HttpContent) -> Bytes {
        let mut head = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"",
            self.boundary,
            escape_quoted(&part.name)
        );
        if let Some(file_name) = &part.file_name {
            let file_name = if file_name.trim().is_empty() {
                format!("Unnamed_{}", random_token(8))
            } else {
                escape_quoted(file_name)
            };
            head.push_str(&format!("; filename=\"{file_name}\""));
        }
        head.push_str("\r\n");

        if !self.omit_content_type
            && let Some(media_type) = content.media_type()
        {
            head.push_str(&format!("Content-Type: {media_type}\r\n"));
        }
        for (name, value) in content.headers() {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        Bytes::from(head)
    }
}

fn combine(segments: Vec<ContentBody>, media_type: MediaType) -> Result<HttpContent> {
    if segments.iter().all(|s| matches!(s, ContentBody::Bytes(_))) {
        let mut buffer = BytesMut::new();
        for segment in segments {
            if let ContentBody::Bytes(bytes) = segment {
                buffer.extend_from_slice(&bytes);
            }
        }
        return Ok(HttpContent::from_bytes(buffer.freeze(), Some(media_type)));
    }

    let mut streams: Vec<ByteStream> = Vec::with_capacity(segments.len());
    for segment in segments {
        match segment {
            ContentBody::Bytes(bytes) => {
                streams.push(stream::once(future::ready(Ok(bytes))).boxed());
            }
            ContentBody::Stream(body) => {
                let body = body.take().ok_or_else(|| {
                    RemoteError::Content("multipart stream part was already consumed".to_string())
                })?;
                streams.push(body);
            }
        }
    }
    let body = BodyStream::new(stream::iter(streams).flatten());
    Ok(HttpContent::from_stream(body, Some(media_type)))
}

/// Fluent builder for [`MultipartForm`].
///
/// File-backed parts open their source eagerly and register a disposable
/// that closes it; attaching the form to a request moves those disposables
/// onto the request so they run after dispatch.
pub struct MultipartFormBuilder {
    form: MultipartForm,
    pre_add: Vec<PreAddHook>,
    disposables: Vec<Disposable>,
}

impl Default for MultipartFormBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartFormBuilder {
    /// Create an empty form with a random boundary.
    pub fn new() -> Self {
        Self {
            form: MultipartForm {
                boundary: default_boundary(),
                parts: Vec::new(),
                omit_content_type: false,
            },
            pre_add: Vec::new(),
            disposables: Vec::new(),
        }
    }

    /// Override the boundary.
    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Result<Self> {
        let boundary = boundary.into();
        if boundary.is_empty() || boundary.len() > 70 {
            return Err(RemoteError::invalid_argument(
                "boundary",
                "boundary must be between 1 and 70 characters",
            ));
        }
        self.form.boundary = boundary;
        Ok(self)
    }

    /// The boundary string.
    pub fn boundary(&self) -> &str {
        &self.form.boundary
    }

    /// Parts added so far.
    pub fn parts(&self) -> &[PartContent] {
        &self.form.parts
    }

    /// Leave `Content-Type` out of every part header.
    pub fn omit_content_type(mut self) -> Self {
        self.form.omit_content_type = true;
        self
    }

    /// Run `hook` on every part added after this call.
    pub fn on_pre_add<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut PartContent) + Send + Sync + 'static,
    {
        self.pre_add.push(Arc::new(hook));
        self
    }

    /// Register a cleanup action run after dispatch.
    pub fn add_disposable<F>(mut self, dispose: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.disposables.push(Box::new(dispose));
        self
    }

    /// Append a part.
    pub fn add_part(mut self, mut part: PartContent) -> Result<Self> {
        require_name(&part.name)?;
        for hook in &self.pre_add {
            hook(&mut part);
        }
        self.form.parts.push(part);
        Ok(self)
    }

    /// Append a `text/plain` part.
    pub fn add_text(self, name: impl Into<String>, text: impl Into<String>) -> Result<Self> {
        self.add_part(PartContent::new(name, text.into()).with_content_type(TEXT_PLAIN))
    }

    /// Append a `text/html` part.
    pub fn add_html(self, name: impl Into<String>, html: impl Into<String>) -> Result<Self> {
        self.add_part(PartContent::new(name, html.into()).with_content_type(TEXT_HTML))
    }

    /// Append an `application/xml` part.
    pub fn add_xml(self, name: impl Into<String>, xml: impl Into<String>) -> Result<Self> {
        self.add_part(PartContent::new(name, xml.into()).with_content_type(APPLICATION_XML))
    }

    /// Append a JSON part.
    pub fn add_json<T: Serialize + ?Sized>(self, name: impl Into<String>, value: &T) -> Result<Self> {
        self.add_part(
            PartContent::new(name, ContentValue::object(value)?).with_content_type(APPLICATION_JSON),
        )
    }

    /// Append an object.
    ///
    /// Without a `content_type` every top-level property becomes its own
    /// text part. With one the object is serialized as a single part named
    /// `name`.
    pub fn add_object<T: Serialize + ?Sized>(
        mut self,
        value: &T,
        name: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<Self> {
        let value = serde_json::to_value(value)?;
        if let Some(content_type) = content_type {
            let name = name.ok_or_else(|| {
                RemoteError::invalid_argument("name", "a single-part object needs a name")
            })?;
            return self.add_part(
                PartContent::new(name, ContentValue::Object(value)).with_content_type(content_type),
            );
        }

        let serde_json::Value::Object(map) = &value else {
            return Err(RemoteError::invalid_argument(
                "value",
                "only objects with named properties can be split into parts",
            ));
        };
        for (key, property) in map {
            match property {
                serde_json::Value::Array(items) => {
                    for item in items {
                        self = self.add_text(key.clone(), scalar_to_string(item))?;
                    }
                }
                serde_json::Value::Null => {}
                other => self = self.add_text(key.clone(), scalar_to_string(other))?,
            }
        }
        Ok(self)
    }

    /// Append a file read from disk as it is sent.
    ///
    /// The file name defaults to the path's last component and the media type
    /// to a guess from its extension.
    pub fn add_file_from_path(
        mut self,
        path: impl AsRef<Path>,
        name: impl Into<String>,
        file_name: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            RemoteError::invalid_argument("path", format!("{}: {e}", path.display()))
        })?;

        let file_name = file_name
            .map(str::to_string)
            .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        let content_type = content_type
            .map(str::to_string)
            .unwrap_or_else(|| guess_media_type(&file_name).to_string());

        let body = BodyStream::new(file_stream(tokio::fs::File::from_std(file)));
        let handle = body.clone();
        self.disposables.push(Box::new(move || handle.close()));

        self.add_part(
            PartContent::new(name, body)
                .with_content_type(content_type)
                .with_file_name(file_name),
        )
    }

    /// Append a file downloaded from `url` as it is sent.
    pub async fn add_file_from_remote(
        mut self,
        client: &HttpClient,
        url: &str,
        name: impl Into<String>,
        file_name: Option<&str>,
    ) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| RemoteError::invalid_argument("url", e.to_string()))?;
        let response = client.reqwest_client().get(url.clone()).send().await?;
        let response =
            HttpResponse::from_reqwest(response, RequestMetadata::default()).error_for_status()?;

        let file_name = file_name
            .map(str::to_string)
            .or_else(|| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
                    .filter(|segment| !segment.is_empty())
            })
            .unwrap_or_default();
        let content_type = response
            .content_type()
            .map(|media_type| media_type.essence().to_string())
            .unwrap_or_else(|| guess_media_type(&file_name).to_string());

        let body = BodyStream::new(response_stream(response));
        let handle = body.clone();
        self.disposables.push(Box::new(move || handle.close()));

        self.add_part(
            PartContent::new(name, body)
                .with_content_type(content_type)
                .with_file_name(file_name),
        )
    }

    /// Append a file given as base64 text or a `data:` URI.
    pub fn add_file_from_base64(
        self,
        base64: &str,
        name: impl Into<String>,
        file_name: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<Self> {
        let (declared, payload) = match base64.strip_prefix("data:") {
            Some(rest) => match rest.split_once(";base64,") {
                Some((media_type, payload)) => (Some(media_type), payload),
                None => {
                    return Err(RemoteError::invalid_argument(
                        "base64",
                        "data URI is not base64-encoded",
                    ));
                }
            },
            None => (None, base64),
        };
        let bytes = BASE64.decode(payload.trim())?;
        let file_name = file_name.unwrap_or_default().to_string();
        let content_type = content_type
            .or(declared.filter(|media_type| !media_type.is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| guess_media_type(&file_name).to_string());

        self.add_part(
            PartContent::new(name, Bytes::from(bytes))
                .with_content_type(content_type)
                .with_file_name(file_name),
        )
    }

    /// Append a raw stream.
    pub fn add_stream(
        mut self,
        stream: BodyStream,
        name: impl Into<String>,
        file_name: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<Self> {
        let handle = stream.clone();
        self.disposables.push(Box::new(move || handle.close()));
        let mut part = PartContent::new(name, stream)
            .with_content_type(content_type.unwrap_or(OCTET_STREAM));
        part.file_name = file_name.map(str::to_string);
        self.add_part(part)
    }

    /// Append raw bytes.
    pub fn add_bytes(
        self,
        bytes: impl Into<Bytes>,
        name: impl Into<String>,
        file_name: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<Self> {
        let mut part = PartContent::new(name, bytes.into())
            .with_content_type(content_type.unwrap_or(OCTET_STREAM));
        part.file_name = file_name.map(str::to_string);
        self.add_part(part)
    }

    /// Append a nested URL-encoded form.
    pub fn add_form_url_encoded<T: Serialize + ?Sized>(
        self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self> {
        let pairs = object_pairs(&serde_json::to_value(value)?)?;
        self.add_part(PartContent::new(name, ContentValue::Form(pairs)).with_content_type(FORM_URL_ENCODED))
    }

    /// Append a nested multipart form.
    pub fn add_multipart(mut self, name: impl Into<String>, nested: MultipartFormBuilder) -> Result<Self> {
        let (form, disposables) = nested.into_parts();
        self.disposables.extend(disposables);
        self.add_part(PartContent::new(name, ContentValue::custom(form)))
    }

    /// Frame the parts; see [`MultipartForm::build`].
    pub fn build(&self, processors: &ContentProcessorChain) -> Result<Option<HttpContent>> {
        self.form.build(processors)
    }

    /// Number of registered disposables.
    pub fn disposable_count(&self) -> usize {
        self.disposables.len()
    }

    pub(crate) fn into_parts(self) -> (MultipartForm, Vec<Disposable>) {
        (self.form, self.disposables)
    }
}

impl std::fmt::Debug for MultipartFormBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartFormBuilder")
            .field("form", &self.form)
            .field("pre_add", &self.pre_add.len())
            .field("disposables", &self.disposables.len())
            .finish()
    }
}
