//! `multipart/form-data` decoding for upload routes.
//!
//! The request body is already buffered by the connection reader, so it is fed
//! to `multer` as a single chunk and the parse is driven to completion on the
//! worker thread.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::executor::block_on;
use futures::stream;
use std::convert::Infallible;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Part {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Boundary parameter of a `multipart/form-data` content type.
pub(crate) fn boundary(content_type: &str) -> Option<String> {
    multer::parse_boundary(content_type).ok()
}

pub(crate) fn parse(body: Vec<u8>, boundary: &str) -> Result<Vec<Part>> {
    let chunk = stream::once(async move { Ok::<Bytes, Infallible>(Bytes::from(body)) });
    let mut multipart = multer::Multipart::new(chunk, boundary);
    block_on(async move {
        let mut parts = Vec::new();
        while let Some(field) = multipart
            .next_field()
            .await
            .context("read multipart field")?
        {
            let name = field
                .name()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("multipart part has no name"))?;
            let file_name = field
                .file_name()
                .filter(|f| !f.is_empty())
                .map(base_name);
            let content_type = field.content_type().map(|mime| mime.to_string());
            let data = field
                .bytes()
                .await
                .with_context(|| format!("read multipart field '{}'", name))?;
            parts.push(Part {
                name,
                file_name,
                content_type,
                data: data.to_vec(),
            });
        }
        Ok::<_, anyhow::Error>(parts)
    })
}

/// Strip any client-side directory components from a declared file name.
fn base_name(file_name: &str) -> String {
    file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(file_name)
        .to_string()
}

/// Select the named file field, falling back to the first part carrying a file.
pub(crate) fn take_file(parts: Vec<Part>, field: &str) -> Option<Part> {
    let mut fallback = None;
    for part in parts {
        if part.name == field {
            return Some(part);
        }
        if fallback.is_none() && part.file_name.is_some() {
            fallback = Some(part);
        }
    }
    fallback
}
