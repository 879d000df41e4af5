//! Blocking HTTP helpers for the control plane, built on libcurl easy
//! handles. Runs on the calling worker thread; no async involved.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

/// Control-plane requests are small; anything slower than this means the
/// service is wedged. Status polls use a shorter timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct Response {
    pub status: u32,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn new_easy(url: &str, timeout: Duration) -> Result<curl::easy::Easy> {
    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.connect_timeout(Duration::from_secs(10))?;
    easy.timeout(timeout)?;
    Ok(easy)
}

fn perform_collecting(easy: &mut curl::easy::Easy) -> Result<Response> {
    let mut body = Vec::new();
    {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| {
            body.extend_from_slice(data);
            Ok(data.len())
        })?;
        transfer.perform().context("HTTP request failed")?;
    }
    let status = easy.response_code().context("no response code")?;
    Ok(Response { status, body })
}

pub fn get(url: &str, timeout: Duration) -> Result<Response> {
    let mut easy = new_easy(url, timeout)?;
    perform_collecting(&mut easy)
}

pub fn post_bytes(url: &str, payload: &[u8], timeout: Duration) -> Result<Response> {
    let mut easy = new_easy(url, timeout)?;
    easy.post(true)?;
    easy.post_field_size(payload.len() as u64)?;

    let mut body = Vec::new();
    let mut remaining = payload;
    {
        let mut transfer = easy.transfer();
        transfer.read_function(|buf| {
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            remaining = &remaining[n..];
            Ok(n)
        })?;
        transfer.write_function(|data| {
            body.extend_from_slice(data);
            Ok(data.len())
        })?;
        transfer.perform().context("HTTP POST failed")?;
    }
    let status = easy.response_code().context("no response code")?;
    Ok(Response { status, body })
}

/// POST a file without buffering it in memory (tree files can be large).
pub fn post_file(url: &str, file_path: &Path, timeout: Duration) -> Result<Response> {
    let mut file = File::open(file_path)
        .with_context(|| format!("open upload file {}", file_path.display()))?;
    let size = file.metadata().context("stat upload file")?.len();

    let mut easy = new_easy(url, timeout)?;
    easy.post(true)?;
    easy.post_field_size(size)?;

    let mut body = Vec::new();
    {
        let mut transfer = easy.transfer();
        transfer.read_function(move |buf| {
            file.read(buf).map_err(|_| curl::easy::ReadError::Abort)
        })?;
        transfer.write_function(|data| {
            body.extend_from_slice(data);
            Ok(data.len())
        })?;
        transfer.perform().context("HTTP file upload failed")?;
    }
    let status = easy.response_code().context("no response code")?;
    Ok(Response { status, body })
}

/// Percent-encode one query parameter value.
pub fn url_encode(value: &str) -> String {
    let mut easy = curl::easy::Easy::new();
    easy.url_encode(value.as_bytes())
}
