//! HTTP client mirroring the server's own routes, used both by
//! cross-node redirect handling and by anyone embedding flocons as a
//! library client.

use crate::util::{
    csv_to_files_info, headers_to_file_info, path_to_url_path, HEADER_CONTENT_LENGTH,
    HEADER_CONTENT_MODE, HEADER_CONTENT_TYPE, HEADER_LAST_MODIFIED,
};
use flocons_core::types::{DataSource, DIRECTORY_MIME_TYPE};
use flocons_core::{FileInfo, StorageError};
use reqwest::blocking::{Client as ReqwestClient, Response};
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;

/// Typed client for one peer node's HTTP API.
#[derive(Clone)]
pub struct Client {
    host: String,
    http: ReqwestClient,
}

impl Client {
    pub fn new(host: impl Into<String>) -> Result<Self, StorageError> {
        let host = host.into();
        url::Url::parse(&host).map_err(|e| StorageError::internal(format!("invalid host {host}: {e}")))?;
        let http = ReqwestClient::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::internal(format!("could not build http client: {e}")))?;
        Ok(Client { host, http })
    }

    fn url(&self, p: &str) -> String {
        format!("{}{}", self.host.trim_end_matches('/'), path_to_url_path(p))
    }

    pub fn create_directory(&self, p: &str, mode: flocons_core::types::FileMode) -> Result<FileInfo, StorageError> {
        let resp = self
            .http
            .post(self.url(p))
            .header(HEADER_CONTENT_TYPE, DIRECTORY_MIME_TYPE)
            .header(HEADER_CONTENT_MODE, format!("{:o}", mode.permission_bits()))
            .send()
            .map_err(transport_err)?;
        response_to_file_info(p, resp)
    }

    pub fn create_regular_file(
        &self,
        p: &str,
        mode: flocons_core::types::FileMode,
        data: Vec<u8>,
    ) -> Result<FileInfo, StorageError> {
        let resp = self
            .http
            .post(self.url(p))
            .header(HEADER_CONTENT_MODE, format!("{:o}", mode.permission_bits()))
            .body(data)
            .send()
            .map_err(transport_err)?;
        response_to_file_info(p, resp)
    }

    /// `HEAD /files/<p>`: metadata only, no data source attached.
    pub fn get_file(&self, p: &str) -> Result<FileInfo, StorageError> {
        let resp = self.http.head(self.url(p)).send().map_err(transport_err)?;
        response_to_file_info(p, resp)
    }

    /// `GET /files/<p>`: metadata plus body bytes (for a directory, the
    /// CSV listing).
    pub fn get_file_data(&self, p: &str) -> Result<(FileInfo, Vec<u8>), StorageError> {
        let resp = self.http.get(self.url(p)).send().map_err(transport_err)?;
        let fi = response_to_file_info(p, clone_response_meta(&resp))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(StorageError::transport(status.as_u16(), body));
        }
        let data = resp.bytes().map_err(transport_err)?.to_vec();
        Ok((fi, data))
    }

    pub fn get_directory(&self, p: &str) -> Result<FileInfo, StorageError> {
        let fi = self.get_file(p)?;
        if !fi.is_dir() {
            return Err(StorageError::IsNotDir(p.to_string()));
        }
        Ok(fi)
    }

    /// `GET /files/<p>` on a regular file, attaching a lazy `data()`
    /// thunk that re-fetches the body on demand - the same laziness the
    /// local engine's `FileInfo` offers.
    pub fn get_regular_file(self: &Arc<Self>, p: &str) -> Result<FileInfo, StorageError> {
        let mut fi = self.get_file(p)?;
        if fi.is_dir() {
            return Err(StorageError::IsDir(p.to_string()));
        }
        let client = Arc::clone(self);
        let path = p.to_string();
        fi.attach_source(DataSource {
            data: Some(Arc::new(move || client.get_regular_file_data(&path))),
            ..Default::default()
        });
        Ok(fi)
    }

    pub fn get_regular_file_data(&self, p: &str) -> Result<Vec<u8>, StorageError> {
        let (fi, data) = self.get_file_data(p)?;
        if fi.is_dir() {
            return Err(StorageError::IsDir(p.to_string()));
        }
        Ok(data)
    }

    /// `GET /files/<p>` where the body has already been fetched: attach it
    /// directly instead of issuing a second request on `data()`.
    pub fn get_regular_file_with_data(&self, p: &str) -> Result<FileInfo, StorageError> {
        let (mut fi, data) = self.get_file_data(p)?;
        if fi.is_dir() {
            return Err(StorageError::IsDir(p.to_string()));
        }
        fi.attach_source(DataSource {
            data: Some(Arc::new(move || Ok(data.clone()))),
            ..Default::default()
        });
        Ok(fi)
    }

    pub fn read_dir(&self, p: &str) -> Result<Vec<FileInfo>, StorageError> {
        let (fi, data) = self.get_file_data(p)?;
        if !fi.is_dir() {
            return Err(StorageError::IsNotDir(p.to_string()));
        }
        csv_to_files_info(&data)
    }
}

/// A lightweight stand-in carrying only the headers/status needed by
/// `response_to_file_info`, so `get_file_data` can consume the real
/// response's body separately.
struct ResponseMeta {
    status: u16,
    headers: HeaderMap,
}

fn clone_response_meta(resp: &Response) -> ResponseMeta {
    ResponseMeta {
        status: resp.status().as_u16(),
        headers: resp.headers().clone(),
    }
}

fn response_to_file_info(p: &str, resp: impl Into<RespLike>) -> Result<FileInfo, StorageError> {
    let resp = resp.into();
    match resp.status {
        404 => return Err(StorageError::not_found(p)),
        500 => return Err(StorageError::internal(format!("peer returned 500 for {p}"))),
        s if s >= 300 => return Err(StorageError::transport(s, format!("peer returned {s} for {p}"))),
        _ => {}
    }

    let name = std::path::Path::new(p)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let header = |name: &str| resp.headers.get(name).and_then(|v| v.to_str().ok());
    Ok(headers_to_file_info(
        &name,
        header(HEADER_CONTENT_TYPE),
        header(HEADER_CONTENT_MODE),
        header(HEADER_CONTENT_LENGTH),
        header(HEADER_LAST_MODIFIED),
    ))
}

/// Adapter so `response_to_file_info` can take either a full `Response`
/// (HEAD/POST calls, which never read a body) or the pre-extracted
/// `ResponseMeta` (GET calls, which need the body kept around).
struct RespLike {
    status: u16,
    headers: HeaderMap,
}

impl From<Response> for RespLike {
    fn from(resp: Response) -> Self {
        RespLike {
            status: resp.status().as_u16(),
            headers: resp.headers().clone(),
        }
    }
}

impl From<ResponseMeta> for RespLike {
    fn from(meta: ResponseMeta) -> Self {
        RespLike {
            status: meta.status,
            headers: meta.headers,
        }
    }
}

fn transport_err(e: reqwest::Error) -> StorageError {
    StorageError::transport(e.status().map(|s| s.as_u16()).unwrap_or(502), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_host() {
        let err = Client::new("not a url").unwrap_err();
        assert!(matches!(err, StorageError::Internal(_)));
    }

    #[test]
    fn url_joins_host_and_path() {
        let client = Client::new("http://node-a:62116").unwrap();
        assert_eq!(client.url("a/b.txt"), "http://node-a:62116/files/a/b.txt");
    }
}
