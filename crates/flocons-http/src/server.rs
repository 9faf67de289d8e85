//! HTTP server: a bounded worker pool fronting the storage engine, plus
//! the cross-node redirect/recovery policies that make the cluster
//! behave as one namespace.
//!
//! The worker pool is grounded on the original server's
//! `FILE_WORKER_POOL_SIZE` goroutine pool draining a job channel; the
//! `sync.Cond` barrier the original uses to let the accepting goroutine
//! block until a worker finishes has no counterpart here, because
//! `tiny_http::Request` already owns its own response path - a worker can
//! call `request.respond()` directly without handing control back to an
//! accepting thread. The bounded (rendezvous) channel alone gives the
//! same backpressure property: the accept loop can't outrun the workers.

use crate::client::Client;
use crate::util::{
    error_to_status, file_info_to_headers, files_info_to_csv, header_to_file_mode,
    url_path_to_path, FILES_PREFIX, HEADER_CONTENT_LENGTH, HEADER_CONTENT_MODE,
    HEADER_CONTENT_TYPE, HEADER_LOCATION, TRAVERSED_NODE_PARAMETER,
};
use flocons_cluster::{NodeInfo, TopologyClient};
use flocons_core::{Config, FileInfo, StorageError};
use flocons_storage::StorageEngine;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, StatusCode};

pub const WORKER_POOL_SIZE: usize = 10;

/// A node's file HTTP API: owns the listening socket and a bounded pool
/// of worker threads that execute storage operations.
pub struct HttpServer {
    running: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl HttpServer {
    pub fn start(
        config: &Config,
        storage: Arc<StorageEngine>,
        topology: Option<Arc<TopologyClient>>,
    ) -> Result<Self, StorageError> {
        let address = format!("0.0.0.0:{}", config.node.port);
        let server = tiny_http::Server::http(&address)
            .map_err(|e| StorageError::internal(format!("could not bind {address}: {e}")))?;
        let server = Arc::new(server);

        let handler = Arc::new(RequestHandler {
            storage,
            topology,
            node_name: config.node.name.clone(),
        });

        let running = Arc::new(AtomicBool::new(true));
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Request>(0);

        let mut worker_handles = Vec::with_capacity(WORKER_POOL_SIZE);
        for _ in 0..WORKER_POOL_SIZE {
            let job_rx = job_rx.clone();
            let handler = Arc::clone(&handler);
            worker_handles.push(thread::spawn(move || {
                while let Ok(request) = job_rx.recv() {
                    handler.serve_file(request);
                }
            }));
        }
        drop(job_rx);

        let accept_running = Arc::clone(&running);
        let accept_server = Arc::clone(&server);
        let accept_handle = thread::spawn(move || {
            while accept_running.load(Ordering::SeqCst) {
                match accept_server.recv_timeout(Duration::from_millis(200)) {
                    Ok(Some(request)) => {
                        if job_tx.send(request).is_err() {
                            break;
                        }
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "error accepting http request");
                        break;
                    }
                }
            }
        });

        tracing::info!(address = %address, workers = WORKER_POOL_SIZE, "http server listening");

        Ok(HttpServer {
            running,
            accept_handle: Some(accept_handle),
            worker_handles,
        })
    }

    /// Stop accepting new connections and drain in-flight requests.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.close();
    }
}

struct RequestHandler {
    storage: Arc<StorageEngine>,
    topology: Option<Arc<TopologyClient>>,
    node_name: String,
}

impl RequestHandler {
    fn serve_file(&self, mut request: Request) {
        let parsed = match parse_request_url(request.url()) {
            Ok(p) => p,
            Err(_) => {
                let _ = request.respond(Response::empty(StatusCode(400)));
                return;
            }
        };
        if !parsed.path.starts_with(FILES_PREFIX) {
            tracing::warn!(path = %parsed.path, "unhandled url request");
            let _ = request.respond(Response::empty(StatusCode(400)));
            return;
        }
        let storage_path = url_path_to_path(&parsed.path);

        tracing::debug!(method = ?request.method(), path = %storage_path, "handle file request");

        if let Some(response) = self.distribute_request_if_possible(&storage_path, &parsed.traversed_nodes) {
            let _ = request.respond(response);
            return;
        }

        let method = request.method().clone();
        let content_type = header_value(&request, HEADER_CONTENT_TYPE);
        let content_mode = header_value(&request, HEADER_CONTENT_MODE);

        let result = match method {
            Method::Head => self.get_file(&storage_path),
            Method::Get => self.get_file_with_data(&storage_path, &parsed.traversed_nodes),
            Method::Post => {
                let mode = header_to_file_mode(content_type.as_deref(), content_mode.as_deref());
                let mut body = Vec::new();
                if let Err(e) = request.as_reader().read_to_end(&mut body) {
                    tracing::warn!(error = %e, "could not read request body");
                    let _ = request.respond(Response::empty(StatusCode(400)));
                    return;
                }
                if mode.is_dir() {
                    self.create_directory(&storage_path, mode)
                } else {
                    self.create_regular_file(&storage_path, mode, body)
                }
            }
            other => {
                tracing::warn!(method = ?other, "unsupported http method");
                let _ = request.respond(Response::empty(StatusCode(400)));
                return;
            }
        };

        match result {
            Ok(ServedFile::Metadata(fi)) => {
                let _ = request.respond(metadata_response(&fi, 200));
            }
            Ok(ServedFile::Data(fi, data)) => {
                let _ = request.respond(data_response(&fi, data));
            }
            Ok(ServedFile::Redirect(response)) => {
                let _ = request.respond(response);
            }
            Err(err) => {
                let status = error_to_status(&err);
                tracing::debug!(status, error = %err, "storage operation failed");
                let _ = request.respond(Response::from_string(err.to_string()).with_status_code(StatusCode(status)));
            }
        }
    }

    fn create_directory(&self, path: &str, mode: flocons_core::types::FileMode) -> Result<ServedFile, StorageError> {
        match self.storage.create_directory(path, mode) {
            Ok(fi) => Ok(ServedFile::Metadata(fi)),
            Err(StorageError::NotFound(_)) => {
                self.try_recover_missing_directory(parent_path(path))?;
                Ok(ServedFile::Metadata(self.storage.create_directory(path, mode)?))
            }
            Err(e) => Err(e),
        }
    }

    fn create_regular_file(
        &self,
        path: &str,
        mode: flocons_core::types::FileMode,
        data: Vec<u8>,
    ) -> Result<ServedFile, StorageError> {
        match self.storage.create_regular_file(path, mode, &data) {
            Ok(fi) => Ok(ServedFile::Metadata(fi)),
            Err(StorageError::NotFound(_)) => {
                self.try_recover_missing_directory(parent_path(path))?;
                Ok(ServedFile::Metadata(self.storage.create_regular_file(path, mode, &data)?))
            }
            Err(e) => Err(e),
        }
    }

    fn get_file(&self, path: &str) -> Result<ServedFile, StorageError> {
        Ok(ServedFile::Metadata(self.storage.get_file(path)?))
    }

    fn get_file_with_data(&self, path: &str, traversed: &[String]) -> Result<ServedFile, StorageError> {
        let fi = self.storage.get_file(path)?;
        if fi.is_dir() {
            let files = self.storage.read_dir(path)?;
            let csv = files_info_to_csv(&files)?;
            return Ok(ServedFile::Data(fi, csv));
        }
        match fi.data() {
            Ok(data) => Ok(ServedFile::Data(fi, data)),
            Err(_) => match self.try_redirect_to_node(fi.node(), fi.shard(), path, traversed) {
                Some(response) => Ok(ServedFile::Redirect(response)),
                None => Err(StorageError::internal(format!(
                    "file {path} has no reachable data source"
                ))),
            },
        }
    }

    /// If the dispatcher names a different node for `path` and this node
    /// hasn't already forwarded this exact request, reply 307 pointing
    /// there instead of handling it locally.
    fn distribute_request_if_possible(&self, path: &str, traversed: &[String]) -> Option<Response<std::io::Cursor<Vec<u8>>>> {
        let topology = self.topology.as_ref()?;
        if traversed.iter().any(|n| n == &self.node_name) {
            return None;
        }
        let target = topology.get_node_for_object(path)?;
        Some(redirect_response(&target.address, path, traversed, &self.node_name))
    }

    /// On a missing-parent create failure, ask the dispatcher-selected
    /// peer whether `parent` is a directory there; if so, replicate the
    /// directory locally so the retried create can proceed.
    fn try_recover_missing_directory(&self, parent: String) -> Result<(), StorageError> {
        let topology = self
            .topology
            .as_ref()
            .ok_or_else(|| StorageError::not_found(parent.clone()))?;
        let peer = topology
            .get_node_for_object(&parent)
            .ok_or_else(|| StorageError::not_found(parent.clone()))?;
        let client = Client::new(&peer.address)?;
        let fi = client.get_directory(&parent)?;
        self.storage.create_directory_and_parents(&parent, fi.mode())?;
        Ok(())
    }

    /// On a data-fetch failure for a file whose metadata names a foreign
    /// owner, redirect to that owner if reachable and not yet traversed,
    /// else to any other peer sharing its shard.
    fn try_redirect_to_node(
        &self,
        name: &str,
        shard: &str,
        path: &str,
        traversed: &[String],
    ) -> Option<Response<std::io::Cursor<Vec<u8>>>> {
        let topology = self.topology.as_ref()?;
        if traversed.iter().any(|n| n == &self.node_name) {
            return None;
        }

        if !name.is_empty() && name != self.node_name && !traversed.iter().any(|n| n == name) {
            if let Some(address) = topology.peer_address(name) {
                return Some(redirect_response(&address, path, traversed, &self.node_name));
            }
        }

        let candidate: Option<NodeInfo> = topology
            .peers_in_shard(shard, traversed)
            .into_iter()
            .find(|n| n.name != self.node_name);
        candidate.map(|peer| redirect_response(&peer.address, path, traversed, &self.node_name))
    }
}

enum ServedFile {
    Metadata(FileInfo),
    Data(FileInfo, Vec<u8>),
    Redirect(Response<std::io::Cursor<Vec<u8>>>),
}

fn parent_path(path: &str) -> String {
    std::path::Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

fn metadata_response(fi: &FileInfo, status: u16) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response = Response::from_data(Vec::new()).with_status_code(StatusCode(status));
    for (name, value) in file_info_to_headers(fi) {
        if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            response = response.with_header(header);
        }
    }
    response
}

fn data_response(fi: &FileInfo, data: Vec<u8>) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response = Response::from_data(data).with_status_code(StatusCode(200));
    for (name, value) in file_info_to_headers(fi) {
        if name == HEADER_CONTENT_LENGTH {
            continue; // tiny_http fills this in from the actual body length.
        }
        if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            response = response.with_header(header);
        }
    }
    response
}

fn redirect_response(
    peer_address: &str,
    path: &str,
    traversed: &[String],
    self_name: &str,
) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut location = format!("{}{}", peer_address.trim_end_matches('/'), crate::util::path_to_url_path(path));
    let mut query_parts: Vec<String> = traversed
        .iter()
        .map(|n| format!("{TRAVERSED_NODE_PARAMETER}={}", url::form_urlencoded::byte_serialize(n.as_bytes()).collect::<String>()))
        .collect();
    query_parts.push(format!(
        "{TRAVERSED_NODE_PARAMETER}={}",
        url::form_urlencoded::byte_serialize(self_name.as_bytes()).collect::<String>()
    ));
    location.push('?');
    location.push_str(&query_parts.join("&"));

    let header = Header::from_bytes(HEADER_LOCATION.as_bytes(), location.as_bytes()).expect("ascii location header");
    Response::from_data(Vec::new()).with_status_code(StatusCode(307)).with_header(header)
}

struct ParsedUrl {
    path: String,
    traversed_nodes: Vec<String>,
}

fn parse_request_url(raw: &str) -> Result<ParsedUrl, StorageError> {
    let full = format!("http://placeholder{raw}");
    let parsed = url::Url::parse(&full).map_err(|e| StorageError::internal(format!("bad request url: {e}")))?;
    let traversed_nodes = parsed
        .query_pairs()
        .filter(|(k, _)| k == TRAVERSED_NODE_PARAMETER)
        .map(|(_, v)| v.into_owned())
        .collect();
    Ok(ParsedUrl {
        path: parsed.path().to_string(),
        traversed_nodes,
    })
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.as_str().to_string().eq_ignore_ascii_case(name))
        .map(|h| h.value.to_string())
}
