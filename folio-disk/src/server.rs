use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

use crate::disk::{Disk, MoveOptions, RemoveOptions};
use crate::error::DiskError;
use crate::events::Unsubscribe;
use crate::protocol::*;
use crate::transport::NdjsonTransport;

// ── Handler errors ──────────────────────────────────────────────────────────

enum HandlerError {
    InvalidParams(String),
    Disk(DiskError),
}

impl From<DiskError> for HandlerError {
    fn from(err: DiskError) -> Self {
        Self::Disk(err)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Disk(DiskError::Json(err))
    }
}

type HandlerResult = Result<serde_json::Value, HandlerError>;

fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, HandlerError> {
    serde_json::from_value(params).map_err(|e| HandlerError::InvalidParams(e.to_string()))
}

fn paths_value<P: Into<String>>(paths: Vec<P>) -> HandlerResult {
    Ok(serde_json::to_value(PathsResult {
        paths: paths.into_iter().map(Into::into).collect(),
    })?)
}

// ── Disk server ─────────────────────────────────────────────────────────────

/// Disk JSON-RPC server: dispatches incoming requests to one hosted disk and
/// forwards its change events as `disk/event` notifications.
pub struct DiskServer {
    disk: Arc<Disk>,
    transport: NdjsonTransport,
    cancel: Arc<Mutex<CancellationToken>>,
    events: Option<Unsubscribe>,
}

impl DiskServer {
    pub fn new(disk: Arc<Disk>, transport: NdjsonTransport) -> Self {
        let notifier = transport.clone();
        let events = disk.on_event(move |event| match serde_json::to_value(event) {
            Ok(params) => notifier.write_notification("disk/event", params),
            Err(e) => tracing::error!("Failed to serialize event: {}", e),
        });
        Self {
            disk,
            transport,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            events: Some(events),
        }
    }

    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    /// Main loop: read JSON-RPC messages from stdin until EOF, then tear the
    /// disk down.
    pub async fn run(&mut self) -> Result<(), DiskError> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.serve(stdin).await
    }

    pub async fn serve(&mut self, reader: impl AsyncBufRead + Unpin) -> Result<(), DiskError> {
        let mut lines = reader.lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(req) => self.handle_request(req).await,
                Err(e) => {
                    tracing::warn!("Parse error: {}", e);
                    self.transport
                        .write_error(0, PARSE_ERROR, "Parse error: invalid JSON", None);
                }
            }
        }

        tracing::info!(disk = %self.disk.guid(), "input closed, shutting down");
        if let Some(events) = self.events.take() {
            events.unsubscribe();
        }
        self.cancel_token().cancel();
        self.disk.destroy().await
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn handle_request(&self, req: JsonRpcRequest) {
        // Batch copies run in the background so `fs/cancel` can reach them.
        if req.method == "fs/copyMultiple" {
            let disk = self.disk.clone();
            let transport = self.transport.clone();
            let cancel = self.cancel_token();
            tokio::spawn(async move {
                let result = copy_multiple(&disk, req.params, &cancel).await;
                respond(&transport, req.id, "fs/copyMultiple", Some(result));
            });
            return;
        }
        let result = self.dispatch(&req.method, req.params).await;
        respond(&self.transport, req.id, &req.method, result);
    }

    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Option<HandlerResult> {
        let disk = &self.disk;
        let result = match method {
            // ── Lifecycle ───────────────────────────────────────
            "disk/ready" => self.handle_ready().await,
            "disk/snapshot" => disk.to_json().map_err(HandlerError::from),
            "disk/destroy" => disk
                .destroy()
                .await
                .map(|_| serde_json::Value::Null)
                .map_err(HandlerError::from),

            // ── Files ───────────────────────────────────────────
            "fs/readFile" => self.handle_read_file(params).await,
            "fs/writeFile" => self.handle_write_file(params, false).await,
            "fs/writeFileRecursive" => self.handle_write_file(params, true).await,
            "fs/mkdir" => self.handle_mkdir(params).await,
            "fs/readdir" => self.handle_readdir(params).await,
            "fs/stat" => self.handle_stat(params).await,
            "fs/exists" => self.handle_exists(params).await,

            // ── Moves and copies ────────────────────────────────
            "fs/move" => self.handle_move(params).await,
            "fs/rename" => self.handle_rename(params).await,
            "fs/copy" => self.handle_copy(params).await,
            "fs/cancel" => Ok(self.handle_cancel()),

            // ── Deletes ─────────────────────────────────────────
            "fs/remove" => self.handle_remove(params).await,
            "fs/removeMultiple" => self.handle_remove_multiple(params).await,
            "fs/untrash" => self.handle_untrash(params).await,
            "fs/emptyTrash" => match disk.empty_trash().await {
                Ok(paths) => paths_value(paths),
                Err(e) => Err(e.into()),
            },

            // ── Index ───────────────────────────────────────────
            "index/hydrate" => match disk.hydrate_index().await {
                Ok(count) => Ok(serde_json::json!({ "entries": count })),
                Err(e) => Err(e.into()),
            },
            "index/list" => self.handle_list(params).await,
            "index/glob" => self.handle_glob(params).await,
            "index/search" => self.handle_search(params).await,

            _ => return None,
        };
        Some(result)
    }

    // ── Handlers ────────────────────────────────────────────────────────

    async fn handle_ready(&self) -> HandlerResult {
        self.disk.ready().await?;
        Ok(serde_json::to_value(ReadyResult {
            guid: self.disk.guid().to_string(),
            disk_type: self.disk.disk_type().to_string(),
            backend: self.disk.backend_name(),
            symlinks: self.disk.capabilities().symlinks,
        })?)
    }

    async fn handle_read_file(&self, params: serde_json::Value) -> HandlerResult {
        let p: ReadFileParams = parse_params(params)?;
        let result = if p.text {
            ReadFileResult::text(self.disk.read_text(&p.path).await?)
        } else {
            ReadFileResult::bytes(&self.disk.read_file(&p.path).await?)
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_write_file(&self, params: serde_json::Value, recursive: bool) -> HandlerResult {
        let p: WriteFileParams = parse_params(params)?;
        let data = p.bytes()?;
        if recursive {
            self.disk.write_file_recursive(&p.path, &data).await?;
        } else {
            self.disk.write_file(&p.path, &data).await?;
        }
        Ok(serde_json::Value::Null)
    }

    async fn handle_mkdir(&self, params: serde_json::Value) -> HandlerResult {
        let p: MkdirParams = parse_params(params)?;
        self.disk.mkdir(&p.path, p.recursive).await?;
        Ok(serde_json::Value::Null)
    }

    async fn handle_readdir(&self, params: serde_json::Value) -> HandlerResult {
        let p: ReaddirParams = parse_params(params)?;
        let entries = self.disk.readdir_entries(&p.path, p.include_special).await?;
        Ok(serde_json::to_value(ReaddirResult { entries })?)
    }

    async fn handle_stat(&self, params: serde_json::Value) -> HandlerResult {
        let p: PathParams = parse_params(params)?;
        let meta = self.disk.stat(&p.path).await?;
        Ok(serde_json::to_value(StatResult { path: p.path, meta })?)
    }

    async fn handle_exists(&self, params: serde_json::Value) -> HandlerResult {
        let p: PathParams = parse_params(params)?;
        let exists = self.disk.path_exists(&p.path).await?;
        Ok(serde_json::json!({ "exists": exists }))
    }

    async fn handle_move(&self, params: serde_json::Value) -> HandlerResult {
        let p: MoveParams = parse_params(params)?;
        if p.quiet {
            self.disk
                .quiet_move(&p.old_path, &p.new_path, p.options())
                .await?;
        } else {
            self.disk
                .move_path(&p.old_path, &p.new_path, p.options())
                .await?;
        }
        Ok(serde_json::Value::Null)
    }

    async fn handle_rename(&self, params: serde_json::Value) -> HandlerResult {
        let p: MoveParams = parse_params(params)?;
        self.disk.rename(&p.old_path, &p.new_path).await?;
        Ok(serde_json::Value::Null)
    }

    async fn handle_copy(&self, params: serde_json::Value) -> HandlerResult {
        let p: CopyParams = parse_params(params)?;
        let opts = MoveOptions {
            overwrite: p.overwrite,
        };
        if self.disk.stat(&p.src).await?.is_directory {
            self.disk.copy_dir(&p.src, &p.dest, opts).await?;
        } else {
            self.disk.copy_file(&p.src, &p.dest, opts).await?;
        }
        Ok(serde_json::Value::Null)
    }

    /// Cancel running batch copies. Later batches get a fresh token.
    fn handle_cancel(&self) -> serde_json::Value {
        let mut token = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = CancellationToken::new();
        serde_json::Value::Null
    }

    async fn handle_remove(&self, params: serde_json::Value) -> HandlerResult {
        let p: RemoveParams = parse_params(params)?;
        let trashed = self
            .disk
            .remove(
                &p.path,
                RemoveOptions {
                    permanent: p.permanent,
                },
            )
            .await?;
        Ok(serde_json::json!({ "trashPath": trashed }))
    }

    async fn handle_remove_multiple(&self, params: serde_json::Value) -> HandlerResult {
        let p: RemoveMultipleParams = parse_params(params)?;
        self.disk.remove_multiple(&p.paths, p.options()).await?;
        Ok(serde_json::Value::Null)
    }

    async fn handle_untrash(&self, params: serde_json::Value) -> HandlerResult {
        let p: PathParams = parse_params(params)?;
        let restored = self.disk.untrash_single(&p.path).await?;
        Ok(serde_json::json!({ "path": restored }))
    }

    async fn handle_list(&self, params: serde_json::Value) -> HandlerResult {
        let p: ListParams = if params.is_null() {
            ListParams::default()
        } else {
            parse_params(params)?
        };
        paths_value(self.disk.list_files(p.into()).await?)
    }

    async fn handle_glob(&self, params: serde_json::Value) -> HandlerResult {
        let p: GlobParams = parse_params(params)?;
        let patterns = p.patterns()?;
        paths_value(self.disk.glob(&patterns).await?)
    }

    async fn handle_search(&self, params: serde_json::Value) -> HandlerResult {
        let p: SearchParams = parse_params(params)?;
        let mut nodes = self.disk.search(&p.query).await?;
        let truncated = p.max_results.is_some_and(|max| nodes.len() > max);
        if let Some(max) = p.max_results {
            nodes.truncate(max);
        }
        Ok(serde_json::to_value(SearchResult { nodes, truncated })?)
    }
}

async fn copy_multiple(
    disk: &Disk,
    params: serde_json::Value,
    cancel: &CancellationToken,
) -> HandlerResult {
    let p: CopyMultipleParams = parse_params(params)?;
    let pairs: Vec<(String, String)> = p.pairs.into_iter().map(|c| (c.src, c.dest)).collect();
    paths_value(disk.copy_multiple_files(&pairs, cancel).await?)
}

fn respond(transport: &NdjsonTransport, id: u64, method: &str, result: Option<HandlerResult>) {
    match result {
        None => transport.write_error(
            id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
            None,
        ),
        Some(Ok(value)) => transport.write_response(id, value),
        Some(Err(HandlerError::InvalidParams(msg))) => {
            transport.write_error(id, INVALID_PARAMS, format!("Invalid params: {}", msg), None)
        }
        Some(Err(HandlerError::Disk(err))) => {
            if err.is_not_found() {
                tracing::debug!(id, method, "{}", err);
            } else {
                tracing::warn!(id, method, code = err.code(), "{}", err);
            }
            transport.write_error(id, DISK_ERROR, err.to_string(), Some(err.to_json_rpc_error()));
        }
    }
}
