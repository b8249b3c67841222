use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::disk::{ListOptions, MoveOptions, RemoveOptions};
use crate::error::DiskError;
use crate::storage::{DirEntry, Metadata};
use crate::tree::TreeNode;

// ── JSON-RPC 2.0 error codes ────────────────────────────────────────────────

pub const PARSE_ERROR: i32 = -32700;
pub const INTERNAL_ERROR: i32 = -32603;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const DISK_ERROR: i32 = -32000;

// ── Incoming request ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

// ── Params ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathParams {
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileParams {
    pub path: String,
    /// Return UTF-8 text instead of base64 bytes.
    #[serde(default)]
    pub text: bool,
}

/// Exactly one of `text` or `base64` carries the content.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileParams {
    pub path: String,
    pub text: Option<String>,
    pub base64: Option<String>,
}

impl WriteFileParams {
    pub fn bytes(&self) -> Result<Vec<u8>, DiskError> {
        match (&self.text, &self.base64) {
            (Some(text), None) => Ok(text.as_bytes().to_vec()),
            (None, Some(encoded)) => decode_bytes(encoded),
            _ => Err(DiskError::InvalidOperation(
                "exactly one of text or base64 is required".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MkdirParams {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaddirParams {
    pub path: String,
    #[serde(default)]
    pub include_special: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveParams {
    pub old_path: String,
    pub new_path: String,
    #[serde(default)]
    pub overwrite: bool,
    /// Suppress the rename event.
    #[serde(default)]
    pub quiet: bool,
}

impl MoveParams {
    pub fn options(&self) -> MoveOptions {
        MoveOptions {
            overwrite: self.overwrite,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyParams {
    pub src: String,
    pub dest: String,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyPair {
    pub src: String,
    pub dest: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyMultipleParams {
    pub pairs: Vec<CopyPair>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveParams {
    pub path: String,
    #[serde(default)]
    pub permanent: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveMultipleParams {
    pub paths: Vec<String>,
    #[serde(default)]
    pub permanent: bool,
}

impl RemoveMultipleParams {
    pub fn options(&self) -> RemoveOptions {
        RemoveOptions {
            permanent: self.permanent,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub under: Option<String>,
    #[serde(default)]
    pub include_special: bool,
    #[serde(default)]
    pub include_dirs: bool,
}

impl From<ListParams> for ListOptions {
    fn from(p: ListParams) -> Self {
        ListOptions {
            under: p.under,
            include_special: p.include_special,
            include_dirs: p.include_dirs,
        }
    }
}

/// `pattern` may be a single string or a list of strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobParams {
    pub pattern: serde_json::Value,
}

impl GlobParams {
    pub fn patterns(&self) -> Result<Vec<String>, DiskError> {
        match &self.pattern {
            serde_json::Value::String(s) => Ok(vec![s.clone()]),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        DiskError::InvalidOperation("glob patterns must be strings".to_string())
                    })
                })
                .collect(),
            _ => Err(DiskError::InvalidOperation(
                "pattern must be a string or an array of strings".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub query: String,
    pub max_results: Option<usize>,
}

// ── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResult {
    pub guid: String,
    #[serde(rename = "type")]
    pub disk_type: String,
    pub backend: &'static str,
    pub symlinks: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    pub size: usize,
}

impl ReadFileResult {
    pub fn bytes(data: &[u8]) -> Self {
        Self {
            text: None,
            base64: Some(BASE64.encode(data)),
            size: data.len(),
        }
    }

    pub fn text(text: String) -> Self {
        Self {
            size: text.len(),
            text: Some(text),
            base64: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaddirResult {
    pub entries: Vec<DirEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatResult {
    pub path: String,
    #[serde(flatten)]
    pub meta: Metadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathsResult {
    pub paths: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub nodes: Vec<TreeNode>,
    pub truncated: bool,
}

// ── Helpers ─────────────────────────────────────────────────────────────────

pub fn decode_bytes(encoded: &str) -> Result<Vec<u8>, DiskError> {
    BASE64
        .decode(encoded)
        .map_err(|e| DiskError::InvalidOperation(format!("invalid base64 content: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_params_take_text_or_base64() {
        let p: WriteFileParams =
            serde_json::from_value(serde_json::json!({"path": "/a", "text": "hi"})).unwrap();
        assert_eq!(p.bytes().unwrap(), b"hi");

        let p: WriteFileParams =
            serde_json::from_value(serde_json::json!({"path": "/a", "base64": "aGk="})).unwrap();
        assert_eq!(p.bytes().unwrap(), b"hi");

        let p: WriteFileParams = serde_json::from_value(serde_json::json!({"path": "/a"})).unwrap();
        assert!(p.bytes().is_err());
    }

    #[test]
    fn glob_pattern_string_or_list() {
        let p: GlobParams = serde_json::from_value(serde_json::json!({"pattern": "*.md"})).unwrap();
        assert_eq!(p.patterns().unwrap(), vec!["*.md"]);
        let p: GlobParams =
            serde_json::from_value(serde_json::json!({"pattern": ["*.md", "!a.md"]})).unwrap();
        assert_eq!(p.patterns().unwrap().len(), 2);
        let p: GlobParams = serde_json::from_value(serde_json::json!({"pattern": 3})).unwrap();
        assert!(p.patterns().is_err());
    }

    #[test]
    fn read_result_shapes() {
        let json = serde_json::to_value(ReadFileResult::bytes(b"hi")).unwrap();
        assert_eq!(json, serde_json::json!({"base64": "aGk=", "size": 2}));
        let json = serde_json::to_value(ReadFileResult::text("hi".into())).unwrap();
        assert_eq!(json, serde_json::json!({"text": "hi", "size": 2}));
    }
}
