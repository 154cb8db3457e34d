//! Node API over HTTP.
//!
//! Listings, path creation and deletion run as shell commands through
//! `PATCH /api/shellCommand`; file bytes move through `/api/file/<path>`.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;

use super::{ProgressFn, RemoteClient};
use crate::error::RemoteError;
use crate::model::{normalize_dir, EntryKind, FlatEntry, LivenessState, TreeEntry};
use crate::url::{parse_node_address, NodeAddress, DEFAULT_API_PORT};

const UPLOAD_CHUNK: usize = 256 * 1024;

#[derive(Serialize)]
struct ShellRequest<'a> {
    command: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Clone)]
pub struct HttpShellClient {
    http: Client,
    api_port: u16,
    ping_timeout: Duration,
}

impl Default for HttpShellClient {
    fn default() -> Self {
        Self::new(DEFAULT_API_PORT)
    }
}

impl HttpShellClient {
    pub fn new(api_port: u16) -> Self {
        Self {
            http: Client::new(),
            api_port,
            ping_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    fn resolve(&self, address: &str) -> Result<NodeAddress, RemoteError> {
        parse_node_address(address, self.api_port)
            .ok_or_else(|| RemoteError::protocol(address, "invalid node address"))
    }

    fn api_url(&self, address: &str, segments: &[&str]) -> Result<Url, RemoteError> {
        let node = self.resolve(address)?;
        let mut url = Url::parse(&node.base_url()).map_err(|e| RemoteError::protocol(address, e))?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::protocol(address, "base url cannot carry a path"))?
            .extend(segments.iter().filter(|s| !s.is_empty()));
        Ok(url)
    }

    fn file_url(&self, address: &str, path: &str, name: &str, preview: bool) -> Result<Url, RemoteError> {
        let mut segments = vec!["file"];
        if preview {
            segments.push("preview");
        }
        segments.extend(path.split('/'));
        segments.push(name);
        self.api_url(address, &segments)
    }

    /// Run `command` on the node and return its raw output
    pub async fn shell(&self, address: &str, command: &str) -> Result<ShellOutput, RemoteError> {
        let url = self.api_url(address, &["shellCommand"])?;
        let resp = self
            .http
            .patch(url)
            .json(&ShellRequest { command })
            .send()
            .await
            .map_err(|e| RemoteError::unreachable(address, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::CommandFailed {
                address: address.to_string(),
                code: status.as_u16() as i32,
                stderr: body,
            });
        }
        resp.json::<ShellOutput>()
            .await
            .map_err(|e| RemoteError::protocol(address, e))
    }

    /// Like [`shell`](Self::shell) but maps a non-zero exit onto the error taxonomy
    async fn run_in(&self, address: &str, path: &str, command: &str) -> Result<String, RemoteError> {
        let out = self.shell(address, command).await?;
        if out.exit_code == 0 {
            return Ok(out.stdout);
        }
        if is_missing_path(&out.stderr) {
            return Err(RemoteError::missing(address, path));
        }
        Err(RemoteError::CommandFailed {
            address: address.to_string(),
            code: out.exit_code,
            stderr: out.stderr,
        })
    }
}

#[async_trait]
impl RemoteClient for HttpShellClient {
    async fn ping(&self, address: &str) -> LivenessState {
        let Ok(node) = self.resolve(address) else {
            return LivenessState::Unknown;
        };
        let connect = tokio::time::timeout(self.ping_timeout, TcpStream::connect(node.socket())).await;
        if let Ok(Ok(_)) = connect {
            return LivenessState::Ready;
        }
        let status = tokio::process::Command::new("ping")
            .args(["-c", "1", "-w", "5", node.host.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => LivenessState::Booting,
            Ok(_) => LivenessState::Unreachable,
            Err(_) => LivenessState::Unknown,
        }
    }

    async fn list_tree(&self, address: &str, path: &str) -> Result<Vec<TreeEntry>, RemoteError> {
        let stdout = self.run_in(address, path, &tree_command(path)).await?;
        parse_tree(&stdout).map_err(|e| RemoteError::protocol(address, e))
    }

    async fn list_flat(&self, address: &str, path: &str) -> Result<Vec<FlatEntry>, RemoteError> {
        let stdout = self.run_in(address, path, &flat_command(path)).await?;
        parse_flat(&stdout).map_err(|e| RemoteError::protocol(address, e))
    }

    async fn upload(
        &self,
        address: &str,
        path: &str,
        name: &str,
        data: Bytes,
        progress: ProgressFn,
    ) -> Result<(), RemoteError> {
        let url = self.file_url(address, path, name, false)?;
        let total = data.len() as u64;
        let chunks: Vec<Bytes> = (0..data.len())
            .step_by(UPLOAD_CHUNK)
            .map(|start| data.slice(start..(start + UPLOAD_CHUNK).min(data.len())))
            .collect();
        let mut sent = 0u64;
        let body = futures::stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            progress(sent, total);
            Ok::<Bytes, std::io::Error>(chunk)
        });
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| RemoteError::unreachable(address, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::CommandFailed {
                address: address.to_string(),
                code: status.as_u16() as i32,
                stderr: body,
            });
        }
        Ok(())
    }

    async fn download(
        &self,
        address: &str,
        path: &str,
        name: &str,
        size: u64,
        progress: ProgressFn,
    ) -> Result<Bytes, RemoteError> {
        let url = self.file_url(address, path, name, false)?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| RemoteError::unreachable(address, e))?;
        match resp.status() {
            StatusCode::NOT_FOUND => return Err(RemoteError::missing(address, format!("{path}{name}"))),
            s if !s.is_success() => {
                return Err(RemoteError::CommandFailed {
                    address: address.to_string(),
                    code: s.as_u16() as i32,
                    stderr: resp.text().await.unwrap_or_default(),
                })
            }
            _ => {}
        }
        let total = resp.content_length().unwrap_or(size);
        let mut buf = BytesMut::with_capacity(total as usize);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RemoteError::unreachable(address, e))?;
            buf.extend_from_slice(&chunk);
            progress(buf.len() as u64, total);
        }
        Ok(buf.freeze())
    }

    async fn create_path(&self, address: &str, path: &str, dirs: &[String]) -> Result<(), RemoteError> {
        if dirs.is_empty() {
            return Ok(());
        }
        self.run_in(address, path, &create_path_command(path, dirs))
            .await
            .map(|_| ())
    }

    async fn delete(&self, address: &str, path: &str, names: &[String]) -> Result<(), RemoteError> {
        if names.is_empty() {
            return Ok(());
        }
        self.run_in(address, path, &delete_command(path, names))
            .await
            .map(|_| ())
    }

    async fn thumbnail(&self, address: &str, path: &str, name: &str) -> Result<Option<Bytes>, RemoteError> {
        let url = self.file_url(address, path, name, true)?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| RemoteError::unreachable(address, e))?;
        match resp.status() {
            StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => resp
                .bytes()
                .await
                .map(Some)
                .map_err(|e| RemoteError::unreachable(address, e)),
            s => Err(RemoteError::CommandFailed {
                address: address.to_string(),
                code: s.as_u16() as i32,
                stderr: resp.text().await.unwrap_or_default(),
            }),
        }
    }
}

// ---- command builders ------------------------------------------------------

/// Single-quote `s` for a POSIX shell
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn cd(path: &str) -> String {
    format!("cd {}", quote(&format!(".{}", normalize_dir(path))))
}

pub fn tree_command(path: &str) -> String {
    format!("{} && tree -Js", cd(path))
}

pub fn flat_command(path: &str) -> String {
    format!(
        r#"{} && find . -maxdepth 1 -mindepth 1 -print0 | while IFS= read -r -d '' f; do
typ=$(file -b --mime-type -- "$f")
size=$(stat -c '%s' -- "$f")
created=$(stat -c '%w' -- "$f")
[ "$created" = "-" ] && created=$(stat -c '%y' -- "$f")
jq -cn --arg name "$f" --arg type "$typ" --arg size "$size" --arg created "$created" '{{name:$name, type:$type, size:$size, created:$created}}'
done"#,
        cd(path)
    )
}

pub fn create_path_command(path: &str, dirs: &[String]) -> String {
    let mut cmd = cd(path);
    for dir in dirs {
        let q = quote(dir);
        cmd.push_str(&format!(" && mkdir -p {q} && cd {}", quote(&format!("{dir}/"))));
    }
    cmd
}

pub fn delete_command(path: &str, names: &[String]) -> String {
    let mut cmd = cd(path);
    for name in names {
        cmd.push_str(&format!(" && rm -rf -- {}", quote(name)));
    }
    cmd
}

/// `bash: line 1: cd: ./x/: No such file or directory`
pub fn is_missing_path(stderr: &str) -> bool {
    stderr
        .lines()
        .any(|l| l.contains("cd: ") && l.contains("No such file or directory"))
}

// ---- output parsers --------------------------------------------------------

#[derive(Deserialize)]
struct TreeJson {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    contents: Vec<TreeJson>,
}

impl TreeJson {
    fn into_entry(self) -> TreeEntry {
        let kind = if self.kind == "directory" {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        TreeEntry {
            name: self.name,
            kind,
            size: self.size,
            children: self.contents.into_iter().map(TreeJson::into_entry).collect(),
        }
    }
}

/// Parse `tree -Js` output; the first element is the listed directory
pub fn parse_tree(stdout: &str) -> Result<Vec<TreeEntry>, String> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let roots: Vec<TreeJson> = serde_json::from_str(stdout.trim()).map_err(|e| e.to_string())?;
    Ok(roots
        .into_iter()
        .find(|r| r.kind == "directory")
        .map(|root| root.contents.into_iter().map(TreeJson::into_entry).collect())
        .unwrap_or_default())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeField {
    Num(u64),
    Text(String),
}

#[derive(Deserialize)]
struct FlatJson {
    name: String,
    #[serde(rename = "type")]
    mime_type: String,
    size: SizeField,
    created: String,
}

fn parse_stat_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S%.f %z")
        .or_else(|_| DateTime::parse_from_rfc3339(s.trim()))
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Parse the one-object-per-line output of [`flat_command`]; hidden entries
/// are dropped
pub fn parse_flat(stdout: &str) -> Result<Vec<FlatEntry>, String> {
    let mut entries = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let raw: FlatJson = serde_json::from_str(line).map_err(|e| e.to_string())?;
        let name = raw.name.strip_prefix("./").unwrap_or(&raw.name).to_string();
        if name.starts_with('.') || name.is_empty() {
            continue;
        }
        let size = match raw.size {
            SizeField::Num(n) => n,
            SizeField::Text(t) => t.trim().parse().map_err(|_| format!("bad size '{t}'"))?,
        };
        entries.push(FlatEntry {
            name,
            mime_type: raw.mime_type,
            size,
            created_at: parse_stat_time(&raw.created),
        });
    }
    Ok(entries)
}
