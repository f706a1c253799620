//! Blocking HTTP client for the xpan REST API.
//!
//! Authenticated calls go through [`XpanClient::call_json`], which refreshes
//! the token and retries exactly once when the server reports it expired.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};
use ureq::http::Response;
use ureq::Body;

use super::token::{Token, TokenStore};
use super::{parent_path, Quota, RemoteClient, RemoteEntry, RemoteMeta, PLACEHOLDER_PAYLOAD};
use crate::error::{PanError, Result};
use crate::state::download::read_full;

const AUTH_URL: &str = "https://openapi.baidu.com/oauth/2.0/";
const FILE_URL: &str = "https://pan.baidu.com/rest/2.0/xpan/file";
const META_URL: &str = "https://pan.baidu.com/rest/2.0/xpan/multimedia";
const QUOTA_URL: &str = "https://pan.baidu.com/api/quota";
const SLICE_URL: &str = "https://d.pcs.baidu.com/rest/2.0/pcs/superfile2";

const USER_AGENT: &str = "pan.baidu.com";
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Upload slice size fixed by the API.
pub const SLICE_SIZE: u64 = 4 * 1024 * 1024;
const LIST_PAGE: usize = 1000;

/// Registered application credentials used for the OAuth flows.
#[derive(Debug, Clone)]
pub struct AppCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl AppCredentials {
    /// URL the user opens to obtain an authorization code.
    pub fn authorize_url(&self) -> String {
        format!(
            "{}authorize?client_id={}&response_type=code&redirect_uri=oob&scope=basic,netdisk",
            AUTH_URL, self.client_id
        )
    }

    /// Exchange an authorization code for a token.
    pub fn exchange_code(&self, agent: &ureq::Agent, code: &str) -> Result<Token> {
        self.grant(
            agent,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", "oob"),
            ],
        )
    }

    pub fn refresh(&self, agent: &ureq::Agent, token: &Token) -> Result<Token> {
        self.grant(
            agent,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", token.refresh_token.as_str()),
            ],
        )
    }

    fn grant(&self, agent: &ureq::Agent, params: &[(&str, &str)]) -> Result<Token> {
        let mut req = agent
            .get(format!("{}token", AUTH_URL))
            .query("client_id", &self.client_id)
            .query("client_secret", &self.client_secret);
        for (k, v) in params {
            req = req.query(*k, *v);
        }
        let mut resp = req.call().map_err(map_ureq_error)?;
        let value: Value = serde_json::from_str(&resp.body_mut().read_to_string().map_err(map_ureq_error)?)?;
        let access = value["access_token"].as_str().unwrap_or_default().to_string();
        let refresh = value["refresh_token"].as_str().unwrap_or_default().to_string();
        let expires_in = value["expires_in"].as_i64().unwrap_or(0);
        if access.is_empty() || refresh.is_empty() || expires_in == 0 {
            let reason = value["error_description"]
                .as_str()
                .or_else(|| value["error"].as_str())
                .unwrap_or("empty grant response");
            return Err(PanError::Auth(reason.to_string()));
        }
        Ok(Token::from_grant(access, refresh, expires_in))
    }
}

/// Build the agent used for API calls.
pub fn api_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        // Status codes are inspected by the caller.
        .http_status_as_error(false)
        .build()
        .new_agent()
}

pub struct XpanClient {
    agent: ureq::Agent,
    download_agent: ureq::Agent,
    credentials: AppCredentials,
    store: TokenStore,
    token: RwLock<Token>,
}

impl XpanClient {
    /// Build a client from the stored token, refreshing it if it is close to expiry.
    ///
    /// `read_timeout` bounds one fetch window; a stalled transfer fails instead of hanging.
    pub fn connect(credentials: AppCredentials, store: TokenStore, read_timeout: Duration) -> Result<Self> {
        let agent = api_agent(Duration::from_secs(30));
        let token = store.load_fresh(|t| credentials.refresh(&agent, t))?;
        let download_agent = ureq::Agent::config_builder()
            .timeout_connect(Some(Duration::from_secs(15)))
            .timeout_recv_response(Some(read_timeout))
            .timeout_recv_body(Some(read_timeout))
            .http_status_as_error(false)
            .build()
            .new_agent();
        info!("connected with token from {}", store.path().display());
        Ok(Self {
            agent,
            download_agent,
            credentials,
            store,
            token: RwLock::new(token),
        })
    }

    fn access_token(&self) -> String {
        self.token.read().access_token.clone()
    }

    fn refresh_token(&self) -> Result<()> {
        let current = self.token.read().clone();
        let fresh = self.credentials.refresh(&self.agent, &current)?;
        self.store.store(&fresh)?;
        *self.token.write() = fresh;
        Ok(())
    }

    /// Run an authenticated JSON call, retrying once after a token refresh.
    fn call_json<F>(&self, call: F) -> Result<Value>
    where
        F: Fn(&str) -> std::result::Result<Response<Body>, ureq::Error>,
    {
        let mut refreshed = false;
        loop {
            let token = self.access_token();
            let mut resp = call(&token).map_err(map_ureq_error)?;
            let text = resp.body_mut().read_to_string().map_err(map_ureq_error)?;
            let value: Value = serde_json::from_str(&text)?;
            match check_errno(&value) {
                Err(PanError::Auth(msg)) if !refreshed => {
                    warn!("access token rejected ({}), refreshing", msg);
                    self.refresh_token()?;
                    refreshed = true;
                }
                Err(e) => return Err(e),
                Ok(()) => return Ok(value),
            }
        }
    }

    fn file_get(&self, method: &str, params: &[(&str, String)]) -> Result<Value> {
        self.call_json(|token| {
            let mut req = self
                .agent
                .get(FILE_URL)
                .header("User-Agent", USER_AGENT)
                .query("method", method)
                .query("access_token", token);
            for (k, v) in params {
                req = req.query(*k, v);
            }
            req.call()
        })
    }

    fn file_post(&self, method: &str, query: &[(&str, String)], form: &[(&str, String)]) -> Result<Value> {
        self.call_json(|token| {
            let mut req = self
                .agent
                .post(FILE_URL)
                .header("User-Agent", USER_AGENT)
                .query("method", method)
                .query("access_token", token);
            for (k, v) in query {
                req = req.query(*k, v);
            }
            req.send_form(form.iter().map(|(k, v)| (*k, v.as_str())))
        })
    }

    fn filemanager(&self, opera: &str, filelist: Value) -> Result<()> {
        self.file_post(
            "filemanager",
            &[("opera", opera.to_string())],
            &[
                ("async", "0".to_string()),
                ("ondup", "overwrite".to_string()),
                ("filelist", filelist.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Sliced upload: precreate with block digests, send requested slices, then create.
    fn upload_from<R: Read + Seek>(&self, path: &str, size: u64, mut source: R) -> Result<u64> {
        let digests = slice_digests(&mut source)?;
        let block_list = Value::from(digests.clone()).to_string();

        let pre = self.file_post(
            "precreate",
            &[],
            &[
                ("path", path.to_string()),
                ("size", size.to_string()),
                ("isdir", "0".to_string()),
                ("autoinit", "1".to_string()),
                ("rtype", "3".to_string()),
                ("block_list", block_list.clone()),
            ],
        )?;
        let upload_id = pre["uploadid"].as_str().unwrap_or_default().to_string();
        let wanted: Vec<u64> = pre["block_list"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        debug!("precreate {}: uploadid={} slices={:?}", path, upload_id, wanted);

        let mut buf = vec![0u8; SLICE_SIZE as usize];
        for seq in wanted {
            source.seek(SeekFrom::Start(seq * SLICE_SIZE))?;
            let n = read_full(&mut source, &mut buf)?;
            let (content_type, body) = multipart_body(&buf[..n]);
            self.call_json(|token| {
                self.agent
                    .post(SLICE_URL)
                    .header("User-Agent", USER_AGENT)
                    .header("Content-Type", &content_type)
                    .query("method", "upload")
                    .query("type", "tmpfile")
                    .query("path", path)
                    .query("uploadid", &upload_id)
                    .query("partseq", seq.to_string())
                    .query("access_token", token)
                    .send(&body[..])
            })?;
        }

        let created = self.file_post(
            "create",
            &[],
            &[
                ("path", path.to_string()),
                ("size", size.to_string()),
                ("isdir", "0".to_string()),
                ("rtype", "3".to_string()),
                ("uploadid", upload_id),
                ("block_list", block_list),
            ],
        )?;
        created["fs_id"]
            .as_u64()
            .ok_or_else(|| PanError::Unavailable(format!("upload of {} returned no id", path)))
    }
}

impl RemoteClient for XpanClient {
    fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        loop {
            let value = self.file_get(
                "list",
                &[
                    ("dir", dir.to_string()),
                    ("start", entries.len().to_string()),
                    ("limit", LIST_PAGE.to_string()),
                ],
            )?;
            let page: Vec<RemoteEntry> = serde_json::from_value(value["list"].clone()).unwrap_or_default();
            let done = page.len() < LIST_PAGE;
            entries.extend(page);
            if done {
                break;
            }
        }
        debug!("list {}: {} entries", dir, entries.len());
        Ok(entries)
    }

    fn meta(&self, path: &str, fs_id: u64) -> Result<RemoteMeta> {
        let value = self.call_json(|token| {
            self.agent
                .get(META_URL)
                .header("User-Agent", USER_AGENT)
                .query("method", "filemetas")
                .query("fsids", format!("[{}]", fs_id))
                .query("dlink", "1")
                .query("access_token", token)
                .call()
        })?;
        let mut metas: Vec<RemoteMeta> = serde_json::from_value(value["list"].clone()).unwrap_or_default();
        if metas.is_empty() {
            return Err(PanError::NotFound(path.to_string()));
        }
        Ok(metas.swap_remove(0))
    }

    fn fetch_range(&self, url: &str, start: u64, end: Option<u64>) -> Result<Box<dyn Read + Send>> {
        let range = match end {
            Some(end) => format!("bytes={}-{}", start, end),
            None => format!("bytes={}-", start),
        };
        let link = format!("{}&access_token={}", url, self.access_token());
        let fetch = |agent_name: &str| {
            self.download_agent
                .get(&link)
                .header("User-Agent", agent_name)
                .header("Range", &range)
                .call()
                .map_err(map_ureq_error)
        };
        let mut resp = fetch(USER_AGENT)?;
        if resp.status().as_u16() == 403 {
            debug!("range fetch refused, retrying with browser user agent");
            resp = fetch(BROWSER_USER_AGENT)?;
        }
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(PanError::Http(format!("range fetch {} returned {}", range, status)));
        }
        Ok(Box::new(resp.into_body().into_reader()))
    }

    fn create_placeholder(&self, path: &str) -> Result<u64> {
        self.upload_from(path, PLACEHOLDER_PAYLOAD.len() as u64, Cursor::new(PLACEHOLDER_PAYLOAD))
    }

    fn upload(&self, path: &str, local: &Path) -> Result<u64> {
        let file = File::open(local)?;
        let size = file.metadata()?.len();
        if size == 0 {
            return self.create_placeholder(path);
        }
        self.upload_from(path, size, file)
    }

    fn mkdir(&self, path: &str) -> Result<u64> {
        let value = self.file_post(
            "create",
            &[],
            &[
                ("path", path.to_string()),
                ("size", "0".to_string()),
                ("isdir", "1".to_string()),
                ("rtype", "0".to_string()),
            ],
        )?;
        value["fs_id"]
            .as_u64()
            .ok_or_else(|| PanError::AlreadyExists(path.to_string()))
    }

    fn delete(&self, paths: &[String]) -> Result<()> {
        self.filemanager("delete", Value::from(paths.to_vec()))
    }

    fn rename(&self, path: &str, new_name: &str) -> Result<()> {
        self.filemanager("rename", serde_json::json!([{ "path": path, "newname": new_name }]))
    }

    fn move_to(&self, path: &str, dest_dir: &str, new_name: &str) -> Result<()> {
        debug!("move {} (from {}) to {}/{}", path, parent_path(path), dest_dir, new_name);
        self.filemanager(
            "move",
            serde_json::json!([{ "path": path, "dest": dest_dir, "newname": new_name }]),
        )
    }

    fn quota(&self) -> Result<Quota> {
        let value = self.call_json(|token| {
            self.agent
                .get(QUOTA_URL)
                .header("User-Agent", USER_AGENT)
                .query("access_token", token)
                .call()
        })?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Classify the API's `errno`/`error_code` fields.
fn check_errno(value: &Value) -> Result<()> {
    if value["error"].as_str() == Some("expired_token") {
        return Err(PanError::Auth("expired_token".to_string()));
    }
    let code = value["errno"]
        .as_i64()
        .or_else(|| value["error_code"].as_i64())
        .unwrap_or(0);
    let message = value["errmsg"]
        .as_str()
        .or_else(|| value["error_msg"].as_str())
        .unwrap_or_default()
        .to_string();
    match code {
        0 => Ok(()),
        -6 | 111 | 31626 => Err(PanError::Auth(format!("errno {} {}", code, message))),
        -8 | 31061 => Err(PanError::AlreadyExists(format!("errno {} {}", code, message))),
        -9 | 31066 => Err(PanError::NotFound(format!("errno {} {}", code, message))),
        _ => Err(PanError::Remote { code, message }),
    }
}

fn map_ureq_error(err: ureq::Error) -> PanError {
    match err {
        ureq::Error::Timeout(t) => PanError::Http(format!("timed out ({:?})", t)),
        ureq::Error::Io(e) => PanError::Http(e.to_string()),
        other => PanError::Http(other.to_string()),
    }
}

/// MD5 hex digest of every upload slice, in order.
fn slice_digests<R: Read + Seek>(source: &mut R) -> Result<Vec<String>> {
    source.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; SLICE_SIZE as usize];
    let mut digests = Vec::new();
    loop {
        let n = read_full(source, &mut buf)?;
        if n == 0 {
            break;
        }
        digests.push(format!("{:x}", md5::compute(&buf[..n])));
        if n < buf.len() {
            break;
        }
    }
    Ok(digests)
}

fn multipart_body(data: &[u8]) -> (String, Vec<u8>) {
    let boundary = format!("panfs{:016x}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
    let mut body = Vec::with_capacity(data.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\n");
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    (format!("multipart/form-data; boundary={}", boundary), body)
}
