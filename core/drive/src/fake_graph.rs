//! In-memory Microsoft Graph for tests.
//!
//! Serves one drive tree behind [`HttpTransport`]: the token endpoint,
//! item lookups by path and id, paged children, ranged content (optionally
//! behind a redirect), upload sessions and the item actions the filesystem
//! uses. Faults can be queued per request and every request is logged.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE, LOCATION,
    RANGE,
};
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use graphfs_common::DrivePath;

use crate::backend::{encode_segment, DriveTarget};
use crate::config::{AuthParams, DriveConfig, RetryConfig};
use crate::filesystem::DriveFileSystem;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

pub(crate) const GRAPH: &str = "https://graph.test/v1.0";
pub(crate) const TOKEN_URL: &str = "https://login.test/contoso/oauth2/v2.0/token";
pub(crate) const UPLOAD_BASE: &str = "https://upload.test/sessions/";
pub(crate) const DOWNLOAD_BASE: &str = "https://download.test/content/";
pub(crate) const MONITOR_BASE: &str = "https://monitor.test/jobs/";
pub(crate) const DRIVE_ID: &str = "drive-1";
const ROOT_ID: &str = "root-id";
const VERSIONS_PAGE: usize = 2;

pub(crate) const MIB: usize = 1024 * 1024;

/// Injected failure for one matching request.
#[derive(Debug, Clone)]
pub(crate) enum Fault {
    /// Answer with this status (and headers) without processing.
    Status(u16, Vec<(HeaderName, &'static str)>),
    /// Fail the exchange without processing.
    Transport,
    /// Process the request, then lose the response.
    DropResponse,
}

#[derive(Debug, Clone)]
pub(crate) struct LoggedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub at: Instant,
}

impl LoggedRequest {
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

struct Node {
    name: String,
    parent: Option<String>,
    folder: bool,
    content: Vec<u8>,
    version: u64,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
    fields: Map<String, Value>,
    checked_out: bool,
    last_comment: Option<String>,
    /// (version, size) of every stored revision, oldest first.
    history: Vec<(u64, u64)>,
}

impl Node {
    fn new(name: &str, parent: Option<String>, folder: bool) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            parent,
            folder,
            content: Vec::new(),
            version: 1,
            created: now,
            modified: now,
            fields: Map::new(),
            checked_out: false,
            last_comment: None,
            history: Vec::new(),
        }
    }
}

struct Session {
    parent: String,
    name: String,
    data: Vec<u8>,
    total: Option<u64>,
    expires: DateTime<Utc>,
}

/// A server-side copy waiting to be observed through its monitor.
struct CopyJob {
    source: String,
    parent: String,
    name: String,
    replace: bool,
    /// Monitor polls answered `inProgress` before the copy lands.
    polls_left: u32,
    result: Option<String>,
}

enum Target {
    Node(String),
    Missing { parent: String, name: String },
    Gone,
}

struct State {
    nodes: HashMap<String, Node>,
    next_id: u64,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    cancelled_sessions: usize,
    copies: HashMap<u64, CopyJob>,
    fail_copies: bool,
    issued_tokens: Vec<String>,
    revoked: HashSet<String>,
    faults: Vec<(Method, String, Fault)>,
    log: Vec<LoggedRequest>,
    sites: Vec<Value>,
    ack_skew: i64,
    redirect_downloads: bool,
    ignore_range: bool,
    token_delay: Duration,
}

/// In-memory Graph service.
pub(crate) struct FakeGraph {
    state: Mutex<State>,
}

impl FakeGraph {
    pub fn new() -> Arc<Self> {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID.to_string(), Node::new("root", None, true));
        Arc::new(Self {
            state: Mutex::new(State {
                nodes,
                next_id: 0,
                sessions: HashMap::new(),
                next_session: 0,
                cancelled_sessions: 0,
                copies: HashMap::new(),
                fail_copies: false,
                issued_tokens: Vec::new(),
                revoked: HashSet::new(),
                faults: Vec::new(),
                log: Vec::new(),
                sites: Vec::new(),
                ack_skew: 0,
                redirect_downloads: false,
                ignore_range: false,
                token_delay: Duration::ZERO,
            }),
        })
    }

    /// Create a folder and its missing ancestors, returning its id.
    pub fn add_folder(&self, path: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let mut current = ROOT_ID.to_string();
        for name in DrivePath::parse(path).unwrap().components() {
            current = match state.child(&current, name) {
                Some(id) => id,
                None => state.insert(&current, name, true),
            };
        }
        current
    }

    /// Create or replace a file, returning its id.
    pub fn add_file(&self, path: &str, content: impl Into<Vec<u8>>) -> String {
        let path = DrivePath::parse(path).unwrap();
        let parent = path.parent().unwrap();
        let parent_id = self.add_folder(&parent.to_string_path());
        let mut state = self.state.lock().unwrap();
        state
            .write_file(&parent_id, path.name().unwrap(), content.into())
            .unwrap()
    }

    /// Change a file behind the filesystem's back.
    pub fn modify_remote(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.add_file(path, content);
    }

    /// Delete an item behind the filesystem's back.
    pub fn delete_remote(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.lookup(path) {
            state.remove_subtree(&id);
        }
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let id = state.lookup(path)?;
        Some(state.nodes[&id].content.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().lookup(path).is_some()
    }

    pub fn is_checked_out(&self, path: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .lookup(path)
            .is_some_and(|id| state.nodes[&id].checked_out)
    }

    pub fn last_comment(&self, path: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        let id = state.lookup(path)?;
        state.nodes[&id].last_comment.clone()
    }

    pub fn add_site(&self, id: &str, name: &str, display_name: &str) {
        self.state
            .lock()
            .unwrap()
            .sites
            .push(json!({"id": id, "name": name, "displayName": display_name}));
    }

    pub fn fail_next(&self, method: Method, url_contains: &str, fault: Fault) {
        self.state
            .lock()
            .unwrap()
            .faults
            .push((method, url_contains.to_string(), fault));
    }

    /// Report acknowledged offsets shifted by `skew` bytes.
    /// Make copy jobs report `failed` on their monitor.
    pub fn set_fail_copies(&self, fail: bool) {
        self.state.lock().unwrap().fail_copies = fail;
    }

    pub fn set_ack_skew(&self, skew: i64) {
        self.state.lock().unwrap().ack_skew = skew;
    }

    pub fn set_redirect_downloads(&self, redirect: bool) {
        self.state.lock().unwrap().redirect_downloads = redirect;
    }

    pub fn set_ignore_range(&self, ignore: bool) {
        self.state.lock().unwrap().ignore_range = ignore;
    }

    pub fn set_token_delay(&self, delay: Duration) {
        self.state.lock().unwrap().token_delay = delay;
    }

    pub fn expire_sessions(&self) {
        let mut state = self.state.lock().unwrap();
        for session in state.sessions.values_mut() {
            session.expires = Utc::now() - chrono::Duration::minutes(1);
        }
    }

    /// Reject every token issued so far.
    pub fn revoke_tokens(&self) {
        let mut state = self.state.lock().unwrap();
        let issued = state.issued_tokens.clone();
        state.revoked.extend(issued);
    }

    pub fn tokens_issued(&self) -> usize {
        self.state.lock().unwrap().issued_tokens.len()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn cancelled_sessions(&self) -> usize {
        self.state.lock().unwrap().cancelled_sessions
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.state.lock().unwrap().log.clone()
    }

    /// Requests with `method` whose URL contains `url_contains`.
    pub fn count(&self, method: Method, url_contains: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|r| r.method == method && r.url.contains(url_contains))
            .count()
    }

    /// Requests to the Graph API, excluding tokens, uploads and redirects.
    pub fn graph_requests(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|r| r.url.starts_with(GRAPH))
            .count()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }
}

#[async_trait]
impl HttpTransport for FakeGraph {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let (fault, delay) = {
            let mut state = self.state.lock().unwrap();
            state.log.push(LoggedRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                headers: request.headers.clone(),
                at: Instant::now(),
            });
            let fault = state.take_fault(&request);
            let delay = if request.url == TOKEN_URL {
                state.token_delay
            } else {
                Duration::ZERO
            };
            (fault, delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match &fault {
            Some(Fault::Status(status, headers)) => {
                let mut response = graph_error(*status, "injectedFault", "Injected fault");
                for (name, value) in headers {
                    response
                        .headers
                        .insert(name.clone(), HeaderValue::from_static(value));
                }
                return Ok(response);
            }
            Some(Fault::Transport) => {
                return Err(TransportError::Connect("connection reset".to_string()))
            }
            _ => {}
        }

        let response = self.state.lock().unwrap().handle(&request);
        if matches!(fault, Some(Fault::DropResponse)) {
            return Err(TransportError::Timeout("response lost".to_string()));
        }
        Ok(response)
    }
}

impl State {
    fn take_fault(&mut self, request: &HttpRequest) -> Option<Fault> {
        let index = self
            .faults
            .iter()
            .position(|(method, pattern, _)| *method == request.method && request.url.contains(pattern))?;
        Some(self.faults.remove(index).2)
    }

    fn child(&self, parent: &str, name: &str) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, node)| node.parent.as_deref() == Some(parent) && node.name == name)
            .map(|(id, _)| id.clone())
    }

    fn children(&self, parent: &str) -> Vec<String> {
        let mut children: Vec<(&String, &Node)> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.parent.as_deref() == Some(parent))
            .collect();
        children.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        children.into_iter().map(|(id, _)| id.clone()).collect()
    }

    fn insert(&mut self, parent: &str, name: &str, folder: bool) -> String {
        self.next_id += 1;
        let id = format!("item-{}", self.next_id);
        self.nodes
            .insert(id.clone(), Node::new(name, Some(parent.to_string()), folder));
        id
    }

    fn lookup(&self, path: &str) -> Option<String> {
        let path = DrivePath::parse(path).ok()?;
        let mut current = ROOT_ID.to_string();
        for name in path.components() {
            current = self.child(&current, name)?;
        }
        Some(current)
    }

    fn write_file(&mut self, parent: &str, name: &str, content: Vec<u8>) -> Result<String, HttpResponse> {
        let id = match self.child(parent, name) {
            Some(id) if self.nodes[&id].folder => {
                return Err(graph_error(409, "nameAlreadyExists", "A folder has this name"))
            }
            Some(id) => id,
            None => self.insert(parent, name, false),
        };
        let node = self.nodes.get_mut(&id).unwrap();
        if !node.history.is_empty() {
            node.version += 1;
        }
        node.content = content;
        node.modified = Utc::now();
        node.history.push((node.version, node.content.len() as u64));
        Ok(id)
    }

    fn remove_subtree(&mut self, id: &str) {
        for child in self.children(id) {
            self.remove_subtree(&child);
        }
        self.nodes.remove(id);
    }

    fn is_descendant(&self, id: &str, ancestor: &str) -> bool {
        let mut current = Some(id.to_string());
        while let Some(node_id) = current {
            if node_id == ancestor {
                return true;
            }
            current = self.nodes.get(&node_id).and_then(|n| n.parent.clone());
        }
        false
    }

    fn encoded_path(&self, id: &str) -> String {
        let mut names = Vec::new();
        let mut current = id.to_string();
        while let Some(node) = self.nodes.get(&current) {
            let Some(parent) = &node.parent else { break };
            names.push(encode_segment(&node.name));
            current = parent.clone();
        }
        names.reverse();
        names.iter().map(|n| format!("/{}", n)).collect()
    }

    fn item_json(&self, id: &str, expand: Option<&str>) -> Value {
        let node = &self.nodes[id];
        let mut item = json!({
            "id": id,
            "name": node.name,
            "size": node.content.len(),
            "eTag": format!("\"{{{}}},{}\"", id, node.version),
            "cTag": format!("\"c:{{{}}},{}\"", id, node.version),
            "createdDateTime": node.created,
            "lastModifiedDateTime": node.modified,
        });
        if node.folder {
            item["folder"] = json!({"childCount": self.children(id).len()});
        } else {
            item["file"] = json!({
                "mimeType": "application/octet-stream",
                "hashes": {"quickXorHash": content_hash(&node.content)},
            });
        }
        if id == ROOT_ID {
            item["root"] = json!({});
        }
        if let Some(parent) = &node.parent {
            item["parentReference"] = json!({
                "id": parent,
                "driveId": DRIVE_ID,
                "path": format!("/drives/{}/root:{}", DRIVE_ID, self.encoded_path(parent)),
            });
        }
        if expand.is_some_and(|e| e.contains("listItem")) {
            item["listItem"] = json!({"fields": node.fields});
        }
        item
    }

    fn handle(&mut self, request: &HttpRequest) -> HttpResponse {
        let url = request.url.clone();
        if url == TOKEN_URL {
            return self.issue_token();
        }
        if let Some(rest) = url.strip_prefix(UPLOAD_BASE) {
            if request.headers.contains_key(AUTHORIZATION) {
                return graph_error(401, "unauthenticated", "Upload URLs take no token");
            }
            return self.handle_upload(rest, request);
        }
        if let Some(job) = url.strip_prefix(MONITOR_BASE) {
            if request.headers.contains_key(AUTHORIZATION) {
                return graph_error(401, "unauthenticated", "Monitor URLs take no token");
            }
            return self.poll_copy(job);
        }
        if let Some(id) = url.strip_prefix(DOWNLOAD_BASE) {
            if request.headers.contains_key(AUTHORIZATION) {
                return graph_error(401, "unauthenticated", "Download URLs take no token");
            }
            let id = id.split('?').next().unwrap_or(id).to_string();
            if !self.nodes.contains_key(&id) {
                return not_found();
            }
            return self.serve_content(&id, request);
        }
        let Some(rest) = url.strip_prefix(GRAPH) else {
            return not_found();
        };

        let authorized = request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| {
                self.issued_tokens.iter().any(|t| t == token) && !self.revoked.contains(token)
            });
        if !authorized {
            return graph_error(401, "InvalidAuthenticationToken", "Access token is invalid");
        }

        let (route, query) = match rest.split_once('?') {
            Some((route, query)) => (route, query),
            None => (rest, ""),
        };
        let query: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let base = url.split('?').next().unwrap_or(&url).to_string();

        if route == "/sites" {
            return self.search_sites(query.get("search").map(String::as_str).unwrap_or(""));
        }
        let item_route = if let Some(after) = route.strip_prefix("/drives/") {
            after.split_once('/').map(|(_, r)| r)
        } else if let Some(after) = route.strip_prefix("/sites/") {
            match after.split_once('/') {
                Some((_, "drives")) => {
                    return json_response(
                        200,
                        json!({"value": [
                            {"id": DRIVE_ID, "name": "Documents"},
                            {"id": "drive-2", "name": "Archive"},
                        ]}),
                    )
                }
                Some((_, r)) => r.strip_prefix("drive/"),
                None => None,
            }
        } else {
            route.strip_prefix("/me/drive/")
        };
        let Some(item_route) = item_route else {
            return graph_error(400, "invalidRequest", "Unsupported route");
        };

        let (target, action) = self.parse_item(item_route);
        self.dispatch(request, target, &action, &query, &base)
    }

    fn issue_token(&mut self) -> HttpResponse {
        let token = format!("token-{}", self.issued_tokens.len() + 1);
        self.issued_tokens.push(token.clone());
        json_response(
            200,
            json!({"access_token": token, "token_type": "Bearer", "expires_in": 3600}),
        )
    }

    fn search_sites(&self, search: &str) -> HttpResponse {
        let search = search.to_lowercase();
        let value: Vec<Value> = self
            .sites
            .iter()
            .filter(|site| {
                ["name", "displayName"].iter().any(|key| {
                    site[*key]
                        .as_str()
                        .is_some_and(|n| n.to_lowercase().contains(&search))
                })
            })
            .cloned()
            .collect();
        json_response(200, json!({ "value": value }))
    }

    fn parse_item(&self, route: &str) -> (Target, String) {
        let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
        let action = |rest: &str| rest.trim_start_matches('/').to_string();

        if let Some(after) = route.strip_prefix("root:/") {
            let Some((encoded, rest)) = after.split_once(':') else {
                return (Target::Gone, String::new());
            };
            let path = DrivePath::parse(&decode(encoded));
            let target = match path {
                Ok(path) => match self.lookup(&path.to_string_path()) {
                    Some(id) => Target::Node(id),
                    None => match (path.parent(), path.name()) {
                        (Some(parent), Some(name)) => {
                            match self.lookup(&parent.to_string_path()) {
                                Some(parent) if self.nodes[&parent].folder => Target::Missing {
                                    parent,
                                    name: name.to_string(),
                                },
                                _ => Target::Gone,
                            }
                        }
                        _ => Target::Gone,
                    },
                },
                Err(_) => Target::Gone,
            };
            return (target, action(rest));
        }
        if let Some(rest) = route.strip_prefix("root") {
            return (Target::Node(ROOT_ID.to_string()), action(rest));
        }
        if let Some(after) = route.strip_prefix("items/") {
            let end = after.find(['/', ':']).unwrap_or(after.len());
            let id = decode(&after[..end]);
            let rest = &after[end..];
            if !self.nodes.contains_key(&id) {
                return (Target::Gone, String::new());
            }
            if let Some(child) = rest.strip_prefix(":/") {
                let Some((encoded, rest)) = child.split_once(':') else {
                    return (Target::Gone, String::new());
                };
                let name = decode(encoded);
                let target = match self.child(&id, &name) {
                    Some(child) => Target::Node(child),
                    None => Target::Missing { parent: id, name },
                };
                return (target, action(rest));
            }
            return (Target::Node(id), action(rest));
        }
        (Target::Gone, String::new())
    }

    fn dispatch(
        &mut self,
        request: &HttpRequest,
        target: Target,
        action: &str,
        query: &HashMap<String, String>,
        base: &str,
    ) -> HttpResponse {
        let method = &request.method;
        let body: Value = request
            .body
            .as_ref()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(Value::Null);
        let expand = query.get("$expand").map(String::as_str);

        // uploads may name an item that does not exist yet
        if let Target::Missing { parent, name } = &target {
            return match (method.clone(), action) {
                (Method::PUT, "content") => {
                    let data = request.body.clone().unwrap_or_default().to_vec();
                    match self.write_file(parent, name, data) {
                        Ok(id) => json_response(201, self.item_json(&id, None)),
                        Err(response) => response,
                    }
                }
                (Method::POST, "createUploadSession") => {
                    self.create_session(parent.clone(), name.clone())
                }
                _ => not_found(),
            };
        }
        let Target::Node(id) = target else {
            return not_found();
        };

        match (method.clone(), action) {
            (Method::GET, "") => json_response(200, self.item_json(&id, expand)),
            (Method::PATCH, "") => self.patch_item(&id, &body, query),
            (Method::DELETE, "") | (Method::POST, "permanentDelete") => {
                if id == ROOT_ID {
                    return graph_error(403, "accessDenied", "Cannot delete the root");
                }
                self.remove_subtree(&id);
                HttpResponse::new(204, Bytes::new())
            }
            (Method::GET, "children") => self.list_children(&id, query, base),
            (Method::POST, "children") => self.create_folder(&id, &body),
            (Method::GET, "content") => {
                if let Some(format) = query.get("format") {
                    let mut converted = format!("{}:", format).into_bytes();
                    converted.extend_from_slice(&self.nodes[&id].content);
                    return HttpResponse::new(200, converted);
                }
                if self.redirect_downloads {
                    let mut response = HttpResponse::new(302, Bytes::new());
                    let location = format!("{}{}", DOWNLOAD_BASE, id);
                    response
                        .headers
                        .insert(LOCATION, HeaderValue::from_str(&location).unwrap());
                    return response;
                }
                self.serve_content(&id, request)
            }
            (Method::PUT, "content") => {
                let node = &self.nodes[&id];
                let (parent, name) = (node.parent.clone().unwrap_or_default(), node.name.clone());
                let data = request.body.clone().unwrap_or_default().to_vec();
                match self.write_file(&parent, &name, data) {
                    Ok(id) => json_response(200, self.item_json(&id, None)),
                    Err(response) => response,
                }
            }
            (Method::POST, "createUploadSession") => {
                let node = &self.nodes[&id];
                let (parent, name) = (node.parent.clone().unwrap_or_default(), node.name.clone());
                self.create_session(parent, name)
            }
            (Method::POST, "checkin") => {
                let node = self.nodes.get_mut(&id).unwrap();
                node.checked_out = false;
                node.last_comment = body["comment"].as_str().map(str::to_string);
                HttpResponse::new(204, Bytes::new())
            }
            (Method::POST, "checkout") => {
                self.nodes.get_mut(&id).unwrap().checked_out = true;
                HttpResponse::new(204, Bytes::new())
            }
            (Method::GET, "versions") => {
                let skip: usize = query
                    .get("$skiptoken")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let node = &self.nodes[&id];
                let all: Vec<Value> = node
                    .history
                    .iter()
                    .rev()
                    .map(|(version, size)| {
                        json!({
                            "id": format!("{}.0", version),
                            "size": size,
                            "lastModifiedDateTime": node.modified,
                            "lastModifiedBy": {"user": {"displayName": "Test User"}},
                        })
                    })
                    .collect();
                let end = (skip + VERSIONS_PAGE).min(all.len());
                let mut page = json!({ "value": all[skip.min(end)..end].to_vec() });
                if end < all.len() {
                    page["@odata.nextLink"] = json!(format!("{}?$skiptoken={}", base, end));
                }
                json_response(200, page)
            }
            (Method::POST, "copy") => self.start_copy(&id, &body, query),
            (Method::POST, "preview") => json_response(
                200,
                json!({ "getUrl": format!("https://preview.test/embed/{}", id) }),
            ),
            (Method::PATCH, "listItem/fields") => {
                let node = self.nodes.get_mut(&id).unwrap();
                if let Value::Object(fields) = body {
                    node.fields.extend(fields);
                }
                json_response(200, Value::Object(node.fields.clone()))
            }
            _ => graph_error(400, "invalidRequest", "Unsupported item action"),
        }
    }

    fn list_children(&self, id: &str, query: &HashMap<String, String>, base: &str) -> HttpResponse {
        if !self.nodes[id].folder {
            return graph_error(400, "invalidRequest", "Item is not a folder");
        }
        let top: usize = query
            .get("$top")
            .and_then(|s| s.parse().ok())
            .unwrap_or(200);
        let skip: usize = query
            .get("$skiptoken")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let expand = query.get("$expand").map(String::as_str);

        let children = self.children(id);
        let end = (skip + top).min(children.len());
        let value: Vec<Value> = children[skip.min(end)..end]
            .iter()
            .map(|child| self.item_json(child, expand))
            .collect();
        let mut page = json!({ "value": value });
        if end < children.len() {
            let mut next = format!("{}?$top={}&$skiptoken={}", base, top, end);
            if let Some(expand) = expand {
                next.push_str(&format!("&$expand={}", expand));
            }
            page["@odata.nextLink"] = json!(next);
        }
        json_response(200, page)
    }

    fn start_copy(&mut self, id: &str, body: &Value, query: &HashMap<String, String>) -> HttpResponse {
        let parent = body["parentReference"]["id"]
            .as_str()
            .map(str::to_string)
            .or_else(|| self.nodes[id].parent.clone())
            .unwrap_or_default();
        let name = body["name"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.nodes[id].name.clone());
        if !self.nodes.get(&parent).is_some_and(|n| n.folder) {
            return graph_error(400, "invalidRequest", "Copy target is not a folder");
        }
        if self.is_descendant(&parent, id) {
            return graph_error(400, "invalidRequest", "Cannot copy into itself");
        }
        let replace = query
            .get("@microsoft.graph.conflictBehavior")
            .is_some_and(|b| b == "replace");
        if !replace && self.child(&parent, &name).is_some() {
            return graph_error(409, "nameAlreadyExists", "Target already exists");
        }

        self.next_session += 1;
        self.copies.insert(
            self.next_session,
            CopyJob {
                source: id.to_string(),
                parent,
                name,
                replace,
                polls_left: 1,
                result: None,
            },
        );
        let mut response = HttpResponse::new(202, Bytes::new());
        if let Ok(location) = HeaderValue::from_str(&format!("{}{}", MONITOR_BASE, self.next_session)) {
            response.headers.insert(LOCATION, location);
        }
        response
    }

    fn poll_copy(&mut self, job: &str) -> HttpResponse {
        let Some(key) = job.parse::<u64>().ok().filter(|k| self.copies.contains_key(k)) else {
            return not_found();
        };
        if self.fail_copies {
            return json_response(
                200,
                json!({"status": "failed", "error": {"code": "generalException", "message": "Copy failed"}}),
            );
        }
        let job = self.copies.get_mut(&key).unwrap();
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return json_response(202, json!({"status": "inProgress", "percentageComplete": 50.0}));
        }
        let result = match job.result.clone() {
            Some(id) => id,
            None => {
                let (source, parent, name, replace) =
                    (job.source.clone(), job.parent.clone(), job.name.clone(), job.replace);
                if let Some(existing) = self.child(&parent, &name) {
                    if replace {
                        self.remove_subtree(&existing);
                    }
                }
                let id = self.copy_subtree(&source, &parent, &name);
                self.copies.get_mut(&key).unwrap().result = Some(id.clone());
                id
            }
        };
        json_response(
            200,
            json!({"status": "completed", "percentageComplete": 100.0, "resourceId": result}),
        )
    }

    fn copy_subtree(&mut self, source: &str, parent: &str, name: &str) -> String {
        let node = &self.nodes[source];
        let (folder, content, fields) = (node.folder, node.content.clone(), node.fields.clone());
        let id = self.insert(parent, name, folder);
        let copy = self.nodes.get_mut(&id).unwrap();
        copy.content = content;
        copy.fields = fields;
        if !folder {
            copy.history.push((copy.version, copy.content.len() as u64));
        }
        for child in self.children(source) {
            let child_name = self.nodes[&child].name.clone();
            self.copy_subtree(&child, &id, &child_name);
        }
        id
    }

    fn create_folder(&mut self, parent: &str, body: &Value) -> HttpResponse {
        if !self.nodes[parent].folder {
            return graph_error(400, "invalidRequest", "Parent is not a folder");
        }
        let Some(name) = body["name"].as_str() else {
            return graph_error(400, "invalidRequest", "Missing name");
        };
        if self.child(parent, name).is_some() {
            return graph_error(409, "nameAlreadyExists", "Name already exists");
        }
        let id = self.insert(parent, name, true);
        json_response(201, self.item_json(&id, None))
    }

    fn patch_item(&mut self, id: &str, body: &Value, query: &HashMap<String, String>) -> HttpResponse {
        if let Some(modified) = body["fileSystemInfo"]["lastModifiedDateTime"].as_str() {
            let node = self.nodes.get_mut(id).unwrap();
            node.modified = DateTime::parse_from_rfc3339(modified)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            node.version += 1;
        }

        let new_parent = body["parentReference"]["id"].as_str().map(str::to_string);
        let new_name = body["name"].as_str().map(str::to_string);
        if new_parent.is_some() || new_name.is_some() {
            let node = &self.nodes[id];
            let parent = new_parent.unwrap_or_else(|| node.parent.clone().unwrap_or_default());
            let name = new_name.unwrap_or_else(|| node.name.clone());
            if !self.nodes.contains_key(&parent) {
                return not_found();
            }
            if self.is_descendant(&parent, id) {
                return graph_error(400, "invalidRequest", "Cannot move into itself");
            }
            if let Some(existing) = self.child(&parent, &name).filter(|e| e != id) {
                let replace = query
                    .get("@microsoft.graph.conflictBehavior")
                    .is_some_and(|b| b == "replace");
                if !replace {
                    return graph_error(409, "nameAlreadyExists", "Target already exists");
                }
                self.remove_subtree(&existing);
            }
            let node = self.nodes.get_mut(id).unwrap();
            node.parent = Some(parent);
            node.name = name;
        }
        json_response(200, self.item_json(id, None))
    }

    fn serve_content(&self, id: &str, request: &HttpRequest) -> HttpResponse {
        let content = &self.nodes[id].content;
        let range = request
            .headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'))
            .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));

        match range {
            Some((start, end)) if !self.ignore_range => {
                if start >= content.len() {
                    return graph_error(416, "invalidRange", "Range not satisfiable");
                }
                let end = end.min(content.len() - 1);
                let mut response = HttpResponse::new(206, content[start..=end].to_vec());
                let header = format!("bytes {}-{}/{}", start, end, content.len());
                response
                    .headers
                    .insert(CONTENT_RANGE, HeaderValue::from_str(&header).unwrap());
                response
            }
            _ => HttpResponse::new(200, content.clone()),
        }
    }

    fn create_session(&mut self, parent: String, name: String) -> HttpResponse {
        self.next_session += 1;
        let expires = Utc::now() + chrono::Duration::hours(1);
        self.sessions.insert(
            self.next_session,
            Session {
                parent,
                name,
                data: Vec::new(),
                total: None,
                expires,
            },
        );
        json_response(
            200,
            json!({
                "uploadUrl": format!("{}{}", UPLOAD_BASE, self.next_session),
                "expirationDateTime": expires,
                "nextExpectedRanges": ["0-"],
            }),
        )
    }

    fn handle_upload(&mut self, rest: &str, request: &HttpRequest) -> HttpResponse {
        let Ok(key) = rest.parse::<u64>() else {
            return not_found();
        };
        let expired = match self.sessions.get(&key) {
            None => return not_found(),
            Some(session) => session.expires <= Utc::now(),
        };
        if expired {
            self.sessions.remove(&key);
            return not_found();
        }

        match request.method {
            Method::PUT => {
                let data = request.body.clone().unwrap_or_default();
                let parsed = request
                    .headers
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range);
                let Some((start, end, total)) = parsed else {
                    return graph_error(400, "invalidRequest", "Bad Content-Range");
                };
                let skew = self.ack_skew;
                let session = self.sessions.get_mut(&key).unwrap();
                if end + 1 - start != data.len() as u64 {
                    return graph_error(400, "invalidRequest", "Content-Range does not match body");
                }
                if start != session.data.len() as u64 {
                    return graph_error(416, "invalidRange", "Unexpected chunk offset");
                }
                session.data.extend_from_slice(&data);
                if total.is_some() {
                    session.total = total;
                }
                let received = session.data.len() as u64;
                let reported = (received as i64 + skew) as u64;
                let ranges = if session.total == Some(received) && skew == 0 {
                    json!([])
                } else {
                    json!([format!("{}-", reported)])
                };
                json_response(
                    202,
                    json!({"expirationDateTime": session.expires, "nextExpectedRanges": ranges}),
                )
            }
            Method::GET => {
                let session = &self.sessions[&key];
                let received = session.data.len() as u64;
                let ranges = if session.total == Some(received) {
                    json!([])
                } else {
                    json!([format!("{}-", received)])
                };
                json_response(
                    200,
                    json!({"expirationDateTime": session.expires, "nextExpectedRanges": ranges}),
                )
            }
            Method::POST => {
                let session = &self.sessions[&key];
                if session.total != Some(session.data.len() as u64) {
                    return graph_error(400, "invalidRequest", "Upload incomplete");
                }
                let Some(session) = self.sessions.remove(&key) else {
                    return not_found();
                };
                match self.write_file(&session.parent, &session.name, session.data) {
                    Ok(id) => json_response(201, self.item_json(&id, None)),
                    Err(response) => response,
                }
            }
            Method::DELETE => {
                self.sessions.remove(&key);
                self.cancelled_sessions += 1;
                HttpResponse::new(204, Bytes::new())
            }
            _ => graph_error(405, "methodNotAllowed", "Unsupported method"),
        }
    }
}

/// `bytes a-b/total` where total may be `*`.
fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let (range, total) = value.strip_prefix("bytes ")?.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let total = match total {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start.parse().ok()?, end.parse().ok()?, total))
}

fn content_hash(content: &[u8]) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn json_response(status: u16, body: Value) -> HttpResponse {
    let mut response = HttpResponse::new(status, body.to_string());
    response
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn graph_error(status: u16, code: &str, message: &str) -> HttpResponse {
    json_response(status, json!({"error": {"code": code, "message": message}}))
}

fn not_found() -> HttpResponse {
    graph_error(404, "itemNotFound", "The resource could not be found.")
}

/// Configuration pointing at the fake, with fast retries.
pub(crate) fn test_config() -> DriveConfig {
    let mut auth = AuthParams::client_credentials("app", "contoso", "secret");
    auth.token_endpoint = Some(TOKEN_URL.to_string());
    let mut config = DriveConfig::new(auth);
    config.graph_url = GRAPH.to_string();
    config.retry = RetryConfig::new(3)
        .with_initial_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(50));
    config
}

/// Filesystem on the fake's drive.
pub(crate) fn filesystem(fake: &Arc<FakeGraph>, config: DriveConfig) -> DriveFileSystem {
    init_tracing();
    DriveFileSystem::with_transport(
        config,
        DriveTarget::Drive {
            drive_id: DRIVE_ID.to_string(),
        },
        Arc::clone(fake) as Arc<dyn HttpTransport>,
    )
    .unwrap()
}

pub(crate) fn path(path: &str) -> DrivePath {
    DrivePath::parse(path).unwrap()
}

/// Deterministic, non-repeating-looking test content.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
