//! gatesync query: canonical resource and watch URIs.
//!
//! ```text
//! /api/{version}[/namespaces/{ns}]/{plural}[/{name}]?fieldSelector=..&labelSelector=..&watch=true&allowWatchBookmarks=true
//! /apis/{group}/{version}[/namespaces/{ns}]/{plural}[/{name}]?...
//! ```
//!
//! Builders are pure values. Equivalent constructions (named path vs. a
//! `metadata.name` field selector, parts vs. short-form path) normalize to
//! the same state and therefore render the same URI.

#![forbid(unsafe_code)]

use std::fmt;

use gatesync_core::{ResourceKind, CORE_VERSION, DEFAULT_GROUP, DEFAULT_VERSION};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;

/// Field selecting a single object by name.
pub const NAME_FIELD: &str = "metadata.name";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("empty resource path")]
    EmptyPath,
    #[error("empty segment in resource path: {0}")]
    EmptySegment(String),
    #[error("resource path has too many segments (expect /{{ns}}/{{plural}}[/{{name}}]): {0}")]
    TooManySegments(String),
    #[error("unknown resource plural: {0}")]
    UnknownPlural(String),
}

/// API root a resource is served under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiRoot {
    /// `/api/{version}`
    Core { version: String },
    /// `/apis/{group}/{version}`
    Group { group: String, version: String },
}

impl ApiRoot {
    pub fn core() -> Self { ApiRoot::Core { version: CORE_VERSION.to_string() } }

    pub fn group(group: &str, version: &str) -> Self {
        if group.is_empty() {
            ApiRoot::Core { version: version.to_string() }
        } else {
            ApiRoot::Group { group: group.to_string(), version: version.to_string() }
        }
    }

    /// Root for a kind: secrets in the core API, managed kinds under `group/version`.
    pub fn for_kind(kind: ResourceKind, group: &str, version: &str) -> Self {
        if kind.is_core() { Self::core() } else { Self::group(group, version) }
    }

    fn render(&self, out: &mut String) {
        match self {
            ApiRoot::Core { version } => {
                out.push_str("/api/");
                out.push_str(version);
            }
            ApiRoot::Group { group, version } => {
                out.push_str("/apis/");
                out.push_str(group);
                out.push('/');
                out.push_str(version);
            }
        }
    }
}

/// Equality predicate `key=value`; multiple selectors are conjunctive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSelector {
    pub key: String,
    pub value: String,
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}={}", self.key, self.value) }
}

/// `eq("status.hostIP", "172.17.8.101")`
pub fn eq(key: &str, value: &str) -> FieldSelector { FieldSelector { key: key.to_string(), value: value.to_string() } }

/// Descriptor of a list/get request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceQuery {
    root: ApiRoot,
    plural: String,
    namespace: Option<String>,
    name: Option<String>,
    field_selectors: SmallVec<[FieldSelector; 2]>,
    label_selector: Option<String>,
}

impl ResourceQuery {
    pub fn new(root: ApiRoot, plural: &str) -> Self {
        Self {
            root,
            plural: plural.to_string(),
            namespace: None,
            name: None,
            field_selectors: SmallVec::new(),
            label_selector: None,
        }
    }

    pub fn for_kind(kind: ResourceKind, group: &str, version: &str) -> Self {
        Self::new(ApiRoot::for_kind(kind, group, version), kind.plural())
    }

    pub fn secrets(ns: &str) -> Self { Self::new(ApiRoot::core(), ResourceKind::Secret.plural()).namespace(ns) }
    pub fn plugins(ns: &str) -> Self { Self::managed(ResourceKind::Plugin).namespace(ns) }
    pub fn gateways(ns: &str) -> Self { Self::managed(ResourceKind::Gateway).namespace(ns) }
    pub fn services(ns: &str) -> Self { Self::managed(ResourceKind::Service).namespace(ns) }

    fn managed(kind: ResourceKind) -> Self { Self::for_kind(kind, DEFAULT_GROUP, DEFAULT_VERSION) }

    /// Scope to a namespace; an empty string means all namespaces.
    pub fn namespace(mut self, ns: &str) -> Self {
        self.namespace = if ns.is_empty() { None } else { Some(ns.to_string()) };
        self
    }

    pub fn all_namespaces(mut self) -> Self {
        self.namespace = None;
        self
    }

    /// Set the object name. A different name already present (set directly
    /// or folded from a `metadata.name` selector) stays as a selector, so
    /// the predicates remain conjunctive whichever order they were added in.
    pub fn name(mut self, name: &str) -> Self {
        if let Some(prev) = self.name.replace(name.to_string()) {
            if prev != name {
                let displaced = eq(NAME_FIELD, &prev);
                if !self.field_selectors.contains(&displaced) {
                    self.field_selectors.push(displaced);
                }
            }
        }
        // A matching metadata.name selector is now redundant.
        self.field_selectors.retain(|s| !(s.key == NAME_FIELD && s.value == name));
        self
    }

    /// Add a conjunctive equality predicate. The first `metadata.name`
    /// predicate folds into the name so both spellings share one state.
    pub fn field_selector(mut self, sel: FieldSelector) -> Self {
        if sel.key == NAME_FIELD {
            match &self.name {
                None => {
                    self.name = Some(sel.value);
                    return self;
                }
                Some(n) if *n == sel.value => return self,
                Some(_) => {}
            }
        }
        if !self.field_selectors.contains(&sel) {
            self.field_selectors.push(sel);
        }
        self
    }

    pub fn label_selector(mut self, sel: &str) -> Self {
        self.label_selector = if sel.is_empty() { None } else { Some(sel.to_string()) };
        self
    }

    pub fn watch(self) -> WatchQuery { WatchQuery::new(self) }

    pub fn root(&self) -> &ApiRoot { &self.root }
    pub fn plural(&self) -> &str { &self.plural }
    pub fn get_namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    pub fn get_name(&self) -> Option<&str> { self.name.as_deref() }
    pub fn field_selectors(&self) -> &[FieldSelector] { &self.field_selectors }

    /// Parse a short-form path `/{ns}/{plural}[/{name}]` or `/{plural}`
    /// (all namespaces) relative to `root`.
    pub fn parse(root: ApiRoot, path: &str) -> Result<Self, QueryError> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(QueryError::EmptyPath);
        }
        let segs: Vec<&str> = trimmed.split('/').collect();
        if segs.iter().any(|s| s.is_empty()) {
            return Err(QueryError::EmptySegment(path.to_string()));
        }
        match segs.as_slice() {
            [plural] => Ok(Self::new(root, plural)),
            [ns, plural] => Ok(Self::new(root, plural).namespace(ns)),
            [ns, plural, name] => Ok(Self::new(root, plural).namespace(ns).name(name)),
            _ => Err(QueryError::TooManySegments(path.to_string())),
        }
    }

    /// Like [`ResourceQuery::parse`], resolving the root from the plural of a known kind.
    pub fn parse_short(path: &str, group: &str, version: &str) -> Result<Self, QueryError> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(QueryError::EmptyPath);
        }
        let plural = match trimmed.split('/').collect::<Vec<_>>().as_slice() {
            [p] | [_, p] | [_, p, _] => (*p).to_string(),
            _ => return Err(QueryError::TooManySegments(path.to_string())),
        };
        let kind = ResourceKind::from_plural(&plural).ok_or(QueryError::UnknownPlural(plural))?;
        Self::parse(ApiRoot::for_kind(kind, group, version), path)
    }

    fn render_path(&self, out: &mut String, with_name: bool) {
        self.root.render(out);
        if let Some(ns) = &self.namespace {
            out.push_str("/namespaces/");
            out.push_str(ns);
        }
        out.push('/');
        out.push_str(&self.plural);
        if with_name {
            if let Some(name) = &self.name {
                out.push('/');
                out.push_str(name);
            }
        }
    }

    fn render_selectors(&self, params: &mut Vec<String>, name_as_selector: bool) {
        let mut fields: Vec<String> = Vec::with_capacity(self.field_selectors.len() + 1);
        if name_as_selector {
            if let Some(name) = &self.name {
                fields.push(urlencoding::encode(&format!("{}={}", NAME_FIELD, name)).into_owned());
            }
        }
        fields.extend(self.field_selectors.iter().map(|s| urlencoding::encode(&s.to_string()).into_owned()));
        if !fields.is_empty() {
            params.push(format!("fieldSelector={}", fields.join(",")));
        }
        if let Some(labels) = &self.label_selector {
            params.push(format!("labelSelector={}", urlencoding::encode(labels)));
        }
    }

    pub fn to_uri(&self) -> String {
        let mut out = String::with_capacity(64);
        self.render_path(&mut out, true);
        let mut params = Vec::new();
        self.render_selectors(&mut params, false);
        if !params.is_empty() {
            out.push('?');
            out.push_str(&params.join("&"));
        }
        out
    }
}

impl fmt::Display for ResourceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.to_uri()) }
}

/// Descriptor of a watch request. A name renders as a `metadata.name` field
/// selector since single-object watches go through the collection path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchQuery {
    query: ResourceQuery,
    bookmarks: bool,
}

impl WatchQuery {
    pub fn new(query: ResourceQuery) -> Self { Self { query, bookmarks: false } }

    pub fn secrets(ns: &str) -> Self { ResourceQuery::secrets(ns).watch() }
    pub fn plugins(ns: &str) -> Self { ResourceQuery::plugins(ns).watch() }
    pub fn gateways(ns: &str) -> Self { ResourceQuery::gateways(ns).watch() }
    pub fn services(ns: &str) -> Self { ResourceQuery::services(ns).watch() }

    pub fn allow_watch_bookmarks(mut self, on: bool) -> Self {
        self.bookmarks = on;
        self
    }

    pub fn bookmarks(&self) -> bool { self.bookmarks }
    pub fn query(&self) -> &ResourceQuery { &self.query }

    pub fn to_uri(&self) -> String {
        let mut out = String::with_capacity(80);
        self.query.render_path(&mut out, false);
        let mut params = Vec::new();
        self.query.render_selectors(&mut params, true);
        params.push("watch=true".to_string());
        if self.bookmarks {
            params.push("allowWatchBookmarks=true".to_string());
        }
        out.push('?');
        out.push_str(&params.join("&"));
        out
    }

    pub fn watch_key(&self) -> WatchKey { WatchKey::from_uri(&self.to_uri()) }
}

impl fmt::Display for WatchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.to_uri()) }
}

/// Canonical identifier of a logical watch: truncated SHA-256 of its URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchKey(String);

impl WatchKey {
    pub fn from_uri(uri: &str) -> Self {
        let mut hex = hex::encode(Sha256::digest(uri.as_bytes()));
        hex.truncate(24);
        WatchKey(hex)
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}
