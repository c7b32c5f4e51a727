use std::{
    collections::{BTreeMap, HashSet},
    fmt, fs,
    path::Path,
};

use axum::{http::Method, routing::MethodFilter};
use serde::Deserialize;
use thiserror::Error;

/// Paths under this prefix belong to the control plane and cannot be scripted.
pub const CONTROL_PATH_PREFIX: &str = "/__";

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("unable to read service spec {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("unable to parse service spec: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid route key '{0}': expected \"METHOD /path\"")]
    InvalidRouteKey(String),
    #[error("unsupported method in route key '{route}': {method}")]
    UnsupportedMethod { route: String, method: String },
    #[error("route '{0}' uses a path reserved for the control plane")]
    ReservedPath(String),
    #[error("route '{0}' has a wildcard capture before its last segment")]
    MisplacedWildcard(String),
    #[error("route '{0}' has an unnamed capture")]
    UnnamedCapture(String),
    #[error("route '{0}' has a capture marker inside a path segment")]
    EmbeddedCapture(String),
    #[error("routes '{first}' and '{second}' capture the same path segment differently")]
    ConflictingCaptures { first: String, second: String },
    #[error("route '{0}' is declared more than once")]
    DuplicateRoute(String),
}

/// A `METHOD /path` pair identifying one scripted endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteKey {
    method: Method,
    path: String,
}

impl RouteKey {
    pub fn parse(raw: &str) -> Result<Self, SpecError> {
        let trimmed = raw.trim();
        let Some((method, path)) = trimmed.split_once(char::is_whitespace) else {
            return Err(SpecError::InvalidRouteKey(raw.to_string()));
        };
        let path = path.trim();
        if method.is_empty() || !path.starts_with('/') || path.contains(char::is_whitespace) {
            return Err(SpecError::InvalidRouteKey(raw.to_string()));
        }

        let unsupported = || SpecError::UnsupportedMethod {
            route: raw.to_string(),
            method: method.to_string(),
        };
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| unsupported())?;
        MethodFilter::try_from(method.clone()).map_err(|_| unsupported())?;

        Ok(Self {
            method,
            path: path.to_string(),
        })
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn method_filter(&self) -> Option<MethodFilter> {
        MethodFilter::try_from(self.method.clone()).ok()
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

#[derive(Debug, Deserialize)]
struct RawServiceSpec {
    service_name: String,
    #[serde(default)]
    routes: BTreeMap<String, RawRouteSpec>,
}

#[derive(Debug, Deserialize)]
struct RawRouteSpec {
    #[serde(default)]
    imports: Vec<String>,
    code: String,
}

#[derive(Clone, Debug)]
pub struct RouteSpec {
    pub key: RouteKey,
    /// Capability ids in declaration order, without duplicates.
    pub imports: Vec<String>,
    pub code: String,
}

#[derive(Clone, Debug)]
pub struct ServiceSpec {
    pub service_name: String,
    pub routes: Vec<RouteSpec>,
}

impl ServiceSpec {
    pub fn load(path: &Path) -> Result<Self, SpecError> {
        let raw = fs::read_to_string(path).map_err(|source| SpecError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, SpecError> {
        let spec: RawServiceSpec = serde_json::from_str(raw)?;

        let mut routes = Vec::with_capacity(spec.routes.len());
        let mut seen_keys = HashSet::<RouteKey>::new();
        let mut paths = Vec::<String>::new();
        for (raw_key, route) in spec.routes {
            let key = RouteKey::parse(&raw_key)?;
            validate_path(&raw_key, key.path())?;

            if !seen_keys.insert(key.clone()) {
                return Err(SpecError::DuplicateRoute(key.to_string()));
            }

            if !paths.iter().any(|path| path == key.path()) {
                if let Some(existing) = paths
                    .iter()
                    .find(|existing| captures_conflict(existing, key.path()))
                {
                    return Err(SpecError::ConflictingCaptures {
                        first: existing.clone(),
                        second: key.path().to_string(),
                    });
                }
                paths.push(key.path().to_string());
            }

            let mut imports = Vec::with_capacity(route.imports.len());
            for import in route.imports {
                let import = import.trim().to_string();
                if !import.is_empty() && !imports.contains(&import) {
                    imports.push(import);
                }
            }

            routes.push(RouteSpec {
                key,
                imports,
                code: route.code,
            });
        }

        Ok(Self {
            service_name: spec.service_name,
            routes,
        })
    }
}

fn validate_path(raw_key: &str, path: &str) -> Result<(), SpecError> {
    if path.starts_with(CONTROL_PATH_PREFIX) {
        return Err(SpecError::ReservedPath(raw_key.to_string()));
    }

    let segments = path.split('/').collect::<Vec<_>>();
    let last = segments.len().saturating_sub(1);
    for (index, segment) in segments.iter().enumerate() {
        if segment.get(1..).is_some_and(|rest| rest.contains([':', '*'])) {
            return Err(SpecError::EmbeddedCapture(raw_key.to_string()));
        }
        if let Some(name) = segment.strip_prefix('*') {
            if index != last {
                return Err(SpecError::MisplacedWildcard(raw_key.to_string()));
            }
            if name.is_empty() {
                return Err(SpecError::UnnamedCapture(raw_key.to_string()));
            }
        }
        if segment.strip_prefix(':').is_some_and(str::is_empty) {
            return Err(SpecError::UnnamedCapture(raw_key.to_string()));
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Static(&'a str),
    Param(&'a str),
    Wildcard(&'a str),
}

impl<'a> Segment<'a> {
    fn parse(segment: &'a str) -> Self {
        if let Some(name) = segment.strip_prefix(':') {
            Self::Param(name)
        } else if let Some(name) = segment.strip_prefix('*') {
            Self::Wildcard(name)
        } else {
            Self::Static(segment)
        }
    }
}

/// Two paths conflict when, after an identical prefix, they capture the same segment
/// with a different capture kind or name.
fn captures_conflict(first: &str, second: &str) -> bool {
    for (left, right) in first
        .split('/')
        .map(Segment::parse)
        .zip(second.split('/').map(Segment::parse))
    {
        match (left, right) {
            (Segment::Static(a), Segment::Static(b)) if a == b => {}
            (Segment::Static(_), _) | (_, Segment::Static(_)) => return false,
            (a, b) if a == b => {}
            _ => return true,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_routes_and_collapses_duplicate_imports() {
        let spec = ServiceSpec::from_json(
            r##"{
                "service_name": "svc",
                "routes": {
                    "GET /ping": { "code": "#{pong: true}" },
                    "POST /users/:id": { "imports": ["log", "json", "log", " "], "code": "()" }
                }
            }"##,
        )
        .expect("spec parses");

        assert_eq!(spec.service_name, "svc");
        assert_eq!(spec.routes.len(), 2);
        let ping = &spec.routes[0];
        assert_eq!(ping.key.to_string(), "GET /ping");
        assert!(ping.imports.is_empty());
        let users = &spec.routes[1];
        assert_eq!(users.key.method(), &Method::POST);
        assert_eq!(users.key.path(), "/users/:id");
        assert_eq!(users.imports, vec!["log".to_string(), "json".to_string()]);
    }

    #[test]
    fn route_key_requires_method_and_absolute_path() {
        assert!(matches!(
            RouteKey::parse("GET"),
            Err(SpecError::InvalidRouteKey(_))
        ));
        assert!(matches!(
            RouteKey::parse("GET ping"),
            Err(SpecError::InvalidRouteKey(_))
        ));
        assert!(matches!(
            RouteKey::parse("GET /a b"),
            Err(SpecError::InvalidRouteKey(_))
        ));
        assert!(matches!(
            RouteKey::parse("FETCH /ping"),
            Err(SpecError::UnsupportedMethod { .. })
        ));
        assert!(matches!(
            RouteKey::parse("get /ping"),
            Err(SpecError::UnsupportedMethod { .. })
        ));

        let key = RouteKey::parse("  DELETE   /items/:id ").expect("key parses");
        assert_eq!(key.to_string(), "DELETE /items/:id");
        assert!(key.method_filter().is_some());
    }

    #[test]
    fn control_plane_paths_are_reserved() {
        let error = ServiceSpec::from_json(
            r#"{"service_name":"svc","routes":{"GET /__calls":{"code":"1"}}}"#,
        )
        .expect_err("reserved path rejected");
        assert!(matches!(error, SpecError::ReservedPath(_)));
    }

    #[test]
    fn captures_that_differ_only_by_name_conflict() {
        let error = ServiceSpec::from_json(
            r#"{"service_name":"svc","routes":{
                "GET /users/:id":{"code":"1"},
                "DELETE /users/:user_id":{"code":"1"}
            }}"#,
        )
        .expect_err("conflicting captures rejected");
        assert!(matches!(error, SpecError::ConflictingCaptures { .. }));

        let spec = ServiceSpec::from_json(
            r#"{"service_name":"svc","routes":{
                "GET /users/:id":{"code":"1"},
                "DELETE /users/:id":{"code":"1"}
            }}"#,
        )
        .expect("same capture names share a path");
        assert_eq!(spec.routes.len(), 2);
    }

    #[test]
    fn param_and_wildcard_on_the_same_segment_conflict() {
        let error = ServiceSpec::from_json(
            r#"{"service_name":"svc","routes":{
                "GET /users/:id":{"code":"1"},
                "GET /users/*rest":{"code":"1"}
            }}"#,
        )
        .expect_err("param and wildcard rejected");
        assert!(matches!(error, SpecError::ConflictingCaptures { .. }));

        let nested = ServiceSpec::from_json(
            r#"{"service_name":"svc","routes":{
                "GET /users/:id/posts":{"code":"1"},
                "POST /users/*rest":{"code":"1"}
            }}"#,
        )
        .expect_err("capture kinds differ below a shared prefix");
        assert!(matches!(nested, SpecError::ConflictingCaptures { .. }));

        let spec = ServiceSpec::from_json(
            r#"{"service_name":"svc","routes":{
                "GET /users/me":{"code":"1"},
                "GET /users/:id":{"code":"1"},
                "GET /users/:id/posts":{"code":"1"}
            }}"#,
        )
        .expect("static siblings of a capture coexist");
        assert_eq!(spec.routes.len(), 3);
    }

    #[test]
    fn capture_markers_must_start_a_segment() {
        for key in ["GET /v1/a*b", "GET /v1/a:b", "GET /v1/:id*"] {
            let error = ServiceSpec::from_json(&format!(
                r#"{{"service_name":"svc","routes":{{"{key}":{{"code":"1"}}}}}}"#
            ))
            .expect_err("embedded capture rejected");
            assert!(matches!(error, SpecError::EmbeddedCapture(_)), "{key}");
        }
    }

    #[test]
    fn wildcard_must_be_last_and_named() {
        let misplaced = ServiceSpec::from_json(
            r#"{"service_name":"svc","routes":{"GET /files/*rest/meta":{"code":"1"}}}"#,
        )
        .expect_err("misplaced wildcard rejected");
        assert!(matches!(misplaced, SpecError::MisplacedWildcard(_)));

        let unnamed = ServiceSpec::from_json(
            r#"{"service_name":"svc","routes":{"GET /files/:":{"code":"1"}}}"#,
        )
        .expect_err("unnamed capture rejected");
        assert!(matches!(unnamed, SpecError::UnnamedCapture(_)));
    }

    #[test]
    fn keys_that_normalize_to_the_same_route_are_duplicates() {
        let error = ServiceSpec::from_json(
            r#"{"service_name":"svc","routes":{"GET /a":{"code":"1"},"GET  /a":{"code":"2"}}}"#,
        )
        .expect_err("duplicate rejected");
        assert!(matches!(error, SpecError::DuplicateRoute(_)));
    }

    #[test]
    fn load_reads_spec_file_and_reports_missing_files() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(br#"{"service_name":"svc","routes":{"GET /ping":{"imports":[],"code":"1"}}}"#)
            .expect("write spec");

        let spec = ServiceSpec::load(file.path()).expect("spec loads");
        assert_eq!(spec.routes.len(), 1);

        let missing = ServiceSpec::load(Path::new("/definitely/not/here.json"))
            .expect_err("missing file is an error");
        assert!(matches!(missing, SpecError::Read { .. }));

        let malformed = ServiceSpec::from_json("{\"service_name\":").expect_err("malformed");
        assert!(matches!(malformed, SpecError::Parse(_)));
    }
}
