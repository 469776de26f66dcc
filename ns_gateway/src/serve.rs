use futures::TryStreamExt;
use log::{debug, warn};
use ns_lib::{Location, NsError, NsPath, NsResult};
use reqwest::Client;
use warp::http::header::{HeaderMap, HeaderValue, LOCATION};
use warp::http::{Method, StatusCode};
use warp::hyper::body::Bytes;
use warp::hyper::Body;
use warp::reply::Response;

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_forwardable(name: &str) -> bool {
    !HOP_BY_HOP.contains(&name)
}

/// Image transformation hints carried in the query: `w`, `h`, `r` when
/// non-empty, `f` only when both `w` and `h` are set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformHints {
    pairs: Vec<(&'static str, String)>,
}

impl TransformHints {
    pub fn from_query(raw_query: &str) -> Self {
        let mut width = None;
        let mut height = None;
        let mut mode = None;
        let mut fit = None;
        for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "w" => width = Some(value.into_owned()),
                "h" => height = Some(value.into_owned()),
                "r" => mode = Some(value.into_owned()),
                "f" => fit = Some(value.into_owned()),
                _ => {}
            }
        }
        let both_sides = width.is_some() && height.is_some();
        let mut pairs = Vec::new();
        if let Some(v) = width {
            pairs.push(("w", v));
        }
        if let Some(v) = height {
            pairs.push(("h", v));
        }
        if let Some(v) = mode {
            pairs.push(("r", v));
        }
        if let (true, Some(v)) = (both_sides, fit) {
            pairs.push(("f", v));
        }
        Self { pairs }
    }

    /// `w=..&h=..&r=..&f=..` in that order, `None` without hints.
    pub fn variant_suffix(&self) -> Option<String> {
        if self.pairs.is_empty() {
            return None;
        }
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.pairs {
            serializer.append_pair(key, value);
        }
        Some(serializer.finish())
    }

    /// Namespace path under which a pre-rendered variant would be stored.
    pub fn variant_path(&self, path: &NsPath) -> Option<NsPath> {
        self.variant_suffix()
            .map(|suffix| NsPath::new(format!("{}?{}", path, suffix)))
    }
}

/// Whether a pre-rendered variant was looked for, and what was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantState {
    NotRequested,
    Found,
    Missing { exact_path: NsPath },
}

fn append_raw_query(url: &str, raw_query: &str) -> String {
    if raw_query.is_empty() {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, separator, raw_query)
}

/// Location's own query merged with every pair of the incoming query.
pub fn merge_query(serving_url: &str, raw_query: &str) -> NsResult<String> {
    let mut url = url::Url::parse(serving_url)
        .map_err(|e| NsError::InvalidData(format!("serving url {}: {}", serving_url, e)))?;
    if raw_query.is_empty() {
        return Ok(url.to_string());
    }
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
            pairs.append_pair(&key, &value);
        }
    }
    Ok(url.to_string())
}

pub fn redirect_response(location: &Location, raw_query: &str) -> Response {
    let target = append_raw_query(&location.serving_url(), raw_query);
    debug!("redirect {} -> {}", location.blob_id(), target);
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::FOUND;
    match HeaderValue::from_str(&target) {
        Ok(value) => {
            resp.headers_mut().insert(LOCATION, value);
            resp
        }
        Err(e) => {
            warn!("redirect target {} is not a header value: {}", target, e);
            error_response(&NsError::Internal(format!("bad redirect target {}", target)))
        }
    }
}

pub struct ProxyRequest<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    pub raw_query: &'a str,
    pub variant: &'a VariantState,
}

/// Forwards the request to the storage node and streams its reply back.
pub async fn proxy_response(client: &Client, location: &Location, req: ProxyRequest<'_>) -> Response {
    let target = match merge_query(&location.serving_url(), req.raw_query) {
        Ok(v) => v,
        Err(err) => return error_response(&err),
    };
    let method = match reqwest::Method::from_bytes(req.method.as_str().as_bytes()) {
        Ok(v) => v,
        Err(_) => return status_response(StatusCode::METHOD_NOT_ALLOWED),
    };

    let mut builder = client.request(method, &target);
    for (name, value) in req.headers.iter() {
        if is_forwardable(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    match req.variant {
        VariantState::NotRequested => {}
        VariantState::Found => {
            builder = builder.header("exist", "1");
        }
        VariantState::Missing { exact_path } => {
            builder = builder
                .header("exist", "0")
                .header("path", exact_path.as_str());
        }
    }
    if !req.body.is_empty() {
        builder = builder.body(req.body.to_vec());
    }

    let upstream = match builder.send().await {
        Ok(v) => v,
        Err(e) => {
            warn!("proxy {} to {} failed: {}", location.blob_id(), target, e);
            return error_response(&NsError::ContentFetchFailure(format!(
                "proxy to {}: {}",
                target, e
            )));
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = warp::http::Response::builder().status(status);
    for (name, value) in upstream.headers().iter() {
        if is_forwardable(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    let source = target.clone();
    let stream = upstream.bytes_stream().map_err(move |e| {
        warn!("proxy body from {} aborted: {}", source, e);
        e
    });
    match builder.body(Body::wrap_stream(stream)) {
        Ok(resp) => resp,
        Err(e) => {
            warn!("build proxied response for {} failed: {}", target, e);
            error_response(&NsError::Internal(e.to_string()))
        }
    }
}

pub fn status_for(err: &NsError) -> StatusCode {
    match err {
        NsError::NotFound(_) => StatusCode::NOT_FOUND,
        NsError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        NsError::LocationResolutionFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        NsError::ContentFetchFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        NsError::WriteConflict(_) => StatusCode::CONFLICT,
        NsError::InvalidId(_) | NsError::InvalidParam(_) | NsError::InvalidData(_) => {
            StatusCode::BAD_REQUEST
        }
        NsError::IoError(_) | NsError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `{"error": "..."}` with the status mapped from the error kind.
pub fn error_response(err: &NsError) -> Response {
    let body = serde_json::json!({ "error": err.to_string() }).to_string();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status_for(err);
    resp.headers_mut().insert(
        warp::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

pub fn status_response(status: StatusCode) -> Response {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    resp
}

pub fn with_cors(mut resp: Response) -> Response {
    let headers = resp.headers_mut();
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET"),
    );
    headers.insert(
        "access-control-max-age",
        HeaderValue::from_static("1000"),
    );
    resp
}
