use askama::Template;
use log::{debug, info, warn};
use ns_lib::{build_http_client, LocationResolver, MasterLocator, NsError, NsPath, NsResult};
use ns_meta::{MemoryMetaHandler, MetaClient, RpcMetaHandler};
use percent_encoding::percent_decode_str;
use reqwest::Client;
use std::sync::Arc;
use warp::http::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use warp::http::{Method, StatusCode};
use warp::hyper::body::Bytes;
use warp::hyper::Body;
use warp::path::FullPath;
use warp::reply::Response;
use warp::Filter;

use crate::config::GatewayConfig;
use crate::listing::{ListingQuery, ListingReply, ListingView};
use crate::repair::{FetchRepair, HttpPublisher};
use crate::serve::{
    error_response, proxy_response, redirect_response, status_response, with_cors, ProxyRequest,
    TransformHints, VariantState,
};

pub struct GatewayState {
    pub config: GatewayConfig,
    pub meta: MetaClient,
    pub locator: Arc<dyn LocationResolver>,
    pub client: Client,
    pub repair: Option<FetchRepair>,
}

impl GatewayState {
    pub fn from_config(config: GatewayConfig) -> NsResult<Self> {
        let timeout = config.request_timeout();
        let filer_url = config.filer_url.clone().filter(|v| !v.is_empty());
        let meta = match &filer_url {
            Some(url) => MetaClient::new_rpc(RpcMetaHandler::new(url.clone(), timeout)?),
            None => {
                info!("no filer_url configured, serving an in-process namespace");
                MetaClient::new_in_process(Box::new(MemoryMetaHandler::new()))
            }
        };
        let repair = match (&config.fallback_origin, &filer_url) {
            (Some(origin), Some(filer)) => {
                let publisher = Arc::new(HttpPublisher::new(filer.clone(), timeout)?);
                Some(FetchRepair::new(
                    origin.clone(),
                    publisher,
                    config.temp_dir.clone(),
                    timeout,
                )?)
            }
            (Some(origin), None) => {
                warn!("fallback origin {} ignored: no filer to republish to", origin);
                None
            }
            (None, _) => None,
        };
        let locator = Arc::new(MasterLocator::new(config.master_url.clone(), timeout)?);
        Ok(Self {
            client: build_http_client(timeout)?,
            config,
            meta,
            locator,
            repair,
        })
    }
}

pub fn routes(
    state: Arc<GatewayState>,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    warp::method()
        .and(warp::path::full())
        .and(
            warp::query::raw()
                .or(warp::any().map(String::new))
                .unify(),
        )
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and(warp::any().map(move || state.clone()))
        .then(handle_request)
}

async fn handle_request(
    method: Method,
    full_path: FullPath,
    raw_query: String,
    headers: HeaderMap,
    body: Bytes,
    state: Arc<GatewayState>,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    let path = match decode_request_path(full_path.as_str()) {
        Ok(v) => v,
        Err(err) => {
            debug!("rejecting {}: {}", full_path.as_str(), err);
            return error_response(&err);
        }
    };
    debug!("{} {} ?{}", method, path, raw_query);

    if path.ends_with('/') {
        if state.config.disable_dir_listing {
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }
        return with_cors(list_directory(&state, &NsPath::new(&path), &raw_query, &headers).await);
    }

    let request = FileRequest {
        method: &method,
        path: NsPath::new(&path),
        raw_query: &raw_query,
        headers: &headers,
        body,
    };
    with_cors(serve_file(&state, request).await)
}

/// Decodes each segment on its own; encoded separators and dot segments are
/// refused. A trailing `/` is kept.
pub(crate) fn decode_request_path(raw: &str) -> NsResult<String> {
    let mut path = String::with_capacity(raw.len());
    for segment in raw.split('/').filter(|s| !s.is_empty()) {
        let decoded = percent_decode_str(segment).decode_utf8().map_err(|e| {
            NsError::InvalidParam(format!("path {} is not utf-8: {}", raw, e))
        })?;
        if decoded == "." || decoded == ".." || decoded.contains('/') {
            return Err(NsError::InvalidParam(format!(
                "path {} has invalid segment {}",
                raw, segment
            )));
        }
        path.push('/');
        path.push_str(&decoded);
    }
    if path.is_empty() || raw.ends_with('/') {
        path.push('/');
    }
    Ok(path)
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false)
}

fn body_response(content_type: &'static str, body: String) -> Response {
    let mut resp = Response::new(Body::from(body));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

async fn list_directory(
    state: &GatewayState,
    dir: &NsPath,
    raw_query: &str,
    headers: &HeaderMap,
) -> Response {
    let query = ListingQuery::parse(raw_query, state.config.list_limit());
    let page = match state
        .meta
        .list_children(dir, query.last_file_name.as_deref(), query.limit)
        .await
    {
        Ok(v) => v,
        Err(err) => {
            if !err.is_not_found() {
                warn!("list {} failed: {}", dir, err);
            }
            return error_response(&err);
        }
    };
    let reply = ListingReply::new(dir, &page, query.limit);

    if wants_json(headers) {
        return match serde_json::to_string(&reply) {
            Ok(body) => body_response("application/json", body),
            Err(e) => error_response(&NsError::Internal(e.to_string())),
        };
    }
    match ListingView::new(&reply).render() {
        Ok(html) => body_response("text/html; charset=utf-8", html),
        Err(e) => {
            warn!("render listing of {} failed: {}", dir, e);
            error_response(&NsError::Internal(e.to_string()))
        }
    }
}

struct FileRequest<'a> {
    method: &'a Method,
    path: NsPath,
    raw_query: &'a str,
    headers: &'a HeaderMap,
    body: Bytes,
}

async fn serve_file(state: &GatewayState, req: FileRequest<'_>) -> Response {
    let blob_id = match state.meta.find_file(&req.path).await {
        Ok(Some(v)) => v,
        Ok(None) => match &state.repair {
            Some(repair) => match repair.repair(&state.meta, &req.path).await {
                Ok(v) => v,
                Err(err) => return error_response(&err),
            },
            None => return error_response(&NsError::NotFound(req.path.to_string())),
        },
        Err(err) => {
            warn!("find {} failed: {}", req.path, err);
            return error_response(&err);
        }
    };

    let hints = TransformHints::from_query(req.raw_query);
    let (blob_id, variant) = match hints.variant_path(&req.path) {
        None => (blob_id, VariantState::NotRequested),
        Some(variant_path) => match state.meta.find_file(&variant_path).await {
            Ok(Some(variant_blob)) => (variant_blob, VariantState::Found),
            Ok(None) => (
                blob_id,
                VariantState::Missing {
                    exact_path: req.path.clone(),
                },
            ),
            Err(err) => {
                warn!("find variant {} failed: {}", variant_path, err);
                (
                    blob_id,
                    VariantState::Missing {
                        exact_path: req.path.clone(),
                    },
                )
            }
        },
    };

    let location = match state.locator.resolve_location(&blob_id).await {
        Ok(v) => v,
        Err(err) => {
            warn!("locate {} for {} failed: {}", blob_id, req.path, err);
            return error_response(&err);
        }
    };

    if state.config.redirect_on_read {
        return redirect_response(&location, req.raw_query);
    }
    proxy_response(
        &state.client,
        &location,
        ProxyRequest {
            method: req.method,
            headers: req.headers,
            body: req.body,
            raw_query: req.raw_query,
            variant: &variant,
        },
    )
    .await
}
