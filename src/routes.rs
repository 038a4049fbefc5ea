//! HTTP surface: event-stream routes and health check

use std::convert::Infallible;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tracing::info;
use warp::filters::BoxedFilter;
use warp::http::{HeaderValue, Response, header};
use warp::hyper::Body;
use warp::{Filter, Rejection, Reply};

use modelwatch_k8s::{ClusterApi, ResourceKind};
use modelwatch_stream::{ConnectionRegistry, Session, StreamError, WatchKey, WatcherFactory};

use crate::guard::{self, HeaderLimits, Rejected};
use crate::settings::Settings;

/// Query parameter naming one log component; may repeat
const COMPONENT_PARAM: &str = "component";

/// Everything a streaming request needs, shared by clone
#[derive(Clone, Debug)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub factory: Arc<WatcherFactory>,
}

impl AppState {
    pub fn new(api: Arc<dyn ClusterApi>, settings: &Settings) -> Self {
        let config = settings.stream_config();
        Self {
            registry: ConnectionRegistry::new(config.strategy),
            factory: Arc::new(WatcherFactory::new(
                api,
                ResourceKind::inference_service(&settings.isvc_version),
                config,
            )),
        }
    }
}

/// Static path prefix, e.g. `/kserve-endpoints`
fn prefix(segments: Vec<String>) -> BoxedFilter<()> {
    segments
        .into_iter()
        .fold(warp::any().boxed(), |filter, segment| {
            filter.and(warp::path(segment)).boxed()
        })
}

/// `GET {prefix}/api/sse/namespaces/{ns}/inferenceservices[/{name}[/events|/logs]]`
fn stream_keys(prefix: BoxedFilter<()>, max_components: usize) -> BoxedFilter<(WatchKey,)> {
    let base = prefix
        .and(warp::get())
        .and(warp::path("api"))
        .and(warp::path("sse"))
        .and(warp::path("namespaces"))
        .and(guard::name("namespace"))
        .and(warp::path("inferenceservices"));

    let collection = base
        .clone()
        .and(warp::path::end())
        .map(|namespace: String| WatchKey::collection(namespace));

    let single = base
        .clone()
        .and(guard::name("name"))
        .and(warp::path::end())
        .map(|namespace: String, name: String| WatchKey::single(namespace, name));

    let events = base
        .clone()
        .and(guard::name("name"))
        .and(warp::path("events"))
        .and(warp::path::end())
        .map(|namespace: String, name: String| WatchKey::events(namespace, name));

    let logs = base
        .and(guard::name("name"))
        .and(warp::path("logs"))
        .and(warp::path::end())
        .and(warp::query::<Vec<(String, String)>>())
        .and_then(move |namespace: String, name: String, query: Vec<(String, String)>| {
            logs_key(namespace, name, query, max_components)
        });

    collection
        .or(single)
        .unify()
        .or(events)
        .unify()
        .or(logs)
        .unify()
        .boxed()
}

/// Build a log key from repeated `component` parameters; the limit applies
/// to the parameters as sent, before de-duplication
async fn logs_key(
    namespace: String,
    name: String,
    query: Vec<(String, String)>,
    max_components: usize,
) -> Result<WatchKey, Rejection> {
    let components: Vec<String> = query
        .into_iter()
        .filter(|(key, _)| key == COMPONENT_PARAM)
        .map(|(_, value)| value)
        .collect();

    if components.len() > max_components {
        return Err(warp::reject::custom(Rejected::Stream(
            StreamError::TooManyComponents {
                requested: components.len(),
                limit: max_components,
            },
        )));
    }

    if let Some(bad) = components.iter().find(|c| !guard::is_dns1123(c)) {
        return Err(warp::reject::custom(Rejected::InvalidName {
            field: "component",
            value: bad.clone(),
        }));
    }
    Ok(WatchKey::logs(namespace, name, components))
}

async fn open_stream(key: WatchKey, state: AppState) -> Result<Response<Body>, Rejection> {
    let session = Session::open(&state.registry, &state.factory, key)
        .map_err(|err| warp::reject::custom(Rejected::Stream(err)))?;
    info!(key = %session.key(), channel = %session.id(), "Client connected to stream");

    let frames = session.into_stream().map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::wrap_stream(frames));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(response)
}

pub fn routes(
    state: AppState,
    settings: Settings,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let segments = settings.prefix_segments();
    let limits = HeaderLimits {
        userid_header: settings.userid_header.clone(),
        warning: settings.jwt_warning_threshold,
        error: settings.jwt_error_threshold,
    };

    let max_components = state.factory.config().max_log_components;
    let with_state = warp::any().map(move || state.clone());
    let streams = guard::header_size(limits)
        .and(stream_keys(prefix(segments.clone()), max_components))
        .and(with_state)
        .and_then(open_stream);

    let health = prefix(segments)
        .and(warp::get())
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::json(&json!({"status": "ok"})));

    health
        .or(streams)
        .recover(guard::handle_rejection)
        .with(warp::trace::request())
}
