// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path as UrlPath, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use canonical_error::{CanonicalError, CanonicalErrorCode,
                      internal_error, invalid_argument_error};
use clap::Parser;
use log::{error, info, warn};
use serde_json::json;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    services::ServeDir,
};

use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use crate::catalog::{Catalog, ExoplanetRecord};
use crate::constellation_store::{
    ConstellationStore, ConstellationSubmission, NewConstellation,
    SqliteConstellationStore, RECENT_LIMIT};
use crate::projector::{ObserverId, ProjectedStar, Projector};

fn http_status(canonical_error: &CanonicalError) -> StatusCode {
    match canonical_error.code {
        CanonicalErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        CanonicalErrorCode::OutOfRange => StatusCode::BAD_REQUEST,
        CanonicalErrorCode::NotFound => StatusCode::NOT_FOUND,
        CanonicalErrorCode::AlreadyExists => StatusCode::CONFLICT,
        CanonicalErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        CanonicalErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        CanonicalErrorCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        CanonicalErrorCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        CanonicalErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        CanonicalErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handler error: a CanonicalError rendered as `{"error": message}` with the
/// matching HTTP status.
#[derive(Debug)]
pub struct ApiError(CanonicalError);

impl From<CanonicalError> for ApiError {
    fn from(canonical_error: CanonicalError) -> Self {
        ApiError(canonical_error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = http_status(&self.0);
        if status.is_server_error() {
            error!("Request failed: {:?}", self.0);
        } else {
            warn!("Rejected request: {}", self.0.message);
        }
        (status, Json(json!({ "error": self.0.message }))).into_response()
    }
}

/// Everything a request handler needs. Built once at startup; the catalog is
/// never modified afterwards.
pub struct StarMapState {
    pub catalog: Arc<Catalog>,
    pub projector: Projector,
    pub store: Arc<dyn ConstellationStore + Send + Sync>,
}

type SharedState = Arc<StarMapState>;

// Projection is CPU-bound, so it runs off the async workers.
async fn project_for(state: SharedState, location: ObserverId)
                     -> Result<Json<Vec<ProjectedStar>>, ApiError> {
    let observer = location.resolve(&state.catalog)?;
    let projected = tokio::task::spawn_blocking(move || {
        state.projector.project(state.catalog.stars(), &observer)
    })
    .await
    .map_err(|e| internal_error(
        format!("Projection task failed: {}", e).as_str()))?;
    Ok(Json(projected))
}

async fn earth_stars(State(state): State<SharedState>)
                     -> Result<Json<Vec<ProjectedStar>>, ApiError> {
    project_for(state, ObserverId::Earth).await
}

async fn located_stars(State(state): State<SharedState>,
                       UrlPath(location): UrlPath<String>)
                       -> Result<Json<Vec<ProjectedStar>>, ApiError> {
    project_for(state, location.parse::<ObserverId>()?).await
}

async fn exoplanets(State(state): State<SharedState>)
                    -> Json<Vec<ExoplanetRecord>> {
    Json(state.catalog.exoplanets().to_vec())
}

async fn submit_constellation(
    State(state): State<SharedState>,
    payload: Result<Json<NewConstellation>, JsonRejection>)
    -> Result<Json<serde_json::Value>, ApiError>
{
    let Json(submission) = payload.map_err(|rejection| invalid_argument_error(
        format!("Invalid constellation submission: {}", rejection).as_str()))?;
    let stored = state.store.create(submission).await?;
    info!("Received constellation {} '{}'", stored.id, stored.name);
    Ok(Json(json!({ "message": "Constellation submitted successfully!" })))
}

async fn get_constellations(State(state): State<SharedState>)
                            -> Result<Json<Vec<ConstellationSubmission>>, ApiError> {
    Ok(Json(state.store.list_recent(RECENT_LIMIT).await?))
}

// The viewer is served from elsewhere and sends credentials, so the caller's
// origin is echoed back rather than using a wildcard.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// Builds the REST service. If `static_dir` is given, paths not matching a
/// route are served from it (e.g. a built copy of the viewer).
pub fn create_router(state: SharedState, static_dir: Option<&Path>) -> Router {
    let mut router = Router::new()
        .route("/stars", get(earth_stars))
        .route("/stars/:location", get(located_stars))
        .route("/exoplanets", get(exoplanets))
        .route("/submit-constellation", post(submit_constellation))
        .route("/get-constellations", get(get_constellations))
        .with_state(state);
    if let Some(static_dir) = static_dir {
        router = router.fallback_service(ServeDir::new(static_dir));
    }
    router.layer(cors_layer())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct AppArgs {
    /// Gaia star catalog, CSV with columns ra, dec, parallax,
    /// phot_g_mean_mag, bp_rp, g_rp, bp_g.
    #[arg(long, default_value = "gaia_stars.csv")]
    stars: PathBuf,

    /// Exoplanet archive export, CSV with columns pl_name, ra, dec, sy_dist.
    #[arg(long, default_value = "exoplanets.csv")]
    exoplanets: PathBuf,

    /// SQLite file holding submitted constellations. Created if absent.
    #[arg(long, default_value = "constellations.db")]
    database: PathBuf,

    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(long, default_value = "5001")]
    port: u16,

    /// Stars further than this many degrees from the observer's direction
    /// are left out. 180 keeps all of them.
    #[arg(long = "max_separation", default_value = "180.0")]
    max_separation: f64,

    /// If given, the viewer's static files are served from here.
    #[arg(long = "static_dir")]
    static_dir: Option<PathBuf>,

    #[arg(long = "log_dir", default_value = ".")]
    log_dir: String,

    #[arg(long = "log_file", default_value = "starmap_log.txt")]
    log_file: String,
}

pub fn server_main() {
    let args = AppArgs::parse();

    // Set up logging.
    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("Could not create log file in {}: {}", args.log_dir, e);
            std::process::exit(1);
        }
    };

    // Create non-blocking writers for both the file and stdout
    let (non_blocking_file, file_guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, stdout_guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c");
        std::thread::sleep(Duration::from_millis(100));
        info!("Exiting");
        std::process::exit(-1);
    }) {
        warn!("Could not install control-c handler: {:?}", e);
    }

    if let Err(e) = async_main(args) {
        error!("{}", e.message);
        // Give the non-blocking writers a chance to flush.
        drop(file_guard);
        drop(stdout_guard);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(args: AppArgs) -> Result<(), CanonicalError> {
    info!("Star map server version {}", env!("CARGO_PKG_VERSION"));

    // Catalog problems are fatal: without the data there is nothing to serve.
    let catalog = Catalog::load(&args.stars, &args.exoplanets)?;
    let projector = Projector::new(args.max_separation)?;
    info!("Separation cutoff {} degrees", projector.max_separation_deg());
    let store = SqliteConstellationStore::open(&args.database)?;

    let state = Arc::new(StarMapState {
        catalog: Arc::new(catalog),
        projector,
        store: Arc::new(store),
    });
    let router = create_router(state, args.static_dir.as_deref());

    let addr = SocketAddr::new(args.host, args.port);
    info!("Listening at {:?}", addr);
    hyper::Server::try_bind(&addr)
        .map_err(|e| invalid_argument_error(
            format!("Could not bind {:?}: {}", addr, e).as_str()))?
        .serve(router.into_make_service())
        .await
        .map_err(|e| canonical_error::unavailable_error(
            format!("Server error: {}", e).as_str()))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::catalog::StarRecord;

    fn test_state() -> SharedState {
        let stars = vec![
            StarRecord { ra_deg: 10.0, dec_deg: 20.0, parallax_mas: 100.0,
                         mag_g: 5.0, bp_rp: 0.8, g_rp: 0.5, bp_g: 0.3 },
            StarRecord { ra_deg: 20.0, dec_deg: -5.0, parallax_mas: 0.0,
                         mag_g: 6.0, bp_rp: 0.8, g_rp: 0.5, bp_g: 0.3 },
            StarRecord { ra_deg: 217.4292, dec_deg: -62.6795, parallax_mas: 500.0,
                         mag_g: 4.0, bp_rp: 1.2, g_rp: 0.7, bp_g: 0.5 },
        ];
        let exoplanets = vec![
            ExoplanetRecord { id: 0, name: "Proxima Cen b".to_string(),
                              ra_deg: 217.4292, dec_deg: -62.6795,
                              distance_pc: 1.295 },
        ];
        Arc::new(StarMapState {
            catalog: Arc::new(Catalog::new(stars, exoplanets)),
            projector: Projector::default(),
            store: Arc::new(SqliteConstellationStore::open_in_memory().unwrap()),
        })
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        send(router, Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post_json(router: Router, uri: &str, body: &str) -> (StatusCode, Value) {
        send(router, Request::builder()
             .method(Method::POST)
             .uri(uri)
             .header(header::CONTENT_TYPE, "application/json")
             .body(Body::from(body.to_string()))
             .unwrap())
            .await
    }

    #[tokio::test]
    async fn test_earth_stars() {
        let router = create_router(test_state(), None);
        let (status, body) = get_json(router.clone(), "/stars").await;
        assert_eq!(status, StatusCode::OK);
        let stars = body.as_array().unwrap();
        // Zero-parallax star is left out.
        assert_eq!(stars.len(), 2);
        assert_eq!(stars[0]["ra"].as_f64().unwrap().round(), 10.0);
        assert_eq!(stars[0]["brightness"], 5.0);
        assert!(stars[0]["color"].as_str().unwrap().starts_with('#'));

        let (status, alias) = get_json(router, "/stars/earth").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(alias, body);
    }

    #[tokio::test]
    async fn test_exoplanet_stars() {
        let router = create_router(test_state(), None);
        let (status, body) = get_json(router, "/stars/0").await;
        assert_eq!(status, StatusCode::OK);
        let stars = body.as_array().unwrap();
        assert_eq!(stars.len(), 2);
        let distance = stars[1]["distance"].as_f64().unwrap();
        assert!((distance - 0.705).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_exoplanet() {
        let router = create_router(test_state(), None);
        let (status, body) = get_json(router, "/stars/99999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("99999"));
    }

    #[tokio::test]
    async fn test_unreachable_exoplanet_id() {
        let router = create_router(test_state(), None);
        for uri in ["/stars/-1", "/stars/99999999999999999999999"] {
            let (status, body) = get_json(router.clone(), uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_malformed_location() {
        let router = create_router(test_state(), None);
        let (status, body) = get_json(router, "/stars/abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_list_exoplanets() {
        let router = create_router(test_state(), None);
        let (status, body) = get_json(router, "/exoplanets").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([{
            "id": 0, "name": "Proxima Cen b",
            "ra": 217.4292, "dec": -62.6795, "distance": 1.295
        }]));
    }

    #[tokio::test]
    async fn test_submit_and_get_constellations() {
        let router = create_router(test_state(), None);
        let (status, body) = post_json(
            router.clone(), "/submit-constellation",
            r#"{"name": "Big Teapot", "description": "steaming",
                "user_name": "ada", "image_data": "data:image/png;base64,AA"}"#)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].is_string());

        post_json(router.clone(), "/submit-constellation",
                  r#"{"name": "Second"}"#).await;

        let (status, body) = get_json(router, "/get-constellations").await;
        assert_eq!(status, StatusCode::OK);
        let listed = body.as_array().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0]["name"], "Second");
        assert_eq!(listed[1]["name"], "Big Teapot");
        assert_eq!(listed[1]["user_name"], "ada");
        assert_eq!(listed[1]["image_data"], "data:image/png;base64,AA");
        assert!(listed[1]["created_at"].is_string());
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_input() {
        let router = create_router(test_state(), None);
        let (status, _) = post_json(router.clone(), "/submit-constellation",
                                    r#"{"description": "no name"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post_json(router.clone(), "/submit-constellation",
                                       "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (_, body) = get_json(router, "/get-constellations").await;
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin_with_credentials() {
        let router = create_router(test_state(), None);
        let response = router.oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/stars")
                .header(header::ORIGIN, "http://localhost:3000")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .body(Body::empty())
                .unwrap())
            .await.unwrap();
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
                   "http://localhost:3000");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(http_status(&invalid_argument_error("x")),
                   StatusCode::BAD_REQUEST);
        assert_eq!(http_status(&canonical_error::not_found_error("x")),
                   StatusCode::NOT_FOUND);
        assert_eq!(http_status(&canonical_error::internal_error("x")),
                   StatusCode::INTERNAL_SERVER_ERROR);
    }
}  // mod tests.
