//! sdpack Server
//!
//! Development server that serves the plugin package directory over HTTP
//! and rebuilds the bundle when its sources change.

mod error;
pub mod file_watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderValue},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use sdpack_core::{path_to_string, BuildOutput, PackError, ResolvedConfig, ResolvedDevServer};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tower_http::{
    cors::CorsLayer, services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer,
};

pub use error::ServeError;
pub use file_watcher::{spawn_rebuild_watcher, WatchHandle};

/// Reserved route for server status, outside any served file name
pub const HEALTH_ROUTE: &str = "/_sdpack/health";

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// URL prefix; starts and ends with '/'
    pub public_path: String,
    /// Directory served, the plugin package
    pub root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".to_string(),
            public_path: "/".to_string(),
            root: PathBuf::from("."),
        }
    }
}

impl From<&ResolvedDevServer> for ServerConfig {
    fn from(config: &ResolvedDevServer) -> Self {
        Self {
            port: config.port,
            host: config.host.clone(),
            public_path: config.public_path.clone(),
            root: config.root.clone(),
        }
    }
}

/// Outcome of the most recent build, reported by the health route
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    /// Builds attempted since the server started
    pub builds: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub modules: usize,
    pub bundle_bytes: usize,
    pub duration_ms: u64,
}

impl BuildStatus {
    pub fn record(&mut self, result: &Result<BuildOutput, PackError>) {
        self.builds += 1;
        match result {
            Ok(output) => {
                self.ok = true;
                self.error = None;
                self.modules = output.stats.modules;
                self.bundle_bytes = output.stats.bundle_bytes;
                self.duration_ms = duration_ms(output.stats.duration);
            }
            Err(e) => {
                self.ok = false;
                self.error = Some(e.to_string());
            }
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Shared application state
pub struct AppState {
    /// Directory being served
    pub root: PathBuf,
    pub public_path: String,
    /// Last build result
    pub build_status: RwLock<BuildStatus>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            root: config.root.clone(),
            public_path: config.public_path.clone(),
            build_status: RwLock::new(BuildStatus::default()),
        })
    }
}

/// Create the main router
pub fn create_router(state: Arc<AppState>) -> Router {
    let serve_dir = ServeDir::new(&state.root);
    let prefix = state.public_path.trim_end_matches('/').to_string();

    let router = Router::new()
        // Server status
        .route(HEALTH_ROUTE, get(handle_health))
        .with_state(state);

    // Package files, re-read from disk on every request
    let router = if prefix.is_empty() {
        router.fallback_service(serve_dir)
    } else {
        router.nest_service(&prefix, serve_dir)
    };

    router
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
        // The property inspector page may be loaded from another origin
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let build = state.build_status.read().await.clone();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "root": path_to_string(&state.root),
        "publicPath": state.public_path,
        "build": build,
    }))
}

/// A running development server
///
/// Several can run side by side; each owns its listener and state. Dropping
/// the value aborts the server task.
pub struct DevServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    watcher: Option<WatchHandle>,
}

impl DevServer {
    /// Bind and start serving. Fails immediately if the port is taken.
    pub async fn start(config: ServerConfig) -> Result<Self, ServeError> {
        Self::start_with_state(config.clone(), AppState::new(&config)).await
    }

    /// Start with state shared with a rebuild watcher
    pub async fn start_with_state(
        config: ServerConfig,
        state: Arc<AppState>,
    ) -> Result<Self, ServeError> {
        let addr = resolve_addr(&config.host, config.port).await?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::AddrInUse => ServeError::AddressInUse(addr),
                _ => ServeError::Bind { addr, source },
            })?;
        let addr = listener.local_addr()?;

        let router = create_router(state.clone());
        tracing::info!(
            "sdpack dev server listening on http://{}{} (serving {})",
            addr,
            config.public_path,
            config.root.display()
        );

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(serve_connections(listener, router, shutdown_rx));

        Ok(Self {
            addr,
            state,
            shutdown: Some(shutdown),
            task: Some(task),
            watcher: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL the package is served under
    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, self.state.public_path)
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Tie a rebuild watcher's lifetime to this server
    pub fn attach_watcher(&mut self, watcher: WatchHandle) {
        self.watcher = Some(watcher);
    }

    /// Stop serving. Open connections, idle keep-alive ones included, are
    /// closed before this returns; in-flight requests are dropped.
    pub async fn stop(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Server task ended abnormally: {}", e);
            }
        }
        tracing::info!("sdpack dev server on {} stopped", self.addr);
    }
}

impl Drop for DevServer {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Accept loop. Connection tasks live in one `JoinSet`, which is shut down
/// with the loop; dropping the loop's task aborts them as well.
async fn serve_connections(
    listener: TcpListener,
    router: Router,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let service = TowerToHyperService::new(router.clone());
                    connections.spawn(async move {
                        let io = TokioIo::new(stream);
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            tracing::debug!("Connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Failed to accept connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    connections.shutdown().await;
}

async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, ServeError> {
    tokio::net::lookup_host((host, port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ServeError::InvalidAddress(format!("{}:{}", host, port)))
}

/// Build once, serve the package, rebuild on source changes until Ctrl-C
pub async fn run_server(config: ResolvedConfig, watch: bool) -> Result<(), ServeError> {
    let server_config = ServerConfig::from(&config.dev_server);
    let state = AppState::new(&server_config);

    let build_config = config.clone();
    let result = tokio::task::spawn_blocking(move || sdpack_core::bundle(&build_config))
        .await
        .map_err(|e| ServeError::Io(std::io::Error::other(e)))?;

    state.build_status.write().await.record(&result);

    let sources = match result {
        Ok(output) => output.sources,
        Err(PackError::Config(e)) => return Err(e.into()),
        Err(PackError::Build(e)) => {
            tracing::error!("Initial build failed: {}", e);
            vec![config.entry.clone()]
        }
    };

    let mut server = DevServer::start_with_state(server_config, state.clone()).await?;

    if watch {
        let handle = spawn_rebuild_watcher(config, sources, state)?;
        server.attach_watcher(handle);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    server.stop().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sdpack_core::{LibraryConfig, LibraryType, PackConfig};
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn package_dir() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("bundle.js"), "var SDPlugin = {};").unwrap();
        fs::write(temp_dir.path().join("index.html"), "<script src=\"bundle.js\"></script>").unwrap();
        temp_dir
    }

    fn config_for(root: &std::path::Path, public_path: &str) -> ServerConfig {
        ServerConfig {
            port: 0,
            public_path: public_path.to_string(),
            root: root.to_path_buf(),
            ..Default::default()
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body.to_vec())
    }

    #[tokio::test]
    async fn test_serves_bundle_with_content_type() {
        let dir = package_dir();
        let router = create_router(AppState::new(&config_for(dir.path(), "/")));

        let (status, headers, body) = get(router, "/bundle.js").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"var SDPlugin = {};");
        let content_type = headers[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.contains("javascript"), "{}", content_type);
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    }

    #[tokio::test]
    async fn test_missing_and_escaping_paths_are_404() {
        let dir = package_dir();
        let state = AppState::new(&config_for(dir.path(), "/"));

        let (status, _, _) = get(create_router(state.clone()), "/nope.js").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = get(create_router(state), "/../secret.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_public_path_prefix() {
        let dir = package_dir();
        let state = AppState::new(&config_for(dir.path(), "/plugin/"));

        let (status, _, body) = get(create_router(state.clone()), "/plugin/bundle.js").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"var SDPlugin = {};");

        let (status, _, _) = get(create_router(state), "/bundle.js").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_build_status() {
        let dir = package_dir();
        let state = AppState::new(&config_for(dir.path(), "/"));
        state.build_status.write().await.builds = 3;

        let (status, _, body) = get(create_router(state), HEALTH_ROUTE).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["publicPath"], "/");
        assert_eq!(json["build"]["builds"], 3);
    }

    #[tokio::test]
    async fn test_port_in_use_fails_fast() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let dir = package_dir();

        let mut config = config_for(dir.path(), "/");
        config.port = port;
        match DevServer::start(config).await {
            Err(ServeError::AddressInUse(addr)) => assert_eq!(addr.port(), port),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("server started on an occupied port"),
        }
    }

    #[tokio::test]
    async fn test_instances_coexist_and_stop() {
        let first_dir = package_dir();
        let second_dir = package_dir();
        fs::write(second_dir.path().join("bundle.js"), "second").unwrap();

        let first = DevServer::start(config_for(first_dir.path(), "/")).await.unwrap();
        let second = DevServer::start(config_for(second_dir.path(), "/")).await.unwrap();
        assert_ne!(first.local_addr(), second.local_addr());

        let body = reqwest::get(format!("{}bundle.js", second.url()))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "second");

        let addr = first.local_addr();
        first.stop().await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        second.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_keep_alive_connections() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = package_dir();
        let server = DevServer::start(config_for(dir.path(), "/")).await.unwrap();
        let request = b"GET /bundle.js HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n";

        let mut stream = tokio::net::TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"HTTP/1.1 200"));

        server.stop().await;

        // The same connection must not be served again
        let _ = stream.write_all(request).await;
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("connection still open after stop");
        assert!(matches!(read, Ok(0) | Err(_)), "served after stop: {:?}", read);
    }

    #[tokio::test]
    async fn test_rebuild_is_served_without_restart() {
        let project = TempDir::new().unwrap();
        fs::create_dir_all(project.path().join("src")).unwrap();
        let entry = project.path().join("src/App.fs.js");
        fs::write(&entry, "export const version = \"one\";\n").unwrap();

        let mut pack = PackConfig {
            entry: PathBuf::from("./src/App.fs.js"),
            ..Default::default()
        };
        pack.output.path = PathBuf::from("./bin/com.example.test.sdPlugin");
        pack.output.library = Some(LibraryConfig {
            name: "SDPlugin".to_string(),
            kind: LibraryType::Var,
        });
        pack.dev_server.port = 0;
        let config = pack.resolve(project.path()).unwrap();

        sdpack_core::bundle(&config).unwrap();
        let server = DevServer::start(ServerConfig::from(&config.dev_server))
            .await
            .unwrap();
        let url = format!("{}bundle.js", server.url());

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.text().await.unwrap().contains("\"one\""));

        fs::write(&entry, "export const version = \"two\";\n").unwrap();
        sdpack_core::bundle(&config).unwrap();

        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert!(body.contains("\"two\""));
        assert!(!body.contains("\"one\""));

        let missing = reqwest::get(format!("{}missing.js", server.url())).await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        server.stop().await;
    }
}
