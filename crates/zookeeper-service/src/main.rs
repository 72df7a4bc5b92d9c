use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use clap::Parser;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;
use zookeeper_api::{AnimalCatalog, CatalogError};
use zookeeper_core::{Animal, CoreError, FilterCriteria, FIELD_PERSONALITY_TRAITS};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    catalog: AnimalCatalog,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    animals: usize,
}

#[derive(Debug, Parser)]
#[command(name = "zookeeper-service")]
#[command(about = "HTTP service for the zookeeper animal catalog")]
struct Args {
    #[arg(long, env = "ZOOKEEPER_DATA", default_value = "./data/animals.json")]
    data: PathBuf,
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,
    #[arg(long, env = "PORT", default_value_t = 3001)]
    port: u16,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

impl From<CatalogError> for ServiceError {
    fn from(err: CatalogError) -> Self {
        let status = match &err {
            CatalogError::Validation(_) => StatusCode::BAD_REQUEST,
            CatalogError::NotFound { .. } => StatusCode::NOT_FOUND,
            CatalogError::IdConflict { .. } => StatusCode::CONFLICT,
            CatalogError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/openapi", get(openapi))
        .route("/api/animals", get(list_animals).post(create_animal))
        .route("/api/animals/:id", get(get_animal))
        .with_state(state)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let catalog = AnimalCatalog::open(&args.data)
        .with_context(|| format!("failed to load animals from {}", args.data.display()))?;
    tracing::info!(path = %args.data.display(), animals = catalog.len(), "catalog ready");

    let bind = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(%bind, "API server listening");

    axum::serve(listener, app(ServiceState { catalog }))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}

async fn health(State(state): State<ServiceState>) -> Result<Json<HealthResponse>, ServiceError> {
    let animals = with_catalog(&state, "health", AnimalCatalog::len).await?;
    Ok(Json(HealthResponse { status: "ok", animals }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn list_animals(
    State(state): State<ServiceState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<Animal>>, ServiceError> {
    let criteria = FilterCriteria::from_pairs(pairs);
    tracing::debug!(?criteria, "listing animals");
    let animals = with_catalog(&state, "list", move |catalog| catalog.list(&criteria)).await?;
    tracing::debug!(matched = animals.len(), "listed animals");
    Ok(Json(animals))
}

async fn get_animal(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<Animal>, ServiceError> {
    let animal = with_catalog(&state, "get", move |catalog| catalog.get(&id)).await??;
    Ok(Json(animal))
}

async fn create_animal(
    State(state): State<ServiceState>,
    request: Request,
) -> Result<Json<Animal>, ServiceError> {
    let body = candidate_body(request, &state).await?;
    let animal =
        with_catalog(&state, "create", move |catalog| catalog.create_from_value(body)).await??;
    Ok(Json(animal))
}

/// Run a catalog operation on the blocking pool. Reads wait on the catalog lock, which a create
/// holds through the file rewrite.
async fn with_catalog<T, F>(
    state: &ServiceState,
    operation: &'static str,
    f: F,
) -> Result<T, ServiceError>
where
    F: FnOnce(&AnimalCatalog) -> T + Send + 'static,
    T: Send + 'static,
{
    let catalog = state.catalog.clone();
    tokio::task::spawn_blocking(move || f(&catalog)).await.map_err(|err| {
        tracing::error!(operation, error = %err, "catalog task failed");
        ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{operation} task failed"))
    })
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum BodyKind {
    Json,
    Form,
    Unsupported,
}

fn body_kind(request: &Request) -> BodyKind {
    let Some(content_type) =
        request.headers().get(header::CONTENT_TYPE).and_then(|value| value.to_str().ok())
    else {
        return BodyKind::Unsupported;
    };
    let essence = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    if essence == "application/x-www-form-urlencoded" {
        BodyKind::Form
    } else if essence == "application/json"
        || (essence.starts_with("application/") && essence.ends_with("+json"))
    {
        BodyKind::Json
    } else {
        BodyKind::Unsupported
    }
}

/// A body that never parses is rejected the same way as a malformed animal.
fn unparsable_body(reason: String) -> ServiceError {
    tracing::info!(reason = %reason, "rejected unparsable animal body");
    ServiceError::from(CatalogError::Validation(CoreError::validation(reason)))
}

/// Decode the create body into an untyped candidate. A missing or unsupported content type
/// yields an empty object, which the validator then rejects.
async fn candidate_body(request: Request, state: &ServiceState) -> Result<Value, ServiceError> {
    match body_kind(&request) {
        BodyKind::Form => {
            let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, state)
                .await
                .map_err(|rejection| unparsable_body(rejection.body_text()))?;
            Ok(form_candidate(pairs))
        }
        BodyKind::Json => {
            let bytes = Bytes::from_request(request, state)
                .await
                .map_err(|rejection| ServiceError::new(rejection.status(), rejection.body_text()))?;
            serde_json::from_slice(&bytes)
                .map_err(|err| unparsable_body(format!("request body is not valid JSON: {err}")))
        }
        BodyKind::Unsupported => Ok(Value::Object(Map::new())),
    }
}

/// Fold urlencoded pairs into a candidate object. `personalityTraits[]`, or a repeated
/// `personalityTraits`, becomes a list; a single plain `personalityTraits` stays a string.
/// Any other repeated key also becomes a list.
fn form_candidate(pairs: Vec<(String, String)>) -> Value {
    let mut fields = Map::new();
    let mut traits = Vec::new();
    let mut bracketed = false;

    for (key, value) in pairs {
        match key.as_str() {
            FIELD_PERSONALITY_TRAITS => traits.push(value),
            "personalityTraits[]" => {
                bracketed = true;
                traits.push(value);
            }
            _ => append_form_value(&mut fields, key, value),
        }
    }

    let traits_value = match traits.len() {
        0 if !bracketed => None,
        1 if !bracketed => traits.pop().map(Value::String),
        _ => Some(Value::Array(traits.into_iter().map(Value::String).collect())),
    };
    if let Some(traits_value) = traits_value {
        fields.insert(FIELD_PERSONALITY_TRAITS.to_string(), traits_value);
    }

    Value::Object(fields)
}

fn append_form_value(fields: &mut Map<String, Value>, key: String, value: String) {
    match fields.get_mut(&key) {
        Some(Value::Array(values)) => values.push(Value::String(value)),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, Value::String(value)]);
        }
        None => {
            fields.insert(key, Value::String(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request as HttpRequest;
    use tower::ServiceExt;
    use zookeeper_core::{AnimalId, INVALID_ANIMAL_MESSAGE};
    use zookeeper_store_json::{JsonFileStore, Persistence};

    fn unique_temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("zookeeper-service-{}", ulid::Ulid::new()))
            .join("animals.json")
    }

    fn cleanup(path: &std::path::Path) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    fn mk_animal(id: &str, name: &str, species: &str, diet: &str, traits: &[&str]) -> Animal {
        Animal {
            id: AnimalId::from(id),
            name: name.to_string(),
            species: species.to_string(),
            diet: diet.to_string(),
            personality_traits: traits.iter().map(ToString::to_string).collect(),
        }
    }

    fn seeded_router(path: &std::path::Path) -> Router {
        let seed = vec![
            mk_animal("0", "Sarah", "bear", "omnivore", &["hungry", "rash"]),
            mk_animal("1", "Noel", "fox", "omnivore", &["quirky", "rash", "rare"]),
            mk_animal("2", "Erica", "gorilla", "omnivore", &["quirky", "rare"]),
        ];
        if let Err(err) = JsonFileStore::new(path).save(&seed) {
            panic!("failed to seed animals file: {err:#}");
        }
        let catalog = match AnimalCatalog::open(path) {
            Ok(catalog) => catalog,
            Err(err) => panic!("failed to open seeded catalog: {err:#}"),
        };
        app(ServiceState { catalog })
    }

    async fn send(router: &Router, request: HttpRequest<Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn get_request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn post_request(content_type: &str, body: String) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri("/api/animals")
            .method("POST")
            .header("content-type", content_type)
            .body(Body::from(body))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn post_without_content_type(body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri("/api/animals")
            .method("POST")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn assert_invalid_animal(response: Response) {
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value.get("error").and_then(Value::as_str), Some(INVALID_ANIMAL_MESSAGE));
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    fn names(value: &Value) -> Vec<String> {
        value
            .as_array()
            .unwrap_or_else(|| panic!("expected JSON array, got {value}"))
            .iter()
            .filter_map(|animal| animal.get("name").and_then(Value::as_str))
            .map(ToString::to_string)
            .collect()
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let path = unique_temp_path();
        let router = seeded_router(&path);

        let response = send(&router, get_request("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value.get("status").and_then(Value::as_str), Some("ok"));
        assert_eq!(value.get("animals").and_then(Value::as_u64), Some(3));

        cleanup(&path);
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let path = unique_temp_path();
        let router = seeded_router(&path);

        let response = send(&router, get_request("/openapi")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("/api/animals/{id}"));

        cleanup(&path);
    }

    #[tokio::test]
    async fn list_without_query_returns_every_animal() {
        let path = unique_temp_path();
        let router = seeded_router(&path);

        let response = send(&router, get_request("/api/animals")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(names(&response_json(response).await), vec!["Sarah", "Noel", "Erica"]);

        cleanup(&path);
    }

    #[tokio::test]
    async fn list_applies_repeated_traits_and_scalar_filters() {
        let path = unique_temp_path();
        let router = seeded_router(&path);

        let response = send(
            &router,
            get_request("/api/animals?personalityTraits=quirky&personalityTraits=rare"),
        )
        .await;
        assert_eq!(names(&response_json(response).await), vec!["Noel", "Erica"]);

        let response =
            send(&router, get_request("/api/animals?personalityTraits%5B%5D=rash&species=fox")).await;
        assert_eq!(names(&response_json(response).await), vec!["Noel"]);

        let response = send(&router, get_request("/api/animals?diet=carnivore&color=red")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(names(&response_json(response).await).is_empty());

        cleanup(&path);
    }

    #[tokio::test]
    async fn list_with_repeated_scalar_key_matches_nothing() {
        let path = unique_temp_path();
        let router = seeded_router(&path);

        let response = send(&router, get_request("/api/animals?name=Noel&name=Erica")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(names(&response_json(response).await).is_empty());

        let response = send(&router, get_request("/api/animals?name=Noel")).await;
        assert_eq!(names(&response_json(response).await), vec!["Noel"]);

        cleanup(&path);
    }

    #[tokio::test]
    async fn get_by_id_returns_animal_or_not_found() {
        let path = unique_temp_path();
        let router = seeded_router(&path);

        let response = send(&router, get_request("/api/animals/1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value.get("name").and_then(Value::as_str), Some("Noel"));

        let response = send(&router, get_request("/api/animals/99")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );

        cleanup(&path);
    }

    #[tokio::test]
    async fn create_json_animal_persists_and_is_retrievable() {
        let path = unique_temp_path();
        let router = seeded_router(&path);
        let payload = serde_json::json!({
            "name": "Mia",
            "species": "cat",
            "diet": "carnivore",
            "personalityTraits": ["independent"]
        });

        let response = send(&router, post_request("application/json", payload.to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let created = response_json(response).await;
        assert_eq!(created.get("id").and_then(Value::as_str), Some("3"));

        let response = send(&router, get_request("/api/animals/3")).await;
        assert_eq!(response_json(response).await, created);

        let response = send(&router, get_request("/api/animals?species=cat")).await;
        assert_eq!(names(&response_json(response).await), vec!["Mia"]);

        let persisted = match JsonFileStore::new(&path).load() {
            Ok(animals) => animals,
            Err(err) => panic!("failed to reload animals file: {err:#}"),
        };
        assert_eq!(persisted.len(), 4);

        cleanup(&path);
    }

    #[tokio::test]
    async fn create_rejects_malformed_animal_with_fixed_message() {
        let path = unique_temp_path();
        let router = seeded_router(&path);
        let before = std::fs::read(&path).unwrap_or_else(|err| panic!("read failed: {err}"));
        let payload = serde_json::json!({
            "name": "Mia",
            "species": "cat",
            "diet": 4,
            "personalityTraits": ["independent"]
        });

        let response = send(&router, post_request("application/json", payload.to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value.get("error").and_then(Value::as_str), Some(INVALID_ANIMAL_MESSAGE));

        let after = std::fs::read(&path).unwrap_or_else(|err| panic!("read failed: {err}"));
        assert_eq!(before, after);

        cleanup(&path);
    }

    #[tokio::test]
    async fn create_accepts_urlencoded_form_with_bracketed_traits() {
        let path = unique_temp_path();
        let router = seeded_router(&path);
        let body = "name=Mia&species=cat&diet=carnivore&personalityTraits%5B%5D=independent"
            .to_string();

        let response =
            send(&router, post_request("application/x-www-form-urlencoded", body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let created = response_json(response).await;
        assert_eq!(created.get("id").and_then(Value::as_str), Some("3"));
        assert_eq!(created.get("personalityTraits"), Some(&serde_json::json!(["independent"])));

        cleanup(&path);
    }

    #[tokio::test]
    async fn create_rejects_form_with_single_plain_trait() {
        let path = unique_temp_path();
        let router = seeded_router(&path);
        let body = "name=Mia&species=cat&diet=carnivore&personalityTraits=independent".to_string();

        let response =
            send(&router, post_request("application/x-www-form-urlencoded", body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        cleanup(&path);
    }

    #[tokio::test]
    async fn create_rejects_unparsed_bodies_with_fixed_message() {
        let path = unique_temp_path();
        let router = seeded_router(&path);
        let before = std::fs::read(&path).unwrap_or_else(|err| panic!("read failed: {err}"));
        let payload = serde_json::json!({
            "name": "Mia",
            "species": "cat",
            "diet": "carnivore",
            "personalityTraits": ["independent"]
        })
        .to_string();

        let requests = vec![
            post_without_content_type(&payload),
            post_request("text/plain", payload),
            post_request("application/json", "{bad".to_string()),
            post_request("application/json", String::new()),
        ];
        for request in requests {
            assert_invalid_animal(send(&router, request).await).await;
        }

        let after = std::fs::read(&path).unwrap_or_else(|err| panic!("read failed: {err}"));
        assert_eq!(before, after);

        cleanup(&path);
    }

    #[tokio::test]
    async fn create_rejects_form_with_repeated_scalar_field() {
        let path = unique_temp_path();
        let router = seeded_router(&path);
        let before = std::fs::read(&path).unwrap_or_else(|err| panic!("read failed: {err}"));
        let body = "name=Mia&name=Lola&species=cat&diet=carnivore&personalityTraits%5B%5D=independent"
            .to_string();

        let response =
            send(&router, post_request("application/x-www-form-urlencoded", body)).await;
        assert_invalid_animal(response).await;

        let after = std::fs::read(&path).unwrap_or_else(|err| panic!("read failed: {err}"));
        assert_eq!(before, after);

        cleanup(&path);
    }

    #[test]
    fn form_candidate_turns_repeated_scalar_keys_into_lists() {
        let value = form_candidate(vec![
            ("name".to_string(), "Mia".to_string()),
            ("name".to_string(), "Lola".to_string()),
            ("diet".to_string(), "carnivore".to_string()),
            ("diet".to_string(), "fish".to_string()),
            ("diet".to_string(), "mice".to_string()),
        ]);
        assert_eq!(
            value,
            serde_json::json!({ "name": ["Mia", "Lola"], "diet": ["carnivore", "fish", "mice"] })
        );
    }

    #[test]
    fn form_candidate_groups_repeated_traits() {
        let value = form_candidate(vec![
            ("name".to_string(), "Mia".to_string()),
            ("personalityTraits".to_string(), "independent".to_string()),
            ("personalityTraits".to_string(), "curious".to_string()),
        ]);
        assert_eq!(
            value,
            serde_json::json!({ "name": "Mia", "personalityTraits": ["independent", "curious"] })
        );

        let value = form_candidate(vec![("personalityTraits[]".to_string(), String::new())]);
        assert_eq!(value, serde_json::json!({ "personalityTraits": [""] }));
    }

    #[test]
    fn catalog_errors_map_to_http_statuses() {
        let not_found = ServiceError::from(CatalogError::NotFound { id: "7".to_string() });
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let conflict = ServiceError::from(CatalogError::IdConflict { id: AnimalId::from("1") });
        assert_eq!(conflict.status, StatusCode::CONFLICT);

        let persistence =
            ServiceError::from(CatalogError::Persistence(anyhow::anyhow!("disk full")));
        assert_eq!(persistence.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(persistence.error.contains("disk full"));
    }
}
