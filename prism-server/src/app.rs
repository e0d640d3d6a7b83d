use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use prism_core::{
    Error, GenerationRequest, LoadFn, ModelHandle, DIMENSION_RANGE, DIMENSION_STEP,
    GUIDANCE_SCALE_RANGE, NUM_OUTPUTS_RANGE, RANDOM_SEED, STEPS_RANGE,
};
use serde::Serialize;
use serde_json::json;
use std::{io::Cursor, sync::Arc};

/// Application state: the lock-guarded model slot plus the loader used to
/// fill it. The loader is passed in so the binary wires up the hub-backed
/// pipeline while tests substitute stubs.
pub struct AppState {
    handle: ModelHandle,
    load: LoadFn,
}

impl AppState {
    pub fn new(handle: ModelHandle, load: LoadFn) -> Self {
        Self { handle, load }
    }

    /// Warms the model slot. A failure here is not fatal; the first request
    /// retries the load.
    pub async fn preload(&self) -> Result<(), Error> {
        self.handle.get_or_load(&self.load).await.map(|_| ())
    }
}

pub fn router(state: Arc<AppState>, show_api: bool) -> Router {
    let mut app = Router::new()
        .route("/run/predict", post(predict_handler))
        .route("/healthz", get(health_handler));
    if show_api {
        app = app.route("/info", get(info_handler));
    }
    app.with_state(state)
}

#[derive(Serialize)]
struct PredictResponse {
    images: Vec<String>,
    seed: u32,
}

/// Converts an image into a base64-encoded PNG for the response gallery.
fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidParameter(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<PredictResponse>, ApiError> {
    // Boundary validation happens before the adapter ever sees the request.
    request.validate()?;

    let result = state.handle.generate(request, || (state.load)()).await?;
    let images = result
        .images
        .iter()
        .map(image_to_base64_png)
        .collect::<Result<Vec<_>>>()
        .map_err(|e| {
            tracing::error!("failed to encode generated image: {e:#}");
            Error::Generation(format!("{e:#}"))
        })?;

    Ok(Json(PredictResponse {
        images,
        seed: result.seed,
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "model_loaded": state.handle.is_loaded().await,
    }))
}

/// Self-description of the prediction operation, mirroring the parameter
/// widgets of the demo UI. Mounted only when API docs are enabled.
async fn info_handler() -> Json<serde_json::Value> {
    Json(json!({
        "name": "predict",
        "route": "/run/predict",
        "output": "gallery of base64-encoded PNG images",
        "parameters": [
            { "name": "prompt", "type": "string", "required": true },
            {
                "name": "negative_prompt",
                "type": "string",
                "default": "low quality, blurry, distorted, bad anatomy, worst quality",
            },
            {
                "name": "guidance_scale",
                "type": "number",
                "minimum": GUIDANCE_SCALE_RANGE.start(),
                "maximum": GUIDANCE_SCALE_RANGE.end(),
                "default": 7.5,
            },
            {
                "name": "steps",
                "type": "integer",
                "minimum": STEPS_RANGE.start(),
                "maximum": STEPS_RANGE.end(),
                "default": 28,
            },
            {
                "name": "width",
                "type": "integer",
                "minimum": DIMENSION_RANGE.start(),
                "maximum": DIMENSION_RANGE.end(),
                "step": DIMENSION_STEP,
                "default": 1024,
            },
            {
                "name": "height",
                "type": "integer",
                "minimum": DIMENSION_RANGE.start(),
                "maximum": DIMENSION_RANGE.end(),
                "step": DIMENSION_STEP,
                "default": 1024,
            },
            {
                "name": "seed",
                "type": "integer",
                "default": RANDOM_SEED,
                "description": "-1 picks a fresh random seed",
            },
            {
                "name": "num_outputs",
                "type": "integer",
                "minimum": NUM_OUTPUTS_RANGE.start(),
                "maximum": NUM_OUTPUTS_RANGE.end(),
                "default": 4,
            },
        ],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use prism_core::{BoxedModel, LoadFuture, ModelLike};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct StubModel;

    impl ModelLike for StubModel {
        fn run(&self, request: &GenerationRequest, _: u32) -> anyhow::Result<Vec<DynamicImage>> {
            Ok((0..request.num_outputs)
                .map(|_| DynamicImage::new_rgb8(8, 8))
                .collect())
        }
    }

    fn stub_state() -> Arc<AppState> {
        let load: LoadFn =
            Box::new(|| -> LoadFuture { Box::pin(async { Ok(Arc::new(StubModel) as BoxedModel) }) });
        Arc::new(AppState::new(ModelHandle::empty(), load))
    }

    fn failing_once_state() -> Arc<AppState> {
        let attempts = Arc::new(AtomicUsize::new(0));
        let load: LoadFn = Box::new(move || -> LoadFuture {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n == 0 {
                    anyhow::bail!("weights download failed")
                }
                Ok(Arc::new(StubModel) as BoxedModel)
            })
        });
        Arc::new(AppState::new(ModelHandle::empty(), load))
    }

    fn post_predict(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/run/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn predict_returns_requested_batch() {
        let app = router(stub_state(), true);
        let response = app
            .oneshot(post_predict(json!({
                "prompt": "a red cube",
                "negative_prompt": "",
                "guidance_scale": 7.5,
                "steps": 28,
                "width": 1024,
                "height": 1024,
                "seed": 42,
                "num_outputs": 1,
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["images"].as_array().unwrap().len(), 1);
        assert_eq!(body["seed"], 42);
    }

    #[tokio::test]
    async fn predict_four_outputs() {
        let app = router(stub_state(), true);
        let response = app
            .oneshot(post_predict(json!({ "prompt": "a red cube", "num_outputs": 4 })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["images"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn out_of_range_parameters_are_rejected() {
        for body in [
            json!({ "prompt": "x", "steps": 9 }),
            json!({ "prompt": "x", "steps": 51 }),
            json!({ "prompt": "x", "guidance_scale": 0.5 }),
            json!({ "prompt": "x", "width": 1000 }),
            json!({ "prompt": "x", "num_outputs": 5 }),
            json!({ "prompt": "x", "seed": -2 }),
        ] {
            let app = router(stub_state(), true);
            let response = app.oneshot(post_predict(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        }
    }

    #[tokio::test]
    async fn load_failure_maps_to_503_and_recovers() {
        let state = failing_once_state();

        let response = router(Arc::clone(&state), true)
            .oneshot(post_predict(json!({ "prompt": "a red cube" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("weights download failed"));

        // the slot stayed empty, so the next request retries and succeeds
        let response = router(state, true)
            .oneshot(post_predict(json!({ "prompt": "a red cube" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn info_route_follows_api_visibility() {
        let get_info = || {
            Request::builder()
                .method("GET")
                .uri("/info")
                .body(Body::empty())
                .unwrap()
        };

        let shown = router(stub_state(), true).oneshot(get_info()).await.unwrap();
        assert_eq!(shown.status(), StatusCode::OK);
        let body = json_body(shown).await;
        assert_eq!(body["name"], "predict");

        let hidden = router(stub_state(), false).oneshot(get_info()).await.unwrap();
        assert_eq!(hidden.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_load_state() {
        let state = stub_state();
        let get_health = || {
            Request::builder()
                .method("GET")
                .uri("/healthz")
                .body(Body::empty())
                .unwrap()
        };

        let response = router(Arc::clone(&state), true)
            .oneshot(get_health())
            .await
            .unwrap();
        assert_eq!(json_body(response).await["model_loaded"], false);

        state.preload().await.unwrap();
        let response = router(state, true).oneshot(get_health()).await.unwrap();
        assert_eq!(json_body(response).await["model_loaded"], true);
    }
}
