use actix_multipart::{Field, Multipart, MultipartError};
use actix_web::{HttpRequest, HttpResponse, http::header, web};
use futures::TryStreamExt;
use shared::{HealthReport, PredictionResponse, RootResponse, ServiceStatus};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::classifier::model::{as_probabilities, top_class};
use crate::classifier::preprocess::preprocess;
use crate::classifier::{ClassLabels, Classifier, InferenceError, ModelHolder};
use crate::error::ApiError;
use crate::limiter::RateLimitMiddleware;
use crate::upload::{UploadLimits, UploadValidator, UploadedFile, content_hash, short_hash};
use image::DynamicImage;

/// Multipart field that carries the image.
pub const FILE_FIELD: &str = "file";

const SERVICE_NAME: &str = "Traffic Sign Recognition API";

pub fn configure_routes(cfg: &mut web::ServiceConfig, rate_limit: RateLimitMiddleware) {
    cfg.service(web::resource("/").route(web::get().to(root)))
        .service(web::resource("/health").route(web::get().to(health)))
        .service(
            web::resource("/predict")
                .wrap(rate_limit)
                .route(web::post().to(predict)),
        );
}

async fn root() -> HttpResponse {
    HttpResponse::Ok().json(RootResponse {
        message: format!("{SERVICE_NAME} is running"),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn health(
    holder: web::Data<ModelHolder>,
    validator: web::Data<UploadValidator>,
) -> HttpResponse {
    HttpResponse::Ok().json(health_report(&holder, validator.limits()))
}

/// Derived from the model state alone; cannot fail.
pub fn health_report(holder: &ModelHolder, limits: &UploadLimits) -> HealthReport {
    let model_error = holder.load_error().map(|e| e.to_string());
    let status = if holder.is_loaded() {
        ServiceStatus::Healthy
    } else {
        ServiceStatus::Degraded
    };

    HealthReport {
        status,
        model_loaded: holder.is_loaded(),
        model_error,
        supported_formats: limits.allowed_extensions.iter().cloned().collect(),
        max_file_size: limits.max_file_size,
        max_file_size_mb: round_to(limits.max_file_size as f64 / (1024.0 * 1024.0), 2),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

async fn predict(
    req: HttpRequest,
    payload: web::Payload,
    holder: web::Data<ModelHolder>,
    labels: web::Data<ClassLabels>,
    validator: web::Data<UploadValidator>,
) -> Result<HttpResponse, ApiError> {
    let started = Instant::now();
    let request_id = Uuid::new_v4();

    let outcome = run_prediction(&req, payload, &holder, &labels, validator, started).await;
    match &outcome {
        Ok(prediction) => log::info!(
            "[{}] file={} class={} confidence={:.4} took={:.2}ms",
            request_id,
            prediction.file_hash,
            prediction.class_id,
            prediction.confidence,
            prediction.processing_time_ms
        ),
        Err(ApiError::Internal(e)) => log::error!("[{}] prediction failed: {}", request_id, e),
        Err(e) => log::warn!("[{}] prediction refused: {}", request_id, e),
    }

    outcome.map(|prediction| HttpResponse::Ok().json(prediction))
}

async fn run_prediction(
    req: &HttpRequest,
    payload: web::Payload,
    holder: &ModelHolder,
    labels: &ClassLabels,
    validator: web::Data<UploadValidator>,
    started: Instant,
) -> Result<PredictionResponse, ApiError> {
    // Checked before the body is read so a degraded service does no work.
    let classifier = holder
        .classifier()
        .map_err(|e| ApiError::ModelUnavailable(e.to_string()))?;

    let multipart = Multipart::new(req.headers(), payload);
    let upload = read_upload(multipart, validator.limits().max_file_size).await?;
    let digest = content_hash(&upload.bytes);

    // Decoding and the forward pass both run off the async workers.
    let scores = web::block(move || -> Result<Vec<f32>, ApiError> {
        let validated = validator.validate(&upload)?;
        log::debug!(
            "{} upload {}x{} ({} bytes) passed validation",
            validated.signature.name(),
            validated.width,
            validated.height,
            upload.measured_size()
        );
        Ok(infer(classifier, &validated.image)?)
    })
    .await
    .map_err(|_| InferenceError::Cancelled)??;

    let probabilities = as_probabilities(scores);
    let (class_id, confidence) = top_class(&probabilities, labels.num_classes())?;

    Ok(PredictionResponse {
        class_id,
        label: labels.label(class_id).to_string(),
        confidence: (confidence * 10_000.0).round() / 10_000.0,
        processing_time_ms: round_to(started.elapsed().as_secs_f64() * 1000.0, 2),
        file_hash: short_hash(&digest).to_string(),
    })
}

fn infer(classifier: Arc<dyn Classifier>, image: &DynamicImage) -> Result<Vec<f32>, InferenceError> {
    let batch = preprocess(image);
    classifier.predict(&batch)
}

/// Pulls the `file` field out of the form. Reading stops one byte past
/// `max_size` so oversized uploads are never buffered whole; the validator
/// rejects them on the measured size.
async fn read_upload(mut multipart: Multipart, max_size: usize) -> Result<UploadedFile, ApiError> {
    while let Some(field) = multipart.try_next().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        return read_field(field, max_size).await;
    }
    Err(ApiError::MissingFile(FILE_FIELD))
}

async fn read_field(mut field: Field, max_size: usize) -> Result<UploadedFile, ApiError> {
    let filename = field
        .content_disposition()
        .and_then(|cd| cd.get_filename())
        .map(str::to_owned);
    let content_type = field.content_type().map(|m| m.essence_str().to_owned());
    let declared_size = field
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok());

    let mut bytes = Vec::new();
    while let Some(chunk) = field.try_next().await.map_err(multipart_error)? {
        bytes.extend_from_slice(&chunk);
        if bytes.len() > max_size {
            bytes.truncate(max_size + 1);
            break;
        }
    }

    Ok(UploadedFile {
        filename,
        content_type,
        declared_size,
        bytes,
    })
}

fn multipart_error(err: MultipartError) -> ApiError {
    match err {
        MultipartError::ContentTypeMissing
        | MultipartError::ContentTypeParse
        | MultipartError::ContentTypeIncompatible => ApiError::MissingFile(FILE_FIELD),
        other => ApiError::MalformedBody(other.to_string()),
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::labels::NUM_CLASSES;
    use crate::classifier::model::{LoadError, ModelState};
    use crate::limiter::RateLimit;
    use actix_web::{App, http::StatusCode, test as actix_test};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use ndarray::Array4;
    use shared::ErrorResponse;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BOUNDARY: &str = "signlens-test-boundary";
    const MIB: usize = 1024 * 1024;

    /// Returns a fixed score vector and counts how often it was asked.
    struct FakeClassifier {
        scores: Vec<f32>,
        calls: Arc<AtomicUsize>,
    }

    impl Classifier for FakeClassifier {
        fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
            assert_eq!(input.shape(), &[1, 30, 30, 3]);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.scores.clone())
        }
    }

    struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn predict(&self, _input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
            Err(InferenceError::Model("CUDA error: device-side assert at layer dense_1".into()))
        }
    }

    fn one_hot(class_id: usize) -> Vec<f32> {
        let mut scores = vec![0.0; NUM_CLASSES];
        scores[class_id] = 1.0;
        scores
    }

    fn loaded(classifier: impl Classifier + 'static) -> ModelHolder {
        ModelHolder::with_state("fake.onnx", ModelState::Loaded(Arc::new(classifier)))
    }

    fn not_loaded() -> ModelHolder {
        ModelHolder::with_state(
            "missing.onnx",
            ModelState::NotLoaded(LoadError::NotFound(PathBuf::from("missing.onnx"))),
        )
    }

    fn validator() -> UploadValidator {
        UploadValidator::new(UploadLimits::new(
            10 * MIB,
            ["png", "jpg", "jpeg", "webp"].map(String::from),
        ))
    }

    macro_rules! service {
        ($holder:expr) => {
            service!($holder, RateLimit::per_minute(1000))
        };
        ($holder:expr, $limit:expr) => {{
            let rate_limit = RateLimitMiddleware::new($limit);
            actix_test::init_service(
                App::new()
                    .app_data(web::Data::new($holder))
                    .app_data(web::Data::new(ClassLabels::traffic_signs()))
                    .app_data(web::Data::new(validator()))
                    .configure(|cfg| configure_routes(cfg, rate_limit)),
            )
            .await
        }};
    }

    fn red_png() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 100, Rgb([255, 0, 0])));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn multipart_body(field: &str, filename: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(filename: &str, content_type: &str, data: &[u8]) -> actix_test::TestRequest {
        actix_test::TestRequest::post()
            .uri("/predict")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(multipart_body(FILE_FIELD, filename, content_type, data))
    }

    #[actix_web::test]
    async fn root_reports_name_and_version() {
        let app = service!(not_loaded());
        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: RootResponse = actix_test::read_body_json(resp).await;
        assert!(body.message.contains(SERVICE_NAME));
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
    }

    #[actix_web::test]
    async fn health_is_healthy_with_a_model() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = service!(loaded(FakeClassifier {
            scores: one_hot(1),
            calls: calls.clone(),
        }));
        let resp =
            actix_test::call_service(&app, actix_test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: HealthReport = actix_test::read_body_json(resp).await;
        assert_eq!(body.status, ServiceStatus::Healthy);
        assert!(body.model_loaded);
        assert_eq!(body.model_error, None);
        assert_eq!(body.supported_formats, vec!["jpeg", "jpg", "png", "webp"]);
        assert_eq!(body.max_file_size, 10 * MIB);
        assert_eq!(body.max_file_size_mb, 10.0);
        assert!(!body.timestamp.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn health_is_degraded_without_a_model() {
        let app = service!(not_loaded());
        let resp =
            actix_test::call_service(&app, actix_test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: HealthReport = actix_test::read_body_json(resp).await;
        assert_eq!(body.status, ServiceStatus::Degraded);
        assert!(!body.model_loaded);
        assert!(body.model_error.unwrap().contains("missing.onnx"));
    }

    #[actix_web::test]
    async fn predicts_a_red_png() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = service!(loaded(FakeClassifier {
            scores: one_hot(14),
            calls: calls.clone(),
        }));
        let png = red_png();

        let resp = actix_test::call_service(&app, upload_request("test.png", "image/png", &png).to_request())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: PredictionResponse = actix_test::read_body_json(resp).await;

        assert_eq!(body.class_id, 14);
        assert_eq!(body.label, "Stop");
        assert_eq!(body.confidence, 1.0);
        assert!(body.class_id < NUM_CLASSES);
        assert!((0.0..=1.0).contains(&body.confidence));
        assert!(body.processing_time_ms >= 0.0);
        assert_eq!(body.file_hash.len(), 8);
        assert!(body.file_hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(content_hash(&png).starts_with(&body.file_hash));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn logits_are_reported_as_probabilities() {
        let mut scores = vec![-2.0; NUM_CLASSES];
        scores[3] = 8.0;
        scores[7] = 8.0;
        let app = service!(loaded(FakeClassifier {
            scores,
            calls: Arc::new(AtomicUsize::new(0)),
        }));

        let resp =
            actix_test::call_service(&app, upload_request("a.png", "image/png", &red_png()).to_request())
                .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: PredictionResponse = actix_test::read_body_json(resp).await;
        assert_eq!(body.class_id, 3);
        assert!(body.confidence > 0.0 && body.confidence <= 0.5);
    }

    #[actix_web::test]
    async fn text_file_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = service!(loaded(FakeClassifier {
            scores: one_hot(0),
            calls: calls.clone(),
        }));
        let req = upload_request("test.txt", "text/plain", b"This is not an image").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = actix_test::read_body_json(resp).await;
        assert_eq!(body.error, "Invalid file type");
        assert!(body.details.contains("not allowed"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn oversized_upload_is_rejected() {
        let app = service!(loaded(FakeClassifier {
            scores: one_hot(0),
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        let large = vec![b'0'; 11 * MIB];
        let resp =
            actix_test::call_service(&app, upload_request("large.png", "image/png", &large).to_request())
                .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = actix_test::read_body_json(resp).await;
        assert!(body.error.contains("File too large"));
    }

    #[actix_web::test]
    async fn spoofed_png_is_rejected() {
        let app = service!(loaded(FakeClassifier {
            scores: one_hot(0),
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        let resp = actix_test::call_service(
            &app,
            upload_request("sign.png", "image/png", b"GIF89a fake").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = actix_test::read_body_json(resp).await;
        assert_eq!(body.error, "Invalid file signature");
    }

    #[actix_web::test]
    async fn truncated_png_is_an_invalid_file() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = service!(loaded(FakeClassifier {
            scores: one_hot(0),
            calls: calls.clone(),
        }));
        let mut png = red_png();
        png.truncate(60);

        let resp = actix_test::call_service(
            &app,
            upload_request("cut.png", "image/png", &png).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = actix_test::read_body_json(resp).await;
        assert_eq!(body.error, "Invalid file");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn request_without_body_is_unprocessable() {
        let app = service!(loaded(FakeClassifier {
            scores: one_hot(0),
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        let resp =
            actix_test::call_service(&app, actix_test::TestRequest::post().uri("/predict").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[actix_web::test]
    async fn form_without_file_field_is_unprocessable() {
        let app = service!(loaded(FakeClassifier {
            scores: one_hot(0),
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        let req = actix_test::TestRequest::post()
            .uri("/predict")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(multipart_body("image", "a.png", "image/png", &red_png()))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[actix_web::test]
    async fn missing_model_returns_503_without_reading_the_upload() {
        let app = service!(not_loaded());
        for req in [
            upload_request("test.png", "image/png", &red_png()).to_request(),
            upload_request("test.txt", "text/plain", b"hello").to_request(),
            actix_test::TestRequest::post().uri("/predict").to_request(),
        ] {
            let resp = actix_test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
            let body: ErrorResponse = actix_test::read_body_json(resp).await;
            assert_eq!(body.error, "Model not loaded");
            assert!(body.suggestion.is_some());
        }
    }

    #[actix_web::test]
    async fn inference_failure_is_a_generic_500() {
        let app = service!(loaded(FailingClassifier));
        let resp =
            actix_test::call_service(&app, upload_request("a.png", "image/png", &red_png()).to_request())
                .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = actix_test::read_body_json(resp).await;
        assert_eq!(body.error, "Internal server error");
        assert!(!body.details.contains("dense_1"));
        assert!(!body.details.contains("CUDA"));
    }

    #[actix_web::test]
    async fn wrong_output_width_is_a_500() {
        let app = service!(loaded(FakeClassifier {
            scores: vec![0.5, 0.5],
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        let resp =
            actix_test::call_service(&app, upload_request("a.png", "image/png", &red_png()).to_request())
                .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[actix_web::test]
    async fn eleventh_prediction_in_a_minute_is_rate_limited() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = service!(
            loaded(FakeClassifier {
                scores: one_hot(2),
                calls: calls.clone(),
            }),
            RateLimit::per_minute(10)
        );
        let png = red_png();

        for i in 0..10 {
            let resp =
                actix_test::call_service(&app, upload_request("a.png", "image/png", &png).to_request())
                    .await;
            assert_eq!(resp.status(), StatusCode::OK, "request {}", i + 1);
        }

        let resp =
            actix_test::call_service(&app, upload_request("a.png", "image/png", &png).to_request()).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(calls.load(Ordering::SeqCst), 10);

        let other_client = upload_request("a.png", "image/png", &png)
            .peer_addr("203.0.113.9:40000".parse().unwrap())
            .to_request();
        let resp = actix_test::call_service(&app, other_client).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn rate_limit_does_not_apply_to_health() {
        let app = service!(not_loaded(), RateLimit::per_minute(1));
        for _ in 0..5 {
            let resp =
                actix_test::call_service(&app, actix_test::TestRequest::get().uri("/health").to_request())
                    .await;
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[test]
    fn rounding_helper() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(9.765625, 2), 9.77);
    }
}
