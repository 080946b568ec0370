use actix_cors::Cors;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse, ResponseError};
use futures_util::StreamExt;
use tracing::Instrument;
use uuid::Uuid;

use crate::{error::PredictError, models::PredictionResponse, service::InferenceService};

const FILE_FIELD: &str = "file";

/// Largest upload accepted by `/predict`, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimit(pub usize);

pub fn configure(max_upload_bytes: usize) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.service(
            web::resource("/predict")
                .app_data(web::Data::new(UploadLimit(max_upload_bytes)))
                .route(web::post().to(predict)),
        );
    }
}

/// Cross-origin access for a single frontend origin, any method and header.
pub fn cors(allowed_origin: &str) -> Cors {
    Cors::default()
        .allowed_origin(allowed_origin)
        .allow_any_method()
        .allow_any_header()
}

struct Upload {
    filename: String,
    data: Vec<u8>,
}

pub async fn predict(
    service: web::Data<InferenceService>,
    limit: web::Data<UploadLimit>,
    payload: Multipart,
) -> Result<HttpResponse, PredictError> {
    let span = tracing::info_span!("predict", request_id = %Uuid::new_v4());

    let result = async move {
        let upload = read_upload(payload, limit.0).await?;
        tracing::debug!(
            filename = %upload.filename,
            bytes = upload.data.len(),
            "Received upload"
        );

        let span = tracing::Span::current();
        let predictions = web::block(move || {
            let _enter = span.enter();
            service.predict(&upload.data)
        })
        .await
        .map_err(PredictError::internal)??;

        if let Some(top) = predictions.first() {
            tracing::info!(
                class = %top.class_name,
                probability = top.probability,
                "Prediction complete"
            );
        }
        Ok::<_, PredictError>(HttpResponse::Ok().json(PredictionResponse { predictions }))
    }
    .instrument(span)
    .await;

    if let Err(e) = &result {
        if e.status_code().is_server_error() {
            tracing::error!(error = %e, "Prediction failed");
        } else {
            tracing::warn!(error = %e, "Rejected upload");
        }
    }
    result
}

/// Pull the first part named `file` that carries a filename out of the
/// multipart stream. Parts without a filename are plain form fields.
async fn read_upload(mut payload: Multipart, limit: usize) -> Result<Upload, PredictError> {
    while let Some(item) = payload.next().await {
        let mut field = item.map_err(unreadable_body)?;

        let filename = {
            let disposition = field.content_disposition();
            match disposition.get_name() {
                Some(FILE_FIELD) => disposition.get_filename().map(str::to_owned),
                _ => None,
            }
        };

        let Some(filename) = filename else {
            drain(&mut field).await?;
            continue;
        };

        if filename.is_empty() {
            return Err(PredictError::NoFileSelected);
        }

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(unreadable_body)?;
            if data.len() + chunk.len() > limit {
                return Err(PredictError::PayloadTooLarge(limit));
            }
            data.extend_from_slice(&chunk);
        }
        return Ok(Upload { filename, data });
    }

    Err(PredictError::MissingFilePart)
}

async fn drain(field: &mut Field) -> Result<(), PredictError> {
    while let Some(chunk) = field.next().await {
        chunk.map_err(unreadable_body)?;
    }
    Ok(())
}

fn unreadable_body(err: actix_multipart::MultipartError) -> PredictError {
    tracing::debug!(error = %err, "Unreadable multipart body");
    PredictError::MissingFilePart
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::ErrorResponse,
        preprocess::{encode, encode_png, noisy_rgba, truncated_in_pixel_data},
        service::tests::stub_service,
    };
    use actix_web::{
        body::MessageBody,
        dev::ServiceResponse,
        http::{header, StatusCode},
        test, App,
    };
    use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma, Rgba, RgbaImage};

    const BOUNDARY: &str = "----classifier-test-boundary";
    const FRONTEND: &str = "http://localhost:5173";
    const LIMIT: usize = 16 * 1024 * 1024;

    struct Part<'a> {
        name: &'a str,
        filename: Option<&'a str>,
        data: &'a [u8],
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            let disposition = match part.filename {
                Some(f) => format!("form-data; name=\"{}\"; filename=\"{f}\"", part.name),
                None => format!("form-data; name=\"{}\"", part.name),
            };
            body.extend_from_slice(format!("Content-Disposition: {disposition}\r\n").as_bytes());
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
            body.extend_from_slice(part.data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(parts: &[Part<'_>]) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/predict")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(multipart_body(parts))
    }

    fn rgba_png() -> Vec<u8> {
        let img = RgbaImage::from_fn(500, 500, |x, y| {
            Rgba([(x / 2) as u8, (y / 2) as u8, 200, (x % 256) as u8])
        });
        encode_png(DynamicImage::ImageRgba8(img))
    }

    macro_rules! app {
        () => {
            app!(LIMIT)
        };
        ($limit:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new(stub_service()))
                    .wrap(cors(FRONTEND))
                    .configure(configure($limit)),
            )
            .await
        };
    }

    async fn assert_error<B: MessageBody>(
        resp: ServiceResponse<B>,
        status: StatusCode,
        message: &str,
    ) {
        assert_eq!(resp.status(), status);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, message);
    }

    #[actix_rt::test]
    async fn valid_image_returns_five_sorted_predictions() {
        let app = app!();
        let png = rgba_png();
        let req = upload_request(&[Part {
            name: "file",
            filename: Some("photo.png"),
            data: &png,
        }]);

        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: PredictionResponse = test::read_body_json(resp).await;
        assert_eq!(body.predictions.len(), 5);
        assert!(body
            .predictions
            .iter()
            .all(|p| (0.0..=1.0).contains(&p.probability)));
        assert!(body
            .predictions
            .windows(2)
            .all(|w| w[0].probability >= w[1].probability));
    }

    #[actix_rt::test]
    async fn response_uses_class_key() {
        let app = app!();
        let png = rgba_png();
        let req = upload_request(&[Part {
            name: "file",
            filename: Some("photo.png"),
            data: &png,
        }]);

        let body = test::call_and_read_body(&app, req.to_request()).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let first = &json["predictions"][0];
        assert!(first["class"].is_string());
        assert!(first["probability"].is_number());
    }

    #[actix_rt::test]
    async fn repeated_upload_is_idempotent() {
        let app = app!();
        let png = rgba_png();
        let part = || Part {
            name: "file",
            filename: Some("photo.png"),
            data: &png,
        };

        let first = test::call_and_read_body(&app, upload_request(&[part()]).to_request()).await;
        let second = test::call_and_read_body(&app, upload_request(&[part()]).to_request()).await;
        assert_eq!(first, second);
    }

    #[actix_rt::test]
    async fn extra_form_fields_are_ignored() {
        let app = app!();
        let png = rgba_png();
        let req = upload_request(&[
            Part {
                name: "comment",
                filename: None,
                data: b"my cat",
            },
            Part {
                name: "file",
                filename: Some("cat.png"),
                data: &png,
            },
        ]);

        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_rt::test]
    async fn missing_file_part_is_rejected() {
        let app = app!();
        let req = upload_request(&[Part {
            name: "image",
            filename: Some("cat.png"),
            data: &rgba_png(),
        }]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_error(resp, StatusCode::BAD_REQUEST, "No file part in the request").await;
    }

    #[actix_rt::test]
    async fn file_field_without_filename_is_not_a_file_part() {
        let app = app!();
        let req = upload_request(&[Part {
            name: "file",
            filename: None,
            data: b"plain text value",
        }]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_error(resp, StatusCode::BAD_REQUEST, "No file part in the request").await;
    }

    #[actix_rt::test]
    async fn non_multipart_body_is_rejected() {
        let app = app!();
        let req = test::TestRequest::post()
            .uri("/predict")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload(r#"{"file": "cat.png"}"#);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_error(resp, StatusCode::BAD_REQUEST, "No file part in the request").await;
    }

    #[actix_rt::test]
    async fn empty_filename_is_rejected() {
        let app = app!();
        let req = upload_request(&[Part {
            name: "file",
            filename: Some(""),
            data: b"",
        }]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_error(resp, StatusCode::BAD_REQUEST, "No selected file").await;
    }

    #[actix_rt::test]
    async fn text_file_renamed_to_jpg_is_rejected() {
        let app = app!();
        let req = upload_request(&[Part {
            name: "file",
            filename: Some("notes.jpg"),
            data: b"shopping list: milk, eggs, bread\n",
        }]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_error(resp, StatusCode::BAD_REQUEST, "Unidentified image format").await;
    }

    #[actix_rt::test]
    async fn truncated_header_is_rejected() {
        let app = app!();
        let png = encode_png(DynamicImage::ImageRgba8(noisy_rgba(64, 64)));
        let req = upload_request(&[Part {
            name: "file",
            filename: Some("broken.png"),
            data: &png[..40],
        }]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_error(resp, StatusCode::BAD_REQUEST, "Unidentified image format").await;
    }

    #[actix_rt::test]
    async fn truncated_pixel_data_is_an_internal_error() {
        let app = app!();
        let png = truncated_in_pixel_data();
        let req = upload_request(&[Part {
            name: "file",
            filename: Some("broken.png"),
            data: &png,
        }]);

        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert!(!body.error.is_empty());
    }

    #[actix_rt::test]
    async fn oversized_upload_is_rejected() {
        let app = app!(1024);
        let png = rgba_png();
        let req = upload_request(&[Part {
            name: "file",
            filename: Some("photo.png"),
            data: &png,
        }]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_error(
            resp,
            StatusCode::PAYLOAD_TOO_LARGE,
            "File exceeds the 1024 byte upload limit",
        )
        .await;
    }

    async fn assert_five_sorted<B: MessageBody>(resp: ServiceResponse<B>) {
        assert_eq!(resp.status(), StatusCode::OK);
        let body: PredictionResponse = test::read_body_json(resp).await;
        assert_eq!(body.predictions.len(), 5);
        assert!(body
            .predictions
            .windows(2)
            .all(|w| w[0].probability >= w[1].probability));
    }

    #[actix_rt::test]
    async fn jpeg_upload_is_classified() {
        let app = app!();
        let rgb = DynamicImage::ImageRgba8(noisy_rgba(320, 240)).to_rgb8();
        let jpeg = encode(DynamicImage::ImageRgb8(rgb), ImageOutputFormat::Jpeg(90));
        let req = upload_request(&[Part {
            name: "file",
            filename: Some("photo.jpg"),
            data: &jpeg,
        }]);
        assert_five_sorted(test::call_service(&app, req.to_request()).await).await;
    }

    #[actix_rt::test]
    async fn grayscale_png_is_classified() {
        let app = app!();
        let gray = GrayImage::from_fn(97, 301, |x, y| Luma([((x + y) % 256) as u8]));
        let png = encode_png(DynamicImage::ImageLuma8(gray));
        let req = upload_request(&[Part {
            name: "file",
            filename: Some("scan.png"),
            data: &png,
        }]);
        assert_five_sorted(test::call_service(&app, req.to_request()).await).await;
    }

    #[actix_rt::test]
    async fn frontend_origin_is_allowed() {
        let app = app!();
        let png = rgba_png();
        let req = upload_request(&[Part {
            name: "file",
            filename: Some("photo.png"),
            data: &png,
        }])
        .insert_header((header::ORIGIN, FRONTEND));

        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            FRONTEND
        );
    }

    #[actix_rt::test]
    async fn frontend_preflight_is_allowed() {
        let app = app!();
        let req = test::TestRequest::default()
            .method(actix_web::http::Method::OPTIONS)
            .uri("/predict")
            .insert_header((header::ORIGIN, FRONTEND))
            .insert_header((header::ACCESS_CONTROL_REQUEST_METHOD, "POST"))
            .to_request();

        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            FRONTEND
        );
    }

    #[actix_rt::test]
    async fn foreign_origin_is_rejected() {
        let app = app!();
        let png = rgba_png();
        let req = upload_request(&[Part {
            name: "file",
            filename: Some("photo.png"),
            data: &png,
        }])
        .insert_header((header::ORIGIN, "http://evil.example"));

        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }
}
