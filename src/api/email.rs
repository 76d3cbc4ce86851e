use actix_web::{get, post, web, HttpResponse, Responder, Scope};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    service::{EmailStatusView, EnqueueRequest, Service},
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailResponse {
    success: bool,
    message: String,
    email_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_id: Option<String>,
}

#[post("")]
async fn send_email(
    service: web::Data<Service>,
    request: web::Json<EnqueueRequest>,
) -> Result<impl Responder, Error> {
    let receipt = service.enqueue(request.into_inner()).await?;

    let message = if receipt.delivered {
        "email delivered"
    } else {
        "email queued for delivery"
    };

    Ok(web::Json(SendEmailResponse {
        success: true,
        message: message.to_owned(),
        email_id: receipt.id,
        provider_id: receipt.provider_id,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Action {
    Status,
    Process,
}

#[derive(Debug, Deserialize)]
struct ActionQuery {
    action: Action,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentProbe {
    has_db_path: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusProbeResponse {
    success: bool,
    has_transport_configured: bool,
    transport_config_length: usize,
    environment: EnvironmentProbe,
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    success: bool,
    message: String,
    total: u64,
    sent: u64,
    failed: u64,
}

#[get("")]
async fn action(
    service: web::Data<Service>,
    query: web::Query<ActionQuery>,
) -> Result<HttpResponse, Error> {
    match query.action {
        Action::Status => {
            let config = service.config();

            Ok(HttpResponse::Ok().json(StatusProbeResponse {
                success: true,
                has_transport_configured: service.transport_configured(),
                transport_config_length: config
                    .transport_api_key
                    .as_ref()
                    .map(|key| key.expose_secret().len())
                    .unwrap_or(0),
                environment: EnvironmentProbe {
                    has_db_path: config.db_path().is_some(),
                },
            }))
        }
        Action::Process => {
            let summary = service.drain(query.limit).await?;

            Ok(HttpResponse::Ok().json(ProcessResponse {
                success: true,
                message: format!("processed {} queued emails", summary.total),
                total: summary.total,
                sent: summary.sent,
                failed: summary.failed,
            }))
        }
    }
}

#[derive(Debug, Serialize)]
struct EmailStatusResponse {
    success: bool,
    #[serde(flatten)]
    email: EmailStatusView,
}

#[get("/{id}")]
async fn email_status(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    let email = service.status(path.into_inner()).await?;

    Ok(web::Json(EmailStatusResponse {
        success: true,
        email,
    }))
}

pub fn service() -> Scope {
    web::scope("/email")
        .service(send_email)
        .service(action)
        .service(email_status)
}
