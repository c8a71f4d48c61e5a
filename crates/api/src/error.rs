//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use studio_billing::BillingError;
use studio_shared::{BookingRuleError, CouponRejection, PricingError, StudioError};

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Email already registered")]
    EmailAlreadyExists,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("{0}")]
    BookingRule(#[from] BookingRuleError),
    #[error("{0}")]
    Coupon(#[from] CouponRejection),

    // Resource errors
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("This time slot is no longer available")]
    SlotUnavailable,

    // Rate limiting
    #[error("Too many requests, try again in {0} seconds")]
    RateLimited(u64),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Payment provider error")]
    PaymentProvider(String),
    #[error("Internal server error")]
    Internal(String),
    #[error("{0}")]
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn not_found(what: &str) -> Self {
        ApiError::NotFound(format!("{} not found", what))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS", self.to_string()),
            ApiError::EmailAlreadyExists => (StatusCode::CONFLICT, "EMAIL_EXISTS", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BookingRule(_) => (StatusCode::BAD_REQUEST, "BOOKING_RULE", self.to_string()),
            ApiError::Coupon(rejection) => (StatusCode::BAD_REQUEST, "COUPON_REJECTED", rejection.message().to_string()),

            // Resources
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::SlotUnavailable => (StatusCode::CONFLICT, "SLOT_UNAVAILABLE", self.to_string()),

            // Rate limiting
            ApiError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", self.to_string()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::PaymentProvider(_) => (StatusCode::BAD_GATEWAY, "PAYMENT_PROVIDER_ERROR", self.to_string()),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "Internal server error".to_string()),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg.clone()),
        };

        if status.is_server_error() {
            tracing::error!(error = ?self, code = code, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // PostgreSQL unique violation
                Some("23505") => ApiError::Conflict("Resource already exists".to_string()),
                // Exclusion constraint on active appointment ranges
                Some("23P01") => ApiError::SlotUnavailable,
                _ => ApiError::Database(db_err.to_string()),
            },
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::AlreadyExists(msg) => ApiError::Conflict(msg),
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::Coupon(rejection) => ApiError::Coupon(rejection),
            BillingError::SlotUnavailable => ApiError::SlotUnavailable,
            BillingError::Unauthorized(_) => ApiError::Forbidden,
            BillingError::WebhookSignatureInvalid => {
                ApiError::Validation("Invalid webhook signature".to_string())
            }
            BillingError::WebhookEventNotSupported(kind) => {
                ApiError::Validation(format!("Unsupported event: {}", kind))
            }
            BillingError::Config(msg) => ApiError::ServiceUnavailable(msg),
            BillingError::StripeApi(msg) => ApiError::PaymentProvider(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<PricingError> for ApiError {
    fn from(err: PricingError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl From<StudioError> for ApiError {
    fn from(err: StudioError) -> Self {
        match err {
            StudioError::Auth(_) => ApiError::Unauthorized,
            StudioError::NotFound(msg) => ApiError::NotFound(msg),
            StudioError::Validation(msg) => ApiError::Validation(msg),
            StudioError::Booking(rule) => ApiError::BookingRule(rule),
            StudioError::Coupon(rejection) => ApiError::Coupon(rejection),
            StudioError::Pricing(e) => e.into(),
            StudioError::RateLimited => ApiError::RateLimited(60),
            StudioError::Database(e) => e.into(),
            StudioError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_billing_errors_map_to_http_status() {
        assert_eq!(
            status_of(BillingError::NotFound("Plan not found".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(BillingError::SlotUnavailable.into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(BillingError::Coupon(CouponRejection::Expired).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::Config("Stripe off".into()).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(BillingError::StripeApi("boom".into()).into()),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_row_not_found_is_404() {
        assert_eq!(
            status_of(sqlx::Error::RowNotFound.into()),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ApiError::Coupon(CouponRejection::AlreadyUsed).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "COUPON_REJECTED");
        assert_eq!(
            body["error"]["message"],
            "This coupon has already been used."
        );
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let msg = ApiError::Internal("secret detail".into()).to_string();
        assert_eq!(msg, "Internal server error");
    }
}
