//! Studio admin routes
//!
//! Mounted under `/api/v1/admin` behind `require_auth`; every handler checks
//! the admin role itself with [`AuthUser::require_admin`](crate::auth::AuthUser::require_admin).
//!
//! - `stats`: dashboard counters
//! - `appointments`: appointment status changes and blocked time
//! - `catalog`: coupons and plans
//! - `users`: account search and roles
//! - `payments`: payment list, refunds and manual payments
//! - `support`: FAQ, user questions and chat sessions
//! - `settings`: studio settings
//! - `shared`: helpers used across the above

pub mod appointments;
pub mod catalog;
pub mod payments;
pub mod settings;
pub mod shared;
pub mod stats;
pub mod support;
pub mod users;

use axum::{
    routing::{delete, get, patch, post},
    Router,
};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats::get_stats))
        .route("/appointments", get(appointments::list_appointments))
        .route("/appointments/:id", patch(appointments::update_appointment))
        .route(
            "/blocked-slots",
            get(appointments::list_blocked_slots).post(appointments::create_blocked_slot),
        )
        .route("/blocked-slots/:id", delete(appointments::delete_blocked_slot))
        .route(
            "/coupons",
            get(catalog::list_coupons).post(catalog::create_coupon),
        )
        .route(
            "/coupons/:id",
            patch(catalog::update_coupon).delete(catalog::deactivate_coupon),
        )
        .route("/plans", get(catalog::list_plans).post(catalog::create_plan))
        .route("/plans/:id", patch(catalog::update_plan))
        .route("/users", get(users::list_users))
        .route("/users/:id/role", patch(users::update_role))
        .route("/payments", get(payments::list_payments))
        .route("/payments/manual", post(payments::record_manual_payment))
        .route("/payments/:id/refund", post(payments::refund_payment))
        .route("/faqs", get(support::list_faqs).post(support::create_faq))
        .route(
            "/faqs/:id",
            patch(support::update_faq).delete(support::delete_faq),
        )
        .route("/questions", get(support::list_questions))
        .route("/questions/:id/answer", post(support::answer_question))
        .route("/chats", get(support::list_chats))
        .route("/chats/:id", get(support::get_chat))
        .route("/chats/:id/reply", post(support::reply_to_chat))
        .route("/chats/:id/close", post(support::close_chat))
        .route(
            "/settings",
            get(settings::get_settings).put(settings::update_settings),
        )
}
