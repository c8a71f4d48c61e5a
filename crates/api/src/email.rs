//! Transactional email for bookings and support
//!
//! Sends via the Resend API. Every send is best effort: failures are logged
//! and never fail the request that triggered them.

use studio_billing::email::{escape_html, layout, EmailConfig};

/// Booking and support notification service
#[derive(Clone)]
pub struct StudioEmailService {
    config: EmailConfig,
    admin_email: Option<String>,
    client: reqwest::Client,
}

/// What every booking email shows about the session
#[derive(Debug, Clone)]
pub struct BookingDetails<'a> {
    pub customer_name: &'a str,
    pub service_label: &'a str,
    /// Local wall-clock start, already formatted
    pub starts_at: &'a str,
    pub duration_minutes: i64,
    /// Formatted amount charged, if any
    pub total: Option<&'a str>,
}

impl StudioEmailService {
    /// Create a new email service
    pub fn new(config: EmailConfig, admin_email: Option<String>) -> Self {
        Self {
            config,
            admin_email,
            client: reqwest::Client::new(),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Send an email via Resend API; returns whether the provider accepted it
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> bool {
        if !self.config.is_enabled() {
            tracing::warn!(to = %to, subject = %subject, "Email not configured, skipping");
            return false;
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post(format!(
                "{}/emails",
                self.config.resend_api_url.trim_end_matches('/')
            ))
            .header("Authorization", format!("Bearer {}", self.config.resend_api_key))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Email sent");
                true
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    status = %status,
                    body = %body,
                    "Failed to send email"
                );
                false
            }
            Err(e) => {
                tracing::error!(to = %to, error = %e, "Failed to send email");
                false
            }
        }
    }

    fn wrap(&self, title: &str, body: &str) -> String {
        layout(title, body, &self.config.support_email, &self.config.app_name)
    }

    fn button(&self, path: &str, label: &str) -> String {
        format!(
            r#"<p>
        <a href="{base}{path}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            {label}
        </a>
    </p>"#,
            base = self.config.dashboard_url.trim_end_matches('/'),
            path = path,
            label = label,
        )
    }

    fn booking_table(details: &BookingDetails<'_>) -> String {
        let total = details
            .total
            .map(|t| format!("<br><strong>Total:</strong> {}", t))
            .unwrap_or_default();
        format!(
            r#"<div style="background-color: #f5f5ff; border-left: 4px solid #6366f1; padding: 16px; margin: 20px 0;">
        <strong>Service:</strong> {service}<br>
        <strong>When:</strong> {starts}<br>
        <strong>Duration:</strong> {minutes} min{total}
    </div>"#,
            service = details.service_label,
            starts = details.starts_at,
            minutes = details.duration_minutes,
            total = total,
        )
    }

    /// Booking confirmed without payment (free or admin-confirmed)
    pub async fn send_booking_confirmed(&self, to: &str, details: &BookingDetails<'_>) -> bool {
        let body = format!(
            "<p>Hi {name},</p>\n    <p>Your booking is confirmed. See you at the studio!</p>\n    {table}\n    {button}",
            name = escape_html(details.customer_name),
            table = Self::booking_table(details),
            button = self.button("/appointments", "View my bookings"),
        );

        self.send_email(
            to,
            &format!("Booking confirmed - {}", self.config.app_name),
            &self.wrap("Booking confirmed", &body),
        )
        .await
    }

    /// Booking cancelled by the customer, an admin, or an expired hold
    pub async fn send_booking_cancelled(
        &self,
        to: &str,
        details: &BookingDetails<'_>,
        reason: Option<&str>,
    ) -> bool {
        let reason = reason
            .map(|r| format!("<p><strong>Reason:</strong> {}</p>", escape_html(r)))
            .unwrap_or_default();
        let body = format!(
            "<p>Hi {name},</p>\n    <p>The booking below was cancelled.</p>\n    {table}\n    {reason}\n    {button}",
            name = escape_html(details.customer_name),
            table = Self::booking_table(details),
            reason = reason,
            button = self.button("/booking", "Book another time"),
        );

        self.send_email(
            to,
            &format!("Booking cancelled - {}", self.config.app_name),
            &self.wrap("Booking cancelled", &body),
        )
        .await
    }

    /// Reminder sent the day before a confirmed session
    pub async fn send_appointment_reminder(&self, to: &str, details: &BookingDetails<'_>) -> bool {
        let body = format!(
            "<p>Hi {name},</p>\n    <p>This is a reminder of your upcoming session.</p>\n    {table}\n    <p>Please arrive a few minutes early so we can set up.</p>",
            name = escape_html(details.customer_name),
            table = Self::booking_table(details),
        );

        self.send_email(
            to,
            &format!("Reminder: your session on {}", details.starts_at),
            &self.wrap("See you soon", &body),
        )
        .await
    }

    /// Answer to a contact form question
    pub async fn send_question_answered(
        &self,
        to: &str,
        name: &str,
        question: &str,
        answer: &str,
    ) -> bool {
        let body = format!(
            r#"<p>Hi {name},</p>
    <p>You asked:</p>
    <blockquote style="color: #666; border-left: 3px solid #ddd; margin: 0; padding-left: 12px;">{question}</blockquote>
    <p>Our answer:</p>
    <p>{answer}</p>"#,
            name = escape_html(name),
            question = escape_html(question),
            answer = escape_html(answer).replace('\n', "<br>"),
        );

        self.send_email(
            to,
            &format!("Your question to {}", self.config.app_name),
            &self.wrap("We answered your question", &body),
        )
        .await
    }

    /// Notify the studio that a visitor asked something
    pub async fn send_new_question_to_admin(
        &self,
        from_name: &str,
        from_email: &str,
        question: &str,
    ) -> bool {
        let Some(admin) = self.admin_email.as_deref() else {
            tracing::debug!("No admin notification email configured");
            return false;
        };

        let body = format!(
            "<p><strong>{name}</strong> ({email}) asked:</p>\n    <p>{question}</p>\n    {button}",
            name = escape_html(from_name),
            email = escape_html(from_email),
            question = escape_html(question).replace('\n', "<br>"),
            button = self.button("/admin/questions", "Answer in the dashboard"),
        );

        self.send_email(
            admin,
            &format!("New question from {}", from_name),
            &self.wrap("New question", &body),
        )
        .await
    }

    /// Security notice after a password change
    pub async fn send_password_changed(&self, to: &str, name: &str) -> bool {
        let body = format!(
            "<p>Hi {name},</p>\n    <p>The password of your account was just changed and your other sessions were signed out.</p>\n    <p>If this wasn't you, contact us right away.</p>",
            name = escape_html(name),
        );

        self.send_email(
            to,
            &format!("Your {} password was changed", self.config.app_name),
            &self.wrap("Password changed", &body),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str, key: &str) -> EmailConfig {
        EmailConfig {
            resend_api_key: key.to_string(),
            resend_api_url: url.to_string(),
            email_from: "Studio <noreply@studio.test>".to_string(),
            app_name: "Studio".to_string(),
            support_email: "help@studio.test".to_string(),
            dashboard_url: "https://studio.test".to_string(),
        }
    }

    fn details() -> BookingDetails<'static> {
        BookingDetails {
            customer_name: "Ana <script>",
            service_label: "Recording session",
            starts_at: "02/06/2025 14:00",
            duration_minutes: 120,
            total: Some("R$ 300.00"),
        }
    }

    #[tokio::test]
    async fn test_booking_confirmed_is_sent_and_escaped() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::Regex("02/06/2025 14:00".to_string()),
                mockito::Matcher::Regex("Ana &lt;script&gt;".to_string()),
            ]))
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .create_async()
            .await;

        let service = StudioEmailService::new(config(&server.url(), "re_test"), None);
        assert!(service.send_booking_confirmed("ana@test.local", &details()).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_admin_notification_needs_address() {
        let server = mockito::Server::new_async().await;
        let service = StudioEmailService::new(config(&server.url(), "re_test"), None);
        assert!(
            !service
                .send_new_question_to_admin("Ana", "ana@test.local", "Do you rent mics?")
                .await
        );
    }

    #[tokio::test]
    async fn test_admin_notification_goes_to_admin() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_body(mockito::Matcher::Regex("owner@studio.test".to_string()))
            .with_status(200)
            .create_async()
            .await;

        let service = StudioEmailService::new(
            config(&server.url(), "re_test"),
            Some("owner@studio.test".to_string()),
        );
        assert!(
            service
                .send_new_question_to_admin("Ana", "ana@test.local", "Do you rent mics?")
                .await
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/emails")
            .with_status(422)
            .with_body(r#"{"message":"invalid"}"#)
            .create_async()
            .await;

        let service = StudioEmailService::new(config(&server.url(), "re_test"), None);
        assert!(
            !service
                .send_booking_cancelled("ana@test.local", &details(), Some("Hold expired"))
                .await
        );
    }

    #[tokio::test]
    async fn test_disabled_without_key() {
        let service = StudioEmailService::new(config("http://127.0.0.1:9", ""), None);
        assert!(!service.is_enabled());
        assert!(!service.send_password_changed("a@b.test", "Ana").await);
    }
}
