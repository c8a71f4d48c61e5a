//! Email notifications for billing events
//!
//! Sends transactional emails via Resend API for payments and plans.

use crate::error::BillingResult;

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// Resend API base URL
    pub resend_api_url: String,
    /// From address for emails
    pub email_from: String,
    /// Studio name for branding
    pub app_name: String,
    /// Support email
    pub support_email: String,
    /// Public site URL
    pub dashboard_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            resend_api_url: std::env::var("RESEND_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Studio <noreply@studio.local>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Studio".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "contato@studio.local".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Escape text interpolated into email HTML
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wrap a body fragment in the shared email layout
pub fn layout(title: &str, body: &str, support_email: &str, app_name: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #333;">{title}</h2>
    {body}
    <p style="color: #666; font-size: 14px;">
        Questions? Contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
        title = title,
        body = body,
        support_email = support_email,
        app_name = app_name,
    )
}

/// Billing email notification service
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    client: reqwest::Client,
}

impl BillingEmailService {
    /// Create a new email service
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }

    /// Send an email via Resend API
    ///
    /// Returns `Ok(true)` if the email was sent, `Ok(false)` if sending
    /// failed. Delivery problems never fail webhook processing.
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to,
                subject = %subject,
                "Email not configured, skipping"
            );
            return Ok(false);
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
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
        }
    }

    fn wrap(&self, title: &str, body: &str) -> String {
        layout(
            title,
            body,
            &self.config.support_email,
            &self.config.app_name,
        )
    }

    /// Payment received for a booked session
    pub async fn send_appointment_paid(
        &self,
        to: &str,
        customer_name: &str,
        service_label: &str,
        starts_at_local: &str,
        amount: &str,
    ) -> BillingResult<bool> {
        let body = format!(
            r#"<p>Hi {name},</p>
    <p>We received your payment of <strong>{amount}</strong>. Your <strong>{service}</strong> on <strong>{starts}</strong> is confirmed.</p>
    <p>
        <a href="{link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            View my bookings
        </a>
    </p>"#,
            name = escape_html(customer_name),
            amount = amount,
            service = service_label,
            starts = starts_at_local,
            link = format!("{}/appointments", self.config.dashboard_url),
        );

        self.send_email(
            to,
            &format!("Booking confirmed - {}", self.config.app_name),
            &self.wrap("Payment received", &body),
        )
        .await
    }

    /// Plan activated or renewed, listing its coupon codes
    pub async fn send_plan_activated(
        &self,
        to: &str,
        customer_name: &str,
        plan_name: &str,
        coupon_codes: &[String],
        expires_on: &str,
    ) -> BillingResult<bool> {
        let codes = if coupon_codes.is_empty() {
            "<p>Your coupons are being prepared and will appear in your account shortly.</p>"
                .to_string()
        } else {
            let items: String = coupon_codes
                .iter()
                .map(|c| format!("<li><code>{}</code></li>", escape_html(c)))
                .collect();
            format!("<p>Your coupons:</p>\n    <ul>{}</ul>", items)
        };

        let body = format!(
            r#"<p>Hi {name},</p>
    <p>Your plan <strong>{plan}</strong> is active until <strong>{expires}</strong>.</p>
    {codes}
    <p>Apply a coupon code when booking to use your plan.</p>"#,
            name = escape_html(customer_name),
            plan = escape_html(plan_name),
            expires = expires_on,
            codes = codes,
        );

        self.send_email(
            to,
            &format!("Your {} plan is active - {}", plan_name, self.config.app_name),
            &self.wrap("Plan activated", &body),
        )
        .await
    }

    /// Send subscription cancelled confirmation
    pub async fn send_subscription_cancelled(
        &self,
        to: &str,
        customer_name: &str,
        plan_name: &str,
    ) -> BillingResult<bool> {
        let body = format!(
            r#"<p>Hi {name},</p>
    <p>Your <strong>{plan}</strong> subscription has been cancelled. Coupons you already received stay valid until they expire.</p>
    <p>
        <a href="{link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            See plans
        </a>
    </p>"#,
            name = escape_html(customer_name),
            plan = escape_html(plan_name),
            link = format!("{}/plans", self.config.dashboard_url),
        );

        self.send_email(
            to,
            &format!("Subscription Cancelled - {}", self.config.app_name),
            &self.wrap("Subscription Cancelled", &body),
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

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<b>"Tom" & 'Ana'</b>"#),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#39;Ana&#39;&lt;/b&gt;"
        );
    }

    #[tokio::test]
    async fn test_disabled_without_api_key() {
        let service = BillingEmailService::new(config("http://127.0.0.1:9", ""));
        let sent = service
            .send_subscription_cancelled("a@b.test", "Ana", "Monthly")
            .await
            .unwrap();
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_sends_plan_email() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .match_body(mockito::Matcher::Regex("PLAN-ABCD1234".to_string()))
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .create_async()
            .await;

        let service = BillingEmailService::new(config(&server.url(), "re_test"));
        let sent = service
            .send_plan_activated(
                "a@b.test",
                "Ana",
                "Pack 4h",
                &["PLAN-ABCD1234".to_string()],
                "01/07/2025",
            )
            .await
            .unwrap();

        assert!(sent);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_provider_error_is_swallowed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/emails")
            .with_status(500)
            .create_async()
            .await;

        let service = BillingEmailService::new(config(&server.url(), "re_test"));
        let sent = service
            .send_appointment_paid("a@b.test", "Ana", "Mixing session", "02/06/2025 14:00", "R$ 150.00")
            .await
            .unwrap();
        assert!(!sent);
    }
}
