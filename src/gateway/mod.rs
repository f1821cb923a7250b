use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;

/// Phone verification delivery, behind a trait so a hosted SMS provider can
/// replace the console implementation without touching the handlers.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send_code(&self, phone: &str) -> Result<(), AppError>;

    /// Consumes the pending code on a match; a second check with the same
    /// code fails.
    async fn check_code(&self, phone: &str, code: &str) -> Result<bool, AppError>;
}

/// Best-effort notification delivery. A failed push never fails the
/// operation that triggered it.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn notify(&self, user_id: Uuid, title: &str, body: &str);
}

/// Logs codes instead of sending them. Development and test stand-in.
pub struct ConsoleSmsGateway {
    pending: DashMap<String, String>,
}

impl ConsoleSmsGateway {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }
}

impl Default for ConsoleSmsGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmsGateway for ConsoleSmsGateway {
    async fn send_code(&self, phone: &str) -> Result<(), AppError> {
        let code = generate_code();
        info!(phone = %phone, code = %code, "verification code issued");
        self.pending.insert(phone.to_string(), code);
        Ok(())
    }

    async fn check_code(&self, phone: &str, code: &str) -> Result<bool, AppError> {
        let matched = self
            .pending
            .get(phone)
            .map(|pending| pending.value() == code)
            .unwrap_or(false);

        if matched {
            self.pending.remove(phone);
        }
        Ok(matched)
    }
}

pub struct ConsolePushGateway;

#[async_trait]
impl PushGateway for ConsolePushGateway {
    async fn notify(&self, user_id: Uuid, title: &str, body: &str) {
        info!(user_id = %user_id, title = %title, body = %body, "push notification");
    }
}

fn generate_code() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    let n = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) % 1_000_000;
    format!("{n:06}")
}

#[cfg(test)]
mod tests {
    use super::{ConsoleSmsGateway, SmsGateway, generate_code};

    #[tokio::test]
    async fn code_is_checked_and_consumed() {
        let gateway = ConsoleSmsGateway::new();
        gateway.send_code("+4915112345678").await.unwrap();

        let code = gateway
            .pending
            .get("+4915112345678")
            .map(|entry| entry.value().clone())
            .unwrap();

        assert!(!gateway.check_code("+4915112345678", "not-it").await.unwrap());
        assert!(gateway.check_code("+4915112345678", &code).await.unwrap());
        assert!(!gateway.check_code("+4915112345678", &code).await.unwrap());
    }

    #[tokio::test]
    async fn check_without_pending_code_fails() {
        let gateway = ConsoleSmsGateway::new();
        assert!(!gateway.check_code("+4915100000000", "000000").await.unwrap());
    }

    #[test]
    fn generated_codes_are_six_digits() {
        for _ in 0..32 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
