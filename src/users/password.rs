//! Password hashing and the change-password attempt throttle

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::error::UserError;

/// Argon2id PHC string with a fresh salt per user
pub fn hash_password(password: &str) -> Result<String, UserError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| UserError::Internal(format!("Hashing failed: {}", e)))
}

/// `false` for a wrong password and for an unparseable stored hash
pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Sliding-window attempt counter per account
pub struct PasswordThrottle {
    max_attempts: usize,
    window: Duration,
    attempts: DashMap<String, VecDeque<Instant>>,
}

impl PasswordThrottle {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: DashMap::new(),
        }
    }

    /// Record an attempt; `false` when the account is over its budget.
    pub fn try_acquire(&self, account_id: &str) -> bool {
        self.try_acquire_at(account_id, Instant::now())
    }

    fn try_acquire_at(&self, account_id: &str, now: Instant) -> bool {
        let mut entry = self.attempts.entry(account_id.to_string()).or_default();
        while let Some(first) = entry.front() {
            if now.duration_since(*first) >= self.window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() >= self.max_attempts {
            return false;
        }
        entry.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "not-a-hash"));
        // salted
        assert_ne!(hash, hash_password("hunter2").unwrap());
    }

    #[test]
    fn test_throttle_window() {
        let throttle = PasswordThrottle::new(5, Duration::from_secs(900));
        let t0 = Instant::now();
        for _ in 0..5 {
            assert!(throttle.try_acquire_at("a", t0));
        }
        assert!(!throttle.try_acquire_at("a", t0 + Duration::from_secs(10)));
        // other accounts are independent
        assert!(throttle.try_acquire_at("b", t0));
        // window slides
        assert!(throttle.try_acquire_at("a", t0 + Duration::from_secs(900)));
    }
}
