//! Card number, CVV and expiry generation

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{Datelike, NaiveDate};
use rand::Rng;

use super::CardKdfParams;
use super::error::WalletError;

pub const CARD_NUMBER_LEN: usize = 16;
pub const CVV_LEN: usize = 3;

/// Luhn check over a string of ASCII digits
pub fn luhn_valid(number: &str) -> bool {
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let sum: u32 = number
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = (b - b'0') as u32;
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Check digit that makes `partial` + digit Luhn-valid
pub fn luhn_check_digit(partial: &str) -> u8 {
    let sum: u32 = partial
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = (b - b'0') as u32;
            // the check digit will sit at position 0, so these shift by one
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    ((10 - (sum % 10)) % 10) as u8
}

fn random_digits(n: usize) -> String {
    let mut rng = rand::rngs::OsRng;
    (0..n)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// `prefix` + random body + Luhn digit, 16 digits in total.
pub fn generate_card_number(prefix: &str) -> Result<String, WalletError> {
    if prefix.is_empty()
        || prefix.len() >= CARD_NUMBER_LEN
        || !prefix.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(WalletError::Internal(format!("invalid issuer prefix {:?}", prefix)));
    }
    let mut partial = String::with_capacity(CARD_NUMBER_LEN);
    partial.push_str(prefix);
    partial.push_str(&random_digits(CARD_NUMBER_LEN - 1 - prefix.len()));
    let check = luhn_check_digit(&partial);
    partial.push(char::from(b'0' + check));
    Ok(partial)
}

pub fn generate_cvv() -> String {
    random_digits(CVV_LEN)
}

fn hasher(params: &CardKdfParams) -> Result<Argon2<'static>, WalletError> {
    let p = Params::new(params.memory_kib, params.iterations, params.parallelism, None)
        .map_err(|e| WalletError::Internal(format!("card kdf params: {}", e)))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, p))
}

/// Argon2id PHC string with a fresh salt per card
pub fn hash_cvv(cvv: &str, params: &CardKdfParams) -> Result<String, WalletError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher(params)?
        .hash_password(cvv.as_bytes(), &salt)
        .map_err(|e| WalletError::Internal(format!("cvv hashing failed: {}", e)))?;
    Ok(hash.to_string())
}

pub fn verify_cvv(cvv: &str, stored: &str) -> bool {
    // parameters travel inside the PHC string
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(cvv.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Last calendar day of the month `years` after `from`.
pub fn expiry_date(from: NaiveDate, years: u32) -> NaiveDate {
    let year = from.year() + years as i32;
    let month = from.month();
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .unwrap_or(from)
}

pub fn last_four(number: &str) -> &str {
    if number.len() >= 4 && number.is_char_boundary(number.len() - 4) {
        &number[number.len() - 4..]
    } else {
        number
    }
}

pub fn mask(number: &str) -> String {
    format!("**** **** **** {}", last_four(number))
}
