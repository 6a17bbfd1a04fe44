//! EAN-18 grid identifiers: operator prefix, random body, GS1 check digit

use crate::error::{DomainError, Result};
use serde::Deserialize;

/// `ean` section of the YAML configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EanSettings {
    /// Grid operator prefix, digits only
    pub prefix: String,
    /// Total length including the check digit
    pub digits: usize,
    /// Generation attempts before a collision is reported
    pub max_attempts: u32,
}

impl Default for EanSettings {
    fn default() -> Self {
        Self {
            prefix: "871687".into(),
            digits: 18,
            max_attempts: 10,
        }
    }
}

/// GS1 mod-10 check digit over `body` (all digits, check digit excluded)
pub fn check_digit(body: &str) -> Option<u8> {
    let mut sum = 0u32;
    // Weights alternate 3,1,3,... starting from the rightmost body digit
    for (i, c) in body.chars().rev().enumerate() {
        let d = c.to_digit(10)?;
        sum += if i % 2 == 0 { d * 3 } else { d };
    }
    Some(((10 - sum % 10) % 10) as u8)
}

#[derive(Debug, Clone)]
pub struct EanGenerator {
    prefix: String,
    digits: usize,
    max_attempts: u32,
}

impl EanGenerator {
    pub fn new(settings: &EanSettings) -> Result<Self> {
        if settings.prefix.is_empty() || !settings.prefix.chars().all(|c| c.is_ascii_digit()) {
            return Err(DomainError::InvalidRequest(format!(
                "EAN prefix must be digits, got {:?}",
                settings.prefix
            )));
        }
        // prefix + at least one random digit + check digit
        if settings.prefix.len() + 2 > settings.digits {
            return Err(DomainError::InvalidRequest(format!(
                "EAN prefix {} leaves no room in {} digits",
                settings.prefix, settings.digits
            )));
        }
        Ok(Self {
            prefix: settings.prefix.clone(),
            digits: settings.digits,
            max_attempts: settings.max_attempts.max(1),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn generate(&self) -> String {
        let mut ean = String::with_capacity(self.digits);
        ean.push_str(&self.prefix);
        while ean.len() < self.digits - 1 {
            let d = rand::random::<u32>() % 10;
            ean.push(char::from(b'0' + d as u8));
        }
        let check = check_digit(&ean).unwrap_or(0);
        ean.push(char::from(b'0' + check));
        ean
    }

    /// Right length, right prefix, valid check digit
    pub fn is_valid(&self, ean: &str) -> bool {
        if ean.len() != self.digits || !ean.starts_with(&self.prefix) {
            return false;
        }
        let (body, check) = ean.split_at(ean.len() - 1);
        match (check_digit(body), check.parse::<u8>()) {
            (Some(expected), Ok(actual)) => expected == actual,
            _ => false,
        }
    }
}
