//! Identify requests and input normalization.
//!
//! Callers hand the engine an optional email and an optional phone number.
//! Phones may arrive as strings or numbers; both are normalized to a string
//! before any comparison. Empty values count as absent, and at least one
//! identifier must survive normalization.

use serde_json::Value;

use crate::error::ValidationError;

/// A phone number as supplied by a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum PhoneNumberInput {
    /// Textual phone number.
    Text(String),
    /// Numeric phone number (JSON number).
    Number(serde_json::Number),
}

impl PhoneNumberInput {
    /// The normalized string form, or `None` if the value is empty or zero.
    #[must_use]
    pub fn normalize(&self) -> Option<String> {
        match self {
            Self::Text(s) if s.is_empty() => None,
            Self::Text(s) => Some(s.clone()),
            Self::Number(n) => render_number(n),
        }
    }
}

impl From<&str> for PhoneNumberInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PhoneNumberInput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<u64> for PhoneNumberInput {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<i64> for PhoneNumberInput {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

// Numbers render the way a JavaScript `String(n)` would: integral values
// without a fraction, plain decimals below 1e21, exponent form otherwise.
fn render_number(n: &serde_json::Number) -> Option<String> {
    let f = n.as_f64()?;
    if f == 0.0 || !f.is_finite() {
        return None;
    }
    Some(js_number_string(f))
}

fn js_number_string(f: f64) -> String {
    // `{:e}` yields the shortest round-trip digits, e.g. "1.2345e-7".
    let scientific = format!("{:e}", f.abs());
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return f.to_string();
    };
    let Ok(exponent) = exponent.parse::<i64>() else {
        return f.to_string();
    };
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let k = i64::try_from(digits.len()).unwrap_or(i64::MAX);
    // Decimal point position relative to the start of `digits`.
    let n = exponent + 1;

    let body = if k <= n && n <= 21 {
        format!("{digits}{}", zeros(n - k))
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(usize::try_from(n).unwrap_or(0));
        format!("{int}.{frac}")
    } else if -6 < n && n <= 0 {
        format!("0.{}{digits}", zeros(-n))
    } else {
        let (lead, rest) = digits.split_at(1);
        let sign = if n > 0 { '+' } else { '-' };
        let exp = (n - 1).abs();
        if rest.is_empty() {
            format!("{lead}e{sign}{exp}")
        } else {
            format!("{lead}.{rest}e{sign}{exp}")
        }
    };

    if f.is_sign_negative() {
        format!("-{body}")
    } else {
        body
    }
}

fn zeros(count: i64) -> String {
    "0".repeat(usize::try_from(count).unwrap_or(0))
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f == 0.0),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// A validated identify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyRequest {
    email: Option<String>,
    phone_number: Option<String>,
}

impl IdentifyRequest {
    /// Builds a request from already-normalized identifiers.
    ///
    /// # Errors
    /// Returns `MissingIdentifier` when both identifiers are absent or empty.
    pub fn new(
        email: Option<String>,
        phone_number: Option<String>,
    ) -> Result<Self, ValidationError> {
        let email = email.filter(|e| !e.is_empty());
        let phone_number = phone_number.filter(|p| !p.is_empty());
        if email.is_none() && phone_number.is_none() {
            return Err(ValidationError::MissingIdentifier);
        }
        Ok(Self {
            email,
            phone_number,
        })
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder() -> IdentifyRequestBuilder {
        IdentifyRequestBuilder::default()
    }

    /// Coerces loosely-typed JSON fields into a request.
    ///
    /// Falsy values (`null`, `""`, `0`, `false`) mean absent. A truthy email
    /// must be a string; a truthy phone number must be a string or a number.
    ///
    /// # Errors
    /// Returns `InvalidFieldType` for wrongly-typed fields and
    /// `MissingIdentifier` when nothing usable remains.
    pub fn from_json(
        email: Option<&Value>,
        phone_number: Option<&Value>,
    ) -> Result<Self, ValidationError> {
        let email = match email.filter(|v| !is_falsy(v)) {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(ValidationError::InvalidFieldType {
                    field: "email".to_string(),
                    expected: "a string".to_string(),
                })
            }
        };

        let phone_number = match phone_number.filter(|v| !is_falsy(v)) {
            None => None,
            Some(Value::String(s)) => PhoneNumberInput::Text(s.clone()).normalize(),
            Some(Value::Number(n)) => PhoneNumberInput::Number(n.clone()).normalize(),
            Some(_) => {
                return Err(ValidationError::InvalidFieldType {
                    field: "phoneNumber".to_string(),
                    expected: "a string or number".to_string(),
                })
            }
        };

        Self::new(email, phone_number)
    }

    /// The email identifier.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// The normalized phone identifier.
    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    /// Returns true when both identifiers are present.
    #[must_use]
    pub const fn has_both(&self) -> bool {
        self.email.is_some() && self.phone_number.is_some()
    }
}

/// Builder for [`IdentifyRequest`].
#[derive(Debug, Default)]
pub struct IdentifyRequestBuilder {
    email: Option<String>,
    phone_number: Option<PhoneNumberInput>,
}

impl IdentifyRequestBuilder {
    /// Sets the email.
    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the phone number (string or integer).
    #[must_use]
    pub fn phone_number(mut self, phone_number: impl Into<PhoneNumberInput>) -> Self {
        self.phone_number = Some(phone_number.into());
        self
    }

    /// Validates and builds the request.
    ///
    /// # Errors
    /// Returns `MissingIdentifier` when neither identifier is usable.
    pub fn build(self) -> Result<IdentifyRequest, ValidationError> {
        let phone_number = self.phone_number.as_ref().and_then(PhoneNumberInput::normalize);
        IdentifyRequest::new(self.email, phone_number)
    }
}
