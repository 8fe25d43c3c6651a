//! Payment notification signature verification.
//!
//! The gateway signs each notification as
//! `hex(SHA-512(order_id || status_code || gross_amount || server_key))`.
//!
//! Some integrations in the field have been observed to sign a different
//! rendering of `gross_amount`, so the verifier accepts an explicit,
//! configurable list of [`CanonicalForm`]s. Each extra form widens what a
//! forger can guess; trim the list to `[AsIs]` once the gateway contract is
//! confirmed.

use crate::TollgateError;
use sha2::{Digest, Sha512};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

/// Literal amount accepted by [`CanonicalForm::FixedLiteral`].
pub const FIXED_LITERAL_AMOUNT: &str = "30000";

/// Literal amount accepted by [`CanonicalForm::FixedPrecisionLiteral`].
pub const FIXED_PRECISION_LITERAL_AMOUNT: &str = "30000.00";

/// A rendering of `gross_amount` that may have been signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalForm {
    /// The amount exactly as received. This is the documented form.
    AsIs,
    /// The integer part only. Everything from the decimal point on is
    /// dropped, so a non-zero fraction is truncated: `"30000.50"` -> `"30000"`,
    /// never `"3000050"`.
    DecimalStripped,
    /// A hard-coded integer amount, ignoring the payload.
    FixedLiteral,
    /// A hard-coded two-decimal amount, ignoring the payload.
    FixedPrecisionLiteral,
}

impl CanonicalForm {
    /// Every form the legacy integration accepted, in evaluation order.
    pub const LEGACY: [CanonicalForm; 4] = [
        CanonicalForm::AsIs,
        CanonicalForm::DecimalStripped,
        CanonicalForm::FixedLiteral,
        CanonicalForm::FixedPrecisionLiteral,
    ];

    /// Render `gross_amount` in this form.
    pub fn render<'a>(&self, gross_amount: &'a str) -> std::borrow::Cow<'a, str> {
        use std::borrow::Cow;
        match self {
            Self::AsIs => Cow::Borrowed(gross_amount),
            Self::DecimalStripped => match gross_amount.split_once('.') {
                Some((whole, _)) => Cow::Borrowed(whole),
                None => Cow::Borrowed(gross_amount),
            },
            Self::FixedLiteral => Cow::Borrowed(FIXED_LITERAL_AMOUNT),
            Self::FixedPrecisionLiteral => Cow::Borrowed(FIXED_PRECISION_LITERAL_AMOUNT),
        }
    }

    /// Stable configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AsIs => "as_is",
            Self::DecimalStripped => "decimal_stripped",
            Self::FixedLiteral => "fixed_literal",
            Self::FixedPrecisionLiteral => "fixed_precision_literal",
        }
    }
}

impl fmt::Display for CanonicalForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalForm {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "as_is" => Ok(Self::AsIs),
            "decimal_stripped" => Ok(Self::DecimalStripped),
            "fixed_literal" => Ok(Self::FixedLiteral),
            "fixed_precision_literal" => Ok(Self::FixedPrecisionLiteral),
            other => Err(TollgateError::ConfigError(format!(
                "unknown signature form: {}",
                other
            ))),
        }
    }
}

/// The notification fields covered by the signature.
#[derive(Debug, Clone, Copy)]
pub struct SignedFields<'a> {
    /// Merchant order id.
    pub order_id: &'a str,
    /// Gateway status code, e.g. `"200"`.
    pub status_code: &'a str,
    /// Amount string as sent by the gateway.
    pub gross_amount: &'a str,
}

/// Compute the lowercase hex SHA-512 signature for the given fields.
pub fn compute_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a notification signature against the accepted forms.
///
/// # Returns
/// * `Ok(form)` - The first accepted form whose signature matches
/// * `Err(InvalidSignature)` - No accepted form matches
pub fn verify_signature(
    fields: SignedFields<'_>,
    signature_key: &str,
    server_key: &str,
    accepted: &[CanonicalForm],
) -> Result<CanonicalForm, TollgateError> {
    let presented = signature_key.trim().to_ascii_lowercase();
    if presented.is_empty() {
        return Err(TollgateError::InvalidSignature);
    }

    for form in accepted {
        let amount = form.render(fields.gross_amount);
        let expected =
            compute_signature(fields.order_id, fields.status_code, &amount, server_key);
        if secure_compare(&expected, &presented) {
            if *form != CanonicalForm::AsIs {
                tracing::warn!(
                    order_id = fields.order_id,
                    form = %form,
                    "notification signature matched a non-canonical amount form"
                );
            }
            return Ok(*form);
        }
    }

    Err(TollgateError::InvalidSignature)
}

fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
