use crate::config::SupportedFormat;
use crate::SipError;
use mime::Mime;

/// Media types listed in an `Accept` header value.
///
/// Tokens are comma separated with optional whitespace. Parameters such as
/// `q=0.8` are parsed but play no part in the choice; unparseable tokens are
/// skipped.
pub fn accepted_types(accept: &str) -> Vec<Mime> {
    accept
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse::<Mime>().ok())
        .collect()
}

/// First of `supported` (in preference order) that the client lists.
///
/// Presence is enough: there is no weighting and no wildcard expansion.
pub fn negotiate(accept: Option<&str>, supported: &[SupportedFormat]) -> Result<SupportedFormat, SipError> {
    let accepted = accepted_types(accept.ok_or(SipError::NoAcceptableFormat)?);
    supported
        .iter()
        .copied()
        .find(|format| {
            accepted
                .iter()
                .any(|m| m.essence_str().eq_ignore_ascii_case(format.mime_type()))
        })
        .ok_or(SipError::NoAcceptableFormat)
}
