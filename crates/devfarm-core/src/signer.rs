//! Time-boxed URL signing
//!
//! Produces Hawk "bewit" signatures: an HMAC-SHA256 over the request line of a
//! `GET` for the URL plus an expiry, packed with the client id into a single
//! `bewit` query parameter. Anyone holding the same credentials can verify the
//! URL without a round trip, and the signature stops verifying after the TTL.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use url::Url;

use crate::error::{FarmError, FarmResult};

type HmacSha256 = Hmac<sha2::Sha256>;

/// Query parameter carrying the signature
pub const SIGNATURE_PARAM: &str = "bewit";

/// Default signature validity (1 hour)
pub const DEFAULT_TTL_SECS: u64 = 60 * 60;

/// Sign `url` for `ttl_secs` seconds from now.
pub fn sign_url(url: &str, client_id: &str, access_token: &str, ttl_secs: u64) -> FarmResult<String> {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    sign_url_at(url, client_id, access_token, ttl_secs, now)
}

/// Sign `url` as if issued at `issued_at` (unix seconds).
///
/// Deterministic: identical inputs always produce the identical URL.
pub fn sign_url_at(
    url: &str,
    client_id: &str,
    access_token: &str,
    ttl_secs: u64,
    issued_at: u64,
) -> FarmResult<String> {
    validate_credentials(client_id, access_token)?;

    let (base, fragment) = split_fragment(url);
    let target = RequestTarget::parse(base)?;
    let expiry = issued_at
        .checked_add(ttl_secs)
        .ok_or_else(|| FarmError::Signature(format!("ttl of {}s overflows expiry", ttl_secs)))?;
    let mac = compute_mac(access_token, &target, expiry)?;

    let bewit = URL_SAFE_NO_PAD.encode(format!("{}\\{}\\{}\\", client_id, expiry, mac));
    let separator = if base.contains('?') { '&' } else { '?' };

    let mut signed = format!("{}{}{}={}", base, separator, SIGNATURE_PARAM, bewit);
    if let Some(fragment) = fragment {
        signed.push('#');
        signed.push_str(fragment);
    }
    Ok(signed)
}

/// Check a signed URL against credentials at time `now` (unix seconds).
pub fn verify_signed_url(
    signed_url: &str,
    client_id: &str,
    access_token: &str,
    now: u64,
) -> FarmResult<()> {
    validate_credentials(client_id, access_token)?;

    let (base, _) = split_fragment(signed_url);
    let bewit = extract_signature(base)
        .ok_or_else(|| FarmError::Signature("missing signature parameter".to_string()))?;

    let decoded = URL_SAFE_NO_PAD
        .decode(bewit.as_bytes())
        .map_err(|e| FarmError::Signature(format!("malformed signature: {}", e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| FarmError::Signature("malformed signature encoding".to_string()))?;

    let parts: Vec<&str> = decoded.split('\\').collect();
    if parts.len() != 4 {
        return Err(FarmError::Signature("malformed signature fields".to_string()));
    }
    let (id, expiry, mac) = (parts[0], parts[1], parts[2]);

    if id != client_id {
        return Err(FarmError::Signature("signature issued to another client".to_string()));
    }

    let expiry: u64 = expiry
        .parse()
        .map_err(|_| FarmError::Signature("malformed expiry".to_string()))?;
    if expiry <= now {
        return Err(FarmError::Signature(format!("signature expired at {}", expiry)));
    }

    let unsigned = strip_signature(base);
    let target = RequestTarget::parse(&unsigned)?;
    let provided = STANDARD
        .decode(mac.as_bytes())
        .map_err(|_| FarmError::Signature("malformed mac".to_string()))?;

    let mut hmac = HmacSha256::new_from_slice(access_token.as_bytes())
        .map_err(|e| FarmError::Signature(e.to_string()))?;
    hmac.update(target.normalized(expiry).as_bytes());
    hmac.verify_slice(&provided)
        .map_err(|_| FarmError::Signature("signature mismatch".to_string()))
}

/// Remove the signature parameter, giving back the URL that was signed.
pub fn strip_signature(url: &str) -> String {
    let (base, fragment) = split_fragment(url);
    let mut out = match base.split_once('?') {
        Some((path, query)) => {
            let kept: Vec<&str> = query
                .split('&')
                .filter(|pair| !is_signature_pair(pair))
                .collect();
            if kept.is_empty() {
                path.to_string()
            } else {
                format!("{}?{}", path, kept.join("&"))
            }
        }
        None => base.to_string(),
    };
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

fn is_signature_pair(pair: &str) -> bool {
    pair.split_once('=').map(|(k, _)| k) == Some(SIGNATURE_PARAM)
}

fn extract_signature(url: &str) -> Option<&str> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == SIGNATURE_PARAM)
        .map(|(_, v)| v)
}

fn split_fragment(url: &str) -> (&str, Option<&str>) {
    match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    }
}

fn validate_credentials(client_id: &str, access_token: &str) -> FarmResult<()> {
    if client_id.is_empty() || access_token.is_empty() {
        return Err(FarmError::Signature("missing signing credentials".to_string()));
    }
    if client_id.contains('\\') {
        return Err(FarmError::Signature("client id may not contain '\\'".to_string()));
    }
    Ok(())
}

fn compute_mac(access_token: &str, target: &RequestTarget, expiry: u64) -> FarmResult<String> {
    let mut hmac = HmacSha256::new_from_slice(access_token.as_bytes())
        .map_err(|e| FarmError::Signature(e.to_string()))?;
    hmac.update(target.normalized(expiry).as_bytes());
    Ok(STANDARD.encode(hmac.finalize().into_bytes()))
}

/// The parts of a URL covered by the MAC
struct RequestTarget {
    resource: String,
    host: String,
    port: u16,
}

impl RequestTarget {
    fn parse(url: &str) -> FarmResult<Self> {
        let parsed =
            Url::parse(url).map_err(|e| FarmError::Signature(format!("invalid url {}: {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| FarmError::Signature(format!("url has no host: {}", url)))?
            .to_ascii_lowercase();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| FarmError::Signature(format!("url has no port: {}", url)))?;
        let resource = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };
        Ok(Self {
            resource,
            host,
            port,
        })
    }

    fn normalized(&self, expiry: u64) -> String {
        // version, type, ts, nonce, method, resource, host, port, hash, ext
        format!(
            "hawk.1.bewit\n{}\n\nGET\n{}\n{}\n{}\n\n\n",
            expiry, self.resource, self.host, self.port
        )
    }
}
