use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::config::AppConfig;

type HmacSha256 = Hmac<Sha256>;

/// Verify a gateway callback signature.
///
/// Parses the signature header (format: `t=<timestamp>,v1=<signature>`),
/// constructs the signed payload `<timestamp>.<body>`, computes HMAC-SHA256
/// with the shared secret, and uses constant-time comparison. Signatures
/// older than 5 minutes are rejected to prevent replay.
pub fn verify_signature(payload: &str, signature_header: &str, secret: &str) -> bool {
    const TOLERANCE_SECS: i64 = 300; // 5 minutes

    let mut timestamp: Option<&str> = None;
    let mut signature: Option<&str> = None;

    for part in signature_header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        } else if let Some(v1) = part.strip_prefix("v1=") {
            signature = Some(v1);
        }
    }

    let (Some(ts_str), Some(expected_hex)) = (timestamp, signature) else {
        return false;
    };

    let Ok(ts) = ts_str.parse::<i64>() else {
        return false;
    };

    let now = chrono::Utc::now().timestamp();
    if (now - ts).abs() > TOLERANCE_SECS {
        tracing::warn!(
            "Gateway webhook signature too old: delta={}s",
            (now - ts).abs()
        );
        return false;
    }

    let signed_payload = format!("{ts_str}.{payload}");

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(signed_payload.as_bytes());

    let Ok(expected_bytes) = hex_decode(expected_hex) else {
        return false;
    };

    mac.verify_slice(&expected_bytes).is_ok()
}

/// Build the signature header for an outbound event, mirroring what
/// `verify_signature` expects on the inbound side.
pub fn signature_header(secret: &str, timestamp: i64, payload: &str) -> Option<String> {
    let signed_payload = format!("{timestamp}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(signed_payload.as_bytes());
    let digest = mac.finalize().into_bytes();
    Some(format!("t={timestamp},v1={}", hex_encode(&digest)))
}

/// Notify the payment gateway collaborator that a transaction was recorded.
/// Fire-and-forget: delivery failures are logged, never surfaced — the
/// transaction row is the artifact of record either way. Inert when no
/// webhook url is configured.
pub async fn notify_payment_recorded(
    http_client: &reqwest::Client,
    config: &AppConfig,
    event: &Value,
) {
    let Some(url) = config.gateway_webhook_url.as_deref() else {
        return;
    };

    let body = event.to_string();
    let mut request = http_client
        .post(url)
        .header("content-type", "application/json")
        .body(body.clone());

    if let Some(secret) = config.gateway_webhook_secret.as_deref() {
        if let Some(header) = signature_header(secret, chrono::Utc::now().timestamp(), &body) {
            request = request.header("x-gateway-signature", header);
        }
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            tracing::warn!(
                status = %response.status(),
                "Gateway webhook dispatch was rejected"
            );
        }
        Err(error) => {
            tracing::warn!(error = %error, "Gateway webhook dispatch failed");
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{hex_decode, hex_encode, signature_header, verify_signature};

    #[test]
    fn sign_then_verify_round_trips() {
        let payload = r#"{"transaction_ref":"NEFT12345678","status":"settled"}"#;
        let now = chrono::Utc::now().timestamp();
        let header = signature_header("topsecret", now, payload).unwrap();
        assert!(verify_signature(payload, &header, "topsecret"));
        // wrong secret fails
        assert!(!verify_signature(payload, &header, "othersecret"));
        // tampered body fails
        assert!(!verify_signature("{}", &header, "topsecret"));
    }

    #[test]
    fn stale_signatures_are_rejected() {
        let payload = "{}";
        let stale = chrono::Utc::now().timestamp() - 3600;
        let header = signature_header("topsecret", stale, payload).unwrap();
        assert!(!verify_signature(payload, &header, "topsecret"));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert!(!verify_signature("{}", "", "secret"));
        assert!(!verify_signature("{}", "t=abc,v1=00", "secret"));
        assert!(!verify_signature("{}", "v1=00", "secret"));
    }

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0x00, 0xff, 0x10, 0xab];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
        assert!(hex_decode("abc").is_err());
        assert!(hex_decode("zz").is_err());
    }
}
