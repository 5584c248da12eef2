//! Utility functions for minilock

use std::time::Duration;

/// Longest accepted resource name
pub const MAX_RESOURCE_LEN: usize = 1024;

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let split = s.len() - s.chars().last().map_or(0, |c| c.len_utf8());
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        "d" => Duration::from_secs(num * 86400),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Retry with exponential backoff
///
/// Only retryable errors (timeouts, connection failures) are retried; anything else
/// is returned immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt + 1 < max_retries => {
                tracing::debug!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Run `fut` with a deadline, mapping expiry to `Error::Timeout`
pub async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    fut: impl std::future::Future<Output = crate::Result<T>>,
) -> crate::Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(crate::Error::Timeout(format!(
            "{} exceeded {:?}",
            what, deadline
        ))),
    }
}

/// Generate a fresh identifier for one lock attempt
pub fn generate_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Validate resource name (must be non-empty, reasonable length)
pub fn validate_resource(resource: &str) -> crate::Result<()> {
    if resource.is_empty() {
        return Err(crate::Error::InvalidArgument(
            "resource cannot be empty".into(),
        ));
    }

    if resource.len() > MAX_RESOURCE_LEN {
        return Err(crate::Error::InvalidArgument(format!(
            "resource too long (max {} bytes)",
            MAX_RESOURCE_LEN
        )));
    }

    if resource.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidArgument(
            "resource contains invalid characters".into(),
        ));
    }

    Ok(())
}
