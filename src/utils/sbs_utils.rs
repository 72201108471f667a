#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, log_enabled, Level};
use poem::Request;
use rand::Rng;
use std::future::Future;

use anyhow::{anyhow, Result};

use crate::utils::errors::EngineError;

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Alphabet for the human-readable booking id suffix.
const BOOKING_SUFFIX_CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const BOOKING_SUFFIX_LEN: usize = 6;
pub const BOOKING_ID_PREFIX: &str = "BK-";

// ***************************************************************************
// GENERAL PUBLIC FUNCTIONS
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_absolute_path:
// ---------------------------------------------------------------------------
/** Replace tilde (~) and environment variable values in a path name and
 * then construct the absolute path name.  Unlike canonicalize, absolutize
 * does not require that the file exist.  On any expansion error the
 * original path is returned unchanged.
 */
pub fn get_absolute_path(path: &str) -> String {
    use path_absolutize::Absolutize;
    use std::ops::Deref;
    use std::path::Path;

    // Replace ~ and environment variable values if possible.
    let s = match shellexpand::full(path) {
        Ok(x) => x,
        Err(_) => return path.to_owned(),
    };

    // Convert to absolute path if necessary.
    let p = Path::new(s.deref());
    let p1 = match p.absolutize() {
        Ok(x) => x,
        Err(_) => return path.to_owned(),
    };
    match p1.to_str() {
        Some(x) => x.to_owned(),
        None => path.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// timestamp_utc:
// ---------------------------------------------------------------------------
/** The current UTC time.  Use one timestamp per request so that all related
 * time calculations agree.
 */
pub fn timestamp_utc() -> DateTime<Utc> {
    Utc::now()
}

// ---------------------------------------------------------------------------
// timestamp_utc_to_str:
// ---------------------------------------------------------------------------
/** Render a UTC timestamp as an RFC3339 string with millisecond precision
 * and a trailing Z.  The format is fixed-width, so string comparison and
 * SQL range queries order the same way the timestamps do.
 */
pub fn timestamp_utc_to_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// timestamp_str_to_datetime:
// ---------------------------------------------------------------------------
pub fn timestamp_str_to_datetime(ts: &str) -> Result<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(ts) {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        Err(e) => Err(anyhow!("Unable to parse timestamp '{}': {}", ts, e)),
    }
}

// ---------------------------------------------------------------------------
// calc_expires_at:
// ---------------------------------------------------------------------------
/** Calculate an expiry timestamp string a number of seconds past now. */
pub fn calc_expires_at(now: DateTime<Utc>, ttl_seconds: u64) -> String {
    timestamp_utc_to_str(now + chrono::Duration::seconds(ttl_seconds as i64))
}

// ---------------------------------------------------------------------------
// generate_booking_id:
// ---------------------------------------------------------------------------
/** Generate a human-readable booking id of the form BK-YYYYMMDD-XXXXXX,
 * where the suffix is six random uppercase base-36 characters.  Daily
 * collisions are possible at high volume; callers must regenerate on a
 * unique-index violation.
 */
pub fn generate_booking_id(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..BOOKING_SUFFIX_LEN)
        .map(|_| BOOKING_SUFFIX_CHARSET[rng.gen_range(0..BOOKING_SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{}{}-{}", BOOKING_ID_PREFIX, now.format("%Y%m%d"), suffix)
}

// ---------------------------------------------------------------------------
// with_deadline:
// ---------------------------------------------------------------------------
/** Run an adapter call under a bounded deadline.  Expiry surfaces as
 * StoreUnavailable so callers treat it like any other adapter outage.
 */
pub async fn with_deadline<T, F>(timeout_ms: u64, task: &str, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::StoreUnavailable(format!(
            "{} timed out after {} ms", task, timeout_ms
        ))),
    }
}

// ***************************************************************************
//                            Request Logging
// ***************************************************************************
/** Types that can render their content for conditional debug logging. */
pub trait RequestDebug {
    type Req;
    fn get_request_info(&self) -> String;
}

// ---------------------------------------------------------------------------
// debug_request:
// ---------------------------------------------------------------------------
/** Log the request method, uri and body fields when debug logging is on. */
pub fn debug_request<T: RequestDebug>(http_req: &Request, req: &T) {
    if log_enabled!(Level::Debug) {
        debug!("{} {}\n{}", http_req.method(), http_req.uri(), req.get_request_info());
    }
}
