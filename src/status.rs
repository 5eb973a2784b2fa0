//! Two-level categorization of capture outcomes.
//!
//! The fine result is the literal `"NNN Reason-Phrase"` string; the coarse
//! result buckets statuses into a small fixed vocabulary that analysis
//! queries group by. Both levels are interned in the database.

/// Coarse bucket for an HTTP status code.
///
/// 3xx codes only reach this table when redirect-following gave up, hence
/// "redirection loop".
pub fn coarse_result(status: u16) -> &'static str {
    match status {
        200 => "ok",
        301 | 302 | 303 | 307 | 308 => "redirection loop",
        400 => "bad request (400)",
        401 => "authentication required (401)",
        403 => "forbidden (403)",
        404 | 410 => "page not found (404/410)",
        451 => "unavailable for legal reasons (451)",
        500 => "server error (500)",
        503 => "service unavailable (503)",
        // 502/504 are not our proxy, but a CDN's.
        502 | 504 | 520..=529 => "proxy error (502/504/52x)",
        _ => "other HTTP response",
    }
}

/// Coarse code recorded when the fetch layer itself failed.
pub const CRAWLER_FAILURE: &str = "crawler failure";

/// Coarse code recorded when the query deadline expired.
pub const TIMEOUT: &str = "timeout";

/// Fine result string for a status line.
pub fn fine_result(status: u16, reason: &str) -> String {
    format!("{} {}", status, reason)
}

/// Canonical reason phrase for common statuses, for transports that do not
/// surface one.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        429 => "Too Many Requests",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coarse_buckets() {
        assert_eq!(coarse_result(200), "ok");
        assert_eq!(coarse_result(302), "redirection loop");
        assert_eq!(coarse_result(404), "page not found (404/410)");
        assert_eq!(coarse_result(410), "page not found (404/410)");
        assert_eq!(coarse_result(451), "unavailable for legal reasons (451)");
        assert_eq!(coarse_result(503), "service unavailable (503)");
        assert_eq!(coarse_result(502), "proxy error (502/504/52x)");
        assert_eq!(coarse_result(524), "proxy error (502/504/52x)");
        assert_eq!(coarse_result(418), "other HTTP response");
        assert_eq!(coarse_result(530), "other HTTP response");
    }

    #[test]
    fn fine_is_literal() {
        assert_eq!(fine_result(503, "Service Unavailable"), "503 Service Unavailable");
    }
}
